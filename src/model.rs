use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::limits::MAX_BOOKING_NO_LEN;

// ── Columns ──────────────────────────────────────────────────────

/// The columns of the authoritative booking table, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    BookingNo,
    Zone,
    Bay,
    Time,
    Status,
}

impl Column {
    pub const ALL: [Column; 5] = [
        Column::BookingNo,
        Column::Zone,
        Column::Bay,
        Column::Time,
        Column::Status,
    ];

    /// Header as written to storage.
    pub fn header(self) -> &'static str {
        match self {
            Column::BookingNo => "Booking_No",
            Column::Zone => "Zone",
            Column::Bay => "Bay",
            Column::Time => "Time",
            Column::Status => "Status",
        }
    }

    /// Lowercase name used by the query surface.
    pub fn name(self) -> &'static str {
        match self {
            Column::BookingNo => "booking_no",
            Column::Zone => "zone",
            Column::Bay => "bay",
            Column::Time => "time",
            Column::Status => "status",
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Column::BookingNo | Column::Zone | Column::Time)
    }

    /// Match a raw header. Surrounding whitespace is ignored, case is folded,
    /// and spaces or hyphens count as underscores (` booking no ` is `Booking_No`).
    pub fn from_header(raw: &str) -> Option<Column> {
        let folded: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        match folded.as_str() {
            "booking_no" | "bookingno" => Some(Column::BookingNo),
            "zone" => Some(Column::Zone),
            "bay" => Some(Column::Bay),
            "time" => Some(Column::Time),
            "status" => Some(Column::Status),
            _ => None,
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

/// A cell value that does not fit its column's domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidValue {
    pub column: Column,
    pub value: String,
    pub reason: &'static str,
}

impl InvalidValue {
    pub fn new(column: Column, value: &str, reason: &'static str) -> Self {
        Self {
            column,
            value: value.to_string(),
            reason,
        }
    }
}

impl fmt::Display for InvalidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (got {:?})", self.column, self.reason, self.value)
    }
}

impl std::error::Error for InvalidValue {}

// ── Scalar types ─────────────────────────────────────────────────

/// Minutes past midnight. Bookings are scheduled by time of day only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then(|| Self(u16::from(hour) * 60 + u16::from(minute)))
    }

    pub fn hour(self) -> u8 {
        (self.0 / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.0 % 60) as u8
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl FromStr for TimeOfDay {
    type Err = InvalidValue;

    /// `HH:MM`. `H:MM` and `HH:MM:SS` are accepted too, since that is how
    /// spreadsheets tend to export times; seconds are dropped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidValue::new(Column::Time, s, "expected HH:MM");
        let mut parts = s.trim().split(':');
        let (Some(h), Some(m)) = (parts.next(), parts.next()) else {
            return Err(invalid());
        };
        let seconds = parts.next();
        if parts.next().is_some() || h.len() > 2 || m.len() != 2 || !all_digits(h) || !all_digits(m) {
            return Err(invalid());
        }
        if let Some(sec) = seconds
            && (sec.len() != 2 || sec.parse::<u8>().ok().filter(|s| *s < 60).is_none())
        {
            return Err(invalid());
        }
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Expected,
    Arrived,
    Delayed,
    Completed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Expected,
        Status::Arrived,
        Status::Delayed,
        Status::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Expected => "Expected",
            Status::Arrived => "Arrived",
            Status::Delayed => "Delayed",
            Status::Completed => "Completed",
        }
    }

    /// Completed bookings no longer occupy a bay.
    pub fn is_active(self) -> bool {
        self != Status::Completed
    }

    /// Expected → Delayed | Arrived, Delayed → Expected | Arrived,
    /// Arrived → Completed. Completed is terminal. Staying put is always allowed.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        self == next
            || matches!(
                (self, next),
                (Expected, Delayed)
                    | (Expected, Arrived)
                    | (Delayed, Expected)
                    | (Delayed, Arrived)
                    | (Arrived, Completed)
            )
    }
}

impl FromStr for Status {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Status::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| {
                InvalidValue::new(
                    Column::Status,
                    s,
                    "expected one of Expected, Arrived, Delayed, Completed",
                )
            })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Booking number. Compared and hashed ASCII-case-insensitively; the stored
/// spelling is kept for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BookingNo(String);

impl BookingNo {
    pub fn parse(raw: &str) -> Result<Self, InvalidValue> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidValue::new(Column::BookingNo, raw, "must not be empty"));
        }
        if trimmed.len() > MAX_BOOKING_NO_LEN {
            return Err(InvalidValue::new(Column::BookingNo, raw, "too long"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact, case-insensitive match against user input.
    pub fn matches(&self, raw: &str) -> bool {
        self.0.eq_ignore_ascii_case(raw.trim())
    }
}

impl PartialEq for BookingNo {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for BookingNo {}

impl Hash for BookingNo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_usize(self.0.len());
    }
}

impl fmt::Display for BookingNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BookingNo {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BookingNo {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BookingNo> for String {
    fn from(value: BookingNo) -> Self {
        value.0
    }
}

/// `"Bay {n}"` for a 1-based bay number.
pub fn bay_label(number: u32) -> String {
    format!("Bay {number}")
}

/// Parse the written form `"Bay {n}"`. Case and whitespace may vary
/// (`" BAY  3 "`), but the word and the separating space are required.
pub fn parse_bay_label(raw: &str) -> Option<u32> {
    let s = raw.trim();
    let word = s.get(..3)?;
    let rest = &s[3..];
    if !word.eq_ignore_ascii_case("bay") || !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let digits = rest.trim_start();
    if !all_digits(digits) {
        return None;
    }
    digits.parse::<u32>().ok().filter(|n| *n >= 1)
}

/// Parse `"Bay 3"`, `" bay 3 "` or a bare `"3"` into a bay number.
pub fn parse_bay_number(raw: &str) -> Option<u32> {
    let s = raw.trim();
    let digits = match s.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bay") => s[3..].trim_start(),
        _ => s,
    };
    if !all_digits(digits) {
        return None;
    }
    digits.parse::<u32>().ok().filter(|n| *n >= 1)
}

// ── Rows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_no: BookingNo,
    pub zone: String,
    /// Bay label as stored. `None` until the booking is placed.
    pub bay: Option<String>,
    pub time: TimeOfDay,
    pub status: Status,
}

impl Booking {
    pub fn new(booking_no: BookingNo, zone: impl Into<String>, time: TimeOfDay) -> Self {
        Self {
            booking_no,
            zone: zone.into(),
            bay: None,
            time,
            status: Status::Expected,
        }
    }

    pub fn with_bay(mut self, number: u32) -> Self {
        self.bay = Some(bay_label(number));
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn bay_number(&self) -> Option<u32> {
        self.bay.as_deref().and_then(parse_bay_number)
    }
}

/// A stored row that failed to type-check. Kept verbatim so edits to other
/// rows write it back untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub cells: Vec<(Column, String)>,
    pub reason: InvalidValue,
}

impl RejectedRow {
    pub fn cell(&self, column: Column) -> Option<&str> {
        self.cells
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v.as_str())
    }
}

/// Typed copy of the authoritative table, in stored row order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub bookings: Vec<Booking>,
    pub rejected: Vec<RejectedRow>,
}

impl Table {
    pub fn new(bookings: Vec<Booking>) -> Self {
        Self {
            bookings,
            rejected: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.is_active())
    }

    /// Row a booking number refers to: the active row if there is one,
    /// otherwise the last completed row with that number.
    pub fn position(&self, booking_no: &str) -> Option<usize> {
        let mut completed = None;
        for (i, b) in self.bookings.iter().enumerate() {
            if b.booking_no.matches(booking_no) {
                if b.is_active() {
                    return Some(i);
                }
                completed = Some(i);
            }
        }
        completed
    }

    pub fn get(&self, booking_no: &str) -> Option<&Booking> {
        self.position(booking_no).map(|i| &self.bookings[i])
    }

    /// Booking numbers held by more than one active row.
    pub fn duplicate_active(&self) -> Vec<&BookingNo> {
        let mut seen = HashSet::new();
        let mut dups = Vec::new();
        for b in self.active() {
            if !seen.insert(&b.booking_no) && !dups.contains(&&b.booking_no) {
                dups.push(&b.booking_no);
            }
        }
        dups
    }
}

// ── Results ──────────────────────────────────────────────────────

/// What the gate needs to direct a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingView {
    pub booking_no: String,
    pub zone: String,
    pub bay: Option<String>,
    pub time: TimeOfDay,
    pub status: Status,
}

impl From<&Booking> for BookingView {
    fn from(b: &Booking) -> Self {
        Self {
            booking_no: b.booking_no.to_string(),
            zone: b.zone.clone(),
            bay: b.bay.clone(),
            time: b.time,
            status: b.status,
        }
    }
}

/// A concrete bay slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BayRef {
    pub zone: String,
    pub number: u32,
}

impl BayRef {
    pub fn label(&self) -> String {
        bay_label(self.number)
    }
}

impl fmt::Display for BayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / Bay {}", self.zone, self.number)
    }
}

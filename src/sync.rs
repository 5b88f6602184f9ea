use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::AuthorizationChecker;
use crate::config::ZoneConfig;
use crate::limits::{MAX_BATCH_SIZE, MAX_BOOKINGS};
use crate::model::*;
use crate::observability;
use crate::store::{Fetched, ScheduleStore, StoreError, VersionToken};
use crate::yard::{FieldError, YardError};

/// One edited row as typed by the office. `None` leaves the field as it is
/// on the existing active booking; `Some("")` clears the bay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditRow {
    pub booking_no: String,
    pub zone: Option<String>,
    pub bay: Option<String>,
    pub time: Option<String>,
    pub status: Option<String>,
}

impl EditRow {
    pub fn new(booking_no: impl Into<String>) -> Self {
        Self {
            booking_no: booking_no.into(),
            ..Self::default()
        }
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn bay(mut self, bay: impl Into<String>) -> Self {
        self.bay = Some(bay.into());
        self
    }

    pub fn time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edits {
    /// The rows become the whole table.
    Replace(Vec<EditRow>),
    /// Update active bookings in place, append the rest.
    Upsert(Vec<EditRow>),
    /// Drop every row, completed or not, with these booking numbers.
    Remove(Vec<String>),
}

impl Edits {
    fn len(&self) -> usize {
        match self {
            Edits::Replace(rows) | Edits::Upsert(rows) => rows.len(),
            Edits::Remove(ids) => ids.len(),
        }
    }
}

/// Result of a successful write.
#[derive(Debug, Clone)]
pub struct Committed {
    pub table: Table,
    pub version: VersionToken,
}

/// Turns office edits into a new authoritative table and pushes it through
/// the store with the caller's version token. Nothing is retried: a conflict
/// goes back to the caller.
pub struct SyncController {
    store: Arc<ScheduleStore>,
    zones: Arc<ZoneConfig>,
}

impl SyncController {
    pub fn new(store: Arc<ScheduleStore>, zones: Arc<ZoneConfig>) -> Self {
        Self { store, zones }
    }

    /// Validate `edits` against `view` and commit the result, conditioned on
    /// the version `view` was read at.
    pub async fn apply(
        &self,
        auth: &dyn AuthorizationChecker,
        view: &Fetched,
        edits: &Edits,
    ) -> Result<Committed, YardError> {
        if !auth.is_privileged() {
            metrics::counter!(observability::UNAUTHORIZED_TOTAL).increment(1);
            warn!("rejected schedule edit without office access");
            return Err(YardError::Unauthorized);
        }
        let table = self.prepare(&view.table, edits)?;

        match self.store.commit(&table, view.version.as_ref()).await {
            Ok(version) => {
                info!(%version, bookings = table.len(), edits = edits.len(), "schedule updated");
                Ok(Committed { table, version })
            }
            // Encoding refused the table (size limit): nothing was written.
            Err(StoreError::Malformed(msg)) => Err(YardError::invalid(FieldError::new(msg))),
            Err(e) => {
                let e = YardError::from(e);
                if matches!(e, YardError::Conflict { .. }) {
                    warn!("edit lost a race with another writer; view must be reloaded");
                }
                Err(e)
            }
        }
    }

    /// The table `edits` would produce from `base`. Pure; every field error
    /// in the batch is reported at once.
    pub fn prepare(&self, base: &Table, edits: &Edits) -> Result<Table, YardError> {
        if edits.len() > MAX_BATCH_SIZE {
            return Err(YardError::invalid(FieldError::new(format!(
                "{} rows in one edit exceeds the limit of {MAX_BATCH_SIZE}",
                edits.len()
            ))));
        }

        let table = match edits {
            Edits::Remove(ids) => remove(base, ids)?,
            Edits::Replace(rows) => {
                let mut errors = Vec::new();
                let mut bookings = Vec::with_capacity(rows.len());
                let mut seen = HashSet::new();
                for (i, row) in rows.iter().enumerate() {
                    let existing = active_position(base, &row.booking_no).map(|p| &base.bookings[p]);
                    match self.merge_row(i + 1, row, existing, &mut seen) {
                        Ok(b) => bookings.push(b),
                        Err(mut e) => errors.append(&mut e),
                    }
                }
                if !errors.is_empty() {
                    return Err(YardError::Validation(errors));
                }
                Table::new(bookings)
            }
            Edits::Upsert(rows) => {
                let mut errors = Vec::new();
                let mut table = base.clone();
                let mut seen = HashSet::new();
                for (i, row) in rows.iter().enumerate() {
                    let pos = active_position(&table, &row.booking_no);
                    let existing = pos.map(|p| &table.bookings[p]);
                    match self.merge_row(i + 1, row, existing, &mut seen) {
                        Ok(b) => match pos {
                            Some(p) => table.bookings[p] = b,
                            None => table.bookings.push(b),
                        },
                        Err(mut e) => errors.append(&mut e),
                    }
                }
                if !errors.is_empty() {
                    return Err(YardError::Validation(errors));
                }
                table
            }
        };

        // Rejected rows are written back too and count against the same cap.
        let rows = table.len() + table.rejected.len();
        if rows > MAX_BOOKINGS {
            return Err(YardError::invalid(FieldError::new(format!(
                "{rows} rows exceeds the limit of {MAX_BOOKINGS}"
            ))));
        }
        let touched: Vec<&str> = match edits {
            Edits::Replace(rows) | Edits::Upsert(rows) => {
                rows.iter().map(|r| r.booking_no.as_str()).collect()
            }
            Edits::Remove(_) => Vec::new(),
        };
        let duplicates: Vec<FieldError> = table
            .duplicate_active()
            .into_iter()
            .filter(|no| touched.iter().any(|t| no.matches(t)))
            .map(|no| {
                FieldError::new("booking number already active")
                    .for_booking(no.as_str())
                    .in_column(Column::BookingNo)
            })
            .collect();
        if !duplicates.is_empty() {
            return Err(YardError::Validation(duplicates));
        }
        Ok(table)
    }

    /// Overlay one edit row on the existing active booking (if any) and check
    /// the result field by field.
    fn merge_row(
        &self,
        row_no: usize,
        row: &EditRow,
        existing: Option<&Booking>,
        seen: &mut HashSet<BookingNo>,
    ) -> Result<Booking, Vec<FieldError>> {
        let err = |column: Column, message: String| {
            FieldError::new(message)
                .at_row(row_no)
                .for_booking(row.booking_no.trim())
                .in_column(column)
        };
        let mut errors = Vec::new();

        let booking_no = match BookingNo::parse(&row.booking_no) {
            Ok(no) => no,
            Err(e) => return Err(vec![FieldError::from(e).at_row(row_no)]),
        };
        if !seen.insert(booking_no.clone()) {
            return Err(vec![err(
                Column::BookingNo,
                "appears more than once in this edit".into(),
            )]);
        }

        let zone = match (row.zone.as_deref(), existing) {
            (Some(z), _) => match self.zones.zone(z) {
                Some(spec) => Some(spec),
                None => {
                    errors.push(err(Column::Zone, format!("unknown zone {:?}", z.trim())));
                    None
                }
            },
            (None, Some(b)) => match self.zones.zone(&b.zone) {
                Some(spec) => Some(spec),
                None => {
                    errors.push(err(
                        Column::Zone,
                        format!("stored zone {:?} is not configured", b.zone),
                    ));
                    None
                }
            },
            (None, None) => {
                errors.push(err(Column::Zone, "required for a new booking".into()));
                None
            }
        };

        let time = match (row.time.as_deref(), existing) {
            (Some(t), _) => match t.parse::<TimeOfDay>() {
                Ok(t) => Some(t),
                Err(e) => {
                    errors.push(FieldError::from(e).at_row(row_no).for_booking(booking_no.as_str()));
                    None
                }
            },
            (None, Some(b)) => Some(b.time),
            (None, None) => {
                errors.push(err(Column::Time, "required for a new booking".into()));
                None
            }
        };

        let status = match (row.status.as_deref(), existing) {
            (Some(s), _) => match s.parse::<Status>() {
                Ok(s) => Some(s),
                Err(e) => {
                    errors.push(FieldError::from(e).at_row(row_no).for_booking(booking_no.as_str()));
                    None
                }
            },
            (None, Some(b)) => Some(b.status),
            (None, None) => Some(Status::default()),
        };
        if let (Some(next), Some(b)) = (status, existing)
            && !b.status.can_transition_to(next)
        {
            errors.push(err(
                Column::Status,
                format!("cannot change from {} to {next}", b.status),
            ));
        }

        // A typed bay must be spelled `Bay {n}`; a stored one is read leniently.
        let (raw_bay, typed) = match (row.bay.as_deref(), existing) {
            (Some(bay), _) => (Some(bay.trim()).filter(|b| !b.is_empty()), true),
            (None, Some(b)) => (b.bay.as_deref(), false),
            (None, None) => (None, false),
        };
        let parse = if typed { parse_bay_label } else { parse_bay_number };
        let bay = match (raw_bay, zone) {
            (None, _) => None,
            (Some(raw), Some(spec)) => match parse(raw).filter(|n| *n <= spec.bays) {
                Some(number) => Some(bay_label(number)),
                None => {
                    errors.push(err(
                        Column::Bay,
                        format!("{raw:?} is not a bay of {} (Bay 1..Bay {})", spec.name, spec.bays),
                    ));
                    None
                }
            },
            // zone already reported
            (Some(_), None) => None,
        };

        match (zone, time, status) {
            (Some(zone), Some(time), Some(status)) if errors.is_empty() => Ok(Booking {
                booking_no,
                zone: zone.name.clone(),
                bay,
                time,
                status,
            }),
            _ => Err(errors),
        }
    }
}

fn active_position(table: &Table, booking_no: &str) -> Option<usize> {
    table
        .bookings
        .iter()
        .position(|b| b.is_active() && b.booking_no.matches(booking_no))
}

fn remove(base: &Table, ids: &[String]) -> Result<Table, YardError> {
    let mut errors = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        if !base.bookings.iter().any(|b| b.booking_no.matches(id)) {
            errors.push(
                FieldError::new("no such booking")
                    .at_row(i + 1)
                    .for_booking(id.trim())
                    .in_column(Column::BookingNo),
            );
        }
    }
    if !errors.is_empty() {
        return Err(YardError::Validation(errors));
    }
    let mut table = base.clone();
    table
        .bookings
        .retain(|b| !ids.iter().any(|id| b.booking_no.matches(id)));
    Ok(table)
}

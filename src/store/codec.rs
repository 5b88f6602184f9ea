use serde_json::{Map, Value};
use tracing::warn;

use crate::limits::MAX_BOOKINGS;
use crate::model::*;

use super::StoreError;

/// Untyped table as it sits in storage: header cells plus data rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Byte format of the stored table.
pub trait TableCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<RawTable, StoreError>;
    fn encode(&self, table: &RawTable) -> Result<Vec<u8>, StoreError>;
}

// ── CSV ──────────────────────────────────────────────────────────

/// Comma-separated values with RFC 4180 quoting. A UTF-8 BOM and blank
/// lines, which spreadsheet exports like to add, are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvCodec;

impl TableCodec for CsvCodec {
    fn decode(&self, bytes: &[u8]) -> Result<RawTable, StoreError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| StoreError::Malformed(format!("not UTF-8: {e}")))?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut records = parse_csv(text)?.into_iter();
        let headers = records.next().unwrap_or_default();
        Ok(RawTable {
            headers,
            rows: records.collect(),
        })
    }

    fn encode(&self, table: &RawTable) -> Result<Vec<u8>, StoreError> {
        let mut out = String::new();
        for record in std::iter::once(&table.headers).chain(table.rows.iter()) {
            let line: Vec<String> = record.iter().map(|f| quote_csv(f)).collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
        Ok(out.into_bytes())
    }
}

fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, StoreError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quote_line = 0usize;
    let mut line = 1usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
                line += 1;
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(StoreError::Malformed(format!(
            "unterminated quoted field starting on line {quote_line}"
        )));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records.retain(|r| r.iter().any(|cell| !cell.trim().is_empty()));
    Ok(records)
}

fn quote_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

// ── JSON ─────────────────────────────────────────────────────────

/// A JSON array of flat objects, one per row. Numbers and booleans are read
/// as their text form; `null` is an empty cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl TableCodec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<RawTable, StoreError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(RawTable::default());
        }
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| StoreError::Malformed(e.to_string()))?;
        let Value::Array(items) = value else {
            return Err(StoreError::Malformed("expected a JSON array of rows".into()));
        };

        let mut headers: Vec<String> = Vec::new();
        let mut objects = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let Value::Object(obj) = item else {
                return Err(StoreError::Malformed(format!("row {i} is not an object")));
            };
            for key in obj.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
            objects.push(obj);
        }

        let mut rows = Vec::with_capacity(objects.len());
        for (i, obj) in objects.iter().enumerate() {
            let mut row = Vec::with_capacity(headers.len());
            for key in &headers {
                let cell = match obj.get(key) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    Some(Value::Bool(b)) => b.to_string(),
                    Some(_) => {
                        return Err(StoreError::Malformed(format!(
                            "row {i}: {key} is not a scalar"
                        )));
                    }
                };
                row.push(cell);
            }
            rows.push(row);
        }
        Ok(RawTable { headers, rows })
    }

    fn encode(&self, table: &RawTable) -> Result<Vec<u8>, StoreError> {
        let rows: Vec<Value> = table
            .rows
            .iter()
            .map(|row| {
                let obj: Map<String, Value> = table
                    .headers
                    .iter()
                    .zip(row.iter())
                    .map(|(h, v)| (h.clone(), Value::String(v.clone())))
                    .collect();
                Value::Object(obj)
            })
            .collect();
        serde_json::to_vec_pretty(&rows).map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

// ── Typing ───────────────────────────────────────────────────────

/// Normalize headers and type every row. Rows that do not type-check are kept
/// aside as [`RejectedRow`]s instead of failing the whole read; a missing
/// required column does fail it.
pub fn decode_bookings(raw: &RawTable) -> Result<Table, StoreError> {
    if raw.headers.is_empty() && raw.rows.is_empty() {
        return Ok(Table::default());
    }
    if raw.rows.len() > MAX_BOOKINGS {
        return Err(StoreError::Malformed(format!(
            "{} rows exceeds the limit of {MAX_BOOKINGS}",
            raw.rows.len()
        )));
    }

    // First occurrence wins when two raw headers normalize to the same column.
    let mut columns: Vec<Option<Column>> = Vec::with_capacity(raw.headers.len());
    for header in &raw.headers {
        let column = Column::from_header(header).filter(|c| !columns.contains(&Some(*c)));
        columns.push(column);
    }
    for required in Column::ALL.into_iter().filter(|c| c.is_required()) {
        if !columns.contains(&Some(required)) {
            return Err(StoreError::Malformed(format!(
                "missing required column {required}"
            )));
        }
    }

    let mut table = Table::default();
    for (i, row) in raw.rows.iter().enumerate() {
        let cells: Vec<(Column, String)> = columns
            .iter()
            .zip(row.iter())
            .filter_map(|(c, v)| c.map(|c| (c, v.trim().to_string())))
            .collect();
        match type_row(&cells) {
            Ok(booking) => table.bookings.push(booking),
            Err(reason) => {
                warn!(row = i + 1, %reason, "keeping unreadable schedule row aside");
                table.rejected.push(RejectedRow { cells, reason });
            }
        }
    }
    Ok(table)
}

fn type_row(cells: &[(Column, String)]) -> Result<Booking, InvalidValue> {
    let cell = |column: Column| {
        cells
            .iter()
            .find(|(c, _)| *c == column)
            .map_or("", |(_, v)| v.as_str())
    };

    let booking_no = BookingNo::parse(cell(Column::BookingNo))?;
    let zone = cell(Column::Zone);
    if zone.is_empty() {
        return Err(InvalidValue::new(Column::Zone, zone, "must not be empty"));
    }
    let bay = Some(cell(Column::Bay))
        .filter(|b| !b.is_empty())
        .map(str::to_string);
    let time = cell(Column::Time).parse()?;
    let status = match cell(Column::Status) {
        "" => Status::default(),
        s => s.parse()?,
    };
    Ok(Booking {
        booking_no,
        zone: zone.to_string(),
        bay,
        time,
        status,
    })
}

/// Lay a typed table out in canonical column order. Rejected rows follow the
/// bookings, unchanged.
pub fn encode_bookings(table: &Table) -> RawTable {
    let headers = Column::ALL.iter().map(|c| c.header().to_string()).collect();
    let mut rows = Vec::with_capacity(table.bookings.len() + table.rejected.len());
    for b in &table.bookings {
        rows.push(vec![
            b.booking_no.to_string(),
            b.zone.clone(),
            b.bay.clone().unwrap_or_default(),
            b.time.to_string(),
            b.status.to_string(),
        ]);
    }
    for r in &table.rejected {
        rows.push(
            Column::ALL
                .iter()
                .map(|c| r.cell(*c).unwrap_or_default().to_string())
                .collect(),
        );
    }
    RawTable { headers, rows }
}

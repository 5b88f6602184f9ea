use std::fmt;

use crate::model::{Column, InvalidValue};
use crate::store::{StoreError, VersionToken};

/// A single rejected field of an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// 1-based position of the row within the edit batch.
    pub row: Option<usize>,
    pub booking_no: Option<String>,
    pub column: Option<Column>,
    pub message: String,
}

impl FieldError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            row: None,
            booking_no: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn for_booking(mut self, booking_no: impl Into<String>) -> Self {
        self.booking_no = Some(booking_no.into());
        self
    }

    pub fn in_column(mut self, column: Column) -> Self {
        self.column = Some(column);
        self
    }
}

impl From<InvalidValue> for FieldError {
    fn from(e: InvalidValue) -> Self {
        FieldError::new(format!("{} (got {:?})", e.reason, e.value)).in_column(e.column)
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(row) = self.row {
            write!(f, "row {row}: ")?;
        }
        if let Some(no) = &self.booking_no {
            write!(f, "{no}: ")?;
        }
        if let Some(col) = self.column {
            write!(f, "{col}: ")?;
        }
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YardError {
    StoreUnavailable(String),
    Conflict {
        expected: Option<VersionToken>,
        found: Option<VersionToken>,
    },
    ZoneFull {
        zone: String,
    },
    Validation(Vec<FieldError>),
    NotFound(String),
    Unauthorized,
}

impl YardError {
    pub(crate) fn invalid(error: FieldError) -> Self {
        YardError::Validation(vec![error])
    }
}

impl fmt::Display for YardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            YardError::StoreUnavailable(e) => write!(f, "schedule unavailable: {e}"),
            YardError::Conflict { .. } => write!(
                f,
                "schedule was changed by someone else; reload and try again"
            ),
            YardError::ZoneFull { zone } => write!(f, "{zone} is full: no free bay"),
            YardError::Validation(errors) => {
                write!(f, "invalid edit: ")?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            YardError::NotFound(no) => write!(f, "booking not found: {no}"),
            YardError::Unauthorized => write!(f, "office access required"),
        }
    }
}

impl std::error::Error for YardError {}

impl From<StoreError> for YardError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { expected, found } => YardError::Conflict { expected, found },
            other => YardError::StoreUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_taxonomy() {
        let conflict = StoreError::Conflict {
            expected: Some(VersionToken::new("a")),
            found: Some(VersionToken::new("b")),
        };
        assert!(matches!(YardError::from(conflict), YardError::Conflict { .. }));
        for e in [
            StoreError::Unavailable("timeout".into()),
            StoreError::NotFound,
            StoreError::Malformed("bad".into()),
        ] {
            assert!(matches!(YardError::from(e), YardError::StoreUnavailable(_)));
        }
    }

    #[test]
    fn validation_message_lists_fields() {
        let err = YardError::Validation(vec![
            FieldError::new("unknown zone").at_row(1).for_booking("B1").in_column(Column::Zone),
            FieldError::new("expected HH:MM").at_row(2).in_column(Column::Time),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid edit: row 1: B1: Zone: unknown zone; row 2: Time: expected HH:MM"
        );
    }
}

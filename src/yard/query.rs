use tracing::debug;

use crate::model::{BookingView, Table};

use super::YardError;

/// Guard lookup: exact booking number, case-insensitive. Prefers the active
/// row; a number whose only rows are completed returns the latest of them.
pub fn find_by_booking_id(id: &str, table: &Table) -> Result<BookingView, YardError> {
    match table.get(id) {
        Some(booking) => Ok(BookingView::from(booking)),
        None => {
            debug!(booking_no = id.trim(), "lookup miss");
            Err(YardError::NotFound(id.trim().to_string()))
        }
    }
}

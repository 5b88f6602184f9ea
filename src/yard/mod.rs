//! Pure yard logic: the board derived from the table, bay assignment and
//! lookups. No I/O happens here.

mod assign;
mod error;
mod query;
mod snapshot;


pub use assign::assign;
pub use error::{FieldError, YardError};
pub use query::find_by_booking_id;
pub use snapshot::{BayView, YardSnapshot, ZoneView, snapshot};

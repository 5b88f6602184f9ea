use crate::config::ZoneConfig;
use crate::model::{BayRef, Booking, Column};

use super::snapshot::YardSnapshot;
use super::{FieldError, YardError};

/// Pick a bay for `booking` in its planned zone: the lowest-numbered bay with
/// no current occupant in `snapshot`. The zone is never changed.
///
/// The snapshot may be stale; callers that commit the result must compute it
/// from a fresh read.
pub fn assign(
    booking: &Booking,
    zones: &ZoneConfig,
    snapshot: &YardSnapshot,
) -> Result<BayRef, YardError> {
    let spec = zones.zone(&booking.zone).ok_or_else(|| {
        YardError::invalid(
            FieldError::new(format!("unknown zone {:?}", booking.zone))
                .for_booking(booking.booking_no.as_str())
                .in_column(Column::Zone),
        )
    })?;
    let view = snapshot.zone(&spec.name);

    (1..=spec.bays)
        .find(|&number| {
            view.and_then(|z| z.bay(number))
                .is_none_or(|bay| bay.is_available())
        })
        .map(|number| BayRef {
            zone: spec.name.clone(),
            number,
        })
        .ok_or_else(|| YardError::ZoneFull {
            zone: spec.name.clone(),
        })
}

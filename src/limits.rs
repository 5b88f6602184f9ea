// Hard limits. Exceeding one on write is a validation error; on read the
// authoritative table is treated as malformed.

pub const MAX_BOOKING_NO_LEN: usize = 64;
pub const MAX_ZONE_NAME_LEN: usize = 64;
pub const MAX_ZONES: usize = 32;
pub const MAX_BAYS_PER_ZONE: u32 = 64;

/// Rows in the authoritative table, active and completed.
pub const MAX_BOOKINGS: usize = 10_000;

/// Rows in a single edit batch (one INSERT statement).
pub const MAX_BATCH_SIZE: usize = 500;

/// Encoded size of the authoritative table.
pub const MAX_TABLE_BYTES: usize = 8 * 1024 * 1024;

/// Upcoming bookings shown per bay after the current occupant.
pub const UPCOMING_PREVIEW: usize = 2;

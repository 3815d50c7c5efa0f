use crate::model::{Cents, Ms};

pub const MAX_SLOTS_PER_ENTRY: usize = 48;
pub const MAX_SERVICE_ID_LEN: usize = 64;
pub const MAX_PROFILE_FIELD_LEN: usize = 4096;
pub const MAX_QUERY_DAYS: i64 = 366;
pub const MAX_HORIZON_DAYS: u32 = 730;
pub const MAX_BOOKINGS_PER_CAREGIVER: usize = 100_000;
pub const MAX_CAREGIVERS: usize = 1_000_000;
pub const MAX_RATE_KEY_LEN: usize = 256;
pub const MAX_BOOKING_AMOUNT: Cents = 100_000_000_00;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SQL_LEN: usize = 64 * 1024;

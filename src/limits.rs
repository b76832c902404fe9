//! Hard limits and defaults. Everything a client can grow is bounded here.

pub const MAX_VENUES: usize = 1_000;
pub const MAX_VENUE_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_VENUE: usize = 10_000;
pub const MAX_USERS_PER_VENUE: usize = 100_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Longest single reservation or walk-in, in hours.
pub const MAX_RESERVATION_HOURS: i64 = 24;

/// Reservations start and end on the hour or on this minute.
pub const DEFAULT_TIME_UNIT_MINUTES: u32 = 30;
/// Same-day bookings must start at least this many hours ahead.
pub const DEFAULT_SAME_DAY_LEAD_HOURS: u32 = 3;

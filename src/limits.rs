use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_SLOT_DURATION_MS: Ms = 31 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
pub const MAX_SLOTS_PER_OFFER: usize = 10_000;

pub const DEFAULT_ACTIVITY_LIMIT: usize = 10;
pub const MAX_ACTIVITY_LIMIT: usize = 100;
pub const MAX_TITLE_LEN: usize = 150;
pub const MAX_KIND_LEN: usize = 50;
pub const MAX_MESSAGE_LEN: usize = 4096;

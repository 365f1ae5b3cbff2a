use crate::model::Ms;

pub const MAX_RESOURCES: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 512;
pub const MAX_GROUPS: usize = 100_000;
pub const MAX_GROUP_MEMBERS: usize = 100_000;

/// Datums per agent report.
pub const MAX_REPORT_DATA: usize = 500_000;
/// Datums reconciled under one lock acquisition and one WAL record.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

pub const MAX_BUCKETS: usize = 10_000;
pub const MAX_HISTORY_PAGE: usize = 10_000;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_WAL_ENTRY_BYTES: usize = 256 * 1024 * 1024;

pub fn valid_timestamp(t: Ms) -> bool {
    (MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t)
}

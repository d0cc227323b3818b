//! Wall-clock helpers.

use chrono::Utc;

/// Milliseconds since the Unix epoch. All persisted times use this unit.
pub type EpochMillis = i64;

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> EpochMillis {
    Utc::now().timestamp_millis()
}

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

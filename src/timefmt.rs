//! Timestamp formatting helpers. The market's display zone is UTC+8; every
//! stored row carries the formatted form, with raw unix seconds kept where a
//! later pass needs to do arithmetic.

use chrono::{FixedOffset, TimeZone, Utc};

const DISPLAY_OFFSET_SECS: i32 = 8 * 3600;

/// Unix seconds → `YYYY-MM-DD HH:MM:SS` in the display zone.
pub fn format_unix_timestamp(ts: u64) -> String {
    let offset = FixedOffset::east_opt(DISPLAY_OFFSET_SECS).unwrap();
    match offset.timestamp_opt(ts as i64, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => ts.to_string(),
    }
}

/// Current time, same format and zone as [`format_unix_timestamp`].
pub fn now_formatted() -> String {
    format_unix_timestamp(Utc::now().timestamp().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_in_display_zone() {
        // 2021-01-01 00:00:00 UTC == 08:00:00 at UTC+8
        assert_eq!(format_unix_timestamp(1_609_459_200), "2021-01-01 08:00:00");
    }

    #[test]
    fn zero_is_the_zone_epoch() {
        assert_eq!(format_unix_timestamp(0), "1970-01-01 08:00:00");
    }
}

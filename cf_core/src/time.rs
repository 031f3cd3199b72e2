// ABOUTME: Utilities for working with times and timestamps.
// ABOUTME: Provides UTC now and RFC3339 formatting over chrono.
use chrono::{DateTime, SecondsFormat, Utc};

/// Get the current UTC time
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a UTC timestamp as RFC3339 with second precision
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use cf_core::format_rfc3339;
///
/// let time = Utc.timestamp_opt(1_609_459_200, 0).unwrap(); // 2021-01-01
/// assert_eq!(format_rfc3339(time), "2021-01-01T00:00:00Z");
/// ```
pub fn format_rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_utc_now_is_reasonable() {
        let now = utc_now();
        // After 2020-01-01
        assert!(now.timestamp() > 1_577_836_800);
    }

    #[test]
    fn test_format_rfc3339() {
        let time = Utc.timestamp_opt(1_609_459_200, 0).unwrap();
        assert_eq!(format_rfc3339(time), "2021-01-01T00:00:00Z");
    }
}

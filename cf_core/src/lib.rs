//! ABOUTME: Core types, errors, IDs, and tracing utilities
//! ABOUTME: Foundation crate used by all other cronfleet components

pub mod error;
pub mod id;
pub mod telemetry;
pub mod time;

pub use error::{Error, Result};
pub use id::Id;
pub use time::{format_rfc3339, utc_now};

#[cfg(test)]
mod tests {
    use super::{format_rfc3339, utc_now, Id};

    #[test]
    fn test_ids_fit_entity_keys() {
        // Entity ids are ULID strings: fixed 26 chars, parseable back
        let id = Id::new();
        let key = id.to_string();
        assert_eq!(key.len(), 26);
        assert_eq!(key.parse::<Id>().unwrap(), id);
    }

    #[test]
    fn test_timestamps_render_as_utc_rfc3339() {
        let stamp = format_rfc3339(utc_now());
        assert!(stamp.ends_with('Z'), "expected UTC suffix, got {}", stamp);
        assert!(stamp.contains('T'));
    }
}

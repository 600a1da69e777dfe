//! Key manager configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for [`KeyManagementService`](crate::KeyManagementService)
///
/// Every field has a default, so a partial document deserializes cleanly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyManagerConfig {
    /// One-time prekeys generated at initialization and on each refill
    pub one_time_prekey_count: u32,
    /// Refill the local pool once it holds fewer keys than this
    pub prekey_refill_threshold: u32,
    /// Sessions unused for longer than this are evicted
    pub session_max_idle: Duration,
    /// Upper bound for any single directory call
    pub directory_timeout: Duration,
    /// Age after which the signed prekey should be rotated
    pub signed_prekey_max_age: Duration,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_count: 100,
            prekey_refill_threshold: 10,
            session_max_idle: DAY * 7,
            directory_timeout: Duration::from_secs(10),
            signed_prekey_max_age: DAY * 7,
        }
    }
}

impl KeyManagerConfig {
    /// Idle limit as a calendar duration, saturating on overflow
    pub fn session_max_idle_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.session_max_idle).unwrap_or(chrono::Duration::MAX)
    }

    /// Signed prekey lifetime in whole seconds, saturating on overflow
    pub fn signed_prekey_max_age_secs(&self) -> i64 {
        i64::try_from(self.signed_prekey_max_age.as_secs()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KeyManagerConfig::default();
        assert_eq!(config.one_time_prekey_count, 100);
        assert_eq!(config.prekey_refill_threshold, 10);
        assert_eq!(config.session_max_idle, Duration::from_secs(604_800));
        assert_eq!(config.directory_timeout, Duration::from_secs(10));
        assert_eq!(config.session_max_idle_delta(), chrono::Duration::days(7));
        assert_eq!(config.signed_prekey_max_age_secs(), 604_800);
    }

    #[test]
    fn test_overflowing_idle_saturates() {
        let config = KeyManagerConfig {
            session_max_idle: Duration::MAX,
            ..KeyManagerConfig::default()
        };
        assert_eq!(config.session_max_idle_delta(), chrono::Duration::MAX);
    }
}

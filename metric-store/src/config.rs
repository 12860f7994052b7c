//! Store configuration.
//!
//! A [`StoreConfig`] is passed explicitly to [`crate::store::Store::open`];
//! nothing is read from globals. It can be built in code or loaded from a
//! JSON file, where durations are written as seconds:
//!
//! ```json
//! {
//!   "retention_max_age_days": 7,
//!   "min_disk_free_ratio": 0.1,
//!   "shard_rotation_size_bytes": 67108864,
//!   "shard_rotation_max_age": 86400,
//!   "retention_interval": 60
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::duration_ms;
use crate::error::ConfigError;

const MS_PER_DAY: i64 = 86_400_000;

/// Retention and rotation policy for a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Shards created more than this many days ago are dropped.
    pub retention_max_age_days: u32,

    /// Oldest shards are pruned while the free fraction of the volume is
    /// below this value. Must be in `[0, 1]`; `0` disables pruning.
    pub min_disk_free_ratio: f64,

    /// The active shard is rotated once its segment reaches this size.
    pub shard_rotation_size_bytes: u64,

    /// Width of a shard's time window, and the maximum wall-clock age of
    /// the active shard before the retention loop rotates it.
    #[serde(with = "duration_serde")]
    pub shard_rotation_max_age: Duration,

    /// Pause between retention cycles of the background worker.
    #[serde(with = "duration_serde")]
    pub retention_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_max_age_days: 7,
            min_disk_free_ratio: 0.1,
            shard_rotation_size_bytes: 64 * 1024 * 1024,
            shard_rotation_max_age: Duration::from_secs(86_400),
            retention_interval: Duration::from_secs(60),
        }
    }
}

impl StoreConfig {
    /// Loads and validates a configuration file.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, is not valid JSON,
    /// or fails [`StoreConfig::validate`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field is in range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_max_age_days == 0 {
            return Err(ConfigError::Invalid {
                field: "retention_max_age_days",
                reason: "must be at least one day".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.min_disk_free_ratio) {
            return Err(ConfigError::Invalid {
                field: "min_disk_free_ratio",
                reason: format!("{} is outside [0, 1]", self.min_disk_free_ratio),
            });
        }

        if self.shard_rotation_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "shard_rotation_size_bytes",
                reason: "cannot be zero".to_string(),
            });
        }

        if self.shard_rotation_max_age_ms() == 0 {
            return Err(ConfigError::Invalid {
                field: "shard_rotation_max_age",
                reason: "must be at least one millisecond".to_string(),
            });
        }

        if self.shard_rotation_max_age_ms() > self.retention_max_age_ms() {
            return Err(ConfigError::Invalid {
                field: "shard_rotation_max_age",
                reason: format!(
                    "{:?} exceeds retention of {} days",
                    self.shard_rotation_max_age, self.retention_max_age_days
                ),
            });
        }

        if self.retention_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "retention_interval",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(())
    }

    /// Retention window in milliseconds.
    pub fn retention_max_age_ms(&self) -> i64 {
        i64::from(self.retention_max_age_days) * MS_PER_DAY
    }

    /// Shard window in milliseconds.
    pub fn shard_rotation_max_age_ms(&self) -> i64 {
        duration_ms(self.shard_rotation_max_age)
    }

    /// Sets the retention age.
    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_max_age_days = days;
        self
    }

    /// Sets the minimum free disk ratio.
    #[must_use]
    pub fn with_min_disk_free_ratio(mut self, ratio: f64) -> Self {
        self.min_disk_free_ratio = ratio;
        self
    }

    /// Sets the size rotation threshold.
    #[must_use]
    pub fn with_rotation_size(mut self, bytes: u64) -> Self {
        self.shard_rotation_size_bytes = bytes;
        self
    }

    /// Sets the shard window.
    #[must_use]
    pub fn with_rotation_age(mut self, age: Duration) -> Self {
        self.shard_rotation_max_age = age;
        self
    }

    /// Sets the retention worker interval.
    #[must_use]
    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval;
        self
    }
}

/// Serde helper: durations as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_retention() {
        let err = StoreConfig::default()
            .with_retention_days(0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "retention_max_age_days",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_ratio_out_of_range() {
        for ratio in [-0.1, 1.5, f64::NAN] {
            let err = StoreConfig::default()
                .with_min_disk_free_ratio(ratio)
                .validate()
                .unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid {
                    field: "min_disk_free_ratio",
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_rejects_rotation_longer_than_retention() {
        let err = StoreConfig::default()
            .with_retention_days(1)
            .with_rotation_age(Duration::from_secs(2 * 86_400))
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "shard_rotation_max_age",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_zero_rotation_size() {
        assert!(
            StoreConfig::default()
                .with_rotation_size(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_load_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, r#"{"retention_max_age_days": 3, "shard_rotation_max_age": 3600}"#)
            .unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.retention_max_age_days, 3);
        assert_eq!(config.shard_rotation_max_age, Duration::from_secs(3600));
        assert_eq!(config.min_disk_free_ratio, 0.1);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            StoreConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            StoreConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let config = StoreConfig::default().with_rotation_age(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}

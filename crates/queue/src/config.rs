//! Queue configuration.
//!
//! Defaults are usable as-is; a TOML file and/or `CAFETAL_QUEUE_*` environment
//! variables override them. Durations are humantime strings (`5s`, `24h`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cafetal_analysis::Category;

use crate::jobs::retry::RetryPolicy;

/// Lower bound for [`QueueConfig::await_poll_interval`].
pub const MIN_AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const ENV_PREFIX: &str = "CAFETAL_QUEUE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Recognized queue options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Executor slots (parallel executions per process)
    pub max_concurrent: usize,
    /// Default attempt ceiling for submissions that don't set one
    pub max_attempts: u32,
    /// Backoff for the first retry; doubles per attempt
    #[serde(with = "humantime_duration")]
    pub base_delay: Duration,
    /// Backoff cap
    #[serde(with = "humantime_duration")]
    pub max_delay: Duration,
    /// Age at which the age bonus stops growing
    #[serde(with = "humantime_duration")]
    pub age_cap: Duration,
    /// Score bonus reached at `age_cap`
    pub age_bonus_cap: f64,
    /// Timeout for categories without an explicit entry
    #[serde(with = "humantime_duration")]
    pub default_timeout: Duration,
    #[serde(with = "humantime_duration_map")]
    pub per_category_timeout: HashMap<String, Duration>,
    /// Upper bound on how long the dispatch loop sleeps without a wake-up
    #[serde(with = "humantime_duration")]
    pub safety_tick: Duration,
    #[serde(with = "humantime_duration")]
    pub await_poll_interval: Duration,
    /// How long terminal items are kept before the sweeper purges them
    #[serde(with = "humantime_duration")]
    pub retention: Duration,
    #[serde(with = "humantime_duration")]
    pub sweep_interval: Duration,
    /// When set, only `running` items dispatched longer ago than this are
    /// treated as orphaned (several processes share the store). When unset,
    /// every `running` item found at start is orphaned.
    #[serde(with = "humantime_duration_opt")]
    pub recovery_grace: Option<Duration>,
    /// Buffer size of the queue event broadcast channel
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5 * 60),
            age_cap: Duration::from_secs(24 * 60 * 60),
            age_bonus_cap: 75.0,
            default_timeout: Duration::from_secs(120),
            per_category_timeout: HashMap::new(),
            safety_tick: Duration::from_secs(2),
            await_poll_interval: Duration::from_millis(250),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            recovery_grace: None,
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_safety_tick(mut self, tick: Duration) -> Self {
        self.safety_tick = tick;
        self
    }

    pub fn with_category_timeout(mut self, category: &Category, timeout: Duration) -> Self {
        self.per_category_timeout
            .insert(category.as_str().to_string(), timeout);
        self
    }

    /// Wall-clock budget for one execution of `category`.
    pub fn timeout_for(&self, category: &Category) -> Duration {
        self.per_category_timeout
            .get(category.as_str())
            .copied()
            .unwrap_or(self.default_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.base_delay, self.max_delay)
    }

    /// Poll interval for `await_result`, never below [`MIN_AWAIT_POLL_INTERVAL`].
    pub fn effective_poll_interval(&self) -> Duration {
        self.await_poll_interval.max(MIN_AWAIT_POLL_INTERVAL)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "base_delay",
                format!(
                    "{} exceeds max_delay {}",
                    humantime::format_duration(self.base_delay),
                    humantime::format_duration(self.max_delay)
                ),
            ));
        }
        if !(self.age_bonus_cap.is_finite() && self.age_bonus_cap >= 0.0) {
            return Err(ConfigError::invalid("age_bonus_cap", "must be a non-negative number"));
        }
        for (key, value) in [
            ("safety_tick", self.safety_tick),
            ("sweep_interval", self.sweep_interval),
            ("default_timeout", self.default_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        for (category, timeout) in &self.per_category_timeout {
            Category::new(category.as_str())
                .map_err(|e| ConfigError::invalid("per_category_timeout", e.to_string()))?;
            if timeout.is_zero() {
                return Err(ConfigError::invalid(
                    "per_category_timeout",
                    format!("timeout for {category} must be greater than zero"),
                ));
            }
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::invalid("event_capacity", "must be at least 1"));
        }
        Ok(())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overridden by `CAFETAL_QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary `key -> value` source (the keys are
    /// the full `CAFETAL_QUEUE_*` variable names).
    pub fn merge_lookup<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("MAX_CONCURRENT") {
            self.max_concurrent = parse_number("MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.max_attempts = parse_number("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("BASE_DELAY") {
            self.base_delay = parse_duration("BASE_DELAY", &v)?;
        }
        if let Some(v) = get("MAX_DELAY") {
            self.max_delay = parse_duration("MAX_DELAY", &v)?;
        }
        if let Some(v) = get("AGE_CAP") {
            self.age_cap = parse_duration("AGE_CAP", &v)?;
        }
        if let Some(v) = get("AGE_BONUS_CAP") {
            self.age_bonus_cap = parse_number("AGE_BONUS_CAP", &v)?;
        }
        if let Some(v) = get("DEFAULT_TIMEOUT") {
            self.default_timeout = parse_duration("DEFAULT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("CATEGORY_TIMEOUTS") {
            self.per_category_timeout = parse_category_timeouts(&v)?;
        }
        if let Some(v) = get("SAFETY_TICK") {
            self.safety_tick = parse_duration("SAFETY_TICK", &v)?;
        }
        if let Some(v) = get("AWAIT_POLL_INTERVAL") {
            self.await_poll_interval = parse_duration("AWAIT_POLL_INTERVAL", &v)?;
        }
        if let Some(v) = get("RETENTION") {
            self.retention = parse_duration("RETENTION", &v)?;
        }
        if let Some(v) = get("SWEEP_INTERVAL") {
            self.sweep_interval = parse_duration("SWEEP_INTERVAL", &v)?;
        }
        if let Some(v) = get("RECOVERY_GRACE") {
            self.recovery_grace = Some(parse_duration("RECOVERY_GRACE", &v)?);
        }
        if let Some(v) = get("EVENT_CAPACITY") {
            self.event_capacity = parse_number("EVENT_CAPACITY", &v)?;
        }

        self.validate()?;
        Ok(self)
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(&format!("{ENV_PREFIX}{key}"), e.to_string()))
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| ConfigError::invalid(&format!("{ENV_PREFIX}{key}"), e.to_string()))
}

/// Parse `category=duration` pairs separated by commas.
fn parse_category_timeouts(raw: &str) -> Result<HashMap<String, Duration>, ConfigError> {
    let mut timeouts = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (category, duration) = pair.split_once('=').ok_or_else(|| {
            ConfigError::invalid(
                "CAFETAL_QUEUE_CATEGORY_TIMEOUTS",
                format!("expected category=duration, got {pair:?}"),
            )
        })?;
        timeouts.insert(
            category.trim().to_string(),
            parse_duration("CATEGORY_TIMEOUTS", duration)?,
        );
    }
    Ok(timeouts)
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod humantime_duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod humantime_duration_map {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(value.len()))?;
        for (k, v) in value {
            map.serialize_entry(k, &humantime::format_duration(*v).to_string())?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        HashMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, raw)| {
                humantime::parse_duration(&raw)
                    .map(|d| (k, d))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = QueueConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(300));
        assert_eq!(config.age_cap, Duration::from_secs(86_400));
    }

    #[test]
    fn env_overrides_defaults() {
        let config = QueueConfig::default()
            .merge_lookup(lookup(&[
                ("CAFETAL_QUEUE_MAX_CONCURRENT", "8"),
                ("CAFETAL_QUEUE_BASE_DELAY", "250ms"),
                (
                    "CAFETAL_QUEUE_CATEGORY_TIMEOUTS",
                    "pest_classification=45s, yield_prediction=5m",
                ),
                ("CAFETAL_QUEUE_RECOVERY_GRACE", "10m"),
            ]))
            .unwrap();

        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.recovery_grace, Some(Duration::from_secs(600)));
        let pest = Category::new("pest_classification").unwrap();
        let other = Category::new("soil_moisture").unwrap();
        assert_eq!(config.timeout_for(&pest), Duration::from_secs(45));
        assert_eq!(config.timeout_for(&other), config.default_timeout);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = QueueConfig::default()
            .merge_lookup(lookup(&[("CAFETAL_QUEUE_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "CAFETAL_QUEUE_MAX_ATTEMPTS"));

        let err = QueueConfig::default()
            .merge_lookup(lookup(&[("CAFETAL_QUEUE_CATEGORY_TIMEOUTS", "pest_classification")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn validation_catches_inverted_backoff() {
        let config = QueueConfig::default()
            .with_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert!(config.validate().is_err());

        assert!(QueueConfig::default().with_max_concurrent(0).validate().is_err());
        assert!(QueueConfig::default().with_max_attempts(0).validate().is_err());
    }

    #[test]
    fn toml_uses_humantime_durations() {
        let config = QueueConfig::from_toml_str(
            r#"
            max_concurrent = 5
            base_delay = "2s"
            age_cap = "12h"

            [per_category_timeout]
            yield_prediction = "4m"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.base_delay, Duration::from_secs(2));
        assert_eq!(config.age_cap, Duration::from_secs(12 * 3600));
        assert_eq!(
            config.per_category_timeout.get("yield_prediction"),
            Some(&Duration::from_secs(240))
        );
        // Untouched fields keep their defaults.
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let config = QueueConfig {
            await_poll_interval: Duration::from_millis(1),
            ..QueueConfig::default()
        };
        assert_eq!(config.effective_poll_interval(), MIN_AWAIT_POLL_INTERVAL);
    }
}

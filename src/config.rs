//! Engine configuration.
//!
//! Configuration arrives as a string key-value [`Properties`] map and is
//! parsed into a typed, validated [`EngineConfig`] once at startup. The
//! config value is then passed into the runtime by ownership; there is no
//! ambient global state.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::EngineError;

/// String key-value configuration properties.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    entries: HashMap<String, String>,
}

impl Properties {
    /// Creates an empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Gets a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Gets a required property, returning an error if missing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingConfig`] if the key is not set.
    pub fn require(&self, key: &str) -> Result<&str, EngineError> {
        self.get(key)
            .ok_or_else(|| EngineError::MissingConfig(key.to_string()))
    }

    /// Gets a property parsed as the given type.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if the value cannot be parsed.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, EngineError>
    where
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(v) => v.parse::<T>().map(Some).map_err(|e| {
                EngineError::Configuration(format!("invalid value for '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Returns properties with the given prefix, with the prefix stripped.
    ///
    /// Used to pass client-level options straight through to the external
    /// log client.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> HashMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect()
    }
}

/// Where to start reading a partition when no committed offset exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// Start from the earliest available offset.
    Earliest,
    /// Start from the latest offset (only new records).
    Latest,
}

impl OffsetReset {
    /// Returns the client config value string.
    #[must_use]
    pub fn as_client_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_client_str())
    }
}

impl std::str::FromStr for OffsetReset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "end" => Ok(OffsetReset::Latest),
            other => Err(EngineError::Configuration(format!(
                "invalid auto.offset.reset: '{other}' (expected earliest/latest)"
            ))),
        }
    }
}

/// Typed engine configuration, constructed once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // -- Required --
    /// Comma-separated list of broker addresses.
    pub bootstrap_servers: String,
    /// Consumer group identifier.
    pub group_id: String,
    /// Topic to consume from.
    pub topic: String,

    // -- Consumer tuning --
    /// Where to start reading when no committed offset exists.
    pub offset_reset: OffsetReset,
    /// Maximum records per poll batch.
    pub max_poll_records: usize,
    /// Floor for the adaptive batch size.
    pub min_poll_records: usize,
    /// Upper bound on how long one poll may block.
    pub poll_timeout: Duration,
    /// Delay before re-polling after a lost connection.
    pub reconnect_backoff: Duration,

    // -- Commit --
    /// How often to commit offsets durably.
    pub commit_interval: Duration,
    /// Commit retry attempts before surfacing `CommitFailed`.
    pub commit_max_attempts: usize,
    /// Initial backoff between commit retries.
    pub commit_backoff: Duration,

    // -- Processing --
    /// Attempts per record before routing to the dead-letter sink.
    pub processing_max_attempts: usize,
    /// Initial backoff between processing retries.
    pub processing_backoff: Duration,

    // -- Backpressure --
    /// Batch latency above which the poll batch size shrinks.
    pub backpressure_latency_threshold: Duration,
    /// Batch size multiplier applied when shrinking.
    pub backpressure_shrink_factor: f64,

    // -- Sinks --
    /// Topic for records that permanently fail processing.
    pub dead_letter_topic: Option<String>,
    /// Topic for transform output, if the topology produces.
    pub emit_topic: Option<String>,

    // -- Pass-through --
    /// Additional properties passed directly to the log client.
    pub client_properties: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: String::new(),
            group_id: String::new(),
            topic: String::new(),
            offset_reset: OffsetReset::Earliest,
            max_poll_records: 500,
            min_poll_records: 10,
            poll_timeout: Duration::from_millis(250),
            reconnect_backoff: Duration::from_secs(1),
            commit_interval: Duration::from_secs(5),
            commit_max_attempts: 5,
            commit_backoff: Duration::from_millis(200),
            processing_max_attempts: 3,
            processing_backoff: Duration::from_millis(50),
            backpressure_latency_threshold: Duration::from_millis(500),
            backpressure_shrink_factor: 0.5,
            dead_letter_topic: None,
            emit_topic: None,
            client_properties: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parses an [`EngineConfig`] from a property map.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or values are invalid.
    pub fn from_properties(props: &Properties) -> Result<Self, EngineError> {
        let defaults = Self::default();

        let bootstrap_servers = props.require("bootstrap.servers")?.to_string();
        let group_id = props.require("group.id")?.to_string();
        let topic = props.require("topic")?.to_string();

        let offset_reset = match props.get("auto.offset.reset") {
            Some(s) => s.parse::<OffsetReset>()?,
            None => defaults.offset_reset,
        };

        let max_poll_records = props
            .get_parsed::<usize>("max.poll.records")?
            .unwrap_or(defaults.max_poll_records);
        let min_poll_records = props
            .get_parsed::<usize>("min.poll.records")?
            .unwrap_or(defaults.min_poll_records);
        let poll_timeout = props
            .get_parsed::<u64>("poll.timeout.ms")?
            .map_or(defaults.poll_timeout, Duration::from_millis);
        let reconnect_backoff = props
            .get_parsed::<u64>("reconnect.backoff.ms")?
            .map_or(defaults.reconnect_backoff, Duration::from_millis);

        let commit_interval = props
            .get_parsed::<u64>("commit.interval.ms")?
            .map_or(defaults.commit_interval, Duration::from_millis);
        let commit_max_attempts = props
            .get_parsed::<usize>("commit.max.attempts")?
            .unwrap_or(defaults.commit_max_attempts);
        let commit_backoff = props
            .get_parsed::<u64>("commit.backoff.ms")?
            .map_or(defaults.commit_backoff, Duration::from_millis);

        let processing_max_attempts = props
            .get_parsed::<usize>("processing.max.attempts")?
            .unwrap_or(defaults.processing_max_attempts);
        let processing_backoff = props
            .get_parsed::<u64>("processing.backoff.ms")?
            .map_or(defaults.processing_backoff, Duration::from_millis);

        let backpressure_latency_threshold = props
            .get_parsed::<u64>("backpressure.latency.threshold.ms")?
            .map_or(defaults.backpressure_latency_threshold, Duration::from_millis);
        let backpressure_shrink_factor = props
            .get_parsed::<f64>("backpressure.shrink.factor")?
            .unwrap_or(defaults.backpressure_shrink_factor);

        let dead_letter_topic = props.get("dead.letter.topic").map(String::from);
        let emit_topic = props.get("emit.topic").map(String::from);

        let client_properties = props.with_prefix("client.");

        let cfg = Self {
            bootstrap_servers,
            group_id,
            topic,
            offset_reset,
            max_poll_records,
            min_poll_records,
            poll_timeout,
            reconnect_backoff,
            commit_interval,
            commit_max_attempts,
            commit_backoff,
            processing_max_attempts,
            processing_backoff,
            backpressure_latency_threshold,
            backpressure_shrink_factor,
            dead_letter_topic,
            emit_topic,
            client_properties,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if the configuration is
    /// invalid.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.bootstrap_servers.is_empty() {
            return Err(EngineError::Configuration(
                "bootstrap.servers cannot be empty".into(),
            ));
        }
        if self.group_id.is_empty() {
            return Err(EngineError::Configuration("group.id cannot be empty".into()));
        }
        if self.topic.is_empty() {
            return Err(EngineError::Configuration("topic cannot be empty".into()));
        }
        if self.max_poll_records == 0 {
            return Err(EngineError::Configuration(
                "max.poll.records must be > 0".into(),
            ));
        }
        if self.min_poll_records == 0 || self.min_poll_records > self.max_poll_records {
            return Err(EngineError::Configuration(
                "min.poll.records must be in 1..=max.poll.records".into(),
            ));
        }
        if self.processing_max_attempts == 0 {
            return Err(EngineError::Configuration(
                "processing.max.attempts must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.backpressure_shrink_factor)
            || self.backpressure_shrink_factor <= 0.0
        {
            return Err(EngineError::Configuration(
                "backpressure.shrink.factor must be in (0.0, 1.0)".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_props(extra: &[(&str, &str)]) -> Properties {
        let mut props = Properties::new();
        props.set("bootstrap.servers", "localhost:9092");
        props.set("group.id", "millipede-ingest");
        props.set("topic", "MINUS");
        for (k, v) in extra {
            props.set(*k, *v);
        }
        props
    }

    #[test]
    fn test_require() {
        let props = base_props(&[]);
        assert!(props.require("topic").is_ok());
        assert!(matches!(
            props.require("absent"),
            Err(EngineError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_get_parsed() {
        let props = base_props(&[("max.poll.records", "250"), ("bad", "nope")]);
        assert_eq!(
            props.get_parsed::<usize>("max.poll.records").unwrap(),
            Some(250)
        );
        assert_eq!(props.get_parsed::<usize>("absent").unwrap(), None);
        assert!(props.get_parsed::<usize>("bad").is_err());
    }

    #[test]
    fn test_prefix_extraction() {
        let props = base_props(&[
            ("client.session.timeout.ms", "6000"),
            ("client.enable.partition.eof", "false"),
        ]);
        let passthrough = props.with_prefix("client.");
        assert_eq!(passthrough.len(), 2);
        assert_eq!(
            passthrough.get("session.timeout.ms"),
            Some(&"6000".to_string())
        );
    }

    #[test]
    fn test_parse_required_and_defaults() {
        let cfg = EngineConfig::from_properties(&base_props(&[])).unwrap();
        assert_eq!(cfg.bootstrap_servers, "localhost:9092");
        assert_eq!(cfg.group_id, "millipede-ingest");
        assert_eq!(cfg.topic, "MINUS");
        assert_eq!(cfg.offset_reset, OffsetReset::Earliest);
        assert_eq!(cfg.max_poll_records, 500);
        assert_eq!(cfg.commit_interval, Duration::from_secs(5));
        assert_eq!(cfg.processing_max_attempts, 3);
        assert!(cfg.emit_topic.is_none());
    }

    #[test]
    fn test_parse_missing_required() {
        let props = Properties::new();
        assert!(EngineConfig::from_properties(&props).is_err());
    }

    #[test]
    fn test_parse_overrides() {
        let cfg = EngineConfig::from_properties(&base_props(&[
            ("auto.offset.reset", "latest"),
            ("max.poll.records", "100"),
            ("min.poll.records", "5"),
            ("commit.interval.ms", "1000"),
            ("processing.max.attempts", "5"),
            ("emit.topic", "MINUS_RESULT"),
            ("dead.letter.topic", "MINUS_DLQ"),
        ]))
        .unwrap();

        assert_eq!(cfg.offset_reset, OffsetReset::Latest);
        assert_eq!(cfg.max_poll_records, 100);
        assert_eq!(cfg.min_poll_records, 5);
        assert_eq!(cfg.commit_interval, Duration::from_secs(1));
        assert_eq!(cfg.processing_max_attempts, 5);
        assert_eq!(cfg.emit_topic.as_deref(), Some("MINUS_RESULT"));
        assert_eq!(cfg.dead_letter_topic.as_deref(), Some("MINUS_DLQ"));
    }

    #[test]
    fn test_validate_min_above_max() {
        let cfg = EngineConfig::from_properties(&base_props(&[
            ("max.poll.records", "10"),
            ("min.poll.records", "20"),
        ]));
        assert!(cfg.is_err());
    }

    #[test]
    fn test_validate_shrink_factor_bounds() {
        let cfg = EngineConfig::from_properties(&base_props(&[(
            "backpressure.shrink.factor",
            "1.5",
        )]));
        assert!(cfg.is_err());
    }

    #[test]
    fn test_offset_reset_parsing() {
        assert_eq!(
            "earliest".parse::<OffsetReset>().unwrap(),
            OffsetReset::Earliest
        );
        assert_eq!("end".parse::<OffsetReset>().unwrap(), OffsetReset::Latest);
        assert!("invalid".parse::<OffsetReset>().is_err());
    }
}

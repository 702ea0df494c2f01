use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ConfigError;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::pipeline::retry::RetryPolicy;

/// How a partition pipeline spreads messages over its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// Same non-empty key always lands on the same worker
    #[default]
    KeyDistribute,
    /// Rotate through workers regardless of key
    RoundRobin,
}

impl FromStr for RoutingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "key_distribute" => Ok(RoutingMode::KeyDistribute),
            "round_robin" => Ok(RoutingMode::RoundRobin),
            _ => Err(ConfigError::UnknownRoutingMode(s.to_string())),
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::KeyDistribute => write!(f, "key_distribute"),
            RoutingMode::RoundRobin => write!(f, "round_robin"),
        }
    }
}

/// Settings for one partition pipeline. Every claim gets its own pipeline
/// built from the same `PipelineConfig`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of in-flight (admitted but unconfirmed) messages
    pub window_capacity: usize,
    pub worker_count: usize,
    pub routing_mode: RoutingMode,
    pub commit_interval: Duration,
    pub give_up_check_interval: Duration,
    /// A window with pending work and no commit for this long triggers a give-up
    pub give_up_after: Duration,
    pub watermark_scan_interval: Duration,
    /// Sleep between admission attempts while the window is full
    pub backpressure_interval: Duration,
    /// Retries after the first attempt; 0 means a single call
    pub max_retries: u32,
    pub retry_multiplier: f64,
    pub retry_initial_interval: Duration,
    pub retry_max_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_capacity: 256,
            worker_count: 1,
            routing_mode: RoutingMode::KeyDistribute,
            commit_interval: Duration::from_secs(3),
            give_up_check_interval: Duration::from_secs(10),
            give_up_after: Duration::from_secs(120),
            watermark_scan_interval: Duration::from_millis(100),
            backpressure_interval: Duration::from_millis(100),
            max_retries: 0,
            retry_multiplier: 1.5,
            retry_initial_interval: Duration::from_millis(500),
            retry_max_interval: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    pub fn with_window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_routing_mode(mut self, mode: RoutingMode) -> Self {
        self.routing_mode = mode;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Set how often the stall detector runs and how long it tolerates no commit progress
    pub fn with_give_up(mut self, check_interval: Duration, give_up_after: Duration) -> Self {
        self.give_up_check_interval = check_interval;
        self.give_up_after = give_up_after;
        self
    }

    pub fn with_watermark_scan_interval(mut self, interval: Duration) -> Self {
        self.watermark_scan_interval = interval;
        self
    }

    pub fn with_backpressure_interval(mut self, interval: Duration) -> Self {
        self.backpressure_interval = interval;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, multiplier: f64) -> Self {
        self.max_retries = max_retries;
        self.retry_multiplier = multiplier;
        self
    }

    pub fn with_retry_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_interval = initial;
        self.retry_max_interval = max;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.retry_multiplier,
            self.retry_initial_interval,
            self.retry_max_interval,
        )
    }

    /// Reject settings that would leave a pipeline unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier <= 0.0 {
            return Err(ConfigError::InvalidRetryMultiplier(self.retry_multiplier));
        }

        let intervals = [
            ("commit interval", self.commit_interval),
            ("give up check interval", self.give_up_check_interval),
            ("give up threshold", self.give_up_after),
            ("watermark scan interval", self.watermark_scan_interval),
            ("backpressure interval", self.backpressure_interval),
            ("retry initial interval", self.retry_initial_interval),
            ("retry max interval", self.retry_max_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval { name });
            }
        }

        if self.retry_max_interval < self.retry_initial_interval {
            return Err(ConfigError::RetryIntervalsInverted);
        }

        Ok(())
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-parallel-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // SASL/SCRAM-SHA-512 is enabled when both are set
    pub kafka_sasl_username: Option<String>,

    pub kafka_sasl_password: Option<String>,

    // Pipeline configuration (per partition)
    #[envconfig(default = "256")]
    pub window_capacity: usize,

    #[envconfig(default = "1")]
    pub worker_count: usize,

    #[envconfig(default = "key_distribute")]
    pub routing_mode: String,

    #[envconfig(default = "0")]
    pub max_retries: u32,

    #[envconfig(default = "1.5")]
    pub retry_multiplier: f64,

    #[envconfig(default = "500")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(default = "60000")]
    pub retry_max_interval_ms: u64,

    #[envconfig(default = "3000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "10000")]
    pub give_up_check_interval_ms: u64,

    #[envconfig(default = "120000")] // 2 minutes
    pub give_up_after_ms: u64,

    #[envconfig(default = "100")]
    pub watermark_scan_interval_ms: u64,

    #[envconfig(default = "100")]
    pub backpressure_interval_ms: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build and validate the per-partition pipeline settings
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let config = PipelineConfig {
            window_capacity: self.window_capacity,
            worker_count: self.worker_count,
            routing_mode: self.routing_mode.parse()?,
            commit_interval: Duration::from_millis(self.commit_interval_ms),
            give_up_check_interval: Duration::from_millis(self.give_up_check_interval_ms),
            give_up_after: Duration::from_millis(self.give_up_after_ms),
            watermark_scan_interval: Duration::from_millis(self.watermark_scan_interval_ms),
            backpressure_interval: Duration::from_millis(self.backpressure_interval_ms),
            max_retries: self.max_retries,
            retry_multiplier: self.retry_multiplier,
            retry_initial_interval: Duration::from_millis(self.retry_initial_interval_ms),
            retry_max_interval: Duration::from_millis(self.retry_max_interval_ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn consumer_config(&self) -> ClientConfig {
        let mut builder = ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_tls(self.kafka_tls);

        if let (Some(username), Some(password)) =
            (&self.kafka_sasl_username, &self.kafka_sasl_password)
        {
            builder = builder.with_sasl_scram_sha512(username, password, self.kafka_tls);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();

        assert_eq!(config.window_capacity, 256);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.routing_mode, RoutingMode::KeyDistribute);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_multiplier, 1.5);
        assert_eq!(config.commit_interval, Duration::from_secs(3));
        assert_eq!(config.give_up_check_interval, Duration::from_secs(10));
        assert_eq!(config.give_up_after, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test_case("key_distribute", RoutingMode::KeyDistribute ; "key distribute")]
    #[test_case("round_robin", RoutingMode::RoundRobin ; "round robin")]
    #[test_case(" Round_Robin ", RoutingMode::RoundRobin ; "case and whitespace")]
    fn test_routing_mode_parse(input: &str, expected: RoutingMode) {
        assert_eq!(input.parse::<RoutingMode>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_routing_mode_rejected() {
        let err = "random".parse::<RoutingMode>().unwrap_err();
        assert_eq!(err, ConfigError::UnknownRoutingMode("random".to_string()));
    }

    #[test_case(PipelineConfig::default().with_window_capacity(0), ConfigError::ZeroCapacity ; "zero capacity")]
    #[test_case(PipelineConfig::default().with_worker_count(0), ConfigError::ZeroWorkers ; "zero workers")]
    #[test_case(PipelineConfig::default().with_retries(3, 0.0), ConfigError::InvalidRetryMultiplier(0.0) ; "zero multiplier")]
    #[test_case(PipelineConfig::default().with_retries(3, -2.0), ConfigError::InvalidRetryMultiplier(-2.0) ; "negative multiplier")]
    #[test_case(PipelineConfig::default().with_commit_interval(Duration::ZERO), ConfigError::ZeroInterval { name: "commit interval" } ; "zero commit interval")]
    #[test_case(PipelineConfig::default().with_give_up(Duration::from_secs(1), Duration::ZERO), ConfigError::ZeroInterval { name: "give up threshold" } ; "zero give up threshold")]
    #[test_case(PipelineConfig::default().with_retry_intervals(Duration::from_secs(2), Duration::from_secs(1)), ConfigError::RetryIntervalsInverted ; "inverted retry intervals")]
    fn test_invalid_pipeline_config(config: PipelineConfig, expected: ConfigError) {
        assert_eq!(config.validate().unwrap_err(), expected);
    }

    #[test]
    fn test_config_from_env_map() {
        let env = HashMap::from([
            ("KAFKA_CONSUMER_TOPIC".to_string(), "clicks".to_string()),
            ("WORKER_COUNT".to_string(), "4".to_string()),
            ("ROUTING_MODE".to_string(), "round_robin".to_string()),
            ("MAX_RETRIES".to_string(), "3".to_string()),
            ("GIVE_UP_AFTER_MS".to_string(), "5000".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.kafka_consumer_topic, "clicks");
        assert_eq!(config.bind_address(), "0.0.0.0:8080");

        let pipeline = config.pipeline_config().unwrap();
        assert_eq!(pipeline.worker_count, 4);
        assert_eq!(pipeline.routing_mode, RoutingMode::RoundRobin);
        assert_eq!(pipeline.max_retries, 3);
        assert_eq!(pipeline.give_up_after, Duration::from_secs(5));
        assert_eq!(pipeline.window_capacity, 256);
    }

    #[test]
    fn test_unparsable_retry_count_rejected() {
        let env = HashMap::from([("MAX_RETRIES".to_string(), "three".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_bad_routing_mode_in_env_rejected() {
        let env = HashMap::from([("ROUTING_MODE".to_string(), "sticky".to_string())]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert!(matches!(
            config.pipeline_config(),
            Err(ConfigError::UnknownRoutingMode(_))
        ));
    }

    #[test]
    fn test_consumer_config_with_sasl() {
        let env = HashMap::from([
            ("KAFKA_SASL_USERNAME".to_string(), "svc".to_string()),
            ("KAFKA_SASL_PASSWORD".to_string(), "secret".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        let client_config = config.consumer_config();

        assert_eq!(client_config.get("sasl.mechanisms"), Some("SCRAM-SHA-512"));
        assert_eq!(client_config.get("security.protocol"), Some("sasl_plaintext"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(client_config.get("auto.offset.reset"), Some("earliest"));
    }
}

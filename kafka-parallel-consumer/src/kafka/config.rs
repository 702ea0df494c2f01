use rdkafka::ClientConfig;

/// Kafka consumer configuration builder with group-consumer defaults.
///
/// Offsets are committed by the pipelines themselves, so auto commit and the
/// automatic offset store are always switched off.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Sets: auto.offset.store=false, auto.commit=false, socket.timeout.ms,
    /// session.timeout.ms, heartbeat.interval.ms, max.poll.interval.ms.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Authenticate with SASL/SCRAM-SHA-512. Overrides the protocol set by `with_tls`.
    pub fn with_sasl_scram_sha512(mut self, username: &str, password: &str, tls: bool) -> Self {
        let protocol = if tls { "sasl_ssl" } else { "sasl_plaintext" };
        self.config
            .set("security.protocol", protocol)
            .set("sasl.mechanisms", "SCRAM-SHA-512")
            .set("sasl.username", username)
            .set("sasl.password", password);
        self
    }

    /// Where to start when the group has no committed offset: `earliest` or `latest`.
    /// The older `oldest`/`newest` spellings are accepted too.
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        let policy = match policy {
            "oldest" => "earliest",
            "newest" => "latest",
            other => other,
        };
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

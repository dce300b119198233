//! Relay configuration with tunable thresholds.

/// Configuration for the relay pipeline.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Accumulated distinct keys that trigger a flush (default: 50)
    pub size_trigger: usize,
    /// Elapsed time in ms that triggers a flush (default: 5000ms)
    pub time_trigger_ms: u64,
    /// Enable per-key conflation; when disabled measurements flow through a
    /// plain dual-trigger flush queue instead (default: true)
    pub conflation_enabled: bool,
    /// How long a producer blocks on a throttled gate before the write is
    /// dropped (default: 1000ms)
    pub drop_timeout_ms: u64,
    /// Capacity of the bounded reprocessing queue (default: 1000)
    pub reprocess_capacity: usize,
    /// Poll interval of the reprocessing worker in ms (default: 1000ms)
    pub reprocess_poll_ms: u64,
    /// Period between heartbeat probes in ms (default: 15000ms)
    pub heartbeat_period_ms: u64,
    /// Timeout of a single heartbeat probe in ms (default: 1000ms)
    pub heartbeat_timeout_ms: u64,
    /// Consecutive probe timeouts that flip the connectivity flag (default: 2)
    pub heartbeat_disconnect_trigger: u64,
    /// Sweep interval of the correlation table in ms (default: 500ms)
    pub sweep_interval_ms: u64,
    /// Host component of heartbeat correlation keys (default: "localhost")
    pub host: String,
    /// Agent component of heartbeat correlation keys (default: "metric-relay")
    pub agent: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            size_trigger: 50,
            time_trigger_ms: 5000,
            conflation_enabled: true,
            drop_timeout_ms: 1000,
            reprocess_capacity: 1000,
            reprocess_poll_ms: 1000,
            heartbeat_period_ms: 15000,
            heartbeat_timeout_ms: 1000,
            heartbeat_disconnect_trigger: 2,
            sweep_interval_ms: 500,
            host: "localhost".to_string(),
            agent: "metric-relay".to_string(),
        }
    }
}

impl RelayConfig {
    /// Create a new config builder.
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// A config tuned for latency: small batches, short flush interval.
    pub fn low_latency() -> Self {
        Self {
            size_trigger: 10,
            time_trigger_ms: 500,
            ..Default::default()
        }
    }

    /// A config tuned for throughput: large batches, long flush interval.
    pub fn high_throughput() -> Self {
        Self {
            size_trigger: 500,
            time_trigger_ms: 15000,
            ..Default::default()
        }
    }

    /// Whether the configured triggers disable buffering entirely.
    ///
    /// With a size trigger below 2 and a time trigger below 1ms the flush
    /// queue degrades to a deliberate pass-through: every add reaches the
    /// receiver immediately.
    pub fn is_bypass(&self) -> bool {
        self.size_trigger < 2 && self.time_trigger_ms < 1
    }
}

/// Builder pattern for RelayConfig.
#[derive(Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Set the size flush trigger (distinct keys).
    pub fn size_trigger(mut self, size: usize) -> Self {
        self.config.size_trigger = size;
        self
    }

    /// Set the time flush trigger in milliseconds.
    pub fn time_trigger_ms(mut self, ms: u64) -> Self {
        self.config.time_trigger_ms = ms;
        self
    }

    /// Enable or disable per-key conflation.
    pub fn conflation_enabled(mut self, enabled: bool) -> Self {
        self.config.conflation_enabled = enabled;
        self
    }

    /// Set how long producers block on a throttled gate.
    pub fn drop_timeout_ms(mut self, ms: u64) -> Self {
        self.config.drop_timeout_ms = ms;
        self
    }

    /// Set the reprocessing queue capacity.
    pub fn reprocess_capacity(mut self, capacity: usize) -> Self {
        self.config.reprocess_capacity = capacity;
        self
    }

    /// Set the reprocessing worker poll interval in milliseconds.
    pub fn reprocess_poll_ms(mut self, ms: u64) -> Self {
        self.config.reprocess_poll_ms = ms;
        self
    }

    /// Set the heartbeat probe period in milliseconds.
    pub fn heartbeat_period_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat_period_ms = ms;
        self
    }

    /// Set the heartbeat probe timeout in milliseconds.
    pub fn heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat_timeout_ms = ms;
        self
    }

    /// Set the consecutive-timeout count that flips connectivity.
    pub fn heartbeat_disconnect_trigger(mut self, count: u64) -> Self {
        self.config.heartbeat_disconnect_trigger = count;
        self
    }

    /// Set the correlation table sweep interval in milliseconds.
    pub fn sweep_interval_ms(mut self, ms: u64) -> Self {
        self.config.sweep_interval_ms = ms;
        self
    }

    /// Set the host component of heartbeat correlation keys.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the agent component of heartbeat correlation keys.
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.config.agent = agent.into();
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RelayConfig {
        self.config
    }
}

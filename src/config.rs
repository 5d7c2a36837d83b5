use serde::Deserialize;

/// Runtime configuration, loaded from `DRIFTQ_`-prefixed environment
/// variables. Every knob has a default so the service starts bare.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Database file path. `None` runs on an in-memory database.
    pub db_path: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Largest delay the queue primitive accepts for a single enqueue.
    /// Longer waits are built by re-chaining.
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,

    /// How long a dequeued envelope stays hidden from other workers.
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,

    /// Send attempts before a message is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_seconds")]
    pub retry_base_delay_seconds: u64,

    /// Fractional jitter applied to retry delays, 0.0 to 1.0.
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Endpoint for the HTTP gateway. Unset falls back to the in-memory
    /// gateway, which records instead of sending.
    pub gateway_url: Option<String>,

    #[serde(default = "default_gateway_timeout_seconds")]
    pub gateway_timeout_seconds: u64,

    /// Local hour-of-day that "tomorrow morning" resolves to.
    #[serde(default = "default_morning_hour")]
    pub morning_hour: u32,

    /// Default recipient UTC offset, used when a request carries none.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("DRIFTQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn max_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_delay_seconds as i64)
    }

    pub fn visibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.visibility_timeout_seconds as i64)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            listen_addr: default_listen_addr(),
            max_delay_seconds: default_max_delay_seconds(),
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
            max_attempts: default_max_attempts(),
            retry_base_delay_seconds: default_retry_base_delay_seconds(),
            retry_jitter: default_retry_jitter(),
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            poll_interval_seconds: default_poll_interval_seconds(),
            gateway_url: None,
            gateway_timeout_seconds: default_gateway_timeout_seconds(),
            morning_hour: default_morning_hour(),
            utc_offset_minutes: 0,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_max_delay_seconds() -> u64 {
    // SQS-compatible bound: 15 minutes.
    900
}

fn default_visibility_timeout_seconds() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_seconds() -> u64 {
    30
}

fn default_retry_jitter() -> f64 {
    0.25
}

fn default_worker_count() -> usize {
    4
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval_seconds() -> u64 {
    1
}

fn default_gateway_timeout_seconds() -> u64 {
    10
}

fn default_morning_hour() -> u32 {
    9
}

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// One file configures all three processes: the broker reads `server`, the
/// ingress and the consumer read `broker` and `http`, and the consumer also
/// reads `worker`.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub http: HttpSettings,
    pub worker: WorkerSettings,
    pub log_level: String,
}

/// Configuration for the broker server.
///
/// Defines the listen address, the accepted credentials and the delivery policy.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub max_connections: usize,
    /// Unacknowledged deliveries older than this are requeued.
    pub ack_timeout_secs: u64,
    /// Deliveries allowed before a failing message is dead-lettered.
    pub max_deliveries: u32,
    pub dead_letter_path: String,
    pub dead_letter_ttl_secs: Option<i64>,
    pub dead_letter_max_per_queue: Option<usize>,
}

/// Where publishers and consumers find the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub request_timeout_ms: u64,
}

impl BrokerSettings {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpSettings {
    pub host: String,
    pub ingress_port: u16,
    pub consumer_port: u16,
}

/// Consumer worker policy.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    pub prefetch: u16,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive connection failures that open the circuit breaker.
    pub failure_threshold: u32,
    pub breaker_open_secs: u64,
    /// Consecutive failed connection attempts before giving up; 0 retries forever.
    pub max_attempts: u32,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub http: Option<PartialHttpSettings>,
    pub worker: Option<PartialWorkerSettings>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_connections: Option<usize>,
    pub ack_timeout_secs: Option<u64>,
    pub max_deliveries: Option<u32>,
    pub dead_letter_path: Option<String>,
    pub dead_letter_ttl_secs: Option<i64>,
    pub dead_letter_max_per_queue: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialHttpSettings {
    pub host: Option<String>,
    pub ingress_port: Option<u16>,
    pub consumer_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialWorkerSettings {
    pub prefetch: Option<u16>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub breaker_open_secs: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl PartialServerSettings {
    pub fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            username: self.username.unwrap_or(default.username),
            password: self.password.unwrap_or(default.password),
            max_connections: self.max_connections.unwrap_or(default.max_connections),
            ack_timeout_secs: self.ack_timeout_secs.unwrap_or(default.ack_timeout_secs),
            max_deliveries: self.max_deliveries.unwrap_or(default.max_deliveries),
            dead_letter_path: self.dead_letter_path.unwrap_or(default.dead_letter_path),
            dead_letter_ttl_secs: self.dead_letter_ttl_secs.or(default.dead_letter_ttl_secs),
            dead_letter_max_per_queue: self
                .dead_letter_max_per_queue
                .or(default.dead_letter_max_per_queue),
        }
    }
}

impl PartialBrokerSettings {
    pub fn merge(self, default: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            username: self.username.unwrap_or(default.username),
            password: self.password.unwrap_or(default.password),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(default.request_timeout_ms),
        }
    }
}

impl PartialHttpSettings {
    pub fn merge(self, default: HttpSettings) -> HttpSettings {
        HttpSettings {
            host: self.host.unwrap_or(default.host),
            ingress_port: self.ingress_port.unwrap_or(default.ingress_port),
            consumer_port: self.consumer_port.unwrap_or(default.consumer_port),
        }
    }
}

impl PartialWorkerSettings {
    pub fn merge(self, default: WorkerSettings) -> WorkerSettings {
        WorkerSettings {
            prefetch: self.prefetch.unwrap_or(default.prefetch),
            initial_backoff_ms: self.initial_backoff_ms.unwrap_or(default.initial_backoff_ms),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(default.max_backoff_ms),
            failure_threshold: self.failure_threshold.unwrap_or(default.failure_threshold),
            breaker_open_secs: self.breaker_open_secs.unwrap_or(default.breaker_open_secs),
            max_attempts: self.max_attempts.unwrap_or(default.max_attempts),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            max_connections: 1000,
            ack_timeout_secs: 30,
            max_deliveries: 5,
            dead_letter_path: "relaymq_dead_letters".to_string(),
            dead_letter_ttl_secs: Some(7 * 24 * 3600),
            dead_letter_max_per_queue: Some(1000),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ingress_port: 8080,
            consumer_port: 8081,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            initial_backoff_ms: 200,
            max_backoff_ms: 30_000,
            failure_threshold: 5,
            breaker_open_secs: 30,
            max_attempts: 0,
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            broker: BrokerSettings::default(),
            http: HttpSettings::default(),
            worker: WorkerSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

mod settings;


use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, HttpSettings, ServerSettings, Settings, WorkerSettings};

/// Name of the queue shared by the ingress and the consumer.
pub const DEMO_QUEUE: &str = "demo-queue";

/// Loads the configuration from the default file and environment variables.
///
/// Environment variables use the `RELAY` prefix and `__` as the nesting
/// separator, e.g. `RELAY__BROKER__HOST=rabbit` or `RELAY__LOG_LEVEL=debug`.
/// Anything not provided falls back to `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        server: match partial.server {
            Some(s) => s.merge(default.server),
            None => default.server,
        },
        broker: match partial.broker {
            Some(b) => b.merge(default.broker),
            None => default.broker,
        },
        http: match partial.http {
            Some(h) => h.merge(default.http),
            None => default.http,
        },
        worker: match partial.worker {
            Some(w) => w.merge(default.worker),
            None => default.worker,
        },
        log_level: partial.log_level.unwrap_or(default.log_level),
    })
}

use std::time;

use envconfig::Envconfig;

use mesh_common::config::{EnvMsDuration, EnvSecsDuration, NonEmptyString};
use mesh_janitor::config::RetentionConfig;
use mesh_worker::config::WebhookConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(nested = true)]
    pub broker: BrokerConfig,

    #[envconfig(nested = true)]
    pub dedup: DedupConfig,

    #[envconfig(nested = true)]
    pub webhook: WebhookConfig,

    #[envconfig(default = "64")]
    pub live_viewer_buffer: usize,

    /// Run the retention scheduler inside this process.
    #[envconfig(default = "true")]
    pub retention_enabled: bool,

    #[envconfig(nested = true)]
    pub retention: RetentionConfig,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct BrokerConfig {
    #[envconfig(from = "BROKER_HOST", default = "localhost")]
    pub host: String,

    #[envconfig(from = "BROKER_PORT", default = "1883")]
    pub port: u16,

    #[envconfig(from = "BROKER_USERNAME")]
    pub username: Option<String>,

    #[envconfig(from = "BROKER_PASSWORD")]
    pub password: Option<String>,

    #[envconfig(from = "BROKER_CLIENT_ID", default = "mesh-ingest")]
    pub client_id: NonEmptyString,

    #[envconfig(from = "BROKER_TOPIC_PREFIX", default = "meshcore")]
    pub topic_prefix: NonEmptyString,

    #[envconfig(from = "BROKER_KEEP_ALIVE_SECS", default = "30")]
    pub keep_alive_secs: u64,

    #[envconfig(from = "BROKER_RECONNECT_INITIAL_MS", default = "500")]
    pub reconnect_initial: EnvMsDuration,

    #[envconfig(from = "BROKER_RECONNECT_MAX_MS", default = "30000")]
    pub reconnect_max: EnvMsDuration,

    /// Give up after this many consecutive failed connection attempts. Unset retries forever.
    #[envconfig(from = "BROKER_MAX_RECONNECT_ATTEMPTS")]
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct DedupConfig {
    #[envconfig(from = "DEDUP_WINDOW_SECS", default = "10")]
    pub window: EnvSecsDuration,

    /// How long a key's unit lingers with nothing open before it retires.
    #[envconfig(from = "DEDUP_IDLE_SECS", default = "60")]
    pub idle_secs: u64,

    #[envconfig(from = "DEDUP_PERSIST_ATTEMPTS", default = "3")]
    pub persist_attempts: u32,

    #[envconfig(from = "DEDUP_PERSIST_RETRY_MS", default = "200")]
    pub persist_retry: EnvMsDuration,

    /// Capacity of the channel between the broker subscriber and the deduplicator.
    #[envconfig(from = "DEDUP_INPUT_CAPACITY", default = "1024")]
    pub input_capacity: usize,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3310");
        assert_eq!(config.broker.topic_prefix.as_str(), "meshcore");
        assert_eq!(config.broker.port, 1883);
        assert!(config.broker.max_reconnect_attempts.is_none());
        assert_eq!(config.dedup.window.to_std(), time::Duration::from_secs(10));
        assert_eq!(config.dedup.persist_attempts, 3);
        assert_eq!(config.live_viewer_buffer, 64);
        assert!(config.retention_enabled);
        assert!(config.export_prometheus);
        assert_eq!(config.shutdown_timeout(), time::Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_abort() {
        for (key, value) in [
            ("BROKER_PORT", "not-a-port"),
            ("BROKER_TOPIC_PREFIX", ""),
            ("DEDUP_WINDOW_SECS", "-3"),
            ("DEDUP_WINDOW_SECS", "9223372036854776"),
            ("RETENTION_INTERVAL_HOURS", "0"),
            ("RETENTION_INTERVAL_HOURS", "18446744073709551615"),
            ("WEBHOOK_TIMEOUT", "10s"),
        ] {
            let env = HashMap::from([(key.to_owned(), value.to_owned())]);
            assert!(
                Config::init_from_hashmap(&env).is_err(),
                "{key}={value:?} should be rejected"
            );
        }
    }
}

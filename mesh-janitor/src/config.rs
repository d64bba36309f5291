use std::collections::HashMap;

use envconfig::Envconfig;

use mesh_common::config::EnvHoursDuration;
use mesh_common::event::EventCategory;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3311")]
    pub port: u16,

    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(nested = true)]
    pub retention: RetentionConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetentionConfig {
    #[envconfig(from = "DATA_RETENTION_ENABLED", default = "true")]
    pub data_retention_enabled: bool,

    #[envconfig(from = "DATA_RETENTION_DAYS", default = "30")]
    pub data_retention_days: u32,

    #[envconfig(from = "RETENTION_ADVERTISEMENT_DAYS")]
    pub advertisement_days: Option<u32>,

    #[envconfig(from = "RETENTION_MESSAGE_DAYS")]
    pub message_days: Option<u32>,

    #[envconfig(from = "RETENTION_TELEMETRY_DAYS")]
    pub telemetry_days: Option<u32>,

    #[envconfig(from = "RETENTION_TRACE_DAYS")]
    pub trace_days: Option<u32>,

    #[envconfig(from = "RETENTION_LOG_DAYS")]
    pub log_days: Option<u32>,

    #[envconfig(from = "NODE_CLEANUP_ENABLED", default = "true")]
    pub node_cleanup_enabled: bool,

    #[envconfig(from = "NODE_CLEANUP_DAYS", default = "7")]
    pub node_cleanup_days: u32,

    #[envconfig(from = "RETENTION_INTERVAL_HOURS", default = "24")]
    pub interval: EnvHoursDuration,

    #[envconfig(from = "RETENTION_DRY_RUN", default = "false")]
    pub dry_run: bool,
}

impl RetentionConfig {
    /// Per-category overrides of `data_retention_days` that are set.
    pub fn overrides(&self) -> HashMap<EventCategory, u32> {
        [
            (EventCategory::Advertisement, self.advertisement_days),
            (EventCategory::Message, self.message_days),
            (EventCategory::Telemetry, self.telemetry_days),
            (EventCategory::Trace, self.trace_days),
            (EventCategory::Log, self.log_days),
        ]
        .into_iter()
        .filter_map(|(category, days)| days.map(|days| (category, days)))
        .collect()
    }
}

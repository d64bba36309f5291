use envconfig::Envconfig;

use mesh_common::config::EnvMsDuration;
use mesh_common::retry::RetryPolicy;

/// Webhook targets and delivery tuning. Every URL is optional; an unset or blank URL means the
/// corresponding events are not relayed.
#[derive(Envconfig, Clone, Debug)]
pub struct WebhookConfig {
    #[envconfig(from = "WEBHOOK_EVENTS_URL")]
    pub events_url: Option<String>,

    #[envconfig(from = "WEBHOOK_EVENTS_SECRET")]
    pub events_secret: Option<String>,

    #[envconfig(from = "WEBHOOK_ADVERTISEMENT_URL")]
    pub advertisement_url: Option<String>,

    #[envconfig(from = "WEBHOOK_ADVERTISEMENT_SECRET")]
    pub advertisement_secret: Option<String>,

    #[envconfig(from = "WEBHOOK_MESSAGE_URL")]
    pub message_url: Option<String>,

    #[envconfig(from = "WEBHOOK_MESSAGE_SECRET")]
    pub message_secret: Option<String>,

    #[envconfig(from = "WEBHOOK_CHANNEL_MESSAGE_URL")]
    pub channel_message_url: Option<String>,

    #[envconfig(from = "WEBHOOK_CHANNEL_MESSAGE_SECRET")]
    pub channel_message_secret: Option<String>,

    #[envconfig(from = "WEBHOOK_DIRECT_MESSAGE_URL")]
    pub direct_message_url: Option<String>,

    #[envconfig(from = "WEBHOOK_DIRECT_MESSAGE_SECRET")]
    pub direct_message_secret: Option<String>,

    #[envconfig(from = "WEBHOOK_TIMEOUT", default = "10000")]
    pub timeout: EnvMsDuration,

    #[envconfig(from = "WEBHOOK_MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "WEBHOOK_RETRY_BASE", default = "1000")]
    pub retry_base: EnvMsDuration,

    #[envconfig(from = "WEBHOOK_RETRY_BACKOFF", default = "2.0")]
    pub retry_backoff: f64,

    #[envconfig(from = "WEBHOOK_RETRY_MAX_INTERVAL", default = "60000")]
    pub retry_max_interval: EnvMsDuration,

    #[envconfig(from = "WEBHOOK_QUEUE_CAPACITY", default = "1024")]
    pub queue_capacity: usize,

    #[envconfig(from = "WEBHOOK_MAX_CONCURRENT", default = "8")]
    pub max_concurrent: usize,
}

impl WebhookConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.retry_backoff, self.retry_base.0)
            .max_retries(self.max_retries)
            .maximum_interval(self.retry_max_interval.0)
            .provide()
    }
}

use reqwest::header::HeaderValue;
use reqwest::Url;

use mesh_common::event::EventCategory;
use mesh_common::model::Published;

use crate::config::WebhookConfig;
use crate::error::WebhookError;

/// Event names whose per-kind message overrides apply.
const CHANNEL_MESSAGE_EVENT: &str = "channel_msg_recv";
const DIRECT_MESSAGE_EVENT: &str = "contact_msg_recv";

/// A URL events are posted to, with the shared secret sent alongside.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WebhookTarget {
    pub url: Url,
    pub secret: Option<HeaderValue>,
}

impl WebhookTarget {
    /// Build a target from raw configuration. Blank URLs are treated as not configured.
    pub fn parse(url: Option<&str>, secret: Option<&str>) -> Result<Option<Self>, WebhookError> {
        let url = match url.map(str::trim) {
            Some(url) if !url.is_empty() => url,
            _ => return Ok(None),
        };

        let parsed = Url::parse(url).map_err(|error| WebhookError::ParseUrlError {
            url: url.to_owned(),
            error,
        })?;

        let secret = match secret.filter(|s| !s.is_empty()) {
            Some(secret) => {
                let mut value = HeaderValue::from_str(secret).map_err(|_| {
                    WebhookError::ParseSecretError {
                        url: url.to_owned(),
                    }
                })?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        Ok(Some(Self {
            url: parsed,
            secret,
        }))
    }
}

/// Picks the target for an event, most specific override first.
#[derive(Debug, Clone, Default)]
pub struct TargetResolver {
    events: Option<WebhookTarget>,
    advertisement: Option<WebhookTarget>,
    message: Option<WebhookTarget>,
    channel_message: Option<WebhookTarget>,
    direct_message: Option<WebhookTarget>,
}

impl TargetResolver {
    pub fn from_config(config: &WebhookConfig) -> Result<Self, WebhookError> {
        Ok(Self {
            events: WebhookTarget::parse(
                config.events_url.as_deref(),
                config.events_secret.as_deref(),
            )?,
            advertisement: WebhookTarget::parse(
                config.advertisement_url.as_deref(),
                config.advertisement_secret.as_deref(),
            )?,
            message: WebhookTarget::parse(
                config.message_url.as_deref(),
                config.message_secret.as_deref(),
            )?,
            channel_message: WebhookTarget::parse(
                config.channel_message_url.as_deref(),
                config.channel_message_secret.as_deref(),
            )?,
            direct_message: WebhookTarget::parse(
                config.direct_message_url.as_deref(),
                config.direct_message_secret.as_deref(),
            )?,
        })
    }

    pub fn resolve(&self, published: &Published) -> Option<&WebhookTarget> {
        let events = self.events.as_ref();

        match published.category() {
            EventCategory::Advertisement => self.advertisement.as_ref().or(events),
            EventCategory::Message => {
                let specific = match published.event_name() {
                    CHANNEL_MESSAGE_EVENT => self.channel_message.as_ref(),
                    DIRECT_MESSAGE_EVENT => self.direct_message.as_ref(),
                    _ => None,
                };
                specific.or(self.message.as_ref()).or(events)
            }
            _ => events,
        }
    }

    /// Every distinct configured target.
    pub fn targets(&self) -> Vec<WebhookTarget> {
        let mut targets: Vec<WebhookTarget> = Vec::new();
        for target in [
            &self.events,
            &self.advertisement,
            &self.message,
            &self.channel_message,
            &self.direct_message,
        ]
        .into_iter()
        .flatten()
        {
            if !targets.contains(target) {
                targets.push(target.clone());
            }
        }
        targets
    }
}

//! # Event
//!
//! Typed mesh events decoded from broker topics and their JSON payloads.
//!
//! Broker topics follow `<prefix>/<public_key>/event/<event_name>`, where `public_key` identifies
//! the gateway that overheard the traffic and republished it. Every known `event_name` decodes
//! into its own variant of `EventKind`; anything else is kept as `EventKind::Other` so that new
//! firmware events are still persisted and relayed.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Enumeration of reasons a broker message could not be turned into a `MeshEvent`.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("topic {0:?} does not match <prefix>/<public_key>/event/<event_name>")]
    InvalidTopic(String),
    #[error("{0:?} is not a valid public key")]
    InvalidPublicKey(String),
    #[error("payload for {event_name} is not valid JSON: {error}")]
    InvalidJson {
        event_name: String,
        error: serde_json::Error,
    },
    #[error("payload for {0} is not a JSON object")]
    NotAnObject(String),
    #[error("payload for {event_name} does not match its schema: {error}")]
    InvalidSchema {
        event_name: String,
        error: serde_json::Error,
    },
}

impl ParseError {
    /// Short, stable label used when counting dropped messages.
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::InvalidTopic(_) => "invalid_topic",
            ParseError::InvalidPublicKey(_) => "invalid_public_key",
            ParseError::InvalidJson { .. } => "invalid_json",
            ParseError::NotAnObject(_) => "not_an_object",
            ParseError::InvalidSchema { .. } => "invalid_schema",
        }
    }
}

/// A mesh node identifier: 32 bytes, hex-encoded and normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(String);

pub const PUBLIC_KEY_HEX_LEN: usize = 64;

impl PublicKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for PublicKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == PUBLIC_KEY_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(PublicKey(s.to_ascii_lowercase()))
        } else {
            Err(ParseError::InvalidPublicKey(s.to_owned()))
        }
    }
}

impl TryFrom<String> for PublicKey {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PublicKey::from_str(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retention and relay category of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Advertisement,
    Message,
    Telemetry,
    Trace,
    Log,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Advertisement,
        EventCategory::Message,
        EventCategory::Telemetry,
        EventCategory::Trace,
        EventCategory::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Advertisement => "advertisement",
            EventCategory::Message => "message",
            EventCategory::Telemetry => "telemetry",
            EventCategory::Trace => "trace",
            EventCategory::Log => "log",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "advertisement" => Ok(EventCategory::Advertisement),
            "message" => Ok(EventCategory::Message),
            "telemetry" => Ok(EventCategory::Telemetry),
            "trace" => Ok(EventCategory::Trace),
            "log" => Ok(EventCategory::Log),
            invalid => Err(format!("{invalid} is not a valid EventCategory")),
        }
    }
}

/// The two identifying parts of an event topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// The gateway that published the message.
    pub public_key: PublicKey,
    pub event_name: String,
}

/// The single wildcard subscription covering every event topic under `prefix`.
pub fn subscription_filter(prefix: &str) -> String {
    format!("{}/+/event/+", prefix.trim_end_matches('/'))
}

/// Split a topic of the shape `<prefix>/<public_key>/event/<event_name>`.
pub fn parse_topic(prefix: &str, topic: &str) -> Result<Topic, ParseError> {
    let invalid = || ParseError::InvalidTopic(topic.to_owned());

    let rest = topic
        .strip_prefix(prefix.trim_end_matches('/'))
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(invalid)?;

    let mut parts = rest.split('/');
    let (Some(key), Some("event"), Some(event_name), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    if event_name.is_empty() {
        return Err(invalid());
    }

    Ok(Topic {
        public_key: key.parse()?,
        event_name: event_name.to_owned(),
    })
}

/// Advertisement types arrive either as a firmware enum number or as a name.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::invalid_type(
            serde::de::Unexpected::Other(&other.to_string()),
            &"a string or a number",
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdvertisementPayload {
    /// The advertising node, as opposed to the gateway named in the topic.
    pub public_key: PublicKey,
    #[serde(default, alias = "adv_name")]
    pub name: Option<String>,
    #[serde(default, alias = "type", deserialize_with = "string_or_number")]
    pub adv_type: Option<String>,
    #[serde(default)]
    pub flags: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelMessage {
    #[serde(default)]
    pub channel_idx: Option<u32>,
    pub text: String,
    #[serde(default)]
    pub path_len: Option<i64>,
    #[serde(default, alias = "SNR")]
    pub snr: Option<f64>,
    #[serde(default)]
    pub sender_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DirectMessage {
    #[serde(default)]
    pub pubkey_prefix: Option<String>,
    pub text: String,
    #[serde(default)]
    pub path_len: Option<i64>,
    #[serde(default, alias = "SNR")]
    pub snr: Option<f64>,
    #[serde(default)]
    pub sender_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryResponse {
    #[serde(default, alias = "pubkey_prefix")]
    pub node_public_key: Option<String>,
    #[serde(default)]
    pub lpp_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TraceData {
    #[serde(default)]
    pub tag: Option<u64>,
    #[serde(default)]
    pub hop_count: Option<u32>,
    #[serde(default)]
    pub path_hashes: Vec<Value>,
    #[serde(default)]
    pub snr_values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusResponse {
    #[serde(default, alias = "pubkey_prefix")]
    pub node_public_key: Option<String>,
    #[serde(default)]
    pub status: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatteryReport {
    #[serde(default)]
    pub battery_voltage: Option<f64>,
    #[serde(default)]
    pub battery_percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PathUpdate {
    #[serde(default)]
    pub node_public_key: Option<String>,
    #[serde(default)]
    pub hop_count: Option<u32>,
}

/// One variant per known event name, plus a passthrough for unrecognized ones.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Advertisement(AdvertisementPayload),
    ChannelMessage(ChannelMessage),
    DirectMessage(DirectMessage),
    Telemetry(TelemetryResponse),
    Trace(TraceData),
    Status(StatusResponse),
    Battery(BatteryReport),
    PathUpdated(PathUpdate),
    Other(String),
}

impl EventKind {
    pub fn event_name(&self) -> &str {
        match self {
            EventKind::Advertisement(_) => "advertisement",
            EventKind::ChannelMessage(_) => "channel_msg_recv",
            EventKind::DirectMessage(_) => "contact_msg_recv",
            EventKind::Telemetry(_) => "telemetry_response",
            EventKind::Trace(_) => "trace_data",
            EventKind::Status(_) => "status_response",
            EventKind::Battery(_) => "battery",
            EventKind::PathUpdated(_) => "path_updated",
            EventKind::Other(name) => name,
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::Advertisement(_) => EventCategory::Advertisement,
            EventKind::ChannelMessage(_) | EventKind::DirectMessage(_) => EventCategory::Message,
            EventKind::Telemetry(_) => EventCategory::Telemetry,
            EventKind::Trace(_) => EventCategory::Trace,
            EventKind::Status(_)
            | EventKind::Battery(_)
            | EventKind::PathUpdated(_)
            | EventKind::Other(_) => EventCategory::Log,
        }
    }
}

fn typed<T: serde::de::DeserializeOwned>(
    event_name: &str,
    payload: &Map<String, Value>,
) -> Result<T, ParseError> {
    serde_json::from_value(Value::Object(payload.clone())).map_err(|error| {
        ParseError::InvalidSchema {
            event_name: event_name.to_owned(),
            error,
        }
    })
}

/// A broker message decoded into its typed form. The original JSON object is kept alongside
/// so that persistence and relays forward exactly what the gateway published.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshEvent {
    /// The gateway that overheard and republished the event.
    pub receiver: PublicKey,
    /// Local receipt time, stamped when the message was read off the broker connection.
    pub received_at: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: Map<String, Value>,
}

impl MeshEvent {
    pub fn decode(
        topic: Topic,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<MeshEvent, ParseError> {
        let name = topic.event_name;
        let value: Value =
            serde_json::from_slice(payload).map_err(|error| ParseError::InvalidJson {
                event_name: name.clone(),
                error,
            })?;
        let Value::Object(payload) = value else {
            return Err(ParseError::NotAnObject(name));
        };

        let kind = match name.as_str() {
            "advertisement" => EventKind::Advertisement(typed(&name, &payload)?),
            "channel_msg_recv" => EventKind::ChannelMessage(typed(&name, &payload)?),
            "contact_msg_recv" => EventKind::DirectMessage(typed(&name, &payload)?),
            "telemetry_response" => EventKind::Telemetry(typed(&name, &payload)?),
            "trace_data" => EventKind::Trace(typed(&name, &payload)?),
            "status_response" => EventKind::Status(typed(&name, &payload)?),
            "battery" => EventKind::Battery(typed(&name, &payload)?),
            "path_updated" => EventKind::PathUpdated(typed(&name, &payload)?),
            _ => EventKind::Other(name),
        };

        Ok(MeshEvent {
            receiver: topic.public_key,
            received_at,
            kind,
            payload,
        })
    }

    pub fn event_name(&self) -> &str {
        self.kind.event_name()
    }

    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }
}

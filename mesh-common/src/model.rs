use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::event::{EventCategory, EventKind, MeshEvent, PublicKey};

/// A single gateway's report of a node advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementEvent {
    pub sender: PublicKey,
    pub name: Option<String>,
    pub adv_type: Option<String>,
    pub flags: Option<u32>,
    pub receiver: PublicKey,
    pub received_at: DateTime<Utc>,
}

impl AdvertisementEvent {
    /// Split an advertisement out of a decoded event, or hand the event back untouched.
    pub fn from_mesh_event(event: MeshEvent) -> Result<AdvertisementEvent, MeshEvent> {
        match event.kind {
            EventKind::Advertisement(advert) => Ok(AdvertisementEvent {
                sender: advert.public_key,
                name: advert.name,
                adv_type: advert.adv_type,
                flags: advert.flags,
                receiver: event.receiver,
                received_at: event.received_at,
            }),
            _ => Err(event),
        }
    }
}

/// A `last_seen` bump for a node, optionally carrying what it declared about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub public_key: PublicKey,
    pub seen_at: DateTime<Utc>,
    pub name: Option<String>,
    pub adv_type: Option<String>,
    pub flags: Option<u32>,
}

impl NodeUpdate {
    pub fn seen(public_key: PublicKey, seen_at: DateTime<Utc>) -> Self {
        Self {
            public_key,
            seen_at,
            name: None,
            adv_type: None,
            flags: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub public_key: PublicKey,
    pub name: Option<String>,
    pub adv_type: Option<String>,
    pub flags: Option<u32>,
    pub first_seen: Option<DateTime<Utc>>,
    /// `None` for nodes only known through out-of-band tagging. Those are never cleaned up.
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeIdentity {
    /// A node that has never been observed on the mesh.
    pub fn tagged(public_key: PublicKey) -> Self {
        Self {
            public_key,
            name: None,
            adv_type: None,
            flags: None,
            first_seen: None,
            last_seen: None,
        }
    }

    /// Apply an update. `last_seen` only moves forward, and declared fields from an update
    /// older than what we already saw do not overwrite newer ones.
    pub fn touch(&mut self, update: &NodeUpdate) {
        let is_newest = self.last_seen.map_or(true, |last| update.seen_at >= last);

        if is_newest {
            self.last_seen = Some(update.seen_at);
            if update.name.is_some() {
                self.name.clone_from(&update.name);
            }
            if update.adv_type.is_some() {
                self.adv_type.clone_from(&update.adv_type);
            }
            if update.flags.is_some() {
                self.flags = update.flags;
            }
        }

        self.first_seen = Some(match self.first_seen {
            Some(first) => first.min(update.seen_at),
            None => update.seen_at,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverObservation {
    pub public_key: PublicKey,
    pub received_at: DateTime<Utc>,
}

/// One canonical observation of an advertisement, merged from every gateway that heard it
/// within the dedup window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub public_key: PublicKey,
    pub name: Option<String>,
    pub adv_type: Option<String>,
    pub flags: Option<u32>,
    pub window_start: DateTime<Utc>,
    pub receivers: Vec<ReceiverObservation>,
}

impl Sighting {
    pub fn open(report: &AdvertisementEvent) -> Self {
        Self {
            public_key: report.sender.clone(),
            name: report.name.clone(),
            adv_type: report.adv_type.clone(),
            flags: report.flags,
            window_start: report.received_at,
            receivers: vec![ReceiverObservation {
                public_key: report.receiver.clone(),
                received_at: report.received_at,
            }],
        }
    }

    /// Whether a report received at `at` still belongs to this sighting. The window is anchored
    /// at the first report and does not slide.
    pub fn accepts(&self, at: DateTime<Utc>, window: Duration) -> bool {
        at - self.window_start <= window
    }

    /// Merge a report into this sighting. Returns false when the receiver was already recorded.
    pub fn observe(&mut self, report: &AdvertisementEvent) -> bool {
        if self.name.is_none() {
            self.name.clone_from(&report.name);
        }
        if self.adv_type.is_none() {
            self.adv_type.clone_from(&report.adv_type);
        }
        if self.flags.is_none() {
            self.flags = report.flags;
        }

        if self.has_receiver(&report.receiver) {
            return false;
        }

        self.receivers.push(ReceiverObservation {
            public_key: report.receiver.clone(),
            received_at: report.received_at,
        });
        true
    }

    pub fn has_receiver(&self, receiver: &PublicKey) -> bool {
        self.receivers.iter().any(|r| &r.public_key == receiver)
    }

    /// The sender update applied when this sighting closes.
    pub fn node_update(&self) -> NodeUpdate {
        NodeUpdate {
            public_key: self.public_key.clone(),
            seen_at: self.window_start,
            name: self.name.clone(),
            adv_type: self.adv_type.clone(),
            flags: self.flags,
        }
    }

    pub fn payload(&self) -> Value {
        json!({
            "public_key": self.public_key,
            "name": self.name,
            "adv_type": self.adv_type,
            "flags": self.flags,
            "window_start": self.window_start,
            "receivers": self.receivers,
        })
    }
}

/// A persisted, non-advertisement event tagged with the gateway that received it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub category: EventCategory,
    pub event_name: String,
    pub receiver: PublicKey,
    pub payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl From<MeshEvent> for EventRecord {
    fn from(event: MeshEvent) -> Self {
        EventRecord {
            category: event.category(),
            event_name: event.event_name().to_owned(),
            receiver: event.receiver,
            payload: event.payload,
            received_at: event.received_at,
        }
    }
}

/// Anything the pipeline hands to its downstream consumers once it is durable.
#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    Sighting(Sighting),
    Event(EventRecord),
}

impl Published {
    pub fn event_name(&self) -> &str {
        match self {
            Published::Sighting(_) => "advertisement",
            Published::Event(record) => &record.event_name,
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Published::Sighting(_) => EventCategory::Advertisement,
            Published::Event(record) => record.category,
        }
    }

    /// The advertising node for sightings, the receiving gateway otherwise.
    pub fn public_key(&self) -> &PublicKey {
        match self {
            Published::Sighting(sighting) => &sighting.public_key,
            Published::Event(record) => &record.receiver,
        }
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        match self {
            Published::Sighting(sighting) => sighting.window_start,
            Published::Event(record) => record.received_at,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Published::Sighting(sighting) => sighting.payload(),
            Published::Event(record) => Value::Object(record.payload.clone()),
        }
    }
}

//! Live fan-out of published events to WebSocket viewers.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info};

use mesh_common::event::PublicKey;
use mesh_common::model::Published;

/// The frame every viewer receives.
#[derive(Debug, Serialize)]
pub struct LiveFrame<'a> {
    pub event_name: &'a str,
    pub public_key: &'a PublicKey,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl<'a> From<&'a Published> for LiveFrame<'a> {
    fn from(published: &'a Published) -> Self {
        Self {
            event_name: published.event_name(),
            public_key: published.public_key(),
            payload: published.payload(),
            received_at: published.received_at(),
        }
    }
}

type Viewers = HashMap<u64, mpsc::Sender<Arc<str>>>;

/// Registry of connected viewers. Each viewer gets a bounded buffer; a viewer whose buffer is
/// full is disconnected instead of slowing down the broadcast.
#[derive(Clone)]
pub struct LiveHub {
    viewers: Arc<Mutex<Viewers>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl LiveHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            viewers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            buffer: buffer.max(1),
        }
    }

    fn viewers(&self) -> MutexGuard<'_, Viewers> {
        self.viewers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a viewer, returning its id and the receiving end of its buffer. The receiver
    /// yields `None` once the viewer is disconnected.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let count = {
            let mut viewers = self.viewers();
            viewers.insert(id, tx);
            viewers.len()
        };
        metrics::gauge!("live_viewers").set(count as f64);

        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let count = {
            let mut viewers = self.viewers();
            viewers.remove(&id);
            viewers.len()
        };
        metrics::gauge!("live_viewers").set(count as f64);
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers().len()
    }

    /// Send a frame to every viewer without waiting on any of them.
    pub fn broadcast(&self, published: &Published) {
        let frame: Arc<str> = match serde_json::to_string(&LiveFrame::from(published)) {
            Ok(frame) => frame.into(),
            Err(e) => {
                error!("failed to serialize live frame: {}", e);
                return;
            }
        };

        let mut viewers = self.viewers();
        let mut sent = 0u64;
        let mut disconnected = 0u64;

        viewers.retain(|id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => {
                sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                info!(viewer = id, "live viewer is too slow, disconnecting");
                disconnected += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(viewer = id, "live viewer went away");
                false
            }
        });

        metrics::counter!("live_frames_sent_total").increment(sent);
        if disconnected > 0 {
            metrics::counter!("live_viewers_disconnected_total").increment(disconnected);
        }
        metrics::gauge!("live_viewers").set(viewers.len() as f64);
    }

    /// Disconnect every viewer.
    pub fn close_all(&self) {
        let mut viewers = self.viewers();
        if !viewers.is_empty() {
            info!(viewers = viewers.len(), "closing live viewers");
        }
        viewers.clear();
        metrics::gauge!("live_viewers").set(0.0);
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<LiveHub>) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, hub))
}

async fn serve_viewer(socket: WebSocket, hub: LiveHub) {
    let (id, mut frames) = hub.subscribe();
    debug!(viewer = id, "live viewer connected");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
        // The hub dropped us: either too slow or shutting down.
        sender.send(Message::Close(None)).await.ok();
    });

    // Viewers have nothing to say, so incoming frames are only read to notice the close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unsubscribe(id);
    debug!(viewer = id, "live viewer disconnected");
}

//! Merges the reports of one advertisement heard by several gateways into a single sighting.
//!
//! A dispatcher task owns the table of units, one per public key. Each unit is the only place
//! where that key's open sighting lives, so reports for the same key are handled strictly in
//! order while distinct keys proceed in parallel. Non-advertisement events travel through the
//! unit of the gateway that received them, which keeps per-gateway order without ever blocking
//! the dispatcher on persistence.
use std::collections::HashMap;
use std::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info};

use mesh_common::event::{EventKind, MeshEvent, PublicKey};
use mesh_common::model::{AdvertisementEvent, EventRecord, Sighting};

use crate::config::DedupConfig;
use crate::error::IngestError;
use crate::sink::SightingSink;

/// Cheap handle used to feed decoded events into the deduplicator. The deduplicator flushes
/// and stops once every handle is dropped.
#[derive(Clone)]
pub struct DedupHandle {
    tx: mpsc::Sender<MeshEvent>,
    open_units: Arc<AtomicUsize>,
}

impl DedupHandle {
    /// Hand an event over, waiting only if the dispatcher's input is full.
    pub async fn submit(&self, event: MeshEvent) -> Result<(), IngestError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| IngestError::DeduplicatorClosed)
    }

    /// Number of keys that currently own a unit.
    pub fn open_units(&self) -> usize {
        self.open_units.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct UnitSettings {
    window: chrono::Duration,
    window_timeout: time::Duration,
    idle: time::Duration,
    sink: Arc<dyn SightingSink>,
}

pub struct Deduplicator;

impl Deduplicator {
    /// Start the dispatcher. The returned `JoinHandle` completes after every open sighting
    /// was flushed and every unit drained.
    pub fn spawn(
        config: &DedupConfig,
        sink: Arc<dyn SightingSink>,
    ) -> (DedupHandle, JoinHandle<()>) {
        let settings = UnitSettings {
            window: config.window.0,
            window_timeout: config.window.to_std(),
            idle: time::Duration::from_secs(config.idle_secs),
            sink,
        };

        let (tx, rx) = mpsc::channel(config.input_capacity.max(1));
        let open_units = Arc::new(AtomicUsize::new(0));
        let (retire_tx, retire_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            settings,
            units: HashMap::new(),
            tasks: JoinSet::new(),
            next_id: 0,
            open_units: open_units.clone(),
            retire_tx,
            retire_rx,
        };

        let handle = tokio::spawn(dispatcher.run(rx));
        (DedupHandle { tx, open_units }, handle)
    }
}

/// Sent by a unit that has been idle with nothing open. `processed` lets the dispatcher tell
/// whether messages are still on their way to it.
struct Retire {
    key: PublicKey,
    id: u64,
    processed: u64,
}

struct UnitHandle {
    id: u64,
    tx: mpsc::UnboundedSender<MeshEvent>,
    sent: u64,
}

struct Dispatcher {
    settings: UnitSettings,
    units: HashMap<PublicKey, UnitHandle>,
    tasks: JoinSet<()>,
    next_id: u64,
    open_units: Arc<AtomicUsize>,
    retire_tx: mpsc::UnboundedSender<Retire>,
    retire_rx: mpsc::UnboundedReceiver<Retire>,
}

impl Dispatcher {
    async fn run(mut self, mut input: mpsc::Receiver<MeshEvent>) {
        loop {
            tokio::select! {
                event = input.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                Some(retire) = self.retire_rx.recv() => self.retire(retire),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("dedup unit failed: {}", e);
                    }
                }
            }
        }

        info!(units = self.units.len(), "flushing deduplicator");
        // Closing every mailbox makes each unit flush its open sighting and exit.
        self.units.clear();
        self.report_units();

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("dedup unit failed during flush: {}", e);
            }
        }
    }

    fn dispatch(&mut self, event: MeshEvent) {
        let key = match &event.kind {
            EventKind::Advertisement(advert) => advert.public_key.clone(),
            _ => event.receiver.clone(),
        };

        let event = match self.units.get_mut(&key) {
            Some(unit) => match unit.tx.send(event) {
                Ok(()) => {
                    unit.sent += 1;
                    return;
                }
                // The unit is gone without retiring, so it must have failed. Replace it.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let mut unit = self.spawn_unit(key.clone());
        if unit.tx.send(event).is_ok() {
            unit.sent += 1;
        }
        self.units.insert(key, unit);
        self.report_units();
    }

    fn spawn_unit(&mut self, key: PublicKey) -> UnitHandle {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let unit = Unit {
            id,
            key,
            settings: self.settings.clone(),
            open: None,
            processed: 0,
            retire: self.retire_tx.clone(),
        };
        self.tasks.spawn(unit.run(rx));

        UnitHandle { id, tx, sent: 0 }
    }

    /// Only honour a retirement when nothing is in flight to the unit. Otherwise the unit keeps
    /// running and asks again once it is idle.
    fn retire(&mut self, retire: Retire) {
        let acknowledged = self
            .units
            .get(&retire.key)
            .is_some_and(|unit| unit.id == retire.id && unit.sent == retire.processed);

        if acknowledged {
            debug!(public_key = retire.key.short(), "retiring dedup unit");
            self.units.remove(&retire.key);
            self.report_units();
        }
    }

    fn report_units(&self) {
        self.open_units.store(self.units.len(), Ordering::Relaxed);
        metrics::gauge!("mesh_dedup_open_units").set(self.units.len() as f64);
    }
}

struct OpenSighting {
    sighting: Sighting,
    closes_at: Instant,
}

/// Owner of one key's dedup state.
struct Unit {
    id: u64,
    key: PublicKey,
    settings: UnitSettings,
    open: Option<OpenSighting>,
    processed: u64,
    retire: mpsc::UnboundedSender<Retire>,
}

impl Unit {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<MeshEvent>) {
        let mut idle_since = Instant::now();
        let mut retiring = false;

        loop {
            let deadline = match (&self.open, retiring) {
                (Some(open), _) => Some(open.closes_at),
                (None, false) => Some(idle_since + self.settings.idle),
                (None, true) => None,
            };

            tokio::select! {
                biased;

                message = mailbox.recv() => match message {
                    Some(event) => {
                        self.processed += 1;
                        retiring = false;
                        self.handle(event).await;
                        idle_since = Instant::now();
                    }
                    None => break,
                },
                _ = wait_until(deadline) => {
                    if self.open.is_some() {
                        self.flush().await;
                        idle_since = Instant::now();
                    } else {
                        let retire = Retire {
                            key: self.key.clone(),
                            id: self.id,
                            processed: self.processed,
                        };
                        retiring = self.retire.send(retire).is_ok();
                    }
                }
            }
        }

        self.flush().await;
    }

    async fn handle(&mut self, event: MeshEvent) {
        match AdvertisementEvent::from_mesh_event(event) {
            Ok(report) => self.observe(report).await,
            Err(event) => {
                self.settings
                    .sink
                    .persist_event(EventRecord::from(event))
                    .await
            }
        }
    }

    async fn observe(&mut self, report: AdvertisementEvent) {
        if let Some(open) = &mut self.open {
            if open.sighting.accepts(report.received_at, self.settings.window) {
                if !open.sighting.observe(&report) {
                    debug!(
                        public_key = self.key.short(),
                        receiver = report.receiver.short(),
                        "duplicate report from receiver"
                    );
                }
                return;
            }
        }

        self.flush().await;
        self.open = Some(OpenSighting {
            sighting: Sighting::open(&report),
            closes_at: Instant::now() + self.settings.window_timeout,
        });
    }

    async fn flush(&mut self) {
        if let Some(open) = self.open.take() {
            self.settings.sink.close_sighting(open.sighting).await;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

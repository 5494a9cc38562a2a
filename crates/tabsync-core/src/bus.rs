//! Cross-tab broadcast bus.
//!
//! Two interchangeable delivery paths carry the same JSON envelope:
//!
//! - **Direct**: a same-origin broadcast hub shared by every tab.
//! - **Storage signal**: the envelope is written to a shared storage key and
//!   removed straight away; siblings react to the change event of the write.
//!
//! The sending path is picked once at construction (direct when a hub is
//! available). Receivers listen on both paths and drop duplicates, so a
//! logical broadcast reaches each handler exactly once.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tabsync_protocol::cross_tab::DedupeKey;
use tabsync_protocol::{CrossTabEvent, CrossTabMessage, SyncError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace, warn};

use crate::clock::SharedClock;
use crate::observer::{ListenerId, Listeners};
use crate::storage::SharedStorage;
use crate::task::TaskSlot;

/// Storage key used by the storage-signal path.
pub const CROSS_TAB_STORAGE_KEY: &str = "tabsync.crossTab";

const HUB_CAPACITY: usize = 64;
const DEDUPE_WINDOW: usize = 64;

/// Same-origin broadcast primitive. Clone one hub into every tab of an origin.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<String>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn post(&self, envelope: String) {
        // No other tab listening is fine
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending half of a delivery path.
pub trait CrossTabChannel: Send + Sync {
    fn post(&self, envelope: &str) -> Result<(), SyncError>;
    fn name(&self) -> &'static str;
}

struct DirectChannel {
    hub: BroadcastHub,
}

impl CrossTabChannel for DirectChannel {
    fn post(&self, envelope: &str) -> Result<(), SyncError> {
        self.hub.post(envelope.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

struct StorageSignalChannel {
    storage: Arc<dyn SharedStorage>,
}

impl CrossTabChannel for StorageSignalChannel {
    fn post(&self, envelope: &str) -> Result<(), SyncError> {
        self.storage.set_item(CROSS_TAB_STORAGE_KEY, envelope)?;
        self.storage.remove_item(CROSS_TAB_STORAGE_KEY)
    }

    fn name(&self) -> &'static str {
        "storage"
    }
}

/// Pick the sending path: direct when the origin has a hub.
fn probe_channel(
    hub: Option<&BroadcastHub>,
    storage: &Arc<dyn SharedStorage>,
) -> Box<dyn CrossTabChannel> {
    match hub {
        Some(hub) => Box::new(DirectChannel { hub: hub.clone() }),
        None => Box::new(StorageSignalChannel {
            storage: storage.clone(),
        }),
    }
}

pub struct BroadcastBus {
    tab_id: String,
    clock: SharedClock,
    storage: Arc<dyn SharedStorage>,
    hub: Option<BroadcastHub>,
    channel: Box<dyn CrossTabChannel>,
    last_timestamp: Mutex<i64>,
    seen: Mutex<VecDeque<DedupeKey>>,
    listeners: Listeners<CrossTabMessage>,
    receiver: TaskSlot,
}

impl BroadcastBus {
    pub fn new(
        tab_id: impl Into<String>,
        clock: SharedClock,
        storage: Arc<dyn SharedStorage>,
        hub: Option<BroadcastHub>,
    ) -> Self {
        let channel = probe_channel(hub.as_ref(), &storage);
        Self {
            tab_id: tab_id.into(),
            clock,
            storage,
            hub,
            channel,
            last_timestamp: Mutex::new(0),
            seen: Mutex::new(VecDeque::with_capacity(DEDUPE_WINDOW)),
            listeners: Listeners::new(),
            receiver: TaskSlot::new(),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Name of the sending path chosen at construction.
    pub fn channel_name(&self) -> &'static str {
        self.channel.name()
    }

    /// Timestamps are strictly increasing per tab, so two broadcasts in the
    /// same millisecond keep distinct dedupe keys.
    fn next_timestamp(&self) -> i64 {
        let mut last = self.last_timestamp.lock();
        let ts = self.clock.now_ms().max(*last + 1);
        *last = ts;
        ts
    }

    pub fn broadcast(&self, event: CrossTabEvent) -> Result<CrossTabMessage, SyncError> {
        let message = CrossTabMessage::new(event, self.next_timestamp(), self.tab_id.clone());
        let envelope = message
            .to_envelope()
            .map_err(|e| SyncError::Storage(format!("encode cross-tab message: {e}")))?;
        self.channel.post(&envelope)?;
        debug!(
            "Broadcast {} via {} (ts {})",
            message.kind().as_str(),
            self.channel.name(),
            message.timestamp
        );
        Ok(message)
    }

    pub fn on_message(
        &self,
        handler: impl Fn(&CrossTabMessage) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.add(handler)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Start listening on both paths. Safe to call again; the previous
    /// receiver is replaced.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut direct = self.hub.as_ref().map(BroadcastHub::subscribe);
        let mut changes = self.storage.subscribe();
        self.receiver.spawn(move |_| async move {
            loop {
                tokio::select! {
                    received = recv_direct(&mut direct) => match received {
                        Ok(envelope) => {
                            if !deliver(&weak, &envelope) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("Cross-tab hub lagged, {n} messages dropped");
                        }
                        Err(RecvError::Closed) => direct = None,
                    },
                    change = changes.recv() => match change {
                        Ok(change) if change.key == CROSS_TAB_STORAGE_KEY => {
                            if let Some(envelope) = change.new_value {
                                if !deliver(&weak, &envelope) {
                                    break;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => warn!("Storage events lagged, {n} dropped"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            trace!("Cross-tab receiver stopped");
        });
    }

    pub fn stop(&self) {
        self.receiver.cancel();
    }

    /// Handle one raw envelope from either path. Returns true if it reached
    /// the handlers.
    pub fn receive_envelope(&self, raw: &str) -> bool {
        let message = match CrossTabMessage::from_envelope(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed cross-tab envelope: {e}");
                return false;
            }
        };
        if message.tab_id.as_deref() == Some(self.tab_id.as_str()) {
            return false;
        }
        {
            let key = message.dedupe_key();
            let mut seen = self.seen.lock();
            if seen.contains(&key) {
                trace!("Duplicate {} dropped", message.kind().as_str());
                return false;
            }
            if seen.len() == DEDUPE_WINDOW {
                seen.pop_front();
            }
            seen.push_back(key);
        }
        debug!("Received {} from {:?}", message.kind().as_str(), message.tab_id);
        self.listeners.emit(&message);
        true
    }
}

impl Drop for BroadcastBus {
    fn drop(&mut self) {
        self.receiver.cancel();
    }
}

async fn recv_direct(rx: &mut Option<broadcast::Receiver<String>>) -> Result<String, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Returns false once the bus is gone.
fn deliver(bus: &Weak<BroadcastBus>, envelope: &str) -> bool {
    match bus.upgrade() {
        Some(bus) => {
            bus.receive_envelope(envelope);
            true
        }
        None => false,
    }
}

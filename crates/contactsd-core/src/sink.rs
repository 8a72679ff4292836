//! Boundary towards the storage writer. Engine events are coalesced per
//! contact so the writer issues one update per contact per batch.

use crate::contact::Contact;
use crate::error::CoreError;
use crate::event::{ContactEvent, EventReceiver};
use crate::identity::UniqueId;
use contactsd_api::ChangeSet;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;

/// Pending writes. A writer applies `removed` first, then `ready`, then
/// `changed`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContactBatch {
    pub removed: Vec<UniqueId>,
    pub ready: Vec<Contact>,
    pub changed: BTreeMap<UniqueId, ChangeSet>,
}

impl ContactBatch {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.ready.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.removed.len() + self.ready.len() + self.changed.len()
    }
}

#[async_trait::async_trait]
pub trait ContactSink: Send + Sync {
    async fn write(&self, batch: ContactBatch) -> Result<(), CoreError>;
}

pub struct BatchingSink {
    sink: Arc<dyn ContactSink>,
    pending: ContactBatch,
}

impl BatchingSink {
    pub fn new(sink: Arc<dyn ContactSink>) -> Self {
        Self {
            sink,
            pending: ContactBatch::default(),
        }
    }

    pub fn pending(&self) -> &ContactBatch {
        &self.pending
    }

    pub fn push(&mut self, event: ContactEvent) {
        match event {
            ContactEvent::Ready(contact) => {
                let unique_id = contact.unique_id();
                self.pending.changed.remove(&unique_id);
                self.pending
                    .ready
                    .retain(|pending| pending.unique_id() != unique_id);
                self.pending.ready.push(contact);
            }
            ContactEvent::Changed { unique_id, kind } => {
                self.pending
                    .changed
                    .entry(unique_id)
                    .or_insert_with(ChangeSet::empty)
                    .insert(kind);
            }
            ContactEvent::Removed { unique_id } => {
                self.pending.changed.remove(&unique_id);
                self.pending
                    .ready
                    .retain(|pending| pending.unique_id() != unique_id);
                if !self.pending.removed.contains(&unique_id) {
                    self.pending.removed.push(unique_id);
                }
            }
        }
    }

    /// Hands the pending batch to the writer. Returns how many entries it
    /// carried. A rejected batch stays pending for the next flush.
    pub async fn flush(&mut self) -> Result<usize, CoreError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.pending);
        let len = batch.len();
        if let Err(err) = self.sink.write(batch.clone()).await {
            self.requeue(batch);
            return Err(err);
        }
        Ok(len)
    }

    /// Puts a rejected batch back in front of whatever was queued since.
    fn requeue(&mut self, failed: ContactBatch) {
        let newer = std::mem::take(&mut self.pending);
        self.replay(failed);
        self.replay(newer);
    }

    fn replay(&mut self, batch: ContactBatch) {
        for unique_id in batch.removed {
            self.push(ContactEvent::Removed { unique_id });
        }
        for contact in batch.ready {
            self.push(ContactEvent::Ready(contact));
        }
        for (unique_id, changes) in batch.changed {
            self.pending
                .changed
                .entry(unique_id)
                .or_insert_with(ChangeSet::empty)
                .merge(changes);
        }
    }
}

/// Collects every written batch. Used by tests and by the daemon when no
/// storage backend is configured.
#[derive(Clone, Default)]
pub struct InMemorySink {
    batches: Arc<Mutex<Vec<ContactBatch>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn batches(&self) -> Vec<ContactBatch> {
        self.batches.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ContactSink for InMemorySink {
    async fn write(&self, batch: ContactBatch) -> Result<(), CoreError> {
        self.batches.lock().await.push(batch);
        Ok(())
    }
}

/// Feeds engine events into `sink`, flushing every `interval` and once more
/// when the event bus closes.
pub async fn run_sink(mut events: EventReceiver, mut sink: BatchingSink, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sink.flush().await {
                    warn!("storage writer rejected batch: {}", err);
                }
            }
            received = events.recv() => match received {
                Ok(event) => sink.push(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("storage writer lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => {
                    if let Err(err) = sink.flush().await {
                        warn!("storage writer rejected final batch: {}", err);
                    }
                    debug!("event bus closed, storage writer stopped");
                    break;
                }
            }
        }
    }
}

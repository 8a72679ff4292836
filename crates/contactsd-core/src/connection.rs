use crate::error::CoreError;
use contactsd_api::{Capability, PresenceType};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};

/// Connection-level handle of a contact. Only meaningful for the lifetime of
/// one connection.
pub type ContactHandle = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Alias,
    AvatarToken,
    SimplePresence,
    Capabilities,
}

/// The batch requested for every newly discovered contact.
pub const CONTACT_FEATURES: [Feature; 4] = [
    Feature::Alias,
    Feature::AvatarToken,
    Feature::SimplePresence,
    Feature::Capabilities,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteContact {
    pub handle: ContactHandle,
    pub protocol_id: String,
}

impl RemoteContact {
    pub fn new(handle: ContactHandle, protocol_id: &str) -> Self {
        Self {
            handle,
            protocol_id: protocol_id.to_string(),
        }
    }
}

/// Result of upgrading one contact with [`CONTACT_FEATURES`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureBatch {
    pub handle: ContactHandle,
    pub actual_features: Vec<Feature>,
    pub alias: String,
    pub presence: PresenceType,
    pub presence_status: String,
    pub presence_message: String,
    pub capabilities: BTreeSet<Capability>,
    pub avatar_token: Option<String>,
}

impl FeatureBatch {
    pub fn supports(&self, feature: Feature) -> bool {
        self.actual_features.contains(&feature)
    }
}

/// Notifications delivered by an IM connection and its account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    ContactsAdded(Vec<RemoteContact>),
    ContactsRemoved(Vec<String>),
    AliasChanged {
        handle: ContactHandle,
        alias: String,
    },
    PresenceChanged {
        handle: ContactHandle,
        presence: PresenceType,
        status: String,
        message: String,
    },
    CapabilitiesChanged {
        handle: ContactHandle,
        capabilities: BTreeSet<Capability>,
    },
    AvatarUpdated {
        handle: ContactHandle,
        token: String,
    },
    AvatarRetrieved {
        handle: ContactHandle,
        token: String,
        data: Vec<u8>,
        mime: String,
    },
    AccountPresenceChanged {
        presence: PresenceType,
        message: String,
    },
    AccountStateChanged {
        enabled: bool,
    },
    ConnectionLost,
    /// The connection came back after [`ConnectionEvent::ConnectionLost`].
    ConnectionRestored,
}

#[async_trait::async_trait]
pub trait ImConnection: Send + Sync {
    /// Contacts currently known to the connection's contact list.
    async fn roster(&self) -> Result<Vec<RemoteContact>, CoreError>;
    /// An empty result means the upgrade did not resolve.
    async fn upgrade_contacts(
        &self,
        handles: &[ContactHandle],
        features: &[Feature],
    ) -> Result<Vec<FeatureBatch>, CoreError>;
    fn has_avatars(&self) -> bool;
    /// Results arrive later as [`ConnectionEvent::AvatarRetrieved`].
    async fn request_avatars(&self, handles: &[ContactHandle]) -> Result<(), CoreError>;
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

#[derive(Clone, Debug)]
pub struct AvatarBlob {
    pub token: String,
    pub data: Vec<u8>,
    pub mime: String,
}

#[derive(Default)]
struct InMemoryState {
    roster: Vec<RemoteContact>,
    batches: HashMap<ContactHandle, FeatureBatch>,
    avatars: HashMap<ContactHandle, AvatarBlob>,
    upgrade_calls: Vec<ContactHandle>,
    avatar_requests: Vec<ContactHandle>,
    fail_upgrades: usize,
}

/// Scripted connection used by tests and by the daemon when no IM service is
/// wired in.
#[derive(Clone)]
pub struct InMemoryConnection {
    state: Arc<Mutex<InMemoryState>>,
    events: broadcast::Sender<ConnectionEvent>,
    gate: Arc<watch::Sender<bool>>,
    avatars: bool,
}

impl Default for InMemoryConnection {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InMemoryConnection {
    pub fn new(avatars: bool) -> Self {
        Self::with_capacity(avatars, 256)
    }

    /// `capacity` bounds how far a subscriber may fall behind before it
    /// lags.
    pub fn with_capacity(avatars: bool, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (gate, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            events,
            gate: Arc::new(gate),
            avatars,
        }
    }

    /// Adds a contact to the roster reported at start, with the batch its
    /// upgrade resolves to.
    pub async fn add_contact(&self, contact: RemoteContact, batch: Option<FeatureBatch>) {
        let mut guard = self.state.lock().await;
        if let Some(batch) = batch {
            guard.batches.insert(contact.handle, batch);
        }
        guard.roster.push(contact);
    }

    /// Drops a contact from the listed roster. No event is sent.
    pub async fn remove_contact(&self, protocol_id: &str) {
        let mut guard = self.state.lock().await;
        guard.roster.retain(|contact| contact.protocol_id != protocol_id);
    }

    pub async fn set_batch(&self, batch: FeatureBatch) {
        let mut guard = self.state.lock().await;
        guard.batches.insert(batch.handle, batch);
    }

    pub async fn set_avatar(&self, handle: ContactHandle, blob: AvatarBlob) {
        let mut guard = self.state.lock().await;
        guard.avatars.insert(handle, blob);
    }

    pub async fn fail_next_upgrades(&self, count: usize) {
        let mut guard = self.state.lock().await;
        guard.fail_upgrades = count;
    }

    /// Upgrades block until [`InMemoryConnection::release_upgrades`].
    pub fn hold_upgrades(&self) {
        self.gate.send_replace(true);
    }

    pub fn release_upgrades(&self) {
        self.gate.send_replace(false);
    }

    pub async fn upgrade_calls(&self) -> Vec<ContactHandle> {
        self.state.lock().await.upgrade_calls.clone()
    }

    pub async fn avatar_requests(&self) -> Vec<ContactHandle> {
        self.state.lock().await.avatar_requests.clone()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait::async_trait]
impl ImConnection for InMemoryConnection {
    async fn roster(&self) -> Result<Vec<RemoteContact>, CoreError> {
        Ok(self.state.lock().await.roster.clone())
    }

    async fn upgrade_contacts(
        &self,
        handles: &[ContactHandle],
        _features: &[Feature],
    ) -> Result<Vec<FeatureBatch>, CoreError> {
        {
            let mut guard = self.state.lock().await;
            guard.upgrade_calls.extend_from_slice(handles);
        }
        let mut gate = self.gate.subscribe();
        let released = gate.wait_for(|held| !*held).await.is_ok();
        if !released {
            return Err(CoreError::Closed);
        }
        let mut guard = self.state.lock().await;
        if guard.fail_upgrades > 0 {
            guard.fail_upgrades -= 1;
            return Err(CoreError::Connection("upgrade".to_string()));
        }
        Ok(handles
            .iter()
            .filter_map(|handle| guard.batches.get(handle).cloned())
            .collect())
    }

    fn has_avatars(&self) -> bool {
        self.avatars
    }

    async fn request_avatars(&self, handles: &[ContactHandle]) -> Result<(), CoreError> {
        if !self.avatars {
            return Err(CoreError::Connection("avatars unsupported".to_string()));
        }
        let mut guard = self.state.lock().await;
        guard.avatar_requests.extend_from_slice(handles);
        for handle in handles {
            if let Some(blob) = guard.avatars.get(handle).cloned() {
                let _ = self.events.send(ConnectionEvent::AvatarRetrieved {
                    handle: *handle,
                    token: blob.token,
                    data: blob.data,
                    mime: blob.mime,
                });
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

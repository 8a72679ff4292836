use crate::connection::{ContactHandle, Feature, FeatureBatch, RemoteContact};
use crate::identity::{im_address, unique_id, ImAddress, UniqueId};
use contactsd_api::{Capability, ChangeKind, ChangeSet, PresenceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Identifies one feature-batch request issued by a roster.
pub type RequestId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    New,
    AcquiringFeatures,
    Ready,
    /// The connection went away before the first batch completed.
    Unavailable,
}

/// The persisted subset of a contact. Avatar bytes are never part of it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub alias: String,
    pub presence_type: PresenceType,
    pub presence_message: String,
    pub capabilities: BTreeSet<Capability>,
    pub avatar_token: Option<String>,
    pub avatar_mime_extension: Option<String>,
}

impl ContactSnapshot {
    pub fn diff(&self, other: &ContactSnapshot) -> ChangeSet {
        let mut changes = ChangeSet::empty();
        if self.alias != other.alias {
            changes.insert(ChangeKind::Alias);
        }
        if self.presence_type != other.presence_type
            || self.presence_message != other.presence_message
        {
            changes.insert(ChangeKind::Presence);
        }
        if self.capabilities != other.capabilities {
            changes.insert(ChangeKind::Capabilities);
        }
        if self.avatar_token != other.avatar_token
            || self.avatar_mime_extension != other.avatar_mime_extension
        {
            changes.insert(ChangeKind::Avatar);
        }
        changes
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum AvatarFetch {
    Idle,
    /// `None` when the announced token was not known at request time.
    Requested(Option<String>),
    Storing(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AvatarUpdate {
    Ignored,
    Fetch,
    Cleared,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AvatarArrival {
    NotMine,
    Stale,
    Duplicate,
    Accepted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    account_path: String,
    protocol_id: String,
    handle: ContactHandle,
    alias: String,
    presence_type: PresenceType,
    presence_status: String,
    presence_message: String,
    capabilities: BTreeSet<Capability>,
    avatar_token: Option<String>,
    avatar_mime_extension: Option<String>,
    avatar_file_path: Option<PathBuf>,
    readiness: Readiness,
    pending_request: Option<RequestId>,
    avatar_supported: bool,
    avatar_fetch: AvatarFetch,
    failed_attempts: u32,
}

impl Contact {
    pub fn new(account_path: &str, remote: &RemoteContact) -> Self {
        Self {
            account_path: account_path.to_string(),
            protocol_id: remote.protocol_id.clone(),
            handle: remote.handle,
            alias: String::new(),
            presence_type: PresenceType::Unset,
            presence_status: String::new(),
            presence_message: String::new(),
            capabilities: BTreeSet::new(),
            avatar_token: None,
            avatar_mime_extension: None,
            avatar_file_path: None,
            readiness: Readiness::New,
            pending_request: None,
            avatar_supported: false,
            avatar_fetch: AvatarFetch::Idle,
            failed_attempts: 0,
        }
    }

    pub fn account_path(&self) -> &str {
        &self.account_path
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn handle(&self) -> ContactHandle {
        self.handle
    }

    pub fn unique_id(&self) -> UniqueId {
        unique_id(&self.account_path, &self.protocol_id)
    }

    pub fn address(&self) -> ImAddress {
        im_address(&self.account_path, &self.protocol_id)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn presence_type(&self) -> PresenceType {
        self.presence_type
    }

    pub fn presence_status(&self) -> &str {
        &self.presence_status
    }

    pub fn presence_message(&self) -> &str {
        &self.presence_message
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn avatar_token(&self) -> Option<&str> {
        self.avatar_token.as_deref()
    }

    pub fn avatar_mime_extension(&self) -> Option<&str> {
        self.avatar_mime_extension.as_deref()
    }

    /// Set only once a decodable image has been written for the current token.
    pub fn avatar_file_path(&self) -> Option<&Path> {
        self.avatar_file_path.as_deref()
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    pub fn avatar_supported(&self) -> bool {
        self.avatar_supported
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn snapshot(&self) -> ContactSnapshot {
        ContactSnapshot {
            alias: self.alias.clone(),
            presence_type: self.presence_type,
            presence_message: self.presence_message.clone(),
            capabilities: self.capabilities.clone(),
            avatar_token: self.avatar_token.clone(),
            avatar_mime_extension: self.avatar_mime_extension.clone(),
        }
    }

    pub(crate) fn seed(&mut self, snapshot: &ContactSnapshot, avatar_file: Option<PathBuf>) {
        self.alias = snapshot.alias.clone();
        self.presence_type = snapshot.presence_type;
        self.presence_message = snapshot.presence_message.clone();
        self.capabilities = snapshot.capabilities.clone();
        self.avatar_token = snapshot.avatar_token.clone();
        self.avatar_mime_extension = snapshot.avatar_mime_extension.clone();
        self.avatar_file_path = avatar_file;
    }

    pub(crate) fn begin_acquisition(&mut self, request: RequestId) {
        self.readiness = Readiness::AcquiringFeatures;
        self.pending_request = Some(request);
    }

    /// Returns true when this completion moved the contact to `Ready`.
    pub(crate) fn complete_acquisition(
        &mut self,
        request: RequestId,
        batch: &FeatureBatch,
        connection_has_avatars: bool,
    ) -> bool {
        if self.pending_request != Some(request) || self.readiness == Readiness::Ready {
            return false;
        }
        self.pending_request = None;
        self.alias = batch.alias.clone();
        self.presence_type = batch.presence;
        self.presence_status = batch.presence_status.clone();
        self.presence_message = batch.presence_message.clone();
        self.capabilities = batch.capabilities.clone();
        self.avatar_supported = connection_has_avatars && batch.supports(Feature::AvatarToken);
        self.failed_attempts = 0;
        self.readiness = Readiness::Ready;
        true
    }

    /// Returns the number of failed attempts so far when `request` was the
    /// outstanding one.
    pub(crate) fn fail_acquisition(&mut self, request: RequestId) -> Option<u32> {
        if self.pending_request != Some(request) {
            return None;
        }
        self.pending_request = None;
        self.readiness = Readiness::New;
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        Some(self.failed_attempts)
    }

    pub(crate) fn connection_lost(&mut self) {
        if self.readiness != Readiness::Ready {
            self.readiness = Readiness::Unavailable;
            self.pending_request = None;
        }
        if matches!(self.avatar_fetch, AvatarFetch::Requested(_)) {
            self.avatar_fetch = AvatarFetch::Idle;
        }
    }

    pub(crate) fn set_alias(&mut self, alias: &str) {
        self.alias = alias.to_string();
    }

    pub(crate) fn set_presence(&mut self, presence: PresenceType, status: &str, message: &str) {
        self.presence_type = presence;
        self.presence_status = status.to_string();
        self.presence_message = message.to_string();
    }

    pub(crate) fn set_capabilities(&mut self, capabilities: BTreeSet<Capability>) {
        self.capabilities = capabilities;
    }

    /// Decides whether the token announced by a feature batch needs a
    /// retrieval. Marks the request as outstanding when it does.
    pub(crate) fn plan_initial_avatar(&mut self, announced: Option<&str>) -> bool {
        if !self.avatar_supported {
            return false;
        }
        match announced {
            Some("") => false,
            Some(token)
                if self.avatar_token.as_deref() == Some(token)
                    && self.avatar_file_path.is_some() =>
            {
                false
            }
            Some(token) => {
                self.avatar_fetch = AvatarFetch::Requested(Some(token.to_string()));
                true
            }
            None => {
                self.avatar_fetch = AvatarFetch::Requested(None);
                true
            }
        }
    }

    pub(crate) fn avatar_updated(&mut self, handle: ContactHandle, token: &str) -> AvatarUpdate {
        if handle != self.handle || !self.avatar_supported {
            return AvatarUpdate::Ignored;
        }
        if token.is_empty() {
            if self.avatar_token.is_none() {
                return AvatarUpdate::Ignored;
            }
            self.avatar_token = None;
            self.avatar_mime_extension = None;
            self.avatar_file_path = None;
            self.avatar_fetch = AvatarFetch::Idle;
            return AvatarUpdate::Cleared;
        }
        if self.avatar_token.as_deref() == Some(token) {
            return AvatarUpdate::Ignored;
        }
        let in_flight = match &self.avatar_fetch {
            AvatarFetch::Requested(Some(pending)) | AvatarFetch::Storing(pending) => {
                pending == token
            }
            _ => false,
        };
        if in_flight {
            return AvatarUpdate::Ignored;
        }
        self.avatar_fetch = AvatarFetch::Requested(Some(token.to_string()));
        AvatarUpdate::Fetch
    }

    /// The token of a retrieval still awaited, `Some(None)` when it was
    /// requested without a known token.
    pub(crate) fn outstanding_avatar(&self) -> Option<Option<&str>> {
        match &self.avatar_fetch {
            AvatarFetch::Requested(token) => Some(token.as_deref()),
            _ => None,
        }
    }

    pub(crate) fn avatar_request_failed(&mut self, token: Option<&str>) {
        if let AvatarFetch::Requested(pending) = &self.avatar_fetch {
            if pending.as_deref() == token {
                self.avatar_fetch = AvatarFetch::Idle;
            }
        }
    }

    /// Every contact of a connection sees every retrieved avatar; only the
    /// one whose handle matches, and whose outstanding request it answers,
    /// accepts it.
    pub(crate) fn avatar_arrived(&mut self, handle: ContactHandle, token: &str) -> AvatarArrival {
        if handle != self.handle || !self.avatar_supported {
            return AvatarArrival::NotMine;
        }
        let arrival = match &self.avatar_fetch {
            AvatarFetch::Requested(None) => AvatarArrival::Accepted,
            AvatarFetch::Requested(Some(expected)) if expected == token => AvatarArrival::Accepted,
            AvatarFetch::Requested(Some(_)) => AvatarArrival::Stale,
            AvatarFetch::Storing(pending) if pending == token => AvatarArrival::Duplicate,
            AvatarFetch::Storing(_) => AvatarArrival::Stale,
            // Only a re-delivery of the current token whose file is missing.
            AvatarFetch::Idle if self.avatar_token.as_deref() == Some(token) => {
                if self.avatar_file_path.is_some() {
                    AvatarArrival::Duplicate
                } else {
                    AvatarArrival::Accepted
                }
            }
            AvatarFetch::Idle => AvatarArrival::Stale,
        };
        if arrival == AvatarArrival::Accepted {
            self.avatar_fetch = AvatarFetch::Storing(token.to_string());
        }
        arrival
    }

    /// Records the outcome of storing `token`. Returns false when a newer
    /// token superseded it in the meantime.
    pub(crate) fn avatar_stored(
        &mut self,
        token: &str,
        extension: &str,
        path: Option<PathBuf>,
    ) -> bool {
        match &self.avatar_fetch {
            AvatarFetch::Storing(pending) if pending == token => {}
            _ => return false,
        }
        self.avatar_fetch = AvatarFetch::Idle;
        self.avatar_token = Some(token.to_string());
        self.avatar_mime_extension = Some(extension.to_string());
        self.avatar_file_path = path;
        true
    }
}

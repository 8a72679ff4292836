//! Per-account roster: owns the contacts of one account and drives each
//! contact's readiness. Every input returns the [`Effect`]s the account loop
//! must carry out, so the state machine itself performs no I/O.

use crate::avatar::{AvatarStore, StoredAvatar};
use crate::connection::{ContactHandle, FeatureBatch, RemoteContact};
use crate::contact::{AvatarArrival, AvatarUpdate, Contact, Readiness, RequestId};
use crate::event::ContactEvent;
use crate::roster_cache::RosterSnapshot;
use contactsd_api::{validate_protocol_id, Capability, ChangeKind, PresenceType, RosterChange};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    RequestFeatures {
        protocol_id: String,
        handle: ContactHandle,
        request: RequestId,
    },
    RequestAvatar {
        protocol_id: String,
        handle: ContactHandle,
        token: Option<String>,
    },
    StoreAvatar {
        protocol_id: String,
        token: String,
        mime: String,
        data: Vec<u8>,
    },
    RetryFeatures {
        protocol_id: String,
        attempt: u32,
    },
    Emit(ContactEvent),
}

pub struct Roster {
    account_path: String,
    avatars: AvatarStore,
    connection_has_avatars: bool,
    contacts: HashMap<String, Contact>,
    handles: HashMap<ContactHandle, String>,
    cached: RosterSnapshot,
    avoid: BTreeSet<String>,
    next_request: RequestId,
}

impl Roster {
    pub fn new(
        account_path: &str,
        cached: RosterSnapshot,
        avatars: AvatarStore,
        connection_has_avatars: bool,
    ) -> Self {
        Self {
            account_path: account_path.to_string(),
            avatars,
            connection_has_avatars,
            contacts: HashMap::new(),
            handles: HashMap::new(),
            cached,
            avoid: BTreeSet::new(),
            next_request: 1,
        }
    }

    pub fn account_path(&self) -> &str {
        &self.account_path
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contact(&self, protocol_id: &str) -> Option<&Contact> {
        self.contacts.get(protocol_id)
    }

    pub fn contact_by_handle(&self, handle: ContactHandle) -> Option<&Contact> {
        self.handles
            .get(&handle)
            .and_then(|protocol_id| self.contacts.get(protocol_id))
    }

    /// Contacts ordered by protocol id.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut out: Vec<Contact> = self.contacts.values().cloned().collect();
        out.sort_by(|a, b| a.protocol_id().cmp(b.protocol_id()));
        out
    }

    pub fn cached(&self) -> &RosterSnapshot {
        &self.cached
    }

    pub fn set_connection_has_avatars(&mut self, has_avatars: bool) {
        self.connection_has_avatars = has_avatars;
    }

    pub fn contacts_to_avoid(&self) -> &BTreeSet<String> {
        &self.avoid
    }

    /// Replaces the avoid list. Contacts already in the roster that are on
    /// the new list are removed.
    pub fn set_contacts_to_avoid(&mut self, ids: BTreeSet<String>) -> Vec<Effect> {
        let mut listed: Vec<String> = ids
            .iter()
            .filter(|id| self.contacts.contains_key(*id))
            .cloned()
            .collect();
        listed.sort();
        self.avoid = ids;
        listed
            .iter()
            .flat_map(|protocol_id| self.remove(protocol_id))
            .collect()
    }

    /// Contacts still waiting for their first feature batch.
    pub fn acquiring(&self) -> usize {
        self.contacts
            .values()
            .filter(|contact| contact.readiness() == Readiness::AcquiringFeatures)
            .count()
    }

    pub fn discover(&mut self, remote: RemoteContact) -> Vec<Effect> {
        if let Err(err) = validate_protocol_id(&remote.protocol_id) {
            warn!("ignoring contact with invalid id on {}: {}", self.account_path, err);
            return Vec::new();
        }
        if self.avoid.contains(&remote.protocol_id) {
            debug!(
                "skipping avoided contact {} on {}",
                remote.protocol_id, self.account_path
            );
            return Vec::new();
        }
        if self.contacts.contains_key(&remote.protocol_id) {
            warn!(
                "contact {} was already in roster {}",
                remote.protocol_id, self.account_path
            );
            return Vec::new();
        }
        let mut contact = Contact::new(&self.account_path, &remote);
        if let Some(snapshot) = self.cached.get(&remote.protocol_id) {
            let avatar_file = match (&snapshot.avatar_token, &snapshot.avatar_mime_extension) {
                (Some(token), Some(extension)) => self.avatars.existing(token, extension),
                _ => None,
            };
            contact.seed(snapshot, avatar_file);
        }
        let request = self.allocate_request();
        contact.begin_acquisition(request);
        debug!(
            "requesting features for {} on {}",
            remote.protocol_id, self.account_path
        );
        self.handles.insert(remote.handle, remote.protocol_id.clone());
        self.contacts.insert(remote.protocol_id.clone(), contact);
        vec![Effect::RequestFeatures {
            protocol_id: remote.protocol_id,
            handle: remote.handle,
            request,
        }]
    }

    pub fn remove(&mut self, protocol_id: &str) -> Vec<Effect> {
        let Some(contact) = self.contacts.remove(protocol_id) else {
            warn!(
                "contact {} removed from {} but was not in the roster",
                protocol_id, self.account_path
            );
            return Vec::new();
        };
        if self.handles.get(&contact.handle()).map(String::as_str) == Some(protocol_id) {
            self.handles.remove(&contact.handle());
        }
        vec![Effect::Emit(ContactEvent::Removed {
            unique_id: contact.unique_id(),
        })]
    }

    /// Brings the roster in line with a fresh listing after notifications
    /// were missed: absent contacts are removed, unknown ones discovered,
    /// unresolved ones re-requested and outstanding avatar requests
    /// re-issued.
    pub fn reconcile(&mut self, listed: Vec<RemoteContact>) -> Vec<Effect> {
        let remote_ids: BTreeSet<&str> = listed
            .iter()
            .map(|remote| remote.protocol_id.as_str())
            .collect();
        let mut gone: Vec<String> = self
            .contacts
            .keys()
            .filter(|protocol_id| !remote_ids.contains(protocol_id.as_str()))
            .cloned()
            .collect();
        gone.sort();
        let mut effects: Vec<Effect> = gone
            .iter()
            .flat_map(|protocol_id| self.remove(protocol_id))
            .collect();

        let mut known: Vec<String> = self.contacts.keys().cloned().collect();
        known.sort();
        for protocol_id in known {
            effects.extend(self.retry_features(&protocol_id));
            if let Some(contact) = self.contacts.get(&protocol_id) {
                if let Some(token) = contact.outstanding_avatar() {
                    effects.push(Effect::RequestAvatar {
                        protocol_id: protocol_id.clone(),
                        handle: contact.handle(),
                        token: token.map(str::to_string),
                    });
                }
            }
        }
        for remote in listed {
            if !self.contacts.contains_key(&remote.protocol_id) {
                effects.extend(self.discover(remote));
            }
        }
        effects
    }

    pub fn features_completed(
        &mut self,
        protocol_id: &str,
        request: RequestId,
        batches: Vec<FeatureBatch>,
    ) -> Vec<Effect> {
        let Some(contact) = self.contacts.get_mut(protocol_id) else {
            debug!("dropping feature batch for removed contact {}", protocol_id);
            return Vec::new();
        };
        let handle = contact.handle();
        let Some(batch) = batches.into_iter().find(|batch| batch.handle == handle) else {
            warn!("feature batch for {} did not resolve", protocol_id);
            return self.acquisition_failed(protocol_id, request);
        };
        if !contact.complete_acquisition(request, &batch, self.connection_has_avatars) {
            debug!("ignoring stale feature batch {} for {}", request, protocol_id);
            return Vec::new();
        }
        let mut effects = Vec::new();
        if contact.plan_initial_avatar(batch.avatar_token.as_deref()) {
            effects.push(Effect::RequestAvatar {
                protocol_id: protocol_id.to_string(),
                handle,
                token: batch.avatar_token.clone(),
            });
        } else if !contact.avatar_supported() {
            debug!("contact {} does not support avatars", protocol_id);
        }
        effects.push(Effect::Emit(ContactEvent::Ready(contact.clone())));
        effects
    }

    pub fn features_failed(
        &mut self,
        protocol_id: &str,
        request: RequestId,
        reason: &str,
    ) -> Vec<Effect> {
        warn!("feature request for {} failed: {}", protocol_id, reason);
        self.acquisition_failed(protocol_id, request)
    }

    fn acquisition_failed(&mut self, protocol_id: &str, request: RequestId) -> Vec<Effect> {
        let Some(contact) = self.contacts.get_mut(protocol_id) else {
            return Vec::new();
        };
        match contact.fail_acquisition(request) {
            Some(attempt) => vec![Effect::RetryFeatures {
                protocol_id: protocol_id.to_string(),
                attempt,
            }],
            None => Vec::new(),
        }
    }

    /// Re-issues the feature request of a contact that never became ready.
    pub fn retry_features(&mut self, protocol_id: &str) -> Vec<Effect> {
        let request = self.next_request;
        let Some(contact) = self.contacts.get_mut(protocol_id) else {
            return Vec::new();
        };
        if !matches!(contact.readiness(), Readiness::New | Readiness::Unavailable) {
            return Vec::new();
        }
        self.next_request += 1;
        contact.begin_acquisition(request);
        vec![Effect::RequestFeatures {
            protocol_id: protocol_id.to_string(),
            handle: contact.handle(),
            request,
        }]
    }

    pub fn alias_changed(&mut self, handle: ContactHandle, alias: &str) -> Vec<Effect> {
        self.live_update(handle, ChangeKind::Alias, |contact| contact.set_alias(alias))
    }

    pub fn presence_changed(
        &mut self,
        handle: ContactHandle,
        presence: PresenceType,
        status: &str,
        message: &str,
    ) -> Vec<Effect> {
        self.live_update(handle, ChangeKind::Presence, |contact| {
            contact.set_presence(presence, status, message)
        })
    }

    pub fn capabilities_changed(
        &mut self,
        handle: ContactHandle,
        capabilities: BTreeSet<Capability>,
    ) -> Vec<Effect> {
        self.live_update(handle, ChangeKind::Capabilities, |contact| {
            contact.set_capabilities(capabilities)
        })
    }

    fn live_update<F>(&mut self, handle: ContactHandle, kind: ChangeKind, apply: F) -> Vec<Effect>
    where
        F: FnOnce(&mut Contact),
    {
        let Some(protocol_id) = self.handles.get(&handle).cloned() else {
            debug!("{:?} change for unknown handle {}", kind, handle);
            return Vec::new();
        };
        let Some(contact) = self.contacts.get_mut(&protocol_id) else {
            return Vec::new();
        };
        match contact.readiness() {
            Readiness::Ready => {
                apply(contact);
                vec![Effect::Emit(ContactEvent::Changed {
                    unique_id: contact.unique_id(),
                    kind,
                })]
            }
            Readiness::New | Readiness::Unavailable => {
                debug!("live event for not-ready contact {}, re-requesting features", protocol_id);
                self.retry_features(&protocol_id)
            }
            Readiness::AcquiringFeatures => Vec::new(),
        }
    }

    pub fn avatar_updated(&mut self, handle: ContactHandle, token: &str) -> Vec<Effect> {
        let unresolved = self
            .contact_by_handle(handle)
            .filter(|contact| matches!(contact.readiness(), Readiness::New | Readiness::Unavailable))
            .map(|contact| contact.protocol_id().to_string());
        if let Some(protocol_id) = unresolved {
            debug!("avatar update for not-ready contact {}, re-requesting features", protocol_id);
            return self.retry_features(&protocol_id);
        }
        let mut effects = Vec::new();
        for contact in self.contacts.values_mut() {
            match contact.avatar_updated(handle, token) {
                AvatarUpdate::Fetch => effects.push(Effect::RequestAvatar {
                    protocol_id: contact.protocol_id().to_string(),
                    handle: contact.handle(),
                    token: Some(token.to_string()),
                }),
                AvatarUpdate::Cleared => effects.push(Effect::Emit(ContactEvent::Changed {
                    unique_id: contact.unique_id(),
                    kind: ChangeKind::Avatar,
                })),
                AvatarUpdate::Ignored => {}
            }
        }
        effects
    }

    pub fn avatar_request_failed(&mut self, protocol_id: &str, token: Option<&str>) {
        if let Some(contact) = self.contacts.get_mut(protocol_id) {
            contact.avatar_request_failed(token);
        }
    }

    pub fn avatar_retrieved(
        &mut self,
        handle: ContactHandle,
        token: &str,
        data: &[u8],
        mime: &str,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        for contact in self.contacts.values_mut() {
            match contact.avatar_arrived(handle, token) {
                AvatarArrival::Accepted => effects.push(Effect::StoreAvatar {
                    protocol_id: contact.protocol_id().to_string(),
                    token: token.to_string(),
                    mime: mime.to_string(),
                    data: data.to_vec(),
                }),
                AvatarArrival::Stale => {
                    debug!("discarding superseded avatar {} for {}", token, contact.protocol_id())
                }
                AvatarArrival::Duplicate => {
                    debug!("avatar {} for {} already stored", token, contact.protocol_id())
                }
                AvatarArrival::NotMine => {}
            }
        }
        effects
    }

    pub fn avatar_stored(&mut self, protocol_id: &str, stored: StoredAvatar) -> Vec<Effect> {
        let Some(contact) = self.contacts.get_mut(protocol_id) else {
            debug!("dropping avatar for removed contact {}", protocol_id);
            return Vec::new();
        };
        if !contact.avatar_stored(&stored.token, &stored.extension, stored.path) {
            debug!("dropping superseded avatar {} for {}", stored.token, protocol_id);
            return Vec::new();
        }
        vec![Effect::Emit(ContactEvent::Changed {
            unique_id: contact.unique_id(),
            kind: ChangeKind::Avatar,
        })]
    }

    pub fn connection_lost(&mut self) {
        for contact in self.contacts.values_mut() {
            contact.connection_lost();
        }
    }

    /// Drops every contact and the loaded snapshot.
    pub fn clear(&mut self) -> Vec<Effect> {
        let mut removed: Vec<Contact> = self.contacts.drain().map(|(_, c)| c).collect();
        removed.sort_by(|a, b| a.protocol_id().cmp(b.protocol_id()));
        self.handles.clear();
        self.cached.clear();
        removed
            .into_iter()
            .map(|contact| {
                Effect::Emit(ContactEvent::Removed {
                    unique_id: contact.unique_id(),
                })
            })
            .collect()
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        self.contacts
            .iter()
            .map(|(protocol_id, contact)| (protocol_id.clone(), contact.snapshot()))
            .collect()
    }

    /// Live roster against the snapshot it was loaded with.
    pub fn roster_changes(&self) -> BTreeMap<String, RosterChange> {
        let mut changes = BTreeMap::new();
        for (protocol_id, contact) in self.contacts.iter() {
            let change = match self.cached.get(protocol_id) {
                Some(cached) => RosterChange::Changed(contact.snapshot().diff(cached)),
                None => RosterChange::Added,
            };
            changes.insert(protocol_id.clone(), change);
        }
        for protocol_id in self.cached.keys() {
            if !self.contacts.contains_key(protocol_id) {
                changes.insert(protocol_id.clone(), RosterChange::Deleted);
            }
        }
        changes
    }

    fn allocate_request(&mut self) -> RequestId {
        let request = self.next_request;
        self.next_request += 1;
        request
    }
}

//! One task per account. The task owns the account's [`Roster`] and is the
//! only place its state changes; connection calls run as spawned tasks that
//! report back over the completion channel.

use crate::avatar::{AvatarStore, StoredAvatar};
use crate::config::RetryPolicy;
use crate::connection::{ConnectionEvent, FeatureBatch, ImConnection, CONTACT_FEATURES};
use crate::contact::{Contact, RequestId};
use crate::device_presence::DevicePresenceHandle;
use crate::error::CoreError;
use crate::event::{AccountEvent, EventBus};
use crate::roster::{Effect, Roster};
use crate::roster_cache::RosterCacheStore;
use contactsd_api::{AccountSummary, RosterChange};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug)]
pub enum Completion {
    Features {
        protocol_id: String,
        request: RequestId,
        result: Result<Vec<FeatureBatch>, CoreError>,
    },
    AvatarRequestFailed {
        protocol_id: String,
        token: Option<String>,
    },
    AvatarStored {
        protocol_id: String,
        stored: StoredAvatar,
    },
    Retry {
        protocol_id: String,
    },
    /// The grace period started by connection loss number `generation`
    /// ran out.
    DisconnectTimeout {
        generation: u64,
    },
}

pub enum AccountCommand {
    Persist(oneshot::Sender<Result<(), CoreError>>),
    Contacts(oneshot::Sender<Vec<Contact>>),
    RosterChanges(oneshot::Sender<BTreeMap<String, RosterChange>>),
    Summary(oneshot::Sender<AccountSummary>),
    SetContactsToAvoid {
        ids: BTreeSet<String>,
        reply: oneshot::Sender<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct AccountHandle {
    account_path: String,
    commands: mpsc::Sender<AccountCommand>,
}

impl AccountHandle {
    pub fn account_path(&self) -> &str {
        &self.account_path
    }

    pub async fn persist(&self) -> Result<(), CoreError> {
        self.request(AccountCommand::Persist).await?
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>, CoreError> {
        self.request(AccountCommand::Contacts).await
    }

    pub async fn roster_changes(&self) -> Result<BTreeMap<String, RosterChange>, CoreError> {
        self.request(AccountCommand::RosterChanges).await
    }

    pub async fn summary(&self) -> Result<AccountSummary, CoreError> {
        self.request(AccountCommand::Summary).await
    }

    /// Contacts with these ids are dropped from the roster and never
    /// discovered again.
    pub async fn set_contacts_to_avoid(&self, ids: BTreeSet<String>) -> Result<(), CoreError> {
        self.request(|reply| AccountCommand::SetContactsToAvoid { ids, reply })
            .await
    }

    /// Persists the roster and stops the task.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.request(AccountCommand::Shutdown).await
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> AccountCommand,
    ) -> Result<R, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CoreError::Closed)?;
        rx.await.map_err(|_| CoreError::Closed)
    }
}

pub struct AccountSync {
    summary: AccountSummary,
    connection: Arc<dyn ImConnection>,
    roster: Roster,
    cache: Arc<dyn RosterCacheStore>,
    avatars: AvatarStore,
    events: EventBus,
    presence: Option<DevicePresenceHandle>,
    retry: RetryPolicy,
    completions: mpsc::UnboundedSender<Completion>,
    disconnect_grace: Duration,
    disconnect_generation: u64,
    /// Set while a grace period is running.
    pending_disconnect: Option<u64>,
    offline: bool,
    /// No roster was ever imported for this account, or it was re-enabled.
    new_account: bool,
    importing: bool,
}

impl AccountSync {
    /// Loads the cached snapshot of the account. Nothing is requested from
    /// the connection until [`AccountSync::spawn`].
    pub fn new(
        summary: AccountSummary,
        connection: Arc<dyn ImConnection>,
        cache: Arc<dyn RosterCacheStore>,
        avatars: AvatarStore,
        events: EventBus,
        presence: Option<DevicePresenceHandle>,
        retry: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let cached = cache.load(&summary.account_path);
        debug!(
            "account {} starts with {} cached contacts",
            summary.account_path,
            cached.len()
        );
        let roster = Roster::new(
            &summary.account_path,
            cached,
            avatars.clone(),
            connection.has_avatars(),
        );
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let new_account = roster.cached().is_empty();
        let sync = Self {
            summary,
            connection,
            roster,
            cache,
            avatars,
            events,
            presence,
            retry,
            completions,
            disconnect_grace: Duration::ZERO,
            disconnect_generation: 0,
            pending_disconnect: None,
            offline: false,
            new_account,
            importing: false,
        };
        (sync, completions_rx)
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn with_contacts_to_avoid(mut self, ids: BTreeSet<String>) -> Self {
        // The roster is still empty here, so nothing is removed.
        let _ = self.roster.set_contacts_to_avoid(ids);
        self
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn spawn(
        self,
        completions: mpsc::UnboundedReceiver<Completion>,
    ) -> (AccountHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = AccountHandle {
            account_path: self.summary.account_path.clone(),
            commands: tx,
        };
        let task = tokio::spawn(self.run(rx, completions));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<AccountCommand>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        // Subscribe before listing the roster so no addition falls in between.
        let mut connection_events = self.connection.subscribe();
        let mut listening = true;
        self.report_summary().await;
        if self.summary.enabled {
            self.load_roster().await;
        }
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(AccountCommand::Shutdown(reply)) => {
                        self.persist_logged().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.persist_logged().await;
                        break;
                    }
                },
                received = connection_events.recv(), if listening => match received {
                    Ok(event) => self.handle_connection_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "account {} missed {} connection events, listing the roster again",
                            self.summary.account_path, skipped
                        );
                        if self.summary.enabled && !self.offline {
                            self.load_roster().await;
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("connection of {} closed", self.summary.account_path);
                        listening = false;
                        self.connection_lost().await;
                    }
                },
                Some(completion) = completions.recv() => self.handle_completion(completion).await,
            }
        }
        info!("account {} stopped", self.summary.account_path);
    }

    async fn handle_command(&mut self, command: AccountCommand) {
        match command {
            AccountCommand::Persist(reply) => {
                let _ = reply.send(self.persist().await);
            }
            AccountCommand::Contacts(reply) => {
                let _ = reply.send(self.roster.contacts());
            }
            AccountCommand::RosterChanges(reply) => {
                let _ = reply.send(self.roster.roster_changes());
            }
            AccountCommand::Summary(reply) => {
                let _ = reply.send(self.summary.clone());
            }
            AccountCommand::SetContactsToAvoid { ids, reply } => {
                let effects = self.roster.set_contacts_to_avoid(ids);
                self.apply(effects);
                self.finish_import_if_settled();
                let _ = reply.send(());
            }
            AccountCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let effects = match event {
            ConnectionEvent::AccountStateChanged { enabled } => {
                self.set_enabled(enabled).await;
                return;
            }
            ConnectionEvent::AccountPresenceChanged { presence, message } => {
                self.summary.presence_state = presence;
                self.summary.presence_message = message;
                self.report_summary().await;
                return;
            }
            ConnectionEvent::ConnectionLost => {
                self.connection_dropped().await;
                return;
            }
            ConnectionEvent::ConnectionRestored => {
                self.connection_restored().await;
                return;
            }
            _ if !self.summary.enabled => {
                debug!("account {} is disabled, ignoring event", self.summary.account_path);
                return;
            }
            ConnectionEvent::ContactsAdded(added) => added
                .into_iter()
                .flat_map(|remote| self.roster.discover(remote))
                .collect(),
            ConnectionEvent::ContactsRemoved(removed) => removed
                .iter()
                .flat_map(|protocol_id| self.roster.remove(protocol_id))
                .collect(),
            ConnectionEvent::AliasChanged { handle, alias } => {
                self.roster.alias_changed(handle, &alias)
            }
            ConnectionEvent::PresenceChanged {
                handle,
                presence,
                status,
                message,
            } => self
                .roster
                .presence_changed(handle, presence, &status, &message),
            ConnectionEvent::CapabilitiesChanged {
                handle,
                capabilities,
            } => self.roster.capabilities_changed(handle, capabilities),
            ConnectionEvent::AvatarUpdated { handle, token } => {
                self.roster.avatar_updated(handle, &token)
            }
            ConnectionEvent::AvatarRetrieved {
                handle,
                token,
                data,
                mime,
            } => self.roster.avatar_retrieved(handle, &token, &data, &mime),
        };
        self.apply(effects);
        self.finish_import_if_settled();
    }

    async fn handle_completion(&mut self, completion: Completion) {
        let effects = match completion {
            Completion::Features {
                protocol_id,
                request,
                result,
            } => match result {
                Ok(batches) => self.roster.features_completed(&protocol_id, request, batches),
                Err(err) => self
                    .roster
                    .features_failed(&protocol_id, request, &err.to_string()),
            },
            Completion::AvatarRequestFailed { protocol_id, token } => {
                self.roster
                    .avatar_request_failed(&protocol_id, token.as_deref());
                Vec::new()
            }
            Completion::AvatarStored {
                protocol_id,
                stored,
            } => self.roster.avatar_stored(&protocol_id, stored),
            Completion::Retry { protocol_id } => self.roster.retry_features(&protocol_id),
            Completion::DisconnectTimeout { generation } => {
                if self.pending_disconnect == Some(generation) {
                    info!(
                        "account {} stayed disconnected past its grace period",
                        self.summary.account_path
                    );
                    self.connection_lost().await;
                }
                return;
            }
        };
        self.apply(effects);
        self.finish_import_if_settled();
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::RequestFeatures {
                    protocol_id,
                    handle,
                    request,
                } => {
                    let connection = self.connection.clone();
                    let completions = self.completions.clone();
                    tokio::spawn(async move {
                        let result = connection
                            .upgrade_contacts(&[handle], &CONTACT_FEATURES)
                            .await;
                        let _ = completions.send(Completion::Features {
                            protocol_id,
                            request,
                            result,
                        });
                    });
                }
                Effect::RequestAvatar {
                    protocol_id,
                    handle,
                    token,
                } => {
                    let connection = self.connection.clone();
                    let completions = self.completions.clone();
                    tokio::spawn(async move {
                        if let Err(err) = connection.request_avatars(&[handle]).await {
                            warn!("avatar request for {} failed: {}", protocol_id, err);
                            let _ = completions
                                .send(Completion::AvatarRequestFailed { protocol_id, token });
                        }
                    });
                }
                Effect::StoreAvatar {
                    protocol_id,
                    token,
                    mime,
                    data,
                } => {
                    let avatars = self.avatars.clone();
                    let completions = self.completions.clone();
                    tokio::task::spawn_blocking(move || {
                        let stored = avatars.store(&token, &mime, &data);
                        let _ = completions.send(Completion::AvatarStored {
                            protocol_id,
                            stored,
                        });
                    });
                }
                Effect::RetryFeatures {
                    protocol_id,
                    attempt,
                } => match self.retry.delay_for(attempt) {
                    Some(delay) => {
                        debug!(
                            "retrying features for {} in {:?} (attempt {})",
                            protocol_id, delay, attempt
                        );
                        let completions = self.completions.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = completions.send(Completion::Retry { protocol_id });
                        });
                    }
                    None => debug!(
                        "contact {} stays unresolved until its next event",
                        protocol_id
                    ),
                },
                Effect::Emit(event) => self.events.publish(event),
            }
        }
    }

    /// Lists the connection's roster and reconciles against it. The first
    /// listing of a new account is reported as an import.
    async fn load_roster(&mut self) {
        self.roster
            .set_connection_has_avatars(self.connection.has_avatars());
        if self.new_account && !self.importing {
            self.importing = true;
            self.events.publish_account(AccountEvent::SyncStarted {
                account_path: self.summary.account_path.clone(),
            });
        }
        match self.connection.roster().await {
            Ok(contacts) => {
                info!(
                    "account {} reports {} contacts",
                    self.summary.account_path,
                    contacts.len()
                );
                self.new_account = false;
                let effects = self.roster.reconcile(contacts);
                self.apply(effects);
                self.finish_import_if_settled();
            }
            Err(err) => {
                warn!(
                    "could not list contacts of {}: {}",
                    self.summary.account_path, err
                );
                self.end_import(0, 0);
            }
        }
    }

    fn finish_import_if_settled(&mut self) {
        if !self.importing || self.new_account || self.roster.acquiring() > 0 {
            return;
        }
        let changes = self.roster.roster_changes();
        let added = changes
            .values()
            .filter(|change| matches!(change, RosterChange::Added))
            .count();
        let removed = changes
            .values()
            .filter(|change| matches!(change, RosterChange::Deleted))
            .count();
        self.end_import(added, removed);
    }

    fn end_import(&mut self, added: usize, removed: usize) {
        if !self.importing {
            return;
        }
        self.importing = false;
        info!(
            "account {} imported: {} added, {} removed",
            self.summary.account_path, added, removed
        );
        self.events.publish_account(AccountEvent::SyncEnded {
            account_path: self.summary.account_path.clone(),
            added,
            removed,
        });
    }

    async fn set_enabled(&mut self, enabled: bool) {
        if self.summary.enabled == enabled {
            return;
        }
        self.summary.enabled = enabled;
        info!(
            "account {} {}",
            self.summary.account_path,
            if enabled { "enabled" } else { "disabled" }
        );
        if enabled {
            self.new_account = true;
            self.report_summary().await;
            self.load_roster().await;
        } else {
            let effects = self.roster.clear();
            self.apply(effects);
            self.end_import(0, 0);
            self.persist_logged().await;
            self.report_summary().await;
        }
    }

    /// Starts the grace period, or applies the loss at once when there is
    /// none.
    async fn connection_dropped(&mut self) {
        if self.offline || self.pending_disconnect.is_some() {
            return;
        }
        if self.disconnect_grace.is_zero() {
            self.connection_lost().await;
            return;
        }
        self.disconnect_generation += 1;
        let generation = self.disconnect_generation;
        self.pending_disconnect = Some(generation);
        debug!(
            "account {} lost its connection, waiting {:?}",
            self.summary.account_path, self.disconnect_grace
        );
        let grace = self.disconnect_grace;
        let completions = self.completions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = completions.send(Completion::DisconnectTimeout { generation });
        });
    }

    async fn connection_restored(&mut self) {
        if self.pending_disconnect.take().is_some() {
            debug!(
                "account {} reconnected within its grace period",
                self.summary.account_path
            );
            return;
        }
        if !self.offline {
            return;
        }
        self.offline = false;
        info!("account {} reconnected", self.summary.account_path);
        if self.summary.enabled {
            self.load_roster().await;
        }
    }

    async fn connection_lost(&mut self) {
        self.pending_disconnect = None;
        self.offline = true;
        self.roster.connection_lost();
        self.end_import(0, 0);
        self.persist_logged().await;
    }

    async fn persist(&self) -> Result<(), CoreError> {
        let cache = self.cache.clone();
        let account_path = self.summary.account_path.clone();
        let snapshot = self.roster.snapshot();
        tokio::task::spawn_blocking(move || cache.persist(&account_path, &snapshot))
            .await
            .map_err(|_| CoreError::Closed)?
            .map_err(CoreError::from)
    }

    async fn persist_logged(&self) {
        if let Err(err) = self.persist().await {
            warn!(
                "could not persist roster of {}: {}",
                self.summary.account_path, err
            );
        }
    }

    async fn report_summary(&self) {
        if let Some(presence) = &self.presence {
            if presence.account_changed(self.summary.clone()).await.is_err() {
                debug!("device presence aggregator is gone");
            }
        }
    }
}

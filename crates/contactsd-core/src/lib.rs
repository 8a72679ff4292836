pub mod account;
pub mod avatar;
pub mod backend;
pub mod config;
pub mod connection;
pub mod contact;
pub mod device_presence;
pub mod error;
pub mod event;
pub mod identity;
pub mod roster;
pub mod roster_cache;
pub mod sink;

use account::{AccountHandle, AccountSync};
use avatar::AvatarStore;
use backend::BackendPool;
use config::CoreConfig;
use connection::ImConnection;
use contactsd_api::{validate_account_path, AccountSummary};
use device_presence::{spawn_device_presence, DevicePresenceHandle, PresenceOrder};
use error::CoreError;
use event::{AccountEventReceiver, EventBus, EventReceiver};
use log::{info, warn};
use roster_cache::{cache_backends, RosterCacheStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Composition root: the event bus, the device presence aggregator and one
/// sync task per registered account.
pub struct ContactsCore {
    config: CoreConfig,
    events: EventBus,
    presence: DevicePresenceHandle,
    backends: BackendPool<dyn RosterCacheStore>,
    avatars: AvatarStore,
    accounts: Mutex<HashMap<String, (AccountHandle, JoinHandle<()>)>>,
}

impl ContactsCore {
    pub async fn init(config: CoreConfig) -> Result<Self, CoreError> {
        let order = PresenceOrder::new(config.presence_order.clone())?;
        std::fs::create_dir_all(&config.avatar_dir)?;
        let events = EventBus::new(config.event_capacity);
        let (presence, _task) = spawn_device_presence(order, config.event_capacity);
        let backends = cache_backends(&config);
        if backends.candidate_names().is_empty() {
            return Err(CoreError::Validation("no cache backend configured".to_string()));
        }
        let avatars = AvatarStore::new(&config.avatar_dir);
        info!(
            "contacts core ready, cache backends {:?}",
            backends.candidate_names()
        );
        Ok(Self {
            config,
            events,
            presence,
            backends,
            avatars,
            accounts: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Import progress of every account.
    pub fn account_events(&self) -> AccountEventReceiver {
        self.events.subscribe_accounts()
    }

    pub fn device_presence(&self) -> DevicePresenceHandle {
        self.presence.clone()
    }

    pub fn avatar_store(&self) -> &AvatarStore {
        &self.avatars
    }

    pub fn cache_backend(&self, account_path: &str) -> Option<String> {
        self.backends.backend_name(account_path)
    }

    pub async fn add_account(
        &self,
        summary: AccountSummary,
        connection: Arc<dyn ImConnection>,
    ) -> Result<AccountHandle, CoreError> {
        self.add_account_avoiding(summary, connection, BTreeSet::new())
            .await
    }

    /// Registers an account whose roster never includes `contacts_to_avoid`.
    pub async fn add_account_avoiding(
        &self,
        summary: AccountSummary,
        connection: Arc<dyn ImConnection>,
        contacts_to_avoid: BTreeSet<String>,
    ) -> Result<AccountHandle, CoreError> {
        validate_account_path(&summary.account_path)?;
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(&summary.account_path) {
            return Err(CoreError::DuplicateAccount(summary.account_path));
        }
        let account_path = summary.account_path.clone();
        let cache = self.backends.get(&account_path)?;
        let (sync, completions) = AccountSync::new(
            summary,
            connection,
            cache,
            self.avatars.clone(),
            self.events.clone(),
            Some(self.presence.clone()),
            self.config.feature_retry.clone(),
        );
        let sync = sync
            .with_disconnect_grace(Duration::from_millis(self.config.disconnect_grace_ms))
            .with_contacts_to_avoid(contacts_to_avoid);
        let (handle, task) = sync.spawn(completions);
        info!("account {} registered", account_path);
        accounts.insert(account_path, (handle.clone(), task));
        Ok(handle)
    }

    pub async fn account(&self, account_path: &str) -> Option<AccountHandle> {
        self.accounts
            .lock()
            .await
            .get(account_path)
            .map(|(handle, _)| handle.clone())
    }

    pub async fn account_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.accounts.lock().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Stops the account's task after persisting its roster and drops it
    /// from the device presence aggregate.
    pub async fn remove_account(&self, account_path: &str) -> Result<(), CoreError> {
        let removed = self.accounts.lock().await.remove(account_path);
        let Some((handle, task)) = removed else {
            return Err(CoreError::NotFound);
        };
        stop_account(handle, task).await;
        self.backends.release(account_path);
        self.presence.account_removed(account_path).await?;
        info!("account {} removed", account_path);
        Ok(())
    }

    pub async fn shutdown(&self) {
        let accounts: Vec<(String, (AccountHandle, JoinHandle<()>))> =
            self.accounts.lock().await.drain().collect();
        for (account_path, (handle, task)) in accounts {
            stop_account(handle, task).await;
            self.backends.release(&account_path);
        }
        info!("contacts core stopped");
    }
}

async fn stop_account(handle: AccountHandle, task: JoinHandle<()>) {
    if let Err(err) = handle.shutdown().await {
        warn!("account {} did not stop cleanly: {}", handle.account_path(), err);
    }
    if let Err(err) = task.await {
        warn!("account {} task failed: {}", handle.account_path(), err);
    }
}

#[cfg(test)]
mod tests;

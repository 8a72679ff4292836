//! Device-wide presence: collects the latest summary of every account and
//! republishes the aggregated view as [`DevicePresenceSignal`]s.

use crate::error::CoreError;
use contactsd_api::{AccountSummary, DevicePresenceSignal, DevicePresenceSnapshot, PresenceType};
use log::{debug, info};
use std::collections::HashSet;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Presence states from most to least available.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceOrder {
    order: Vec<PresenceType>,
}

impl Default for PresenceOrder {
    fn default() -> Self {
        Self {
            order: crate::config::default_presence_order(),
        }
    }
}

impl PresenceOrder {
    pub fn new(order: Vec<PresenceType>) -> Result<Self, CoreError> {
        if order.is_empty() {
            return Err(CoreError::Validation("presence order is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for state in order.iter() {
            if !seen.insert(*state) {
                return Err(CoreError::Validation(format!(
                    "presence order lists {} twice",
                    state
                )));
            }
        }
        Ok(Self { order })
    }

    pub fn states(&self) -> &[PresenceType] {
        &self.order
    }

    /// Higher is more available. Unlisted states rank below every listed one.
    pub fn rank(&self, state: PresenceType) -> usize {
        match self.order.iter().position(|listed| *listed == state) {
            Some(index) => self.order.len() - index,
            None => 0,
        }
    }

    pub fn least_available(&self) -> PresenceType {
        self.order.last().copied().unwrap_or(PresenceType::Offline)
    }

    /// Most available state among `states`, or the least available listed
    /// state when none of them is listed.
    pub fn reduce<I>(&self, states: I) -> PresenceType
    where
        I: IntoIterator<Item = PresenceType>,
    {
        states
            .into_iter()
            .filter(|state| self.rank(*state) > 0)
            .max_by_key(|state| self.rank(*state))
            .unwrap_or_else(|| self.least_available())
    }
}

/// Aggregation state without any channel plumbing.
#[derive(Clone, Debug, Default)]
pub struct DevicePresence {
    order: PresenceOrder,
    accounts: Vec<AccountSummary>,
}

impl DevicePresence {
    pub fn new(order: PresenceOrder) -> Self {
        Self {
            order,
            accounts: Vec::new(),
        }
    }

    pub fn order(&self) -> &PresenceOrder {
        &self.order
    }

    /// Returns the signals of a new cycle, or `None` when the summary did not
    /// change anything.
    pub fn update_account(&mut self, summary: AccountSummary) -> Option<Vec<DevicePresenceSignal>> {
        match self
            .accounts
            .iter_mut()
            .find(|known| known.account_path == summary.account_path)
        {
            Some(known) if *known == summary => return None,
            Some(known) => *known = summary,
            None => self.accounts.push(summary),
        }
        Some(self.request_update())
    }

    pub fn remove_account(&mut self, account_path: &str) -> Option<Vec<DevicePresenceSignal>> {
        let before = self.accounts.len();
        self.accounts.retain(|known| known.account_path != account_path);
        if self.accounts.len() == before {
            return None;
        }
        Some(self.request_update())
    }

    pub fn request_update(&self) -> Vec<DevicePresenceSignal> {
        self.snapshot().signals()
    }

    pub fn global_presence_state(&self) -> PresenceType {
        self.order.reduce(
            self.accounts
                .iter()
                .filter(|account| account.enabled)
                .map(|account| account.presence_state),
        )
    }

    pub fn snapshot(&self) -> DevicePresenceSnapshot {
        DevicePresenceSnapshot {
            accounts: self.accounts.clone(),
            global_presence_state: self.global_presence_state(),
        }
    }
}

pub enum PresenceCommand {
    RequestUpdate(Option<oneshot::Sender<Vec<DevicePresenceSignal>>>),
    AccountChanged(AccountSummary),
    AccountRemoved(String),
    Snapshot(oneshot::Sender<DevicePresenceSnapshot>),
}

/// Cloneable front of the aggregator task.
#[derive(Clone)]
pub struct DevicePresenceHandle {
    commands: mpsc::Sender<PresenceCommand>,
    signals: broadcast::Sender<DevicePresenceSignal>,
}

impl DevicePresenceHandle {
    /// Triggers a cycle and returns the signals it broadcast.
    pub async fn request_update(&self) -> Result<Vec<DevicePresenceSignal>, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(PresenceCommand::RequestUpdate(Some(tx))).await?;
        rx.await.map_err(|_| CoreError::Closed)
    }

    pub async fn account_changed(&self, summary: AccountSummary) -> Result<(), CoreError> {
        self.send(PresenceCommand::AccountChanged(summary)).await
    }

    pub async fn account_removed(&self, account_path: &str) -> Result<(), CoreError> {
        self.send(PresenceCommand::AccountRemoved(account_path.to_string()))
            .await
    }

    pub async fn snapshot(&self) -> Result<DevicePresenceSnapshot, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(PresenceCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| CoreError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DevicePresenceSignal> {
        self.signals.subscribe()
    }

    async fn send(&self, command: PresenceCommand) -> Result<(), CoreError> {
        self.commands.send(command).await.map_err(|_| CoreError::Closed)
    }
}

/// Starts the aggregator task. It stops once every handle is dropped.
pub fn spawn_device_presence(
    order: PresenceOrder,
    capacity: usize,
) -> (DevicePresenceHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(capacity.max(1));
    let (signals, _) = broadcast::channel(capacity.max(1));
    let handle = DevicePresenceHandle {
        commands,
        signals: signals.clone(),
    };
    let task = tokio::spawn(run_device_presence(DevicePresence::new(order), rx, signals));
    (handle, task)
}

async fn run_device_presence(
    mut presence: DevicePresence,
    mut rx: mpsc::Receiver<PresenceCommand>,
    signals: broadcast::Sender<DevicePresenceSignal>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            PresenceCommand::RequestUpdate(reply) => {
                let cycle = presence.request_update();
                broadcast_cycle(&signals, &cycle);
                if let Some(reply) = reply {
                    let _ = reply.send(cycle);
                }
            }
            PresenceCommand::AccountChanged(summary) => {
                debug!(
                    "account {} presence {} enabled {}",
                    summary.account_path, summary.presence_state, summary.enabled
                );
                if let Some(cycle) = presence.update_account(summary) {
                    broadcast_cycle(&signals, &cycle);
                }
            }
            PresenceCommand::AccountRemoved(account_path) => {
                if let Some(cycle) = presence.remove_account(&account_path) {
                    broadcast_cycle(&signals, &cycle);
                }
            }
            PresenceCommand::Snapshot(reply) => {
                let _ = reply.send(presence.snapshot());
            }
        }
    }
    info!("device presence aggregator stopped");
}

fn broadcast_cycle(signals: &broadcast::Sender<DevicePresenceSignal>, cycle: &[DevicePresenceSignal]) {
    for signal in cycle {
        let _ = signals.send(signal.clone());
    }
}

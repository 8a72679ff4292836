use crate::contact::Contact;
use crate::identity::UniqueId;
use contactsd_api::ChangeKind;
use tokio::sync::broadcast;

/// Outbound engine events, consumed by the storage writer.
#[derive(Clone, Debug, PartialEq)]
pub enum ContactEvent {
    Ready(Contact),
    Changed { unique_id: UniqueId, kind: ChangeKind },
    Removed { unique_id: UniqueId },
}

impl ContactEvent {
    pub fn unique_id(&self) -> UniqueId {
        match self {
            ContactEvent::Ready(contact) => contact.unique_id(),
            ContactEvent::Changed { unique_id, .. } => *unique_id,
            ContactEvent::Removed { unique_id } => *unique_id,
        }
    }
}

/// Roster import progress of an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountEvent {
    SyncStarted {
        account_path: String,
    },
    /// `added` and `removed` count contacts against the cached roster. Both
    /// are zero when the import was cut short.
    SyncEnded {
        account_path: String,
        added: usize,
        removed: usize,
    },
}

pub type EventReceiver = broadcast::Receiver<ContactEvent>;
pub type AccountEventReceiver = broadcast::Receiver<AccountEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ContactEvent>,
    accounts: broadcast::Sender<AccountEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size.max(1));
        let (accounts, _) = broadcast::channel(size.max(1));
        Self { tx, accounts }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn subscribe_accounts(&self) -> AccountEventReceiver {
        self.accounts.subscribe()
    }

    pub fn publish(&self, event: ContactEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_account(&self, event: AccountEvent) {
        let _ = self.accounts.send(event);
    }
}

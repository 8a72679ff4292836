use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Availability status as reported by the IM connection layer.
///
/// The discriminants follow the connection presence codes used on the wire,
/// see [`PresenceType::from_code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceType {
    Unset,
    Offline,
    Available,
    Away,
    ExtendedAway,
    Hidden,
    Busy,
    Unknown,
    Error,
}

impl Default for PresenceType {
    fn default() -> Self {
        PresenceType::Unset
    }
}

impl PresenceType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => PresenceType::Unset,
            1 => PresenceType::Offline,
            2 => PresenceType::Available,
            3 => PresenceType::Away,
            4 => PresenceType::ExtendedAway,
            5 => PresenceType::Hidden,
            6 => PresenceType::Busy,
            8 => PresenceType::Error,
            _ => PresenceType::Unknown,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            PresenceType::Unset => 0,
            PresenceType::Offline => 1,
            PresenceType::Available => 2,
            PresenceType::Away => 3,
            PresenceType::ExtendedAway => 4,
            PresenceType::Hidden => 5,
            PresenceType::Busy => 6,
            PresenceType::Unknown => 7,
            PresenceType::Error => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PresenceType::Unset => "unset",
            PresenceType::Offline => "offline",
            PresenceType::Available => "available",
            PresenceType::Away => "away",
            PresenceType::ExtendedAway => "extended-away",
            PresenceType::Hidden => "hidden",
            PresenceType::Busy => "busy",
            PresenceType::Unknown => "unknown",
            PresenceType::Error => "error",
        }
    }
}

impl Display for PresenceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    TextChat,
    MediaCall,
    AudioCall,
    VideoCall,
    UpgradingCall,
    FileTransfer,
    StreamTube,
    DbusTube,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::TextChat,
        Capability::MediaCall,
        Capability::AudioCall,
        Capability::VideoCall,
        Capability::UpgradingCall,
        Capability::FileTransfer,
        Capability::StreamTube,
        Capability::DbusTube,
    ];

    pub fn token(self) -> &'static str {
        match self {
            Capability::TextChat => "text-chat",
            Capability::MediaCall => "media-call",
            Capability::AudioCall => "audio-call",
            Capability::VideoCall => "video-call",
            Capability::UpgradingCall => "upgrading-call",
            Capability::FileTransfer => "file-transfer",
            Capability::StreamTube => "stream-tube",
            Capability::DbusTube => "dbus-tube",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.token() == token)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Alias,
    Presence,
    Capabilities,
    Avatar,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 4] = [
        ChangeKind::Alias,
        ChangeKind::Presence,
        ChangeKind::Capabilities,
        ChangeKind::Avatar,
    ];

    fn bit(self) -> u8 {
        match self {
            ChangeKind::Alias => 1 << 0,
            ChangeKind::Presence => 1 << 1,
            ChangeKind::Capabilities => 1 << 2,
            ChangeKind::Avatar => 1 << 3,
        }
    }
}

/// A set of [`ChangeKind`]s, stored as a bit mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(u8);

impl ChangeSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        ChangeKind::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, kind: ChangeKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn kinds(&self) -> Vec<ChangeKind> {
        ChangeKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .collect()
    }
}

impl From<ChangeKind> for ChangeSet {
    fn from(kind: ChangeKind) -> Self {
        Self(kind.bit())
    }
}

impl FromIterator<ChangeKind> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        let mut set = ChangeSet::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

/// Difference between the live roster and the snapshot it was started from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterChange {
    Added,
    Deleted,
    Changed(ChangeSet),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountSummary {
    pub account_path: String,
    pub account_uri: String,
    pub service_provider: String,
    pub service_provider_display_name: String,
    pub account_display_name: String,
    pub account_icon_path: String,
    pub presence_state: PresenceType,
    pub presence_message: String,
    pub enabled: bool,
}

/// Outbound signals of the device presence boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DevicePresenceSignal {
    AccountList { account_paths: Vec<String> },
    GlobalUpdate { presence_state: PresenceType },
    Update(AccountSummary),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevicePresenceSnapshot {
    pub accounts: Vec<AccountSummary>,
    pub global_presence_state: PresenceType,
}

impl DevicePresenceSnapshot {
    pub fn account_paths(&self) -> Vec<String> {
        self.accounts
            .iter()
            .map(|account| account.account_path.clone())
            .collect()
    }

    /// One aggregation cycle: the account list, the reduced state, then one
    /// update per account.
    pub fn signals(&self) -> Vec<DevicePresenceSignal> {
        let mut out = Vec::with_capacity(self.accounts.len() + 2);
        out.push(DevicePresenceSignal::AccountList {
            account_paths: self.account_paths(),
        });
        out.push(DevicePresenceSignal::GlobalUpdate {
            presence_state: self.global_presence_state,
        });
        out.extend(self.accounts.iter().cloned().map(DevicePresenceSignal::Update));
        out
    }
}

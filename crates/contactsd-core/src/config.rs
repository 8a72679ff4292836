use contactsd_api::PresenceType;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CACHE_BACKEND_FILE: &str = "file";
pub const CACHE_BACKEND_MEMORY: &str = "memory";

/// Timed re-request of a failed feature batch. `max_attempts == 0` leaves
/// recovery to the next live event for the contact.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-request number `attempt` (1-based), or `None` once
    /// the attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u64 << (attempt.saturating_sub(1).min(16));
        let base = self.backoff_initial_ms.saturating_mul(factor);
        let capped = base.min(self.backoff_max_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2 + 1);
        Some(Duration::from_millis(capped.saturating_add(jitter)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub cache_dir: PathBuf,
    pub avatar_dir: PathBuf,
    pub event_capacity: usize,
    pub presence_order: Vec<PresenceType>,
    pub feature_retry: RetryPolicy,
    pub cache_backends: Vec<String>,
    /// How long a dropped connection may stay down before its contacts are
    /// marked unavailable. Zero applies the loss at once.
    pub disconnect_grace_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".contactsd/cache"),
            avatar_dir: PathBuf::from(".contactsd/avatars"),
            event_capacity: 256,
            presence_order: default_presence_order(),
            feature_retry: RetryPolicy::default(),
            cache_backends: vec![
                CACHE_BACKEND_FILE.to_string(),
                CACHE_BACKEND_MEMORY.to_string(),
            ],
            disconnect_grace_ms: 30_000,
        }
    }
}

/// Most available first.
pub fn default_presence_order() -> Vec<PresenceType> {
    vec![
        PresenceType::Available,
        PresenceType::Away,
        PresenceType::ExtendedAway,
        PresenceType::Busy,
        PresenceType::Hidden,
        PresenceType::Offline,
    ]
}

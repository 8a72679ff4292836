//! Stable identifiers derived from `(account path, protocol contact id)`.
//!
//! Account paths never contain [`IDENTITY_SEPARATOR`], so splitting
//! `account!contact` at the first separator recovers both inputs and the
//! concatenation fed to the hash is injective.

use blake3::Hasher;
use contactsd_api::IDENTITY_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub type UniqueId = u64;

pub const ADDRESS_SCHEME: &str = "imaddress";

pub fn unique_id(account_path: &str, protocol_id: &str) -> UniqueId {
    let mut hasher = Hasher::new();
    hasher.update(account_path.as_bytes());
    hasher.update(&[IDENTITY_SEPARATOR as u8]);
    hasher.update(protocol_id.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}

pub fn im_address(account_path: &str, protocol_id: &str) -> ImAddress {
    ImAddress {
        account_path: account_path.to_string(),
        protocol_id: protocol_id.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImAddress {
    account_path: String,
    protocol_id: String,
}

impl ImAddress {
    pub fn parse(value: &str) -> Option<Self> {
        let body = value
            .strip_prefix(ADDRESS_SCHEME)
            .and_then(|rest| rest.strip_prefix(':'))?;
        let (account_path, protocol_id) = body.split_once(IDENTITY_SEPARATOR)?;
        if account_path.is_empty() || protocol_id.is_empty() {
            return None;
        }
        Some(im_address(account_path, protocol_id))
    }

    pub fn scheme(&self) -> &'static str {
        ADDRESS_SCHEME
    }

    pub fn body(&self) -> String {
        format!(
            "{}{}{}",
            self.account_path, IDENTITY_SEPARATOR, self.protocol_id
        )
    }

    pub fn account_path(&self) -> &str {
        &self.account_path
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn unique_id(&self) -> UniqueId {
        unique_id(&self.account_path, &self.protocol_id)
    }
}

impl Display for ImAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", ADDRESS_SCHEME, self.body())
    }
}

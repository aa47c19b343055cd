//! One logical on-chain transaction bundle and its effects.

use crate::model::AssetSlug;
use crate::pointer::Pointer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Tezos,
    Evm,
}

/// Chain identity: Tezos chains by chain id string, EVM chains by numeric id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "family", content = "id", rename_all = "snake_case")]
pub enum ChainKey {
    Tezos(String),
    Evm(u64),
}

impl ChainKey {
    pub fn family(&self) -> ChainFamily {
        match self {
            ChainKey::Tezos(_) => ChainFamily::Tezos,
            ChainKey::Evm(_) => ChainFamily::Evm,
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKey::Tezos(id) => write!(f, "tezos:{}", id),
            ChainKey::Evm(id) => write!(f, "evm:{}", id),
        }
    }
}

impl FromStr for ChainKey {
    type Err = String;

    /// `tezos:<chain id>` or `evm:<numeric id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(':') {
            Some(("tezos", id)) if !id.is_empty() => Ok(ChainKey::Tezos(id.to_string())),
            Some(("evm", id)) => id
                .parse()
                .map(ChainKey::Evm)
                .map_err(|_| format!("invalid evm chain id: {}", id)),
            _ => Err(format!("invalid chain key: {}", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Applied,
    Pending,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Transfer,
    Approval,
    Interaction,
    Swap,
}

/// Asset moved or approved by an operation. `contract == None` is the chain's native coin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub contract: Option<String>,
    pub token_id: Option<String>,
    /// Signed atomic amount from the account's point of view (negative = sent).
    pub amount: String,
    pub decimals: Option<u8>,
}

impl AssetRef {
    pub fn native(amount: impl Into<String>, decimals: u8) -> Self {
        Self {
            contract: None,
            token_id: None,
            amount: amount.into(),
            decimals: Some(decimals),
        }
    }

    pub fn matches(&self, slug: &AssetSlug) -> bool {
        match slug {
            AssetSlug::Native => self.contract.is_none(),
            AssetSlug::Token { contract, token_id } => {
                let same_contract = self
                    .contract
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(contract));
                let same_id = match token_id {
                    Some(id) => self.token_id.as_deref() == Some(id.as_str()),
                    None => true,
                };
                same_contract && same_id
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub asset: Option<AssetRef>,
    pub counterparty: Option<String>,
    /// Position of the emitting log (EVM) or of the operation inside its group (Tezos).
    pub log_index: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub chain: ChainKey,
    pub hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
    pub status: ActivityStatus,
    pub block_height: u64,
    /// Intra-block ordinal: operation id, transaction offset or explorer position.
    pub index: u64,
    /// Resume position once this activity has been seen.
    pub pointer: Pointer,
    pub operations: Vec<Operation>,
}

impl Activity {
    pub fn position(&self) -> (u64, u64) {
        (self.block_height, self.index)
    }

    pub fn touches_asset(&self, slug: &AssetSlug) -> bool {
        self.operations
            .iter()
            .filter_map(|op| op.asset.as_ref())
            .any(|asset| asset.matches(slug))
    }

    /// Newest first: block descending, then intra-block index descending.
    pub fn sort_newest_first(activities: &mut [Activity]) {
        activities.sort_by(|a, b| b.position().cmp(&a.position()));
    }
}

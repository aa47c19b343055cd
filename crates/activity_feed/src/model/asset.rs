//! Asset slugs narrowing a history view to one asset.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("invalid asset slug: {0}")]
pub struct AssetSlugError(String);

/// `native` (aliases `tez`, `eth`), `<contract>` or `<contract>_<tokenId>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetSlug {
    Native,
    Token {
        contract: String,
        token_id: Option<String>,
    },
}

impl FromStr for AssetSlug {
    type Err = AssetSlugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "" => return Err(AssetSlugError(s.to_string())),
            "native" | "tez" | "eth" => return Ok(AssetSlug::Native),
            _ => {}
        }
        let (contract, token_id) = match s.split_once('_') {
            Some((c, id)) => {
                if id.is_empty() || !id.chars().all(|ch| ch.is_ascii_digit()) {
                    return Err(AssetSlugError(s.to_string()));
                }
                (c, Some(id.to_string()))
            }
            None => (s, None),
        };
        if contract.is_empty() {
            return Err(AssetSlugError(s.to_string()));
        }
        let contract = if contract.starts_with("0x") {
            contract.to_lowercase()
        } else {
            contract.to_string()
        };
        Ok(AssetSlug::Token { contract, token_id })
    }
}

impl fmt::Display for AssetSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetSlug::Native => f.write_str("native"),
            AssetSlug::Token {
                contract,
                token_id: Some(id),
            } => write!(f, "{}_{}", contract, id),
            AssetSlug::Token {
                contract,
                token_id: None,
            } => f.write_str(contract),
        }
    }
}

impl Serialize for AssetSlug {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AssetSlug {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

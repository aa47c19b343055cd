//! Chain-specific "older-than" pagination pointers.
//!
//! A [`Pointer`] marks a resume position: everything at or after it has been seen,
//! the next page starts strictly below it. Each upstream family has its own codec
//! translating between the native cursor it speaks and the normalized pointer.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PointerError {
    #[error("pointer families differ: {0} vs {1}")]
    FamilyMismatch(&'static str, &'static str),
    #[error("expected {expected} pointer, got {got}")]
    WrongFamily {
        expected: &'static str,
        got: &'static str,
    },
    #[error("invalid pointer: {0}")]
    Invalid(String),
}

/// Normalized resume position. Pointers of the same family are totally ordered.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Pointer {
    /// Tezos indexer: block level plus the indexer's operation id.
    Tezos { level: u64, id: u64 },
    /// Generic EVM indexer: block height only; blocks are never split across pages.
    EvmBlock { height: u64 },
    /// Block explorer: block number plus transaction position or log index.
    Explorer { block_number: u64, index: u64 },
}

impl Pointer {
    pub fn family(&self) -> &'static str {
        match self {
            Pointer::Tezos { .. } => "tezos",
            Pointer::EvmBlock { .. } => "evm",
            Pointer::Explorer { .. } => "explorer",
        }
    }

    /// Genesis pointer of the same family as `self`.
    pub fn genesis_like(&self) -> Pointer {
        match self {
            Pointer::Tezos { .. } => TezosCodec::genesis(),
            Pointer::EvmBlock { .. } => EvmBlockCodec::genesis(),
            Pointer::Explorer { .. } => ExplorerCodec::genesis(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        *self == self.genesis_like()
    }

    pub fn compare(&self, other: &Pointer) -> Result<Ordering, PointerError> {
        match (self, other) {
            (Pointer::Tezos { level: a, id: ai }, Pointer::Tezos { level: b, id: bi }) => {
                Ok((a, ai).cmp(&(b, bi)))
            }
            (Pointer::EvmBlock { height: a }, Pointer::EvmBlock { height: b }) => Ok(a.cmp(b)),
            (
                Pointer::Explorer {
                    block_number: a,
                    index: ai,
                },
                Pointer::Explorer {
                    block_number: b,
                    index: bi,
                },
            ) => Ok((a, ai).cmp(&(b, bi))),
            _ => Err(PointerError::FamilyMismatch(self.family(), other.family())),
        }
    }
}

impl PartialOrd for Pointer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other).ok()
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pointer::Tezos { level, id } => write!(f, "tezos:{}:{}", level, id),
            Pointer::EvmBlock { height } => write!(f, "evm:{}", height),
            Pointer::Explorer {
                block_number,
                index,
            } => write!(f, "explorer:{}:{}", block_number, index),
        }
    }
}

impl FromStr for Pointer {
    type Err = PointerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let num = |p: &str| {
            p.parse::<u64>()
                .map_err(|_| PointerError::Invalid(s.to_string()))
        };
        match parts.as_slice() {
            ["tezos", level, id] => Ok(Pointer::Tezos {
                level: num(level)?,
                id: num(id)?,
            }),
            ["evm", height] => Ok(Pointer::EvmBlock {
                height: num(height)?,
            }),
            ["explorer", block, index] => Ok(Pointer::Explorer {
                block_number: num(block)?,
                index: num(index)?,
            }),
            _ => Err(PointerError::Invalid(s.to_string())),
        }
    }
}

/// Translation between an upstream's native cursor and a [`Pointer`]. Lossless.
pub trait PointerCodec {
    type Cursor;

    fn encode(cursor: &Self::Cursor) -> Pointer;
    fn decode(pointer: &Pointer) -> Result<Self::Cursor, PointerError>;
    fn genesis() -> Pointer;

    fn is_genesis(pointer: &Pointer) -> bool {
        *pointer == Self::genesis()
    }
}

/// Tezos indexer cursor: operations with `id < last_id` at or below `level`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TzktCursor {
    pub level: u64,
    pub last_id: u64,
}

pub struct TezosCodec;

impl PointerCodec for TezosCodec {
    type Cursor = TzktCursor;

    fn encode(cursor: &TzktCursor) -> Pointer {
        Pointer::Tezos {
            level: cursor.level,
            id: cursor.last_id,
        }
    }

    fn decode(pointer: &Pointer) -> Result<TzktCursor, PointerError> {
        match pointer {
            Pointer::Tezos { level, id } => Ok(TzktCursor {
                level: *level,
                last_id: *id,
            }),
            other => Err(PointerError::WrongFamily {
                expected: "tezos",
                got: other.family(),
            }),
        }
    }

    fn genesis() -> Pointer {
        Pointer::Tezos { level: 0, id: 0 }
    }
}

/// Generic EVM indexer cursor: the lowest fully delivered block height.
pub struct EvmBlockCodec;

impl PointerCodec for EvmBlockCodec {
    type Cursor = u64;

    fn encode(height: &u64) -> Pointer {
        Pointer::EvmBlock { height: *height }
    }

    fn decode(pointer: &Pointer) -> Result<u64, PointerError> {
        match pointer {
            Pointer::EvmBlock { height } => Ok(*height),
            other => Err(PointerError::WrongFamily {
                expected: "evm",
                got: other.family(),
            }),
        }
    }

    fn genesis() -> Pointer {
        Pointer::EvmBlock { height: 0 }
    }
}

/// Block-explorer `next_page_params` subset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerCursor {
    pub block_number: u64,
    pub index: u64,
}

pub struct ExplorerCodec;

impl PointerCodec for ExplorerCodec {
    type Cursor = ExplorerCursor;

    fn encode(cursor: &ExplorerCursor) -> Pointer {
        Pointer::Explorer {
            block_number: cursor.block_number,
            index: cursor.index,
        }
    }

    fn decode(pointer: &Pointer) -> Result<ExplorerCursor, PointerError> {
        match pointer {
            Pointer::Explorer {
                block_number,
                index,
            } => Ok(ExplorerCursor {
                block_number: *block_number,
                index: *index,
            }),
            other => Err(PointerError::WrongFamily {
                expected: "explorer",
                got: other.family(),
            }),
        }
    }

    fn genesis() -> Pointer {
        Pointer::Explorer {
            block_number: 0,
            index: 0,
        }
    }
}

//! Raw upstream pages, tagged per family, and their normalization into activities.

use crate::chain::evm_indexer::{self, IndexerData};
use crate::chain::explorer::{self, ExplorerRaw};
use crate::chain::source::ActivityPage;
use crate::chain::tezos::{self, TzktStream};
use crate::model::{AssetSlug, ChainKey, Operation, OperationKind};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("invalid time: {0}")]
    InvalidTime(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("block {0} exceeds the upstream page size")]
    OversizedBlock(u64),
    #[error("operation group {0} exceeds the upstream page size")]
    OversizedGroup(String),
}

/// Upstream response shapes. Nothing of these leaves the fetcher boundary.
pub enum RawPage {
    Tezos(Vec<TzktStream>),
    EvmIndexer(IndexerData),
    Explorer(ExplorerRaw),
}

pub struct NormalizeContext<'a> {
    pub chain: &'a ChainKey,
    pub account: &'a str,
    pub asset: Option<&'a AssetSlug>,
    pub page_size: usize,
}

pub fn normalize(raw: RawPage, ctx: &NormalizeContext<'_>) -> Result<ActivityPage, NormalizeError> {
    match raw {
        RawPage::Tezos(streams) => tezos::normalize_streams(streams, ctx),
        RawPage::EvmIndexer(data) => evm_indexer::normalize_transactions(data, ctx),
        RawPage::Explorer(raw) => explorer::normalize_streams(raw, ctx),
    }
}

pub fn parse_time_rfc3339(s: &str) -> Result<OffsetDateTime, NormalizeError> {
    OffsetDateTime::parse(s.trim(), &Rfc3339).map_err(|e| NormalizeError::InvalidTime(format!("{}: {}", s, e)))
}

/// Validate an unsigned decimal atomic amount and sign it from the account's side.
pub fn signed_amount(raw: &str, outgoing: bool) -> Result<String, NormalizeError> {
    let digits = raw.trim();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(NormalizeError::InvalidAmount(raw.to_string()));
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok("0".to_string());
    }
    Ok(if outgoing {
        format!("-{}", digits)
    } else {
        digits.to_string()
    })
}

pub fn is_zero_amount(raw: &str) -> bool {
    raw.trim().trim_start_matches('0').is_empty()
}

pub fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Relabel transfers as a swap when the account both sent and received distinct assets.
pub fn mark_swap(ops: &mut [Operation]) {
    let transfers: Vec<(&Option<String>, bool)> = ops
        .iter()
        .filter(|op| op.kind == OperationKind::Transfer)
        .filter_map(|op| op.asset.as_ref())
        .map(|a| (&a.contract, a.amount.starts_with('-')))
        .collect();
    let sent: Vec<_> = transfers.iter().filter(|(_, out)| *out).map(|(c, _)| *c).collect();
    let received: Vec<_> = transfers.iter().filter(|(_, out)| !*out).map(|(c, _)| *c).collect();
    let distinct = sent.iter().any(|s| received.iter().any(|r| r != s));
    if !distinct {
        return;
    }
    for op in ops.iter_mut() {
        if op.kind == OperationKind::Transfer {
            op.kind = OperationKind::Swap;
        }
    }
}

/// Keep only activities touching `asset` when a scope is set.
pub fn retain_asset(activities: &mut Vec<crate::model::Activity>, asset: Option<&AssetSlug>) {
    if let Some(slug) = asset {
        activities.retain(|a| a.touches_asset(slug));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AssetRef;

    #[test]
    fn signed_amounts() {
        assert_eq!(signed_amount("1500", true).unwrap(), "-1500");
        assert_eq!(signed_amount("0001500", false).unwrap(), "1500");
        assert_eq!(signed_amount("0", true).unwrap(), "0");
        assert!(signed_amount("1e18", false).is_err());
        assert!(signed_amount("", false).is_err());
    }

    #[test]
    fn parse_time() {
        let t = parse_time_rfc3339("2024-05-01T12:00:00.000000Z").unwrap();
        assert_eq!(t.unix_timestamp(), 1_714_564_800);
        assert!(parse_time_rfc3339("yesterday").is_err());
    }

    fn transfer(contract: Option<&str>, amount: &str) -> Operation {
        Operation {
            kind: OperationKind::Transfer,
            asset: Some(AssetRef {
                contract: contract.map(str::to_string),
                token_id: None,
                amount: amount.into(),
                decimals: None,
            }),
            counterparty: None,
            log_index: None,
        }
    }

    #[test]
    fn swap_needs_both_directions_of_distinct_assets() {
        let mut ops = vec![transfer(None, "-10"), transfer(Some("0xusdc"), "25")];
        mark_swap(&mut ops);
        assert!(ops.iter().all(|op| op.kind == OperationKind::Swap));

        let mut ops = vec![transfer(None, "-10"), transfer(None, "3")];
        mark_swap(&mut ops);
        assert!(ops.iter().all(|op| op.kind == OperationKind::Transfer));
    }
}

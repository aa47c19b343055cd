//! EVM history from a generic indexer: decoded transactions paged by block height.

use crate::chain::http::{endpoint, FetchError, HttpClient};
use crate::chain::normalize::{
    is_zero_amount, mark_swap, normalize, parse_time_rfc3339, retain_asset, same_address,
    signed_amount, NormalizeContext, NormalizeError, RawPage,
};
use crate::chain::source::{ActivityPage, ActivitySource};
use crate::model::{Activity, ActivityStatus, AssetRef, AssetSlug, ChainKey, Operation, OperationKind};
use crate::pointer::{EvmBlockCodec, Pointer, PointerCodec};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

const NATIVE_DECIMALS: u8 = 18;
/// Page growth attempts when one block does not fit a page.
const MAX_PAGE_GROWTH: u32 = 2;

#[derive(Clone, Debug, Deserialize)]
pub struct IndexerResponse {
    pub data: IndexerData,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct IndexerData {
    #[serde(default)]
    pub items: Vec<IndexerTransaction>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IndexerTransaction {
    pub tx_hash: String,
    pub block_height: u64,
    pub block_signed_at: String,
    pub tx_offset: u64,
    #[serde(default)]
    pub successful: Option<bool>,
    pub from_address: String,
    #[serde(default)]
    pub to_address: Option<String>,
    #[serde(default = "zero")]
    pub value: String,
    #[serde(default)]
    pub log_events: Vec<IndexerLogEvent>,
}

fn zero() -> String {
    "0".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct IndexerLogEvent {
    pub log_offset: u64,
    pub sender_address: String,
    #[serde(default)]
    pub sender_contract_decimals: Option<u8>,
    #[serde(default)]
    pub decoded: Option<IndexerDecoded>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IndexerDecoded {
    pub name: String,
    #[serde(default)]
    pub params: Vec<IndexerParam>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IndexerParam {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl IndexerDecoded {
    fn param(&self, name: &str) -> Option<String> {
        let p = self.params.iter().find(|p| p.name == name)?;
        match &p.value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            _ => None,
        }
    }
}

pub struct EvmIndexerSource {
    http: Arc<HttpClient>,
    base: Url,
    api_key: Option<String>,
    chain: ChainKey,
    page_size: usize,
}

impl EvmIndexerSource {
    pub fn new(
        http: Arc<HttpClient>,
        base: Url,
        api_key: Option<String>,
        chain_id: u64,
        page_size: usize,
    ) -> Self {
        Self {
            http,
            base,
            api_key,
            chain: ChainKey::Evm(chain_id),
            page_size,
        }
    }

    async fn request(
        &self,
        account: &str,
        older_than: Option<&Pointer>,
        limit: usize,
    ) -> Result<IndexerData, FetchError> {
        let chain_id = match &self.chain {
            ChainKey::Evm(id) => id.to_string(),
            ChainKey::Tezos(id) => id.clone(),
        };
        let mut url = endpoint(
            &self.base,
            &["v1", &chain_id, "address", account, "transactions"],
        )?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("limit", &limit.to_string());
            if let Some(p) = older_than {
                q.append_pair("before-block", &EvmBlockCodec::decode(p)?.to_string());
            }
        }
        let res: IndexerResponse = self.http.get_json(url, self.api_key.as_deref()).await?;
        Ok(res.data)
    }
}

#[async_trait]
impl ActivitySource for EvmIndexerSource {
    fn genesis(&self) -> Pointer {
        EvmBlockCodec::genesis()
    }

    async fn fetch_page(
        &self,
        account: &str,
        asset: Option<&AssetSlug>,
        older_than: Option<&Pointer>,
        cancel: &CancellationToken,
    ) -> Result<ActivityPage, FetchError> {
        let ctx = NormalizeContext {
            chain: &self.chain,
            account,
            asset,
            page_size: self.page_size,
        };
        let mut limit = self.page_size;
        let mut growth = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let data = match self.request(account, older_than, limit).await {
                Ok(data) => data,
                Err(FetchError::Unsupported) => return Ok(ActivityPage::end()),
                Err(e) => return Err(e),
            };
            debug!(chain = %self.chain, count = data.items.len(), has_more = data.has_more, "indexer transactions");
            match normalize(RawPage::EvmIndexer(data), &ctx) {
                Err(NormalizeError::OversizedBlock(block)) if growth < MAX_PAGE_GROWTH => {
                    warn!(chain = %self.chain, block, limit, "block exceeds page; growing page");
                    limit *= 2;
                    growth += 1;
                }
                other => return Ok(other?),
            }
        }
    }
}

/// Build a page that never splits a block: with more data pending, the oldest
/// (possibly partial) block is left for the next page.
pub fn normalize_transactions(
    mut data: IndexerData,
    ctx: &NormalizeContext<'_>,
) -> Result<ActivityPage, NormalizeError> {
    if data.items.is_empty() {
        return Ok(ActivityPage::end());
    }
    data.items
        .sort_by(|a, b| (b.block_height, b.tx_offset).cmp(&(a.block_height, a.tx_offset)));
    let next_pointer = if data.has_more {
        let oldest = data.items[data.items.len() - 1].block_height;
        if data.items.iter().all(|t| t.block_height == oldest) {
            return Err(NormalizeError::OversizedBlock(oldest));
        }
        data.items.retain(|t| t.block_height > oldest);
        Some(EvmBlockCodec::encode(&(oldest + 1)))
    } else {
        None
    };

    let mut activities = Vec::new();
    for tx in &data.items {
        if let Some(activity) = transaction_activity(tx, ctx)? {
            activities.push(activity);
        }
    }
    retain_asset(&mut activities, ctx.asset);
    Activity::sort_newest_first(&mut activities);
    Ok(ActivityPage {
        activities,
        reached_end: next_pointer.is_none(),
        next_pointer,
    })
}

fn transaction_activity(
    tx: &IndexerTransaction,
    ctx: &NormalizeContext<'_>,
) -> Result<Option<Activity>, NormalizeError> {
    let account = ctx.account;
    let from_me = same_address(&tx.from_address, account);
    let to_me = tx.to_address.as_deref().is_some_and(|t| same_address(t, account));
    let mut operations = Vec::new();

    if !is_zero_amount(&tx.value) && (from_me || to_me) {
        let counterparty = if from_me {
            tx.to_address.clone()
        } else {
            Some(tx.from_address.clone())
        };
        operations.push(Operation {
            kind: OperationKind::Transfer,
            asset: Some(AssetRef::native(signed_amount(&tx.value, from_me)?, NATIVE_DECIMALS)),
            counterparty: counterparty.map(|c| c.to_lowercase()),
            log_index: None,
        });
    }

    let mut logs: Vec<&IndexerLogEvent> = tx.log_events.iter().collect();
    logs.sort_by_key(|l| l.log_offset);
    for log in logs {
        if let Some(op) = log_operation(log, account)? {
            operations.push(op);
        }
    }

    if operations.is_empty() {
        if !from_me {
            return Ok(None);
        }
        operations.push(Operation {
            kind: OperationKind::Interaction,
            asset: None,
            counterparty: tx.to_address.as_ref().map(|t| t.to_lowercase()),
            log_index: None,
        });
    }
    mark_swap(&mut operations);

    let status = match tx.successful {
        Some(true) => ActivityStatus::Applied,
        Some(false) => ActivityStatus::Failed,
        None => ActivityStatus::Pending,
    };
    Ok(Some(Activity {
        chain: ctx.chain.clone(),
        hash: tx.tx_hash.to_lowercase(),
        added_at: parse_time_rfc3339(&tx.block_signed_at)?,
        status,
        block_height: tx.block_height,
        index: tx.tx_offset,
        pointer: EvmBlockCodec::encode(&tx.block_height),
        operations,
    }))
}

fn log_operation(log: &IndexerLogEvent, account: &str) -> Result<Option<Operation>, NormalizeError> {
    let Some(decoded) = &log.decoded else {
        return Ok(None);
    };
    let contract = Some(log.sender_address.to_lowercase());
    match decoded.name.as_str() {
        "Transfer" => {
            let (Some(from), Some(to)) = (decoded.param("from"), decoded.param("to")) else {
                return Ok(None);
            };
            let outgoing = same_address(&from, account);
            if !outgoing && !same_address(&to, account) {
                return Ok(None);
            }
            // ERC-721 transfers carry `tokenId` instead of `value`.
            let (token_id, amount) = match decoded.param("value") {
                Some(value) => (None, value),
                None => (decoded.param("tokenId"), "1".to_string()),
            };
            Ok(Some(Operation {
                kind: OperationKind::Transfer,
                asset: Some(AssetRef {
                    contract,
                    token_id,
                    amount: signed_amount(&amount, outgoing)?,
                    decimals: log.sender_contract_decimals,
                }),
                counterparty: Some(if outgoing { to } else { from }.to_lowercase()),
                log_index: Some(log.log_offset),
            }))
        }
        "Approval" | "ApprovalForAll" => {
            let Some(owner) = decoded.param("owner") else {
                return Ok(None);
            };
            if !same_address(&owner, account) {
                return Ok(None);
            }
            let spender = decoded
                .param("spender")
                .or_else(|| decoded.param("approved"))
                .or_else(|| decoded.param("operator"));
            let amount = decoded
                .param("value")
                .unwrap_or_else(|| "0".to_string());
            Ok(Some(Operation {
                kind: OperationKind::Approval,
                asset: Some(AssetRef {
                    contract,
                    token_id: decoded.param("tokenId"),
                    amount: signed_amount(&amount, false)?,
                    decimals: log.sender_contract_decimals,
                }),
                counterparty: spender.map(|s| s.to_lowercase()),
                log_index: Some(log.log_offset),
            }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: &str = "0x00000000000000000000000000000000000000aa";

    fn data(value: serde_json::Value) -> IndexerData {
        serde_json::from_value::<IndexerResponse>(value).unwrap().data
    }

    fn tx(hash: &str, block: u64, offset: u64, from: &str, to: &str, value: &str) -> serde_json::Value {
        serde_json::json!({
            "tx_hash": hash, "block_height": block, "tx_offset": offset,
            "block_signed_at": format!("2024-05-01T00:{:02}:00Z", block % 60),
            "successful": true, "from_address": from, "to_address": to, "value": value,
            "log_events": []
        })
    }

    #[test]
    fn leaves_oldest_block_for_next_page() {
        let chain = ChainKey::Evm(1);
        let ctx = NormalizeContext { chain: &chain, account: ME, asset: None, page_size: 3 };
        let d = data(serde_json::json!({"data": {"has_more": true, "items": [
            tx("0xa", 12, 0, ME, "0xbb", "10"),
            tx("0xb", 11, 4, "0xcc", ME, "7"),
            tx("0xc", 10, 1, ME, "0xdd", "1")
        ]}}));
        let page = normalize_transactions(d, &ctx).unwrap();
        assert_eq!(page.next_pointer, Some(Pointer::EvmBlock { height: 11 }));
        assert!(!page.reached_end);
        let hashes: Vec<_> = page.activities.iter().map(|a| a.hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xa", "0xb"]);
        assert_eq!(page.activities[1].operations[0].asset.as_ref().unwrap().amount, "7");
    }

    #[test]
    fn single_block_page_is_oversized() {
        let chain = ChainKey::Evm(1);
        let ctx = NormalizeContext { chain: &chain, account: ME, asset: None, page_size: 2 };
        let d = data(serde_json::json!({"data": {"has_more": true, "items": [
            tx("0xa", 12, 1, ME, "0xbb", "10"),
            tx("0xb", 12, 0, ME, "0xbb", "10")
        ]}}));
        assert!(matches!(
            normalize_transactions(d, &ctx),
            Err(NormalizeError::OversizedBlock(12))
        ));
    }

    #[test]
    fn decodes_logs_in_log_order_and_detects_swap() {
        let chain = ChainKey::Evm(137);
        let ctx = NormalizeContext { chain: &chain, account: ME, asset: None, page_size: 10 };
        let d = data(serde_json::json!({"data": {"has_more": false, "items": [{
            "tx_hash": "0xSWAP", "block_height": 50, "tx_offset": 3,
            "block_signed_at": "2024-05-01T00:00:00Z", "successful": true,
            "from_address": ME, "to_address": "0xrouter", "value": "0",
            "log_events": [
                {"log_offset": 9, "sender_address": "0xWETH", "sender_contract_decimals": 18,
                 "decoded": {"name": "Transfer", "params": [
                    {"name": "from", "value": "0xpool"}, {"name": "to", "value": ME}, {"name": "value", "value": "500"}]}},
                {"log_offset": 4, "sender_address": "0xUSDC", "sender_contract_decimals": 6,
                 "decoded": {"name": "Transfer", "params": [
                    {"name": "from", "value": ME}, {"name": "to", "value": "0xpool"}, {"name": "value", "value": "1000"}]}},
                {"log_offset": 2, "sender_address": "0xUSDC", "sender_contract_decimals": 6,
                 "decoded": {"name": "Approval", "params": [
                    {"name": "owner", "value": ME}, {"name": "spender", "value": "0xrouter"}, {"name": "value", "value": "1000"}]}}
            ]
        }]}}));
        let page = normalize_transactions(d, &ctx).unwrap();
        assert!(page.reached_end);
        let a = &page.activities[0];
        assert_eq!(a.hash, "0xswap");
        let kinds: Vec<_> = a.operations.iter().map(|o| (o.kind, o.log_index)).collect();
        assert_eq!(
            kinds,
            vec![
                (OperationKind::Approval, Some(2)),
                (OperationKind::Swap, Some(4)),
                (OperationKind::Swap, Some(9))
            ]
        );
        assert_eq!(a.operations[1].asset.as_ref().unwrap().amount, "-1000");
        assert_eq!(a.operations[1].asset.as_ref().unwrap().contract.as_deref(), Some("0xusdc"));
    }

    #[test]
    fn unrelated_transactions_are_filtered() {
        let chain = ChainKey::Evm(1);
        let ctx = NormalizeContext { chain: &chain, account: ME, asset: None, page_size: 10 };
        let d = data(serde_json::json!({"data": {"has_more": false, "items": [
            tx("0xa", 12, 0, "0xcc", "0xdd", "10")
        ]}}));
        let page = normalize_transactions(d, &ctx).unwrap();
        assert!(page.activities.is_empty());
    }
}

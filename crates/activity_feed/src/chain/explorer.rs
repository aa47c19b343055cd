//! EVM history from a block explorer (Blockscout-style v2 API).
//!
//! Transactions, token transfers and internal transactions are three independently
//! paginated streams of the account. Internal transactions carry native-asset
//! receipts paid out by other accounts' transactions. A page is released down to
//! the oldest block every stream has fully delivered; the pointer is `(block, 0)`,
//! i.e. "this block and everything newer has been seen". Inside a block, activities
//! order by transaction position (log index or internal index when the transaction
//! itself is not in the account's list), descending.

use crate::chain::http::{endpoint, FetchError, HttpClient};
use crate::chain::normalize::{
    is_zero_amount, mark_swap, normalize, parse_time_rfc3339, retain_asset, same_address,
    signed_amount, NormalizeContext, NormalizeError, RawPage,
};
use crate::chain::source::{ActivityPage, ActivitySource};
use crate::model::{Activity, ActivityStatus, AssetRef, AssetSlug, ChainKey, Operation, OperationKind};
use crate::pointer::{ExplorerCodec, ExplorerCursor, Pointer, PointerCodec};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

const NATIVE_DECIMALS: u8 = 18;

pub type PageParams = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Debug, Deserialize)]
pub struct ExplorerList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_params: Option<PageParams>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExplorerAddress {
    pub hash: String,
    #[serde(default)]
    pub is_contract: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExplorerTransaction {
    pub hash: String,
    #[serde(alias = "block")]
    pub block_number: u64,
    #[serde(default)]
    pub position: Option<u64>,
    pub timestamp: String,
    #[serde(default)]
    pub status: Option<String>,
    pub from: ExplorerAddress,
    #[serde(default)]
    pub to: Option<ExplorerAddress>,
    #[serde(default = "zero")]
    pub value: String,
}

fn zero() -> String {
    "0".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExplorerToken {
    #[serde(alias = "address")]
    pub address_hash: String,
    #[serde(default)]
    pub decimals: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExplorerTotal {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExplorerTokenTransfer {
    pub transaction_hash: String,
    #[serde(alias = "block")]
    pub block_number: u64,
    pub log_index: u64,
    pub timestamp: String,
    pub from: ExplorerAddress,
    pub to: ExplorerAddress,
    pub token: ExplorerToken,
    #[serde(default)]
    pub total: ExplorerTotal,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExplorerInternalTx {
    pub transaction_hash: String,
    #[serde(alias = "block")]
    pub block_number: u64,
    pub index: u64,
    pub timestamp: String,
    pub from: ExplorerAddress,
    #[serde(default)]
    pub to: Option<ExplorerAddress>,
    #[serde(default = "zero")]
    pub value: String,
    #[serde(default = "succeeded")]
    pub success: bool,
}

fn succeeded() -> bool {
    true
}

/// One stream's slice for the page being built.
#[derive(Clone, Debug)]
pub struct StreamPage<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

impl<T> StreamPage<T> {
    fn ended() -> Self {
        Self {
            items: Vec::new(),
            has_more: false,
        }
    }
}

/// Everything fetched for one explorer page.
pub struct ExplorerRaw {
    pub transactions: StreamPage<ExplorerTransaction>,
    pub transfers: StreamPage<ExplorerTokenTransfer>,
    pub internal: StreamPage<ExplorerInternalTx>,
}

pub trait Blocked {
    fn block(&self) -> u64;
}

impl Blocked for ExplorerTransaction {
    fn block(&self) -> u64 {
        self.block_number
    }
}

impl Blocked for ExplorerTokenTransfer {
    fn block(&self) -> u64 {
        self.block_number
    }
}

impl Blocked for ExplorerInternalTx {
    fn block(&self) -> u64 {
        self.block_number
    }
}

impl<T: Blocked> StreamPage<T> {
    /// Lowest block this stream has fully delivered, when it has more to give.
    fn floor_candidate(&self) -> Option<u64> {
        if !self.has_more {
            return None;
        }
        self.items.iter().map(Blocked::block).min().map(|b| b + 1)
    }
}

/// Lowest block every stream has fully delivered, or `None` when none has more.
fn release_floor(raw: &ExplorerRaw) -> Option<u64> {
    [
        raw.transactions.floor_candidate(),
        raw.transfers.floor_candidate(),
        raw.internal.floor_candidate(),
    ]
    .into_iter()
    .flatten()
    .max()
}

/// Follow `next_page_params` until the collected items span more than one block
/// or the stream ends, so the newest block of a stream page is always complete.
pub async fn complete_first_block<T, F, Fut>(
    first: ExplorerList<T>,
    mut fetch_more: F,
    cancel: &CancellationToken,
) -> Result<StreamPage<T>, FetchError>
where
    T: Blocked,
    F: FnMut(PageParams) -> Fut,
    Fut: Future<Output = Result<ExplorerList<T>, FetchError>>,
{
    let mut items = first.items;
    let mut next = first.next_page_params;
    loop {
        let single_block = match (items.first(), items.last()) {
            (Some(a), Some(b)) => a.block() == b.block(),
            _ => false,
        };
        if !single_block {
            break;
        }
        let Some(params) = next.take() else {
            break;
        };
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let more = fetch_more(params).await?;
        if more.items.is_empty() {
            break;
        }
        items.extend(more.items);
        next = more.next_page_params;
    }
    Ok(StreamPage {
        has_more: next.is_some() && !items.is_empty(),
        items,
    })
}

pub struct ExplorerSource {
    http: Arc<HttpClient>,
    base: Url,
    chain: ChainKey,
    page_size: usize,
}

impl ExplorerSource {
    pub fn new(http: Arc<HttpClient>, base: Url, chain_id: u64, page_size: usize) -> Self {
        Self {
            http,
            base,
            chain: ChainKey::Evm(chain_id),
            page_size,
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        params: &PageParams,
    ) -> Result<ExplorerList<T>, FetchError> {
        let mut url = endpoint(&self.base, segments)?;
        if !params.is_empty() {
            let mut q = url.query_pairs_mut();
            for (k, v) in params {
                match v {
                    serde_json::Value::String(s) => q.append_pair(k, s),
                    serde_json::Value::Null => continue,
                    other => q.append_pair(k, &other.to_string()),
                };
            }
        }
        self.http.get_json(url, None).await
    }

    /// First page of a stream below `cursor`, extended until its newest block is complete.
    async fn stream<T: DeserializeOwned + Blocked>(
        &self,
        account: &str,
        kind: &str,
        cursor: Option<ExplorerCursor>,
        cancel: &CancellationToken,
    ) -> Result<StreamPage<T>, FetchError> {
        let segments = ["v2", "addresses", account, kind];
        let mut params = PageParams::new();
        if let Some(c) = cursor {
            params.insert("block_number".into(), c.block_number.into());
            params.insert("index".into(), c.index.into());
            params.insert("items_count".into(), self.page_size.into());
            if kind == "internal-transactions" {
                params.insert("transaction_index".into(), c.index.into());
            }
        }
        let first: ExplorerList<T> = match self.list(&segments, &params).await {
            Ok(list) => list,
            Err(FetchError::Unsupported) => return Ok(StreamPage::ended()),
            Err(e) => return Err(e),
        };
        complete_first_block(
            first,
            |params| async move {
                debug!(chain = %self.chain, kind, "explorer block continues on next page");
                self.list(&segments, &params).await
            },
            cancel,
        )
        .await
    }
}

#[async_trait]
impl ActivitySource for ExplorerSource {
    fn genesis(&self) -> Pointer {
        ExplorerCodec::genesis()
    }

    async fn fetch_page(
        &self,
        account: &str,
        asset: Option<&AssetSlug>,
        older_than: Option<&Pointer>,
        cancel: &CancellationToken,
    ) -> Result<ActivityPage, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let cursor = older_than.map(ExplorerCodec::decode).transpose()?;
        let (transactions, transfers, internal) = futures::try_join!(
            self.stream::<ExplorerTransaction>(account, "transactions", cursor, cancel),
            self.stream::<ExplorerTokenTransfer>(account, "token-transfers", cursor, cancel),
            self.stream::<ExplorerInternalTx>(account, "internal-transactions", cursor, cancel),
        )?;
        debug!(
            chain = %self.chain,
            transactions = transactions.items.len(),
            transfers = transfers.items.len(),
            internal = internal.items.len(),
            "explorer streams"
        );

        let ctx = NormalizeContext {
            chain: &self.chain,
            account,
            asset,
            page_size: self.page_size,
        };
        let raw = ExplorerRaw {
            transactions,
            transfers,
            internal,
        };
        Ok(normalize(RawPage::Explorer(raw), &ctx)?)
    }
}

#[derive(Default)]
struct Bundle<'a> {
    tx: Option<&'a ExplorerTransaction>,
    transfers: Vec<&'a ExplorerTokenTransfer>,
    internal: Vec<&'a ExplorerInternalTx>,
}

pub fn normalize_streams(
    raw: ExplorerRaw,
    ctx: &NormalizeContext<'_>,
) -> Result<ActivityPage, NormalizeError> {
    if raw.transactions.items.is_empty()
        && raw.transfers.items.is_empty()
        && raw.internal.items.is_empty()
    {
        return Ok(ActivityPage::end());
    }
    let floor = release_floor(&raw);
    let min_block = floor.unwrap_or(0);

    let mut order: Vec<String> = Vec::new();
    let mut bundles: HashMap<String, Bundle<'_>> = HashMap::new();
    for tx in raw.transactions.items.iter().filter(|t| t.block_number >= min_block) {
        let hash = tx.hash.to_lowercase();
        if !bundles.contains_key(&hash) {
            order.push(hash.clone());
        }
        bundles.entry(hash).or_default().tx = Some(tx);
    }
    for tr in raw.transfers.items.iter().filter(|t| t.block_number >= min_block) {
        let hash = tr.transaction_hash.to_lowercase();
        if !bundles.contains_key(&hash) {
            order.push(hash.clone());
        }
        bundles.entry(hash).or_default().transfers.push(tr);
    }
    for itx in raw.internal.items.iter().filter(|t| t.block_number >= min_block) {
        let hash = itx.transaction_hash.to_lowercase();
        if !bundles.contains_key(&hash) {
            order.push(hash.clone());
        }
        bundles.entry(hash).or_default().internal.push(itx);
    }
    if let (Some(floor), true) = (floor, order.is_empty()) {
        return Err(NormalizeError::OversizedBlock(floor - 1));
    }

    let mut activities = Vec::new();
    for hash in order {
        let Some(bundle) = bundles.remove(&hash) else {
            continue;
        };
        if let Some(activity) = bundle_activity(hash, bundle, ctx)? {
            activities.push(activity);
        }
    }
    retain_asset(&mut activities, ctx.asset);
    Activity::sort_newest_first(&mut activities);
    let next_pointer = floor.map(|b| {
        ExplorerCodec::encode(&ExplorerCursor {
            block_number: b,
            index: 0,
        })
    });
    Ok(ActivityPage {
        activities,
        reached_end: next_pointer.is_none(),
        next_pointer,
    })
}

fn native_transfer(
    from: &str,
    to: Option<&str>,
    value: &str,
    account: &str,
    log_index: Option<u64>,
) -> Result<Option<Operation>, NormalizeError> {
    let outgoing = same_address(from, account);
    let incoming = to.is_some_and(|t| same_address(t, account));
    if is_zero_amount(value) || !(outgoing || incoming) {
        return Ok(None);
    }
    let counterparty = if outgoing { to } else { Some(from) };
    Ok(Some(Operation {
        kind: OperationKind::Transfer,
        asset: Some(AssetRef::native(signed_amount(value, outgoing)?, NATIVE_DECIMALS)),
        counterparty: counterparty.map(str::to_lowercase),
        log_index,
    }))
}

fn bundle_activity(
    hash: String,
    mut bundle: Bundle<'_>,
    ctx: &NormalizeContext<'_>,
) -> Result<Option<Activity>, NormalizeError> {
    let account = ctx.account;
    bundle.transfers.sort_by_key(|t| t.log_index);
    bundle.internal.sort_by_key(|i| i.index);
    let (block, timestamp, index) = match (bundle.tx, bundle.transfers.first(), bundle.internal.first()) {
        (Some(tx), first, _) => (
            tx.block_number,
            tx.timestamp.as_str(),
            tx.position.or(first.map(|t| t.log_index)).unwrap_or(0),
        ),
        (None, Some(tr), _) => (tr.block_number, tr.timestamp.as_str(), tr.log_index),
        (None, None, Some(itx)) => (itx.block_number, itx.timestamp.as_str(), itx.index),
        (None, None, None) => return Ok(None),
    };

    let mut operations = Vec::new();
    if let Some(tx) = bundle.tx {
        let to = tx.to.as_ref().map(|t| t.hash.as_str());
        if let Some(op) = native_transfer(&tx.from.hash, to, &tx.value, account, None)? {
            operations.push(op);
        }
    }
    for itx in bundle.internal.iter().filter(|i| i.success) {
        let to = itx.to.as_ref().map(|t| t.hash.as_str());
        if let Some(op) = native_transfer(&itx.from.hash, to, &itx.value, account, None)? {
            operations.push(op);
        }
    }
    for tr in &bundle.transfers {
        let outgoing = same_address(&tr.from.hash, account);
        if !outgoing && !same_address(&tr.to.hash, account) {
            continue;
        }
        let amount = tr.total.value.clone().unwrap_or_else(|| "1".to_string());
        operations.push(Operation {
            kind: OperationKind::Transfer,
            asset: Some(AssetRef {
                contract: Some(tr.token.address_hash.to_lowercase()),
                token_id: tr.total.token_id.clone(),
                amount: signed_amount(&amount, outgoing)?,
                decimals: tr.token.decimals.as_deref().and_then(|d| d.parse().ok()),
            }),
            counterparty: Some(if outgoing { &tr.to.hash } else { &tr.from.hash }.to_lowercase()),
            log_index: Some(tr.log_index),
        });
    }
    if operations.is_empty() {
        match bundle.tx {
            Some(tx) if same_address(&tx.from.hash, account) => operations.push(Operation {
                kind: OperationKind::Interaction,
                asset: None,
                counterparty: tx.to.as_ref().map(|t| t.hash.to_lowercase()),
                log_index: None,
            }),
            _ => return Ok(None),
        }
    }
    mark_swap(&mut operations);

    let status = match bundle.tx.map(|t| t.status.as_deref()) {
        Some(Some("ok")) | None => ActivityStatus::Applied,
        Some(Some("error")) => ActivityStatus::Failed,
        Some(_) => ActivityStatus::Pending,
    };
    Ok(Some(Activity {
        chain: ctx.chain.clone(),
        hash,
        added_at: parse_time_rfc3339(timestamp)?,
        status,
        block_height: block,
        index,
        pointer: ExplorerCodec::encode(&ExplorerCursor {
            block_number: block,
            index,
        }),
        operations,
    }))
}

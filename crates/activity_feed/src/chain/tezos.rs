//! Tezos history from a TzKT-style indexer, paged by operation id.
//!
//! A page merges several id-ordered queries: the account's own operation list, plus
//! token `transfer` calls naming the account as receiver in their parameters. Those
//! calls are sent by someone else to a token contract, so the account list misses
//! them. Every query has delivered all of its operations down to its own lowest id,
//! so a page is released down to the highest of those lows.

use crate::chain::http::{endpoint, FetchError, HttpClient};
use crate::chain::normalize::{
    mark_swap, normalize, parse_time_rfc3339, retain_asset, signed_amount, NormalizeContext,
    NormalizeError, RawPage,
};
use crate::chain::source::{ActivityPage, ActivitySource};
use crate::model::{Activity, ActivityStatus, AssetRef, AssetSlug, ChainKey, Operation, OperationKind};
use crate::pointer::{Pointer, PointerCodec, TezosCodec, TzktCursor};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

const TEZ_DECIMALS: u8 = 6;
const OPERATION_TYPES: &str = "transaction,delegation,origination";
/// Largest `limit` the indexer accepts.
const MAX_LIMIT: usize = 10_000;
/// Parameter paths naming a token receiver: FA1.2 `transfer` and FA2 `transfer`.
const RECEIVER_FILTERS: [&str; 2] = ["parameter.to", "parameter.[*].txs.[*].to_"];

#[derive(Clone, Debug, Deserialize)]
pub struct TzktAlias {
    pub address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TzktParameter {
    pub entrypoint: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TzktOperation {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: u64,
    pub level: u64,
    pub timestamp: String,
    pub hash: String,
    #[serde(default)]
    pub sender: Option<TzktAlias>,
    #[serde(default)]
    pub target: Option<TzktAlias>,
    #[serde(default)]
    pub initiator: Option<TzktAlias>,
    #[serde(default)]
    pub new_delegate: Option<TzktAlias>,
    #[serde(default)]
    pub originated_contract: Option<TzktAlias>,
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub parameter: Option<TzktParameter>,
}

impl TzktOperation {
    fn sender(&self) -> Option<&str> {
        self.sender.as_ref().map(|a| a.address.as_str())
    }

    fn target(&self) -> Option<&str> {
        self.target.as_ref().map(|a| a.address.as_str())
    }
}

/// Result of one id-descending query. `full` when it returned as many rows as asked.
#[derive(Clone, Debug)]
pub struct TzktStream {
    pub ops: Vec<TzktOperation>,
    pub full: bool,
}

impl TzktStream {
    pub fn new(ops: Vec<TzktOperation>, limit: usize) -> Self {
        let full = ops.len() >= limit;
        Self { ops, full }
    }
}

pub struct TzktSource {
    http: Arc<HttpClient>,
    base: Url,
    chain: ChainKey,
    page_size: usize,
}

impl TzktSource {
    pub fn new(http: Arc<HttpClient>, base: Url, chain_id: String, page_size: usize) -> Self {
        Self {
            http,
            base,
            chain: ChainKey::Tezos(chain_id),
            page_size,
        }
    }

    async fn query(&self, url: Url, limit: usize) -> Result<TzktStream, FetchError> {
        match self.http.get_json::<Vec<TzktOperation>>(url, None).await {
            Ok(ops) => Ok(TzktStream::new(ops, limit)),
            Err(FetchError::Unsupported) => Ok(TzktStream::new(Vec::new(), limit)),
            Err(e) => Err(e),
        }
    }

    async fn account_operations(
        &self,
        account: &str,
        cursor: Option<&TzktCursor>,
        limit: usize,
    ) -> Result<TzktStream, FetchError> {
        let mut url = endpoint(&self.base, &["v1", "accounts", account, "operations"])?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("type", OPERATION_TYPES);
            q.append_pair("sort", "1");
            q.append_pair("limit", &limit.to_string());
            if let Some(c) = cursor {
                q.append_pair("lastId", &c.last_id.to_string());
            }
        }
        self.query(url, limit).await
    }

    async fn received_tokens(
        &self,
        filter: &str,
        account: &str,
        cursor: Option<&TzktCursor>,
        limit: usize,
    ) -> Result<TzktStream, FetchError> {
        let mut url = endpoint(&self.base, &["v1", "operations", "transactions"])?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair(filter, account);
            q.append_pair("sort.desc", "id");
            q.append_pair("limit", &limit.to_string());
            if let Some(c) = cursor {
                q.append_pair("id.lt", &c.last_id.to_string());
            }
        }
        self.query(url, limit).await
    }

    async fn streams(
        &self,
        account: &str,
        cursor: Option<&TzktCursor>,
        limit: usize,
    ) -> Result<Vec<TzktStream>, FetchError> {
        let (own, fa12, fa2) = futures::try_join!(
            self.account_operations(account, cursor, limit),
            self.received_tokens(RECEIVER_FILTERS[0], account, cursor, limit),
            self.received_tokens(RECEIVER_FILTERS[1], account, cursor, limit),
        )?;
        Ok(vec![own, fa12, fa2])
    }
}

#[async_trait]
impl ActivitySource for TzktSource {
    fn genesis(&self) -> Pointer {
        TezosCodec::genesis()
    }

    async fn fetch_page(
        &self,
        account: &str,
        asset: Option<&AssetSlug>,
        older_than: Option<&Pointer>,
        cancel: &CancellationToken,
    ) -> Result<ActivityPage, FetchError> {
        let cursor = older_than.map(TezosCodec::decode).transpose()?;
        let ctx = NormalizeContext {
            chain: &self.chain,
            account,
            asset,
            page_size: self.page_size,
        };
        let mut limit = self.page_size;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let streams = self.streams(account, cursor.as_ref(), limit).await?;
            debug!(
                chain = %self.chain,
                counts = ?streams.iter().map(|s| s.ops.len()).collect::<Vec<_>>(),
                "tzkt operations"
            );
            match normalize(RawPage::Tezos(streams), &ctx) {
                Err(NormalizeError::OversizedGroup(hash)) if limit < MAX_LIMIT => {
                    warn!(chain = %self.chain, hash = %hash, limit, "operation group fills the page; growing page");
                    limit = limit.saturating_mul(2).min(MAX_LIMIT);
                }
                other => return Ok(other?),
            }
        }
    }
}

/// Single-query page; full when it holds `ctx.page_size` operations.
pub fn normalize_operations(
    ops: Vec<TzktOperation>,
    ctx: &NormalizeContext<'_>,
) -> Result<ActivityPage, NormalizeError> {
    normalize_streams(vec![TzktStream::new(ops, ctx.page_size)], ctx)
}

/// Merge queries, cut at the release floor and group operations by hash into
/// activities. When more data is pending the trailing group is dropped, since it
/// may continue below the floor. A pending page made of one group cannot be split
/// and fails with [`NormalizeError::OversizedGroup`].
pub fn normalize_streams(
    streams: Vec<TzktStream>,
    ctx: &NormalizeContext<'_>,
) -> Result<ActivityPage, NormalizeError> {
    let floor = streams
        .iter()
        .filter(|s| s.full)
        .filter_map(|s| s.ops.iter().map(|o| o.id).min())
        .max();
    let mut seen = HashSet::new();
    let mut ops: Vec<TzktOperation> = streams
        .into_iter()
        .flat_map(|s| s.ops)
        .filter(|o| !matches!(floor, Some(f) if o.id < f))
        .filter(|o| seen.insert(o.id))
        .collect();
    if ops.is_empty() {
        return Ok(ActivityPage::end());
    }
    ops.sort_by(|a, b| b.id.cmp(&a.id));
    if floor.is_some() {
        let last_hash = ops[ops.len() - 1].hash.clone();
        if ops.iter().all(|o| o.hash == last_hash) {
            return Err(NormalizeError::OversizedGroup(last_hash));
        }
        while ops.last().is_some_and(|o| o.hash == last_hash) {
            ops.pop();
        }
    }
    let next_pointer = match (floor, ops.last()) {
        (Some(_), Some(last)) => Some(TezosCodec::encode(&TzktCursor {
            level: last.level,
            last_id: last.id,
        })),
        _ => None,
    };

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<TzktOperation>> = HashMap::new();
    for op in ops {
        if !groups.contains_key(&op.hash) {
            order.push(op.hash.clone());
        }
        groups.entry(op.hash.clone()).or_default().push(op);
    }

    let mut activities = Vec::new();
    for hash in order {
        let Some(mut group) = groups.remove(&hash) else {
            continue;
        };
        group.sort_by_key(|o| o.id);
        if let Some(activity) = group_activity(hash, &group, ctx)? {
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

fn group_activity(
    hash: String,
    group: &[TzktOperation],
    ctx: &NormalizeContext<'_>,
) -> Result<Option<Activity>, NormalizeError> {
    let Some(first) = group.first() else {
        return Ok(None);
    };
    let mut operations = Vec::new();
    for (i, op) in group.iter().enumerate() {
        for mut o in operation_effects(op, ctx.account)? {
            o.log_index = Some(i as u64);
            operations.push(o);
        }
    }
    if operations.is_empty() {
        return Ok(None);
    }
    mark_swap(&mut operations);
    let status = if group
        .iter()
        .any(|o| matches!(o.status.as_deref(), Some("failed" | "backtracked" | "skipped")))
    {
        ActivityStatus::Failed
    } else if group.iter().all(|o| o.status.as_deref() == Some("applied")) {
        ActivityStatus::Applied
    } else {
        ActivityStatus::Pending
    };
    Ok(Some(Activity {
        chain: ctx.chain.clone(),
        hash,
        added_at: parse_time_rfc3339(&first.timestamp)?,
        status,
        block_height: first.level,
        index: first.id,
        pointer: TezosCodec::encode(&TzktCursor {
            level: first.level,
            last_id: first.id,
        }),
        operations,
    }))
}

/// Effects of one indexer operation that involve `account`.
fn operation_effects(op: &TzktOperation, account: &str) -> Result<Vec<Operation>, NormalizeError> {
    let sender = op.sender();
    let target = op.target();
    let is_sender = sender == Some(account);
    let involved = is_sender
        || target == Some(account)
        || op.initiator.as_ref().map(|a| a.address.as_str()) == Some(account);
    let mut out = Vec::new();
    match op.kind.as_str() {
        "transaction" => {
            let amount = op.amount.unwrap_or(0);
            if amount > 0 && involved {
                out.push(Operation {
                    kind: OperationKind::Transfer,
                    asset: Some(AssetRef::native(
                        signed_amount(&amount.to_string(), is_sender)?,
                        TEZ_DECIMALS,
                    )),
                    counterparty: if is_sender { target } else { sender }.map(str::to_string),
                    log_index: None,
                });
            }
            match &op.parameter {
                Some(param) if param.entrypoint == "transfer" => {
                    for t in token_transfers(&param.value) {
                        let outgoing = t.from == account;
                        if !outgoing && t.to != account {
                            continue;
                        }
                        out.push(Operation {
                            kind: OperationKind::Transfer,
                            asset: Some(AssetRef {
                                contract: target.map(str::to_string),
                                token_id: Some(t.token_id),
                                amount: signed_amount(&t.amount, outgoing)?,
                                decimals: None,
                            }),
                            counterparty: Some(if outgoing { t.to } else { t.from }),
                            log_index: None,
                        });
                    }
                }
                Some(param)
                    if is_sender
                        && matches!(param.entrypoint.as_str(), "approve" | "update_operators") =>
                {
                    let spender = param
                        .value
                        .get("spender")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    let allowance = param
                        .value
                        .get("value")
                        .and_then(|v| v.as_str())
                        .unwrap_or("0");
                    out.push(Operation {
                        kind: OperationKind::Approval,
                        asset: Some(AssetRef {
                            contract: target.map(str::to_string),
                            token_id: None,
                            amount: signed_amount(allowance, false)?,
                            decimals: None,
                        }),
                        counterparty: spender,
                        log_index: None,
                    });
                }
                Some(_) if is_sender && out.is_empty() => out.push(Operation {
                    kind: OperationKind::Interaction,
                    asset: None,
                    counterparty: target.map(str::to_string),
                    log_index: None,
                }),
                _ => {}
            }
        }
        "delegation" if is_sender => out.push(Operation {
            kind: OperationKind::Interaction,
            asset: None,
            counterparty: op.new_delegate.as_ref().map(|a| a.address.clone()),
            log_index: None,
        }),
        "origination" if is_sender => out.push(Operation {
            kind: OperationKind::Interaction,
            asset: None,
            counterparty: op.originated_contract.as_ref().map(|a| a.address.clone()),
            log_index: None,
        }),
        _ => {}
    }
    Ok(out)
}

struct TokenTransfer {
    from: String,
    to: String,
    token_id: String,
    amount: String,
}

/// FA1.2 `{from, to, value}` or FA2 `[{from_, txs: [{to_, token_id, amount}]}]`.
fn token_transfers(value: &serde_json::Value) -> Vec<TokenTransfer> {
    let text = |v: &serde_json::Value, k: &str| v.get(k).and_then(|x| x.as_str()).map(str::to_string);
    if let Some(batches) = value.as_array() {
        let mut out = Vec::new();
        for batch in batches {
            let Some(from) = text(batch, "from_") else {
                continue;
            };
            for tx in batch.get("txs").and_then(|t| t.as_array()).into_iter().flatten() {
                if let (Some(to), Some(token_id), Some(amount)) =
                    (text(tx, "to_"), text(tx, "token_id"), text(tx, "amount"))
                {
                    out.push(TokenTransfer {
                        from: from.clone(),
                        to,
                        token_id,
                        amount,
                    });
                }
            }
        }
        return out;
    }
    match (text(value, "from"), text(value, "to"), text(value, "value")) {
        (Some(from), Some(to), Some(amount)) => vec![TokenTransfer {
            from,
            to,
            token_id: "0".to_string(),
            amount,
        }],
        _ => Vec::new(),
    }
}

//! Integration tests normalizing saved indexer and explorer responses.

use activity_feed::chain::evm_indexer::IndexerResponse;
use activity_feed::chain::explorer::{
    ExplorerInternalTx, ExplorerList, ExplorerRaw, ExplorerTokenTransfer, ExplorerTransaction,
    StreamPage,
};
use activity_feed::chain::normalize::{normalize, NormalizeContext, RawPage};
use activity_feed::chain::tezos::{TzktOperation, TzktStream};
use activity_feed::model::{ActivityStatus, OperationKind};
use activity_feed::{AssetSlug, ChainKey, Pointer};
use std::path::Path;

const TEZOS_ME: &str = "tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb";
const EVM_ME: &str = "0x1111111111111111111111111111111111111111";

fn load_fixture<T: serde::de::DeserializeOwned>(path: &str) -> T {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../testdata");
    let full = root.join(path);
    let s =
        std::fs::read_to_string(&full).unwrap_or_else(|e| panic!("read {}: {}", full.display(), e));
    serde_json::from_str(&s).unwrap_or_else(|e| panic!("parse {}: {}", path, e))
}

fn explorer_raw() -> ExplorerRaw {
    let txs: ExplorerList<ExplorerTransaction> = load_fixture("blockscout_transactions.json");
    let transfers: ExplorerList<ExplorerTokenTransfer> =
        load_fixture("blockscout_token_transfers.json");
    let internal: ExplorerList<ExplorerInternalTx> =
        load_fixture("blockscout_internal_transactions.json");
    ExplorerRaw {
        transactions: StreamPage {
            has_more: txs.next_page_params.is_some(),
            items: txs.items,
        },
        transfers: StreamPage {
            has_more: transfers.next_page_params.is_some(),
            items: transfers.items,
        },
        internal: StreamPage {
            has_more: internal.next_page_params.is_some(),
            items: internal.items,
        },
    }
}

#[test]
fn tezos_operations_group_into_activities() {
    let ops: Vec<TzktOperation> = load_fixture("tzkt_operations.json");
    let chain = ChainKey::Tezos("NetXdQprcVkpaWU".into());
    let ctx = NormalizeContext {
        chain: &chain,
        account: TEZOS_ME,
        asset: None,
        page_size: 50,
    };
    let page = normalize(RawPage::Tezos(vec![TzktStream::new(ops, ctx.page_size)]), &ctx).unwrap();
    assert!(page.reached_end);
    let hashes: Vec<&str> = page.activities.iter().map(|a| a.hash.as_str()).collect();
    assert_eq!(hashes, vec!["ooTransferOut", "ooSwap", "ooDelegate", "ooIncoming"]);

    let swap = &page.activities[1];
    assert_eq!(swap.operations.len(), 2);
    assert!(swap.operations.iter().all(|o| o.kind == OperationKind::Swap));
    assert_eq!(swap.pointer, Pointer::Tezos { level: 4999990, id: 5001 });

    let out = &page.activities[0];
    assert_eq!(out.operations[0].asset.as_ref().unwrap().amount, "-2500000");
    assert_eq!(out.status, ActivityStatus::Applied);
}

#[test]
fn tezos_full_page_resumes_below_last_complete_group() {
    let ops: Vec<TzktOperation> = load_fixture("tzkt_operations.json");
    let chain = ChainKey::Tezos("NetXdQprcVkpaWU".into());
    let ctx = NormalizeContext {
        chain: &chain,
        account: TEZOS_ME,
        asset: None,
        page_size: ops.len(),
    };
    let page = normalize(RawPage::Tezos(vec![TzktStream::new(ops, ctx.page_size)]), &ctx).unwrap();
    assert!(!page.reached_end);
    assert_eq!(page.next_pointer, Some(Pointer::Tezos { level: 4800000, id: 3000 }));
    assert_eq!(page.activities.len(), 4);
}

#[test]
fn evm_indexer_page_holds_back_oldest_block() {
    let response: IndexerResponse = load_fixture("evm_indexer_transactions.json");
    let chain = ChainKey::Evm(1);
    let ctx = NormalizeContext {
        chain: &chain,
        account: EVM_ME,
        asset: None,
        page_size: 4,
    };
    let page = normalize(RawPage::EvmIndexer(response.data), &ctx).unwrap();
    assert_eq!(page.next_pointer, Some(Pointer::EvmBlock { height: 171 }));
    let heights: Vec<u64> = page.activities.iter().map(|a| a.block_height).collect();
    assert_eq!(heights, vec![200, 190, 180]);
    assert!(page.activities[0].hash.starts_with("0xaaa"));

    let swap = &page.activities[1];
    let kinds: Vec<OperationKind> = swap.operations.iter().map(|o| o.kind).collect();
    assert_eq!(kinds, vec![OperationKind::Swap, OperationKind::Swap]);
    assert_eq!(swap.operations[0].log_index, Some(10));
    assert_eq!(page.activities[2].operations[0].kind, OperationKind::Approval);
}

#[test]
fn evm_indexer_asset_scope_filters_page() {
    let response: IndexerResponse = load_fixture("evm_indexer_transactions.json");
    let chain = ChainKey::Evm(1);
    let usdc: AssetSlug = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse().unwrap();
    let ctx = NormalizeContext {
        chain: &chain,
        account: EVM_ME,
        asset: Some(&usdc),
        page_size: 4,
    };
    let page = normalize(RawPage::EvmIndexer(response.data), &ctx).unwrap();
    let heights: Vec<u64> = page.activities.iter().map(|a| a.block_height).collect();
    assert_eq!(heights, vec![190, 180]);
    assert_eq!(page.next_pointer, Some(Pointer::EvmBlock { height: 171 }));
}

#[test]
fn explorer_streams_release_down_to_common_floor() {
    let chain = ChainKey::Evm(42793);
    let ctx = NormalizeContext {
        chain: &chain,
        account: EVM_ME,
        asset: None,
        page_size: 50,
    };
    let page = normalize(RawPage::Explorer(explorer_raw()), &ctx).unwrap();
    assert_eq!(
        page.next_pointer,
        Some(Pointer::Explorer {
            block_number: 481,
            index: 0
        })
    );
    let hashes: Vec<String> = page.activities.iter().map(|a| a.hash[..4].to_string()).collect();
    assert_eq!(hashes, vec!["0xe1", "0xf5", "0xe2"]);

    // Paid out by a transaction the account never sent.
    let payout = &page.activities[1];
    assert_eq!(payout.pointer, Pointer::Explorer { block_number: 495, index: 1 });
    let received = payout.operations[0].asset.as_ref().unwrap();
    assert_eq!(received.contract, None);
    assert_eq!(received.amount, "2000000000000000000");
    assert_eq!(
        payout.operations[0].counterparty.as_deref(),
        Some("0xb12db12db12db12db12db12db12db12db12db12d")
    );

    let call = &page.activities[2];
    assert_eq!(call.operations.len(), 1);
    let received = call.operations[0].asset.as_ref().unwrap();
    assert_eq!(received.amount, "700");
    assert_eq!(received.decimals, Some(18));
}

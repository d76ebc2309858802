//! Pipeline tests for the consolidation engine, driving full cycles
//! against a local HTTP endpoint that serves receipt bundles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use tokio::sync::watch;

use tollgate_capability::abilities::{
    ByteRange, ConsolidateError, ConsolidateOk, RetrieveCaveats, RetrieveOk, TrackCaveats,
    RETRIEVE, TRACK,
};
use tollgate_capability::{invoke, Block, Bundle, Capability, Cid, Codec, Out, Receipt};
use tollgate_identity::{Did, Identity, PrincipalResolver};
use tollgate_metrics::Metrics;
use tollgate_tables::{
    ConsolidatedTable, Consumer, ConsumerTable, Db, EgressTable, Result as TableResult,
    SpaceStatsTable, SqliteConsolidatedTable, SqliteEgressTable, SqliteSpaceStatsTable,
};

use crate::Consolidator;

/// Consumer directory stand-in: every space resolves to a provider,
/// with optional per-space overrides.
struct StaticConsumers {
    default_provider: Did,
    overrides: HashMap<Did, Did>,
    customer: Did,
}

impl StaticConsumers {
    fn new(default_provider: Did) -> Self {
        Self {
            default_provider,
            overrides: HashMap::new(),
            customer: Identity::generate().did().clone(),
        }
    }

    fn with_override(mut self, space: Did, provider: Did) -> Self {
        self.overrides.insert(space, provider);
        self
    }
}

#[async_trait]
impl ConsumerTable for StaticConsumers {
    async fn get(&self, space: &Did) -> TableResult<Consumer> {
        let provider = self
            .overrides
            .get(space)
            .cloned()
            .unwrap_or_else(|| self.default_provider.clone());
        Ok(Consumer {
            space: space.clone(),
            provider,
            customer: self.customer.clone(),
            subscription: "sub".into(),
        })
    }

    async fn list_by_customer(&self, _customer: &Did) -> TableResult<Vec<Did>> {
        Ok(vec![])
    }
}

struct Stack {
    consolidator: Arc<Consolidator>,
    egress: Arc<SqliteEgressTable>,
    consolidated: Arc<SqliteConsolidatedTable>,
    space_stats: Arc<SqliteSpaceStatsTable>,
    metrics: Arc<Metrics>,
    service_id: Arc<Identity>,
}

fn stack(consumers: Arc<dyn ConsumerTable>, known_providers: Vec<Did>) -> Stack {
    let db = Db::open_in_memory().unwrap();
    let egress =
        Arc::new(SqliteEgressTable::new(db.clone(), "egress", "egress_unprocessed").unwrap());
    let consolidated = Arc::new(
        SqliteConsolidatedTable::new(db.clone(), "consolidated", "consolidated_node").unwrap(),
    );
    let space_stats = Arc::new(SqliteSpaceStatsTable::new(db, "space_stats").unwrap());
    let metrics = Arc::new(Metrics::new("test"));
    let service_id = Arc::new(Identity::generate());

    let consolidator = Arc::new(Consolidator::new(
        service_id.clone(),
        egress.clone(),
        consolidated.clone(),
        space_stats.clone(),
        consumers,
        known_providers,
        Duration::from_millis(20),
        10,
        Arc::new(PrincipalResolver::default()),
        vec![],
        metrics.clone(),
    ));

    Stack {
        consolidator,
        egress,
        consolidated,
        space_stats,
        metrics,
        service_id,
    }
}

/// A receipt for a retrieval served by `node` out of `space`, with the
/// retrieve invocation self-issued by the space owner.
fn retrieval_receipt(node: &Identity, space: &Identity, range: ByteRange) -> Receipt {
    let cap = Capability::new(
        RETRIEVE,
        space.did().clone(),
        &RetrieveCaveats {
            blob: Cid::of(Codec::Raw, b"blob"),
            range,
        },
    )
    .unwrap();
    let inv = invoke(space, node.did(), cap, vec![]).unwrap();
    Receipt::issue(node, Out::ok(&RetrieveOk::default()).unwrap(), &inv, vec![]).unwrap()
}

/// A flat bundle where each block is an archived receipt.
fn batch_bundle(receipts: &[Receipt]) -> Vec<u8> {
    let blocks = receipts
        .iter()
        .map(|r| Block::raw(r.archive().unwrap()))
        .collect();
    Bundle::new(vec![], blocks).encode().unwrap()
}

/// Serve `body` with `status` on a local listener; returns the endpoint
/// pattern with a `{cid}` placeholder.
async fn serve(body: Vec<u8>, status: u16) -> String {
    let app = Router::new().route(
        "/batches/:cid",
        get(move || {
            let body = body.clone();
            async move { (StatusCode::from_u16(status).unwrap(), body) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/batches/{{cid}}")
}

/// Submit a track for `bundle` at `endpoint` and enqueue the egress
/// record, as the invocation pipeline would.
async fn track_batch(stack: &Stack, node: &Identity, bundle: &[u8], endpoint: &str) -> Cid {
    let batch = Cid::of(Codec::Raw, bundle);
    let cap = Capability::new(
        TRACK,
        stack.service_id.did().clone(),
        &TrackCaveats {
            receipts: batch,
            endpoint: endpoint.to_string(),
        },
    )
    .unwrap();
    let inv = invoke(node, stack.service_id.did(), cap, vec![]).unwrap();
    stack
        .egress
        .record(batch, node.did(), endpoint, &inv)
        .await
        .unwrap();
    stack.metrics.unprocessed_batches.add(1);
    batch
}

async fn space_total_today(stack: &Stack, space: &Identity) -> u64 {
    let today = Utc::now().date_naive();
    stack
        .space_stats
        .get_daily_stats(space.did(), today, today)
        .await
        .unwrap()
        .iter()
        .map(|d| d.egress)
        .sum()
}

#[tokio::test]
async fn happy_path_consolidates_both_spaces() {
    let node = Identity::generate();
    let space1 = Identity::generate();
    let space2 = Identity::generate();
    let provider = Identity::generate();

    let consumers = Arc::new(StaticConsumers::new(provider.did().clone()));
    let stack = stack(consumers, vec![provider.did().clone()]);

    let bundle = batch_bundle(&[
        retrieval_receipt(&node, &space1, ByteRange { start: 0, end: 999 }),
        retrieval_receipt(
            &node,
            &space2,
            ByteRange {
                start: 0,
                end: 1_999_999,
            },
        ),
    ]);
    let endpoint = serve(bundle.clone(), 200).await;
    track_batch(&stack, &node, &bundle, &endpoint).await;

    stack.consolidator.consolidate().await.unwrap();

    assert_eq!(space_total_today(&stack, &space1).await, 1_000);
    assert_eq!(space_total_today(&stack, &space2).await, 2_000_000);
    assert_eq!(stack.egress.count_unprocessed().await.unwrap(), 0);
    assert_eq!(
        stack.metrics.consolidated_bytes.get(&node.did().to_string()),
        2_001_000
    );
    assert_eq!(stack.metrics.unprocessed_batches.get(), 0);

    // The persisted artifact is a signed receipt with the grand total.
    let records = stack
        .consolidated
        .get_stats_by_node(node.did(), Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].total_egress, 2_001_000);

    let receipt = Receipt::extract(&records[0].receipt).unwrap();
    assert!(receipt.verify_signature(&stack.service_id.pubkey()));
    assert_eq!(
        receipt.typed_out::<ConsolidateOk, ConsolidateError>().unwrap(),
        Ok(ConsolidateOk {
            total_egress: 2_001_000
        })
    );

    // The receipt is retrievable by its cause.
    let looked_up = stack
        .consolidator
        .get_receipt(&records[0].cause)
        .await
        .unwrap();
    assert_eq!(looked_up.link(), receipt.link());
}

#[tokio::test]
async fn receipt_from_wrong_issuer_is_skipped() {
    let node = Identity::generate();
    let other_node = Identity::generate();
    let space1 = Identity::generate();
    let space2 = Identity::generate();
    let provider = Identity::generate();

    let consumers = Arc::new(StaticConsumers::new(provider.did().clone()));
    let stack = stack(consumers, vec![provider.did().clone()]);

    let bundle = batch_bundle(&[
        // Issued by a different principal than the batch submitter.
        retrieval_receipt(&other_node, &space1, ByteRange { start: 0, end: 999 }),
        retrieval_receipt(
            &node,
            &space2,
            ByteRange {
                start: 0,
                end: 1_999_999,
            },
        ),
    ]);
    let endpoint = serve(bundle.clone(), 200).await;
    track_batch(&stack, &node, &bundle, &endpoint).await;

    stack.consolidator.consolidate().await.unwrap();

    assert_eq!(space_total_today(&stack, &space1).await, 0);
    assert_eq!(space_total_today(&stack, &space2).await, 2_000_000);
    assert_eq!(
        stack.metrics.consolidated_bytes.get(&node.did().to_string()),
        2_000_000
    );
}

#[tokio::test]
async fn unknown_provider_contribution_is_skipped() {
    let node = Identity::generate();
    let space1 = Identity::generate();
    let space2 = Identity::generate();
    let known_provider = Identity::generate();
    let unknown_provider = Identity::generate();

    let consumers = Arc::new(
        StaticConsumers::new(known_provider.did().clone())
            .with_override(space1.did().clone(), unknown_provider.did().clone()),
    );
    let stack = stack(consumers, vec![known_provider.did().clone()]);

    let bundle = batch_bundle(&[
        retrieval_receipt(&node, &space1, ByteRange { start: 0, end: 999 }),
        retrieval_receipt(
            &node,
            &space2,
            ByteRange {
                start: 0,
                end: 1_999_999,
            },
        ),
    ]);
    let endpoint = serve(bundle.clone(), 200).await;
    track_batch(&stack, &node, &bundle, &endpoint).await;

    stack.consolidator.consolidate().await.unwrap();

    assert_eq!(space_total_today(&stack, &space1).await, 0);
    assert_eq!(space_total_today(&stack, &space2).await, 2_000_000);
}

#[tokio::test]
async fn failure_receipts_and_foreign_abilities_are_skipped() {
    let node = Identity::generate();
    let space = Identity::generate();
    let provider = Identity::generate();

    let consumers = Arc::new(StaticConsumers::new(provider.did().clone()));
    let stack = stack(consumers, vec![provider.did().clone()]);

    // A failure receipt.
    let cap = Capability::new(
        RETRIEVE,
        space.did().clone(),
        &RetrieveCaveats {
            blob: Cid::of(Codec::Raw, b"blob"),
            range: ByteRange { start: 0, end: 99 },
        },
    )
    .unwrap();
    let inv = invoke(&space, node.did(), cap, vec![]).unwrap();
    let failure = Receipt::issue(
        &node,
        Out::err(&ConsolidateError::new("range unavailable")).unwrap(),
        &inv,
        vec![],
    )
    .unwrap();

    // A receipt for a non-retrieve invocation.
    let track_cap = Capability::bare(TRACK, space.did().clone());
    let track_inv = invoke(&space, node.did(), track_cap, vec![]).unwrap();
    let foreign = Receipt::issue(
        &node,
        Out::ok(&RetrieveOk::default()).unwrap(),
        &track_inv,
        vec![],
    )
    .unwrap();

    let valid = retrieval_receipt(&node, &space, ByteRange { start: 0, end: 499 });

    let bundle = batch_bundle(&[failure, foreign, valid]);
    let endpoint = serve(bundle.clone(), 200).await;
    track_batch(&stack, &node, &bundle, &endpoint).await;

    stack.consolidator.consolidate().await.unwrap();

    assert_eq!(space_total_today(&stack, &space).await, 500);
    assert_eq!(stack.egress.count_unprocessed().await.unwrap(), 0);
}

#[tokio::test]
async fn replaying_a_batch_is_idempotent() {
    let node = Identity::generate();
    let space = Identity::generate();
    let provider = Identity::generate();

    let consumers = Arc::new(StaticConsumers::new(provider.did().clone()));
    let stack = stack(consumers, vec![provider.did().clone()]);

    let bundle = batch_bundle(&[retrieval_receipt(
        &node,
        &space,
        ByteRange { start: 0, end: 999 },
    )]);
    let endpoint = serve(bundle.clone(), 200).await;
    track_batch(&stack, &node, &bundle, &endpoint).await;

    stack.consolidator.consolidate().await.unwrap();
    assert_eq!(
        stack.metrics.consolidated_bytes.get(&node.did().to_string()),
        1_000
    );

    // The node re-submits the identical batch; the conditional insert
    // is swallowed as success and the meter does not double.
    track_batch(&stack, &node, &bundle, &endpoint).await;
    stack.consolidator.consolidate().await.unwrap();

    assert_eq!(stack.egress.count_unprocessed().await.unwrap(), 0);
    let records = stack
        .consolidated
        .get_stats_by_node(node.did(), Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        stack.metrics.consolidated_bytes.get(&node.did().to_string()),
        1_000
    );
}

#[tokio::test]
async fn failed_endpoint_gets_persisted_error_receipt() {
    let node = Identity::generate();
    let space = Identity::generate();
    let provider = Identity::generate();

    let consumers = Arc::new(StaticConsumers::new(provider.did().clone()));
    let stack = stack(consumers, vec![provider.did().clone()]);

    // One batch behind a broken endpoint, one behind a healthy one.
    let broken_endpoint = serve(vec![], 500).await;
    let bad_bundle = b"whatever".to_vec();
    track_batch(&stack, &node, &bad_bundle, &broken_endpoint).await;

    let good_bundle = batch_bundle(&[retrieval_receipt(
        &node,
        &space,
        ByteRange { start: 0, end: 999 },
    )]);
    let good_endpoint = serve(good_bundle.clone(), 200).await;
    track_batch(&stack, &node, &good_bundle, &good_endpoint).await;

    stack.consolidator.consolidate().await.unwrap();

    // Both batches are done: the broken one is not retried.
    assert_eq!(stack.egress.count_unprocessed().await.unwrap(), 0);

    let records = stack
        .consolidated
        .get_stats_by_node(node.did(), Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);

    let mut totals: Vec<u64> = records.iter().map(|r| r.total_egress).collect();
    totals.sort();
    assert_eq!(totals, vec![0, 1_000]);

    // The zero-total record carries a signed error receipt.
    let error_record = records.iter().find(|r| r.total_egress == 0).unwrap();
    let receipt = Receipt::extract(&error_record.receipt).unwrap();
    assert!(receipt.verify_signature(&stack.service_id.pubkey()));
    let out = receipt
        .typed_out::<ConsolidateOk, ConsolidateError>()
        .unwrap();
    assert!(out.is_err());
}

#[tokio::test]
async fn engine_runs_on_ticks_and_stops() {
    let node = Identity::generate();
    let space = Identity::generate();
    let provider = Identity::generate();

    let consumers = Arc::new(StaticConsumers::new(provider.did().clone()));
    let stack = stack(consumers, vec![provider.did().clone()]);

    let bundle = batch_bundle(&[retrieval_receipt(
        &node,
        &space,
        ByteRange { start: 0, end: 9 },
    )]);
    let endpoint = serve(bundle.clone(), 200).await;
    track_batch(&stack, &node, &bundle, &endpoint).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = stack.consolidator.clone();
    let task = tokio::spawn(engine.start(shutdown_rx));

    // Give the ticker a few intervals to drain the queue.
    for _ in 0..50 {
        if stack.egress.count_unprocessed().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stack.egress.count_unprocessed().await.unwrap(), 0);

    stack.consolidator.stop();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("engine should stop promptly")
        .unwrap();
}

#[tokio::test]
async fn shutdown_channel_stops_the_engine() {
    let provider = Identity::generate();
    let consumers = Arc::new(StaticConsumers::new(provider.did().clone()));
    let stack = stack(consumers, vec![provider.did().clone()]);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = stack.consolidator.clone();
    let task = tokio::spawn(engine.start(shutdown_rx));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("engine should observe shutdown")
        .unwrap();
}

//! End-to-end execution against the mock chain: dispatcher, coordinator,
//! retries, breakers, persistence and restart reconciliation.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use fastlane::chain::PrebuiltCalldata;
use fastlane::config::AppConfig;
use fastlane::engine::coordinator::{ExecutionCoordinator, Resolution};
use fastlane::engine::pool::Dispatcher;
use fastlane::engine::reconciler::Reconciler;
use fastlane::engine::{Collaborators, ExecutionServices};
use fastlane::events::{ChannelObserver, CollectingObserver, ExecutionEvent, ExecutionObserver};
use fastlane::storage::{JsonFileStore, MemoryStore, StateStore, TransitionMeta};
use fastlane::types::{ErrorKind, Lane, Opportunity, RiskScore, SwapParams, TxStatus, Urgency};

use crate::mock_chain::{MockChain, MockSigner};

const ACCOUNT: &str = "0xfeed";
const CHAIN: u64 = 1;

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.call_timeout_ms = 500;
    config.engine.confirm_poll_ms = 5;
    config.engine.confirm_timeout_secs = 1;
    config.engine.max_concurrent = 4;
    config
}

fn services(
    chain: Arc<MockChain>,
    persistence: Arc<dyn StateStore>,
    observer: Arc<dyn ExecutionObserver>,
) -> Arc<ExecutionServices> {
    let (services, _writer) = ExecutionServices::assemble(
        config(),
        Collaborators {
            provider: chain,
            signer: Arc::new(MockSigner),
            encoder: Arc::new(PrebuiltCalldata::default()),
            risk_source: None,
            observer,
        },
        persistence,
    );
    Arc::new(services)
}

fn opportunity(fingerprint: &str) -> Opportunity {
    Opportunity {
        fingerprint: fingerprint.to_string(),
        account_id: ACCOUNT.to_string(),
        chain_id: CHAIN,
        lane: Lane::Fast,
        urgency: Urgency::Normal,
        swap: SwapParams {
            router: "0xrouter".to_string(),
            token_in: "WETH".to_string(),
            token_out: "USDC".to_string(),
            amount_in: dec!(2),
            min_amount_out: dec!(6000),
            calldata: Some("0x38ed1739".to_string()),
            gas_limit: Some(250_000),
        },
        detected_at: Utc::now(),
    }
}

fn seed(services: &ExecutionServices, fingerprint: &str, score: Decimal) {
    services.risk.set(
        fingerprint,
        RiskScore {
            score,
            categories: BTreeMap::new(),
            computed_at: Utc::now(),
        },
    );
}

fn temp_state_path() -> PathBuf {
    std::env::temp_dir().join(format!("fastlane-it-{}.json", uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn test_dispatched_opportunities_confirm_with_unique_nonces() {
    let chain = Arc::new(MockChain::new("mock", Some(1)));
    let observer = Arc::new(CollectingObserver::default());
    let services = services(chain.clone(), Arc::new(MemoryStore::default()), observer.clone());

    let (tx, rx) = mpsc::channel(32);
    for i in 0..12 {
        let fp = format!("opp-{i}");
        seed(&services, &fp, dec!(0.2));
        tx.send(opportunity(&fp)).await.unwrap();
    }
    drop(tx);

    let report = Dispatcher::new(services.clone())
        .run(rx, CancellationToken::new())
        .await;
    assert_eq!(report.confirmed, 12);

    let nonces: BTreeSet<u64> = chain.accepted_nonces().into_iter().collect();
    assert_eq!(nonces, (0..12).collect());
    assert_eq!(chain.broadcasts().len(), 12);
    assert_eq!(
        observer.count(|e| matches!(e, ExecutionEvent::Terminal { resolution: Resolution::Confirmed, .. })),
        12
    );
}

#[tokio::test]
async fn test_underpriced_bids_are_escalated() {
    let chain = Arc::new(MockChain::new("mock", Some(1)));
    chain.script_failures(&[
        "replacement transaction underpriced",
        "transaction underpriced",
    ]);
    let services = services(
        chain.clone(),
        Arc::new(MemoryStore::default()),
        Arc::new(CollectingObserver::default()),
    );
    seed(&services, "opp-1", dec!(0.2));

    let outcome = ExecutionCoordinator::new(services.clone())
        .execute(&opportunity("opp-1"), &services.context(&CancellationToken::new()))
        .await;

    assert_eq!(outcome.resolution, Resolution::Confirmed);
    let fees: Vec<Decimal> = chain.broadcasts().iter().map(|b| b.priority_fee).collect();
    assert_eq!(fees, vec![dec!(2.00), dec!(2.30), dec!(2.65)]);
    let gas = outcome.record.unwrap().gas.unwrap();
    assert_eq!(gas.cumulative_escalation_pct, dec!(32.25));
    // Underpriced bids are the caller's fault, not the resource's.
    let state = services.breakers.get_state("tx-submit:chain-1");
    assert_eq!(state.failures(), 0);
}

#[tokio::test]
async fn test_revert_on_broadcast_is_terminal() {
    let chain = Arc::new(MockChain::new("mock", Some(1)));
    chain.script_failures(&["execution reverted: INSUFFICIENT_OUTPUT_AMOUNT"]);
    let services = services(
        chain.clone(),
        Arc::new(MemoryStore::default()),
        Arc::new(CollectingObserver::default()),
    );
    seed(&services, "opp-1", dec!(0.2));

    let outcome = ExecutionCoordinator::new(services.clone())
        .execute(&opportunity("opp-1"), &services.context(&CancellationToken::new()))
        .await;

    assert_eq!(outcome.resolution, Resolution::Failed);
    assert_eq!(outcome.error.unwrap().kind(), ErrorKind::Fatal);
    // Terminal records are frozen.
    let record_id = outcome.record.as_ref().unwrap().id;
    assert_err!(
        services
            .store
            .transition(record_id, TxStatus::Pending, TransitionMeta::none())
            .await
    );
    assert_eq!(chain.broadcasts().len(), 1);
    let record = outcome.record.unwrap();
    assert_eq!(record.status, TxStatus::Failed);

    // The nonce never reached a block, so the next opportunity reuses it.
    seed(&services, "opp-2", dec!(0.2));
    let next = ExecutionCoordinator::new(services.clone())
        .execute(&opportunity("opp-2"), &services.context(&CancellationToken::new()))
        .await;
    assert_eq!(next.record.unwrap().nonce, record.nonce);
}

#[tokio::test]
async fn test_cascade_trip_abandons_monitoring() {
    let chain = Arc::new(MockChain::new("mock", None));
    let services = services(
        chain.clone(),
        Arc::new(MemoryStore::default()),
        Arc::new(CollectingObserver::default()),
    );
    seed(&services, "opp-1", dec!(0.2));

    let coordinator = Arc::new(
        ExecutionCoordinator::new(services.clone()).with_confirm_timeout(Duration::from_secs(30)),
    );
    let ctx = services.context(&CancellationToken::new());
    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute(&opportunity("opp-1"), &ctx).await })
    };

    while chain.accepted_nonces().is_empty() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for key in ["tx-submit:chain-10", "tx-submit:chain-137", "rpc:backup"] {
        for _ in 0..10 {
            services.breakers.record_outcome(key, false);
        }
    }

    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("coordinator did not observe protection")
        .unwrap();
    assert_eq!(outcome.resolution, Resolution::MonitoringAbandoned);
    assert_eq!(outcome.record.unwrap().status, TxStatus::Pending);
    assert!(!services.breakers.check("tx-submit:chain-1").is_allowed());

    // New work is refused while protection is open.
    seed(&services, "opp-2", dec!(0.2));
    let refused = coordinator
        .execute(&opportunity("opp-2"), &services.context(&CancellationToken::new()))
        .await;
    assert_eq!(refused.resolution, Resolution::Abandoned);
    assert_eq!(refused.error.unwrap().kind(), ErrorKind::CircuitOpen);
}

#[tokio::test]
async fn test_restart_reconciles_and_replays() {
    let path = temp_state_path();
    let chain = Arc::new(MockChain::new("mock", None));

    // First process: broadcast, then stop watching.
    let record_id = {
        let persistence: Arc<dyn StateStore> = Arc::new(JsonFileStore::open(&path).unwrap());
        let services = services(chain.clone(), persistence, Arc::new(CollectingObserver::default()));
        seed(&services, "opp-1", dec!(0.2));
        let shutdown = CancellationToken::new();
        let ctx = services.context(&shutdown);
        let coordinator = ExecutionCoordinator::new(services.clone());

        let stopper = {
            let chain = chain.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while chain.accepted_nonces().is_empty() {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                shutdown.cancel();
            })
        };
        let outcome = coordinator.execute(&opportunity("opp-1"), &ctx).await;
        stopper.await.unwrap();
        assert_eq!(outcome.resolution, Resolution::MonitoringAbandoned);
        outcome.record.unwrap().id
    };

    chain.mine_all();

    // Second process: reload, reconcile, replay.
    let persistence: Arc<dyn StateStore> = Arc::new(JsonFileStore::open(&path).unwrap());
    let services = services(chain.clone(), persistence, Arc::new(CollectingObserver::default()));
    assert_eq!(assert_ok!(services.store.restore().await), 1);

    let report = Reconciler::new(services.clone()).run_once().await;
    assert_eq!(report.confirmed, 1);
    assert_eq!(services.store.get(record_id).await.unwrap().status, TxStatus::Confirmed);

    let replay = ExecutionCoordinator::new(services.clone())
        .execute(&opportunity("opp-1"), &services.context(&CancellationToken::new()))
        .await;
    assert!(replay.replayed);
    assert_eq!(replay.resolution, Resolution::Confirmed);
    assert_eq!(chain.broadcasts().len(), 1);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_channel_observer_streams_stages() {
    let chain = Arc::new(MockChain::new("mock", Some(1)));
    let (observer, mut events) = ChannelObserver::new(64);
    let services = services(chain, Arc::new(MemoryStore::default()), Arc::new(observer));
    seed(&services, "opp-1", dec!(0.2));

    ExecutionCoordinator::new(services.clone())
        .execute(&opportunity("opp-1"), &services.context(&CancellationToken::new()))
        .await;

    let mut stages = 0;
    let mut terminal = None;
    let mut attempts = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ExecutionEvent::StageCompleted { .. } => stages += 1,
            ExecutionEvent::RetryAttempted(_) => attempts += 1,
            ExecutionEvent::Terminal { resolution, .. } => terminal = Some(resolution),
            _ => {}
        }
    }
    assert_eq!(stages, 6);
    assert_eq!(attempts, 1);
    assert_eq!(terminal, Some(Resolution::Confirmed));
}

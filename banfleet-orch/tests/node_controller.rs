// Node controller reconciliation against the real cache stack.
//
// Principles:
// 1. The full pipeline runs against an in-process KV, no mocks
// 2. State-based verification of the controller's gating rules
// 3. No live agents: tests cover the paths that take no RPC action
//    and the paths that must fail before dialing anyone

use std::sync::Arc;
use std::time::Duration;

use banfleet_cache::{ControllerImpl, DeltaFifo, Informer, Reflector, Store};
use banfleet_kv::memory::MemoryKv;
use banfleet_kv::ListerWatcher;
use banfleet_orch::controller::client_pool::AgentClientPool;
use banfleet_orch::controller::node::NodeController;
use banfleet_orch::model::node::{AgentInfo, AgentStatus, ErrorTime};
use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

struct Harness {
    kv: MemoryKv,
    informer: Arc<Informer<String>>,
    controller: NodeController,
    cancel: CancellationToken,
}

fn harness() -> Harness {
    let kv = MemoryKv::new();
    let fifo = Arc::new(DeltaFifo::with_wait(1));
    let informer = Informer::new(fifo.clone());
    let lw: Arc<dyn ListerWatcher<String>> = Arc::new(kv.clone());
    let reflector = Arc::new(Reflector::new(
        lw,
        "node_test_reflector",
        "/agent/node/",
        fifo as Arc<dyn Store<String>>,
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { reflector.run(cancel).await });
    }
    {
        let informer = informer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { informer.run(cancel).await });
    }

    let controller = NodeController::new(Arc::new(AgentClientPool::new(None)));
    Harness { kv, informer, controller, cancel }
}

async fn settle(harness: &Harness, key: &str) {
    let cancel = CancellationToken::new();
    assert!(harness.informer.wait_for_cache_sync(&cancel).await);
    for _ in 0..500 {
        if harness.informer.get(key).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("key {key} never reached the cache");
}

fn info(enable: bool, config: &str) -> String {
    serde_json::to_string(&AgentInfo {
        name: "n1".to_string(),
        labels: vec![],
        enable,
        config: config.to_string(),
    })
    .unwrap()
}

fn status(phase: &str, config: &str, error: Option<ErrorTime>) -> String {
    serde_json::to_string(&AgentStatus {
        name: "n1".to_string(),
        grpc_endpoint: "127.0.0.1:1".to_string(),
        config: config.to_string(),
        phase: phase.to_string(),
        error,
    })
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_action_unless_both_info_and_status_are_cached() {
    let h = harness();

    // Only the desired state exists: reconcile must be a clean skip,
    // not an error and not an RPC attempt.
    h.kv.put("/agent/node/info/n1", info(true, "default"));
    settle(&h, "/agent/node/info/n1").await;

    let reader = h.informer.reader();
    assert!(h.controller.sync("n1", &reader).await.is_ok());

    // Only the reported state exists.
    h.kv.delete("/agent/node/info/n1");
    h.kv.put("/agent/node/status/n1", status("Ready", "", None));
    settle(&h, "/agent/node/status/n1").await;
    for _ in 0..500 {
        if h.informer.get("/agent/node/info/n1").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.controller.sync("n1", &reader).await.is_ok());

    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reported_error_defers_reconcile_until_the_retry_window() {
    let h = harness();
    let retry_at = Utc::now() + ChronoDuration::seconds(60);
    h.kv.put("/agent/node/info/n1", info(true, "default"));
    h.kv.put(
        "/agent/node/status/n1",
        status("Ready", "", Some(ErrorTime { message: "attach failed".to_string(), retry_at })),
    );
    settle(&h, "/agent/node/status/n1").await;

    let reader = h.informer.reader();
    let err = h.controller.sync("n1", &reader).await.unwrap_err();
    assert!(err.to_string().contains("retry"));

    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_and_stopped_agent_needs_no_rpc() {
    let h = harness();
    h.kv.put("/agent/node/info/n1", info(false, "default"));
    h.kv.put("/agent/node/status/n1", status("Stopped", "default", None));
    settle(&h, "/agent/node/status/n1").await;

    let reader = h.informer.reader();
    // Desired: disabled; reported: already stopped. Nothing to do, and
    // with no reachable agent this would fail if it tried to dial.
    assert!(h.controller.sync("n1", &reader).await.is_ok());

    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_with_matching_config_is_stable() {
    let h = harness();
    h.kv.put("/agent/node/info/n1", info(true, "default"));
    h.kv.put("/agent/node/status/n1", status("Running", "default", None));
    settle(&h, "/agent/node/status/n1").await;

    let reader = h.informer.reader();
    assert!(h.controller.sync("n1", &reader).await.is_ok());

    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_agent_attempts_a_start() {
    let h = harness();
    h.kv.put("/agent/node/info/n1", info(true, "default"));
    h.kv.put("/agent/node/status/n1", status("Ready", "", None));
    settle(&h, "/agent/node/status/n1").await;

    let reader = h.informer.reader();
    // The policy decides to start; the unreachable endpoint turns that
    // into a retryable error, which is exactly what the queue expects.
    assert!(h.controller.sync("n1", &reader).await.is_err());

    h.cancel.cancel();
}

#[test]
fn queue_key_is_the_agent_name() {
    let controller = NodeController::new(Arc::new(AgentClientPool::new(None)));
    assert_eq!(controller.key_processor("/agent/node/info/n1"), "n1");
    assert_eq!(controller.key_processor("/agent/node/status/n1"), "n1");
}

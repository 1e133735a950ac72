//! Reconciliation controllers, gated on leadership.

pub mod client_pool;
pub mod node;
pub mod strategy;

use std::sync::Arc;

use banfleet_cache::{Controller, ControllerOptions, DeltaFifo, Informer, Reflector, Store};
use banfleet_kv::election::Instance;
use banfleet_kv::{EtcdClient, ListerWatcher};
use tokio_util::sync::CancellationToken;

use crate::logic::Logic;
use crate::storage::{AGENT_NODE_DIR, APPLIED_RUNNING_DIR};

/// One fully-wired reconciliation engine: two reflectors feeding one
/// informer, with the node and strategy controllers on top. Built
/// fresh each time this orchestrator becomes leader, torn down when
/// leadership is lost.
pub struct ControllerInstance {
    client: EtcdClient,
    logic: Arc<Logic>,
    pool: Arc<client_pool::AgentClientPool>,
    cancel: Option<CancellationToken>,
}

impl ControllerInstance {
    pub fn new(client: EtcdClient, logic: Arc<Logic>, pool: Arc<client_pool::AgentClientPool>) -> Self {
        Self { client, logic, pool, cancel: None }
    }
}

impl Instance for ControllerInstance {
    fn run(&mut self) {
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        // Two reflectors share the FIFO, so cache sync waits for both
        // initial lists.
        let fifo = Arc::new(DeltaFifo::with_wait(2));
        let informer = Informer::new(fifo.clone());

        let lister_watcher: Arc<dyn ListerWatcher<String>> = Arc::new(self.client.clone());
        let node_reflector = Arc::new(Reflector::new(
            lister_watcher.clone(),
            "agent_node_reflector",
            AGENT_NODE_DIR,
            fifo.clone() as Arc<dyn Store<String>>,
        ));
        let applied_reflector = Arc::new(Reflector::new(
            lister_watcher,
            "applied_reflector",
            APPLIED_RUNNING_DIR,
            fifo as Arc<dyn Store<String>>,
        ));

        let node_controller = Controller::new(
            informer.clone(),
            Arc::new(node::NodeController::new(self.pool.clone())),
            ControllerOptions::new("node"),
        );
        let strategy_controller = Controller::new(
            informer.clone(),
            Arc::new(strategy::StrategyController::new(
                self.logic.control.clone(),
                self.logic.applied.clone(),
            )),
            ControllerOptions::new("strategy"),
        );

        for reflector in [node_reflector, applied_reflector] {
            let cancel = cancel.clone();
            tokio::spawn(async move { reflector.run(cancel).await });
        }
        {
            let informer = informer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(cancel).await });
        }
        for controller in [node_controller, strategy_controller] {
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await });
        }
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

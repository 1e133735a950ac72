//! Three-state lifecycle FSM driving the XDP stack.
//!
//! Events arrive from the control service, are serialized through a
//! single-consumer queue, and applied by one worker. A failed callback
//! cancels the transition and surfaces through the reporter with a
//! retry horizon.

use std::path::PathBuf;
use std::sync::Arc;

use banfleet_api::orch::v1::report::Phase;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::OrchClient;
use crate::error::AgentResult;
use crate::reporter::Reporter;
use crate::watcher;
use crate::xdp::{BanMaps, XdpProgram};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    Start { config_name: String },
    Stop,
    Reload { config_name: String },
}

/// Next phase for `event` in `phase`, or `None` when the transition is
/// not allowed. `Reload` in `Running` is a legal self-transition.
fn transition(phase: Phase, event: &FsmEvent) -> Option<Phase> {
    match (phase, event) {
        (Phase::Ready | Phase::Stopped, FsmEvent::Start { .. }) => Some(Phase::Running),
        (Phase::Running | Phase::Ready, FsmEvent::Stop) => Some(Phase::Stopped),
        (Phase::Running, FsmEvent::Reload { .. }) => Some(Phase::Running),
        _ => None,
    }
}

/// Handle the control service uses to enqueue lifecycle events.
#[derive(Clone)]
pub struct StatusFsm {
    tx: mpsc::UnboundedSender<FsmEvent>,
}

impl StatusFsm {
    pub fn event(&self, event: FsmEvent) {
        let _ = self.tx.send(event);
    }
}

/// Spawn the FSM worker. The initial `Ready` phase is reported
/// immediately.
pub fn spawn(lifecycle: XdpLifecycle, reporter: Reporter, cancel: CancellationToken) -> StatusFsm {
    let (tx, rx) = mpsc::unbounded_channel();
    reporter.set_phase(Phase::Ready);
    tokio::spawn(run(rx, lifecycle, reporter, cancel));
    StatusFsm { tx }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<FsmEvent>,
    lifecycle: XdpLifecycle,
    reporter: Reporter,
    cancel: CancellationToken,
) {
    let mut phase = Phase::Ready;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(err) = lifecycle.before_stop().await {
                    warn!(error = %err, "teardown on shutdown failed");
                }
                return;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let Some(next) = transition(phase, &event) else {
            warn!(?event, current = ?phase, "transition not allowed");
            reporter.set_error(&format!("event {event:?} not allowed in phase {phase:?}"));
            continue;
        };

        let result = match &event {
            FsmEvent::Start { config_name } => lifecycle.before_start(config_name).await,
            FsmEvent::Stop => lifecycle.before_stop().await,
            FsmEvent::Reload { config_name } => lifecycle.before_reload(config_name).await,
        };

        match result {
            Ok(()) => {
                phase = next;
                if let FsmEvent::Start { config_name } | FsmEvent::Reload { config_name } = &event {
                    reporter.set_config_name(config_name);
                }
                reporter.set_phase(phase);
                info!(phase = ?phase, "lifecycle transition complete");
            }
            Err(err) => {
                // Transition cancelled; phase unchanged.
                error!(?event, error = %err, "lifecycle callback failed");
                reporter.set_error(&err.to_string());
            }
        }
    }
}

struct LifecycleState {
    program: Option<XdpProgram>,
    maps: Option<Arc<BanMaps>>,
    watch_cancel: Option<CancellationToken>,
    attached: bool,
}

/// The FSM callbacks: XDP attach/detach and the rule-watch consumer's
/// cancellation scope. All transitions run under one async mutex.
pub struct XdpLifecycle {
    client: OrchClient,
    object_path: PathBuf,
    pin_dir: PathBuf,
    state: tokio::sync::Mutex<LifecycleState>,
}

impl XdpLifecycle {
    pub fn new(client: OrchClient, object_path: PathBuf, pin_dir: PathBuf) -> Self {
        Self {
            client,
            object_path,
            pin_dir,
            state: tokio::sync::Mutex::new(LifecycleState {
                program: None,
                maps: None,
                watch_cancel: None,
                attached: false,
            }),
        }
    }

    pub async fn before_start(&self, config_name: &str) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state, config_name)
    }

    pub async fn before_stop(&self) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        Self::stop_locked(&mut state)
    }

    /// Stop then start, under a single lock scope.
    pub async fn before_reload(&self, config_name: &str) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        Self::stop_locked(&mut state)?;
        self.start_locked(&mut state, config_name)
    }

    fn start_locked(&self, state: &mut LifecycleState, config_name: &str) -> AgentResult<()> {
        info!(config = %config_name, "starting xdp");

        if let Some(cancel) = state.watch_cancel.take() {
            cancel.cancel();
        }
        let scope = CancellationToken::new();
        state.watch_cancel = Some(scope.clone());

        if state.program.is_none() || state.maps.is_none() {
            let (program, maps) = XdpProgram::load(&self.object_path, &self.pin_dir)?;
            state.program = Some(program);
            state.maps = Some(Arc::new(maps));
        }
        let Some(maps) = state.maps.clone() else {
            return Err(crate::error::AgentError::Xdp("maps unavailable after init".to_string()));
        };
        state.attached = true;

        watcher::spawn(self.client.clone(), config_name.to_string(), maps, scope);
        Ok(())
    }

    fn stop_locked(state: &mut LifecycleState) -> AgentResult<()> {
        info!("stopping xdp");

        if let Some(cancel) = state.watch_cancel.take() {
            cancel.cancel();
        }
        if let Some(program) = state.program.take() {
            program.close()?;
        }
        state.maps = None;
        state.attached = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> FsmEvent {
        FsmEvent::Start { config_name: "default".to_string() }
    }

    fn reload() -> FsmEvent {
        FsmEvent::Reload { config_name: "default".to_string() }
    }

    #[test]
    fn transition_table_matches_the_lifecycle() {
        assert_eq!(transition(Phase::Ready, &start()), Some(Phase::Running));
        assert_eq!(transition(Phase::Stopped, &start()), Some(Phase::Running));
        assert_eq!(transition(Phase::Running, &start()), None);

        assert_eq!(transition(Phase::Running, &FsmEvent::Stop), Some(Phase::Stopped));
        assert_eq!(transition(Phase::Ready, &FsmEvent::Stop), Some(Phase::Stopped));
        assert_eq!(transition(Phase::Stopped, &FsmEvent::Stop), None);
    }

    #[test]
    fn reload_is_a_running_self_transition() {
        assert_eq!(transition(Phase::Running, &reload()), Some(Phase::Running));
        assert_eq!(transition(Phase::Ready, &reload()), None);
        assert_eq!(transition(Phase::Stopped, &reload()), None);
    }
}

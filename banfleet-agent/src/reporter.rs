//! Periodic status upload with field-ready gating.
//!
//! No report leaves the agent until every required field (name,
//! endpoint, phase) has been set at least once; the first moment they
//! all are, a report fires immediately, then on every interval tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use banfleet_api::orch::v1::report::{ErrorTime, Phase, Status};
use chrono::Utc;
use parking_lot::Mutex;
use prost_types::Timestamp;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::OrchClient;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(15);
/// How far in the future the orchestrator may retry after a failure.
const ERROR_RETRY_AFTER: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Fields {
    name: Option<String>,
    grpc_endpoint: Option<String>,
    config_name: Option<String>,
    phase: Option<Phase>,
    error: Option<ErrorTime>,
}

impl Fields {
    /// name, endpoint and phase must be initialized before the first
    /// report; config and error are optional.
    fn ready(&self) -> bool {
        self.name.is_some() && self.grpc_endpoint.is_some() && self.phase.is_some()
    }

    fn to_status(&self) -> Status {
        Status {
            name: self.name.clone().unwrap_or_default(),
            grpc_endpoint: self.grpc_endpoint.clone().unwrap_or_default(),
            config_name: self.config_name.clone().unwrap_or_default(),
            phase: self.phase.unwrap_or(Phase::Ready) as i32,
            error: self.error.clone(),
        }
    }
}

struct Inner {
    fields: Mutex<Fields>,
    initialized: AtomicBool,
    trigger: mpsc::Sender<()>,
}

/// Process-scoped handle; every subsystem that owns a status field
/// gets a clone.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

impl Reporter {
    pub fn new() -> (Self, ReporterTask) {
        let (trigger, triggered) = mpsc::channel(1);
        let inner = Arc::new(Inner {
            fields: Mutex::new(Fields::default()),
            initialized: AtomicBool::new(false),
            trigger,
        });
        (Self { inner: inner.clone() }, ReporterTask { inner, triggered })
    }

    pub fn set_name(&self, name: &str) {
        self.inner.fields.lock().name = Some(name.to_string());
        self.check_ready();
    }

    pub fn set_grpc_endpoint(&self, endpoint: &str) {
        self.inner.fields.lock().grpc_endpoint = Some(endpoint.to_string());
        self.check_ready();
    }

    pub fn set_config_name(&self, config_name: &str) {
        self.inner.fields.lock().config_name = Some(config_name.to_string());
        self.check_ready();
    }

    /// Entering `Running` clears any prior error in the same lock
    /// scope, so a report can never carry a stale failure alongside a
    /// healthy phase.
    pub fn set_phase(&self, phase: Phase) {
        {
            let mut fields = self.inner.fields.lock();
            fields.phase = Some(phase);
            if phase == Phase::Running {
                fields.error = None;
            }
        }
        self.check_ready();
    }

    pub fn set_error(&self, message: &str) {
        let retry_at = Utc::now() + chrono::Duration::from_std(ERROR_RETRY_AFTER).unwrap_or_default();
        self.inner.fields.lock().error = Some(ErrorTime {
            message: message.to_string(),
            retry_at: Some(Timestamp { seconds: retry_at.timestamp(), nanos: 0 }),
        });
        self.check_ready();
    }

    fn check_ready(&self) {
        if self.inner.initialized.load(Ordering::SeqCst) {
            return;
        }
        if !self.inner.fields.lock().ready() {
            return;
        }
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("all required status fields set, triggering first report");
            let _ = self.inner.trigger.try_send(());
        }
    }
}

/// The single long-running upload loop.
pub struct ReporterTask {
    inner: Arc<Inner>,
    triggered: mpsc::Receiver<()>,
}

impl ReporterTask {
    pub async fn run(mut self, client: OrchClient, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.triggered.recv() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            self.report_once(&client, interval).await;
        }
    }

    async fn report_once(&self, client: &OrchClient, interval: Duration) {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            info!("status fields not fully initialized, skipping report");
            return;
        }
        let status = self.inner.fields.lock().to_status();

        // Bounded latency: a report may use at most half the interval.
        let timeout = interval / 2;
        match tokio::time::timeout(timeout, client.report(status)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "status report failed"),
            Err(_) => warn!(timeout = ?timeout, "status report timed out, not retrying"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_report_until_required_fields_are_set() {
        let (reporter, _task) = Reporter::new();
        reporter.set_name("n1");
        reporter.set_grpc_endpoint("10.0.0.5:6062");
        assert!(!reporter.inner.initialized.load(Ordering::SeqCst));

        reporter.set_phase(Phase::Ready);
        assert!(reporter.inner.initialized.load(Ordering::SeqCst));
    }

    #[test]
    fn first_readiness_sends_exactly_one_trigger() {
        let (reporter, mut task) = Reporter::new();
        reporter.set_name("n1");
        reporter.set_grpc_endpoint("e");
        reporter.set_phase(Phase::Ready);
        reporter.set_phase(Phase::Running);

        assert!(task.triggered.try_recv().is_ok());
        assert!(task.triggered.try_recv().is_err());
    }

    #[test]
    fn running_phase_clears_the_error() {
        let (reporter, _task) = Reporter::new();
        reporter.set_name("n1");
        reporter.set_grpc_endpoint("e");
        reporter.set_phase(Phase::Stopped);
        reporter.set_error("attach failed");
        assert!(reporter.inner.fields.lock().error.is_some());

        reporter.set_phase(Phase::Running);
        let fields = reporter.inner.fields.lock();
        assert!(fields.error.is_none());
        assert_eq!(fields.phase, Some(Phase::Running));
    }

    #[test]
    fn error_retry_horizon_is_in_the_future() {
        let (reporter, _task) = Reporter::new();
        reporter.set_error("boom");
        let fields = reporter.inner.fields.lock();
        let retry_at = fields.error.as_ref().unwrap().retry_at.as_ref().unwrap().seconds;
        assert!(retry_at > Utc::now().timestamp());
    }
}

//! Lifecycle control surface the orchestrator drives.

use banfleet_api::agent::v1::control::control_service_server::ControlService;
use banfleet_api::agent::v1::control::*;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::fsm::{FsmEvent, StatusFsm};

pub struct ControlGrpc {
    fsm: StatusFsm,
}

impl ControlGrpc {
    pub fn new(fsm: StatusFsm) -> Self {
        Self { fsm }
    }
}

#[tonic::async_trait]
impl ControlService for ControlGrpc {
    async fn start(&self, request: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        if req.config_name.is_empty() {
            return Err(Status::invalid_argument("missing config name"));
        }
        debug!(config = %req.config_name, "start requested");
        self.fsm.event(FsmEvent::Start { config_name: req.config_name });
        Ok(Response::new(StartResponse {}))
    }

    async fn stop(&self, _request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        debug!("stop requested");
        self.fsm.event(FsmEvent::Stop);
        Ok(Response::new(StopResponse {}))
    }

    async fn reload(&self, request: Request<ReloadRequest>) -> Result<Response<ReloadResponse>, Status> {
        let req = request.into_inner();
        if req.config_name.is_empty() {
            return Err(Status::invalid_argument("missing config name"));
        }
        debug!(config = %req.config_name, "reload requested");
        self.fsm.event(FsmEvent::Reload { config_name: req.config_name });
        Ok(Response::new(ReloadResponse {}))
    }
}

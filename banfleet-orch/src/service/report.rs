//! Status upload endpoint for agents.

use std::sync::Arc;

use banfleet_api::orch::v1::report::report_service_server::ReportService;
use banfleet_api::orch::v1::report::{ReportResponse, Status as StatusPb};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::logic::control::Control;
use crate::server::auth_layer::PeerName;
use crate::service::convert;

pub struct ReportGrpc {
    control: Arc<Control>,
}

impl ReportGrpc {
    pub fn new(control: Arc<Control>) -> Self {
        Self { control }
    }
}

#[tonic::async_trait]
impl ReportService for ReportGrpc {
    async fn report(&self, request: Request<StatusPb>) -> Result<Response<ReportResponse>, Status> {
        // An agent may only report as the identity on its certificate.
        let peer = request.extensions().get::<PeerName>().cloned();
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        if let Some(PeerName(peer)) = peer {
            if peer != "localhost" && peer != req.name {
                return Err(Status::permission_denied(format!(
                    "peer {peer} may not report status for {}",
                    req.name
                )));
            }
        }

        let status = convert::status_from_report(&req);
        debug!(name = %status.name, phase = %status.phase, "agent report");
        self.control.report_status(&status).await?;
        Ok(Response::new(ReportResponse {}))
    }
}

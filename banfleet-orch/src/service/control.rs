//! Agent control service: registration, certificate bootstrap and
//! desired-state management.

use std::net::IpAddr;
use std::sync::Arc;

use banfleet_api::orch::v1::control::control_service_server::ControlService;
use banfleet_api::orch::v1::control::*;
use tonic::{Request, Response, Status};

use crate::logic::control::Control;
use crate::service::convert;

pub struct ControlGrpc {
    control: Arc<Control>,
}

impl ControlGrpc {
    pub fn new(control: Arc<Control>) -> Self {
        Self { control }
    }

    /// Methods reachable without a client certificate. `Init` is the
    /// bootstrap: it runs before the agent has one.
    pub fn public_methods() -> Vec<String> {
        vec!["/orch.v1.control.ControlService/Init".to_string()]
    }
}

fn require_name(name: &str) -> Result<(), Status> {
    if name.is_empty() {
        return Err(Status::invalid_argument("name is required"));
    }
    Ok(())
}

#[tonic::async_trait]
impl ControlService for ControlGrpc {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let token = self.control.register_node(&req.name).await?;
        Ok(Response::new(RegisterResponse { token }))
    }

    async fn unregister(&self, request: Request<UnregisterRequest>) -> Result<Response<UnregisterResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        self.control.unregister_node(&req.name).await?;
        Ok(Response::new(UnregisterResponse {}))
    }

    async fn list_registration(
        &self,
        request: Request<ListRegistrationRequest>,
    ) -> Result<Response<ListRegistrationResponse>, Status> {
        let req = request.into_inner();
        if req.page_size <= 0 {
            return Err(Status::invalid_argument("page size must be greater than 0"));
        }
        let (meta, items) = self.control.list_registration(req.page_size, &req.cursor).await?;
        Ok(Response::new(ListRegistrationResponse {
            total: meta.total_count,
            has_next: meta.has_next,
            next_cursor: meta.next_cursor,
            items: items
                .into_iter()
                .map(|r| Registration { name: r.name, token: r.token })
                .collect(),
        }))
    }

    async fn init(&self, request: Request<InitRequest>) -> Result<Response<InitResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        if req.token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }

        let mut ips: Vec<IpAddr> = vec![
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        ];
        for raw in &req.ip_addresses {
            let ip: IpAddr = raw
                .parse()
                .map_err(|_| Status::invalid_argument(format!("bad ip address: {raw}")))?;
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }

        let csr = String::from_utf8(req.csr)
            .map_err(|_| Status::invalid_argument("csr must be PEM text"))?;
        let (cert, ca) = self.control.init(&req.name, &req.token, &ips, &csr).await?;
        Ok(Response::new(InitResponse { cert: cert.into_bytes(), ca: ca.into_bytes() }))
    }

    async fn enable(&self, request: Request<EnableRequest>) -> Result<Response<EnableResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        self.control.enable(&req.name, req.enable).await?;
        Ok(Response::new(EnableResponse {}))
    }

    async fn set_config(&self, request: Request<SetConfigRequest>) -> Result<Response<SetConfigResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        self.control.set_config(&req.name, &req.config).await?;
        Ok(Response::new(SetConfigResponse {}))
    }

    async fn get_config(&self, request: Request<GetConfigRequest>) -> Result<Response<GetConfigResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let config = self.control.get_config(&req.name).await?;
        Ok(Response::new(GetConfigResponse { config }))
    }

    async fn set_labels(&self, request: Request<SetLabelsRequest>) -> Result<Response<SetLabelsResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        self.control.set_labels(&req.name, req.labels).await?;
        Ok(Response::new(SetLabelsResponse {}))
    }

    async fn get_labels(&self, request: Request<GetLabelsRequest>) -> Result<Response<GetLabelsResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let labels = self.control.get_labels(&req.name).await?;
        Ok(Response::new(GetLabelsResponse { labels }))
    }

    async fn get_status(&self, request: Request<GetStatusRequest>) -> Result<Response<GetStatusResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let status = self.control.get_status(&req.name).await?;
        Ok(Response::new(GetStatusResponse {
            status: Some(convert::agent_status_to_pb(&status)),
        }))
    }

    async fn get_info(&self, request: Request<GetInfoRequest>) -> Result<Response<GetInfoResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let info = self.control.get_info(&req.name).await?;
        Ok(Response::new(GetInfoResponse { info: Some(convert::agent_info_to_pb(&info)) }))
    }

    async fn get_agent(&self, request: Request<GetAgentRequest>) -> Result<Response<GetAgentResponse>, Status> {
        let req = request.into_inner();
        require_name(&req.name)?;
        let agent = self.control.get_agent(&req.name).await?;
        Ok(Response::new(GetAgentResponse { agent: Some(convert::agent_to_pb(&agent)) }))
    }

    async fn list_agents(&self, request: Request<ListAgentsRequest>) -> Result<Response<ListAgentsResponse>, Status> {
        let req = request.into_inner();
        if req.page_size <= 0 {
            return Err(Status::invalid_argument("page size must be greater than 0"));
        }
        let (meta, agents) = self.control.list_agents(req.page_size, &req.cursor).await?;
        Ok(Response::new(ListAgentsResponse {
            total: meta.total_count,
            has_next: meta.has_next,
            next_cursor: meta.next_cursor,
            items: agents.iter().map(convert::agent_to_pb).collect(),
        }))
    }
}

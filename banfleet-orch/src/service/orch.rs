//! Orchestrator membership queries.

use banfleet_api::orch::v1::orch::orch_service_server::OrchService;
use banfleet_api::orch::v1::orch::*;
use tonic::{Request, Response, Status};

use crate::error::AppError;
use crate::storage::orch_info::OrchInfoStorage;

pub struct OrchGrpc {
    infos: OrchInfoStorage,
}

impl OrchGrpc {
    pub fn new(infos: OrchInfoStorage) -> Self {
        Self { infos }
    }
}

#[tonic::async_trait]
impl OrchService for OrchGrpc {
    async fn get_info(&self, request: Request<GetInfoRequest>) -> Result<Response<GetInfoResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let info = self.infos.get(&req.name).await.map_err(AppError::from)?;
        Ok(Response::new(GetInfoResponse {
            info: Some(OrchInfo { name: info.name, labels: info.labels }),
        }))
    }

    async fn list_info(&self, request: Request<ListInfoRequest>) -> Result<Response<ListInfoResponse>, Status> {
        let req = request.into_inner();
        if req.page_size <= 0 {
            return Err(Status::invalid_argument("page size must be greater than 0"));
        }
        let (meta, items) = self
            .infos
            .list(req.page_size, &req.cursor)
            .await
            .map_err(AppError::from)?;
        Ok(Response::new(ListInfoResponse {
            total: meta.total_count,
            has_next: meta.has_next,
            next_cursor: meta.next_cursor,
            items: items
                .into_iter()
                .map(|info| OrchInfo { name: info.name, labels: info.labels })
                .collect(),
        }))
    }
}

//! Strategy CRUD and apply.

use std::sync::Arc;

use banfleet_api::orch::v1::strategy::strategy_service_server::StrategyService;
use banfleet_api::orch::v1::strategy::*;
use tonic::{Request, Response, Status};

use crate::logic::strategy::{AppliedLogic, StrategyLogic};
use crate::service::convert;

pub struct StrategyGrpc {
    strategy: Arc<StrategyLogic>,
    applied: Arc<AppliedLogic>,
}

impl StrategyGrpc {
    pub fn new(strategy: Arc<StrategyLogic>, applied: Arc<AppliedLogic>) -> Self {
        Self { strategy, applied }
    }
}

fn required_strategy(strategy: Option<&Strategy>) -> Result<crate::model::strategy::Strategy, Status> {
    let pb = strategy.ok_or_else(|| Status::invalid_argument("strategy is required"))?;
    Ok(convert::strategy_from_pb(pb))
}

#[tonic::async_trait]
impl StrategyService for StrategyGrpc {
    async fn add_strategy(&self, request: Request<AddStrategyRequest>) -> Result<Response<AddStrategyResponse>, Status> {
        let req = request.into_inner();
        let strategy = required_strategy(req.strategy.as_ref())?;
        self.strategy.add(&strategy).await?;
        Ok(Response::new(AddStrategyResponse {}))
    }

    async fn delete_strategy(
        &self,
        request: Request<DeleteStrategyRequest>,
    ) -> Result<Response<DeleteStrategyResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        self.strategy.delete(&req.name).await?;
        Ok(Response::new(DeleteStrategyResponse {}))
    }

    async fn update_strategy(
        &self,
        request: Request<UpdateStrategyRequest>,
    ) -> Result<Response<UpdateStrategyResponse>, Status> {
        let req = request.into_inner();
        let strategy = required_strategy(req.strategy.as_ref())?;
        self.strategy.update(&strategy).await?;
        Ok(Response::new(UpdateStrategyResponse {}))
    }

    async fn get_strategy(&self, request: Request<GetStrategyRequest>) -> Result<Response<GetStrategyResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let strategy = self.strategy.get(&req.name).await?;
        Ok(Response::new(GetStrategyResponse {
            strategy: Some(convert::strategy_to_pb(&strategy)),
        }))
    }

    async fn list_strategy(&self, request: Request<ListStrategyRequest>) -> Result<Response<ListStrategyResponse>, Status> {
        let req = request.into_inner();
        let list = self.strategy.list(req.page_size, &req.cursor).await?;
        Ok(Response::new(ListStrategyResponse {
            total: list.meta.total_count,
            has_next: list.meta.has_next,
            next_cursor: list.meta.next_cursor,
            items: list.items.iter().map(convert::strategy_to_pb).collect(),
        }))
    }

    async fn apply_strategy(&self, request: Request<ApplyStrategyRequest>) -> Result<Response<ApplyStrategyResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        self.applied.create(&req.name).await?;
        Ok(Response::new(ApplyStrategyResponse {}))
    }

    async fn list_running_applied(
        &self,
        request: Request<ListAppliedRequest>,
    ) -> Result<Response<ListAppliedResponse>, Status> {
        let req = request.into_inner();
        let list = self.applied.list_running(req.page_size, &req.cursor).await?;
        Ok(Response::new(ListAppliedResponse {
            total: list.meta.total_count,
            has_next: list.meta.has_next,
            next_cursor: list.meta.next_cursor,
            items: list.items.iter().map(convert::applied_to_pb).collect(),
        }))
    }

    async fn list_history_applied(
        &self,
        request: Request<ListAppliedRequest>,
    ) -> Result<Response<ListAppliedResponse>, Status> {
        let req = request.into_inner();
        let list = self.applied.list_history(req.page_size, &req.cursor).await?;
        Ok(Response::new(ListAppliedResponse {
            total: list.meta.total_count,
            has_next: list.meta.has_next,
            next_cursor: list.meta.next_cursor,
            items: list.items.iter().map(convert::applied_to_pb).collect(),
        }))
    }

    async fn delete_history_applied(
        &self,
        request: Request<DeleteHistoryAppliedRequest>,
    ) -> Result<Response<DeleteHistoryAppliedResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        self.applied.delete_history(&req.name).await?;
        Ok(Response::new(DeleteHistoryAppliedResponse {}))
    }
}

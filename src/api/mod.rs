pub mod audit;
pub mod commissions;
pub mod health;
pub mod members;
pub mod overflow;
pub mod placements;
pub mod rebalance;
pub mod volume;

use crate::config::Config;
use crate::domain::MemberId;
use crate::error::AppError;
use crate::orchestration::MatrixService;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::str::FromStr;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub service: MatrixService,
    pub config: Config,
}

impl AppState {
    pub fn new(service: MatrixService, config: Config) -> Self {
        Self { service, config }
    }
}

pub(crate) fn parse_member(raw: &str) -> Result<MemberId, AppError> {
    MemberId::from_str(raw.trim())
        .map_err(|_| AppError::BadRequest(format!("Invalid member id: {}", raw)))
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/placements", post(placements::place_member))
        .route("/v1/volume", post(volume::record_volume))
        .route("/v1/rebalance", post(rebalance::rebalance))
        .route("/v1/overflow/resolve-all", post(overflow::resolve_all))
        .route("/v1/overflow/:id/resolve", post(overflow::resolve_entry))
        .route("/v1/audit/invariants", get(audit::check_invariants))
        .route("/v1/members/:member", delete(members::withdraw_member))
        .route("/v1/members/:member/position", get(members::get_position))
        .route("/v1/members/:member/subtree", get(members::get_subtree))
        .route("/v1/members/:member/stats", get(members::get_stats))
        .route(
            "/v1/members/:member/performance",
            get(members::get_performance),
        )
        .route("/v1/members/:member/overflow", get(overflow::list_pending))
        .route(
            "/v1/members/:member/rebalances",
            get(rebalance::get_history),
        )
        .route(
            "/v1/members/:member/commissions",
            get(commissions::get_history),
        )
        .route(
            "/v1/members/:member/commission/matching",
            get(commissions::get_matching),
        )
        .route(
            "/v1/members/:member/commission/settle",
            post(commissions::settle_matching),
        )
        .layer(cors)
        .with_state(state)
}

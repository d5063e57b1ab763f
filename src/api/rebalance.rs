use crate::api::{parse_member, AppState};
use crate::domain::RebalanceRecord;
use crate::engine::RebalanceOutcome;
use crate::error::AppError;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceBody {
    pub member_id: String,
}

pub async fn rebalance(
    State(state): State<AppState>,
    Json(body): Json<RebalanceBody>,
) -> Result<Json<RebalanceOutcome>, AppError> {
    let member = parse_member(&body.member_id)?;
    Ok(Json(state.service.rebalance(member).await?))
}

pub async fn get_history(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<RebalanceRecord>>, AppError> {
    let member = parse_member(&member)?;
    Ok(Json(state.service.rebalance_history(member).await?))
}

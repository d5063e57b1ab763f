use crate::api::{parse_member, AppState};
use crate::domain::{CommissionRecord, Leg, Money};
use crate::error::AppError;
use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingResponse {
    pub weaker_leg: Leg,
    pub weaker_volume: Money,
    pub rate_percent: Money,
    pub commission: Money,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    /// `None` when there was no unpaid weaker-leg volume.
    pub settled: Option<CommissionRecord>,
}

pub async fn get_history(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<CommissionRecord>>, AppError> {
    let member = parse_member(&member)?;
    Ok(Json(state.service.commission_history(member).await?))
}

/// Matching commission on the current weaker-leg volume, before settlement.
pub async fn get_matching(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<MatchingResponse>, AppError> {
    let member = parse_member(&member)?;
    let stats = state.service.stats(member).await?;
    let commission = state.service.calculate_matching_commission(member).await?;
    Ok(Json(MatchingResponse {
        weaker_leg: stats.weaker_leg,
        weaker_volume: stats.weaker_volume(),
        rate_percent: state.config.engine.matching_rate,
        commission,
    }))
}

pub async fn settle_matching(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SettleResponse>, AppError> {
    let member = parse_member(&member)?;
    let settled = state.service.settle_matching(member).await?;
    Ok(Json(SettleResponse { settled }))
}

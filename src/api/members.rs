use crate::api::{parse_member, AppState};
use crate::domain::{LegStats, MatrixPosition, Performance, PositionId};
use crate::engine::SubtreePage;
use crate::error::AppError;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtreeQuery {
    /// Cursor from a previous page's `nextCursor`.
    pub after: Option<u64>,
    pub limit: Option<usize>,
}

pub async fn get_position(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<MatrixPosition>, AppError> {
    let member = parse_member(&member)?;
    Ok(Json(state.service.get_position(member).await?))
}

pub async fn get_subtree(
    Path(member): Path<String>,
    Query(params): Query<SubtreeQuery>,
    State(state): State<AppState>,
) -> Result<Json<SubtreePage>, AppError> {
    let member = parse_member(&member)?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    let page = state
        .service
        .subtree_page(member, params.after.map(PositionId::new), limit)
        .await?;
    Ok(Json(page))
}

pub async fn get_stats(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<LegStats>, AppError> {
    let member = parse_member(&member)?;
    Ok(Json(state.service.stats(member).await?))
}

pub async fn get_performance(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Performance>, AppError> {
    let member = parse_member(&member)?;
    Ok(Json(state.service.performance(member).await?))
}

/// Remove an unfunded leaf member.
pub async fn withdraw_member(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<MatrixPosition>, AppError> {
    let member = parse_member(&member)?;
    Ok(Json(state.service.withdraw(member).await?))
}

use crate::api::{parse_member, AppState};
use crate::domain::{OverflowEntry, OverflowId};
use crate::engine::{ResolveOutcome, SweepReport};
use crate::error::AppError;
use axum::extract::{Path, State};
use axum::Json;

pub async fn list_pending(
    Path(member): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<OverflowEntry>>, AppError> {
    let member = parse_member(&member)?;
    Ok(Json(state.service.list_pending_overflow(member).await?))
}

pub async fn resolve_entry(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> Result<Json<ResolveOutcome>, AppError> {
    let outcome = state.service.resolve_overflow(OverflowId::new(id)).await?;
    Ok(Json(outcome))
}

pub async fn resolve_all(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.service.resolve_all_pending().await?))
}

use crate::api::AppState;
use crate::engine::AuditReport;
use crate::error::AppError;
use axum::extract::State;
use axum::Json;
use tracing::error;

/// Full structural and conservation audit of the matrix.
pub async fn check_invariants(State(state): State<AppState>) -> Result<Json<AuditReport>, AppError> {
    let report = state.service.audit().await?;
    if !report.is_clean() {
        error!(violations = report.violations.len(), "Matrix audit found violations");
    }
    Ok(Json(report))
}

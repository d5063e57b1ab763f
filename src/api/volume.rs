use crate::api::{parse_member, AppState};
use crate::domain::Money;
use crate::engine::VolumeReceipt;
use crate::error::AppError;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBody {
    pub member_id: String,
    /// Decimal string, e.g. "125.50".
    pub amount: String,
}

pub async fn record_volume(
    State(state): State<AppState>,
    Json(body): Json<VolumeBody>,
) -> Result<Json<VolumeReceipt>, AppError> {
    let member = parse_member(&body.member_id)?;
    let amount = Money::from_str_canonical(&body.amount)
        .map_err(|_| AppError::BadRequest(format!("Invalid amount: {}", body.amount)))?;
    Ok(Json(state.service.record_volume(member, amount).await?))
}

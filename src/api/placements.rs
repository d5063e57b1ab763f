use crate::api::{parse_member, AppState};
use crate::domain::Leg;
use crate::engine::{PlacementOutcome, PlacementRequest};
use crate::error::AppError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementBody {
    pub member_id: String,
    /// Omitted only when creating the root.
    pub upline_member_id: Option<String>,
    /// Explicit legs from the upline, for manual placement.
    pub path: Option<Vec<String>>,
}

pub async fn place_member(
    State(state): State<AppState>,
    Json(body): Json<PlacementBody>,
) -> Result<(StatusCode, Json<PlacementOutcome>), AppError> {
    let member = parse_member(&body.member_id)?;
    let mut request = match body.upline_member_id.as_deref() {
        Some(upline) => PlacementRequest::under(member, parse_member(upline)?),
        None => PlacementRequest::root(member),
    };
    if let Some(path) = body.path {
        let legs = path
            .iter()
            .map(|raw| Leg::from_str(raw).map_err(|e| AppError::BadRequest(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        request = request.with_path(legs);
    }

    let outcome = state.service.place(request).await?;
    let status = match outcome {
        PlacementOutcome::Placed { .. } => StatusCode::CREATED,
        PlacementOutcome::Deferred { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

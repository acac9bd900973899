use axum::{
    Json,
    extract::{ConnectInfo, Path, State, rejection::JsonRejection},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::{AppState, client_identity};
use crate::error::PollError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub option_index: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct VoteResponse {
    pub success: bool,
}

pub async fn cast_vote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<VoteResponse>, PollError> {
    let Json(request) = payload.map_err(|e| PollError::validation(e.body_text()))?;
    let option_index = request
        .option_index
        .ok_or_else(|| PollError::validation("optionIndex is required"))?;

    let voter = client_identity(&headers, connect_info.as_ref());
    state.manager.cast_vote(&id, option_index, &voter).await?;

    Ok(Json(VoteResponse { success: true }))
}

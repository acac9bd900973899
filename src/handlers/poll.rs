use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::HeaderMap,
};
use chrono::{DateTime, Utc};
use qrcode::{QrCode, render::svg};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

use super::{AppState, base_url};
use crate::error::PollError;
use crate::models::{NewPoll, Poll, PollOption, Tier};
use crate::voting::plurality;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    pub question: Option<String>,
    pub options: Option<Vec<String>>,
    pub duration: Option<i64>,
    pub created_by: Option<String>,
    pub user_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollResponse {
    pub poll_id: String,
    pub vote_url: String,
    pub qr_code: Option<String>,
    pub result_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollView {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub active: bool,
    pub time_remaining: i64,
    pub total_votes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePollSummary {
    pub id: String,
    pub question: String,
    pub option_count: usize,
    pub total_votes: u64,
    pub time_remaining: i64,
    pub created_at: i64,
    pub created_by: String,
    pub user_type: Tier,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPollSummary {
    pub id: String,
    pub question: String,
    pub option_count: usize,
    pub total_votes: u64,
    pub created_at: i64,
    pub ended_at: Option<i64>,
    pub created_by: String,
    pub user_type: Tier,
    pub winning_option: Option<PollOption>,
}

#[derive(Debug, Serialize)]
pub struct UserPollsResponse {
    pub active: Vec<ActivePollSummary>,
    pub history: Vec<HistoryPollSummary>,
    pub total: usize,
}

impl PollView {
    fn new(poll: &Poll, now: DateTime<Utc>) -> Self {
        Self {
            id: poll.id.clone(),
            question: poll.question.clone(),
            options: poll.options.clone(),
            active: poll.active,
            time_remaining: poll.time_remaining_ms(now),
            total_votes: poll.voters.len() as u64,
        }
    }
}

impl ActivePollSummary {
    fn new(poll: &Poll, now: DateTime<Utc>) -> Self {
        Self {
            id: poll.id.clone(),
            question: poll.question.clone(),
            option_count: poll.options.len(),
            total_votes: poll.voters.len() as u64,
            time_remaining: poll.time_remaining_ms(now),
            created_at: poll.created_at.timestamp_millis(),
            created_by: poll.created_by.clone(),
            user_type: poll.tier,
        }
    }
}

impl From<&Poll> for HistoryPollSummary {
    fn from(poll: &Poll) -> Self {
        let results = plurality::calculate_results(poll);
        Self {
            id: poll.id.clone(),
            question: poll.question.clone(),
            option_count: poll.options.len(),
            total_votes: poll.voters.len() as u64,
            created_at: poll.created_at.timestamp_millis(),
            ended_at: poll.ended_at.map(|t| t.timestamp_millis()),
            created_by: poll.created_by.clone(),
            user_type: poll.tier,
            winning_option: results.winner.map(|w| PollOption {
                text: w.text,
                votes: w.votes,
            }),
        }
    }
}

pub async fn create_poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreatePollRequest>, JsonRejection>,
) -> Result<Json<CreatePollResponse>, PollError> {
    let Json(request) = payload.map_err(|e| PollError::validation(e.body_text()))?;

    let tier = request
        .user_type
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(str::parse::<Tier>)
        .transpose()
        .map_err(PollError::Validation)?;

    let poll = state
        .manager
        .create_poll(NewPoll {
            question: request.question.unwrap_or_default(),
            options: request.options.unwrap_or_default(),
            duration_minutes: request
                .duration
                .ok_or_else(|| PollError::validation("duration is required"))?,
            created_by: request.created_by,
            tier,
        })
        .await?;

    let base = base_url(&state.config, &headers);
    let vote_url = format!("{base}/vote/{}", poll.id);

    Ok(Json(CreatePollResponse {
        qr_code: qr_data_url(&vote_url),
        result_url: format!("{base}/result/{}", poll.id),
        poll_id: poll.id,
        vote_url,
    }))
}

pub async fn get_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PollView>, PollError> {
    let poll = state.manager.get_poll(&id).await?;
    Ok(Json(PollView::new(&poll, state.manager.now())))
}

pub async fn active_polls(
    State(state): State<AppState>,
) -> Result<Json<Vec<ActivePollSummary>>, PollError> {
    let now = state.manager.now();
    let polls = state.manager.list_active().await?;
    Ok(Json(polls.iter().map(|p| ActivePollSummary::new(p, now)).collect()))
}

pub async fn history_polls(
    State(state): State<AppState>,
) -> Result<Json<Vec<HistoryPollSummary>>, PollError> {
    let polls = state.manager.list_ended(state.config.history_limit).await?;
    Ok(Json(polls.iter().map(HistoryPollSummary::from).collect()))
}

pub async fn user_polls(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserPollsResponse>, PollError> {
    let now = state.manager.now();
    let polls = state.manager.list_by_creator(&user_id).await?;

    let active: Vec<ActivePollSummary> =
        polls.active.iter().map(|p| ActivePollSummary::new(p, now)).collect();
    let history: Vec<HistoryPollSummary> =
        polls.history.iter().map(HistoryPollSummary::from).collect();

    Ok(Json(UserPollsResponse {
        total: active.len() + history.len(),
        active,
        history,
    }))
}

// SVG QR code for `text` as a data URL; None if the text cannot be encoded
pub(crate) fn qr_data_url(text: &str) -> Option<String> {
    let code = QrCode::new(text.as_bytes()).ok()?;
    let image = code.render::<svg::Color>().min_dimensions(200, 200).build();

    let mut url = String::from("data:image/svg+xml;charset=utf-8,");
    for byte in image.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'=' | b':'
            | b'/' | b',' | b';' => url.push(byte as char),
            _ => {
                let _ = write!(url, "%{byte:02X}");
            }
        }
    }
    Some(url)
}

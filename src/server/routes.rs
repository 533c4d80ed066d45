//! JSON request handlers

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    AppState,
    auth::Driver,
    error::{AppError, AppResult},
};
use crate::{
    TruncatedVec,
    broadcast::Role,
    leaderboard::LeaderboardEntry,
    ledger::{Answer, Submission, Tally},
    participant::{Id, Joined, Participant},
    question::QuestionSet,
    runtime::scheduler,
    step::{QuizState, Step},
};

/// Body of `PUT /api/state`
#[derive(Debug, Deserialize)]
pub struct StepRequest {
    step: Step,
}

/// Body of `POST /api/participants`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    id: Id,
    name: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

/// Response to a repeated join
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlreadyJoined {
    already_joined: bool,
    participant: Participant,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let broadcaster = state.engine.broadcaster();
    Json(json!({
        "status": "ok",
        "connections": broadcaster.count(),
        "roles": {
            "driver": broadcaster.specific_count(Role::Driver),
            "participant": broadcaster.specific_count(Role::Participant),
            "viewer": broadcaster.specific_count(Role::Viewer),
        },
    }))
}

/// `GET /api/state`
pub async fn get_state(State(state): State<AppState>) -> Json<QuizState> {
    Json(state.engine.state().await)
}

/// `PUT /api/state`
pub async fn put_state(
    _driver: Driver,
    State(state): State<AppState>,
    Json(request): Json<StepRequest>,
) -> AppResult<Json<QuizState>> {
    let next = state
        .engine
        .transition(request.step, scheduler(&state.engine))
        .await?;
    Ok(Json(next))
}

/// `POST /api/reset`
pub async fn reset(_driver: Driver, State(state): State<AppState>) -> AppResult<Json<QuizState>> {
    Ok(Json(state.engine.reset().await?))
}

/// `GET /api/participants`
pub async fn get_participants(State(state): State<AppState>) -> Json<Vec<Participant>> {
    Json(state.engine.participants().await)
}

/// `POST /api/participants`
///
/// Answers `201` with the new participant, or `200` with
/// `{alreadyJoined: true, participant}` for a known id.
pub async fn join(
    State(state): State<AppState>,
    Json(request): Json<JoinRequest>,
) -> AppResult<Response> {
    let joined = state
        .engine
        .join(request.id, &request.name, request.avatar_url)
        .await?;
    Ok(match joined {
        Joined::New(participant) => (StatusCode::CREATED, Json(participant)).into_response(),
        Joined::Existing(participant) => (
            StatusCode::OK,
            Json(AlreadyJoined {
                already_joined: true,
                participant,
            }),
        )
            .into_response(),
    })
}

/// `POST /api/answers`
pub async fn submit(
    State(state): State<AppState>,
    Json(submission): Json<Submission>,
) -> AppResult<(StatusCode, Json<Answer>)> {
    let answer = state.engine.submit(submission).await?;
    Ok((StatusCode::CREATED, Json(answer)))
}

/// `GET /api/answers/{questionIndex}`
pub async fn get_answers(
    State(state): State<AppState>,
    Path(question_index): Path<usize>,
) -> Json<Vec<Answer>> {
    Json(state.engine.answers(question_index).await)
}

/// `GET /api/answers/{questionIndex}/tally`
pub async fn get_tally(
    State(state): State<AppState>,
    Path(question_index): Path<usize>,
) -> AppResult<Json<Tally>> {
    state
        .engine
        .tally(question_index)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("question {question_index}")))
}

/// `GET /api/leaderboard`
pub async fn get_leaderboard(
    State(state): State<AppState>,
) -> Json<TruncatedVec<LeaderboardEntry>> {
    Json(state.engine.leaderboard().await)
}

/// `GET /api/questions`
pub async fn get_questions(State(state): State<AppState>) -> Json<QuestionSet> {
    Json(state.engine.questions().await)
}

/// `PUT /api/questions`
pub async fn put_questions(
    _driver: Driver,
    State(state): State<AppState>,
    Json(questions): Json<QuestionSet>,
) -> AppResult<Json<QuizState>> {
    Ok(Json(state.engine.replace_questions(questions).await?))
}

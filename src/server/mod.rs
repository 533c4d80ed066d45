//! HTTP and push interface
//!
//! # Endpoints
//!
//! - `GET /api/state`, `PUT /api/state` (driver)
//! - `GET /api/participants`, `POST /api/participants`
//! - `POST /api/answers`, `GET /api/answers/{questionIndex}`,
//!   `GET /api/answers/{questionIndex}/tally`
//! - `POST /api/reset` (driver)
//! - `GET /api/leaderboard`
//! - `GET /api/questions`, `PUT /api/questions` (driver)
//! - `GET /health`
//! - `GET /ws` and `GET /api/events` for push messages

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::engine::QuizEngine;

pub mod auth;
pub mod error;
mod push;
mod routes;

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    /// The authoritative quiz
    pub engine: Arc<QuizEngine>,
    /// PIN expected in the driver header
    pub driver_pin: Arc<str>,
}

impl AppState {
    /// Wraps an engine and the driver PIN
    pub fn new(engine: Arc<QuizEngine>, driver_pin: &str) -> Self {
        Self {
            engine,
            driver_pin: Arc::from(driver_pin),
        }
    }
}

/// Builds the router with every endpoint
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(push::ws_handler))
        .route("/api/events", get(push::sse_handler))
        .route("/api/state", get(routes::get_state).put(routes::put_state))
        .route(
            "/api/participants",
            get(routes::get_participants).post(routes::join),
        )
        .route("/api/answers", post(routes::submit))
        .route("/api/answers/{question_index}", get(routes::get_answers))
        .route("/api/answers/{question_index}/tally", get(routes::get_tally))
        .route("/api/reset", post(routes::reset))
        .route("/api/leaderboard", get(routes::get_leaderboard))
        .route(
            "/api/questions",
            get(routes::get_questions).put(routes::put_questions),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

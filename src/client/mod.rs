//! Client reconciliation layer
//!
//! A client never trusts its own clock or its own guesses about the quiz: it
//! renders whatever the most recent authoritative message said. Push
//! messages and polled snapshots are both turned into a
//! [`StateChange`](reconcile::StateChange) and fed to a pure
//! [`Reconciler`](reconcile::Reconciler), which updates the
//! [`ClientView`](view::ClientView) and asks for follow-up I/O through
//! [`Effect`](reconcile::Effect)s. [`sync`] wires that state machine to an
//! [`api::QuizApi`] and a [`local::LocalStorage`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use thiserror::Error;

pub mod api;
pub mod local;
pub mod reconcile;
pub mod sync;
pub mod view;

/// Errors surfaced by the client layer
///
/// Only explicit user actions report these to the user. Background sync
/// failures are logged and retried.
#[derive(Error, Debug)]
pub enum Error {
    /// The request could not be sent or its response not read
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server refused the request
    #[error("{message}")]
    Server {
        /// HTTP status of the response
        status: u16,
        /// Stable kebab-case identifier, such as `already-answered`
        code: String,
        /// Human readable explanation
        message: String,
    },
    /// A snapshot older than what the client already knows
    #[error("snapshot from epoch {got} is older than epoch {known}")]
    StaleRead {
        /// Epoch of the discarded snapshot
        got: u64,
        /// Epoch the client is in
        known: u64,
    },
    /// The push channel could not be opened
    #[error("push channel unavailable")]
    ChannelUnavailable,
    /// The persisted session could not be decoded
    #[error("local session is corrupted: {0}")]
    CorruptedLocalState(#[source] serde_json::Error),
    /// The persisted session could not be read or written
    #[error("local storage failed: {0}")]
    Storage(#[from] std::io::Error),
    /// The action needs a registered participant
    #[error("not registered")]
    NotRegistered,
    /// The answer UI is disabled
    #[error("answering is not open")]
    SubmissionBlocked,
}

impl Error {
    /// The server's error code, if the server refused the request
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Timing of the background sync
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Period of the polling fallback
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Empty participant lists tolerated before treating the list as real
    pub empty_read_retries: u32,
    /// Base delay of retries and push reconnects
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_backoff: Duration,
    /// Longest delay between push reconnects
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            empty_read_retries: 3,
            retry_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Delay before retry number `attempt` (starting at 1)
    ///
    /// Doubles with every attempt up to `max_backoff`, plus up to half the
    /// base delay of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff.as_millis() as u64;
        let exponential = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let capped = exponential.min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(capped + fastrand::u64(0..=base / 2))
    }
}

//! # Quizsync
//!
//! This library provides the real-time synchronization core of a live quiz:
//! a server-authoritative step state machine, a timer that derives remaining
//! time from a stored start instant, an answer ledger that accepts at most
//! one answer per participant and question, a broadcast channel for push
//! clients, and a client-side reconciliation layer that merges pushes with a
//! polling fallback.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
use derive_where::derive_where;
use serde::{Deserialize, Serialize};

pub mod constants;

pub mod broadcast;
pub mod client;
pub mod clock;
pub mod config;
pub mod engine;
pub mod leaderboard;
pub mod ledger;
pub mod participant;
pub mod question;
pub mod runtime;
pub mod server;
pub mod session;
pub mod step;
pub mod store;
pub mod timer;

/// Messages pushed to every connected client
///
/// Each message is small and idempotent to receive twice, so delivery can be
/// best-effort. On the wire a message is a JSON object whose `type` field
/// names the kind in kebab-case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PushMessage {
    /// Countdown or remaining time of the live question
    TimerUpdate(timer::TimerUpdate),
    /// A step change has been decided and takes effect shortly
    StepTransition(broadcast::StepTransition),
    /// The announced step is now live
    StepActivation(broadcast::StepActivation),
    /// A participant's total score after a reveal
    UserScore(broadcast::UserScore),
    /// Every participant and answer was wiped
    QuizReset(broadcast::QuizReset),
    /// The question list changed out-of-band
    QuestionsSync(broadcast::QuestionsSync),
}

impl PushMessage {
    /// Converts the message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }

    /// The kebab-case kind name, also used as the SSE event name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TimerUpdate(_) => "timer-update",
            Self::StepTransition(_) => "step-transition",
            Self::StepActivation(_) => "step-activation",
            Self::UserScore(_) => "user-score",
            Self::QuizReset(_) => "quiz-reset",
            Self::QuestionsSync(_) => "questions-sync",
        }
    }
}

/// The first entries of a longer list, with the length of the whole list
///
/// Used for the leaderboard: every client learns how many participants
/// there are, but only the top of the board is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[derive_where(Default)]
#[serde(rename_all = "camelCase")]
pub struct TruncatedVec<T> {
    exact_count: usize,
    items: Vec<T>,
}

impl<T> TruncatedVec<T> {
    /// Keeps at most `limit` entries of `items`
    pub fn top(mut items: Vec<T>, limit: usize) -> Self {
        let exact_count = items.len();
        items.truncate(limit);
        Self { exact_count, items }
    }

    /// Length of the full list
    pub fn exact_count(&self) -> usize {
        self.exact_count
    }

    /// The kept entries
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Whether entries were dropped
    pub fn is_truncated(&self) -> bool {
        self.items.len() < self.exact_count
    }
}

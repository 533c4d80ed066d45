//! Scoring and leaderboard derivation
//!
//! Scores are never incremented in place. Whenever a question is revealed,
//! the score of every participant is recomputed from the complete answer
//! history of all revealed questions, which makes the computation
//! idempotent: revealing, restarting and revealing again gives the same
//! totals.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    TruncatedVec,
    clock::EpochMillis,
    ledger::Answer,
    participant::{Id, Participant},
    question::QuestionSet,
};

/// How a correct answer is rewarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scoring {
    /// Every correct answer earns the same points
    Flat {
        /// Points per correct answer
        points: u64,
    },
    /// Points decrease linearly from `max_points` at the start to half of
    /// it at the deadline
    TimeDecay {
        /// Points for an instant correct answer
        max_points: u64,
    },
}

impl Default for Scoring {
    fn default() -> Self {
        Self::Flat { points: 1 }
    }
}

impl Scoring {
    /// Points earned by a correct answer given `taken` ms after the start
    /// of a `window` ms answering window
    fn award(&self, taken: u64, window: u64) -> u64 {
        match *self {
            Self::Flat { points } => points,
            Self::TimeDecay { max_points } => {
                let fraction = (taken.min(window) as f64 / window.max(1) as f64) / 2.;
                (max_points as f64 * (1. - fraction)) as u64
            }
        }
    }
}

/// A question whose answers have been scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revealed {
    /// When the question started accepting answers
    pub question_start_time: EpochMillis,
    /// Answering window in milliseconds
    pub window: u64,
}

/// Recomputes total scores from every revealed question
///
/// # Arguments
///
/// * `questions` - The round's questions, for the correct indices
/// * `revealed` - Revealed questions by index
/// * `answers` - Answer sets by question index
/// * `scoring` - The scoring rule
///
/// # Returns
///
/// Total points per participant. Participants without a correct answer are
/// absent from the map.
pub fn compute_scores(
    questions: &QuestionSet,
    revealed: &BTreeMap<usize, Revealed>,
    answers: &HashMap<usize, Vec<Answer>>,
    scoring: Scoring,
) -> HashMap<Id, u64> {
    let mut totals: HashMap<Id, u64> = HashMap::new();
    for (index, reveal) in revealed {
        let (Some(question), Some(answers)) = (questions.get(*index), answers.get(index)) else {
            continue;
        };
        for answer in answers.iter().filter(|a| question.is_correct(a.answer_index)) {
            let taken = answer.timestamp.saturating_sub(reveal.question_start_time);
            *totals.entry(answer.participant_id).or_default() += scoring.award(taken, reveal.window);
        }
    }
    totals
}

/// One row of the leaderboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    /// Participant the row belongs to
    pub participant_id: Id,
    /// Display name
    pub name: String,
    /// Total score
    pub score: u64,
    /// 1-based rank; tied scores share a rank
    pub position: usize,
}

/// Orders participants by score (descending) then name (ascending)
pub fn leaderboard(participants: &[Participant]) -> Vec<LeaderboardEntry> {
    let sorted = participants
        .iter()
        .sorted_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        })
        .collect_vec();

    let mut entries: Vec<LeaderboardEntry> = Vec::with_capacity(sorted.len());
    for (i, p) in sorted.into_iter().enumerate() {
        let position = match entries.last() {
            Some(previous) if previous.score == p.score => previous.position,
            _ => i + 1,
        };
        entries.push(LeaderboardEntry {
            participant_id: p.id,
            name: p.name.clone(),
            score: p.score,
            position,
        });
    }
    entries
}

/// Leaderboard as sent to clients, limited to the top entries
pub fn leaderboard_message(participants: &[Participant]) -> TruncatedVec<LeaderboardEntry> {
    TruncatedVec::top(
        leaderboard(participants),
        crate::constants::quiz::LEADERBOARD_LIMIT,
    )
}

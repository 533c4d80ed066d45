//! The quiz step state machine
//!
//! [`QuizState`] is the singleton record every client synchronizes against.
//! It only changes through [`QuizState::transition`] and [`QuizState::reset`],
//! which enforce the step lifecycle:
//!
//! ```text
//! lobby -> waiting -> question -> result -> question | end
//!   ^__________________________________________________|  (reset, from anywhere)
//! ```

use std::{fmt::Display, time::Duration};

use enum_map::Enum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::EpochMillis;

/// One phase of the quiz lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Participants are joining
    Lobby,
    /// Joining is over; the driver is about to start the first question
    Waiting,
    /// A question is live (or counting down to its start)
    Question,
    /// Answers for the current question are revealed and scored
    Result,
    /// The quiz is over
    End,
}

impl Step {
    /// Whether `self -> to` is an edge of the lifecycle
    ///
    /// Reset (`* -> lobby`) is not an edge; it is handled by [`QuizState::reset`].
    pub fn can_advance_to(self, to: Step) -> bool {
        matches!(
            (self, to),
            (Step::Lobby, Step::Waiting)
                | (Step::Waiting, Step::Question)
                | (Step::Question, Step::Result)
                | (Step::Result, Step::Question | Step::End)
        )
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Step::Lobby => "lobby",
            Step::Waiting => "waiting",
            Step::Question => "question",
            Step::Result => "result",
            Step::End => "end",
        })
    }
}

/// Errors produced by rejected transitions
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Error {
    /// `from -> to` is not an edge of the lifecycle
    #[error("cannot move from {from} to {to}")]
    Rejected {
        /// Step the quiz was in
        from: Step,
        /// Step that was requested
        to: Step,
    },
    /// The transition would show a question that does not exist
    #[error("there is no question at index {index}")]
    NoSuchQuestion {
        /// Index that would have been shown
        index: usize,
    },
}

/// Inputs a transition needs besides the current state
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// Time at which the transition is being decided
    pub now: EpochMillis,
    /// Delay between entering `question` and the question actually starting
    pub question_lead: Duration,
    /// Number of questions in the round
    pub question_count: usize,
}

/// The authoritative quiz record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizState {
    /// Current phase
    pub step: Step,
    /// Index of the question being shown, or about to be shown
    pub current_question_index: usize,
    /// When the current question starts accepting answers
    ///
    /// Only set while `step` is `question`.
    pub question_start_time: Option<EpochMillis>,
    /// Answering time per question, in seconds
    pub timer_max: u64,
    /// Number of resets since the store was created
    pub epoch: u64,
    /// Number of times the question list was replaced
    pub questions_version: u64,
}

impl QuizState {
    /// A fresh state in the lobby
    pub fn new(timer_max: u64) -> Self {
        Self {
            step: Step::Lobby,
            current_question_index: 0,
            question_start_time: None,
            timer_max,
            epoch: 0,
            questions_version: 0,
        }
    }

    /// Computes the state after moving to `to`
    ///
    /// Entering `question` schedules its start `question_lead` in the future
    /// so no client can begin counting down before the server does. Entering
    /// `result` or `end` clears the start time. The state itself is left
    /// untouched; the caller stores the returned value.
    ///
    /// # Errors
    ///
    /// * `Error::Rejected` - `to` is not reachable from the current step
    /// * `Error::NoSuchQuestion` - the next question index is out of range
    pub fn transition(&self, to: Step, ctx: &Context) -> Result<QuizState, Error> {
        if !self.step.can_advance_to(to) {
            return Err(Error::Rejected {
                from: self.step,
                to,
            });
        }

        let mut next = *self;
        next.step = to;
        match to {
            Step::Question => {
                let index = match self.step {
                    Step::Result => self.current_question_index + 1,
                    _ => 0,
                };
                if index >= ctx.question_count {
                    return Err(Error::NoSuchQuestion { index });
                }
                next.current_question_index = index;
                next.question_start_time = Some(ctx.now + ctx.question_lead.as_millis() as u64);
            }
            Step::Lobby | Step::Waiting | Step::Result | Step::End => {
                next.question_start_time = None;
            }
        }
        Ok(next)
    }

    /// The state after a hard reset
    ///
    /// Always succeeds. The epoch moves forward so clients can recognise the
    /// reset from any later snapshot.
    pub fn reset(&self) -> QuizState {
        QuizState {
            step: Step::Lobby,
            current_question_index: 0,
            question_start_time: None,
            timer_max: self.timer_max,
            epoch: self.epoch + 1,
            questions_version: self.questions_version,
        }
    }

    /// The answering window in milliseconds
    pub fn timer_max_ms(&self) -> u64 {
        self.timer_max * 1000
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn ctx(now: EpochMillis) -> Context {
        Context {
            now,
            question_lead: Duration::from_secs(3),
            question_count: 2,
        }
    }

    fn walk(steps: &[Step]) -> Result<QuizState, Error> {
        let mut state = QuizState::new(20);
        for (i, step) in steps.iter().enumerate() {
            state = state.transition(*step, &ctx(1_000 * i as u64))?;
        }
        Ok(state)
    }

    #[test]
    fn full_lifecycle() {
        let state = walk(&[
            Step::Waiting,
            Step::Question,
            Step::Result,
            Step::Question,
            Step::Result,
            Step::End,
        ])
        .unwrap();
        assert_eq!(state.step, Step::End);
        assert_eq!(state.current_question_index, 1);
        assert_eq!(state.question_start_time, None);
    }

    #[test]
    fn invalid_edges_are_rejected() {
        let state = QuizState::new(20);
        assert_eq!(
            state.transition(Step::Result, &ctx(0)),
            Err(Error::Rejected {
                from: Step::Lobby,
                to: Step::Result
            })
        );
        assert!(state.transition(Step::Lobby, &ctx(0)).is_err());
        let waiting = state.transition(Step::Waiting, &ctx(0)).unwrap();
        assert!(waiting.transition(Step::Waiting, &ctx(0)).is_err());
        assert!(waiting.transition(Step::End, &ctx(0)).is_err());
    }

    #[test]
    fn question_starts_after_the_lead() {
        let state = walk(&[Step::Waiting]).unwrap();
        let now = 50_000;
        let question = state.transition(Step::Question, &ctx(now)).unwrap();
        assert_eq!(question.question_start_time, Some(now + 3_000));
        assert!(question.question_start_time.unwrap() >= now);
    }

    #[test]
    fn question_start_never_in_the_past() {
        let mut state = walk(&[Step::Waiting]).unwrap();
        for (i, now) in [10, 10_000, 10_001, 99_999].into_iter().enumerate() {
            let to = if i % 2 == 0 { Step::Question } else { Step::Result };
            let context = Context {
                now,
                question_lead: Duration::from_millis(i as u64 * 7),
                question_count: 10,
            };
            state = state.transition(to, &context).unwrap();
            if let Some(start) = state.question_start_time {
                assert!(start >= now);
            }
        }
    }

    #[test]
    fn running_out_of_questions() {
        let state = walk(&[Step::Waiting, Step::Question, Step::Result, Step::Question, Step::Result])
            .unwrap();
        assert_eq!(
            state.transition(Step::Question, &ctx(0)),
            Err(Error::NoSuchQuestion { index: 2 })
        );

        let empty = Context {
            question_count: 0,
            ..ctx(0)
        };
        let waiting = QuizState::new(20).transition(Step::Waiting, &empty).unwrap();
        assert_eq!(
            waiting.transition(Step::Question, &empty),
            Err(Error::NoSuchQuestion { index: 0 })
        );
    }

    #[test]
    fn reset_bumps_epoch() {
        let state = walk(&[Step::Waiting, Step::Question]).unwrap();
        let reset = state.reset();
        assert_eq!(reset.step, Step::Lobby);
        assert_eq!(reset.epoch, state.epoch + 1);
        assert_eq!(reset.question_start_time, None);
        assert_eq!(reset.timer_max, 20);
    }

    #[test]
    fn wire_format() {
        let json = serde_json::to_value(QuizState::new(20)).unwrap();
        assert_eq!(json["step"], "lobby");
        assert_eq!(json["currentQuestionIndex"], 0);
        assert!(json["questionStartTime"].is_null());
        assert_eq!(json["timerMax"], 20);
    }
}

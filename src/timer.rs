//! Timer Authority readings
//!
//! The remaining time of a question is never stored or decremented. Every
//! tick derives it again from `questionStartTime` and `timerMax`, so the
//! reading cannot drift and any client can be re-anchored from one message.

use serde::Serialize;
use serde_with::skip_serializing_none;

use crate::{
    clock::EpochMillis,
    step::{QuizState, Step},
};

/// What the timer looks like at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerReading {
    /// No question is live
    Idle,
    /// The question has been announced but has not started yet
    Countdown {
        /// Whole seconds until the start, rounded up
        countdown_to_start: u64,
    },
    /// Answers are being accepted
    Running {
        /// Milliseconds left to answer
        time_remaining: u64,
    },
    /// The answering window is over but the step has not moved on yet
    Expired,
}

impl TimerReading {
    /// Derives the reading for `state` at `now`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use quizsync::step::{QuizState, Step};
    /// use quizsync::timer::TimerReading;
    ///
    /// let mut state = QuizState::new(20);
    /// state.step = Step::Question;
    /// state.question_start_time = Some(10_000);
    ///
    /// assert_eq!(TimerReading::at(&state, 8_500), TimerReading::Countdown { countdown_to_start: 2 });
    /// assert_eq!(TimerReading::at(&state, 15_000), TimerReading::Running { time_remaining: 15_000 });
    /// assert_eq!(TimerReading::at(&state, 30_000), TimerReading::Expired);
    /// ```
    pub fn at(state: &QuizState, now: EpochMillis) -> Self {
        let (Step::Question, Some(start)) = (state.step, state.question_start_time) else {
            return Self::Idle;
        };

        if now < start {
            return Self::Countdown {
                countdown_to_start: (start - now).div_ceil(1000),
            };
        }

        match state.timer_max_ms().saturating_sub(now - start) {
            0 => Self::Expired,
            time_remaining => Self::Running { time_remaining },
        }
    }

    /// Whether participants may submit during this reading
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Milliseconds left to answer, zero outside of a running question
    pub fn time_remaining(&self) -> u64 {
        match self {
            Self::Running { time_remaining } => *time_remaining,
            Self::Countdown { .. } | Self::Idle | Self::Expired => 0,
        }
    }

    /// Builds the push payload for this reading
    ///
    /// Only counting and running readings are broadcast. Expiry reaches
    /// clients as the `step-transition` into `result`.
    pub fn to_update(&self, state: &QuizState, now: EpochMillis) -> Option<TimerUpdate> {
        let countdown_to_start = match self {
            Self::Idle | Self::Expired => return None,
            Self::Countdown { countdown_to_start } => Some(*countdown_to_start),
            Self::Running { .. } => None,
        };
        Some(TimerUpdate {
            question_index: state.current_question_index,
            question_start_time: state.question_start_time,
            time_remaining: self.time_remaining(),
            timer_max: state.timer_max,
            countdown_to_start,
            active: self.is_active(),
            server_time: now,
        })
    }
}

/// The `timer-update` message
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerUpdate {
    /// Question the timer belongs to
    pub question_index: usize,
    /// Authoritative start of the question
    pub question_start_time: Option<EpochMillis>,
    /// Milliseconds left to answer
    pub time_remaining: u64,
    /// Answering window in seconds
    pub timer_max: u64,
    /// Seconds until the question starts, while counting down
    pub countdown_to_start: Option<u64>,
    /// Whether answers are currently accepted
    pub active: bool,
    /// Server clock at the time of the reading
    pub server_time: EpochMillis,
}

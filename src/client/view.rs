//! What a client renders

use crate::{
    broadcast::StepTransition,
    participant::{Id, Participant},
    question::{Question, QuestionSet},
    step::{QuizState, Step},
    timer::TimerUpdate,
};

/// The client's picture of the quiz
///
/// Everything here was derived from authoritative messages, except
/// `selected_answer_index` before the answer is stored, which is
/// provisional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientView {
    /// Last authoritative state
    pub state: Option<QuizState>,
    /// A step announced by `step-transition` that is not live yet
    pub pending: Option<StepTransition>,
    /// Last timer reading for the current question
    pub timer: Option<TimerUpdate>,
    /// Last participant list
    pub participants: Vec<Participant>,
    /// Last question list
    pub questions: Option<QuestionSet>,
    /// This client's participant id, once registered
    pub participant_id: Option<Id>,
    /// This client's participant name, once registered
    pub participant_name: Option<String>,
    /// This participant's total score
    pub score: Option<u64>,
    /// Option chosen for the current question
    pub selected_answer_index: Option<i32>,
    /// Whether the current question was answered
    pub answered: bool,
    /// The participant must join (again) before playing
    pub needs_registration: bool,
    /// A push channel is open
    pub connected: bool,
    /// The state was fetched since the last (re)connect
    pub ready: bool,
}

impl ClientView {
    /// The current step, once known
    pub fn step(&self) -> Option<Step> {
        self.state.map(|s| s.step)
    }

    /// The current question index, once known
    pub fn current_question_index(&self) -> Option<usize> {
        self.state.map(|s| s.current_question_index)
    }

    /// The question being shown, if the list is loaded
    pub fn current_question(&self) -> Option<&Question> {
        let index = self.current_question_index()?;
        self.questions.as_ref()?.get(index)
    }

    /// Whole seconds until the current question starts
    pub fn countdown(&self) -> Option<u64> {
        self.timer.as_ref().and_then(|t| t.countdown_to_start)
    }

    /// Whether the answer UI is enabled
    ///
    /// Requires a registered participant, a running timer reported by the
    /// server for the current question, no announced step change and no
    /// stored answer.
    pub fn can_submit(&self) -> bool {
        let Some(state) = self.state else {
            return false;
        };
        self.ready
            && self.participant_id.is_some()
            && !self.answered
            && self.pending.is_none()
            && state.step == Step::Question
            && self
                .timer
                .as_ref()
                .is_some_and(|t| t.active && t.question_index == state.current_question_index)
    }
}

//! Question records and the ordered question list
//!
//! Question content is managed by an external collaborator; the engine only
//! needs to look questions up by index (the display order) and by id. A
//! [`QuestionSet`] is validated as a whole before it replaces the current
//! round's questions.

use std::collections::HashSet;

use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::constants::question as limits;

/// A single multiple choice question
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    /// Stable identity of the question
    #[garde(length(min = 1, max = limits::MAX_ID_LENGTH))]
    pub id: String,
    /// The question text shown to every client
    #[garde(length(min = 1, max = limits::MAX_TEXT_LENGTH))]
    pub text: String,
    /// Answer options in display order
    #[garde(
        length(min = limits::MIN_OPTION_COUNT, max = limits::MAX_OPTION_COUNT),
        inner(length(min = 1, max = limits::MAX_OPTION_LENGTH))
    )]
    pub options: Vec<String>,
    /// Index into `options` of the correct answer
    #[garde(custom(option_index_in_range(self.options.len())))]
    pub correct_index: usize,
    /// Image shown alongside the question
    #[garde(length(max = limits::MAX_URL_LENGTH))]
    pub question_image: Option<String>,
    /// Image shown on the result screen
    #[garde(length(max = limits::MAX_URL_LENGTH))]
    pub answer_image: Option<String>,
}

fn option_index_in_range(option_count: usize) -> impl FnOnce(&usize, &()) -> garde::Result {
    move |index, _| {
        if *index < option_count {
            Ok(())
        } else {
            Err(garde::Error::new(format!(
                "correct index {index} is outside of [0,{option_count})"
            )))
        }
    }
}

impl Question {
    /// Whether `answer_index` selects the correct option
    ///
    /// `-1` (no answer) and out-of-range indices are never correct.
    pub fn is_correct(&self, answer_index: i32) -> bool {
        usize::try_from(answer_index).is_ok_and(|i| i == self.correct_index)
    }

    /// Whether `answer_index` is acceptable for this question
    ///
    /// Valid values are `-1` and any option index.
    pub fn accepts(&self, answer_index: i32) -> bool {
        answer_index == -1 || usize::try_from(answer_index).is_ok_and(|i| i < self.options.len())
    }
}

/// The ordered question list of a quiz round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(transparent)]
pub struct QuestionSet {
    #[garde(
        length(max = crate::constants::quiz::MAX_QUESTION_COUNT),
        custom(unique_ids),
        dive
    )]
    questions: Vec<Question>,
}

fn unique_ids(questions: &Vec<Question>, _ctx: &()) -> garde::Result {
    let mut seen = HashSet::new();
    match questions.iter().find(|q| !seen.insert(q.id.as_str())) {
        Some(duplicate) => Err(garde::Error::new(format!(
            "question id {} appears more than once",
            duplicate.id
        ))),
        None => Ok(()),
    }
}

impl QuestionSet {
    /// Wraps an ordered list of questions
    ///
    /// The list is not validated here; call [`Validate::validate`] before
    /// accepting input from outside the process.
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    /// Returns the question shown at `index`
    pub fn get(&self, index: usize) -> Option<&Question> {
        self.questions.get(index)
    }

    /// Finds a question by its id
    pub fn by_id(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    /// Number of questions in the round
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Whether the round has no questions
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Iterates over questions in display order
    pub fn iter(&self) -> impl Iterator<Item = &Question> {
        self.questions.iter()
    }
}

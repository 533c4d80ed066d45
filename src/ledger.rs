//! The Answer Ledger
//!
//! Records at most one [`Answer`] per (question, participant). Each
//! question's answer set sits behind its own async mutex, so the
//! check-then-insert of one submission is atomic with respect to every other
//! submission for the same question, while different questions never contend.
//! An answer is persisted before the lock is released.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    clock::EpochMillis,
    participant::Id,
    store::{self, Store},
};

/// A recorded answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    /// Question the answer belongs to
    pub question_index: usize,
    /// Who answered
    pub participant_id: Id,
    /// Name of the participant at the time of answering
    pub participant_name: String,
    /// Selected option, or `-1` for "no answer"
    pub answer_index: i32,
    /// Server time at which the answer was accepted
    pub timestamp: EpochMillis,
}

impl Answer {
    /// Whether this is the "no answer" marker sent on timer expiry
    pub fn is_blank(&self) -> bool {
        self.answer_index == -1
    }
}

/// An answer as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Question being answered
    pub question_index: usize,
    /// Who is answering
    pub participant_id: Id,
    /// Display name of the participant
    pub participant_name: String,
    /// Selected option, or `-1` for "no answer"
    pub answer_index: i32,
}

impl Submission {
    /// Stamps the submission with the acceptance time
    pub fn into_answer(self, timestamp: EpochMillis) -> Answer {
        Answer {
            question_index: self.question_index,
            participant_id: self.participant_id,
            participant_name: self.participant_name,
            answer_index: self.answer_index,
            timestamp,
        }
    }
}

/// Reasons a submission is refused
#[derive(Error, Debug)]
pub enum Error {
    /// The participant already has an answer for this question
    #[error("participant {participant_id} already answered question {question_index}")]
    AlreadyAnswered {
        /// Question that was answered twice
        question_index: usize,
        /// Participant who answered twice
        participant_id: Id,
    },
    /// The question is live but its start time has not been reached
    #[error("question {question_index} has not started yet")]
    NotStarted {
        /// Question that is counting down
        question_index: usize,
    },
    /// The question is not accepting answers
    #[error("question {question_index} is not accepting answers")]
    QuestionClosed {
        /// Question that was answered
        question_index: usize,
    },
    /// The answer index is neither `-1` nor an option of the question
    #[error("answer index {answer_index} is not an option")]
    InvalidAnswer {
        /// Index that was submitted
        answer_index: i32,
    },
    /// The participant is not part of the round
    #[error("participant {0} has not joined")]
    UnknownParticipant(Id),
    /// The answer could not be persisted
    #[error(transparent)]
    Store(#[from] store::Error),
}

type AnswerSet = Arc<Mutex<Vec<Answer>>>;

/// Per-question answer sets
#[derive(Debug, Default)]
pub struct AnswerLedger {
    sets: RwLock<HashMap<usize, AnswerSet>>,
}

impl AnswerLedger {
    /// Loads every stored answer set
    ///
    /// # Errors
    ///
    /// Returns the storage error if a set cannot be read or decoded.
    pub fn restore(store: &dyn Store) -> Result<Self, store::Error> {
        let mut sets = HashMap::new();
        for key in store.keys(store::ANSWERS_PREFIX)? {
            let Some(index) = key
                .strip_prefix(store::ANSWERS_PREFIX)
                .and_then(|i| i.parse::<usize>().ok())
            else {
                continue;
            };
            let answers: Vec<Answer> = store::load(store, &key)?.unwrap_or_default();
            sets.insert(index, Arc::new(Mutex::new(answers)));
        }
        Ok(Self {
            sets: RwLock::new(sets),
        })
    }

    fn existing(&self, question_index: usize) -> Result<Option<AnswerSet>, store::Error> {
        Ok(self
            .sets
            .read()
            .map_err(|_| store::Error::Poisoned)?
            .get(&question_index)
            .map(Arc::clone))
    }

    /// The set for `question_index`, created on first use
    fn set(&self, question_index: usize) -> Result<AnswerSet, store::Error> {
        if let Some(set) = self.existing(question_index)? {
            return Ok(set);
        }
        let mut sets = self.sets.write().map_err(|_| store::Error::Poisoned)?;
        Ok(Arc::clone(sets.entry(question_index).or_default()))
    }

    /// Records `answer` unless its participant already answered
    ///
    /// The duplicate check, the write to `store` and the in-memory insert all
    /// happen while holding the question's lock.
    ///
    /// # Errors
    ///
    /// * `Error::AlreadyAnswered` - an answer exists for the same participant
    /// * `Error::Store` - the answer could not be persisted; nothing is recorded
    pub async fn record(&self, answer: Answer, store: &dyn Store) -> Result<Answer, Error> {
        let set = self.set(answer.question_index)?;
        let mut answers = set.lock().await;

        if answers
            .iter()
            .any(|a| a.participant_id == answer.participant_id)
        {
            return Err(Error::AlreadyAnswered {
                question_index: answer.question_index,
                participant_id: answer.participant_id,
            });
        }

        let mut updated = answers.clone();
        updated.push(answer.clone());
        store::save(store, &store::answers_key(answer.question_index), &updated)?;
        *answers = updated;

        Ok(answer)
    }

    /// Every answer for `question_index` in acceptance order
    ///
    /// Reading never creates a set; only [`record`](Self::record) does.
    pub async fn answers(&self, question_index: usize) -> Vec<Answer> {
        match self.existing(question_index) {
            Ok(Some(set)) => set.lock().await.clone(),
            _ => Vec::new(),
        }
    }

    /// Deletes every stored answer set, leaving memory untouched
    ///
    /// Pair with [`forget`](Self::forget) once every other part of a wipe
    /// has been persisted.
    ///
    /// # Errors
    ///
    /// Returns the storage error if a key cannot be listed or deleted.
    pub fn delete_stored(&self, store: &dyn Store) -> Result<(), store::Error> {
        for key in store.keys(store::ANSWERS_PREFIX)? {
            store.delete(&key)?;
        }
        Ok(())
    }

    /// Drops every in-memory answer set
    pub fn forget(&self) {
        self.sets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// How often each option of a question was chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    /// Count per option index
    pub counts: Vec<usize>,
    /// Number of "no answer" markers
    pub blank: usize,
}

impl Tally {
    /// Counts `answers` for a question with `option_count` options
    pub fn new(answers: &[Answer], option_count: usize) -> Self {
        let mut counts = vec![0; option_count];
        let mut blank = 0;
        for answer in answers {
            match usize::try_from(answer.answer_index) {
                Ok(i) if i < option_count => counts[i] += 1,
                _ => blank += 1,
            }
        }
        Self { counts, blank }
    }
}

//! The authoritative quiz engine
//!
//! [`QuizEngine`] owns every piece of server state and is the only writer of
//! it. Each operation persists its mutation to the [`Store`] before updating
//! memory and announcing the change to push clients.
//!
//! Locks are always taken in the same order: quiz state, questions, roster,
//! revealed set, then the per-question answer sets inside the ledger.
//! Submissions hold the quiz state for reading while they are recorded, so a
//! transition into `result` waits for in-flight submissions and scores a
//! complete answer set.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use garde::Validate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::{
    TruncatedVec,
    broadcast::{
        Broadcaster, ConnectionId, QuestionsSync, QuizReset, Role, StepActivation, StepTransition,
        UserScore,
    },
    clock::{Clock, EpochMillis},
    config::Settings,
    leaderboard::{self, LeaderboardEntry, Revealed, Scoring},
    ledger::{self, Answer, AnswerLedger, Submission, Tally},
    participant::{self, Id, Joined, Participant, Roster},
    question::QuestionSet,
    session::{ChannelTunnel, Tunnel},
    step::{self, Context, QuizState, Step},
    store::{self, Store},
    timer::TimerReading,
};

/// Timing and scoring options of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Answering window in seconds, applied to a state in the lobby
    pub timer_max: u64,
    /// Delay between entering `question` and its start
    pub question_lead: Duration,
    /// Delay between a `step-transition` and its `step-activation`
    pub activation_lead: Duration,
    /// Points awarded for correct answers
    pub scoring: Scoring,
}

impl Default for Options {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for Options {
    fn from(settings: &Settings) -> Self {
        Self {
            timer_max: settings.timer_max,
            question_lead: settings.question_lead,
            activation_lead: settings.activation_lead,
            scoring: settings.scoring,
        }
    }
}

/// Delayed work the engine asks its runtime to deliver back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// Announce that a previously transitioned step is live
    ActivateStep {
        /// Epoch the transition happened in
        epoch: u64,
        /// Step that was entered
        step: Step,
        /// Question index at the time of the transition
        question_index: usize,
    },
}

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// The requested step change is not allowed
    #[error(transparent)]
    Transition(#[from] step::Error),
    /// A submission was refused
    #[error(transparent)]
    Answer(#[from] ledger::Error),
    /// A join request was refused
    #[error(transparent)]
    Join(#[from] participant::Error),
    /// New participants can only join in the lobby
    #[error("joining is closed during {0}")]
    JoinClosed(Step),
    /// The question list is frozen while a round is running
    #[error("questions cannot be replaced during {0}")]
    QuestionsLocked(Step),
    /// The replacement question list failed validation
    #[error("invalid questions: {0}")]
    InvalidQuestions(String),
    /// The mutation could not be persisted
    #[error(transparent)]
    Store(#[from] store::Error),
}

impl Error {
    /// Stable kebab-case identifier sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transition(step::Error::Rejected { .. }) => "rejected-transition",
            Self::Transition(step::Error::NoSuchQuestion { .. }) => "no-such-question",
            Self::Answer(e) => match e {
                ledger::Error::AlreadyAnswered { .. } => "already-answered",
                ledger::Error::NotStarted { .. } => "not-started",
                ledger::Error::QuestionClosed { .. } => "question-closed",
                ledger::Error::InvalidAnswer { .. } => "invalid-answer",
                ledger::Error::UnknownParticipant(_) => "unknown-participant",
                ledger::Error::Store(_) => "storage-unavailable",
            },
            Self::Join(e) => match e {
                participant::Error::Empty => "empty-name",
                participant::Error::Sinful => "inappropriate-name",
                participant::Error::TooLong => "name-too-long",
                participant::Error::MaximumParticipants => "quiz-full",
            },
            Self::JoinClosed(_) => "join-closed",
            Self::QuestionsLocked(_) => "questions-locked",
            Self::InvalidQuestions(_) => "invalid-questions",
            Self::Store(_) => "storage-unavailable",
        }
    }
}

/// The single authoritative quiz
pub struct QuizEngine {
    options: Options,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    state: RwLock<QuizState>,
    questions: RwLock<QuestionSet>,
    roster: RwLock<Roster>,
    revealed: Mutex<BTreeMap<usize, Revealed>>,
    ledger: AnswerLedger,
    broadcaster: Broadcaster<ChannelTunnel>,
}

impl QuizEngine {
    /// Opens the quiz persisted in `store`, or a fresh one if it is empty
    ///
    /// A restored state in the lobby picks up `options.timer_max`; a restored
    /// round keeps the window it was started with.
    ///
    /// # Errors
    ///
    /// Returns the storage error if a stored record cannot be read.
    pub fn open(
        options: Options,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let mut state = store::load::<QuizState>(store.as_ref(), store::QUIZ_STATE)?
            .unwrap_or_else(|| QuizState::new(options.timer_max));
        if state.step == Step::Lobby {
            state.timer_max = options.timer_max;
        }
        let questions = store::load(store.as_ref(), store::QUESTIONS)?.unwrap_or_default();
        let roster = store::load(store.as_ref(), store::PARTICIPANTS)?.unwrap_or_default();
        let revealed = store::load(store.as_ref(), store::REVEALED)?.unwrap_or_default();
        let ledger = AnswerLedger::restore(store.as_ref())?;

        info!(step = %state.step, epoch = state.epoch, "quiz opened");

        Ok(Self {
            options,
            clock,
            store,
            state: RwLock::new(state),
            questions: RwLock::new(questions),
            roster: RwLock::new(roster),
            revealed: Mutex::new(revealed),
            ledger,
            broadcaster: Broadcaster::default(),
        })
    }

    /// Current server time
    pub fn now(&self) -> EpochMillis {
        self.clock.now_ms()
    }

    /// The options the engine runs with
    pub fn options(&self) -> Options {
        self.options
    }

    /// The authoritative quiz state
    pub async fn state(&self) -> QuizState {
        *self.state.read().await
    }

    /// The ordered question list
    pub async fn questions(&self) -> QuestionSet {
        self.questions.read().await.clone()
    }

    /// Every participant in join order
    pub async fn participants(&self) -> Vec<Participant> {
        self.roster.read().await.participants().to_vec()
    }

    /// Every answer recorded for `question_index`
    pub async fn answers(&self, question_index: usize) -> Vec<Answer> {
        self.ledger.answers(question_index).await
    }

    /// Per-option counts for `question_index`, if that question exists
    pub async fn tally(&self, question_index: usize) -> Option<Tally> {
        let option_count = self.questions.read().await.get(question_index)?.options.len();
        Some(Tally::new(
            &self.ledger.answers(question_index).await,
            option_count,
        ))
    }

    /// The leaderboard derived from current scores
    pub async fn leaderboard(&self) -> TruncatedVec<LeaderboardEntry> {
        leaderboard::leaderboard_message(self.roster.read().await.participants())
    }

    /// The push client registry
    pub fn broadcaster(&self) -> &Broadcaster<ChannelTunnel> {
        &self.broadcaster
    }

    /// Sends the live state to a push client and registers it
    ///
    /// A tunnel that cannot take the live state is closed instead of
    /// registered, and `None` is returned.
    pub async fn connect(&self, role: Role, tunnel: ChannelTunnel) -> Option<ConnectionId> {
        let state = self.state().await;
        if let Err(e) = tunnel.send_message(&StepActivation { state }.into()) {
            debug!(error = %e, ?role, "push client dropped before registration");
            tunnel.close();
            return None;
        }
        Some(self.broadcaster.connect(role, tunnel))
    }

    /// Moves the quiz to `to` on behalf of the driver
    ///
    /// `lobby` is routed to [`reset`](Self::reset). Every other request is
    /// validated by the state machine; entering `result` scores the current
    /// question. The new step is announced immediately with a
    /// `step-transition`, and `schedule_message` receives the alarm that will
    /// announce its `step-activation`.
    ///
    /// # Errors
    ///
    /// * `Error::Transition` - the edge is not allowed; nothing changes
    /// * `Error::Store` - the new state could not be persisted; nothing changes
    pub async fn transition<S: FnMut(AlarmMessage, Duration)>(
        &self,
        to: Step,
        schedule_message: S,
    ) -> Result<QuizState, Error> {
        if to == Step::Lobby {
            return self.reset().await;
        }
        let mut state = self.state.write().await;
        self.apply_transition(&mut state, to, schedule_message)
            .await
            .inspect_err(|e| warn!(from = %state.step, %to, error = %e, "transition rejected"))
    }

    async fn apply_transition<S: FnMut(AlarmMessage, Duration)>(
        &self,
        state: &mut RwLockWriteGuard<'_, QuizState>,
        to: Step,
        mut schedule_message: S,
    ) -> Result<QuizState, Error> {
        let now = self.clock.now_ms();
        let questions = self.questions.read().await;
        let next = state.transition(
            to,
            &Context {
                now,
                question_lead: self.options.question_lead,
                question_count: questions.len(),
            },
        )?;

        let mut scored = None;
        if to == Step::Result {
            scored = Some(self.score_reveal(&**state, &questions).await?);
        }
        drop(questions);

        store::save(self.store.as_ref(), store::QUIZ_STATE, &next)?;
        let from = state.step;
        **state = next;

        info!(
            %from,
            %to,
            question = next.current_question_index,
            start = next.question_start_time,
            "step changed"
        );

        let activates_at = now + self.options.activation_lead.as_millis() as u64;
        self.broadcaster.announce(
            &StepTransition {
                from,
                to,
                question_index: next.current_question_index,
                activates_at,
                epoch: next.epoch,
            }
            .into(),
        );

        if let Some(participants) = scored {
            for participant in participants {
                self.broadcaster.announce(
                    &UserScore {
                        participant_id: participant.id,
                        score: participant.score,
                        question_index: next.current_question_index,
                        epoch: next.epoch,
                    }
                    .into(),
                );
            }
        }

        if self.options.activation_lead.is_zero() {
            self.broadcaster
                .announce(&StepActivation { state: next }.into());
        } else {
            schedule_message(
                AlarmMessage::ActivateStep {
                    epoch: next.epoch,
                    step: next.step,
                    question_index: next.current_question_index,
                },
                self.options.activation_lead,
            );
        }

        Ok(next)
    }

    /// Marks the current question revealed and recomputes every score
    ///
    /// The revealed set and roster are persisted and replaced in memory. The
    /// caller still holds the quiz state, so no answer can be recorded
    /// concurrently.
    async fn score_reveal(
        &self,
        state: &QuizState,
        questions: &QuestionSet,
    ) -> Result<Vec<Participant>, Error> {
        let mut revealed = self.revealed.lock().await;
        let mut next_revealed = revealed.clone();
        if let Some(question_start_time) = state.question_start_time {
            next_revealed.insert(
                state.current_question_index,
                Revealed {
                    question_start_time,
                    window: state.timer_max_ms(),
                },
            );
        }

        let mut answers = HashMap::new();
        for index in next_revealed.keys() {
            answers.insert(*index, self.ledger.answers(*index).await);
        }
        let scores =
            leaderboard::compute_scores(questions, &next_revealed, &answers, self.options.scoring);

        let mut roster = self.roster.write().await;
        let mut next_roster = roster.clone();
        next_roster.set_scores(&scores);

        store::save(self.store.as_ref(), store::REVEALED, &next_revealed)?;
        store::save(self.store.as_ref(), store::PARTICIPANTS, &next_roster)?;

        *revealed = next_revealed;
        *roster = next_roster;
        Ok(roster.participants().to_vec())
    }

    /// Wipes participants and answers and returns to the lobby
    ///
    /// Always accepted. The epoch advances and a `quiz-reset` is announced,
    /// followed by the lobby's `step-activation`.
    ///
    /// The new state is stored first and the round's records are deleted
    /// after it. Memory only changes once every store call has succeeded, so
    /// a failed reset leaves the live round as it was and can be retried.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the wipe could not be persisted.
    pub async fn reset(&self) -> Result<QuizState, Error> {
        let mut state = self.state.write().await;
        let mut roster = self.roster.write().await;
        let mut revealed = self.revealed.lock().await;

        let mut next = state.reset();
        next.timer_max = self.options.timer_max;

        let store = self.store.as_ref();
        store::save(store, store::QUIZ_STATE, &next)
            .and_then(|()| self.ledger.delete_stored(store))
            .and_then(|()| store.delete(store::PARTICIPANTS))
            .and_then(|()| store.delete(store::REVEALED))
            .inspect_err(|e| warn!(error = %e, "reset could not be persisted"))?;

        self.ledger.forget();
        roster.clear();
        revealed.clear();
        *state = next;

        info!(epoch = next.epoch, "quiz reset");

        self.broadcaster
            .announce(&QuizReset { epoch: next.epoch }.into());
        self.broadcaster
            .announce(&StepActivation { state: next }.into());

        Ok(next)
    }

    /// Registers a participant
    ///
    /// Joining with an id that is already registered returns the stored
    /// record in any step. New participants are accepted only in the lobby.
    ///
    /// # Errors
    ///
    /// * `Error::JoinClosed` - a new id outside of the lobby
    /// * `Error::Join` - the name is refused or the quiz is full
    /// * `Error::Store` - the roster could not be persisted
    pub async fn join(
        &self,
        id: Id,
        name: &str,
        avatar_url: Option<String>,
    ) -> Result<Joined, Error> {
        let state = self.state.read().await;
        let mut roster = self.roster.write().await;

        if let Some(existing) = roster.get(id) {
            debug!(participant = %id, "participant joined again");
            return Ok(Joined::Existing(existing.clone()));
        }
        if state.step != Step::Lobby {
            return Err(Error::JoinClosed(state.step));
        }

        let mut next = roster.clone();
        let joined = next.join(id, name, avatar_url)?;
        store::save(self.store.as_ref(), store::PARTICIPANTS, &next)?;
        *roster = next;

        info!(participant = %id, name = %joined.participant().name, "participant joined");
        Ok(joined)
    }

    /// Records an answer for the current question
    ///
    /// Answers are accepted while the question's timer is running. A `-1`
    /// ("no answer") marker is also accepted after expiry and during the
    /// question's `result`; it never earns points. The stored
    /// `participant_name` is the registered one.
    ///
    /// # Errors
    ///
    /// * `ledger::Error::AlreadyAnswered` - the participant already answered
    /// * `ledger::Error::NotStarted` - the question is still counting down
    /// * `ledger::Error::QuestionClosed` - not the current question, or too late
    /// * `ledger::Error::InvalidAnswer` - not `-1` or an option index
    /// * `ledger::Error::UnknownParticipant` - the participant never joined
    pub async fn submit(&self, submission: Submission) -> Result<Answer, Error> {
        let now = self.clock.now_ms();
        let state = self.state.read().await;
        let question_index = submission.question_index;
        let blank = submission.answer_index == -1;

        let open = state.current_question_index == question_index
            && match (state.step, TimerReading::at(&state, now)) {
                (Step::Question, TimerReading::Countdown { .. }) => {
                    return Err(ledger::Error::NotStarted { question_index }.into());
                }
                (Step::Question, TimerReading::Running { .. }) => true,
                (Step::Question | Step::Result, _) => blank,
                _ => false,
            };
        if !open {
            return Err(ledger::Error::QuestionClosed { question_index }.into());
        }

        let accepts = self
            .questions
            .read()
            .await
            .get(question_index)
            .is_some_and(|q| q.accepts(submission.answer_index));
        if !accepts {
            return Err(ledger::Error::InvalidAnswer {
                answer_index: submission.answer_index,
            }
            .into());
        }

        let participant_name = self
            .roster
            .read()
            .await
            .get(submission.participant_id)
            .map(|p| p.name.clone())
            .ok_or(ledger::Error::UnknownParticipant(submission.participant_id))?;

        let answer = Submission {
            participant_name,
            ..submission
        }
        .into_answer(now);

        let recorded = self
            .ledger
            .record(answer, self.store.as_ref())
            .await
            .inspect_err(|e| debug!(question = question_index, error = %e, "answer refused"))?;
        drop(state);

        debug!(
            question = question_index,
            participant = %recorded.participant_id,
            answer = recorded.answer_index,
            "answer recorded"
        );
        Ok(recorded)
    }

    /// Replaces the question list
    ///
    /// Only allowed in the lobby or after the end. The list version advances
    /// and a `questions-sync` is announced.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidQuestions` - the list failed validation
    /// * `Error::QuestionsLocked` - a round is in progress
    /// * `Error::Store` - the list could not be persisted
    pub async fn replace_questions(&self, questions: QuestionSet) -> Result<QuizState, Error> {
        questions
            .validate()
            .map_err(|report| Error::InvalidQuestions(report.to_string()))?;

        let mut state = self.state.write().await;
        if !matches!(state.step, Step::Lobby | Step::End) {
            return Err(Error::QuestionsLocked(state.step));
        }
        let mut current = self.questions.write().await;

        let mut next = *state;
        next.questions_version += 1;
        store::save(self.store.as_ref(), store::QUESTIONS, &questions)?;
        store::save(self.store.as_ref(), store::QUIZ_STATE, &next)?;

        let count = questions.len();
        *current = questions;
        *state = next;

        info!(version = next.questions_version, count, "questions replaced");
        self.broadcaster.announce(
            &QuestionsSync {
                version: next.questions_version,
                count,
            }
            .into(),
        );
        Ok(next)
    }

    /// One period of the timer authority
    ///
    /// Broadcasts the current countdown or remaining time, and moves an
    /// expired question to `result`. Repeated ticks after expiry do nothing
    /// more, since the move only applies to the exact state that expired.
    pub async fn tick<S: FnMut(AlarmMessage, Duration)>(
        &self,
        schedule_message: S,
    ) -> TimerReading {
        let now = self.clock.now_ms();
        let state = self.state().await;
        let reading = TimerReading::at(&state, now);

        if let Some(update) = reading.to_update(&state, now) {
            self.broadcaster.announce(&update.into());
        }
        if reading == TimerReading::Expired {
            self.expire(state, schedule_message).await;
        }
        reading
    }

    /// Moves `expected` to `result` if it is still the live state
    ///
    /// # Returns
    ///
    /// Whether this call performed the move.
    pub async fn expire<S: FnMut(AlarmMessage, Duration)>(
        &self,
        expected: QuizState,
        schedule_message: S,
    ) -> bool {
        let mut state = self.state.write().await;
        if *state != expected || state.step != Step::Question {
            return false;
        }
        match self
            .apply_transition(&mut state, Step::Result, schedule_message)
            .await
        {
            Ok(_) => {
                info!(question = expected.current_question_index, "question expired");
                true
            }
            Err(e) => {
                warn!(error = %e, "expiry could not be applied");
                false
            }
        }
    }

    /// Handles an alarm scheduled by an earlier transition
    ///
    /// Alarms from an older epoch or a step that has since been left are
    /// dropped.
    pub async fn receive_alarm(&self, message: AlarmMessage) -> bool {
        match message {
            AlarmMessage::ActivateStep {
                epoch,
                step,
                question_index,
            } => {
                let state = self.state().await;
                if state.epoch != epoch
                    || state.step != step
                    || state.current_question_index != question_index
                {
                    debug!(%step, "stale activation dropped");
                    return false;
                }
                self.broadcaster
                    .announce(&StepActivation { state }.into());
                true
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{PushMessage, clock::ManualClock, question::tests::question_set, store::MemoryStore};

    struct Harness {
        engine: QuizEngine,
        clock: ManualClock,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(MemoryStore::default());
        let engine = QuizEngine::open(
            Options::default(),
            store.clone(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Harness {
            engine,
            clock,
            store,
        }
    }

    fn no_alarm(_: AlarmMessage, _: Duration) {}

    /// A store whose writes to one key can be made to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        broken: std::sync::Mutex<Option<&'static str>>,
    }

    impl FlakyStore {
        fn break_key(&self, key: &'static str) {
            *self.broken.lock().unwrap() = Some(key);
        }

        fn repair(&self) {
            *self.broken.lock().unwrap() = None;
        }

        fn check(&self, key: &str) -> Result<(), store::Error> {
            match *self.broken.lock().unwrap() {
                Some(broken) if broken == key => Err(std::io::Error::other("disk full").into()),
                _ => Ok(()),
            }
        }
    }

    impl Store for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, store::Error> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), store::Error> {
            self.check(key)?;
            self.inner.put(key, value)
        }

        fn delete(&self, key: &str) -> Result<(), store::Error> {
            self.check(key)?;
            self.inner.delete(key)
        }

        fn keys(&self, prefix: &str) -> Result<Vec<String>, store::Error> {
            self.inner.keys(prefix)
        }
    }

    async fn flaky() -> (QuizEngine, ManualClock, Arc<FlakyStore>, Id) {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(FlakyStore::default());
        let engine =
            QuizEngine::open(Options::default(), store.clone(), Arc::new(clock.clone())).unwrap();
        engine.replace_questions(question_set(2)).await.unwrap();
        let id = Id::new();
        engine.join(id, "alice", None).await.unwrap();
        engine.transition(Step::Waiting, no_alarm).await.unwrap();
        engine.transition(Step::Question, no_alarm).await.unwrap();
        clock.advance(3_000);
        (engine, clock, store, id)
    }

    fn submission(question_index: usize, participant_id: Id, answer_index: i32) -> Submission {
        Submission {
            question_index,
            participant_id,
            participant_name: "ignored".to_owned(),
            answer_index,
        }
    }

    async fn prepared(count: usize) -> (Harness, Id) {
        let h = harness();
        h.engine.replace_questions(question_set(count)).await.unwrap();
        let id = Id::new();
        h.engine.join(id, "alice", None).await.unwrap();
        (h, id)
    }

    async fn start_question(h: &Harness) -> QuizState {
        let state = h.engine.state().await;
        if state.step == Step::Lobby {
            h.engine.transition(Step::Waiting, no_alarm).await.unwrap();
        }
        let state = h.engine.transition(Step::Question, no_alarm).await.unwrap();
        h.clock.advance(3_000);
        state
    }

    #[tokio::test]
    async fn question_starts_after_lead() {
        let (h, _) = prepared(2).await;
        let before = h.engine.now();
        let state = start_question(&h).await;
        assert_eq!(state.step, Step::Question);
        assert_eq!(state.current_question_index, 0);
        assert_eq!(state.question_start_time, Some(before + 3_000));
    }

    #[tokio::test]
    async fn invalid_transition_leaves_state() {
        let (h, _) = prepared(2).await;
        let err = h.engine.transition(Step::Result, no_alarm).await.unwrap_err();
        assert_eq!(err.code(), "rejected-transition");
        assert_eq!(h.engine.state().await.step, Step::Lobby);
    }

    #[tokio::test]
    async fn double_submit_is_rejected() {
        let (h, id) = prepared(2).await;
        start_question(&h).await;

        let first = h.engine.submit(submission(0, id, 1)).await.unwrap();
        assert_eq!(first.participant_name, "alice");

        let second = h.engine.submit(submission(0, id, 2)).await.unwrap_err();
        assert_eq!(second.code(), "already-answered");
        assert_eq!(h.engine.answers(0).await.len(), 1);
    }

    #[tokio::test]
    async fn submit_before_start_is_not_started() {
        let (h, id) = prepared(2).await;
        h.engine.transition(Step::Waiting, no_alarm).await.unwrap();
        h.engine.transition(Step::Question, no_alarm).await.unwrap();

        let err = h.engine.submit(submission(0, id, 1)).await.unwrap_err();
        assert_eq!(err.code(), "not-started");
    }

    #[tokio::test]
    async fn submit_checks_question_and_participant() {
        let (h, id) = prepared(2).await;
        start_question(&h).await;

        let wrong_question = h.engine.submit(submission(1, id, 1)).await.unwrap_err();
        assert_eq!(wrong_question.code(), "question-closed");

        let bad_option = h.engine.submit(submission(0, id, 9)).await.unwrap_err();
        assert_eq!(bad_option.code(), "invalid-answer");

        let stranger = h.engine.submit(submission(0, Id::new(), 1)).await.unwrap_err();
        assert_eq!(stranger.code(), "unknown-participant");
    }

    #[tokio::test]
    async fn expiry_moves_to_result_once() {
        let (h, id) = prepared(2).await;
        start_question(&h).await;
        h.engine.submit(submission(0, id, 1)).await.unwrap();

        h.clock.advance(20_000);
        assert_eq!(h.engine.tick(no_alarm).await, TimerReading::Expired);
        let state = h.engine.state().await;
        assert_eq!(state.step, Step::Result);
        assert_eq!(state.question_start_time, None);

        assert_eq!(h.engine.tick(no_alarm).await, TimerReading::Idle);
        assert_eq!(h.engine.state().await, state);
        assert_eq!(h.engine.participants().await[0].score, 1);
    }

    #[tokio::test]
    async fn expire_ignores_stale_state() {
        let (h, _) = prepared(2).await;
        let started = start_question(&h).await;
        h.engine.transition(Step::Result, no_alarm).await.unwrap();
        assert!(!h.engine.expire(started, no_alarm).await);
    }

    #[tokio::test]
    async fn late_blank_is_recorded_but_not_scored() {
        let (h, id) = prepared(2).await;
        start_question(&h).await;
        h.clock.advance(25_000);

        let late = h.engine.submit(submission(0, id, 1)).await.unwrap_err();
        assert_eq!(late.code(), "question-closed");

        h.engine.tick(no_alarm).await;
        let blank = h.engine.submit(submission(0, id, -1)).await.unwrap();
        assert!(blank.is_blank());
        assert_eq!(h.engine.participants().await[0].score, 0);
    }

    #[tokio::test]
    async fn scores_accumulate_over_reveals() {
        let (h, id) = prepared(2).await;
        start_question(&h).await;
        h.engine.submit(submission(0, id, 1)).await.unwrap();
        h.engine.transition(Step::Result, no_alarm).await.unwrap();

        start_question(&h).await;
        h.engine.submit(submission(1, id, 1)).await.unwrap();
        h.engine.transition(Step::Result, no_alarm).await.unwrap();

        assert_eq!(h.engine.participants().await[0].score, 2);
        let board = h.engine.leaderboard().await;
        assert_eq!(board.items()[0].score, 2);

        let err = h.engine.transition(Step::Question, no_alarm).await.unwrap_err();
        assert_eq!(err.code(), "no-such-question");
        h.engine.transition(Step::End, no_alarm).await.unwrap();
    }

    #[tokio::test]
    async fn reset_then_join_has_single_participant() {
        let (h, _) = prepared(2).await;
        start_question(&h).await;

        let state = h.engine.reset().await.unwrap();
        assert_eq!(state.step, Step::Lobby);
        assert_eq!(state.epoch, 1);
        assert!(h.engine.participants().await.is_empty());
        assert!(h.engine.answers(0).await.is_empty());

        let id = Id::new();
        h.engine.join(id, "bob", None).await.unwrap();
        let participants = h.engine.participants().await;
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].id, id);
        assert_eq!(participants[0].score, 0);
    }

    #[tokio::test]
    async fn failed_reset_keeps_the_live_round() {
        let (engine, _clock, store, id) = flaky().await;
        engine.submit(submission(0, id, 1)).await.unwrap();

        store.break_key(store::PARTICIPANTS);
        let err = engine.reset().await.unwrap_err();
        assert_eq!(err.code(), "storage-unavailable");

        let state = engine.state().await;
        assert_eq!(state.step, Step::Question);
        assert_eq!(state.epoch, 0);
        assert_eq!(engine.answers(0).await.len(), 1);
        assert_eq!(engine.participants().await.len(), 1);
        let again = engine.submit(submission(0, id, 2)).await.unwrap_err();
        assert_eq!(again.code(), "already-answered");

        store.repair();
        let state = engine.reset().await.unwrap();
        assert_eq!(state.step, Step::Lobby);
        assert!(engine.answers(0).await.is_empty());
        assert!(engine.participants().await.is_empty());
        assert!(store.keys(store::ANSWERS_PREFIX).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unpersisted_expiry_broadcasts_no_timer_update() {
        let (engine, clock, store, _) = flaky().await;
        store.break_key(store::QUIZ_STATE);
        clock.advance(20_000);

        let (tunnel, mut receiver) = ChannelTunnel::new(64);
        engine.connect(Role::Viewer, tunnel).await.unwrap();
        receiver.try_recv().unwrap();

        for _ in 0..5 {
            assert_eq!(engine.tick(no_alarm).await, TimerReading::Expired);
        }
        assert_eq!(engine.state().await.step, Step::Question);
        while let Ok(message) = receiver.try_recv() {
            assert!(!matches!(message, PushMessage::TimerUpdate(_)));
        }

        store.repair();
        engine.tick(no_alarm).await;
        assert_eq!(engine.state().await.step, Step::Result);
    }

    #[tokio::test]
    async fn closed_tunnel_is_not_registered() {
        let (h, _) = prepared(1).await;
        let (tunnel, receiver) = ChannelTunnel::new(4);
        drop(receiver);

        assert!(h.engine.connect(Role::Participant, tunnel).await.is_none());
        assert_eq!(h.engine.broadcaster().count(), 0);
    }

    #[tokio::test]
    async fn lobby_request_is_a_reset() {
        let (h, _) = prepared(2).await;
        start_question(&h).await;
        let state = h.engine.transition(Step::Lobby, no_alarm).await.unwrap();
        assert_eq!(state.epoch, 1);
        assert!(h.engine.participants().await.is_empty());
    }

    #[tokio::test]
    async fn join_outside_lobby_is_closed_unless_known() {
        let (h, id) = prepared(2).await;
        h.engine.transition(Step::Waiting, no_alarm).await.unwrap();

        let err = h.engine.join(Id::new(), "carol", None).await.unwrap_err();
        assert_eq!(err.code(), "join-closed");

        let again = h.engine.join(id, "alice", None).await.unwrap();
        assert!(matches!(again, Joined::Existing(_)));
    }

    #[tokio::test]
    async fn questions_are_locked_during_a_round() {
        let (h, _) = prepared(2).await;
        h.engine.transition(Step::Waiting, no_alarm).await.unwrap();
        let err = h
            .engine
            .replace_questions(question_set(3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "questions-locked");
    }

    #[tokio::test]
    async fn transitions_are_announced_then_activated() {
        let (h, _) = prepared(2).await;
        let (tunnel, mut receiver) = ChannelTunnel::new(16);
        h.engine.connect(Role::Viewer, tunnel).await;
        assert!(matches!(
            receiver.try_recv(),
            Ok(PushMessage::StepActivation(_))
        ));

        let mut alarms = Vec::new();
        h.engine
            .transition(Step::Waiting, |m, d| alarms.push((m, d)))
            .await
            .unwrap();
        assert!(matches!(
            receiver.try_recv(),
            Ok(PushMessage::StepTransition(StepTransition {
                from: Step::Lobby,
                to: Step::Waiting,
                ..
            }))
        ));
        assert!(receiver.try_recv().is_err());

        let (alarm, delay) = alarms.pop().unwrap();
        assert_eq!(delay, Duration::from_millis(500));
        assert!(h.engine.receive_alarm(alarm).await);
        let Ok(PushMessage::StepActivation(activation)) = receiver.try_recv() else {
            panic!("expected activation");
        };
        assert_eq!(activation.state.step, Step::Waiting);
    }

    #[tokio::test]
    async fn stale_alarm_is_dropped() {
        let (h, _) = prepared(2).await;
        let mut alarms = Vec::new();
        h.engine
            .transition(Step::Waiting, |m, d| alarms.push((m, d)))
            .await
            .unwrap();
        h.engine.reset().await.unwrap();
        let (alarm, _) = alarms.pop().unwrap();
        assert!(!h.engine.receive_alarm(alarm).await);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let (h, id) = prepared(2).await;
        start_question(&h).await;
        h.engine.submit(submission(0, id, 1)).await.unwrap();
        h.engine.transition(Step::Result, no_alarm).await.unwrap();
        let state = h.engine.state().await;

        let reopened = QuizEngine::open(
            Options::default(),
            h.store.clone(),
            Arc::new(h.clock.clone()),
        )
        .unwrap();
        assert_eq!(reopened.state().await, state);
        assert_eq!(reopened.answers(0).await.len(), 1);
        assert_eq!(reopened.participants().await[0].score, 1);
        assert_eq!(reopened.questions().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_submits_store_one_answer() {
        let (h, id) = prepared(1).await;
        start_question(&h).await;
        let engine = Arc::new(h.engine);

        let handles = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.submit(submission(0, id, 1)).await })
            })
            .collect::<Vec<_>>();

        let mut accepted = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => {
                    assert_eq!(e.code(), "already-answered");
                    duplicates += 1;
                }
            }
        }
        assert_eq!((accepted, duplicates), (1, 7));
        assert_eq!(engine.answers(0).await.len(), 1);
    }
}

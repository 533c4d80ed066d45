//! The client-side reconciliation state machine
//!
//! [`Reconciler::apply`] is pure: it folds one [`StateChange`] into the view
//! and the local session, and returns the [`Effect`]s the I/O layer should
//! perform. Push messages and polled snapshots arrive as the same kind of
//! change, so both paths lead to the same transitions.

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::{ClientConfig, Error, local::LocalSession, view::ClientView};
use crate::{
    PushMessage,
    broadcast::{Role, StepTransition, UserScore},
    ledger::{Answer, Submission},
    participant::Participant,
    question::QuestionSet,
    step::{QuizState, Step},
    timer::TimerUpdate,
};

/// Something the client learned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// A push channel was (re)opened
    Connected,
    /// The push channel was lost
    Disconnected,
    /// A fetched quiz state
    Snapshot(QuizState),
    /// A fetched participant list
    Participants(Vec<Participant>),
    /// A fetched question list
    Questions(QuestionSet),
    /// This participant's stored answer for a question, as fetched
    ServerAnswer {
        /// Question the lookup was for
        question_index: usize,
        /// The stored answer, if there is one
        answer: Option<Answer>,
    },
    /// A message from the push channel
    Push(PushMessage),
    /// The server accepted this client's join
    Registered(Participant),
    /// The user picked an option but has not submitted it
    Selected {
        /// Question shown when the option was picked
        question_index: usize,
        /// Option picked
        answer_index: i32,
    },
    /// The server stored this client's answer
    Submitted(Answer),
    /// The server refused this client's answer
    SubmitRejected {
        /// Question the answer was for
        question_index: usize,
        /// Error code returned by the server
        code: String,
    },
}

/// I/O the reconciler needs done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fetch the quiz state
    RefetchState,
    /// Fetch the participant list
    FetchParticipants,
    /// Fetch the participant list again after a backoff
    RetryParticipants {
        /// Retry number, starting at 1
        attempt: u32,
    },
    /// Look up this participant's answer for a question
    FetchAnswers(usize),
    /// Fetch the question list
    ReloadQuestions,
    /// Send a "no answer" marker for a question that ran out
    AutoSubmit(Submission),
    /// Ask the user to join again
    ForceRegistration,
    /// Write the local session to storage
    PersistSession,
}

fn request(effects: &mut Vec<Effect>, effect: Effect) {
    if !effects.contains(&effect) {
        effects.push(effect);
    }
}

/// Folds authoritative data into a [`ClientView`]
#[derive(Debug, Clone)]
pub struct Reconciler {
    role: Role,
    config: ClientConfig,
    session: LocalSession,
    view: ClientView,
    empty_reads: u32,
    auto_submitted: BTreeSet<usize>,
    refetch_pending: bool,
}

impl Reconciler {
    /// Starts from a restored session
    pub fn new(role: Role, session: LocalSession, config: ClientConfig) -> Self {
        let view = ClientView {
            participant_id: session.participant_id,
            participant_name: session.participant_name.clone(),
            needs_registration: role == Role::Participant && session.participant_id.is_none(),
            ..ClientView::default()
        };
        Self {
            role,
            config,
            session,
            view,
            empty_reads: 0,
            auto_submitted: BTreeSet::new(),
            refetch_pending: false,
        }
    }

    /// What to render
    pub fn view(&self) -> &ClientView {
        &self.view
    }

    /// What to persist
    pub fn session(&self) -> &LocalSession {
        &self.session
    }

    /// The role this client plays
    pub fn role(&self) -> Role {
        self.role
    }

    /// Applies one change and returns the follow-up work
    pub fn apply(&mut self, change: StateChange) -> Vec<Effect> {
        let mut effects = Vec::new();
        match change {
            StateChange::Connected => {
                self.view.connected = true;
                self.view.ready = false;
                self.refetch_pending = false;
                self.refetch(&mut effects);
                if self.session.participant_id.is_some() {
                    request(&mut effects, Effect::FetchParticipants);
                }
            }
            StateChange::Disconnected => self.view.connected = false,
            StateChange::Snapshot(state) => self.adopt_state(state, &mut effects),
            StateChange::Participants(participants) => {
                self.adopt_participants(participants, &mut effects);
            }
            StateChange::Questions(questions) => self.view.questions = Some(questions),
            StateChange::ServerAnswer {
                question_index,
                answer,
            } => {
                let mine = answer.filter(|a| Some(a.participant_id) == self.session.participant_id);
                if let Some(answer) = mine {
                    self.record_answer(question_index, Some(answer.answer_index), &mut effects);
                }
            }
            StateChange::Push(message) => self.receive_push(message, &mut effects),
            StateChange::Registered(participant) => self.register(participant, &mut effects),
            StateChange::Selected {
                question_index,
                answer_index,
            } => {
                if self.view.current_question_index() == Some(question_index) && !self.view.answered
                {
                    self.view.selected_answer_index = Some(answer_index);
                }
            }
            StateChange::Submitted(answer) => {
                if Some(answer.participant_id) == self.session.participant_id {
                    self.record_answer(answer.question_index, Some(answer.answer_index), &mut effects);
                }
            }
            StateChange::SubmitRejected {
                question_index,
                code,
            } => {
                if code == "already-answered" {
                    self.record_answer(question_index, None, &mut effects);
                    request(&mut effects, Effect::FetchAnswers(question_index));
                }
            }
        }
        effects
    }

    fn receive_push(&mut self, message: PushMessage, effects: &mut Vec<Effect>) {
        match message {
            PushMessage::TimerUpdate(update) => self.adopt_timer(update, effects),
            PushMessage::StepTransition(transition) => self.announce(transition, effects),
            PushMessage::StepActivation(activation) => self.adopt_state(activation.state, effects),
            PushMessage::UserScore(score) => self.adopt_score(score),
            PushMessage::QuizReset(reset) => {
                if self.session.epoch == Some(reset.epoch) {
                    return;
                }
                if self.session.epoch.is_some_and(|known| reset.epoch < known) {
                    debug!(epoch = reset.epoch, "stale reset ignored");
                    return;
                }
                self.reset_session(reset.epoch, effects);
                self.refetch(effects);
            }
            PushMessage::QuestionsSync(sync) => {
                if self.view.state.map(|s| s.questions_version) != Some(sync.version) {
                    request(effects, Effect::ReloadQuestions);
                    self.refetch(effects);
                }
            }
        }
    }

    fn refetch(&mut self, effects: &mut Vec<Effect>) {
        if !self.refetch_pending {
            self.refetch_pending = true;
            request(effects, Effect::RefetchState);
        }
    }

    fn admit(&self, state: &QuizState) -> Result<(), Error> {
        match self.session.epoch {
            Some(known) if state.epoch < known => Err(Error::StaleRead {
                got: state.epoch,
                known,
            }),
            _ => Ok(()),
        }
    }

    fn adopt_state(&mut self, state: QuizState, effects: &mut Vec<Effect>) {
        if let Err(e) = self.admit(&state) {
            debug!(error = %e, "snapshot dropped");
            return;
        }
        self.refetch_pending = false;

        match self.session.epoch {
            Some(epoch) if epoch != state.epoch => self.reset_session(state.epoch, effects),
            Some(_) => {}
            None => {
                self.session.epoch = Some(state.epoch);
                request(effects, Effect::PersistSession);
            }
        }

        let previous = self.view.state.replace(state);
        let was_ready = std::mem::replace(&mut self.view.ready, true);
        if was_ready && previous == Some(state) {
            return;
        }

        if self.view.questions.is_none()
            || previous.is_some_and(|p| p.questions_version != state.questions_version)
        {
            request(effects, Effect::ReloadQuestions);
        }
        if self
            .view
            .pending
            .is_some_and(|p| p.to == state.step || p.epoch != state.epoch)
        {
            self.view.pending = None;
        }

        let index = state.current_question_index;
        let same_question = previous.is_some_and(|p| {
            p.current_question_index == index && p.epoch == state.epoch
        });
        if state.step != Step::Question
            || self
                .view
                .timer
                .as_ref()
                .is_some_and(|t| t.question_index != index)
        {
            self.view.timer = None;
        }

        self.view.answered = self.session.has_answered(index);
        self.view.selected_answer_index = match self.session.selected(index) {
            Some(selected) => Some(selected),
            None if same_question && !self.view.answered => self.view.selected_answer_index,
            None => None,
        };

        match state.step {
            Step::Question => {
                if self.view.answered && self.view.selected_answer_index.is_none() {
                    request(effects, Effect::FetchAnswers(index));
                }
            }
            Step::Result => self.auto_submit(index, effects),
            Step::Lobby => {
                if self.role == Role::Participant && self.session.participant_id.is_some() {
                    request(effects, Effect::FetchParticipants);
                }
            }
            Step::Waiting | Step::End => {}
        }
    }

    fn adopt_timer(&mut self, update: TimerUpdate, effects: &mut Vec<Effect>) {
        match self.view.state {
            Some(state)
                if state.step == Step::Question
                    && state.current_question_index == update.question_index
                    && state.question_start_time == update.question_start_time =>
            {
                let expired = !update.active && update.countdown_to_start.is_none();
                let index = update.question_index;
                self.view.timer = Some(update);
                if expired {
                    self.auto_submit(index, effects);
                }
            }
            _ => self.refetch(effects),
        }
    }

    fn announce(&mut self, transition: StepTransition, effects: &mut Vec<Effect>) {
        if self.session.epoch.is_some_and(|known| known != transition.epoch) {
            self.refetch(effects);
            return;
        }
        let already_live = self.view.state.is_some_and(|s| {
            s.step == transition.to && s.current_question_index == transition.question_index
        });
        if already_live {
            return;
        }
        self.view.pending = Some(transition);
        if transition.from == Step::Question && transition.to == Step::Result {
            self.auto_submit(transition.question_index, effects);
        }
    }

    fn adopt_score(&mut self, score: UserScore) {
        if self.session.epoch != Some(score.epoch) {
            return;
        }
        if let Some(participant) = self
            .view
            .participants
            .iter_mut()
            .find(|p| p.id == score.participant_id)
        {
            participant.score = score.score;
        }
        if Some(score.participant_id) == self.session.participant_id {
            self.view.score = Some(score.score);
        }
    }

    fn adopt_participants(&mut self, participants: Vec<Participant>, effects: &mut Vec<Effect>) {
        let me = match (self.role, self.session.participant_id) {
            (Role::Participant, Some(id)) => Some(id),
            _ => None,
        };

        if let Some(id) = me {
            let missing = !participants.iter().any(|p| p.id == id);
            if missing && self.view.step() == Some(Step::Lobby) {
                if participants.is_empty() && self.empty_reads < self.config.empty_read_retries {
                    self.empty_reads += 1;
                    debug!(attempt = self.empty_reads, "empty participant list, retrying");
                    request(
                        effects,
                        Effect::RetryParticipants {
                            attempt: self.empty_reads,
                        },
                    );
                    return;
                }
                let state = self.view.state;
                let epoch = self
                    .session
                    .epoch
                    .or(state.map(|s| s.epoch))
                    .unwrap_or_default();
                self.reset_session(epoch, effects);
                self.view.state = state;
                self.view.ready = state.is_some();
            }
        }

        self.empty_reads = 0;
        if let Some(id) = self.session.participant_id {
            if let Some(participant) = participants.iter().find(|p| p.id == id) {
                self.view.score = Some(participant.score);
            }
        }
        self.view.participants = participants;
    }

    fn register(&mut self, participant: Participant, effects: &mut Vec<Effect>) {
        self.session.participant_id = Some(participant.id);
        self.session.participant_name = Some(participant.name.clone());
        if self.session.epoch.is_none() {
            self.session.epoch = self.view.state.map(|s| s.epoch);
        }
        self.view.participant_id = Some(participant.id);
        self.view.participant_name = Some(participant.name.clone());
        self.view.score = Some(participant.score);
        self.view.needs_registration = false;
        if !self.view.participants.iter().any(|p| p.id == participant.id) {
            self.view.participants.push(participant);
        }
        request(effects, Effect::PersistSession);
    }

    fn record_answer(
        &mut self,
        question_index: usize,
        answer_index: Option<i32>,
        effects: &mut Vec<Effect>,
    ) {
        self.session.record_answer(question_index, answer_index);
        if self.view.current_question_index() == Some(question_index) {
            self.view.answered = true;
            if answer_index.is_some() {
                self.view.selected_answer_index = answer_index;
            }
        }
        request(effects, Effect::PersistSession);
    }

    fn auto_submit(&mut self, question_index: usize, effects: &mut Vec<Effect>) {
        if self.role != Role::Participant
            || self.view.current_question_index() != Some(question_index)
            || self.session.has_answered(question_index)
        {
            return;
        }
        let (Some(participant_id), Some(participant_name)) = (
            self.session.participant_id,
            self.session.participant_name.clone(),
        ) else {
            return;
        };
        if self.auto_submitted.insert(question_index) {
            request(
                effects,
                Effect::AutoSubmit(Submission {
                    question_index,
                    participant_id,
                    participant_name,
                    answer_index: -1,
                }),
            );
        }
    }

    /// Drops everything local and starts over in `epoch`
    fn reset_session(&mut self, epoch: u64, effects: &mut Vec<Effect>) {
        info!(epoch, "server reset detected, clearing local session");
        self.session = LocalSession::fresh(epoch);
        self.view = ClientView {
            questions: self.view.questions.take(),
            connected: self.view.connected,
            needs_registration: self.role == Role::Participant,
            ..ClientView::default()
        };
        self.empty_reads = 0;
        self.auto_submitted.clear();
        request(effects, Effect::PersistSession);
        if self.role == Role::Participant {
            request(effects, Effect::ForceRegistration);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{
        broadcast::{QuizReset, StepActivation},
        participant::Id,
    };

    fn state(step: Step, index: usize, epoch: u64) -> QuizState {
        let mut state = QuizState::new(20);
        state.step = step;
        state.current_question_index = index;
        state.epoch = epoch;
        if step == Step::Question {
            state.question_start_time = Some(10_000);
        }
        state
    }

    fn participant(id: Id) -> Participant {
        Participant {
            id,
            name: "alice".into(),
            score: 0,
            avatar_url: None,
        }
    }

    fn registered(epoch: u64) -> (Reconciler, Id) {
        let id = Id::new();
        let session = LocalSession {
            participant_id: Some(id),
            participant_name: Some("alice".into()),
            ..LocalSession::fresh(epoch)
        };
        (
            Reconciler::new(Role::Participant, session, ClientConfig::default()),
            id,
        )
    }

    fn running(index: usize) -> TimerUpdate {
        TimerUpdate {
            question_index: index,
            question_start_time: Some(10_000),
            time_remaining: 5_000,
            timer_max: 20,
            countdown_to_start: None,
            active: true,
            server_time: 25_000,
        }
    }

    #[test]
    fn replayed_activation_is_noop() {
        let (mut reconciler, _) = registered(0);
        let activation = PushMessage::from(StepActivation {
            state: state(Step::Waiting, 0, 0),
        });
        reconciler.apply(StateChange::Push(activation.clone()));
        let view = reconciler.view().clone();

        assert!(reconciler.apply(StateChange::Push(activation)).is_empty());
        assert_eq!(reconciler.view(), &view);
    }

    #[test]
    fn answered_flag_blocks_and_fetches_selection() {
        let (reconciler, id) = registered(0);
        let mut session = reconciler.session().clone();
        session.record_answer(3, None);
        let mut reconciler = Reconciler::new(Role::Participant, session, ClientConfig::default());

        reconciler.apply(StateChange::Connected);
        let effects = reconciler.apply(StateChange::Snapshot(state(Step::Question, 3, 0)));
        assert!(effects.contains(&Effect::FetchAnswers(3)));

        reconciler.apply(StateChange::Push(running(3).into()));
        assert!(reconciler.view().answered);
        assert!(!reconciler.view().can_submit());

        reconciler.apply(StateChange::ServerAnswer {
            question_index: 3,
            answer: Some(Answer {
                question_index: 3,
                participant_id: id,
                participant_name: "alice".into(),
                answer_index: 2,
                timestamp: 12_000,
            }),
        });
        assert_eq!(reconciler.view().selected_answer_index, Some(2));
        assert_eq!(reconciler.session().selected(3), Some(2));
    }

    #[test]
    fn new_epoch_resets_and_forces_registration() {
        let (mut reconciler, _) = registered(0);
        reconciler.apply(StateChange::Snapshot(state(Step::Question, 1, 0)));

        let effects = reconciler.apply(StateChange::Snapshot(state(Step::Lobby, 0, 1)));
        assert!(effects.contains(&Effect::ForceRegistration));
        assert!(effects.contains(&Effect::PersistSession));
        assert_eq!(reconciler.session(), &LocalSession::fresh(1));
        assert_eq!(reconciler.view().step(), Some(Step::Lobby));
        assert!(reconciler.view().needs_registration);
    }

    #[test]
    fn quiz_reset_push_clears_session() {
        let (mut reconciler, _) = registered(0);
        reconciler.apply(StateChange::Snapshot(state(Step::Result, 0, 0)));

        let effects = reconciler.apply(StateChange::Push(QuizReset { epoch: 1 }.into()));
        assert!(effects.contains(&Effect::ForceRegistration));
        assert!(effects.contains(&Effect::RefetchState));
        assert_eq!(reconciler.session().participant_id, None);

        let again = reconciler.apply(StateChange::Push(QuizReset { epoch: 1 }.into()));
        assert!(again.is_empty());
    }

    #[test]
    fn empty_list_is_retried_before_reset() {
        let (mut reconciler, id) = registered(0);
        reconciler.apply(StateChange::Snapshot(state(Step::Lobby, 0, 0)));
        reconciler.apply(StateChange::Participants(vec![participant(id)]));

        for attempt in 1..=3 {
            let effects = reconciler.apply(StateChange::Participants(Vec::new()));
            assert_eq!(effects, vec![Effect::RetryParticipants { attempt }]);
            assert_eq!(reconciler.session().participant_id, Some(id));
        }

        let effects = reconciler.apply(StateChange::Participants(Vec::new()));
        assert!(effects.contains(&Effect::ForceRegistration));
        assert_eq!(reconciler.session().participant_id, None);
        assert_eq!(reconciler.view().step(), Some(Step::Lobby));
    }

    #[test]
    fn missing_from_full_list_resets_at_once() {
        let (mut reconciler, _) = registered(0);
        reconciler.apply(StateChange::Snapshot(state(Step::Lobby, 0, 0)));

        let effects = reconciler.apply(StateChange::Participants(vec![participant(Id::new())]));
        assert!(effects.contains(&Effect::ForceRegistration));
    }

    #[test]
    fn expiry_auto_submits_once() {
        let (mut reconciler, id) = registered(0);
        reconciler.apply(StateChange::Snapshot(state(Step::Question, 0, 0)));

        let expired = TimerUpdate {
            time_remaining: 0,
            active: false,
            ..running(0)
        };
        let effects = reconciler.apply(StateChange::Push(expired.clone().into()));
        assert_eq!(
            effects,
            vec![Effect::AutoSubmit(Submission {
                question_index: 0,
                participant_id: id,
                participant_name: "alice".into(),
                answer_index: -1,
            })]
        );

        assert!(reconciler.apply(StateChange::Push(expired.into())).is_empty());
        let effects = reconciler.apply(StateChange::Snapshot(state(Step::Result, 0, 0)));
        assert!(!effects.iter().any(|e| matches!(e, Effect::AutoSubmit(_))));
    }

    #[test]
    fn stale_snapshot_is_dropped() {
        let (mut reconciler, _) = registered(2);
        reconciler.apply(StateChange::Snapshot(state(Step::Waiting, 0, 2)));

        assert!(reconciler
            .apply(StateChange::Snapshot(state(Step::End, 0, 1)))
            .is_empty());
        assert_eq!(reconciler.view().step(), Some(Step::Waiting));
    }

    #[test]
    fn only_own_score_is_applied() {
        let (mut reconciler, id) = registered(0);
        reconciler.apply(StateChange::Snapshot(state(Step::Result, 0, 0)));
        reconciler.apply(StateChange::Push(
            UserScore {
                participant_id: Id::new(),
                score: 5,
                question_index: 0,
                epoch: 0,
            }
            .into(),
        ));
        assert_eq!(reconciler.view().score, None);

        reconciler.apply(StateChange::Push(
            UserScore {
                participant_id: id,
                score: 3,
                question_index: 0,
                epoch: 0,
            }
            .into(),
        ));
        assert_eq!(reconciler.view().score, Some(3));
    }

    #[test]
    fn timer_for_unknown_question_refetches() {
        let (mut reconciler, _) = registered(0);
        reconciler.apply(StateChange::Snapshot(state(Step::Waiting, 0, 0)));

        let effects = reconciler.apply(StateChange::Push(running(0).into()));
        assert_eq!(effects, vec![Effect::RefetchState]);
        assert!(reconciler.apply(StateChange::Push(running(0).into())).is_empty());
    }
}

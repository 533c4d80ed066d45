//! Background synchronization of one client
//!
//! [`SyncHandle::start`] spawns three tasks sharing one channel of
//! [`StateChange`]s:
//!
//! * the reconcile task, which owns the [`Reconciler`], publishes the view
//!   and performs the requested [`Effect`]s
//! * the polling task, which fetches the state and participants every
//!   `poll_interval`
//! * the push task, which keeps a push subscription open, reconnecting with
//!   backoff
//!
//! Dropping or shutting down the handle tears all of them down, so a new
//! handle for the same client never races an old one.

use std::sync::Arc;

use futures::StreamExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::debug;

use super::{
    ClientConfig, Error,
    api::QuizApi,
    local::{LocalSession, LocalStorage},
    reconcile::{Effect, Reconciler, StateChange},
    view::ClientView,
};
use crate::{
    broadcast::Role,
    ledger::{Answer, Submission},
    participant::{Id, Participant},
};

const CHANGE_BUFFER: usize = 256;

/// A running client sync
pub struct SyncHandle {
    api: Arc<dyn QuizApi>,
    storage: Arc<dyn LocalStorage>,
    role: Role,
    config: ClientConfig,
    changes: mpsc::Sender<StateChange>,
    view: watch::Receiver<ClientView>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Restores the local session and starts syncing it
    pub fn start(
        api: Arc<dyn QuizApi>,
        storage: Arc<dyn LocalStorage>,
        role: Role,
        config: ClientConfig,
    ) -> Self {
        let session = LocalSession::restore(storage.as_ref());
        let reconciler = Reconciler::new(role, session, config);
        let (view_tx, view) = watch::channel(reconciler.view().clone());
        let (changes, receiver) = mpsc::channel(CHANGE_BUFFER);

        let tasks = vec![
            tokio::spawn(reconcile_task(
                reconciler,
                receiver,
                view_tx,
                Worker {
                    api: Arc::clone(&api),
                    storage: Arc::clone(&storage),
                    changes: changes.clone(),
                    config,
                },
            )),
            tokio::spawn(poll_task(Arc::clone(&api), changes.clone(), config)),
            tokio::spawn(push_task(Arc::clone(&api), changes.clone(), role, config)),
        ];

        Self {
            api,
            storage,
            role,
            config,
            changes,
            view,
            tasks,
        }
    }

    /// The current view
    pub fn view(&self) -> ClientView {
        self.view.borrow().clone()
    }

    /// A receiver notified whenever the view changes
    pub fn watch(&self) -> watch::Receiver<ClientView> {
        self.view.clone()
    }

    /// Feeds a change as if it had arrived from the server
    pub async fn notify(&self, change: StateChange) {
        let _ = self.changes.send(change).await;
    }

    /// Joins the quiz with the stored id, or a new one
    ///
    /// # Errors
    ///
    /// Returns the transport or server error; the user should see it.
    pub async fn join(&self, name: &str, avatar_url: Option<String>) -> Result<Participant, Error> {
        let id = self.view.borrow().participant_id.unwrap_or_else(Id::new);
        let participant = self.api.join(id, name, avatar_url).await?;
        self.notify(StateChange::Registered(participant.clone()))
            .await;
        Ok(participant)
    }

    /// Records a provisional choice for the current question
    pub async fn select(&self, answer_index: i32) {
        let Some(question_index) = self.view.borrow().current_question_index() else {
            return;
        };
        self.notify(StateChange::Selected {
            question_index,
            answer_index,
        })
        .await;
    }

    /// Submits an answer for the current question
    ///
    /// # Errors
    ///
    /// * `Error::SubmissionBlocked` - the answer UI is disabled
    /// * `Error::NotRegistered` - the participant has not joined
    /// * `Error::Server` - the server refused the answer, for example with
    ///   `already-answered`
    pub async fn submit(&self, answer_index: i32) -> Result<Answer, Error> {
        let view = self.view();
        let (Some(participant_id), Some(participant_name)) =
            (view.participant_id, view.participant_name.clone())
        else {
            return Err(Error::NotRegistered);
        };
        let Some(question_index) = view.current_question_index().filter(|_| view.can_submit())
        else {
            return Err(Error::SubmissionBlocked);
        };

        let submission = Submission {
            question_index,
            participant_id,
            participant_name,
            answer_index,
        };
        match self.api.submit(&submission).await {
            Ok(answer) => {
                self.notify(StateChange::Submitted(answer.clone())).await;
                Ok(answer)
            }
            Err(e) => {
                if let Some(code) = e.code() {
                    self.notify(StateChange::SubmitRejected {
                        question_index,
                        code: code.to_owned(),
                    })
                    .await;
                }
                Err(e)
            }
        }
    }

    /// Stops every task of this client
    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }

    /// Tears the current sync down and starts a new one from the stored session
    pub async fn restart(self) -> Self {
        let api = Arc::clone(&self.api);
        let storage = Arc::clone(&self.storage);
        let (role, config) = (self.role, self.config);
        self.shutdown().await;
        Self::start(api, storage, role, config)
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Performs effects, sending their results back as changes
#[derive(Clone)]
struct Worker {
    api: Arc<dyn QuizApi>,
    storage: Arc<dyn LocalStorage>,
    changes: mpsc::Sender<StateChange>,
    config: ClientConfig,
}

impl Worker {
    fn spawn<F>(&self, work: F)
    where
        F: Future<Output = Option<StateChange>> + Send + 'static,
    {
        let changes = self.changes.clone();
        tokio::spawn(async move {
            if let Some(change) = work.await {
                let _ = changes.send(change).await;
            }
        });
    }

    fn perform(&self, effect: Effect, reconciler: &Reconciler) {
        let api = Arc::clone(&self.api);
        match effect {
            Effect::RefetchState => self.spawn(async move {
                ambient(api.state().await).map(StateChange::Snapshot)
            }),
            Effect::FetchParticipants => self.spawn(async move {
                ambient(api.participants().await).map(StateChange::Participants)
            }),
            Effect::RetryParticipants { attempt } => {
                let delay = self.config.backoff(attempt);
                self.spawn(async move {
                    time::sleep(delay).await;
                    ambient(api.participants().await).map(StateChange::Participants)
                });
            }
            Effect::FetchAnswers(question_index) => {
                let me = reconciler.session().participant_id;
                self.spawn(async move {
                    let answers = ambient(api.answers(question_index).await)?;
                    Some(StateChange::ServerAnswer {
                        question_index,
                        answer: answers.into_iter().find(|a| Some(a.participant_id) == me),
                    })
                });
            }
            Effect::ReloadQuestions => self.spawn(async move {
                ambient(api.questions().await).map(StateChange::Questions)
            }),
            Effect::AutoSubmit(submission) => self.spawn(async move {
                let question_index = submission.question_index;
                match api.submit(&submission).await {
                    Ok(answer) => Some(StateChange::Submitted(answer)),
                    Err(e) => {
                        debug!(error = %e, "automatic blank answer refused");
                        e.code().map(|code| StateChange::SubmitRejected {
                            question_index,
                            code: code.to_owned(),
                        })
                    }
                }
            }),
            Effect::PersistSession => {
                if let Err(e) = reconciler.session().save(self.storage.as_ref()) {
                    debug!(error = %e, "local session not saved");
                }
            }
            Effect::ForceRegistration => debug!("registration required"),
        }
    }
}

/// Logs and swallows the error of a background request
fn ambient<T>(result: Result<T, Error>) -> Option<T> {
    result
        .inspect_err(|e| debug!(error = %e, "background sync failed"))
        .ok()
}

async fn reconcile_task(
    mut reconciler: Reconciler,
    mut changes: mpsc::Receiver<StateChange>,
    view: watch::Sender<ClientView>,
    worker: Worker,
) {
    while let Some(change) = changes.recv().await {
        let effects = reconciler.apply(change);
        view.send_if_modified(|current| {
            if current == reconciler.view() {
                false
            } else {
                current.clone_from(reconciler.view());
                true
            }
        });
        for effect in effects {
            worker.perform(effect, &reconciler);
        }
    }
}

async fn poll_task(api: Arc<dyn QuizApi>, changes: mpsc::Sender<StateChange>, config: ClientConfig) {
    let mut interval = time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Some(state) = ambient(api.state().await) {
            if changes.send(StateChange::Snapshot(state)).await.is_err() {
                break;
            }
        }
        if let Some(participants) = ambient(api.participants().await) {
            if changes
                .send(StateChange::Participants(participants))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

async fn push_task(
    api: Arc<dyn QuizApi>,
    changes: mpsc::Sender<StateChange>,
    role: Role,
    config: ClientConfig,
) {
    let mut attempt = 0;
    loop {
        match api.subscribe(role).await {
            Ok(mut messages) => {
                attempt = 0;
                if changes.send(StateChange::Connected).await.is_err() {
                    break;
                }
                while let Some(message) = messages.next().await {
                    if changes.send(StateChange::Push(message)).await.is_err() {
                        return;
                    }
                }
                if changes.send(StateChange::Disconnected).await.is_err() {
                    break;
                }
            }
            Err(e) => debug!(error = %e, "push channel unavailable"),
        }
        attempt += 1;
        time::sleep(config.backoff(attempt)).await;
    }
}

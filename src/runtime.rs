//! Background tasks driving the engine
//!
//! The timer authority ticks the engine at a fixed period, and alarms
//! requested by the engine are delivered back to it after their delay.

use std::{mem::discriminant, sync::Arc, time::Duration};

use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::engine::{AlarmMessage, QuizEngine};

/// Builds the `schedule_message` callback the engine's operations take
///
/// Every alarm is delivered on its own task after its delay.
pub fn scheduler(engine: &Arc<QuizEngine>) -> impl FnMut(AlarmMessage, Duration) + Send + 'static {
    let engine = Arc::clone(engine);
    move |message, delay| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            time::sleep(delay).await;
            engine.receive_alarm(message).await;
        });
    }
}

/// A running timer authority
pub struct TimerTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TimerTask {
    /// Starts ticking `engine` every `period`
    pub fn spawn(engine: Arc<QuizEngine>, period: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = None;

            info!(period_ms = period.as_millis() as u64, "timer authority started");
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = interval.tick() => {
                        let reading = engine.tick(scheduler(&engine)).await;
                        let phase = discriminant(&reading);
                        if last != Some(phase) {
                            debug!(?reading, "timer phase changed");
                            last = Some(phase);
                        }
                    }
                }
            }
            info!("timer authority stopped");
        });
        Self { stop, handle }
    }

    /// Stops the task and waits for the current tick to finish
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{
        PushMessage,
        broadcast::Role,
        clock::ManualClock,
        engine::Options,
        participant::Id,
        question::tests::question_set,
        session::ChannelTunnel,
        step::Step,
        store::MemoryStore,
    };

    #[tokio::test(start_paused = true)]
    async fn alarms_are_delivered_after_their_delay() {
        let engine = Arc::new(
            QuizEngine::open(
                Options::default(),
                Arc::new(MemoryStore::default()),
                Arc::new(ManualClock::new(0)),
            )
            .unwrap(),
        );
        let (tunnel, mut receiver) = ChannelTunnel::new(16);
        engine.connect(Role::Driver, tunnel).await;
        receiver.recv().await.unwrap();

        engine
            .transition(Step::Waiting, scheduler(&engine))
            .await
            .unwrap();
        assert!(matches!(
            receiver.recv().await,
            Some(PushMessage::StepTransition(_))
        ));

        time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(
            receiver.recv().await,
            Some(PushMessage::StepActivation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_task_expires_question_without_clients() {
        let clock = ManualClock::new(0);
        let engine = Arc::new(
            QuizEngine::open(
                Options::default(),
                Arc::new(MemoryStore::default()),
                Arc::new(clock.clone()),
            )
            .unwrap(),
        );
        engine.replace_questions(question_set(1)).await.unwrap();
        engine.join(Id::new(), "alice", None).await.unwrap();
        engine
            .transition(Step::Waiting, scheduler(&engine))
            .await
            .unwrap();
        engine
            .transition(Step::Question, scheduler(&engine))
            .await
            .unwrap();

        let timer = TimerTask::spawn(Arc::clone(&engine), Duration::from_millis(100));
        clock.advance(25_000);
        time::sleep(Duration::from_millis(300)).await;
        timer.stop().await;

        assert_eq!(engine.state().await.step, Step::Result);
    }
}

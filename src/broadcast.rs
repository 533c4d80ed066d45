//! The Broadcast Channel
//!
//! Keeps every connected push client, grouped by role, and fans messages out
//! to them. Delivery is fire-and-forget: a tunnel that reports an error is
//! pruned on the spot instead of slowing down the caller, which is usually
//! the timer tick loop.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use enum_map::{Enum, EnumMap};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    PushMessage,
    clock::EpochMillis,
    participant::Id,
    session::Tunnel,
    step::{QuizState, Step},
};

/// The `step-transition` message: a step change is coming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTransition {
    /// Step being left
    pub from: Step,
    /// Step being entered
    pub to: Step,
    /// Question index of the new state
    pub question_index: usize,
    /// When clients should expect the matching `step-activation`
    pub activates_at: EpochMillis,
    /// Reset epoch the transition belongs to
    pub epoch: u64,
}

/// The `step-activation` message: the step is live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepActivation {
    /// The authoritative state at activation time
    pub state: QuizState,
}

/// The `user-score` message, sent per participant after a reveal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserScore {
    /// Participant the score belongs to
    pub participant_id: Id,
    /// Absolute total score
    pub score: u64,
    /// Question whose reveal produced the score
    pub question_index: usize,
    /// Reset epoch the score belongs to
    pub epoch: u64,
}

/// The `quiz-reset` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizReset {
    /// Epoch after the reset
    pub epoch: u64,
}

/// The `questions-sync` message: the question list was replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionsSync {
    /// New question list version
    pub version: u64,
    /// Number of questions in the new list
    pub count: usize,
}

/// What a push connection is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The presentation screen
    Driver,
    /// A player
    Participant,
    /// Anything else, such as a projector mirror
    Viewer,
}

/// Handle of one push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

struct Connections<T> {
    mapping: HashMap<ConnectionId, (Role, T)>,
    reverse_mapping: EnumMap<Role, HashSet<ConnectionId>>,
}

impl<T> Default for Connections<T> {
    fn default() -> Self {
        Self {
            mapping: HashMap::new(),
            reverse_mapping: EnumMap::default(),
        }
    }
}

impl<T: Tunnel> Connections<T> {
    fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let (role, tunnel) = self.mapping.remove(&id)?;
        self.reverse_mapping[role].remove(&id);
        Some(tunnel)
    }

    fn deliver<'a, I>(&mut self, targets: I, message: &PushMessage) -> usize
    where
        I: Iterator<Item = &'a ConnectionId>,
    {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in targets {
            let Some((role, tunnel)) = self.mapping.get(id) else {
                continue;
            };
            match tunnel.send_message(message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection = id.0, ?role, error = %e, "pruning push client");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            if let Some(tunnel) = self.remove(id) {
                tunnel.close();
            }
        }
        delivered
    }
}

/// Registry of push clients
pub struct Broadcaster<T> {
    connections: Mutex<Connections<T>>,
    next_id: AtomicU64,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self {
            connections: Mutex::new(Connections::default()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Tunnel> Broadcaster<T> {
    /// Registers a tunnel and returns the handle needed to remove it
    pub fn connect(&self, role: Role, tunnel: T) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut connections) = self.connections.lock() {
            connections.mapping.insert(id, (role, tunnel));
            connections.reverse_mapping[role].insert(id);
        }
        debug!(connection = id.0, ?role, "push client connected");
        id
    }

    /// Removes and closes a tunnel
    pub fn disconnect(&self, id: ConnectionId) {
        let tunnel = self
            .connections
            .lock()
            .ok()
            .and_then(|mut connections| connections.remove(id));
        if let Some(tunnel) = tunnel {
            tunnel.close();
            debug!(connection = id.0, "push client disconnected");
        }
    }

    /// Sends a message to every connection
    ///
    /// # Returns
    ///
    /// The number of tunnels that accepted the message.
    pub fn announce(&self, message: &PushMessage) -> usize {
        let Ok(mut connections) = self.connections.lock() else {
            return 0;
        };
        let targets = connections.mapping.keys().copied().collect_vec();
        connections.deliver(targets.iter(), message)
    }

    /// Number of live connections with `role`
    pub fn specific_count(&self, role: Role) -> usize {
        self.connections
            .lock()
            .map_or(0, |connections| connections.reverse_mapping[role].len())
    }

    /// Number of live connections
    pub fn count(&self) -> usize {
        self.connections
            .lock()
            .map_or(0, |connections| connections.mapping.len())
    }
}

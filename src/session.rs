//! Client connection tunnels
//!
//! This module defines the trait the Broadcast Channel uses to reach one
//! connected client. A tunnel must never block: a client that cannot take a
//! message right now is reported as gone and pruned.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::PushMessage;

/// A tunnel that can no longer deliver messages
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelError {
    /// The client stopped reading
    #[error("client disconnected")]
    Closed,
    /// The client's buffer is full
    #[error("client is too slow")]
    Lagging,
}

/// Trait for sending messages through a communication tunnel
///
/// Implementations might use WebSockets, Server-Sent Events, or anything
/// else that can carry the JSON form of a [`PushMessage`].
pub trait Tunnel: Send {
    /// Queues a message for the client without waiting
    ///
    /// # Errors
    ///
    /// Returns a [`TunnelError`] when the client should be dropped.
    fn send_message(&self, message: &PushMessage) -> Result<(), TunnelError>;

    /// Closes the communication tunnel
    fn close(self);
}

/// A tunnel backed by a bounded channel drained by the connection task
#[derive(Debug, Clone)]
pub struct ChannelTunnel {
    sender: mpsc::Sender<PushMessage>,
}

impl ChannelTunnel {
    /// Creates a tunnel and the receiver the connection task should drain
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PushMessage>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self { sender }, receiver)
    }
}

impl Tunnel for ChannelTunnel {
    fn send_message(&self, message: &PushMessage) -> Result<(), TunnelError> {
        self.sender
            .try_send(message.clone())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TunnelError::Lagging,
                mpsc::error::TrySendError::Closed(_) => TunnelError::Closed,
            })
    }

    fn close(self) {
        drop(self.sender);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::broadcast::QuizReset;

    #[test]
    fn full_buffer_reports_lagging() {
        let (tunnel, _receiver) = ChannelTunnel::new(1);
        let message = PushMessage::from(QuizReset { epoch: 1 });
        assert_eq!(tunnel.send_message(&message), Ok(()));
        assert_eq!(tunnel.send_message(&message), Err(TunnelError::Lagging));
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let (tunnel, receiver) = ChannelTunnel::new(4);
        drop(receiver);
        let message = PushMessage::from(QuizReset { epoch: 1 });
        assert_eq!(tunnel.send_message(&message), Err(TunnelError::Closed));
    }
}

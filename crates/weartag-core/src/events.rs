//! Connection and state event streams.
//!
//! Two views of a tag's lifecycle are offered:
//!
//! - [`ConnectionEvents`], returned by [`Tag::connect`](crate::Tag::connect),
//!   carries the usable [`Session`] of every `Connected` transition.
//! - [`StateDispatcher`] broadcasts every [`TagState`] to any number of
//!   observers.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use weartag_types::DisconnectReason;

use crate::session::{Session, TagState};

/// Lifecycle event of one connection request.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection attempt started.
    Connecting,
    /// The link is up; the session is valid until the next event.
    Connected(Session),
    /// The link went down or the attempt failed.
    Disconnected(DisconnectReason),
}

impl ConnectionEvent {
    /// Session carried by a `Connected` event.
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Connected(session) => Some(session),
            _ => None,
        }
    }
}

/// Events of one connection request.
///
/// The stream ends once the tag reaches a terminal `Disconnected` state.
/// Dropping it does not disconnect; call [`cancel`](Self::cancel) or
/// [`Tag::disconnect`](crate::Tag::disconnect).
#[derive(Debug)]
pub struct ConnectionEvents {
    receiver: mpsc::UnboundedReceiver<ConnectionEvent>,
    cancel: CancellationToken,
}

impl ConnectionEvents {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { receiver, cancel }
    }

    /// Abandon the connection, whether pending or established.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.receiver.recv().await
    }
}

impl Stream for ConnectionEvents {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Receiver for state transitions.
pub type StateReceiver = broadcast::Receiver<TagState>;

/// Broadcasts state transitions to many observers.
#[derive(Debug, Clone)]
pub struct StateDispatcher {
    sender: broadcast::Sender<TagState>,
}

impl StateDispatcher {
    /// Create a dispatcher buffering up to `capacity` transitions per
    /// observer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Observe transitions from now on.
    pub fn subscribe(&self) -> StateReceiver {
        self.sender.subscribe()
    }

    pub(crate) fn send(&self, state: TagState) {
        // No observers is fine.
        let _ = self.sender.send(state);
    }

    /// Number of live observers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StateDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weartag_types::TagIdentity;

    #[tokio::test]
    async fn test_dispatcher_fan_out() {
        let dispatcher = StateDispatcher::new(4);
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        let identity = TagIdentity::new("AA:01", "Tag").unwrap();
        dispatcher.send(TagState::Connecting {
            identity: identity.clone(),
        });

        assert!(matches!(a.recv().await.unwrap(), TagState::Connecting { .. }));
        assert!(matches!(b.recv().await.unwrap(), TagState::Connecting { .. }));
    }

    #[test]
    fn test_send_without_observers() {
        StateDispatcher::default().send(TagState::Connecting {
            identity: TagIdentity::new("AA:01", "").unwrap(),
        });
    }

    #[tokio::test]
    async fn test_connection_events_cancel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let mut events = ConnectionEvents::new(rx, token.clone());

        tx.send(ConnectionEvent::Connecting).unwrap();
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Connecting)));

        events.cancel();
        assert!(token.is_cancelled());
        drop(tx);
        assert!(events.recv().await.is_none());
    }
}

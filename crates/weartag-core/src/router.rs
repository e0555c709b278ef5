//! Notification fan-out.
//!
//! Unsolicited frames are delivered by kind to every active subscriber of
//! the live session. Each subscriber owns a bounded queue; the driver only
//! ever uses `try_send`, so a slow subscriber can cost notifications but
//! never stalls frame processing.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use prost::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use weartag_types::KindId;

use crate::codec::Frame;
use crate::config::OverflowPolicy;
use crate::error::CommandError;
use crate::util::lock;

/// An unsolicited message from the tag.
///
/// Cloning is cheap: every subscriber of a kind shares one payload buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: KindId,
    pub payload: Bytes,
}

impl Notification {
    /// Decode the payload as `M`.
    pub fn decode<M: Message + Default>(&self) -> Result<M, prost::DecodeError> {
        M::decode(self.payload.clone())
    }
}

impl From<Frame> for Notification {
    fn from(frame: Frame) -> Self {
        Self {
            kind: frame.kind,
            payload: frame.payload,
        }
    }
}

/// Identifies one subscription; see [`Session::unsubscribe`](crate::Session::unsubscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    kind: KindId,
    generation: u64,
}

impl SubscriptionHandle {
    /// Kind this subscription receives.
    pub fn kind(&self) -> KindId {
        self.kind
    }

    /// Session generation the subscription was taken on.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot {
    id: u64,
    sender: mpsc::Sender<Notification>,
    active: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct Inner {
    live_generation: Option<u64>,
    next_id: u64,
    slots: HashMap<KindId, Vec<Slot>>,
}

/// Result of dispatching one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Dispatch {
    pub delivered: usize,
    pub overflowed: usize,
    /// No subscriber for the kind, or the generation is not live.
    pub unrouted: bool,
}

/// Subscriber table of one tag.
#[derive(Debug)]
pub(crate) struct Router {
    inner: Mutex<Inner>,
    buffer: usize,
    overflow: OverflowPolicy,
}

impl Router {
    pub(crate) fn new(buffer: usize, overflow: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            buffer: buffer.max(1),
            overflow,
        }
    }

    pub(crate) fn activate(&self, generation: u64) {
        lock(&self.inner).live_generation = Some(generation);
    }

    /// Add a subscriber for `kind` on the live generation.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        generation: u64,
        kind: KindId,
    ) -> Result<Subscription, CommandError> {
        let mut inner = lock(&self.inner);
        if inner.live_generation != Some(generation) {
            return Err(CommandError::SessionInvalidated);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let (sender, receiver) = mpsc::channel(self.buffer);
        let active = Arc::new(AtomicBool::new(true));
        inner.slots.entry(kind).or_default().push(Slot {
            id,
            sender,
            active: Arc::clone(&active),
        });
        debug!(%kind, id, "Subscribed");

        Ok(Subscription {
            handle: SubscriptionHandle {
                id,
                kind,
                generation,
            },
            receiver,
            active,
            router: Arc::downgrade(self),
        })
    }

    /// Deliver a notification to every active subscriber of its kind.
    pub(crate) fn dispatch(&self, generation: u64, notification: Notification) -> Dispatch {
        let mut inner = lock(&self.inner);
        if inner.live_generation != Some(generation) {
            return Dispatch {
                unrouted: true,
                ..Dispatch::default()
            };
        }
        let Some(slots) = inner.slots.get_mut(&notification.kind) else {
            return Dispatch {
                unrouted: true,
                ..Dispatch::default()
            };
        };

        let mut outcome = Dispatch::default();
        let overflow = self.overflow;
        slots.retain(|slot| {
            if !slot.active.load(Ordering::Acquire) {
                return false;
            }
            match slot.sender.try_send(notification.clone()) {
                Ok(()) => {
                    outcome.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    outcome.overflowed += 1;
                    match overflow {
                        OverflowPolicy::DropNewest => {
                            warn!(kind = %notification.kind, id = slot.id, "Subscriber queue full, notification dropped");
                            true
                        }
                        OverflowPolicy::Unsubscribe => {
                            warn!(kind = %notification.kind, id = slot.id, "Subscriber queue full, unsubscribing");
                            slot.active.store(false, Ordering::Release);
                            false
                        }
                    }
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        if slots.is_empty() {
            inner.slots.remove(&notification.kind);
        }

        outcome.unrouted = outcome.delivered == 0 && outcome.overflowed == 0;
        outcome
    }

    /// Remove one subscriber. Returns whether it was still registered.
    pub(crate) fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut inner = lock(&self.inner);
        if inner.live_generation != Some(handle.generation) {
            return false;
        }
        let Some(slots) = inner.slots.get_mut(&handle.kind) else {
            return false;
        };
        let Some(index) = slots.iter().position(|slot| slot.id == handle.id) else {
            return false;
        };
        let slot = slots.swap_remove(index);
        slot.active.store(false, Ordering::Release);
        if slots.is_empty() {
            inner.slots.remove(&handle.kind);
        }
        debug!(kind = %handle.kind, id = handle.id, "Unsubscribed");
        true
    }

    /// Terminate every subscription of `generation`.
    pub(crate) fn invalidate(&self, generation: u64) -> usize {
        let mut inner = lock(&self.inner);
        if inner.live_generation != Some(generation) {
            return 0;
        }
        inner.live_generation = None;
        let mut count = 0;
        for (_, slots) in inner.slots.drain() {
            for slot in slots {
                slot.active.store(false, Ordering::Release);
                count += 1;
            }
        }
        count
    }

    /// Number of registered subscribers across all kinds.
    pub(crate) fn subscriber_count(&self) -> usize {
        lock(&self.inner).slots.values().map(Vec::len).sum()
    }
}

/// Stream of notifications of one kind.
///
/// Ends (without error) when unsubscribed or when its session is
/// invalidated; nothing still queued is yielded after that. Dropping the
/// stream unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    receiver: mpsc::Receiver<Notification>,
    active: Arc<AtomicBool>,
    router: Weak<Router>,
}

impl Subscription {
    /// Handle for unsubscribing from elsewhere.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Whether the subscription still receives notifications.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop receiving. The stream ends immediately.
    pub fn unsubscribe(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(self.handle);
        }
        self.active.store(false, Ordering::Release);
        self.receiver.close();
    }
}

impl Stream for Subscription {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.is_active() {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(_)) if !self.is_active() => Poll::Ready(None),
            other => other,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.is_active()
            && let Some(router) = self.router.upgrade()
        {
            router.unsubscribe(self.handle);
        }
    }
}

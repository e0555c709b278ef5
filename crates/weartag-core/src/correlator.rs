//! Command/response correlation.
//!
//! Every outgoing command gets a fresh token and a pending entry holding a
//! oneshot sink. The session driver feeds token-bearing frames into
//! [`Correlator::resolve`]; the caller awaits a [`PendingResponse`].
//!
//! The correlator only accepts work for the live session generation. The
//! generation check and the insertion happen under the same lock as
//! [`Correlator::invalidate`], so a command can never register against a
//! session that has already been torn down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use weartag_types::KindId;

use crate::codec::Frame;
use crate::error::CommandError;
use crate::util::lock;

type Reply = Result<Frame, CommandError>;

/// Decides whether a response payload confirms that the tag will reboot.
pub(crate) type RebootCheck = fn(&[u8]) -> bool;

/// One outstanding command.
#[derive(Debug)]
struct PendingCommand {
    generation: u64,
    request_kind: KindId,
    expected_kind: KindId,
    deadline: Instant,
    reboot_check: Option<RebootCheck>,
    sink: oneshot::Sender<Reply>,
}

#[derive(Debug, Default)]
struct Inner {
    live_generation: Option<u64>,
    next_token: u32,
    pending: HashMap<u32, PendingCommand>,
}

/// Outcome of feeding a token-bearing frame to the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Delivered to its caller. `announces_reboot` is set when the frame
    /// accepted a reboot-inducing command.
    Matched { announces_reboot: bool },
    /// No pending entry (timed out, cancelled, or never issued).
    Late,
    /// The frame belongs to a generation that is no longer live.
    Stale,
}

/// Pending-command table of one tag.
#[derive(Debug, Default)]
pub(crate) struct Correlator {
    inner: Mutex<Inner>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start accepting commands for `generation`.
    pub(crate) fn activate(&self, generation: u64) {
        let mut inner = lock(&self.inner);
        inner.live_generation = Some(generation);
    }

    /// Register a command and allocate its token.
    pub(crate) fn register(
        self: &Arc<Self>,
        generation: u64,
        request_kind: KindId,
        expected_kind: KindId,
        timeout: Duration,
        reboot_check: Option<RebootCheck>,
    ) -> Result<PendingResponse, CommandError> {
        let (sink, receiver) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        let mut inner = lock(&self.inner);
        if inner.live_generation != Some(generation) {
            return Err(CommandError::SessionInvalidated);
        }

        let mut token = inner.next_token;
        while inner.pending.contains_key(&token) {
            token = token.wrapping_add(1);
        }
        inner.next_token = token.wrapping_add(1);
        inner.pending.insert(
            token,
            PendingCommand {
                generation,
                request_kind,
                expected_kind,
                deadline,
                reboot_check,
                sink,
            },
        );
        drop(inner);

        Ok(PendingResponse {
            token,
            request_kind,
            timeout,
            deadline,
            receiver,
            correlator: Arc::clone(self),
            finished: false,
        })
    }

    /// Route a response frame to its pending command.
    pub(crate) fn resolve(&self, generation: u64, frame: Frame) -> Resolution {
        let Some(token) = frame.correlation_token else {
            return Resolution::Late;
        };

        let mut inner = lock(&self.inner);
        if inner.live_generation != Some(generation) {
            return Resolution::Stale;
        }
        let Some(pending) = inner.pending.remove(&token) else {
            return Resolution::Late;
        };
        drop(inner);

        debug_assert_eq!(pending.generation, generation);

        if Instant::now() > pending.deadline {
            let _ = pending.sink.send(Err(CommandError::timeout(
                pending.request_kind,
                Duration::ZERO,
            )));
            return Resolution::Late;
        }

        if frame.kind != pending.expected_kind {
            let _ = pending.sink.send(Err(CommandError::UnexpectedResponse {
                expected: pending.expected_kind,
                actual: frame.kind,
            }));
            return Resolution::Matched {
                announces_reboot: false,
            };
        }

        let announces_reboot = pending
            .reboot_check
            .is_some_and(|accepted| accepted(&frame.payload));
        let _ = pending.sink.send(Ok(frame));
        Resolution::Matched { announces_reboot }
    }

    /// Forget a pending command. Returns whether it was still pending.
    pub(crate) fn cancel(&self, token: u32) -> bool {
        lock(&self.inner).pending.remove(&token).is_some()
    }

    /// Stop accepting work for `generation` and fail everything pending.
    ///
    /// Returns the number of commands that were failed.
    pub(crate) fn invalidate(&self, generation: u64) -> usize {
        let drained: Vec<PendingCommand> = {
            let mut inner = lock(&self.inner);
            if inner.live_generation != Some(generation) {
                return 0;
            }
            inner.live_generation = None;
            inner.pending.drain().map(|(_, pending)| pending).collect()
        };

        let count = drained.len();
        for pending in drained {
            let _ = pending.sink.send(Err(CommandError::SessionInvalidated));
        }
        count
    }

    /// Number of commands awaiting a response.
    pub(crate) fn outstanding(&self) -> usize {
        lock(&self.inner).pending.len()
    }
}

/// Future side of a registered command.
///
/// Dropping it before completion removes the pending entry, so a response
/// arriving afterwards is treated as late.
#[derive(Debug)]
pub(crate) struct PendingResponse {
    token: u32,
    request_kind: KindId,
    timeout: Duration,
    deadline: Instant,
    receiver: oneshot::Receiver<Reply>,
    correlator: Arc<Correlator>,
    finished: bool,
}

impl PendingResponse {
    pub(crate) fn token(&self) -> u32 {
        self.token
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response or the deadline.
    pub(crate) async fn wait(mut self) -> Reply {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.receiver).await;
        self.finished = true;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CommandError::SessionInvalidated),
            Err(_) if self.correlator.cancel(self.token) => {
                Err(CommandError::timeout(self.request_kind, Duration::ZERO))
            }
            // Resolved in the same instant the timer fired.
            Err(_) => self.receiver.try_recv().unwrap_or(Err(CommandError::timeout(
                self.request_kind,
                Duration::ZERO,
            ))),
        };
        match reply {
            Err(CommandError::Timeout { kind, .. }) => {
                Err(CommandError::timeout(kind, self.timeout))
            }
            other => other,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            self.correlator.cancel(self.token);
        }
    }
}

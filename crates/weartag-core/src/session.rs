//! Tag lifecycle states and the connected-session capability.
//!
//! A tag moves through
//!
//! ```text
//! Advertised / PreConnected ──► Connecting ──► Connected ──► Disconnected
//!                                   ▲                             │
//!                                   └──────── (reconnect) ────────┘
//! ```
//!
//! Every entry into `Connected` mints a new generation and a
//! [`SessionHandle`]. Leaving `Connected` cancels that handle, fails every
//! pending command and ends every subscription, all inside the same
//! critical section as the state change. A [`Session`] is only obtainable
//! from a `Connected` transition and is useless once its handle is
//! cancelled; nothing of it is carried into the next generation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, trace, warn};

use weartag_types::{DisconnectReason, KindId, TagIdentity};

use crate::codec::{Frame, FrameCodec};
use crate::commands::{self, TagCommand};
use crate::config::{EngineConfig, ReconnectPolicy};
use crate::correlator::{Correlator, RebootCheck, Resolution};
use crate::error::{CommandError, DecodeError};
use crate::events::{StateDispatcher, StateReceiver};
use crate::metrics::SessionMetrics;
use crate::protocol::{
    BatteryRequest, BatteryStatus, DeviceInfo, DeviceInfoRequest, KindRegistry, RebootRequest,
    RenameRequest,
};
use crate::registry::TagRegistry;
use crate::router::{Router, Subscription, SubscriptionHandle};
use crate::transport::Transport;
use crate::util::lock;

/// Lifecycle state of one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagState {
    /// Seen advertising, never paired. The pairing code is shown to the user.
    Advertised {
        identity: TagIdentity,
        pairing_code: String,
    },
    /// Known from an earlier session.
    PreConnected { identity: TagIdentity },
    /// A connection attempt is in flight. Has no timeout.
    Connecting { identity: TagIdentity },
    /// Link up; `session` is valid until the next transition.
    Connected {
        identity: TagIdentity,
        session: SessionHandle,
    },
    /// Link down.
    Disconnected {
        identity: TagIdentity,
        reason: DisconnectReason,
    },
}

impl TagState {
    /// Starting state for a tag: `Advertised` when it carries a pairing
    /// code, `PreConnected` otherwise.
    pub fn initial(identity: TagIdentity) -> Self {
        match identity.pairing_code() {
            Some(code) => Self::Advertised {
                pairing_code: code.to_string(),
                identity,
            },
            None => Self::PreConnected { identity },
        }
    }

    /// Identity carried by every state.
    pub fn identity(&self) -> &TagIdentity {
        match self {
            Self::Advertised { identity, .. }
            | Self::PreConnected { identity }
            | Self::Connecting { identity }
            | Self::Connected { identity, .. }
            | Self::Disconnected { identity, .. } => identity,
        }
    }

    fn identity_mut(&mut self) -> &mut TagIdentity {
        match self {
            Self::Advertised { identity, .. }
            | Self::PreConnected { identity }
            | Self::Connecting { identity }
            | Self::Connected { identity, .. }
            | Self::Disconnected { identity, .. } => identity,
        }
    }

    /// Handle of the live session, only in `Connected`.
    pub fn session(&self) -> Option<&SessionHandle> {
        match self {
            Self::Connected { session, .. } => Some(session),
            _ => None,
        }
    }

    /// Disconnect reason, only in `Disconnected`.
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        match self {
            Self::Disconnected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Advertised { .. } => "advertised",
            Self::PreConnected { .. } => "pre_connected",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

impl fmt::Display for TagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { session, .. } => {
                write!(f, "connected (generation {})", session.generation())
            }
            Self::Disconnected { reason, .. } => write!(f, "disconnected ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Token for one connected generation.
///
/// Equality is by generation. The handle becomes invalid the instant its
/// tag leaves `Connected`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    generation: u64,
    closed: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            generation,
            closed: CancellationToken::new(),
        }
    }

    /// Generation number, increasing per tag.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the session is still the live one.
    pub fn is_valid(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Resolves once the session is invalidated.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

impl Eq for SessionHandle {}

/// Mutable lifecycle, guarded by one lock.
#[derive(Debug)]
struct Lifecycle {
    state: TagState,
    /// A driver task owns the link. Cleared together with the terminal
    /// transition, so a new `connect` never races a finishing driver.
    driver_running: bool,
    /// How the most recent generation ended.
    last_ending: Option<(u64, DisconnectReason)>,
}

/// State shared between a tag, its driver task and its sessions.
pub(crate) struct TagShared {
    identifier: String,
    lifecycle: Mutex<Lifecycle>,
    states: StateDispatcher,
    pub(crate) codec: FrameCodec,
    correlator: Arc<Correlator>,
    router: Arc<Router>,
    pub(crate) transport: Arc<dyn Transport>,
    /// Serializes writes of one tag.
    write_lock: tokio::sync::Mutex<()>,
    /// Held by a driver for as long as it owns the link.
    pub(crate) link_lock: tokio::sync::Mutex<()>,
    registry: Option<Arc<dyn TagRegistry>>,
    pub(crate) metrics: Arc<SessionMetrics>,
    pub(crate) reconnect: ReconnectPolicy,
    generations: AtomicU64,
    reboot_expected: AtomicBool,
}

impl fmt::Debug for TagShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagShared")
            .field("identifier", &self.identifier)
            .field("state", &lock(&self.lifecycle).state.name())
            .finish_non_exhaustive()
    }
}

impl TagShared {
    pub(crate) fn new(
        identity: TagIdentity,
        transport: Arc<dyn Transport>,
        registry: Option<Arc<dyn TagRegistry>>,
        kinds: Arc<KindRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            identifier: identity.identifier().to_string(),
            lifecycle: Mutex::new(Lifecycle {
                state: TagState::initial(identity),
                driver_running: false,
                last_ending: None,
            }),
            states: StateDispatcher::new(config.state_event_capacity),
            codec: FrameCodec::new(kinds, config.max_frame_len),
            correlator: Arc::new(Correlator::new()),
            router: Arc::new(Router::new(config.notification_buffer, config.overflow)),
            transport,
            write_lock: tokio::sync::Mutex::new(()),
            link_lock: tokio::sync::Mutex::new(()),
            registry,
            metrics: Arc::new(SessionMetrics::new()),
            reconnect: config.reconnect.clone(),
            generations: AtomicU64::new(0),
            reboot_expected: AtomicBool::new(false),
        }
    }

    pub(crate) fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn state(&self) -> TagState {
        lock(&self.lifecycle).state.clone()
    }

    pub(crate) fn identity(&self) -> TagIdentity {
        lock(&self.lifecycle).state.identity().clone()
    }

    pub(crate) fn subscribe_states(&self) -> StateReceiver {
        self.states.subscribe()
    }

    pub(crate) fn outstanding_commands(&self) -> usize {
        self.correlator.outstanding()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.router.subscriber_count()
    }

    fn set_state(&self, lifecycle: &mut Lifecycle, next: TagState) {
        info!(
            tag = %self.identifier,
            from = lifecycle.state.name(),
            to = next.name(),
            "State changed"
        );
        lifecycle.state = next.clone();
        self.states.send(next);
    }

    /// Claim the tag for a new driver and enter `Connecting`.
    ///
    /// Fails if another driver is still running.
    pub(crate) fn claim_driver(&self) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.driver_running {
            return false;
        }
        lifecycle.driver_running = true;
        let identity = lifecycle.state.identity().clone();
        self.set_state(&mut lifecycle, TagState::Connecting { identity });
        true
    }

    /// Re-enter `Connecting` for an automatic reconnect, unless the driver
    /// was cancelled meanwhile.
    pub(crate) fn begin_reconnect(&self, cancel: &CancellationToken) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        if cancel.is_cancelled() {
            lifecycle.driver_running = false;
            let identity = lifecycle.state.identity().clone();
            self.set_state(
                &mut lifecycle,
                TagState::Disconnected {
                    identity,
                    reason: DisconnectReason::UserRequested,
                },
            );
            return false;
        }
        let identity = lifecycle.state.identity().clone();
        self.set_state(&mut lifecycle, TagState::Connecting { identity });
        true
    }

    /// Terminal transition out of `Connecting` or a reconnect pause.
    pub(crate) fn stop_driver(&self, reason: DisconnectReason) {
        let mut lifecycle = lock(&self.lifecycle);
        lifecycle.driver_running = false;
        if lifecycle.state.is_connected() {
            return;
        }
        let identity = lifecycle.state.identity().clone();
        self.set_state(&mut lifecycle, TagState::Disconnected { identity, reason });
    }

    /// Enter `Connected` with a fresh generation.
    pub(crate) fn establish(self: &Arc<Self>) -> Session {
        let handle = {
            let mut lifecycle = lock(&self.lifecycle);
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            let handle = SessionHandle::new(generation);
            self.reboot_expected.store(false, Ordering::SeqCst);
            self.correlator.activate(generation);
            self.router.activate(generation);
            let identity = lifecycle.state.identity().paired();
            self.set_state(
                &mut lifecycle,
                TagState::Connected {
                    identity,
                    session: handle.clone(),
                },
            );
            handle
        };
        self.metrics.record_session();
        self.remember(&self.identity());

        Session {
            handle,
            shared: Arc::clone(self),
        }
    }

    /// Leave `Connected` for `generation`.
    ///
    /// Returns `false` if that generation had already ended.
    pub(crate) fn end_session(&self, generation: u64, reason: DisconnectReason) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        let handle = match &lifecycle.state {
            TagState::Connected { session, .. } if session.generation == generation => {
                session.clone()
            }
            _ => return false,
        };

        handle.closed.cancel();
        let failed = self.correlator.invalidate(generation);
        let ended = self.router.invalidate(generation);
        self.metrics.record_invalidated(failed);
        debug!(
            tag = %self.identifier,
            generation,
            failed_commands = failed,
            ended_subscriptions = ended,
            "Session invalidated"
        );

        if !self.reconnect.allows(&reason) {
            lifecycle.driver_running = false;
        }
        lifecycle.last_ending = Some((generation, reason.clone()));
        let identity = lifecycle.state.identity().clone();
        self.set_state(&mut lifecycle, TagState::Disconnected { identity, reason });
        true
    }

    /// Reason the given generation ended with, once it has.
    pub(crate) fn ending_of(&self, generation: u64) -> Option<DisconnectReason> {
        match &lock(&self.lifecycle).last_ending {
            Some((ended, reason)) if *ended == generation => Some(reason.clone()),
            _ => None,
        }
    }

    /// Map a link loss to `RemoteReboot` when the tag announced one.
    pub(crate) fn classify_link_loss(&self, reason: DisconnectReason) -> DisconnectReason {
        let expected = self.reboot_expected.load(Ordering::SeqCst);
        match reason {
            DisconnectReason::LinkLost | DisconnectReason::Unknown if expected => {
                DisconnectReason::RemoteReboot
            }
            other => other,
        }
    }

    pub(crate) fn record_decode_failure(&self, error: &DecodeError) {
        self.metrics.record_frame();
        self.metrics.record_decode_error();
        warn!(tag = %self.identifier, %error, "Dropping undecodable frame");
    }

    /// Decode one complete frame and hand it to the correlator or router.
    pub(crate) fn handle_frame(&self, generation: u64, bytes: &[u8]) {
        let frame = match self.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(error) => return self.record_decode_failure(&error),
        };
        self.metrics.record_frame();

        let kind = frame.kind;
        if let Some(token) = frame.correlation_token {
            match self.correlator.resolve(generation, frame) {
                Resolution::Matched { announces_reboot } => {
                    if announces_reboot {
                        self.reboot_expected.store(true, Ordering::SeqCst);
                        info!(tag = %self.identifier, "Tag acknowledged a reboot");
                    }
                }
                Resolution::Late => {
                    self.metrics.record_late_response();
                    debug!(tag = %self.identifier, %kind, token, "Dropping late response");
                }
                Resolution::Stale => {
                    trace!(tag = %self.identifier, %kind, token, "Dropping response for ended session");
                }
            }
            return;
        }

        let outcome = self.router.dispatch(generation, frame.into());
        self.metrics.record_delivered(outcome.delivered);
        if outcome.overflowed > 0 {
            self.metrics.record_overflow(outcome.overflowed);
        }
        if outcome.unrouted {
            self.metrics.record_unrouted();
            trace!(
                tag = %self.identifier,
                %kind,
                name = self.codec.kinds().name_of(kind),
                "No subscriber for notification"
            );
        }
    }

    /// Apply a confirmed rename to the current state and the registry.
    fn refresh_display_name(&self, name: &str) {
        let identity = {
            let mut lifecycle = lock(&self.lifecycle);
            let identity = lifecycle.state.identity_mut();
            *identity = identity.with_display_name(name);
            identity.clone()
        };
        self.remember(&identity);
    }

    fn remember(&self, identity: &TagIdentity) {
        if let Some(registry) = &self.registry
            && let Err(error) = registry.upsert(identity)
        {
            warn!(tag = %self.identifier, %error, "Failed to update registry");
        }
    }
}

/// Capability to talk to a connected tag.
///
/// Obtained from [`ConnectionEvent::Connected`](crate::ConnectionEvent) or
/// [`Tag::session`](crate::Tag::session). Every operation fails with
/// [`CommandError::SessionInvalidated`] once the session's generation has
/// ended; a reconnect yields a new `Session`.
#[derive(Clone)]
pub struct Session {
    handle: SessionHandle,
    shared: Arc<TagShared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("tag", &self.shared.identifier)
            .field("generation", &self.handle.generation)
            .field("valid", &self.handle.is_valid())
            .finish()
    }
}

impl Session {
    pub(crate) fn from_parts(handle: SessionHandle, shared: Arc<TagShared>) -> Self {
        Self { handle, shared }
    }

    /// Handle of this session.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Generation number.
    pub fn generation(&self) -> u64 {
        self.handle.generation
    }

    /// Whether this session is still the live one.
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Resolves once this session is invalidated.
    pub async fn closed(&self) {
        self.handle.closed().await;
    }

    /// Current state of the tag (not necessarily this session's).
    pub fn state(&self) -> TagState {
        self.shared.state()
    }

    /// Identity of the tag.
    pub fn identity(&self) -> TagIdentity {
        self.shared.identity()
    }

    /// Send a raw command and wait for the payload of its response.
    ///
    /// The engine never resends. On [`CommandError::Timeout`] the pending
    /// entry is gone and a response arriving later is dropped; calling
    /// again sends a new command with a new token.
    #[tracing::instrument(
        level = "debug",
        skip(self, payload),
        fields(tag = %self.shared.identifier, generation = self.handle.generation)
    )]
    pub async fn send_command(
        &self,
        kind: KindId,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, CommandError> {
        self.request(kind, payload, timeout, None)
            .await
            .map(|frame| frame.payload)
    }

    async fn request(
        &self,
        kind: KindId,
        payload: Bytes,
        timeout: Duration,
        reboot_check: Option<RebootCheck>,
    ) -> Result<Frame, CommandError> {
        if !self.handle.is_valid() {
            return Err(CommandError::SessionInvalidated);
        }
        let kinds = self.shared.codec.kinds();
        if !kinds.contains(kind) {
            return Err(CommandError::UnregisteredKind(kind));
        }
        let expected = kinds.response_kind(kind);

        let pending = self.shared.correlator.register(
            self.handle.generation,
            kind,
            expected,
            timeout,
            reboot_check,
        )?;
        let token = pending.token();
        let bytes = self.shared.codec.encode(&Frame {
            correlation_token: Some(token),
            kind,
            payload,
        });

        let started = Instant::now();
        match tokio::time::timeout_at(pending.deadline(), self.write(bytes)).await {
            Ok(written) => written?,
            Err(_) => {
                // Dropping `pending` cancels the entry. The frame still goes out whole.
                self.shared.metrics.record_timeout();
                warn!(%kind, token, ?timeout, "Command timed out before it was written");
                return Err(CommandError::timeout(kind, timeout));
            }
        }
        self.shared.metrics.record_command_sent();
        debug!(%kind, token, "Command sent");

        let outcome = pending.wait().await;
        match &outcome {
            Ok(_) => self.shared.metrics.record_completed(started.elapsed()),
            Err(CommandError::Timeout { .. }) => {
                self.shared.metrics.record_timeout();
                warn!(%kind, token, ?timeout, "Command timed out");
            }
            Err(error) => debug!(%kind, token, %error, "Command failed"),
        }
        outcome
    }

    /// Write one encoded frame under the tag's write lock.
    ///
    /// The write runs on its own task, so a frame is written whole even when
    /// the caller stops waiting for it.
    async fn write(&self, bytes: Bytes) -> Result<(), CommandError> {
        let shared = Arc::clone(&self.shared);
        let handle = self.handle.clone();
        let task = tokio::spawn(
            async move {
                let guard = shared.write_lock.lock().await;
                if !handle.is_valid() {
                    return Err(CommandError::SessionInvalidated);
                }
                if let Err(error) = shared.transport.write(bytes).await {
                    drop(guard);
                    warn!(%error, "Write failed, ending session");
                    shared.end_session(
                        handle.generation,
                        DisconnectReason::Transport(error.to_string()),
                    );
                    return Err(CommandError::SessionInvalidated);
                }
                Ok(())
            }
            .in_current_span(),
        );
        task.await.unwrap_or(Err(CommandError::SessionInvalidated))
    }

    /// Run a typed command.
    ///
    /// Reboot-inducing commands resolve on the tag's acknowledgement; the
    /// link loss that follows is reported as
    /// [`DisconnectReason::RemoteReboot`].
    pub async fn execute<C: TagCommand>(
        &self,
        command: &C,
        timeout: Duration,
    ) -> Result<C::Response, CommandError> {
        let reboot_check = C::REBOOTS_TAG.then_some(commands::accepts::<C> as RebootCheck);
        let frame = self
            .request(
                C::KIND,
                Bytes::from(command.encode_to_vec()),
                timeout,
                reboot_check,
            )
            .await?;

        let response = C::Response::decode(frame.payload).map_err(|e| {
            CommandError::MalformedResponse {
                kind: frame.kind,
                reason: e.to_string(),
            }
        })?;
        if let Some(message) = C::rejection(&response) {
            return Err(CommandError::Rejected {
                kind: C::KIND,
                message,
            });
        }
        Ok(response)
    }

    /// Rename the tag. The tag reboots after acknowledging.
    #[tracing::instrument(skip(self), fields(tag = %self.shared.identifier))]
    pub async fn rename(&self, name: &str, timeout: Duration) -> Result<(), CommandError> {
        self.execute(
            &RenameRequest {
                name: name.to_string(),
            },
            timeout,
        )
        .await?;
        self.shared.refresh_display_name(name);
        info!(name, "Tag renamed");
        Ok(())
    }

    /// Ask the tag to reboot.
    pub async fn reboot(&self, timeout: Duration) -> Result<(), CommandError> {
        self.execute(&RebootRequest {}, timeout).await.map(|_| ())
    }

    /// Read identity and firmware details.
    pub async fn device_info(&self, timeout: Duration) -> Result<DeviceInfo, CommandError> {
        self.execute(&DeviceInfoRequest {}, timeout).await
    }

    /// Read the battery level.
    pub async fn battery(&self, timeout: Duration) -> Result<BatteryStatus, CommandError> {
        self.execute(&BatteryRequest {}, timeout).await
    }

    /// Receive every notification of `kind` for the lifetime of this
    /// session.
    pub fn subscribe(&self, kind: KindId) -> Result<Subscription, CommandError> {
        if !self.shared.codec.kinds().contains(kind) {
            return Err(CommandError::UnregisteredKind(kind));
        }
        self.shared.router.subscribe(self.handle.generation, kind)
    }

    /// Stop a subscription taken on this session. Its stream ends
    /// immediately.
    ///
    /// Returns `false` for handles of another generation, or once this
    /// session is no longer valid.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        if handle.generation() != self.handle.generation || !self.handle.is_valid() {
            return false;
        }
        self.shared.router.unsubscribe(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> TagIdentity {
        TagIdentity::new("AA:01", "Jacket").unwrap()
    }

    #[test]
    fn test_initial_state() {
        let unpaired = TagIdentity::unpaired("AA:01", "Tag", "7F3K").unwrap();
        assert!(matches!(
            TagState::initial(unpaired),
            TagState::Advertised { ref pairing_code, .. } if pairing_code == "7F3K"
        ));
        assert!(matches!(
            TagState::initial(identity()),
            TagState::PreConnected { .. }
        ));
    }

    #[test]
    fn test_handle_equality_by_generation() {
        let a = SessionHandle::new(3);
        let b = SessionHandle::new(3);
        a.closed.cancel();
        assert_eq!(a, b);
        assert!(!a.is_valid());
        assert!(b.is_valid());
        assert_ne!(a, SessionHandle::new(4));
    }

    #[test]
    fn test_state_accessors() {
        let state = TagState::Connected {
            identity: identity(),
            session: SessionHandle::new(1),
        };
        assert!(state.is_connected());
        assert_eq!(state.session().map(SessionHandle::generation), Some(1));
        assert_eq!(state.identity().display_name(), "Jacket");
        assert_eq!(state.to_string(), "connected (generation 1)");

        let state = TagState::Disconnected {
            identity: identity(),
            reason: DisconnectReason::RemoteReboot,
        };
        assert_eq!(state.disconnect_reason(), Some(&DisconnectReason::RemoteReboot));
        assert!(state.session().is_none());
    }

    #[test]
    fn test_reconnect_policy() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(&DisconnectReason::RemoteReboot));
        assert!(!policy.allows(&DisconnectReason::LinkLost));
        assert!(!policy.allows(&DisconnectReason::UserRequested));
        assert!(!policy.allows(&DisconnectReason::Transport("gatt".into())));
        assert!(!ReconnectPolicy::never().allows(&DisconnectReason::RemoteReboot));
    }
}

//! Per-tag connection driver.
//!
//! [`Tag::connect`] spawns one task that owns the link for as long as the
//! tag is wanted: it connects, reads and dispatches inbound frames, ends
//! the session when the link drops and, when the [`ReconnectPolicy`]
//! allows it, connects again with a fresh generation.
//!
//! [`ReconnectPolicy`]: crate::config::ReconnectPolicy

use std::sync::{Arc, Mutex};

use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weartag_types::{DisconnectReason, TagIdentity};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, ConnectionEvents, StateReceiver};
use crate::metrics::MetricsSnapshot;
use crate::protocol::KindRegistry;
use crate::registry::TagRegistry;
use crate::session::{Session, SessionHandle, TagShared, TagState};
use crate::transport::{ByteStream, LinkEvent, LinkEventStream, Transport};
use crate::util::lock;

/// Builder for [`Tag`].
pub struct TagBuilder {
    identity: TagIdentity,
    transport: Arc<dyn Transport>,
    registry: Option<Arc<dyn TagRegistry>>,
    kinds: Arc<KindRegistry>,
    config: EngineConfig,
}

impl TagBuilder {
    /// Registry updated on every connection and rename.
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn TagRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Kind table used to validate frames. Defaults to
    /// [`KindRegistry::with_defaults`].
    #[must_use]
    pub fn kinds(mut self, kinds: Arc<KindRegistry>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Tag {
        Tag {
            shared: Arc::new(TagShared::new(
                self.identity,
                self.transport,
                self.registry,
                self.kinds,
                &self.config,
            )),
            driver: Mutex::new(None),
        }
    }
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One physical tag and its lifecycle.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use futures::{FutureExt, StreamExt};
/// use weartag_core::{ConnectionEvent, Tag};
/// use weartag_core::protocol::kinds;
///
/// let tag = Tag::new(identity, transport);
/// let mut events = tag.connect().await?;
/// while let Some(event) = events.next().await {
///     if let ConnectionEvent::Connected(session) = event {
///         let mut gestures = session.subscribe(kinds::GESTURE)?;
///         let battery = session.battery(Duration::from_secs(2)).await?;
///         println!("battery {}%", battery.level);
///     }
/// }
/// ```
pub struct Tag {
    shared: Arc<TagShared>,
    driver: Mutex<Option<Driver>>,
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tag").field("shared", &self.shared).finish()
    }
}

impl Tag {
    /// Tag with the default configuration and kind table, no registry.
    pub fn new(identity: TagIdentity, transport: Arc<dyn Transport>) -> Self {
        Self::builder(identity, transport).build()
    }

    pub fn builder(identity: TagIdentity, transport: Arc<dyn Transport>) -> TagBuilder {
        TagBuilder {
            identity,
            transport,
            registry: None,
            kinds: Arc::new(KindRegistry::with_defaults()),
            config: EngineConfig::default(),
        }
    }

    /// Stable identifier.
    pub fn identifier(&self) -> &str {
        self.shared.identifier()
    }

    /// Current identity, including a refreshed display name after a rename.
    pub fn identity(&self) -> TagIdentity {
        self.shared.identity()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TagState {
        self.shared.state()
    }

    /// Observe every state transition from now on.
    pub fn state_events(&self) -> StateReceiver {
        self.shared.subscribe_states()
    }

    /// The live session, if connected.
    pub fn session(&self) -> Option<Session> {
        match self.shared.state() {
            TagState::Connected { session, .. } => {
                Some(Session::from_parts(session, Arc::clone(&self.shared)))
            }
            _ => None,
        }
    }

    /// Counters of this tag across all its sessions.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Commands awaiting a response on the live session.
    pub fn outstanding_commands(&self) -> usize {
        self.shared.outstanding_commands()
    }

    /// Active notification subscribers on the live session.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriber_count()
    }

    /// Start connecting.
    ///
    /// The state enters `Connecting` before this returns. There is no
    /// timeout: the attempt runs until it succeeds, fails, or is cancelled
    /// through [`ConnectionEvents::cancel`] or [`Tag::disconnect`]. A failed
    /// attempt is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionActive`] while a previous connection (or its
    /// pending automatic reconnect) is still running.
    #[tracing::instrument(skip(self), fields(tag = %self.shared.identifier()))]
    pub async fn connect(&self) -> Result<ConnectionEvents> {
        let mut driver = lock(&self.driver);
        if !self.shared.claim_driver() {
            return Err(Error::SessionActive {
                identifier: self.shared.identifier().to_string(),
            });
        }

        let cancel = CancellationToken::new();
        let (events, receiver) = mpsc::unbounded_channel();
        let _ = events.send(ConnectionEvent::Connecting);
        let task = tokio::spawn(drive(Arc::clone(&self.shared), cancel.clone(), events));
        *driver = Some(Driver {
            cancel: cancel.clone(),
            task,
        });
        Ok(ConnectionEvents::new(receiver, cancel))
    }

    /// Disconnect, or abandon a pending connection attempt, and wait for
    /// the driver to release the link.
    ///
    /// Ends in `Disconnected(UserRequested)` unless the tag was already
    /// terminally disconnected.
    #[tracing::instrument(skip(self), fields(tag = %self.shared.identifier()))]
    pub async fn disconnect(&self) {
        let driver = lock(&self.driver).take();
        let Some(driver) = driver else {
            return;
        };
        driver.cancel.cancel();
        if let Err(error) = driver.task.await {
            warn!(%error, "Connection driver failed");
        }
    }
}

impl Drop for Tag {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.cancel.cancel();
        }
    }
}

type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

fn emit(events: &EventSink, event: ConnectionEvent) {
    // The caller may have dropped its event stream.
    let _ = events.send(event);
}

async fn drive(shared: Arc<TagShared>, cancel: CancellationToken, events: EventSink) {
    // Wait for a previous driver to finish tearing its link down.
    let _link = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            shared.stop_driver(DisconnectReason::UserRequested);
            emit(&events, ConnectionEvent::Disconnected(DisconnectReason::UserRequested));
            return;
        }
        guard = shared.link_lock.lock() => guard,
    };

    loop {
        let streams = match connect_link(&shared, &cancel).await {
            Ok(streams) => streams,
            Err(reason) => {
                shared.stop_driver(reason.clone());
                emit(&events, ConnectionEvent::Disconnected(reason));
                return;
            }
        };

        let session = shared.establish();
        let handle = session.handle().clone();
        let generation = handle.generation();
        info!(tag = %shared.identifier(), generation, "Session established");
        emit(&events, ConnectionEvent::Connected(session));

        let (bytes, links) = streams;
        let exit = pump(&shared, &handle, bytes, links, &cancel).await;
        let reason = match exit {
            Some(reason) if shared.end_session(generation, reason.clone()) => reason,
            // Ended from the write path.
            _ => shared
                .ending_of(generation)
                .unwrap_or(DisconnectReason::Unknown),
        };

        if let Err(error) = shared.transport.disconnect().await {
            debug!(tag = %shared.identifier(), %error, "Link teardown failed");
        }
        emit(&events, ConnectionEvent::Disconnected(reason.clone()));

        if !shared.reconnect.allows(&reason) {
            return;
        }
        if cancel.is_cancelled() {
            shared.stop_driver(DisconnectReason::UserRequested);
            emit(&events, ConnectionEvent::Disconnected(DisconnectReason::UserRequested));
            return;
        }

        let delay = shared.reconnect.delay();
        info!(tag = %shared.identifier(), %reason, ?delay, "Reconnecting");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        if !shared.begin_reconnect(&cancel) {
            emit(&events, ConnectionEvent::Disconnected(DisconnectReason::UserRequested));
            return;
        }
        emit(&events, ConnectionEvent::Connecting);
    }
}

/// Bring the link up and open its streams.
async fn connect_link(
    shared: &TagShared,
    cancel: &CancellationToken,
) -> std::result::Result<(ByteStream, LinkEventStream), DisconnectReason> {
    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(tag = %shared.identifier(), "Connection attempt cancelled");
            return Err(DisconnectReason::UserRequested);
        }
        result = shared.transport.connect() => result,
    };
    if let Err(error) = connected {
        warn!(tag = %shared.identifier(), %error, "Connection attempt failed");
        return Err(DisconnectReason::Transport(error.to_string()));
    }

    let streams = async {
        let bytes = shared.transport.byte_stream().await?;
        let links = shared.transport.link_events().await?;
        Ok::<_, crate::error::TransportError>((bytes, links))
    }
    .await;

    match streams {
        Ok(streams) => Ok(streams),
        Err(error) => {
            warn!(tag = %shared.identifier(), %error, "Failed to open link streams");
            let _ = shared.transport.disconnect().await;
            Err(DisconnectReason::Transport(error.to_string()))
        }
    }
}

/// Process inbound traffic until the session ends.
///
/// Returns the reason to end the session with, or `None` if it was already
/// ended elsewhere.
async fn pump(
    shared: &TagShared,
    handle: &SessionHandle,
    mut bytes: ByteStream,
    mut links: LinkEventStream,
    cancel: &CancellationToken,
) -> Option<DisconnectReason> {
    let generation = handle.generation();
    let mut assembler = shared.codec.assembler();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(DisconnectReason::UserRequested),
            _ = handle.closed() => return None,
            chunk = bytes.next() => {
                let Some(chunk) = chunk else {
                    debug!(tag = %shared.identifier(), "Inbound stream ended");
                    return Some(shared.classify_link_loss(reported_reason(&mut links)));
                };
                assembler.push(&chunk);
                while let Some(frame) = assembler.next_frame() {
                    match frame {
                        Ok(frame) => shared.handle_frame(generation, &frame),
                        Err(error) => shared.record_decode_failure(&error),
                    }
                }
            }
            event = links.next() => match event {
                Some(LinkEvent::Disconnected(reason)) => {
                    return Some(shared.classify_link_loss(reason));
                }
                Some(LinkEvent::Connected) => {}
                None => return Some(shared.classify_link_loss(DisconnectReason::LinkLost)),
            },
        }
    }
}

/// Disconnect reason the radio stack already reported, if any.
fn reported_reason(links: &mut LinkEventStream) -> DisconnectReason {
    while let Some(Some(event)) = links.next().now_or_never() {
        if let LinkEvent::Disconnected(reason) = event {
            return reason;
        }
    }
    DisconnectReason::LinkLost
}

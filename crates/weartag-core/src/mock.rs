//! In-process transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without any radio. Tests drive
//! the inbound side directly ([`push_frame`](MockTransport::push_frame),
//! [`drop_link`](MockTransport::drop_link)) or install a responder that
//! reacts to every written command. [`TagFirmware`] is a ready-made
//! responder that behaves like a real tag, including the reboot after a
//! rename.
//!
//! # Features
//!
//! - **Connect scripting**: succeed, fail, or stay pending per attempt
//! - **Failure injection**: fail the next write
//! - **Write shaping**: split writes into MTU-sized chunks, stall each chunk
//! - **Inspection**: every written chunk is recorded

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use weartag_types::DisconnectReason;

use crate::codec::{self, DEFAULT_MAX_FRAME_LEN, Frame, FrameAssembler};
use crate::error::TransportError;
use crate::protocol::{Ack, BatteryStatus, DeviceInfo, RenameRequest, kinds};
use crate::transport::{ByteStream, LinkEvent, LinkEventStream, Transport};
use crate::util::lock;

/// Outcome of one connect attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectBehavior {
    #[default]
    Succeed,
    /// Fail with the given message.
    Fail(String),
    /// Never complete.
    Pend,
}

/// Reaction of a responder to a written frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockAction {
    /// Deliver a frame on the inbound stream.
    Send(Frame),
    /// Deliver raw bytes on the inbound stream.
    SendRaw(Bytes),
    /// Take the link down.
    DropLink(DisconnectReason),
}

type Responder = Box<dyn FnMut(&Frame) -> Vec<MockAction> + Send>;

struct Link {
    inbound: mpsc::UnboundedSender<Bytes>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[derive(Default)]
struct LinkSlot {
    link: Option<Link>,
    inbound: Option<mpsc::UnboundedReceiver<Bytes>>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

/// A transport backed by in-memory channels.
pub struct MockTransport {
    slot: Mutex<LinkSlot>,
    connect_script: Mutex<VecDeque<ConnectBehavior>>,
    default_behavior: Mutex<ConnectBehavior>,
    responder: Mutex<Option<Responder>>,
    written: Mutex<Vec<Bytes>>,
    /// Tag-side reassembly of written chunks.
    received: Mutex<FrameAssembler>,
    write_chunk_len: AtomicUsize,
    write_delay: Mutex<Duration>,
    fail_next_write: AtomicBool,
    connect_attempts: AtomicU32,
    disconnects: AtomicU32,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.is_connected())
            .field("connect_attempts", &self.connect_attempts())
            .field("written", &lock(&self.written).len())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Transport whose connects succeed and which never answers.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(LinkSlot::default()),
            connect_script: Mutex::new(VecDeque::new()),
            default_behavior: Mutex::new(ConnectBehavior::Succeed),
            responder: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            received: Mutex::new(FrameAssembler::new(DEFAULT_MAX_FRAME_LEN)),
            write_chunk_len: AtomicUsize::new(0),
            write_delay: Mutex::new(Duration::ZERO),
            fail_next_write: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
        }
    }

    /// Transport answering like a real tag.
    pub fn with_firmware(firmware: TagFirmware) -> Self {
        let transport = Self::new();
        transport.set_responder(move |frame| firmware.respond(frame));
        transport
    }

    /// Behavior of every connect attempt without a scripted one.
    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        *lock(&self.default_behavior) = behavior;
    }

    /// Behavior of the next unscripted connect attempt.
    pub fn push_connect_behavior(&self, behavior: ConnectBehavior) {
        lock(&self.connect_script).push_back(behavior);
    }

    /// React to written frames.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Frame) -> Vec<MockAction> + Send + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Fail the next write with [`TransportError::WriteFailed`].
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Split every write into chunks of at most `len` bytes, like a GATT
    /// client under a small MTU. Zero writes each call in one piece.
    pub fn set_write_chunk_len(&self, len: usize) {
        self.write_chunk_len.store(len, Ordering::SeqCst);
    }

    /// Stall before every written chunk.
    pub fn set_write_delay(&self, delay: Duration) {
        *lock(&self.write_delay) = delay;
    }

    /// Whether a link is up.
    pub fn is_connected(&self) -> bool {
        lock(&self.slot).link.is_some()
    }

    /// Number of `connect` calls so far.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls so far.
    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Every frame written so far, reassembled from the written chunks and
    /// decoded.
    pub fn written_frames(&self) -> Vec<Frame> {
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_LEN);
        for chunk in lock(&self.written).iter() {
            assembler.push(chunk);
        }
        std::iter::from_fn(|| assembler.next_frame())
            .filter_map(Result::ok)
            .filter_map(|bytes| codec::decode_unchecked(&bytes, DEFAULT_MAX_FRAME_LEN).ok())
            .collect()
    }

    /// Written bytes the tag holds without a complete frame.
    pub fn partial_frame_len(&self) -> usize {
        lock(&self.received).buffered()
    }

    /// Deliver a frame from the tag. Returns `false` without a link.
    pub fn push_frame(&self, frame: &Frame) -> bool {
        self.push_bytes(codec::encode(frame))
    }

    /// Deliver raw bytes from the tag. Returns `false` without a link.
    pub fn push_bytes(&self, bytes: impl Into<Bytes>) -> bool {
        match &lock(&self.slot).link {
            Some(link) => link.inbound.send(bytes.into()).is_ok(),
            None => false,
        }
    }

    /// Take the link down as the radio stack would report it.
    pub fn drop_link(&self, reason: DisconnectReason) {
        if let Some(link) = lock(&self.slot).link.take() {
            let _ = link.events.send(LinkEvent::Disconnected(reason));
        }
    }

    fn apply(&self, actions: Vec<MockAction>) {
        for action in actions {
            match action {
                MockAction::Send(frame) => {
                    self.push_frame(&frame);
                }
                MockAction::SendRaw(bytes) => {
                    self.push_bytes(bytes);
                }
                MockAction::DropLink(reason) => self.drop_link(reason),
            }
        }
    }

    /// Hand written bytes to the tag and answer every frame they complete.
    fn receive(&self, chunk: &[u8]) {
        let frames: Vec<Bytes> = {
            let mut assembler = lock(&self.received);
            assembler.push(chunk);
            std::iter::from_fn(|| assembler.next_frame())
                .filter_map(Result::ok)
                .collect()
        };
        for bytes in frames {
            let Ok(frame) = codec::decode_unchecked(&bytes, DEFAULT_MAX_FRAME_LEN) else {
                continue;
            };
            let actions = match lock(&self.responder).as_mut() {
                Some(respond) => respond(&frame),
                None => Vec::new(),
            };
            self.apply(actions);
        }
    }

    fn next_behavior(&self) -> ConnectBehavior {
        lock(&self.connect_script)
            .pop_front()
            .unwrap_or_else(|| lock(&self.default_behavior).clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        match self.next_behavior() {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::Fail(message) => return Err(TransportError::ConnectFailed(message)),
            ConnectBehavior::Pend => futures::future::pending::<()>().await,
        }

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let _ = events.send(LinkEvent::Connected);
        lock(&self.received).reset();
        let mut slot = lock(&self.slot);
        slot.link = Some(Link { inbound, events });
        slot.inbound = Some(inbound_rx);
        slot.events = Some(events_rx);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let mut slot = lock(&self.slot);
        slot.link = None;
        slot.inbound = None;
        slot.events = None;
        Ok(())
    }

    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(TransportError::WriteFailed("injected failure".to_string()));
        }
        let chunk_len = match self.write_chunk_len.load(Ordering::SeqCst) {
            0 => bytes.len().max(1),
            len => len,
        };
        let delay = *lock(&self.write_delay);

        for start in (0..bytes.len()).step_by(chunk_len) {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            let chunk = bytes.slice(start..bytes.len().min(start + chunk_len));
            lock(&self.written).push(chunk.clone());
            self.receive(&chunk);
        }
        Ok(())
    }

    async fn byte_stream(&self) -> Result<ByteStream, TransportError> {
        let receiver = lock(&self.slot)
            .inbound
            .take()
            .ok_or(TransportError::NotConnected)?;
        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|bytes| (bytes, receiver))
        })
        .boxed())
    }

    async fn link_events(&self) -> Result<LinkEventStream, TransportError> {
        let receiver = lock(&self.slot)
            .events
            .take()
            .ok_or(TransportError::NotConnected)?;
        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        })
        .boxed())
    }
}

/// Simulated tag firmware.
///
/// Answers device-info and battery requests, acknowledges rename and
/// reboot, then drops the link as the real tag does when it restarts.
#[derive(Debug)]
pub struct TagFirmware {
    serial: String,
    name: Mutex<String>,
    firmware_version: String,
    battery_level: u32,
}

impl TagFirmware {
    /// Firmware with a random serial.
    pub fn new(name: &str) -> Self {
        Self {
            serial: format!("WT{:08X}", rand::random::<u32>()),
            name: Mutex::new(name.to_string()),
            firmware_version: "2.4.1".to_string(),
            battery_level: 87,
        }
    }

    /// Override the serial number.
    #[must_use]
    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = serial.to_string();
        self
    }

    /// Override the battery level.
    #[must_use]
    pub fn battery_level(mut self, level: u32) -> Self {
        self.battery_level = level;
        self
    }

    /// Name the firmware currently advertises.
    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    /// Reaction to one command frame.
    pub fn respond(&self, frame: &Frame) -> Vec<MockAction> {
        let Some(token) = frame.correlation_token else {
            return Vec::new();
        };
        let reply = |frame: Frame| MockAction::Send(frame);

        match frame.kind {
            kinds::DEVICE_INFO_REQUEST => vec![reply(Frame::from_message(
                kinds::DEVICE_INFO,
                Some(token),
                &DeviceInfo {
                    serial: self.serial.clone(),
                    display_name: self.name(),
                    firmware_version: self.firmware_version.clone(),
                    vendor_id: 0x00e0,
                    product_id: 0x0001,
                },
            ))],
            kinds::BATTERY_REQUEST => vec![reply(Frame::from_message(
                kinds::BATTERY_STATUS,
                Some(token),
                &BatteryStatus {
                    level: self.battery_level,
                    charging: false,
                },
            ))],
            kinds::RENAME => {
                if let Ok(request) = frame.decode_payload::<RenameRequest>() {
                    *lock(&self.name) = request.name;
                }
                vec![
                    reply(Frame::from_message(kinds::ACK, Some(token), &Ack::ok())),
                    MockAction::DropLink(DisconnectReason::LinkLost),
                ]
            }
            kinds::REBOOT => vec![
                reply(Frame::from_message(kinds::ACK, Some(token), &Ack::ok())),
                MockAction::DropLink(DisconnectReason::LinkLost),
            ],
            _ => Vec::new(),
        }
    }
}

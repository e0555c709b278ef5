//! End-to-end tests of the session engine over the mock transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::time::timeout;

use weartag_core::protocol::{
    AttachEvent, BatteryStatus, Gesture, GestureEvent, RenameRequest, kinds,
};
use weartag_core::{
    CommandError, ConnectBehavior, ConnectionEvent, ConnectionEvents, DisconnectReason,
    EngineConfig, Error, Frame, KindId, MemoryRegistry, MockAction, MockTransport,
    OverflowPolicy, Session, Tag, TagFirmware, TagIdentity, TagManager, TagRegistry, TagState,
    Transport,
};

const WAIT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const IDENTIFIER: &str = "AA:BB:CC:DD:EE:01";

fn identity() -> TagIdentity {
    TagIdentity::unpaired(IDENTIFIER, "Jacket", "EE01").unwrap()
}

fn reconnecting_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.reconnect.after_link_loss = true;
    config.reconnect.delay_ms = 0;
    config
}

fn gesture(gesture: Gesture, uptime_ms: u64) -> Frame {
    Frame::from_message(
        kinds::GESTURE,
        None,
        &GestureEvent {
            gesture: gesture as i32,
            uptime_ms,
        },
    )
}

fn attach(attached: bool) -> Frame {
    Frame::from_message(
        kinds::ATTACH,
        None,
        &AttachEvent {
            attached,
            product_id: 7,
        },
    )
}

async fn next_event(events: &mut ConnectionEvents) -> ConnectionEvent {
    timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for a connection event")
        .expect("connection event stream ended")
}

/// Skip `Connecting` events and return the next session.
async fn expect_connected(events: &mut ConnectionEvents) -> Session {
    loop {
        match next_event(events).await {
            ConnectionEvent::Connecting => continue,
            ConnectionEvent::Connected(session) => return session,
            other => panic!("expected Connected, got {other:?}"),
        }
    }
}

async fn expect_disconnected(events: &mut ConnectionEvents) -> DisconnectReason {
    match next_event(events).await {
        ConnectionEvent::Disconnected(reason) => reason,
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_gesture(subscription: &mut weartag_core::Subscription) -> GestureEvent {
    let notification = timeout(WAIT, subscription.next())
        .await
        .expect("timed out waiting for a notification")
        .expect("subscription ended");
    notification.decode().unwrap()
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_connect_emits_connecting_then_connected() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    assert!(matches!(tag.state(), TagState::Advertised { .. }));

    let mut events = tag.connect().await.unwrap();
    assert!(matches!(tag.state(), TagState::Connecting { .. }));
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connecting));

    let session = expect_connected(&mut events).await;
    assert!(session.is_valid());
    assert_eq!(tag.session().unwrap().generation(), session.generation());
    assert!(tag.state().is_connected());
    // A connected tag has been paired.
    assert_eq!(tag.identity().pairing_code(), None);
    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test]
async fn test_second_connect_is_rejected_while_active() {
    let tag = Tag::new(identity(), Arc::new(MockTransport::new()));
    let mut events = tag.connect().await.unwrap();
    expect_connected(&mut events).await;

    assert!(matches!(
        tag.connect().await,
        Err(Error::SessionActive { identifier }) if identifier == IDENTIFIER
    ));
}

#[tokio::test]
async fn test_failed_connect_is_terminal() {
    let transport = Arc::new(MockTransport::new());
    transport.set_connect_behavior(ConnectBehavior::Fail("out of range".into()));
    let tag = Tag::builder(identity(), transport.clone())
        .config(reconnecting_config())
        .build();

    let mut events = tag.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connecting));
    let reason = expect_disconnected(&mut events).await;
    assert!(matches!(reason, DisconnectReason::Transport(ref msg) if msg.contains("out of range")));

    // No retry, even with reconnects enabled.
    assert!(timeout(WAIT, events.next()).await.unwrap().is_none());
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(tag.state().disconnect_reason(), Some(&reason));

    // The tag can be connected again explicitly.
    transport.set_connect_behavior(ConnectBehavior::Succeed);
    let mut events = tag.connect().await.unwrap();
    expect_connected(&mut events).await;
}

#[tokio::test]
async fn test_pending_connect_can_be_cancelled() {
    let transport = Arc::new(MockTransport::new());
    transport.set_connect_behavior(ConnectBehavior::Pend);
    let tag = Tag::new(identity(), transport.clone());

    let mut events = tag.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connecting));
    wait_until(|| transport.connect_attempts() == 1).await;

    events.cancel();
    assert_eq!(
        expect_disconnected(&mut events).await,
        DisconnectReason::UserRequested
    );
    assert_eq!(
        tag.state().disconnect_reason(),
        Some(&DisconnectReason::UserRequested)
    );
}

#[tokio::test]
async fn test_disconnect_invalidates_session() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    tag.disconnect().await;

    assert!(!session.is_valid());
    assert_eq!(
        expect_disconnected(&mut events).await,
        DisconnectReason::UserRequested
    );
    assert!(matches!(
        session.battery(COMMAND_TIMEOUT).await,
        Err(CommandError::SessionInvalidated)
    ));
    assert!(tag.session().is_none());
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_link_loss_without_reconnect_is_terminal() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    transport.drop_link(DisconnectReason::LinkLost);

    assert_eq!(
        expect_disconnected(&mut events).await,
        DisconnectReason::LinkLost
    );
    assert!(timeout(WAIT, events.next()).await.unwrap().is_none());
    assert!(!session.is_valid());
    assert_eq!(transport.connect_attempts(), 1);
}

// ==================== Invalidation ====================

#[tokio::test]
async fn test_session_invalidated_before_replacement() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::builder(identity(), transport.clone())
        .config(reconnecting_config())
        .build();
    let mut events = tag.connect().await.unwrap();
    let old = expect_connected(&mut events).await;
    let mut gestures = old.subscribe(kinds::GESTURE).unwrap();

    let pending = tokio::spawn({
        let old = old.clone();
        async move { old.battery(Duration::from_secs(30)).await }
    });
    wait_until(|| tag.outstanding_commands() == 1).await;

    let mut states = tag.state_events();
    transport.drop_link(DisconnectReason::LinkLost);

    assert_eq!(
        expect_disconnected(&mut events).await,
        DisconnectReason::LinkLost
    );
    assert!(!old.is_valid());

    let new = expect_connected(&mut events).await;
    assert!(new.generation() > old.generation());
    assert_ne!(new.handle(), old.handle());

    assert!(matches!(
        pending.await.unwrap(),
        Err(CommandError::SessionInvalidated)
    ));
    assert!(timeout(WAIT, gestures.next()).await.unwrap().is_none());
    assert!(matches!(
        old.battery(COMMAND_TIMEOUT).await,
        Err(CommandError::SessionInvalidated)
    ));
    assert!(matches!(
        old.subscribe(kinds::GESTURE),
        Err(CommandError::SessionInvalidated)
    ));

    let mut seen = Vec::new();
    while let Ok(state) = states.try_recv() {
        seen.push(state.name());
    }
    assert_eq!(seen, ["disconnected", "connecting", "connected"]);
    assert_eq!(tag.metrics().commands_invalidated, 1);
}

#[tokio::test]
async fn test_stale_session_cannot_unsubscribe_live_subscription() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::builder(identity(), transport.clone())
        .config(reconnecting_config())
        .build();
    let mut events = tag.connect().await.unwrap();
    let old = expect_connected(&mut events).await;
    let old_gestures = old.subscribe(kinds::GESTURE).unwrap();

    transport.drop_link(DisconnectReason::LinkLost);
    assert_eq!(
        expect_disconnected(&mut events).await,
        DisconnectReason::LinkLost
    );
    let new = expect_connected(&mut events).await;

    let mut gestures = new.subscribe(kinds::GESTURE).unwrap();
    let handle = gestures.handle();
    assert_eq!(handle.generation(), new.generation());
    assert!(!old.unsubscribe(handle));
    assert!(!new.unsubscribe(old_gestures.handle()));
    assert!(gestures.is_active());

    transport.push_frame(&gesture(Gesture::Cover, 40));
    assert_eq!(
        next_gesture(&mut gestures).await.gesture,
        Gesture::Cover as i32
    );

    assert!(new.unsubscribe(handle));
    assert!(timeout(WAIT, gestures.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_write_failure_disconnects_and_fails_command() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    transport.fail_next_write();
    assert!(matches!(
        session.battery(COMMAND_TIMEOUT).await,
        Err(CommandError::SessionInvalidated)
    ));
    assert!(!session.is_valid());

    let reason = expect_disconnected(&mut events).await;
    assert!(matches!(reason, DisconnectReason::Transport(ref msg) if msg.contains("injected")));
    assert_eq!(tag.outstanding_commands(), 0);
}

// ==================== Commands ====================

#[tokio::test]
async fn test_concurrent_commands_resolve_out_of_order() {
    let transport = Arc::new(MockTransport::new());
    let mut held: Vec<u32> = Vec::new();
    transport.set_responder(move |frame| {
        held.extend(frame.correlation_token);
        if held.len() < 3 {
            return Vec::new();
        }
        // Answer the newest first; the level tells requests apart.
        let replies = held
            .iter()
            .enumerate()
            .rev()
            .map(|(index, &token)| {
                MockAction::Send(Frame::from_message(
                    kinds::BATTERY_STATUS,
                    Some(token),
                    &BatteryStatus {
                        level: index as u32 + 1,
                        charging: false,
                    },
                ))
            })
            .collect();
        held.clear();
        replies
    });

    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    let (first, second, third) = tokio::join!(
        session.battery(COMMAND_TIMEOUT),
        session.battery(COMMAND_TIMEOUT),
        session.battery(COMMAND_TIMEOUT),
    );
    assert_eq!(first.unwrap().level, 1);
    assert_eq!(second.unwrap().level, 2);
    assert_eq!(third.unwrap().level, 3);

    let tokens: HashSet<u32> = transport
        .written_frames()
        .iter()
        .filter_map(|frame| frame.correlation_token)
        .collect();
    assert_eq!(tokens.len(), 3);
    assert_eq!(tag.outstanding_commands(), 0);

    let metrics = tag.metrics();
    assert_eq!(metrics.commands_sent, 3);
    assert_eq!(metrics.commands_completed, 3);
    assert_eq!(metrics.late_responses, 0);
}

#[tokio::test]
async fn test_firmware_commands() {
    let transport = Arc::new(MockTransport::with_firmware(
        TagFirmware::new("Jacket").serial("WT00AB12").battery_level(64),
    ));
    let tag = Tag::new(identity(), transport);
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    let info = session.device_info(COMMAND_TIMEOUT).await.unwrap();
    assert_eq!(info.serial, "WT00AB12");
    assert_eq!(info.display_name, "Jacket");
    assert_eq!(session.battery(COMMAND_TIMEOUT).await.unwrap().level, 64);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_resend_uses_fresh_token() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    let started = tokio::time::Instant::now();
    let error = session.battery(COMMAND_TIMEOUT).await.unwrap_err();
    assert_eq!(
        error,
        CommandError::Timeout {
            kind: kinds::BATTERY_REQUEST,
            duration: COMMAND_TIMEOUT,
        }
    );
    assert!(started.elapsed() >= COMMAND_TIMEOUT);
    assert!(session.is_valid());
    assert_eq!(tag.outstanding_commands(), 0);

    let firmware = TagFirmware::new("Jacket");
    transport.set_responder(move |frame| firmware.respond(frame));
    session.battery(COMMAND_TIMEOUT).await.unwrap();

    let written = transport.written_frames();
    assert_eq!(written.len(), 2);
    assert_ne!(written[0].correlation_token, written[1].correlation_token);
    assert_eq!(tag.metrics().commands_timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_times_out_at_deadline() {
    let transport = Arc::new(MockTransport::with_firmware(TagFirmware::new("Jacket")));
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;
    let stall = Duration::from_secs(30);
    transport.set_write_delay(stall);

    let started = tokio::time::Instant::now();
    let error = session.battery(COMMAND_TIMEOUT).await.unwrap_err();
    assert_eq!(
        error,
        CommandError::Timeout {
            kind: kinds::BATTERY_REQUEST,
            duration: COMMAND_TIMEOUT,
        }
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= COMMAND_TIMEOUT && elapsed < stall, "{elapsed:?}");
    assert!(session.is_valid());
    assert_eq!(tag.outstanding_commands(), 0);
    assert_eq!(tag.metrics().commands_timed_out, 1);

    // The stalled frame still reaches the tag; its answer arrives late.
    tokio::time::sleep(stall).await;
    wait_until(|| tag.metrics().late_responses == 1).await;
    assert_eq!(transport.written_frames().len(), 1);

    transport.set_write_delay(Duration::ZERO);
    assert_eq!(session.battery(COMMAND_TIMEOUT).await.unwrap().level, 87);
}

#[tokio::test(start_paused = true)]
async fn test_command_cancelled_mid_write_keeps_frames_whole() {
    let transport = Arc::new(MockTransport::with_firmware(TagFirmware::new("Jacket")));
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;
    transport.set_write_chunk_len(4);
    transport.set_write_delay(Duration::from_millis(10));

    let padded = bytes::Bytes::from(vec![0xA5; 22]);
    let cancelled = timeout(
        Duration::from_millis(15),
        session.send_command(kinds::DEVICE_INFO_REQUEST, padded, COMMAND_TIMEOUT),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(tag.outstanding_commands(), 0);

    // Queued behind the abandoned frame, not spliced into it.
    let battery = session.battery(COMMAND_TIMEOUT).await.unwrap();
    assert_eq!(battery.level, 87);

    let written = transport.written_frames();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].kind, kinds::DEVICE_INFO_REQUEST);
    assert_eq!(written[0].payload.len(), 22);
    assert_eq!(written[1].kind, kinds::BATTERY_REQUEST);
    assert_eq!(transport.partial_frame_len(), 0);

    wait_until(|| tag.metrics().late_responses == 1).await;
    assert!(session.is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_late_response_is_dropped() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;
    let mut batteries = session.subscribe(kinds::BATTERY_STATUS).unwrap();

    assert!(session.battery(COMMAND_TIMEOUT).await.is_err());
    let token = transport.written_frames()[0].correlation_token.unwrap();

    transport.push_frame(&Frame::from_message(
        kinds::BATTERY_STATUS,
        Some(token),
        &BatteryStatus {
            level: 10,
            charging: true,
        },
    ));
    wait_until(|| tag.metrics().late_responses == 1).await;

    // Responses never leak into notification subscribers.
    assert!(batteries.next().now_or_never().is_none());
    assert!(session.is_valid());
}

#[tokio::test]
async fn test_unregistered_kind_is_rejected() {
    let tag = Tag::new(identity(), Arc::new(MockTransport::new()));
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    let kind = KindId(0x7777);
    assert_eq!(
        session
            .send_command(kind, bytes::Bytes::new(), COMMAND_TIMEOUT)
            .await
            .unwrap_err(),
        CommandError::UnregisteredKind(kind)
    );
    assert!(matches!(
        session.subscribe(kind),
        Err(CommandError::UnregisteredKind(_))
    ));
}

// ==================== Rename and reboot ====================

#[tokio::test]
async fn test_rename_reboots_and_reconnects() {
    let registry = Arc::new(MemoryRegistry::new());
    let transport = Arc::new(MockTransport::with_firmware(TagFirmware::new("Jacket")));
    let mut config = EngineConfig::default();
    config.reconnect.delay_ms = 10;
    let tag = Tag::builder(identity(), transport.clone())
        .registry(registry.clone())
        .config(config)
        .build();

    let mut events = tag.connect().await.unwrap();
    let old = expect_connected(&mut events).await;

    old.rename("Sleeve", COMMAND_TIMEOUT).await.unwrap();

    assert_eq!(
        expect_disconnected(&mut events).await,
        DisconnectReason::RemoteReboot
    );
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connecting));
    let new = expect_connected(&mut events).await;

    assert!(!old.is_valid());
    assert!(new.generation() > old.generation());
    assert!(matches!(
        old.device_info(COMMAND_TIMEOUT).await,
        Err(CommandError::SessionInvalidated)
    ));

    let info = new.device_info(COMMAND_TIMEOUT).await.unwrap();
    assert_eq!(info.display_name, "Sleeve");
    assert_eq!(tag.identity().display_name(), "Sleeve");
    assert_eq!(
        registry.get(IDENTIFIER).unwrap().unwrap().display_name(),
        "Sleeve"
    );
    assert_eq!(transport.connect_attempts(), 2);
}

#[tokio::test]
async fn test_reboot_without_auto_reconnect() {
    let transport = Arc::new(MockTransport::with_firmware(TagFirmware::new("Jacket")));
    let mut config = EngineConfig::default();
    config.reconnect.after_remote_reboot = false;
    let tag = Tag::builder(identity(), transport.clone())
        .config(config)
        .build();

    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;
    session.reboot(COMMAND_TIMEOUT).await.unwrap();

    assert_eq!(
        expect_disconnected(&mut events).await,
        DisconnectReason::RemoteReboot
    );
    assert!(timeout(WAIT, events.next()).await.unwrap().is_none());
    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test]
async fn test_rejected_rename_keeps_session() {
    let transport = Arc::new(MockTransport::new());
    transport.set_responder(|frame| {
        let Some(token) = frame.correlation_token else {
            return Vec::new();
        };
        let ack = weartag_core::protocol::Ack {
            status: weartag_core::protocol::AckStatus::Busy as i32,
            message: String::new(),
        };
        vec![MockAction::Send(Frame::from_message(
            kinds::ACK,
            Some(token),
            &ack,
        ))]
    });
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    let error = session.rename("Sleeve", COMMAND_TIMEOUT).await.unwrap_err();
    assert!(matches!(error, CommandError::Rejected { kind, .. } if kind == kinds::RENAME));
    assert!(session.is_valid());
    assert_eq!(tag.identity().display_name(), "Jacket");

    let written = transport.written_frames();
    let request: RenameRequest = written[0].decode_payload().unwrap();
    assert_eq!(request.name, "Sleeve");
}

// ==================== Notifications ====================

#[tokio::test]
async fn test_subscribers_of_one_kind_share_payloads() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    let mut first = session.subscribe(kinds::GESTURE).unwrap();
    let mut second = session.subscribe(kinds::GESTURE).unwrap();
    assert_eq!(tag.subscriber_count(), 2);

    transport.push_frame(&gesture(Gesture::DoubleTap, 100));

    let a = timeout(WAIT, first.next()).await.unwrap().unwrap();
    let b = timeout(WAIT, second.next()).await.unwrap().unwrap();
    assert_eq!(a.payload, b.payload);
    assert_eq!(a.payload.as_ptr(), b.payload.as_ptr());
    assert_eq!(a.decode::<GestureEvent>().unwrap().gesture(), Gesture::DoubleTap);
    assert_eq!(tag.metrics().notifications_delivered, 2);
}

#[tokio::test]
async fn test_notification_kinds_are_isolated() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    let mut gestures = session.subscribe(kinds::GESTURE).unwrap();
    let mut attaches = session.subscribe(kinds::ATTACH).unwrap();

    transport.push_frame(&gesture(Gesture::BrushIn, 1));
    transport.push_frame(&attach(true));
    transport.push_frame(&gesture(Gesture::BrushOut, 2));

    assert_eq!(next_gesture(&mut gestures).await.uptime_ms, 1);
    assert_eq!(next_gesture(&mut gestures).await.uptime_ms, 2);

    let notification = timeout(WAIT, attaches.next()).await.unwrap().unwrap();
    assert_eq!(notification.kind, kinds::ATTACH);
    assert!(notification.decode::<AttachEvent>().unwrap().attached);
    assert!(attaches.next().now_or_never().is_none());
}

#[tokio::test]
async fn test_unsubscribe_during_delivery() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    let mut leaving = session.subscribe(kinds::GESTURE).unwrap();
    let mut staying = session.subscribe(kinds::GESTURE).unwrap();

    transport.push_frame(&gesture(Gesture::Cover, 1));
    assert_eq!(next_gesture(&mut leaving).await.uptime_ms, 1);

    // A second notification is already queued when the subscriber leaves.
    transport.push_frame(&gesture(Gesture::Cover, 2));
    wait_until(|| tag.metrics().frames_received == 2).await;
    leaving.unsubscribe();

    assert!(leaving.next().await.is_none());
    assert!(!leaving.is_active());
    assert_eq!(next_gesture(&mut staying).await.uptime_ms, 1);
    assert_eq!(next_gesture(&mut staying).await.uptime_ms, 2);
    assert_eq!(tag.subscriber_count(), 1);

    assert!(session.unsubscribe(staying.handle()));
    assert!(!session.unsubscribe(staying.handle()));
    assert!(staying.next().await.is_none());
}

#[tokio::test]
async fn test_unsubscribed_notifications_are_counted() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;

    transport.push_frame(&attach(false));
    wait_until(|| tag.metrics().notifications_unrouted == 1).await;
    assert!(session.is_valid());
}

#[tokio::test]
async fn test_decode_errors_are_not_fatal() {
    let transport = Arc::new(MockTransport::new());
    let tag = Tag::new(identity(), transport.clone());
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;
    let mut gestures = session.subscribe(kinds::GESTURE).unwrap();

    // Unknown kind, then a payload that does not match the gesture schema.
    transport.push_frame(&Frame::notification(KindId(0x7777), vec![0x08, 0x01]));
    transport.push_frame(&Frame::notification(kinds::GESTURE, vec![0xff]));
    transport.push_frame(&gesture(Gesture::Scratch, 3));

    assert_eq!(next_gesture(&mut gestures).await.uptime_ms, 3);
    assert!(session.is_valid());
    assert_eq!(tag.metrics().decode_errors, 2);
    assert_eq!(tag.metrics().frames_received, 3);
}

#[tokio::test]
async fn test_overflow_drops_newest() {
    let transport = Arc::new(MockTransport::new());
    let mut config = EngineConfig::default();
    config.notification_buffer = 2;
    let tag = Tag::builder(identity(), transport.clone())
        .config(config)
        .build();
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;
    let mut gestures = session.subscribe(kinds::GESTURE).unwrap();

    for uptime in 1..=5 {
        transport.push_frame(&gesture(Gesture::DoubleTap, uptime));
    }
    wait_until(|| tag.metrics().frames_received == 5).await;

    assert_eq!(next_gesture(&mut gestures).await.uptime_ms, 1);
    assert_eq!(next_gesture(&mut gestures).await.uptime_ms, 2);
    assert!(gestures.next().now_or_never().is_none());
    assert!(gestures.is_active());
    assert_eq!(tag.metrics().notifications_overflowed, 3);
}

#[tokio::test]
async fn test_overflow_unsubscribes() {
    let transport = Arc::new(MockTransport::new());
    let mut config = EngineConfig::default();
    config.notification_buffer = 1;
    config.overflow = OverflowPolicy::Unsubscribe;
    let tag = Tag::builder(identity(), transport.clone())
        .config(config)
        .build();
    let mut events = tag.connect().await.unwrap();
    let session = expect_connected(&mut events).await;
    let mut gestures = session.subscribe(kinds::GESTURE).unwrap();

    transport.push_frame(&gesture(Gesture::DoubleTap, 1));
    transport.push_frame(&gesture(Gesture::DoubleTap, 2));
    wait_until(|| tag.metrics().notifications_overflowed == 1).await;

    assert!(!gestures.is_active());
    assert!(gestures.next().await.is_none());
    assert_eq!(tag.subscriber_count(), 0);
}

// ==================== Registry and manager ====================

#[tokio::test]
async fn test_registry_updated_on_connect() {
    let registry = Arc::new(MemoryRegistry::new());
    let tag = Tag::builder(identity(), Arc::new(MockTransport::new()))
        .registry(registry.clone())
        .build();
    assert!(!registry.is_known(IDENTIFIER).unwrap());

    let mut events = tag.connect().await.unwrap();
    expect_connected(&mut events).await;

    let stored = registry.get(IDENTIFIER).unwrap().unwrap();
    assert_eq!(stored.display_name(), "Jacket");
    assert_eq!(stored.pairing_code(), None);
}

#[tokio::test]
async fn test_manager_keeps_tags_independent() {
    let registry = Arc::new(MemoryRegistry::new());
    let first = Arc::new(MockTransport::new());
    let second = Arc::new(MockTransport::new());
    let transports = {
        let first = first.clone();
        let second = second.clone();
        move |identity: &TagIdentity| -> Arc<dyn Transport> {
            let transport = if identity.identifier() == IDENTIFIER {
                &first
            } else {
                &second
            };
            transport.clone()
        }
    };
    let manager = TagManager::new(Arc::new(transports), registry.clone());

    let other = TagIdentity::new("AA:BB:CC:DD:EE:02", "Glove").unwrap();
    let mut first_events = manager.connect(&identity()).await.unwrap();
    let mut second_events = manager.connect(&other).await.unwrap();
    let first_session = expect_connected(&mut first_events).await;
    let second_session = expect_connected(&mut second_events).await;
    assert_eq!(manager.connected_count().await, 2);

    first.drop_link(DisconnectReason::LinkLost);
    expect_disconnected(&mut first_events).await;

    assert!(!first_session.is_valid());
    assert!(second_session.is_valid());
    assert_eq!(manager.connected_count().await, 1);
    assert_eq!(registry.all().unwrap().len(), 2);

    manager.disconnect_all().await;
    assert_eq!(manager.connected_count().await, 0);
}

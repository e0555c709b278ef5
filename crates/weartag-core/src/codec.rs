//! Frame codec.
//!
//! Wire format: a protobuf varint length delimiter followed by an
//! [`Envelope`]. Encoding and decoding are pure; the [`FrameAssembler`]
//! only buffers fragments until a whole frame is present.
//!
//! Decode failures never take a session down: the caller logs and counts
//! them and drops the frame.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use prost::Message;

use weartag_types::KindId;

use crate::error::DecodeError;
use crate::protocol::{Envelope, KindRegistry};

/// Default upper bound for one frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// Longest varint the length prefix may use.
const MAX_VARINT_LEN: usize = 10;

/// One decoded protocol unit.
///
/// The payload is immutable and reference counted: cloning a frame for
/// several subscribers shares one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Present only on command-response frames.
    pub correlation_token: Option<u32>,
    /// Message kind.
    pub kind: KindId,
    /// Encoded message body.
    pub payload: Bytes,
}

impl Frame {
    /// Unsolicited frame (no token).
    pub fn notification(kind: KindId, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_token: None,
            kind,
            payload: payload.into(),
        }
    }

    /// Frame answering the command with `token`.
    pub fn response(token: u32, kind: KindId, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_token: Some(token),
            kind,
            payload: payload.into(),
        }
    }

    /// Build a frame from a protobuf message.
    pub fn from_message<M: Message>(kind: KindId, token: Option<u32>, message: &M) -> Self {
        Self {
            correlation_token: token,
            kind,
            payload: Bytes::from(message.encode_to_vec()),
        }
    }

    /// Decode the payload as `M`.
    pub fn decode_payload<M: Message + Default>(&self) -> Result<M, prost::DecodeError> {
        M::decode(self.payload.clone())
    }
}

/// Encode a frame into transport bytes.
pub fn encode(frame: &Frame) -> Bytes {
    let envelope = Envelope {
        correlation_token: frame.correlation_token,
        kind_id: frame.kind.get(),
        payload: frame.payload.clone(),
    };
    Bytes::from(envelope.encode_length_delimited_to_vec())
}

/// Encode a protobuf message as a complete frame.
pub fn encode_message<M: Message>(kind: KindId, token: Option<u32>, message: &M) -> Bytes {
    encode(&Frame::from_message(kind, token, message))
}

/// Decode one complete frame without consulting a kind table.
///
/// Checks the length prefix against `max_frame_len` and the envelope
/// structure only.
pub fn decode_unchecked(bytes: &[u8], max_frame_len: usize) -> Result<Frame, DecodeError> {
    let (declared, prefix_len) = match read_varint(bytes) {
        Varint::Value(value, len) => (value, len),
        Varint::Incomplete | Varint::Malformed => return Err(DecodeError::MalformedLength),
    };
    let declared = usize::try_from(declared).map_err(|_| DecodeError::MalformedLength)?;
    if declared > max_frame_len {
        return Err(DecodeError::FrameTooLarge {
            declared,
            max: max_frame_len,
        });
    }

    let body = &bytes[prefix_len..];
    if body.len() != declared {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    let envelope = Envelope::decode(body).map_err(|e| DecodeError::Envelope(e.to_string()))?;
    Ok(Frame {
        correlation_token: envelope.correlation_token,
        kind: KindId(envelope.kind_id),
        payload: envelope.payload,
    })
}

/// Codec bound to a kind table.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    kinds: Arc<KindRegistry>,
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Arc::new(KindRegistry::with_defaults()), DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Create a codec for the given kind table.
    pub fn new(kinds: Arc<KindRegistry>, max_frame_len: usize) -> Self {
        Self {
            kinds,
            max_frame_len,
        }
    }

    /// The kind table.
    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    /// Maximum accepted frame body length.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encode a frame.
    pub fn encode(&self, frame: &Frame) -> Bytes {
        encode(frame)
    }

    /// Decode and validate one complete frame.
    ///
    /// Rejects malformed lengths, unknown kinds and payloads that do not
    /// match the registered schema.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, DecodeError> {
        let frame = decode_unchecked(bytes, self.max_frame_len)?;
        self.kinds.validate(frame.kind, &frame.payload)?;
        Ok(frame)
    }

    /// A reassembly buffer sized for this codec.
    pub fn assembler(&self) -> FrameAssembler {
        FrameAssembler::new(self.max_frame_len)
    }
}

/// Splits a fragmented inbound byte stream into complete frames.
///
/// BLE notifications are bounded by the MTU, so a frame may span several
/// chunks and one chunk may carry several frames.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl FrameAssembler {
    /// Create an empty assembler.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Append a received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame (prefix included), if any.
    ///
    /// A malformed or oversized prefix cannot be resynchronised, so the
    /// whole buffer is discarded and the error returned once.
    pub fn next_frame(&mut self) -> Option<Result<Bytes, DecodeError>> {
        if self.buffer.is_empty() {
            return None;
        }

        let (declared, prefix_len) = match read_varint(&self.buffer) {
            Varint::Incomplete => return None,
            Varint::Malformed => {
                self.buffer.clear();
                return Some(Err(DecodeError::MalformedLength));
            }
            Varint::Value(value, len) => (value, len),
        };

        let declared = match usize::try_from(declared) {
            Ok(declared) if declared <= self.max_frame_len => declared,
            _ => {
                self.buffer.clear();
                return Some(Err(DecodeError::FrameTooLarge {
                    declared: usize::try_from(declared).unwrap_or(usize::MAX),
                    max: self.max_frame_len,
                }));
            }
        };

        let total = prefix_len + declared;
        if self.buffer.len() < total {
            return None;
        }
        Some(Ok(self.buffer.split_to(total).freeze()))
    }

    /// Drop buffered bytes (used when a link is re-established).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

enum Varint {
    Value(u64, usize),
    Incomplete,
    Malformed,
}

fn read_varint(bytes: &[u8]) -> Varint {
    let mut value: u64 = 0;
    let mut cursor = bytes;
    for index in 0..MAX_VARINT_LEN {
        if !cursor.has_remaining() {
            return Varint::Incomplete;
        }
        let byte = cursor.get_u8();
        value |= u64::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Varint::Value(value, index + 1);
        }
    }
    Varint::Malformed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BatteryStatus, GestureEvent, Gesture, kinds};
    use proptest::prelude::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    #[test]
    fn test_round_trip_with_token() {
        let status = BatteryStatus {
            level: 87,
            charging: true,
        };
        let bytes = encode_message(kinds::BATTERY_STATUS, Some(42), &status);
        let frame = codec().decode(&bytes).unwrap();
        assert_eq!(frame.correlation_token, Some(42));
        assert_eq!(frame.kind, kinds::BATTERY_STATUS);
        assert_eq!(frame.decode_payload::<BatteryStatus>().unwrap(), status);
    }

    #[test]
    fn test_notification_has_no_token() {
        let gesture = GestureEvent {
            gesture: Gesture::DoubleTap as i32,
            uptime_ms: 1200,
        };
        let frame = codec()
            .decode(&encode_message(kinds::GESTURE, None, &gesture))
            .unwrap();
        assert_eq!(frame.correlation_token, None);
        assert_eq!(frame.decode_payload::<GestureEvent>().unwrap().gesture(), Gesture::DoubleTap);
    }

    #[test]
    fn test_token_zero_is_preserved() {
        let bytes = encode(&Frame::response(0, kinds::ACK, Bytes::new()));
        assert_eq!(codec().decode(&bytes).unwrap().correlation_token, Some(0));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let bytes = encode(&Frame::notification(KindId(0x9999), Bytes::new()));
        assert_eq!(
            codec().decode(&bytes),
            Err(DecodeError::UnknownKind(KindId(0x9999)))
        );
        assert!(decode_unchecked(&bytes, DEFAULT_MAX_FRAME_LEN).is_ok());
    }

    #[test]
    fn test_length_mismatch() {
        let mut bytes = encode(&Frame::notification(kinds::GESTURE, Bytes::new())).to_vec();
        bytes.push(0x00);
        assert!(matches!(
            codec().decode(&bytes),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let small = FrameCodec::new(Arc::new(KindRegistry::with_defaults()), 4);
        let bytes = encode(&Frame::notification(kinds::ATTACH, vec![0x08, 0x01, 0x10, 0x05]));
        assert!(matches!(small.decode(&bytes), Err(DecodeError::FrameTooLarge { max: 4, .. })));
    }

    #[test]
    fn test_empty_input_is_malformed() {
        assert_eq!(codec().decode(&[]), Err(DecodeError::MalformedLength));
    }

    #[test]
    fn test_assembler_joins_fragments() {
        let status = BatteryStatus {
            level: 50,
            charging: false,
        };
        let bytes = encode_message(kinds::BATTERY_STATUS, Some(7), &status);
        let (head, tail) = bytes.split_at(2);

        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_LEN);
        assembler.push(head);
        assert!(assembler.next_frame().is_none());
        assembler.push(tail);
        let whole = assembler.next_frame().unwrap().unwrap();
        assert_eq!(whole, bytes);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_assembler_splits_coalesced_chunk() {
        let a = encode(&Frame::notification(kinds::GESTURE, Bytes::new()));
        let b = encode(&Frame::response(3, kinds::ACK, Bytes::new()));
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_LEN);
        assembler.push(&[a.as_ref(), b.as_ref()].concat());

        assert_eq!(assembler.next_frame().unwrap().unwrap(), a);
        assert_eq!(assembler.next_frame().unwrap().unwrap(), b);
        assert!(assembler.next_frame().is_none());
    }

    #[test]
    fn test_assembler_discards_on_oversized_prefix() {
        let mut assembler = FrameAssembler::new(16);
        // Varint 300.
        assembler.push(&[0xAC, 0x02, 0x01, 0x02]);
        assert!(matches!(
            assembler.next_frame(),
            Some(Err(DecodeError::FrameTooLarge { declared: 300, max: 16 }))
        ));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_assembler_discards_on_malformed_prefix() {
        let mut assembler = FrameAssembler::new(DEFAULT_MAX_FRAME_LEN);
        assembler.push(&[0xFF; 12]);
        assert_eq!(assembler.next_frame(), Some(Err(DecodeError::MalformedLength)));
        assert!(assembler.next_frame().is_none());
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            kind in any::<u32>(),
            token in proptest::option::of(any::<u32>()),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let kind = KindId(kind);
            let codec = FrameCodec::new(
                Arc::new(KindRegistry::new().with_opaque(kind, "opaque")),
                DEFAULT_MAX_FRAME_LEN,
            );
            let frame = Frame { correlation_token: token, kind, payload: Bytes::from(payload) };
            let decoded = codec.decode(&codec.encode(&frame)).unwrap();
            prop_assert_eq!(decoded, frame);
        }
    }
}

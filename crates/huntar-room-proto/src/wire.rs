// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Framed CBOR packets exchanged between devices and the room hub.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR `OpEnvelope { op, ts, payload }`
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use ciborium::value::Value;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::{FieldValue, HuntNotification, RoomCode, RoomField, RoomRecord};

/// Protocol magic constant "HUNT".
pub const MAGIC: [u8; 4] = [0x48, 0x55, 0x4e, 0x54];
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (set to zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Bytes before the payload.
pub const HEADER_LEN: usize = 12;
/// Bytes after the payload.
pub const CHECKSUM_LEN: usize = 32;
/// Largest payload either side accepts.
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Correlates a request with its reply.
pub type RequestId = u64;

/// Framing and encoding failures.
#[derive(Debug, Error)]
pub enum WireError {
    /// Fewer bytes than the header or declared payload needs.
    #[error("incomplete packet")]
    Incomplete,
    /// Leading bytes are not [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Unknown protocol version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// Declared payload exceeds [`MAX_PAYLOAD`].
    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),
    /// blake3 checksum did not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Envelope named an op this version does not know.
    #[error("unknown op {0}")]
    UnknownOp(String),
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Envelope carried as the payload of a packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Operation name (e.g., "handshake", "cas_counter", "room_changed").
    pub op: String,
    /// Logical timestamp (monotonic per hub).
    pub ts: u64,
    /// Operation-specific body.
    pub payload: P,
}

/// Handshake request payload (device → hub).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Optional agent identifier.
    pub agent_id: Option<String>,
    /// Implementation version (not wire version).
    pub client_version: u32,
}

/// Handshake acknowledgement payload (hub → device).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeAckPayload {
    /// Hub implementation version.
    pub server_version: u32,
    /// Connection identifier assigned by the hub.
    pub connection_id: u64,
}

/// Error reply. `req` is set when the error answers a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Request being answered, if any.
    pub req: Option<RequestId>,
    /// Numeric error code.
    pub code: u32,
    /// Stable identifier (e.g., "E_BAD_FIELD").
    pub name: String,
    /// Human readable message.
    pub message: String,
}

/// Bare request carrying only its id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestPayload {
    /// Request id.
    pub req: RequestId,
}

/// Current room counter value and the version it was read at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterValuePayload {
    /// Request being answered.
    pub req: RequestId,
    /// Last allocated code; `None` before the first allocation.
    pub value: Option<u64>,
    /// Version of the counter record.
    pub version: u64,
}

/// Conditional counter write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CasCounterPayload {
    /// Request id.
    pub req: RequestId,
    /// Version the new value was computed from.
    pub expected_version: u64,
    /// Value to store.
    pub value: u64,
}

/// Outcome of a conditional counter write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterCommitPayload {
    /// Request being answered.
    pub req: RequestId,
    /// Whether the write was applied.
    pub committed: bool,
    /// Counter value after the attempt.
    pub value: Option<u64>,
    /// Counter version after the attempt.
    pub version: u64,
}

/// Single field write on a room record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteFieldPayload {
    /// Request id.
    pub req: RequestId,
    /// Room being written.
    pub room: RoomCode,
    /// Field being written.
    pub field: RoomField,
    /// New value.
    pub value: FieldValue,
}

/// Request naming a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomRequestPayload {
    /// Request id.
    pub req: RequestId,
    /// Room of interest.
    pub room: RoomCode,
}

/// Reply to `read_room`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomSnapshotPayload {
    /// Request being answered.
    pub req: RequestId,
    /// Room that was read.
    pub room: RoomCode,
    /// Record, if the room exists.
    pub record: Option<RoomRecord>,
}

/// One room in a listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomEntry {
    /// Room code.
    pub room: RoomCode,
    /// Current record.
    pub record: RoomRecord,
}

/// Reply to `list_rooms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomListPayload {
    /// Request being answered.
    pub req: RequestId,
    /// Every known room, ascending by code.
    pub rooms: Vec<RoomEntry>,
}

/// Start or stop watching a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchPayload {
    /// Room to (un)watch.
    pub room: RoomCode,
}

/// Room change pushed to watchers (hub → device).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomChangedPayload {
    /// Room that changed.
    pub room: RoomCode,
    /// Full record after the change.
    pub record: RoomRecord,
}

/// Topic subscription request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicPayload {
    /// Topic name.
    pub topic: String,
}

/// Publish a planted-treasure notification to a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishTopicPayload {
    /// Request id.
    pub req: RequestId,
    /// Topic name.
    pub topic: String,
    /// Notification body.
    pub notification: HuntNotification,
}

/// Fan-out of a published notification (hub → subscribers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicMessagePayload {
    /// Topic the notification was published on.
    pub topic: String,
    /// Notification body.
    pub notification: HuntNotification,
}

/// Wire message kinds carried inside OpEnvelope payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake request (op = "handshake").
    Handshake(HandshakePayload),
    /// Handshake acknowledgement (op = "handshake_ack").
    HandshakeAck(HandshakeAckPayload),
    /// Protocol or processing error (op = "error").
    Error(ErrorPayload),
    /// Read the room counter (op = "read_counter").
    ReadCounter(RequestPayload),
    /// Counter value reply (op = "counter_value").
    CounterValue(CounterValuePayload),
    /// Conditional counter write (op = "cas_counter").
    CasCounter(CasCounterPayload),
    /// Conditional write reply (op = "counter_commit").
    CounterCommit(CounterCommitPayload),
    /// Write one room field (op = "write_field").
    WriteField(WriteFieldPayload),
    /// Acknowledges a write or publish (op = "write_ack").
    WriteAck(RequestPayload),
    /// Read one room (op = "read_room").
    ReadRoom(RoomRequestPayload),
    /// Room read reply (op = "room_snapshot").
    RoomSnapshot(RoomSnapshotPayload),
    /// List all rooms (op = "list_rooms").
    ListRooms(RequestPayload),
    /// Room listing reply (op = "room_list").
    RoomList(RoomListPayload),
    /// Start watching a room (op = "watch_room").
    WatchRoom(WatchPayload),
    /// Stop watching a room (op = "unwatch_room").
    UnwatchRoom(WatchPayload),
    /// Pushed room change (op = "room_changed").
    RoomChanged(RoomChangedPayload),
    /// Subscribe to a topic (op = "subscribe_topic").
    SubscribeTopic(TopicPayload),
    /// Publish to a topic (op = "publish_topic").
    PublishTopic(PublishTopicPayload),
    /// Topic fan-out (op = "topic_message").
    TopicMessage(TopicMessagePayload),
}

impl Message {
    /// Canonical op string for this message variant.
    pub fn op_name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeAck(_) => "handshake_ack",
            Message::Error(_) => "error",
            Message::ReadCounter(_) => "read_counter",
            Message::CounterValue(_) => "counter_value",
            Message::CasCounter(_) => "cas_counter",
            Message::CounterCommit(_) => "counter_commit",
            Message::WriteField(_) => "write_field",
            Message::WriteAck(_) => "write_ack",
            Message::ReadRoom(_) => "read_room",
            Message::RoomSnapshot(_) => "room_snapshot",
            Message::ListRooms(_) => "list_rooms",
            Message::RoomList(_) => "room_list",
            Message::WatchRoom(_) => "watch_room",
            Message::UnwatchRoom(_) => "unwatch_room",
            Message::RoomChanged(_) => "room_changed",
            Message::SubscribeTopic(_) => "subscribe_topic",
            Message::PublishTopic(_) => "publish_topic",
            Message::TopicMessage(_) => "topic_message",
        }
    }

    /// Request id this message answers or carries, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Message::Error(p) => p.req,
            Message::ReadCounter(p) | Message::WriteAck(p) | Message::ListRooms(p) => Some(p.req),
            Message::CounterValue(p) => Some(p.req),
            Message::CasCounter(p) => Some(p.req),
            Message::CounterCommit(p) => Some(p.req),
            Message::WriteField(p) => Some(p.req),
            Message::ReadRoom(p) => Some(p.req),
            Message::RoomSnapshot(p) => Some(p.req),
            Message::RoomList(p) => Some(p.req),
            Message::PublishTopic(p) => Some(p.req),
            Message::Handshake(_)
            | Message::HandshakeAck(_)
            | Message::WatchRoom(_)
            | Message::UnwatchRoom(_)
            | Message::RoomChanged(_)
            | Message::SubscribeTopic(_)
            | Message::TopicMessage(_) => None,
        }
    }
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header (12 bytes).
    pub header: [u8; HEADER_LEN],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Packet {
    /// Build a packet from a CBOR payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&payload);
        let checksum = *hasher.finalize().as_bytes();

        Ok(Packet {
            header,
            payload,
            checksum,
        })
    }

    /// Concatenate header, payload and checksum.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }
}

/// Validate a header and return the total packet length it announces.
///
/// Readers use this to know how many bytes to buffer before decoding.
pub fn frame_len(header: &[u8]) -> Result<usize, WireError> {
    if header.len() < HEADER_LEN {
        return Err(WireError::Incomplete);
    }
    if header[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(len));
    }
    Ok(HEADER_LEN + len + CHECKSUM_LEN)
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value, WireError> {
    Value::serialized(payload).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, WireError> {
    value
        .deserialized()
        .map_err(|e| WireError::Decode(e.to_string()))
}

/// Encode a `Message` into packet bytes with the provided logical timestamp.
pub fn encode_message(msg: &Message, ts: u64) -> Result<Vec<u8>, WireError> {
    let payload = match msg {
        Message::Handshake(p) => to_value(p)?,
        Message::HandshakeAck(p) => to_value(p)?,
        Message::Error(p) => to_value(p)?,
        Message::ReadCounter(p) | Message::WriteAck(p) | Message::ListRooms(p) => to_value(p)?,
        Message::CounterValue(p) => to_value(p)?,
        Message::CasCounter(p) => to_value(p)?,
        Message::CounterCommit(p) => to_value(p)?,
        Message::WriteField(p) => to_value(p)?,
        Message::ReadRoom(p) => to_value(p)?,
        Message::RoomSnapshot(p) => to_value(p)?,
        Message::RoomList(p) => to_value(p)?,
        Message::WatchRoom(p) | Message::UnwatchRoom(p) => to_value(p)?,
        Message::RoomChanged(p) => to_value(p)?,
        Message::SubscribeTopic(p) => to_value(p)?,
        Message::PublishTopic(p) => to_value(p)?,
        Message::TopicMessage(p) => to_value(p)?,
    };
    let env = OpEnvelope {
        op: msg.op_name().to_string(),
        ts,
        payload,
    };
    let mut bytes = Vec::new();
    ciborium::into_writer(&env, &mut bytes).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(Packet::from_payload(bytes)?.into_bytes())
}

/// Decode bytes into (Message, ts, bytes_consumed).
pub fn decode_message(bytes: &[u8]) -> Result<(Message, u64, usize), WireError> {
    let total = frame_len(bytes)?;
    if bytes.len() < total {
        return Err(WireError::Incomplete);
    }
    let header = &bytes[0..HEADER_LEN];
    let payload = &bytes[HEADER_LEN..total - CHECKSUM_LEN];
    let checksum = &bytes[total - CHECKSUM_LEN..total];

    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    if hasher.finalize().as_bytes() != checksum {
        return Err(WireError::ChecksumMismatch);
    }

    let env: OpEnvelope<Value> =
        ciborium::from_reader(payload).map_err(|e| WireError::Decode(e.to_string()))?;
    let p = &env.payload;
    let msg = match env.op.as_str() {
        "handshake" => Message::Handshake(from_value(p)?),
        "handshake_ack" => Message::HandshakeAck(from_value(p)?),
        "error" => Message::Error(from_value(p)?),
        "read_counter" => Message::ReadCounter(from_value(p)?),
        "counter_value" => Message::CounterValue(from_value(p)?),
        "cas_counter" => Message::CasCounter(from_value(p)?),
        "counter_commit" => Message::CounterCommit(from_value(p)?),
        "write_field" => Message::WriteField(from_value(p)?),
        "write_ack" => Message::WriteAck(from_value(p)?),
        "read_room" => Message::ReadRoom(from_value(p)?),
        "room_snapshot" => Message::RoomSnapshot(from_value(p)?),
        "list_rooms" => Message::ListRooms(from_value(p)?),
        "room_list" => Message::RoomList(from_value(p)?),
        "watch_room" => Message::WatchRoom(from_value(p)?),
        "unwatch_room" => Message::UnwatchRoom(from_value(p)?),
        "room_changed" => Message::RoomChanged(from_value(p)?),
        "subscribe_topic" => Message::SubscribeTopic(from_value(p)?),
        "publish_topic" => Message::PublishTopic(from_value(p)?),
        "topic_message" => Message::TopicMessage(from_value(p)?),
        other => return Err(WireError::UnknownOp(other.to_string())),
    };
    Ok((msg, env.ts, total))
}

// --- Unit tests -----------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::CloudAnchorId;

    fn room(code: u64) -> RoomCode {
        RoomCode::new(code).unwrap()
    }

    #[test]
    fn write_field_survives_the_wire() {
        let msg = Message::WriteField(WriteFieldPayload {
            req: 9,
            room: room(3),
            field: RoomField::Latitude,
            value: FieldValue::Real(51.5),
        });
        let bytes = encode_message(&msg, 17).unwrap();
        let (decoded, ts, used) = decode_message(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(ts, 17);
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.request_id(), Some(9));
    }

    #[test]
    fn topic_message_carries_the_notification() {
        let notification = HuntNotification::planted(
            room(12),
            CloudAnchorId::new("ua-abc").unwrap(),
            1_000,
        );
        let msg = Message::TopicMessage(TopicMessagePayload {
            topic: "treasure-hunt".into(),
            notification: notification.clone(),
        });
        let (decoded, _, _) = decode_message(&encode_message(&msg, 0).unwrap()).unwrap();
        match decoded {
            Message::TopicMessage(p) => assert_eq!(p.notification, notification),
            other => panic!("expected topic message, got {:?}", other),
        }
    }

    #[test]
    fn decode_reports_consumed_bytes_with_trailing_data() {
        let first =
            encode_message(&Message::WatchRoom(WatchPayload { room: room(42) }), 1).unwrap();
        let second =
            encode_message(&Message::UnwatchRoom(WatchPayload { room: room(42) }), 2).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let (msg, _, used) = decode_message(&stream).unwrap();
        assert_eq!(msg.op_name(), "watch_room");
        assert_eq!(used, first.len());
        let (msg, ts, _) = decode_message(&stream[used..]).unwrap();
        assert_eq!(msg.op_name(), "unwatch_room");
        assert_eq!(ts, 2);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut bytes = encode_message(
            &Message::ReadCounter(RequestPayload { req: 1 }),
            0,
        )
        .unwrap();
        bytes[HEADER_LEN] ^= 0xff;
        assert!(matches!(decode_message(&bytes), Err(WireError::ChecksumMismatch)));
    }

    #[test]
    fn header_checks_magic_and_size() {
        let bytes = encode_message(&Message::ListRooms(RequestPayload { req: 4 }), 0).unwrap();
        assert_eq!(frame_len(&bytes).unwrap(), bytes.len());
        assert!(matches!(frame_len(&bytes[..5]), Err(WireError::Incomplete)));

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(frame_len(&bad), Err(WireError::BadMagic)));

        let mut huge = bytes;
        huge[8..12].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
        assert!(matches!(frame_len(&huge), Err(WireError::PayloadTooLarge(_))));
    }

    #[test]
    fn zero_room_code_is_rejected_on_decode() {
        // Hand-build an envelope with room = 0 to bypass RoomCode::new.
        #[derive(Serialize)]
        struct RawWatch {
            room: u64,
        }
        let env = OpEnvelope {
            op: "watch_room".to_string(),
            ts: 0,
            payload: Value::serialized(&RawWatch { room: 0 }).unwrap(),
        };
        let mut payload = Vec::new();
        ciborium::into_writer(&env, &mut payload).unwrap();
        let bytes = Packet::from_payload(payload).unwrap().into_bytes();
        assert!(matches!(decode_message(&bytes), Err(WireError::Decode(_))));
    }
}

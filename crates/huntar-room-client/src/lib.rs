// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Device-side adapter for the room hub over Unix sockets (CBOR-framed).
//!
//! [`HubRoomStore`] implements [`RoomStore`] and [`TopicNotifier`], so an
//! `AnchorCoordinator` can host and resolve against a shared hub exactly as
//! it does against an in-process store. Requests block the calling thread
//! until the reply arrives or the request timeout passes. A background reader
//! thread routes replies; room events are delivered on a separate dispatch
//! thread so listeners may issue requests of their own.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use huntar_app_core::prefs::ClientPrefs;
use huntar_core::{
    CoordinatorOptions, CounterCommit, CounterSnapshot, NotifyError, RoomEvent, RoomListener,
    RoomStore, StoreError, TopicNotifier, WatchId,
};
use huntar_room_proto::wire::{
    decode_message, encode_message, frame_len, CasCounterPayload, ErrorPayload, HandshakePayload,
    Message, PublishTopicPayload, RequestId, RequestPayload, RoomRequestPayload, TopicPayload,
    WatchPayload, WriteFieldPayload, HEADER_LEN,
};
use huntar_room_proto::{FieldValue, HuntNotification, RoomCode, RoomField, RoomRecord};
use tracing::{debug, info, warn};

/// Hub error code for malformed or rejected requests.
const ERR_BAD_REQUEST: u32 = 400;
/// Implementation version sent in the handshake.
const CLIENT_VERSION: u32 = 1;

type Dispatch = (Vec<RoomListener>, RoomEvent);

#[derive(Default)]
struct RoomWatchers {
    listeners: BTreeMap<WatchId, RoomListener>,
    last: Option<RoomRecord>,
}

struct ClientState {
    open: bool,
    handshake: Option<Sender<Message>>,
    pending: HashMap<RequestId, Sender<Message>>,
    next_watch: u64,
    watch_index: HashMap<WatchId, RoomCode>,
    rooms: HashMap<RoomCode, RoomWatchers>,
    topics: HashMap<String, Vec<Sender<HuntNotification>>>,
}

struct Shared {
    writer: Mutex<UnixStream>,
    next_req: AtomicU64,
    state: Mutex<ClientState>,
    dispatch: Sender<Dispatch>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, msg: &Message) -> Result<(), StoreError> {
        let pkt = encode_message(msg, 0).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write_all(&pkt)
            .map_err(|err| {
                debug!(%err, op = msg.op_name(), "hub write failed");
                StoreError::Disconnected
            })
    }

    fn route(&self, msg: Message) {
        let mut state = self.state();
        match msg {
            Message::HandshakeAck(_) => {
                if let Some(tx) = state.handshake.take() {
                    let _ = tx.send(msg);
                }
            }
            Message::RoomChanged(changed) => {
                let Some(watchers) = state.rooms.get_mut(&changed.room) else {
                    debug!(room = %changed.room, "change for unwatched room");
                    return;
                };
                watchers.last = Some(changed.record.clone());
                let listeners = watchers.listeners.values().cloned().collect();
                // Sent under the state lock so replays keep their order.
                let _ = self
                    .dispatch
                    .send((listeners, RoomEvent::Snapshot(changed.record)));
            }
            Message::TopicMessage(message) => {
                if let Some(subscribers) = state.topics.get_mut(&message.topic) {
                    subscribers.retain(|tx| tx.send(message.notification.clone()).is_ok());
                }
            }
            Message::Error(ErrorPayload { req: None, ref name, ref message, .. }) => {
                warn!(%name, %message, "hub reported an error");
            }
            other => match other.request_id() {
                Some(req) => {
                    if let Some(tx) = state.pending.remove(&req) {
                        let _ = tx.send(other);
                    } else {
                        debug!(req, "reply for abandoned request");
                    }
                }
                None => debug!(op = other.op_name(), "ignoring unexpected op"),
            },
        }
    }

    fn close(&self, reason: &str) {
        let mut state = self.state();
        if !state.open {
            return;
        }
        state.open = false;
        state.handshake = None;
        // Dropping the senders wakes every waiting request.
        state.pending.clear();
        state.topics.clear();
        state.watch_index.clear();
        for (room, watchers) in state.rooms.drain() {
            debug!(%room, listeners = watchers.listeners.len(), "cancelling room watch");
            let listeners = watchers.listeners.into_values().collect();
            let _ = self
                .dispatch
                .send((listeners, RoomEvent::Cancelled(reason.to_string())));
        }
    }
}

fn read_frames(shared: &Shared, mut stream: UnixStream) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header).is_err() {
            break;
        }
        let total = match frame_len(&header) {
            Ok(total) => total,
            Err(err) => {
                warn!(%err, "bad frame header from hub");
                break;
            }
        };
        let mut packet = header.to_vec();
        packet.resize(total, 0);
        if stream.read_exact(&mut packet[HEADER_LEN..]).is_err() {
            break;
        }
        match decode_message(&packet) {
            Ok((msg, _ts, _)) => shared.route(msg),
            Err(err) => {
                warn!(%err, "failed to decode packet from hub");
                break;
            }
        }
    }
    shared.close("hub connection closed");
}

/// Map a hub error reply onto a store error.
fn reply_error(err: &ErrorPayload) -> StoreError {
    if err.code == ERR_BAD_REQUEST {
        StoreError::Rejected(err.message.clone())
    } else {
        StoreError::Backend(format!("{}: {}", err.name, err.message))
    }
}

fn unexpected(msg: &Message) -> StoreError {
    StoreError::Backend(format!("unexpected reply {}", msg.op_name()))
}

/// Room store and topic notifier backed by one hub connection.
pub struct HubRoomStore {
    shared: Arc<Shared>,
    timeout: Duration,
    connection_id: u64,
}

impl HubRoomStore {
    /// Connect to the hub at `path` and complete the handshake.
    ///
    /// `timeout` bounds the handshake and every later request.
    pub fn connect(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .with_context(|| format!("connecting to room hub at {}", path.display()))?;
        let reader = stream.try_clone()?;

        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Dispatch>();
        let (ack_tx, ack_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            writer: Mutex::new(stream),
            next_req: AtomicU64::new(1),
            state: Mutex::new(ClientState {
                open: true,
                handshake: Some(ack_tx),
                pending: HashMap::new(),
                next_watch: 0,
                watch_index: HashMap::new(),
                rooms: HashMap::new(),
                topics: HashMap::new(),
            }),
            dispatch: dispatch_tx,
        });

        thread::Builder::new()
            .name("huntar-room-dispatch".into())
            .spawn(move || {
                for (listeners, event) in dispatch_rx {
                    for listener in listeners {
                        listener(event.clone());
                    }
                }
            })?;
        let reader_shared = shared.clone();
        thread::Builder::new()
            .name("huntar-room-reader".into())
            .spawn(move || read_frames(&reader_shared, reader))?;

        let mut client = Self {
            shared,
            timeout,
            connection_id: 0,
        };
        // Dropping `client` on any error below shuts the socket down.
        client.shared.send(&Message::Handshake(HandshakePayload {
            agent_id: None,
            client_version: CLIENT_VERSION,
        }))?;
        client.connection_id = match ack_rx.recv_timeout(timeout) {
            Ok(Message::HandshakeAck(ack)) => ack.connection_id,
            Ok(other) => bail!("expected handshake_ack, got {}", other.op_name()),
            Err(_) => bail!("room hub at {} did not acknowledge the handshake", path.display()),
        };
        info!(
            connection_id = client.connection_id,
            socket = %path.display(),
            "connected to room hub"
        );
        Ok(client)
    }

    /// Connect using saved client preferences.
    pub fn from_prefs(prefs: &ClientPrefs) -> Result<Self> {
        Self::connect(
            &prefs.socket_path,
            Duration::from_millis(prefs.request_timeout_ms),
        )
    }

    /// Connection id the hub assigned.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// False once the hub connection has closed.
    pub fn is_connected(&self) -> bool {
        self.shared.state().open
    }

    /// Round-trip to the hub. Every message sent before this call has been
    /// processed by the hub once it returns.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.read_counter().map(|_| ())
    }

    /// Receive planted-treasure notifications published on `topic`.
    ///
    /// The receiver disconnects when the hub connection closes.
    pub fn subscribe_topic(&self, topic: &str) -> Result<Receiver<HuntNotification>, StoreError> {
        let (tx, rx) = mpsc::channel();
        let mut state = self.shared.state();
        if !state.open {
            return Err(StoreError::Disconnected);
        }
        let subscribers = state.topics.entry(topic.to_string()).or_default();
        subscribers.push(tx);
        if subscribers.len() == 1 {
            self.shared.send(&Message::SubscribeTopic(TopicPayload {
                topic: topic.to_string(),
            }))?;
        }
        Ok(rx)
    }

    fn request(&self, build: impl FnOnce(RequestId) -> Message) -> Result<Message, StoreError> {
        let req = self.shared.next_req.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.shared.state();
            if !state.open {
                return Err(StoreError::Disconnected);
            }
            state.pending.insert(req, tx);
        }
        if let Err(err) = self.shared.send(&build(req)) {
            self.shared.state().pending.remove(&req);
            return Err(err);
        }
        match rx.recv_timeout(self.timeout) {
            Ok(Message::Error(err)) => Err(reply_error(&err)),
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.shared.state().pending.remove(&req);
                warn!(req, timeout_ms = self.timeout.as_millis(), "hub request timed out");
                Err(StoreError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Disconnected),
        }
    }
}

impl Drop for HubRoomStore {
    fn drop(&mut self) {
        let _ = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown(Shutdown::Both);
    }
}

impl RoomStore for HubRoomStore {
    fn read_counter(&self) -> Result<CounterSnapshot, StoreError> {
        match self.request(|req| Message::ReadCounter(RequestPayload { req }))? {
            Message::CounterValue(v) => Ok(CounterSnapshot {
                value: v.value,
                version: v.version,
            }),
            other => Err(unexpected(&other)),
        }
    }

    fn compare_and_set_counter(
        &self,
        expected_version: u64,
        value: u64,
    ) -> Result<CounterCommit, StoreError> {
        let reply = self.request(|req| {
            Message::CasCounter(CasCounterPayload {
                req,
                expected_version,
                value,
            })
        })?;
        match reply {
            Message::CounterCommit(c) if c.committed => Ok(CounterCommit::Committed {
                value: c.value.unwrap_or(value),
                version: c.version,
            }),
            Message::CounterCommit(_) => Ok(CounterCommit::Conflict),
            other => Err(unexpected(&other)),
        }
    }

    fn write_field(
        &self,
        room: RoomCode,
        field: RoomField,
        value: FieldValue,
    ) -> Result<(), StoreError> {
        match self.request(|req| {
            Message::WriteField(WriteFieldPayload {
                req,
                room,
                field,
                value,
            })
        })? {
            Message::WriteAck(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn read_room(&self, room: RoomCode) -> Result<Option<RoomRecord>, StoreError> {
        match self.request(|req| Message::ReadRoom(RoomRequestPayload { req, room }))? {
            Message::RoomSnapshot(snapshot) => Ok(snapshot.record),
            other => Err(unexpected(&other)),
        }
    }

    fn list_rooms(&self) -> Result<Vec<(RoomCode, RoomRecord)>, StoreError> {
        match self.request(|req| Message::ListRooms(RequestPayload { req }))? {
            Message::RoomList(list) => Ok(list
                .rooms
                .into_iter()
                .map(|entry| (entry.room, entry.record))
                .collect()),
            other => Err(unexpected(&other)),
        }
    }

    fn watch_room(&self, room: RoomCode, listener: RoomListener) -> Result<WatchId, StoreError> {
        let mut state = self.shared.state();
        if !state.open {
            return Err(StoreError::Disconnected);
        }
        state.next_watch += 1;
        let id = WatchId(state.next_watch);
        let watchers = state.rooms.entry(room).or_default();
        let first = watchers.listeners.is_empty();
        watchers.listeners.insert(id, listener.clone());
        if let Some(record) = watchers.last.clone() {
            let _ = self
                .shared
                .dispatch
                .send((vec![listener], RoomEvent::Snapshot(record)));
        }
        if first {
            // The hub pushes the current record, if any, as the first change.
            if let Err(err) = self.shared.send(&Message::WatchRoom(WatchPayload { room })) {
                state.rooms.remove(&room);
                return Err(err);
            }
        }
        state.watch_index.insert(id, room);
        debug!(%room, watch = id.0, first, "room watch attached");
        Ok(id)
    }

    fn unwatch_room(&self, watch: WatchId) -> Result<(), StoreError> {
        let mut state = self.shared.state();
        let Some(room) = state.watch_index.remove(&watch) else {
            return Ok(());
        };
        let now_empty = state.rooms.get_mut(&room).is_some_and(|watchers| {
            watchers.listeners.remove(&watch);
            watchers.listeners.is_empty()
        });
        if now_empty {
            state.rooms.remove(&room);
            self.shared
                .send(&Message::UnwatchRoom(WatchPayload { room }))?;
        }
        Ok(())
    }
}

impl TopicNotifier for HubRoomStore {
    fn publish(&self, topic: &str, notification: &HuntNotification) -> Result<(), NotifyError> {
        let reply = self.request(|req| {
            Message::PublishTopic(PublishTopicPayload {
                req,
                topic: topic.to_string(),
                notification: notification.clone(),
            })
        })?;
        match reply {
            Message::WriteAck(_) => Ok(()),
            other => Err(unexpected(&other).into()),
        }
    }
}

/// Coordinator tunables taken from saved client preferences.
pub fn coordinator_options(prefs: &ClientPrefs) -> CoordinatorOptions {
    CoordinatorOptions {
        topic: prefs.notification_topic.clone(),
        counter_attempts: prefs.counter_attempts,
        display_name: prefs.display_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn bad_request_replies_become_rejections() {
        let err = ErrorPayload {
            req: Some(1),
            code: ERR_BAD_REQUEST,
            name: "bad_request".into(),
            message: "field updated_at expects a number".into(),
        };
        assert_eq!(
            reply_error(&err),
            StoreError::Rejected("field updated_at expects a number".into())
        );
        let err = ErrorPayload {
            code: 500,
            name: "store_error".into(),
            ..err
        };
        assert!(matches!(reply_error(&err), StoreError::Backend(_)));
    }

    #[test]
    fn prefs_feed_coordinator_options() {
        let prefs = ClientPrefs {
            notification_topic: "local-hunt".into(),
            counter_attempts: 3,
            ..ClientPrefs::default()
        };
        let options = coordinator_options(&prefs);
        assert_eq!(options.topic, "local-hunt");
        assert_eq!(options.counter_attempts, 3);
        assert_eq!(options.display_name, prefs.display_name);
    }
}

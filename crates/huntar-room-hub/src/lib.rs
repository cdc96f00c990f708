// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unix-socket CBOR room hub.
//!
//! Devices connect, handshake, and then use the hub as their realtime room
//! store: counter transactions, field writes, room reads, room watches and
//! topic fan-out. State lives in one in-memory [`MemoryRoomStore`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use huntar_core::{
    CounterCommit, MemoryRoomStore, RoomEvent, RoomListener, RoomStore, StoreError, WatchId,
};
use huntar_room_proto::wire::{
    decode_message, encode_message, frame_len, CounterCommitPayload, CounterValuePayload,
    ErrorPayload, HandshakeAckPayload, Message, RequestId, RequestPayload, RoomChangedPayload,
    RoomEntry, RoomListPayload, RoomSnapshotPayload, TopicMessagePayload, WireError, HEADER_LEN,
    VERSION,
};
use huntar_room_proto::RoomCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

/// Error code for malformed or rejected requests.
pub const ERR_BAD_REQUEST: u32 = 400;
/// Error code for store failures.
pub const ERR_STORE: u32 = 500;

const OUTBOX_DEPTH: usize = 256;

type Outbox = mpsc::Sender<Vec<u8>>;

/// Stamps outgoing packets with the hub's logical clock.
///
/// Stamping and enqueueing happen under one lock, so every connection sees
/// strictly increasing timestamps.
#[derive(Clone, Default)]
struct Clock(Arc<std::sync::Mutex<u64>>);

impl Clock {
    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue without waiting. `Ok(false)` when the outbox is full or closed.
    fn try_push(&self, tx: &Outbox, msg: &Message) -> Result<bool, WireError> {
        let mut next = self.lock();
        let pkt = encode_message(msg, *next)?;
        *next += 1;
        Ok(tx.try_send(pkt).is_ok())
    }

    fn push(&self, permit: mpsc::Permit<'_, Vec<u8>>, msg: &Message) -> Result<(), WireError> {
        let mut next = self.lock();
        let pkt = encode_message(msg, *next)?;
        *next += 1;
        permit.send(pkt);
        Ok(())
    }
}

struct ConnState {
    watches: HashMap<RoomCode, WatchId>,
    topics: HashSet<String>,
    tx: Outbox,
    // Signalled when the connection fell too far behind on room changes.
    evict: Arc<Notify>,
}

/// Why a connection's read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    /// End of stream or an undecodable frame.
    Client,
    /// The outbox overflowed while forwarding room changes.
    Evicted,
}

/// Everything the hub knows: the room store and the live connections.
#[derive(Default)]
pub struct HubState {
    next_conn_id: u64,
    clock: Clock,
    store: Arc<MemoryRoomStore>,
    conns: HashMap<u64, ConnState>,
}

/// Hub state shared by connection tasks.
pub type SharedHub = Arc<Mutex<HubState>>;

impl HubState {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub serving an existing store.
    pub fn with_store(store: Arc<MemoryRoomStore>) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// Wrap into a [`SharedHub`].
    pub fn shared(self) -> SharedHub {
        Arc::new(Mutex::new(self))
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<MemoryRoomStore> {
        &self.store
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn register(&mut self, tx: Outbox) -> (u64, Arc<Notify>) {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let evict = Arc::new(Notify::new());
        self.conns.insert(
            id,
            ConnState {
                watches: HashMap::new(),
                topics: HashSet::new(),
                tx,
                evict: evict.clone(),
            },
        );
        (id, evict)
    }

    fn disconnect(&mut self, conn_id: u64) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        for (room, watch) in conn.watches {
            if let Err(err) = self.store.unwatch_room(watch) {
                warn!(conn = conn_id, %room, %err, "unwatch on disconnect failed");
            }
        }
        debug!(conn = conn_id, topics = conn.topics.len(), "connection cleaned up");
    }
}

/// Accept connections forever, one task per client.
pub async fn serve(listener: UnixListener, hub: SharedHub) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, hub).await {
                warn!(?err, "client handler error");
            }
        });
    }
}

/// Serve one client until it disconnects or sends something undecodable.
pub async fn handle_client(stream: UnixStream, hub: SharedHub) -> Result<()> {
    let (mut reader, writer) = tokio::io::split(stream);

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOX_DEPTH);
    let (conn_id, evict) = hub.lock().await.register(tx);
    info!(conn = conn_id, "client connected");

    let writer_task = tokio::spawn(async move {
        let mut ws = writer;
        while let Some(buf) = rx.recv().await {
            if ws.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let result = read_frames(&mut reader, conn_id, &hub, &evict).await;
    hub.lock().await.disconnect(conn_id);
    if matches!(result, Ok(Closed::Evicted)) {
        // Drop the write half too so the client sees the stream end.
        writer_task.abort();
    }
    info!(conn = conn_id, "client disconnected");
    result.map(|_| ())
}

async fn read_frames<R>(
    reader: &mut R,
    conn_id: u64,
    hub: &SharedHub,
    evict: &Notify,
) -> Result<Closed>
where
    R: AsyncRead + Unpin,
{
    let mut read_buf: Vec<u8> = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    loop {
        let n = tokio::select! {
            read = reader.read(&mut read_buf) => read?,
            () = evict.notified() => {
                warn!(conn = conn_id, "evicting connection that fell behind on room changes");
                return Ok(Closed::Evicted);
            }
        };
        if n == 0 {
            return Ok(Closed::Client);
        }
        acc.extend_from_slice(&read_buf[..n]);

        // process as many frames as available
        while acc.len() >= HEADER_LEN {
            let total = match frame_len(&acc[..HEADER_LEN]) {
                Ok(total) => total,
                Err(err) => {
                    warn!(conn = conn_id, %err, "bad frame header; closing");
                    return Ok(Closed::Client);
                }
            };
            if acc.len() < total {
                break;
            }
            let packet: Vec<u8> = acc.drain(..total).collect();
            match decode_message(&packet) {
                Ok((msg, _ts, _)) => handle_message(msg, conn_id, hub).await?,
                Err(err) => {
                    warn!(conn = conn_id, %err, "failed to decode packet; closing");
                    return Ok(Closed::Client);
                }
            }
        }
    }
}

fn store_error(req: Option<RequestId>, err: &StoreError) -> Message {
    let (code, name) = match err {
        StoreError::Record(_) | StoreError::Rejected(_) => (ERR_BAD_REQUEST, "bad_request"),
        _ => (ERR_STORE, "store_error"),
    };
    Message::Error(ErrorPayload {
        req,
        code,
        name: name.to_string(),
        message: err.to_string(),
    })
}

async fn send_to(hub: &SharedHub, conn_id: u64, msg: &Message) -> Result<()> {
    let (tx, clock) = {
        let h = hub.lock().await;
        let conn = h
            .conns
            .get(&conn_id)
            .ok_or_else(|| anyhow!("missing conn {conn_id}"))?;
        (conn.tx.clone(), h.clock.clone())
    };
    // A closed outbox means the writer is gone; the read side will notice.
    if let Ok(permit) = tx.reserve().await {
        clock.push(permit, msg)?;
    }
    Ok(())
}

/// Handle a single inbound message from a connection.
pub async fn handle_message(msg: Message, conn_id: u64, hub: &SharedHub) -> Result<()> {
    let store = hub.lock().await.store.clone();
    let reply = match msg {
        Message::Handshake(handshake) => {
            debug!(
                conn = conn_id,
                agent = ?handshake.agent_id,
                client_version = handshake.client_version,
                "handshake"
            );
            Some(Message::HandshakeAck(HandshakeAckPayload {
                server_version: u32::from(VERSION),
                connection_id: conn_id,
            }))
        }
        Message::ReadCounter(RequestPayload { req }) => Some(match store.read_counter() {
            Ok(snap) => Message::CounterValue(CounterValuePayload {
                req,
                value: snap.value,
                version: snap.version,
            }),
            Err(err) => store_error(Some(req), &err),
        }),
        Message::CasCounter(cas) => {
            let req = cas.req;
            let committed = store
                .compare_and_set_counter(cas.expected_version, cas.value)
                .and_then(|commit| match commit {
                    CounterCommit::Committed { value, version } => Ok(CounterCommitPayload {
                        req,
                        committed: true,
                        value: Some(value),
                        version,
                    }),
                    CounterCommit::Conflict => store.read_counter().map(|snap| {
                        CounterCommitPayload {
                            req,
                            committed: false,
                            value: snap.value,
                            version: snap.version,
                        }
                    }),
                });
            Some(match committed {
                Ok(payload) => {
                    debug!(
                        conn = conn_id,
                        committed = payload.committed,
                        version = payload.version,
                        "counter transaction"
                    );
                    Message::CounterCommit(payload)
                }
                Err(err) => store_error(Some(req), &err),
            })
        }
        Message::WriteField(write) => {
            let req = write.req;
            Some(match store.write_field(write.room, write.field, write.value) {
                Ok(()) => Message::WriteAck(RequestPayload { req }),
                Err(err) => {
                    warn!(
                        conn = conn_id,
                        room = %write.room,
                        field = %write.field,
                        %err,
                        "write rejected"
                    );
                    store_error(Some(req), &err)
                }
            })
        }
        Message::ReadRoom(read) => Some(match store.read_room(read.room) {
            Ok(record) => Message::RoomSnapshot(RoomSnapshotPayload {
                req: read.req,
                room: read.room,
                record,
            }),
            Err(err) => store_error(Some(read.req), &err),
        }),
        Message::ListRooms(RequestPayload { req }) => Some(match store.list_rooms() {
            Ok(rooms) => Message::RoomList(RoomListPayload {
                req,
                rooms: rooms
                    .into_iter()
                    .map(|(room, record)| RoomEntry { room, record })
                    .collect(),
            }),
            Err(err) => store_error(Some(req), &err),
        }),
        Message::WatchRoom(watch) => watch_room(hub, conn_id, watch.room).await?,
        Message::UnwatchRoom(watch) => {
            let removed = {
                let mut h = hub.lock().await;
                h.conns
                    .get_mut(&conn_id)
                    .ok_or_else(|| anyhow!("missing conn {conn_id}"))?
                    .watches
                    .remove(&watch.room)
            };
            if let Some(id) = removed {
                store.unwatch_room(id).err().map(|err| store_error(None, &err))
            } else {
                None
            }
        }
        Message::SubscribeTopic(sub) => {
            let mut h = hub.lock().await;
            let conn = h
                .conns
                .get_mut(&conn_id)
                .ok_or_else(|| anyhow!("missing conn {conn_id}"))?;
            debug!(conn = conn_id, topic = %sub.topic, "topic subscribed");
            conn.topics.insert(sub.topic);
            None
        }
        Message::PublishTopic(publish) => {
            let (targets, clock) = {
                let h = hub.lock().await;
                let targets: Vec<(u64, Outbox)> = h
                    .conns
                    .iter()
                    .filter(|(_, c)| c.topics.contains(&publish.topic))
                    .map(|(id, c)| (*id, c.tx.clone()))
                    .collect();
                (targets, h.clock.clone())
            };
            let msg = Message::TopicMessage(TopicMessagePayload {
                topic: publish.topic.clone(),
                notification: publish.notification,
            });
            let mut delivered = 0usize;
            for (id, tx) in targets {
                if clock.try_push(&tx, &msg)? {
                    delivered += 1;
                } else {
                    warn!(
                        conn = id,
                        topic = %publish.topic,
                        "outbox full; topic message dropped"
                    );
                }
            }
            info!(topic = %publish.topic, delivered, "topic message fanned out");
            Some(Message::WriteAck(RequestPayload { req: publish.req }))
        }
        other => {
            // server-to-client ops; clients should not send them
            debug!(conn = conn_id, op = other.op_name(), "ignoring unexpected op");
            None
        }
    };
    if let Some(reply) = reply {
        send_to(hub, conn_id, &reply).await?;
    }
    Ok(())
}

async fn watch_room(hub: &SharedHub, conn_id: u64, room: RoomCode) -> Result<Option<Message>> {
    let mut guard = hub.lock().await;
    let h = &mut *guard;
    let conn = h
        .conns
        .get_mut(&conn_id)
        .ok_or_else(|| anyhow!("missing conn {conn_id}"))?;
    if conn.watches.contains_key(&room) {
        debug!(conn = conn_id, %room, "already watching");
        return Ok(None);
    }
    let tx = conn.tx.clone();
    let evict = conn.evict.clone();
    let clock = h.clock.clone();
    // A skipped room change could be the one carrying the anchor id, so a
    // watcher whose outbox is full is disconnected instead.
    let listener: RoomListener = Arc::new(move |event: RoomEvent| match event {
        RoomEvent::Snapshot(record) => {
            let msg = Message::RoomChanged(RoomChangedPayload { room, record });
            match clock.try_push(&tx, &msg) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(conn = conn_id, %room, "outbox full; evicting watcher");
                    evict.notify_one();
                }
                Err(err) => warn!(conn = conn_id, %room, %err, "room change encode failed"),
            }
        }
        RoomEvent::Cancelled(reason) => {
            debug!(conn = conn_id, %room, %reason, "watch cancelled");
        }
    });
    // The initial snapshot is pushed from inside this call.
    match h.store.watch_room(room, listener) {
        Ok(id) => {
            conn.watches.insert(room, id);
            debug!(conn = conn_id, %room, "watching room");
            Ok(None)
        }
        Err(err) => Ok(Some(store_error(None, &err))),
    }
}

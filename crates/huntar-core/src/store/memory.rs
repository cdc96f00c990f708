// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-process room store. Backs the room hub and single-process tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use huntar_room_proto::{FieldValue, RoomCode, RoomField, RoomRecord};
use tracing::trace;

use super::{CounterCommit, CounterSnapshot, RoomEvent, RoomListener, RoomStore, WatchId};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    counter: CounterSnapshot,
    rooms: BTreeMap<RoomCode, RoomRecord>,
    watches: HashMap<WatchId, (RoomCode, RoomListener)>,
    next_watch: u64,
}

impl Inner {
    fn listeners_for(&self, room: RoomCode) -> Vec<(WatchId, RoomListener)> {
        let mut out: Vec<_> = self
            .watches
            .iter()
            .filter(|(_, (r, _))| *r == room)
            .map(|(id, (_, l))| (*id, l.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

/// Room store held entirely in memory.
///
/// Listeners are invoked on the writing thread after the store lock has been
/// released, so they may call back into the store.
#[derive(Default)]
pub struct MemoryRoomStore {
    inner: Mutex<Inner>,
}

impl MemoryRoomStore {
    /// Empty store with an absent counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose counter already holds `value`.
    pub fn with_counter(value: u64) -> Self {
        let store = Self::default();
        store.lock().counter = CounterSnapshot {
            value: Some(value),
            version: 1,
        };
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of attached watches.
    pub fn watch_count(&self) -> usize {
        self.lock().watches.len()
    }

    /// Cancel every watch on `room`, telling each listener why.
    pub fn cancel_watches(&self, room: RoomCode, reason: &str) {
        let cancelled: Vec<RoomListener> = {
            let mut inner = self.lock();
            let ids: Vec<WatchId> = inner
                .listeners_for(room)
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.watches.remove(&id).map(|(_, l)| l))
                .collect()
        };
        for listener in cancelled {
            listener(RoomEvent::Cancelled(reason.to_string()));
        }
    }
}

impl RoomStore for MemoryRoomStore {
    fn read_counter(&self) -> Result<CounterSnapshot, StoreError> {
        Ok(self.lock().counter)
    }

    fn compare_and_set_counter(
        &self,
        expected_version: u64,
        value: u64,
    ) -> Result<CounterCommit, StoreError> {
        let mut inner = self.lock();
        if inner.counter.version != expected_version {
            return Ok(CounterCommit::Conflict);
        }
        let version = expected_version + 1;
        inner.counter = CounterSnapshot {
            value: Some(value),
            version,
        };
        Ok(CounterCommit::Committed { value, version })
    }

    fn write_field(
        &self,
        room: RoomCode,
        field: RoomField,
        value: FieldValue,
    ) -> Result<(), StoreError> {
        let (record, listeners) = {
            let mut inner = self.lock();
            let mut record = inner.rooms.get(&room).cloned().unwrap_or_default();
            record.apply(field, value)?;
            inner.rooms.insert(room, record.clone());
            (record, inner.listeners_for(room))
        };
        trace!(%room, %field, listeners = listeners.len(), "room field written");
        for (_, listener) in listeners {
            listener(RoomEvent::Snapshot(record.clone()));
        }
        Ok(())
    }

    fn read_room(&self, room: RoomCode) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.lock().rooms.get(&room).cloned())
    }

    fn list_rooms(&self) -> Result<Vec<(RoomCode, RoomRecord)>, StoreError> {
        Ok(self
            .lock()
            .rooms
            .iter()
            .map(|(room, record)| (*room, record.clone()))
            .collect())
    }

    fn watch_room(&self, room: RoomCode, listener: RoomListener) -> Result<WatchId, StoreError> {
        let (id, initial) = {
            let mut inner = self.lock();
            inner.next_watch += 1;
            let id = WatchId(inner.next_watch);
            inner.watches.insert(id, (room, listener.clone()));
            (id, inner.rooms.get(&room).cloned())
        };
        if let Some(record) = initial {
            listener(RoomEvent::Snapshot(record));
        }
        Ok(id)
    }

    fn unwatch_room(&self, watch: WatchId) -> Result<(), StoreError> {
        self.lock().watches.remove(&watch);
        Ok(())
    }
}

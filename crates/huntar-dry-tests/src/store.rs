// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Room store wrapper that records traffic and injects failures.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use huntar_core::error::StoreError;
use huntar_core::store::{
    CounterCommit, CounterSnapshot, RoomListener, RoomStore, WatchId,
};
use huntar_core::MemoryRoomStore;
use huntar_room_proto::{FieldValue, RoomCode, RoomField, RoomRecord};

#[derive(Default)]
struct Script {
    writes: Vec<(RoomCode, RoomField, FieldValue)>,
    failing_fields: HashSet<RoomField>,
    pending_conflicts: u32,
    cas_attempts: u32,
}

/// [`MemoryRoomStore`] that logs every field write and counter attempt.
///
/// Failures are scripted per field; counter conflicts are injected by
/// bumping the counter behind the caller's back, the way a competing device
/// would.
#[derive(Default)]
pub struct RecordingRoomStore {
    inner: MemoryRoomStore,
    script: Mutex<Script>,
}

impl RecordingRoomStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store behind an `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store whose counter already holds `value`.
    pub fn with_counter(value: u64) -> Self {
        Self {
            inner: MemoryRoomStore::with_counter(value),
            script: Mutex::default(),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject every write of `field`.
    pub fn fail_field(&self, field: RoomField) {
        self.script().failing_fields.insert(field);
    }

    /// Make the next `n` counter writes lose to a competing writer.
    pub fn inject_conflicts(&self, n: u32) {
        self.script().pending_conflicts = n;
    }

    /// Counter writes attempted so far.
    pub fn cas_attempts(&self) -> u32 {
        self.script().cas_attempts
    }

    /// Successful field writes, in order.
    pub fn writes(&self) -> Vec<(RoomCode, RoomField, FieldValue)> {
        self.script().writes.clone()
    }

    /// Number of successful field writes.
    pub fn write_count(&self) -> usize {
        self.script().writes.len()
    }

    /// The wrapped store.
    pub fn inner(&self) -> &MemoryRoomStore {
        &self.inner
    }
}

impl RoomStore for RecordingRoomStore {
    fn read_counter(&self) -> Result<CounterSnapshot, StoreError> {
        self.inner.read_counter()
    }

    fn compare_and_set_counter(
        &self,
        expected_version: u64,
        value: u64,
    ) -> Result<CounterCommit, StoreError> {
        let steal = {
            let mut script = self.script();
            script.cas_attempts += 1;
            if script.pending_conflicts > 0 {
                script.pending_conflicts -= 1;
                true
            } else {
                false
            }
        };
        if steal {
            let snap = self.inner.read_counter()?;
            self.inner
                .compare_and_set_counter(snap.version, snap.current() + 1)?;
        }
        self.inner.compare_and_set_counter(expected_version, value)
    }

    fn write_field(
        &self,
        room: RoomCode,
        field: RoomField,
        value: FieldValue,
    ) -> Result<(), StoreError> {
        if self.script().failing_fields.contains(&field) {
            return Err(StoreError::Rejected(format!("{field} is read-only")));
        }
        self.inner.write_field(room, field, value.clone())?;
        self.script().writes.push((room, field, value));
        Ok(())
    }

    fn read_room(&self, room: RoomCode) -> Result<Option<RoomRecord>, StoreError> {
        self.inner.read_room(room)
    }

    fn list_rooms(&self) -> Result<Vec<(RoomCode, RoomRecord)>, StoreError> {
        self.inner.list_rooms()
    }

    fn watch_room(&self, room: RoomCode, listener: RoomListener) -> Result<WatchId, StoreError> {
        self.inner.watch_room(room, listener)
    }

    fn unwatch_room(&self, watch: WatchId) -> Result<(), StoreError> {
        self.inner.unwatch_room(watch)
    }
}

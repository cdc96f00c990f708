// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Port onto the realtime room store: a versioned room counter plus one
//! record per room code, written one field at a time and watchable.

use std::sync::Arc;

use huntar_room_proto::{FieldValue, RoomCode, RoomField, RoomRecord};

use crate::error::StoreError;

pub mod memory;

/// Counter value together with the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Last allocated code; `None` before the first allocation.
    pub value: Option<u64>,
    /// Bumped on every committed write.
    pub version: u64,
}

impl CounterSnapshot {
    /// Value with absent treated as zero.
    pub fn current(&self) -> u64 {
        self.value.unwrap_or(0)
    }
}

/// Result of a conditional counter write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCommit {
    /// The write was applied.
    Committed {
        /// Stored value.
        value: u64,
        /// Version after the write.
        version: u64,
    },
    /// Somebody else wrote first; nothing was changed.
    Conflict,
}

/// Handle identifying one room watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// Delivered to room listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Full record after a change (or when the watch attaches).
    Snapshot(RoomRecord),
    /// The store ended the watch. No further events follow.
    Cancelled(String),
}

/// Room change callback. Runs on a store thread.
pub type RoomListener = Arc<dyn Fn(RoomEvent) + Send + Sync>;

/// Realtime key/value store shared by hosting and resolving devices.
pub trait RoomStore: Send + Sync {
    /// Read the room counter.
    fn read_counter(&self) -> Result<CounterSnapshot, StoreError>;

    /// Write `value` if the counter is still at `expected_version`.
    fn compare_and_set_counter(
        &self,
        expected_version: u64,
        value: u64,
    ) -> Result<CounterCommit, StoreError>;

    /// Write a single field of a room record, creating the record if needed.
    fn write_field(
        &self,
        room: RoomCode,
        field: RoomField,
        value: FieldValue,
    ) -> Result<(), StoreError>;

    /// Read a room record.
    fn read_room(&self, room: RoomCode) -> Result<Option<RoomRecord>, StoreError>;

    /// Every room record, ascending by room code.
    fn list_rooms(&self) -> Result<Vec<(RoomCode, RoomRecord)>, StoreError>;

    /// Attach a durable listener to a room. The current record, if any, is
    /// delivered first; then one snapshot per change.
    fn watch_room(&self, room: RoomCode, listener: RoomListener) -> Result<WatchId, StoreError>;

    /// Detach a listener. Unknown ids are ignored.
    fn unwatch_room(&self, watch: WatchId) -> Result<(), StoreError>;
}

/// Shared handle to a room store.
pub type SharedRoomStore = Arc<dyn RoomStore>;

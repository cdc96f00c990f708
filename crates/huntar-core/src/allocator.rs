// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Room code allocation from the shared room counter.

use std::thread::{self, JoinHandle};

use huntar_room_proto::RoomCode;
use tracing::{debug, warn};

use crate::error::AllocationError;
use crate::store::{CounterCommit, SharedRoomStore};

/// Attempts a counter transaction makes before reporting contention.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

/// Hands out globally unique room codes by incrementing the room counter.
///
/// Each allocation is one optimistic transaction: read the counter, write
/// `current + 1` conditioned on the version read, and re-read on conflict.
/// A failed allocation consumes no code.
#[derive(Clone)]
pub struct RoomCodeAllocator {
    store: SharedRoomStore,
    max_attempts: u32,
}

impl RoomCodeAllocator {
    /// Allocator with [`DEFAULT_MAX_ATTEMPTS`].
    pub fn new(store: SharedRoomStore) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the transaction attempt bound (at least one attempt is made).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Run one counter transaction.
    pub fn allocate(&self) -> Result<RoomCode, AllocationError> {
        for attempt in 1..=self.max_attempts {
            let snapshot = self.store.read_counter()?;
            let next = snapshot
                .current()
                .checked_add(1)
                .filter(|n| i64::try_from(*n).is_ok())
                .ok_or(AllocationError::Overflow)?;
            match self.store.compare_and_set_counter(snapshot.version, next)? {
                CounterCommit::Committed { value, .. } => {
                    let code = RoomCode::new(value).ok_or(AllocationError::Overflow)?;
                    debug!(%code, attempt, "room code allocated");
                    return Ok(code);
                }
                CounterCommit::Conflict => {
                    debug!(attempt, "room counter moved underneath us");
                }
            }
        }
        warn!(attempts = self.max_attempts, "room counter transaction gave up");
        Err(AllocationError::ConflictExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Run [`Self::allocate`] on a worker thread; `on_done` fires exactly once.
    pub fn allocate_in_background<F>(&self, on_done: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<RoomCode, AllocationError>) + Send + 'static,
    {
        let allocator = self.clone();
        thread::spawn(move || on_done(allocator.allocate()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::error::StoreError;
    use crate::store::memory::MemoryRoomStore;
    use crate::store::{CounterSnapshot, RoomListener, RoomStore, WatchId};
    use huntar_room_proto::{FieldValue, RoomField, RoomRecord};
    use std::sync::Arc;

    /// Counter that always reports a concurrent writer.
    struct Contended;

    impl RoomStore for Contended {
        fn read_counter(&self) -> Result<CounterSnapshot, StoreError> {
            Ok(CounterSnapshot::default())
        }
        fn compare_and_set_counter(&self, _: u64, _: u64) -> Result<CounterCommit, StoreError> {
            Ok(CounterCommit::Conflict)
        }
        fn write_field(&self, _: RoomCode, _: RoomField, _: FieldValue) -> Result<(), StoreError> {
            Ok(())
        }
        fn read_room(&self, _: RoomCode) -> Result<Option<RoomRecord>, StoreError> {
            Ok(None)
        }
        fn list_rooms(&self) -> Result<Vec<(RoomCode, RoomRecord)>, StoreError> {
            Ok(Vec::new())
        }
        fn watch_room(&self, _: RoomCode, _: RoomListener) -> Result<WatchId, StoreError> {
            Err(StoreError::Disconnected)
        }
        fn unwatch_room(&self, _: WatchId) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn absent_counter_allocates_one() {
        let allocator = RoomCodeAllocator::new(Arc::new(MemoryRoomStore::new()));
        assert_eq!(allocator.allocate().unwrap().get(), 1);
        assert_eq!(allocator.allocate().unwrap().get(), 2);
    }

    #[test]
    fn existing_counter_continues_from_last_value() {
        let allocator = RoomCodeAllocator::new(Arc::new(MemoryRoomStore::with_counter(41)));
        assert_eq!(allocator.allocate().unwrap().get(), 42);
    }

    #[test]
    fn contention_is_bounded() {
        let allocator = RoomCodeAllocator::new(Arc::new(Contended)).with_max_attempts(3);
        assert_eq!(
            allocator.allocate(),
            Err(AllocationError::ConflictExhausted { attempts: 3 })
        );
    }

    #[test]
    fn counter_at_the_top_of_the_range_overflows() {
        let store = Arc::new(MemoryRoomStore::with_counter(RoomCode::MAX));
        let allocator = RoomCodeAllocator::new(store.clone());
        assert_eq!(allocator.allocate(), Err(AllocationError::Overflow));
        assert_eq!(store.read_counter().unwrap().current(), RoomCode::MAX);
    }

    #[test]
    fn background_allocation_reports_once() {
        let allocator = RoomCodeAllocator::new(Arc::new(MemoryRoomStore::new()));
        let (tx, rx) = std::sync::mpsc::channel();
        allocator
            .allocate_in_background(move |result| tx.send(result).unwrap())
            .join()
            .unwrap();
        assert_eq!(rx.recv().unwrap().unwrap().get(), 1);
        assert!(rx.try_recv().is_err());
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Room watches that deliver hosted anchor ids to resolving devices.

use std::sync::{Arc, Mutex};

use huntar_room_proto::{CloudAnchorId, RoomCode};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{RoomEvent, SharedRoomStore, WatchId};

/// What a room watch reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The room now carries this anchor id (first delivery per distinct id).
    AnchorId(CloudAnchorId),
    /// The store ended the watch. It is not re-established.
    Cancelled(String),
}

/// An attached room watch. Dropping it detaches the listener.
pub struct RoomWatch {
    store: SharedRoomStore,
    room: RoomCode,
    id: WatchId,
}

impl RoomWatch {
    /// Attach to `room`. `on_event` sees each distinct non-empty anchor id
    /// once, in arrival order, plus a cancellation if the store ends the
    /// watch. Record changes that keep the same anchor id are swallowed.
    pub fn attach<F>(
        store: SharedRoomStore,
        room: RoomCode,
        on_event: F,
    ) -> Result<Self, StoreError>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        let last: Mutex<Option<CloudAnchorId>> = Mutex::new(None);
        let listener = move |event: RoomEvent| match event {
            RoomEvent::Snapshot(record) => {
                let Some(id) = record.anchor_id() else {
                    return;
                };
                {
                    let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
                    if last.as_ref() == Some(&id) {
                        return;
                    }
                    *last = Some(id.clone());
                }
                debug!(%room, anchor = %id, "room anchor id delivered");
                on_event(WatchEvent::AnchorId(id));
            }
            RoomEvent::Cancelled(reason) => {
                warn!(%room, %reason, "room watch cancelled");
                on_event(WatchEvent::Cancelled(reason));
            }
        };
        let id = store.watch_room(room, Arc::new(listener))?;
        Ok(Self { store, room, id })
    }

    /// Watched room.
    pub fn room(&self) -> RoomCode {
        self.room
    }

    /// Store-side watch id.
    pub fn id(&self) -> WatchId {
        self.id
    }
}

impl Drop for RoomWatch {
    fn drop(&mut self) {
        if let Err(err) = self.store.unwatch_room(self.id) {
            debug!(room = %self.room, %err, "unwatch failed");
        }
    }
}

/// The resolving side's single active room watch.
pub struct RoomSubscription {
    store: SharedRoomStore,
    current: Mutex<Option<RoomWatch>>,
}

impl RoomSubscription {
    /// No watch attached yet.
    pub fn new(store: SharedRoomStore) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    /// Watch `room`, releasing any previous watch first. `on_anchor_id` runs
    /// once per distinct anchor id the room carries.
    pub fn watch<F>(&self, room: RoomCode, on_anchor_id: F) -> Result<(), StoreError>
    where
        F: Fn(CloudAnchorId) + Send + Sync + 'static,
    {
        self.watch_events(room, move |event| {
            if let WatchEvent::AnchorId(id) = event {
                on_anchor_id(id);
            }
        })
    }

    /// Like [`Self::watch`], but also reports cancellation.
    pub fn watch_events<F>(&self, room: RoomCode, on_event: F) -> Result<(), StoreError>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        self.unwatch();
        // The initial snapshot may be delivered synchronously; `current`
        // must not be held across the attach.
        let watch = RoomWatch::attach(self.store.clone(), room, on_event)?;
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(watch);
        drop(previous);
        Ok(())
    }

    /// Detach the current watch, if any.
    pub fn unwatch(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(previous);
    }

    /// Room currently watched.
    pub fn watched_room(&self) -> Option<RoomCode> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(RoomWatch::room)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::store::memory::MemoryRoomStore;
    use crate::store::RoomStore;
    use huntar_room_proto::{FieldValue, RoomField};

    fn room(code: u64) -> RoomCode {
        RoomCode::new(code).unwrap()
    }

    fn set_anchor(store: &MemoryRoomStore, code: u64, id: &str) {
        store
            .write_field(room(code), RoomField::HostedAnchorId, FieldValue::Text(id.into()))
            .unwrap();
    }

    #[test]
    fn empty_anchor_id_is_not_delivered() {
        let store = Arc::new(MemoryRoomStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = RoomSubscription::new(store.clone());
        sub.watch(room(2), move |id| s.lock().unwrap().push(id)).unwrap();
        set_anchor(&store, 2, "");
        assert!(seen.lock().unwrap().is_empty());
        set_anchor(&store, 2, "ua-2");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn rewatching_releases_the_previous_room() {
        let store = Arc::new(MemoryRoomStore::new());
        let sub = RoomSubscription::new(store.clone());
        sub.watch(room(1), |_| {}).unwrap();
        sub.watch(room(2), |_| {}).unwrap();
        assert_eq!(store.watch_count(), 1);
        assert_eq!(sub.watched_room(), Some(room(2)));
        sub.unwatch();
        assert_eq!(store.watch_count(), 0);
        assert_eq!(sub.watched_room(), None);
    }

    #[test]
    fn dropping_the_handle_detaches() {
        let store = Arc::new(MemoryRoomStore::new());
        let watch = RoomWatch::attach(store.clone(), room(8), |_| {}).unwrap();
        assert_eq!(store.watch_count(), 1);
        drop(watch);
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn cancellation_is_reported_once() {
        let store = Arc::new(MemoryRoomStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = RoomSubscription::new(store.clone());
        sub.watch_events(room(3), move |e| s.lock().unwrap().push(e))
            .unwrap();
        store.cancel_watches(room(3), "revoked");
        set_anchor(&store, 3, "late");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![WatchEvent::Cancelled("revoked".into())]
        );
    }
}

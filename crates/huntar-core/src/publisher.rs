// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One-shot publication of the `{room code → anchor id}` pairing.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use huntar_room_proto::{
    CloudAnchorId, GeoPoint, HuntNotification, RoomCode, RoomField, TreasureKind,
    DEFAULT_DISPLAY_NAME,
};
use tracing::{info, warn};

use crate::error::{JoinError, StoreError};
use crate::store::SharedRoomStore;

/// Per-attempt pairing of a room code with a hosted anchor id.
///
/// Each half is set once. The pairing is published at most once, and only
/// when both halves are known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomJoin {
    room: Option<RoomCode>,
    anchor: Option<CloudAnchorId>,
    published: bool,
}

impl RoomJoin {
    /// Empty join.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the allocated room code.
    pub fn set_room_code(&mut self, room: RoomCode) -> Result<(), JoinError> {
        if let Some(existing) = self.room {
            return Err(JoinError::RoomCodeAlreadySet(existing));
        }
        self.room = Some(room);
        Ok(())
    }

    /// Record the hosted anchor id.
    pub fn set_anchor_id(&mut self, anchor: CloudAnchorId) -> Result<(), JoinError> {
        if let Some(existing) = &self.anchor {
            return Err(JoinError::AnchorIdAlreadySet(existing.clone()));
        }
        self.anchor = Some(anchor);
        Ok(())
    }

    /// Room code, once allocated.
    pub fn room_code(&self) -> Option<RoomCode> {
        self.room
    }

    /// Anchor id, once hosted.
    pub fn anchor_id(&self) -> Option<&CloudAnchorId> {
        self.anchor.as_ref()
    }

    /// Whether the pairing has been published or handed off for publishing.
    pub fn is_published(&self) -> bool {
        self.published
    }

    /// Take both halves for publishing if they are known and nobody took
    /// them yet. Returns `Some` at most once per join.
    pub fn claim(&mut self) -> Option<(RoomCode, CloudAnchorId)> {
        if self.published {
            return None;
        }
        let pair = self.room.zip(self.anchor.clone())?;
        self.published = true;
        Some(pair)
    }
}

/// What the user entered before sharing the treasure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreasureDraft {
    /// Chest or letter.
    pub kind: TreasureKind,
    /// Hint shown to hunters.
    pub hint: Option<String>,
    /// Letter text; replaces the notification message for letters.
    pub letter: Option<String>,
    /// Where the treasure was planted.
    pub location: Option<GeoPoint>,
    /// Uploaded hint picture.
    pub image_url: Option<String>,
}

impl TreasureDraft {
    /// A letter carrying `text`.
    pub fn letter(text: impl Into<String>) -> Self {
        Self {
            kind: TreasureKind::Letter,
            letter: Some(text.into()),
            ..Self::default()
        }
    }

    /// Build the notification for a completed pairing.
    pub fn notification(
        &self,
        room: RoomCode,
        anchor: CloudAnchorId,
        display_name: &str,
        updated_at: u64,
    ) -> HuntNotification {
        let mut n = HuntNotification::planted(room, anchor, updated_at);
        n.treasure_type = self.kind;
        n.display_name = display_name.to_string();
        n.identify_hint.clone_from(&self.hint);
        n.notification_image_url.clone_from(&self.image_url);
        n.location = self.location;
        if self.kind == TreasureKind::Letter {
            if let Some(text) = &self.letter {
                n.notification_message.clone_from(text);
            }
        }
        n
    }
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    /// Room that was written.
    pub room: RoomCode,
    /// Notification the fields were taken from.
    pub notification: HuntNotification,
    /// Fields written successfully, in write order.
    pub written: Vec<RoomField>,
    /// Fields whose write failed.
    pub failed: Vec<(RoomField, StoreError)>,
}

impl PublishReport {
    /// True when every field was written.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Writes a completed join into the room store.
#[derive(Clone)]
pub struct PairingPublisher {
    store: SharedRoomStore,
    display_name: String,
    clock: Clock,
}

impl PairingPublisher {
    /// Publisher writing to `store`, stamping records with wall-clock time.
    pub fn new(store: SharedRoomStore) -> Self {
        Self {
            store,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            clock: Arc::new(crate::now_millis),
        }
    }

    /// Override the display name written into records.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Override the `updated_at` source.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Publish the pairing if both halves are known and it has not been
    /// published yet. Call after every update to either half.
    pub fn try_publish(&self, join: &mut RoomJoin, draft: &TreasureDraft) -> Option<PublishReport> {
        let (room, anchor) = join.claim()?;
        Some(self.publish(room, anchor, draft))
    }

    /// Write the record for a claimed pairing.
    ///
    /// Each record field is written on its own; a failed write is logged and
    /// the remaining fields are still attempted.
    pub fn publish(
        &self,
        room: RoomCode,
        anchor: CloudAnchorId,
        draft: &TreasureDraft,
    ) -> PublishReport {
        let notification = draft.notification(room, anchor, &self.display_name, (self.clock)());
        let mut written = Vec::new();
        let mut failed = Vec::new();
        for (field, value) in notification.record_fields() {
            match self.store.write_field(room, field, value) {
                Ok(()) => written.push(field),
                Err(err) => {
                    warn!(%room, %field, %err, "room field write failed");
                    failed.push((field, err));
                }
            }
        }
        info!(
            %room,
            anchor = %notification.hosted_anchor_id,
            written = written.len(),
            failed = failed.len(),
            "pairing published"
        );
        PublishReport {
            room,
            notification,
            written,
            failed,
        }
    }

    /// Run [`publish`](Self::publish) on a worker thread and hand the report
    /// to `on_done` there.
    pub fn publish_in_background<F>(
        &self,
        room: RoomCode,
        anchor: CloudAnchorId,
        draft: TreasureDraft,
        on_done: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(PublishReport) + Send + 'static,
    {
        let publisher = self.clone();
        thread::spawn(move || on_done(publisher.publish(room, anchor, &draft)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::store::memory::MemoryRoomStore;
    use crate::store::RoomStore;

    fn room(code: u64) -> RoomCode {
        RoomCode::new(code).unwrap()
    }

    #[test]
    fn setting_a_half_twice_is_rejected() {
        let mut join = RoomJoin::new();
        join.set_room_code(room(1)).unwrap();
        assert_eq!(
            join.set_room_code(room(2)),
            Err(JoinError::RoomCodeAlreadySet(room(1)))
        );
        let id = CloudAnchorId::new("a").unwrap();
        join.set_anchor_id(id.clone()).unwrap();
        assert_eq!(
            join.set_anchor_id(CloudAnchorId::new("b").unwrap()),
            Err(JoinError::AnchorIdAlreadySet(id))
        );
    }

    #[test]
    fn letter_text_becomes_the_message() {
        let mut draft = TreasureDraft::letter("meet me at the fountain");
        draft.hint = Some("north side".into());
        let n = draft.notification(room(4), CloudAnchorId::new("x").unwrap(), "Hunt AR App", 9);
        assert_eq!(n.treasure_type, TreasureKind::Letter);
        assert_eq!(n.notification_message, "meet me at the fountain");
        assert_eq!(n.identify_hint.as_deref(), Some("north side"));
        assert_eq!(n.updated_at, 9);
    }

    #[test]
    fn publish_writes_record_and_then_goes_quiet() {
        let store = Arc::new(MemoryRoomStore::new());
        let publisher = PairingPublisher::new(store.clone()).with_clock(|| 1_000);
        let mut join = RoomJoin::new();
        join.set_room_code(room(3)).unwrap();
        assert!(publisher.try_publish(&mut join, &TreasureDraft::default()).is_none());

        join.set_anchor_id(CloudAnchorId::new("ua-1").unwrap()).unwrap();
        let report = publisher
            .try_publish(&mut join, &TreasureDraft::default())
            .unwrap();
        assert!(report.is_complete());
        assert!(join.is_published());

        let record = store.read_room(room(3)).unwrap().unwrap();
        assert_eq!(record.room_id, Some(room(3)));
        assert_eq!(record.hosted_anchor_id.as_deref(), Some("ua-1"));
        assert_eq!(record.identify_status.as_deref(), Some("created"));
        assert_eq!(record.updated_at, Some(1_000));

        assert!(publisher.try_publish(&mut join, &TreasureDraft::default()).is_none());
    }

    #[test]
    fn claim_hands_out_the_pair_once() {
        let mut join = RoomJoin::new();
        join.set_anchor_id(CloudAnchorId::new("ua-5").unwrap()).unwrap();
        assert!(join.claim().is_none());
        assert!(!join.is_published());

        join.set_room_code(room(5)).unwrap();
        assert_eq!(join.claim(), Some((room(5), CloudAnchorId::new("ua-5").unwrap())));
        assert!(join.is_published());
        assert!(join.claim().is_none());
    }

    #[test]
    fn background_publish_writes_off_the_calling_thread() {
        let store = Arc::new(MemoryRoomStore::new());
        let publisher = PairingPublisher::new(store.clone());
        let caller = thread::current().id();
        let (tx, rx) = std::sync::mpsc::channel();
        publisher
            .publish_in_background(
                room(8),
                CloudAnchorId::new("ua-8").unwrap(),
                TreasureDraft::default(),
                move |report| tx.send((thread::current().id(), report)).unwrap(),
            )
            .join()
            .unwrap();
        let (worker, report) = rx.recv().unwrap();
        assert_ne!(worker, caller);
        assert!(report.is_complete());
        assert!(store.read_room(room(8)).unwrap().is_some());
    }
}

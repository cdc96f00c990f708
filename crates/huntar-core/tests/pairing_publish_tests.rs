// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The pairing is published exactly once, whichever half arrives first.

#![allow(missing_docs, clippy::unwrap_used)]

use std::sync::Arc;

use huntar_core::{PairingPublisher, RoomJoin, RoomStore, TreasureDraft};
use huntar_dry_tests::{anchor_id, room_code, RecordingRoomStore};
use huntar_room_proto::RoomField;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Step {
    Room,
    Anchor,
    Publish,
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(Just(Step::Publish), 0..6).prop_flat_map(|extra| {
        let mut all = vec![Step::Room, Step::Anchor];
        all.extend(extra);
        Just(all).prop_shuffle()
    })
}

proptest! {
    #[test]
    fn one_full_write_whatever_the_join_order(
        order in steps(),
        code in 1u64..10_000,
    ) {
        let store = Arc::new(RecordingRoomStore::new());
        let publisher = PairingPublisher::new(store.clone()).with_clock(|| 5);
        let draft = TreasureDraft::default();
        let mut join = RoomJoin::new();
        let mut reports = Vec::new();

        // Every update to either half is followed by a publish attempt.
        for step in order {
            match step {
                Step::Room => join.set_room_code(room_code(code)).unwrap(),
                Step::Anchor => join.set_anchor_id(anchor_id("ua-prop")).unwrap(),
                Step::Publish => {}
            }
            reports.extend(publisher.try_publish(&mut join, &draft));
        }

        prop_assert_eq!(reports.len(), 1);
        prop_assert!(join.is_published());
        let report = &reports[0];
        prop_assert!(report.is_complete());
        prop_assert_eq!(report.room, room_code(code));

        let writes = store.writes();
        prop_assert_eq!(writes.len(), report.written.len());
        prop_assert!(writes.iter().all(|(room, _, _)| *room == room_code(code)));
        let fields: Vec<RoomField> = writes.iter().map(|(_, field, _)| *field).collect();
        prop_assert!(fields.contains(&RoomField::HostedAnchorId));
        prop_assert!(fields.contains(&RoomField::RoomId));

        let record = store.inner().read_room(room_code(code)).unwrap();
        prop_assert_eq!(record.and_then(|r| r.anchor_id()), Some(anchor_id("ua-prop")));
    }
}

#[test]
fn half_joins_never_write() {
    let store = Arc::new(RecordingRoomStore::new());
    let publisher = PairingPublisher::new(store.clone());
    let mut join = RoomJoin::new();
    join.set_anchor_id(anchor_id("ua-lonely")).unwrap();
    for _ in 0..3 {
        assert!(publisher.try_publish(&mut join, &TreasureDraft::default()).is_none());
    }
    assert_eq!(store.write_count(), 0);
    assert!(!join.is_published());
}

#[test]
fn failed_field_is_reported_and_the_rest_written() {
    let store = Arc::new(RecordingRoomStore::new());
    store.fail_field(RoomField::IdentifyHint);
    let publisher = PairingPublisher::new(store.clone());
    let mut join = RoomJoin::new();
    join.set_room_code(room_code(2)).unwrap();
    join.set_anchor_id(anchor_id("ua-2")).unwrap();
    let draft = TreasureDraft {
        hint: Some("left of the oak".into()),
        ..TreasureDraft::default()
    };

    let report = publisher.try_publish(&mut join, &draft).unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, RoomField::IdentifyHint);
    assert!(report.written.contains(&RoomField::HostedAnchorId));
    assert_eq!(store.write_count(), report.written.len());
}

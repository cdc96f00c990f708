// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Listing of treasures still waiting to be found.

use huntar_room_proto::{
    CloudAnchorId, FieldValue, GeoPoint, RoomCode, RoomField, RoomRecord, TreasureKind,
    STATUS_CREATED, STATUS_FOUND,
};
use tracing::info;

use crate::error::StoreError;
use crate::store::RoomStore;

/// One open treasure, as shown in a hunt list.
#[derive(Debug, Clone, PartialEq)]
pub struct TreasureSummary {
    /// Room to watch to start the hunt.
    pub room: RoomCode,
    /// Chest or letter.
    pub kind: TreasureKind,
    /// Hint for hunters.
    pub hint: Option<String>,
    /// Hint picture.
    pub image_url: Option<String>,
    /// Planting location.
    pub location: Option<GeoPoint>,
    /// Hosted anchor id, when already published.
    pub anchor_id: Option<CloudAnchorId>,
    /// Epoch milliseconds of the last update.
    pub updated_at: Option<u64>,
}

impl TreasureSummary {
    fn from_record(room: RoomCode, record: &RoomRecord) -> Self {
        let location = match (record.latitude, record.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        };
        Self {
            room,
            kind: TreasureKind::from_type_field(record.treasure_type.as_deref().unwrap_or("")),
            hint: record.identify_hint.clone(),
            image_url: record.notification_image_url.clone(),
            location,
            anchor_id: record.anchor_id(),
            updated_at: record.updated_at,
        }
    }
}

fn is_open(record: &RoomRecord) -> bool {
    record
        .identify_status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case(STATUS_CREATED))
}

/// Treasures whose identify status is `created`, newest room first.
pub fn open_treasures(store: &dyn RoomStore) -> Result<Vec<TreasureSummary>, StoreError> {
    let mut out: Vec<TreasureSummary> = store
        .list_rooms()?
        .iter()
        .filter(|(_, record)| is_open(record))
        .map(|(room, record)| TreasureSummary::from_record(*room, record))
        .collect();
    out.sort_by(|a, b| b.room.cmp(&a.room));
    Ok(out)
}

/// Mark the treasure in `room` as found.
pub fn mark_found(
    store: &dyn RoomStore,
    room: RoomCode,
    now_millis: u64,
) -> Result<(), StoreError> {
    store.write_field(
        room,
        RoomField::IdentifyStatus,
        FieldValue::Text(STATUS_FOUND.to_string()),
    )?;
    let stamp = i64::try_from(now_millis).unwrap_or(i64::MAX);
    store.write_field(room, RoomField::UpdatedAt, FieldValue::Integer(stamp))?;
    info!(%room, "treasure found");
    Ok(())
}

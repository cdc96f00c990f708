// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared schema for the HuntAR room hub: room codes, cloud anchor ids, room
//! records, planted-treasure notifications, and the framed wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod record;
pub mod wire;

pub use record::{FieldValue, RecordError, RoomField, RoomRecord};

/// Identify status of a treasure nobody has found yet.
pub const STATUS_CREATED: &str = "created";
/// Identify status of a treasure that has been found.
pub const STATUS_FOUND: &str = "found";
/// Display name written into room records.
pub const DEFAULT_DISPLAY_NAME: &str = "Hunt AR App";

/// Globally unique, strictly positive room code handed out by the room counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct RoomCode(u64);

impl RoomCode {
    /// Largest room code; the counter is stored as a signed 64-bit integer.
    pub const MAX: u64 = i64::MAX.unsigned_abs();

    /// Wrap a raw counter value. Zero and values above [`Self::MAX`] are not
    /// valid room codes.
    pub fn new(value: u64) -> Option<Self> {
        (value > 0 && value <= Self::MAX).then_some(Self(value))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Value as stored in integer record fields.
    pub fn to_i64(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}

impl TryFrom<u64> for RoomCode {
    type Error = RecordError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(RecordError::InvalidRoomCode(value))
    }
}

impl From<RoomCode> for u64 {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RoomCode {
    type Err = RecordError;

    /// Parse a room code typed by a user.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u64>()
            .map_err(|_| RecordError::MalformedRoomCode(s.to_string()))?;
        Self::try_from(value)
    }
}

/// Durable identifier of a hosted cloud anchor. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CloudAnchorId(String);

impl CloudAnchorId {
    /// Wrap a backend id; empty strings are rejected.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        (!id.is_empty()).then_some(Self(id))
    }

    /// Borrow the id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CloudAnchorId {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(RecordError::EmptyAnchorId)
    }
}

impl From<CloudAnchorId> for String {
    fn from(id: CloudAnchorId) -> Self {
        id.0
    }
}

impl fmt::Display for CloudAnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of object was planted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TreasureKind {
    /// A treasure chest.
    #[default]
    Treasure,
    /// A letter carrying a message.
    Letter,
}

impl TreasureKind {
    /// Value stored in the record's `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            TreasureKind::Treasure => "treasure",
            TreasureKind::Letter => "letter",
        }
    }

    /// Classify a stored `type` field: `treasure` (any case) is a chest,
    /// everything else a letter.
    pub fn from_type_field(value: &str) -> Self {
        if value.eq_ignore_ascii_case("treasure") {
            TreasureKind::Treasure
        } else {
            TreasureKind::Letter
        }
    }
}

/// Latitude/longitude of a planted treasure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
}

/// Pairing of a room code with its hosted anchor, plus display metadata.
///
/// This is both the source of the room record fields and the payload of the
/// planted-treasure topic message (JSON, camelCase keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HuntNotification {
    /// Room the anchor was paired with.
    pub room_id: RoomCode,
    /// Chest or letter.
    #[serde(rename = "type")]
    pub treasure_type: TreasureKind,
    /// Display name of the publishing app.
    pub display_name: String,
    /// Hosted anchor id.
    pub hosted_anchor_id: CloudAnchorId,
    /// `created` until somebody finds the treasure.
    pub identify_status: String,
    /// Free-form hint for hunters.
    #[serde(default)]
    pub identify_hint: Option<String>,
    /// Notification headline.
    pub notification_title: String,
    /// Notification body (the letter text for letters).
    pub notification_message: String,
    /// Hint picture location, when one was uploaded.
    #[serde(default, rename = "notificationImageurl")]
    pub notification_image_url: Option<String>,
    /// Delivery status of the notification.
    pub notification_status: String,
    /// Where the treasure was planted, when known.
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Epoch milliseconds of the last update.
    pub updated_at: u64,
}

impl HuntNotification {
    /// Defaults for a freshly planted treasure.
    pub fn planted(room_id: RoomCode, hosted_anchor_id: CloudAnchorId, updated_at: u64) -> Self {
        Self {
            room_id,
            treasure_type: TreasureKind::Treasure,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            hosted_anchor_id,
            identify_status: STATUS_CREATED.to_string(),
            identify_hint: None,
            notification_title: "A treasure has been planted for you to find".to_string(),
            notification_message: "Click to start your hunt now".to_string(),
            notification_image_url: None,
            notification_status: STATUS_CREATED.to_string(),
            location: None,
            updated_at,
        }
    }

    /// Serialize to the JSON topic payload.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON topic payload.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Room record fields in write order. Optional values are only included
    /// when present.
    pub fn record_fields(&self) -> Vec<(RoomField, FieldValue)> {
        let mut fields = vec![
            (RoomField::RoomId, FieldValue::Integer(self.room_id.to_i64())),
            (
                RoomField::Type,
                FieldValue::Text(self.treasure_type.as_str().to_string()),
            ),
            (RoomField::DisplayName, FieldValue::Text(self.display_name.clone())),
            (
                RoomField::HostedAnchorId,
                FieldValue::Text(self.hosted_anchor_id.as_str().to_string()),
            ),
            (
                RoomField::IdentifyStatus,
                FieldValue::Text(self.identify_status.clone()),
            ),
        ];
        if let Some(hint) = &self.identify_hint {
            fields.push((RoomField::IdentifyHint, FieldValue::Text(hint.clone())));
        }
        fields.push((
            RoomField::NotificationTitle,
            FieldValue::Text(self.notification_title.clone()),
        ));
        fields.push((
            RoomField::NotificationMessage,
            FieldValue::Text(self.notification_message.clone()),
        ));
        if let Some(url) = &self.notification_image_url {
            fields.push((RoomField::NotificationImageUrl, FieldValue::Text(url.clone())));
        }
        fields.push((
            RoomField::NotificationStatus,
            FieldValue::Text(self.notification_status.clone()),
        ));
        if let Some(point) = self.location {
            fields.push((RoomField::Latitude, FieldValue::Real(point.latitude)));
            fields.push((RoomField::Longitude, FieldValue::Real(point.longitude)));
        }
        let updated_at = i64::try_from(self.updated_at).unwrap_or(i64::MAX);
        fields.push((RoomField::UpdatedAt, FieldValue::Integer(updated_at)));
        fields
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn sample() -> HuntNotification {
        HuntNotification::planted(
            RoomCode::new(7).unwrap(),
            CloudAnchorId::new("ua-6d0c06b57559a5d39d04de6bbee7f171").unwrap(),
            1_530_000_000_000,
        )
    }

    #[test]
    fn room_code_rejects_zero() {
        assert!(RoomCode::new(0).is_none());
        assert!("0".parse::<RoomCode>().is_err());
        assert_eq!(" 42 ".parse::<RoomCode>().unwrap().get(), 42);
    }

    #[test]
    fn room_code_fits_a_signed_record_field() {
        let max = RoomCode::new(RoomCode::MAX).unwrap();
        assert_eq!(max.to_i64(), i64::MAX);
        assert!(RoomCode::new(RoomCode::MAX + 1).is_none());
        assert!(u64::MAX.to_string().parse::<RoomCode>().is_err());
        assert!(serde_json::from_str::<RoomCode>(&u64::MAX.to_string()).is_err());
    }

    #[test]
    fn anchor_id_rejects_empty() {
        assert!(CloudAnchorId::new("").is_none());
        assert!(serde_json::from_str::<CloudAnchorId>("\"\"").is_err());
    }

    #[test]
    fn treasure_type_field_is_case_insensitive() {
        assert_eq!(TreasureKind::from_type_field("Treasure"), TreasureKind::Treasure);
        assert_eq!(TreasureKind::from_type_field("letter"), TreasureKind::Letter);
        assert_eq!(TreasureKind::from_type_field("scroll"), TreasureKind::Letter);
    }

    #[test]
    fn notification_json_uses_camel_case_keys() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"roomId\":7"));
        assert!(json.contains("\"hostedAnchorId\":\"ua-6d0c06b57559a5d39d04de6bbee7f171\""));
        assert!(json.contains("\"type\":\"treasure\""));
        assert_eq!(HuntNotification::from_json(&json).unwrap(), sample());
    }

    #[test]
    fn record_fields_skip_absent_optionals() {
        let fields = sample().record_fields();
        let keys: Vec<_> = fields.iter().map(|(f, _)| f.key()).collect();
        assert!(!keys.contains(&"identify_hint"));
        assert!(!keys.contains(&"latitude"));
        assert_eq!(keys.first(), Some(&"room_id"));
        assert_eq!(keys.last(), Some(&"updated_at"));
    }

    #[test]
    fn record_fields_rebuild_the_record() {
        let mut n = sample();
        n.identify_hint = Some("behind the fence".into());
        n.location = Some(GeoPoint {
            latitude: 37.42,
            longitude: -122.08,
        });
        let mut record = RoomRecord::default();
        for (field, value) in n.record_fields() {
            record.apply(field, value).unwrap();
        }
        assert_eq!(record.room_id, Some(n.room_id));
        assert_eq!(record.anchor_id(), Some(n.hosted_anchor_id.clone()));
        assert_eq!(record.identify_hint.as_deref(), Some("behind the fence"));
        assert_eq!(record.latitude, Some(37.42));
        assert_eq!(record.updated_at, Some(1_530_000_000_000));
    }
}

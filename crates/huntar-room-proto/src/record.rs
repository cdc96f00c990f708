// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Room records and their individually writable fields.

use crate::{CloudAnchorId, RoomCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while building or updating room data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    /// Room codes are strictly positive and fit a signed 64-bit integer.
    #[error("invalid room code {0}")]
    InvalidRoomCode(u64),
    /// Text could not be parsed as a room code.
    #[error("malformed room code {0:?}")]
    MalformedRoomCode(String),
    /// Cloud anchor ids are never empty.
    #[error("empty cloud anchor id")]
    EmptyAnchorId,
    /// A field was written with a value of the wrong shape.
    #[error("field {field} expects {expected}")]
    TypeMismatch {
        /// Field being written.
        field: RoomField,
        /// Expected value shape.
        expected: &'static str,
    },
}

/// One writable field of a room record. Keys match the stored names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomField {
    /// `room_id`
    RoomId,
    /// `type`
    Type,
    /// `display_name`
    DisplayName,
    /// `hosted_anchor_id`
    HostedAnchorId,
    /// `identify_status`
    IdentifyStatus,
    /// `identify_hint`
    IdentifyHint,
    /// `latitude`
    Latitude,
    /// `longitude`
    Longitude,
    /// `notification_title`
    NotificationTitle,
    /// `notification_message`
    NotificationMessage,
    /// `notification_imageurl`
    #[serde(rename = "notification_imageurl")]
    NotificationImageUrl,
    /// `notification_status`
    NotificationStatus,
    /// `updated_at`
    UpdatedAt,
}

impl RoomField {
    /// Every field, in canonical order.
    pub const ALL: [RoomField; 13] = [
        RoomField::RoomId,
        RoomField::Type,
        RoomField::DisplayName,
        RoomField::HostedAnchorId,
        RoomField::IdentifyStatus,
        RoomField::IdentifyHint,
        RoomField::Latitude,
        RoomField::Longitude,
        RoomField::NotificationTitle,
        RoomField::NotificationMessage,
        RoomField::NotificationImageUrl,
        RoomField::NotificationStatus,
        RoomField::UpdatedAt,
    ];

    /// Stored key name.
    pub fn key(self) -> &'static str {
        match self {
            RoomField::RoomId => "room_id",
            RoomField::Type => "type",
            RoomField::DisplayName => "display_name",
            RoomField::HostedAnchorId => "hosted_anchor_id",
            RoomField::IdentifyStatus => "identify_status",
            RoomField::IdentifyHint => "identify_hint",
            RoomField::Latitude => "latitude",
            RoomField::Longitude => "longitude",
            RoomField::NotificationTitle => "notification_title",
            RoomField::NotificationMessage => "notification_message",
            RoomField::NotificationImageUrl => "notification_imageurl",
            RoomField::NotificationStatus => "notification_status",
            RoomField::UpdatedAt => "updated_at",
        }
    }
}

impl fmt::Display for RoomField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Value carried by a single field write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// UTF-8 text.
    Text(String),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Real(f64),
}

/// Persisted state of one room, keyed by its room code in the store.
///
/// Every field is optional: records are assembled one field write at a time
/// and readers may observe a record mid-assembly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    /// Room code echoed into the record.
    pub room_id: Option<RoomCode>,
    /// `treasure` or `letter`.
    pub treasure_type: Option<String>,
    /// Display name of the publishing app.
    pub display_name: Option<String>,
    /// Hosted anchor id; may be empty while the record is assembled.
    pub hosted_anchor_id: Option<String>,
    /// `created` / `found`.
    pub identify_status: Option<String>,
    /// Hint for hunters.
    pub identify_hint: Option<String>,
    /// Degrees north.
    pub latitude: Option<f64>,
    /// Degrees east.
    pub longitude: Option<f64>,
    /// Notification headline.
    pub notification_title: Option<String>,
    /// Notification body.
    pub notification_message: Option<String>,
    /// Hint picture location.
    pub notification_image_url: Option<String>,
    /// Notification delivery status.
    pub notification_status: Option<String>,
    /// Epoch milliseconds of the last update.
    pub updated_at: Option<u64>,
}

impl RoomRecord {
    /// True when no field has been written.
    pub fn is_empty(&self) -> bool {
        *self == RoomRecord::default()
    }

    /// Hosted anchor id, if present and non-empty.
    pub fn anchor_id(&self) -> Option<CloudAnchorId> {
        self.hosted_anchor_id.as_deref().and_then(CloudAnchorId::new)
    }

    /// Apply a single field write.
    pub fn apply(&mut self, field: RoomField, value: FieldValue) -> Result<(), RecordError> {
        match field {
            RoomField::RoomId => {
                let raw = as_unsigned(field, value)?;
                self.room_id = Some(RoomCode::try_from(raw)?);
            }
            RoomField::Type => self.treasure_type = Some(as_text(field, value)?),
            RoomField::DisplayName => self.display_name = Some(as_text(field, value)?),
            RoomField::HostedAnchorId => self.hosted_anchor_id = Some(as_text(field, value)?),
            RoomField::IdentifyStatus => self.identify_status = Some(as_text(field, value)?),
            RoomField::IdentifyHint => self.identify_hint = Some(as_text(field, value)?),
            RoomField::Latitude => self.latitude = Some(as_real(field, value)?),
            RoomField::Longitude => self.longitude = Some(as_real(field, value)?),
            RoomField::NotificationTitle => {
                self.notification_title = Some(as_text(field, value)?);
            }
            RoomField::NotificationMessage => {
                self.notification_message = Some(as_text(field, value)?);
            }
            RoomField::NotificationImageUrl => {
                self.notification_image_url = Some(as_text(field, value)?);
            }
            RoomField::NotificationStatus => {
                self.notification_status = Some(as_text(field, value)?);
            }
            RoomField::UpdatedAt => self.updated_at = Some(as_unsigned(field, value)?),
        }
        Ok(())
    }

    /// Current value of a field, if written.
    pub fn get(&self, field: RoomField) -> Option<FieldValue> {
        let text = |v: &Option<String>| v.clone().map(FieldValue::Text);
        match field {
            RoomField::RoomId => self.room_id.map(|c| FieldValue::Integer(c.to_i64())),
            RoomField::Type => text(&self.treasure_type),
            RoomField::DisplayName => text(&self.display_name),
            RoomField::HostedAnchorId => text(&self.hosted_anchor_id),
            RoomField::IdentifyStatus => text(&self.identify_status),
            RoomField::IdentifyHint => text(&self.identify_hint),
            RoomField::Latitude => self.latitude.map(FieldValue::Real),
            RoomField::Longitude => self.longitude.map(FieldValue::Real),
            RoomField::NotificationTitle => text(&self.notification_title),
            RoomField::NotificationMessage => text(&self.notification_message),
            RoomField::NotificationImageUrl => text(&self.notification_image_url),
            RoomField::NotificationStatus => text(&self.notification_status),
            RoomField::UpdatedAt => self
                .updated_at
                .map(|t| FieldValue::Integer(i64::try_from(t).unwrap_or(i64::MAX))),
        }
    }
}

fn as_text(field: RoomField, value: FieldValue) -> Result<String, RecordError> {
    match value {
        FieldValue::Text(s) => Ok(s),
        _ => Err(RecordError::TypeMismatch {
            field,
            expected: "text",
        }),
    }
}

fn as_real(field: RoomField, value: FieldValue) -> Result<f64, RecordError> {
    match value {
        FieldValue::Real(v) => Ok(v),
        FieldValue::Integer(v) => i32::try_from(v).map(f64::from).map_err(|_| {
            RecordError::TypeMismatch {
                field,
                expected: "number",
            }
        }),
        FieldValue::Text(_) => Err(RecordError::TypeMismatch {
            field,
            expected: "number",
        }),
    }
}

fn as_unsigned(field: RoomField, value: FieldValue) -> Result<u64, RecordError> {
    match value {
        FieldValue::Integer(v) => u64::try_from(v).map_err(|_| RecordError::TypeMismatch {
            field,
            expected: "non-negative integer",
        }),
        _ => Err(RecordError::TypeMismatch {
            field,
            expected: "non-negative integer",
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::float_cmp)]
    use super::*;

    #[test]
    fn empty_anchor_id_is_not_an_anchor() {
        let mut record = RoomRecord::default();
        record
            .apply(RoomField::HostedAnchorId, FieldValue::Text(String::new()))
            .unwrap();
        assert!(!record.is_empty());
        assert_eq!(record.anchor_id(), None);
    }

    #[test]
    fn wrong_shapes_are_rejected() {
        let mut record = RoomRecord::default();
        assert_eq!(
            record.apply(RoomField::Latitude, FieldValue::Text("north".into())),
            Err(RecordError::TypeMismatch {
                field: RoomField::Latitude,
                expected: "number",
            })
        );
        assert_eq!(
            record.apply(RoomField::RoomId, FieldValue::Integer(0)),
            Err(RecordError::InvalidRoomCode(0))
        );
        assert_eq!(
            record.apply(RoomField::UpdatedAt, FieldValue::Integer(-1)),
            Err(RecordError::TypeMismatch {
                field: RoomField::UpdatedAt,
                expected: "non-negative integer",
            })
        );
        assert!(record.is_empty());

        record
            .apply(RoomField::Latitude, FieldValue::Integer(-33))
            .unwrap();
        assert_eq!(record.latitude, Some(-33.0));
        assert!(record
            .apply(RoomField::Longitude, FieldValue::Integer(i64::MAX))
            .is_err());
    }

    #[test]
    fn get_reflects_apply() {
        let mut record = RoomRecord::default();
        record
            .apply(RoomField::NotificationImageUrl, FieldValue::Text("images/7_hint.jpg".into()))
            .unwrap();
        record.apply(RoomField::Longitude, FieldValue::Integer(3)).unwrap();
        assert_eq!(
            record.get(RoomField::NotificationImageUrl),
            Some(FieldValue::Text("images/7_hint.jpg".into()))
        );
        assert_eq!(record.get(RoomField::Longitude), Some(FieldValue::Real(3.0)));
        assert_eq!(record.get(RoomField::Type), None);
    }

    #[test]
    fn field_keys_round_trip_through_serde() {
        for field in RoomField::ALL {
            let json = serde_json::to_string(&field).unwrap();
            assert_eq!(json, format!("\"{}\"", field.key()));
        }
    }
}

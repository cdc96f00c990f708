// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Topic fan-out port for planted-treasure notifications.

use huntar_room_proto::HuntNotification;

use crate::error::NotifyError;

/// Publishes notifications to every subscriber of a topic.
///
/// Formatting and presenting the notification is the subscriber's concern.
pub trait TopicNotifier: Send + Sync {
    /// Publish `notification` on `topic`.
    fn publish(&self, topic: &str, notification: &HuntNotification) -> Result<(), NotifyError>;
}

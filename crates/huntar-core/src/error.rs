// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types for room stores, allocation, sessions and coordination.

use huntar_room_proto::{CloudAnchorId, RecordError, RoomCode};
use thiserror::Error;

/// Failures reported by a [`crate::store::RoomStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The connection to the backing store is gone.
    #[error("room store disconnected")]
    Disconnected,
    /// No reply arrived within the request timeout.
    #[error("room store request timed out")]
    Timeout,
    /// The store refused the request.
    #[error("room store rejected request: {0}")]
    Rejected(String),
    /// Transport or encoding failure.
    #[error("room store backend error: {0}")]
    Backend(String),
    /// A write carried a malformed value.
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Why a room code could not be allocated. No code was consumed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// Every transaction attempt lost a version race.
    #[error("room counter still contended after {attempts} attempts")]
    ConflictExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// The counter cannot be incremented further.
    #[error("room counter overflow")]
    Overflow,
    /// Reading or writing the counter failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures starting work on the AR session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The camera is not tracking.
    #[error("camera is not tracking")]
    NotTracking,
    /// The session refused the request.
    #[error("session error: {0}")]
    Backend(String),
}

/// A join field was set twice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    /// The room code is already known for this attempt.
    #[error("room code already set to {0}")]
    RoomCodeAlreadySet(RoomCode),
    /// The anchor id is already known for this attempt.
    #[error("anchor id already set to {0}")]
    AnchorIdAlreadySet(CloudAnchorId),
}

/// Failures of coordinator-level operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    /// Hosting needs a placed anchor.
    #[error("no anchor has been placed")]
    NoAnchorPlaced,
    /// Another hosting or resolving operation is active.
    #[error("a hosting or resolving operation is already active")]
    Busy,
    /// The AR session refused the request.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The room store refused the request.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures publishing to a topic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    /// The notification could not be encoded.
    #[error("notification encode error: {0}")]
    Encode(String),
    /// The transport carrying the notification failed.
    #[error(transparent)]
    Transport(#[from] StoreError),
}

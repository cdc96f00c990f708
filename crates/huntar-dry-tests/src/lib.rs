// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for HuntAR crates.
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`session`] - Scripted AR session driver and anchors
//! - [`store`] - Room store wrapper that records and sabotages writes
//! - [`notify`] - Topic notifier that records what was published
#![forbid(unsafe_code)]
// Fixtures fail loudly on impossible inputs.
#![allow(clippy::panic, clippy::expect_used)]

pub mod config;
pub mod notify;
pub mod session;
pub mod store;

pub use config::InMemoryConfigStore;
pub use notify::RecordingNotifier;
pub use session::{FakeAnchor, FakeSessionDriver, SessionCall};
pub use store::RecordingRoomStore;

use huntar_room_proto::{CloudAnchorId, RoomCode};

/// Room code fixture. Panics on zero.
pub fn room_code(code: u64) -> RoomCode {
    RoomCode::new(code).expect("room codes are positive")
}

/// Cloud anchor id fixture. Panics on empty input.
pub fn anchor_id(id: &str) -> CloudAnchorId {
    CloudAnchorId::new(id).expect("anchor ids are non-empty")
}

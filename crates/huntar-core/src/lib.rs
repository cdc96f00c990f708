// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cloud-anchor hosting and resolving coordination.
//!
//! A hosting device allocates a room code, hosts a local anchor with the
//! cloud-anchor backend, and publishes the `{room code → anchor id}` pairing
//! once both halves are known. A resolving device watches a room code and
//! resolves whatever anchor id shows up there.
//!
//! # Modules
//!
//! - [`allocator`] - unique room codes from a shared counter
//! - [`manager`] - pending host/resolve tasks and their completions
//! - [`publisher`] - the join gating the one-shot pairing publish
//! - [`subscription`] - room watches delivering anchor ids
//! - [`slot`] - the single displayed anchor
//! - [`tap`] - the queued user tap
//! - [`coordinator`] - per-device composition driven once per frame
//! - [`catalog`] - open-treasure listing and found marking
//! - [`store`] - the realtime room store port and an in-memory store
//! - [`notify`] - the planted-treasure topic port
//! - [`anchor`] - the AR session port

pub mod allocator;
pub mod anchor;
pub mod catalog;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod notify;
pub mod publisher;
pub mod slot;
pub mod store;
pub mod subscription;
pub mod tap;

pub use allocator::RoomCodeAllocator;
pub use anchor::{
    AnchorKey, CloudAnchorError, CloudAnchorState, HitResult, HitSurface, LocalAnchor, Pose,
    ScreenTap, SessionDriver, TrackingState,
};
pub use coordinator::{
    AnchorCoordinator, CoordinatorEvent, CoordinatorOptions, HostResolveMode, DEFAULT_TOPIC,
};
pub use error::{
    AllocationError, CoordinationError, JoinError, NotifyError, SessionError, StoreError,
};
pub use manager::{
    completion_channel, AnchorOutcome, CloudAnchorManager, TaskId, TaskKind, TerminalState,
};
pub use notify::TopicNotifier;
pub use publisher::{PairingPublisher, PublishReport, RoomJoin, TreasureDraft};
pub use slot::AnchorSlot;
pub use store::{
    memory::MemoryRoomStore, CounterCommit, CounterSnapshot, RoomEvent, RoomListener, RoomStore,
    SharedRoomStore, WatchId,
};
pub use subscription::{RoomSubscription, RoomWatch, WatchEvent};
pub use tap::TapQueue;

/// Milliseconds since the Unix epoch, saturating at zero for clocks set
/// before 1970.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

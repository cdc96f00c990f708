// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scripted AR session: anchors whose cloud state tests drive by hand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use huntar_core::anchor::{
    AnchorKey, CloudAnchorError, CloudAnchorState, HitResult, HitSurface, LocalAnchor, Pose,
    ScreenTap, SessionDriver, TrackingState,
};
use huntar_core::error::SessionError;
use huntar_room_proto::CloudAnchorId;

/// Calls observed by a [`FakeSessionDriver`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    /// An anchor was created from a hit.
    CreateAnchor(AnchorKey),
    /// Hosting started for `source`, tracked by `tracked`.
    Host {
        /// Anchor handed to the session.
        source: AnchorKey,
        /// Anchor tracking the hosting.
        tracked: AnchorKey,
    },
    /// Resolving started for `id`, tracked by `tracked`.
    Resolve {
        /// Id being resolved.
        id: CloudAnchorId,
        /// Anchor tracking the resolve.
        tracked: AnchorKey,
    },
    /// An anchor was detached.
    Detach(AnchorKey),
}

type CallLog = Arc<Mutex<Vec<SessionCall>>>;

#[derive(Debug)]
struct AnchorState {
    cloud: CloudAnchorState,
    cloud_id: Option<CloudAnchorId>,
    detached: bool,
}

/// Anchor handle whose cloud state is set by the test. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeAnchor {
    key: AnchorKey,
    state: Arc<Mutex<AnchorState>>,
    log: CallLog,
}

impl FakeAnchor {
    fn new(key: AnchorKey, cloud: CloudAnchorState, log: CallLog) -> Self {
        Self {
            key,
            state: Arc::new(Mutex::new(AnchorState {
                cloud,
                cloud_id: None,
                detached: false,
            })),
            log,
        }
    }

    /// Standalone anchor with its own call log.
    pub fn standalone(key: u64) -> Self {
        Self::new(
            AnchorKey(key),
            CloudAnchorState::None,
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut AnchorState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Overwrite the cloud state.
    pub fn set_cloud_state(&self, cloud: CloudAnchorState) {
        self.with_state(|s| s.cloud = cloud);
    }

    /// Mark the backend operation successful with `id`.
    pub fn succeed(&self, id: &CloudAnchorId) {
        self.with_state(|s| {
            s.cloud = CloudAnchorState::Success;
            s.cloud_id = Some(id.clone());
        });
    }

    /// Mark the backend operation failed.
    pub fn fail(&self, err: CloudAnchorError) {
        self.set_cloud_state(CloudAnchorState::Error(err));
    }

    /// Whether `detach` was called on any handle.
    pub fn is_detached(&self) -> bool {
        self.with_state(|s| s.detached)
    }
}

impl LocalAnchor for FakeAnchor {
    fn key(&self) -> AnchorKey {
        self.key
    }

    fn cloud_state(&self) -> CloudAnchorState {
        self.with_state(|s| s.cloud)
    }

    fn cloud_anchor_id(&self) -> Option<CloudAnchorId> {
        self.with_state(|s| s.cloud_id.clone())
    }

    fn detach(&self) {
        self.with_state(|s| s.detached = true);
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SessionCall::Detach(self.key));
    }
}

struct DriverState {
    tracking: TrackingState,
    hits: Vec<HitResult>,
    updates: VecDeque<FakeAnchor>,
    created: Vec<FakeAnchor>,
    hosting: Vec<FakeAnchor>,
    resolving: Vec<(CloudAnchorId, FakeAnchor)>,
    fail_next_host: Option<SessionError>,
    fail_next_resolve: Option<SessionError>,
    fail_next_create: Option<SessionError>,
}

/// Session driver whose frames, hits and backend results are scripted.
///
/// Starts tracking with a single placeable plane hit.
pub struct FakeSessionDriver {
    state: Mutex<DriverState>,
    log: CallLog,
    next_key: AtomicU64,
    panic_next_poll: AtomicBool,
}

impl Default for FakeSessionDriver {
    fn default() -> Self {
        Self {
            state: Mutex::new(DriverState {
                tracking: TrackingState::Tracking,
                hits: vec![plane_hit()],
                updates: VecDeque::new(),
                created: Vec::new(),
                hosting: Vec::new(),
                resolving: Vec::new(),
                fail_next_host: None,
                fail_next_resolve: None,
                fail_next_create: None,
            }),
            log: Arc::new(Mutex::new(Vec::new())),
            next_key: AtomicU64::new(1),
            panic_next_poll: AtomicBool::new(false),
        }
    }
}

/// A placeable hit on a plane interior.
pub fn plane_hit() -> HitResult {
    HitResult {
        pose: Pose::default(),
        surface: HitSurface::PlaneInsidePolygon,
    }
}

impl FakeSessionDriver {
    /// Tracking driver with one plane hit.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: SessionCall) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn mint(&self, cloud: CloudAnchorState) -> FakeAnchor {
        let key = AnchorKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        FakeAnchor::new(key, cloud, self.log.clone())
    }

    /// An anchor owned by this session, as if created out of band.
    pub fn anchor(&self) -> FakeAnchor {
        self.mint(CloudAnchorState::None)
    }

    /// Set the camera tracking state.
    pub fn set_tracking(&self, tracking: TrackingState) {
        self.lock().tracking = tracking;
    }

    /// Set the results every hit test returns.
    pub fn set_hits(&self, hits: Vec<HitResult>) {
        self.lock().hits = hits;
    }

    /// Report `anchor` as updated on the next frame.
    pub fn push_update(&self, anchor: &FakeAnchor) {
        self.lock().updates.push_back(anchor.clone());
    }

    /// Finish the most recent hosting with `id` and report it next frame.
    pub fn finish_hosting(&self, id: &CloudAnchorId) -> Option<FakeAnchor> {
        let tracked = self.lock().hosting.last().cloned()?;
        tracked.succeed(id);
        self.push_update(&tracked);
        Some(tracked)
    }

    /// Finish the most recent resolve and report it next frame.
    pub fn finish_resolving(&self) -> Option<FakeAnchor> {
        let (id, tracked) = self.lock().resolving.last().cloned()?;
        tracked.succeed(&id);
        self.push_update(&tracked);
        Some(tracked)
    }

    /// Anchors created from hits.
    pub fn created(&self) -> Vec<FakeAnchor> {
        self.lock().created.clone()
    }

    /// Anchors tracking hosting operations.
    pub fn hosting(&self) -> Vec<FakeAnchor> {
        self.lock().hosting.clone()
    }

    /// Anchors tracking resolve operations.
    pub fn resolving(&self) -> Vec<FakeAnchor> {
        self.lock().resolving.iter().map(|(_, a)| a.clone()).collect()
    }

    /// Ids passed to `resolve_anchor`, in order.
    pub fn resolved_ids(&self) -> Vec<CloudAnchorId> {
        self.lock().resolving.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Every recorded call.
    pub fn calls(&self) -> Vec<SessionCall> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Refuse the next `host_anchor` call.
    pub fn fail_next_host(&self, err: SessionError) {
        self.lock().fail_next_host = Some(err);
    }

    /// Refuse the next `resolve_anchor` call.
    pub fn fail_next_resolve(&self, err: SessionError) {
        self.lock().fail_next_resolve = Some(err);
    }

    /// Refuse the next `create_anchor_from_hit` call.
    pub fn fail_next_create(&self, err: SessionError) {
        self.lock().fail_next_create = Some(err);
    }

    /// Panic inside the next `poll_updated_anchors` call.
    pub fn panic_next_poll(&self) {
        self.panic_next_poll.store(true, Ordering::SeqCst);
    }
}

impl SessionDriver for FakeSessionDriver {
    type Anchor = FakeAnchor;

    fn camera_tracking_state(&self) -> TrackingState {
        self.lock().tracking
    }

    fn hit_test(&self, _tap: ScreenTap) -> Vec<HitResult> {
        self.lock().hits.clone()
    }

    fn create_anchor_from_hit(&self, _hit: &HitResult) -> Result<FakeAnchor, SessionError> {
        if let Some(err) = self.lock().fail_next_create.take() {
            return Err(err);
        }
        let anchor = self.mint(CloudAnchorState::None);
        self.lock().created.push(anchor.clone());
        self.record(SessionCall::CreateAnchor(anchor.key()));
        Ok(anchor)
    }

    fn host_anchor(&self, anchor: &FakeAnchor) -> Result<FakeAnchor, SessionError> {
        if let Some(err) = self.lock().fail_next_host.take() {
            return Err(err);
        }
        let tracked = self.mint(CloudAnchorState::TaskInProgress);
        self.lock().hosting.push(tracked.clone());
        self.record(SessionCall::Host {
            source: anchor.key(),
            tracked: tracked.key(),
        });
        Ok(tracked)
    }

    fn resolve_anchor(&self, anchor_id: &CloudAnchorId) -> Result<FakeAnchor, SessionError> {
        if let Some(err) = self.lock().fail_next_resolve.take() {
            return Err(err);
        }
        let tracked = self.mint(CloudAnchorState::TaskInProgress);
        self.lock()
            .resolving
            .push((anchor_id.clone(), tracked.clone()));
        self.record(SessionCall::Resolve {
            id: anchor_id.clone(),
            tracked: tracked.key(),
        });
        Ok(tracked)
    }

    fn poll_updated_anchors(&self) -> Vec<FakeAnchor> {
        if self.panic_next_poll.swap(false, Ordering::SeqCst) {
            panic!("scripted frame failure");
        }
        self.lock().updates.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::anchor_id;

    #[test]
    fn hosting_tracks_a_fresh_anchor() {
        let driver = FakeSessionDriver::new();
        let source = driver.anchor();
        let tracked = driver.host_anchor(&source).unwrap();
        assert_ne!(source.key(), tracked.key());
        assert_eq!(tracked.cloud_state(), CloudAnchorState::TaskInProgress);

        let done = driver.finish_hosting(&anchor_id("ua-9")).unwrap();
        assert_eq!(done.key(), tracked.key());
        let updates = driver.poll_updated_anchors();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].cloud_anchor_id(), Some(anchor_id("ua-9")));
        assert!(driver.poll_updated_anchors().is_empty());
    }

    #[test]
    fn detach_is_logged_and_shared_between_clones() {
        let driver = FakeSessionDriver::new();
        let a = driver.anchor();
        let b = a.clone();
        b.detach();
        assert!(a.is_detached());
        assert_eq!(driver.calls(), vec![SessionCall::Detach(a.key())]);
    }

    #[test]
    fn scripted_failures_fire_once() {
        let driver = FakeSessionDriver::new();
        driver.fail_next_resolve(SessionError::NotTracking);
        let id = anchor_id("x");
        assert!(driver.resolve_anchor(&id).is_err());
        assert!(driver.resolve_anchor(&id).is_ok());
        assert_eq!(driver.resolved_ids(), vec![id]);
    }
}

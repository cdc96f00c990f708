// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Port onto the AR session and the anchors it tracks.
//!
//! Rendering, camera lifecycle and the cloud-anchor backend live behind
//! [`SessionDriver`]; the coordination logic only ever sees anchor handles,
//! their cloud state, and hit-test results.

use huntar_room_proto::CloudAnchorId;

use crate::error::SessionError;

/// Session-local anchor identity. Stable across handles to the same anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorKey(pub u64);

/// Terminal error kinds reported by the cloud-anchor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudAnchorError {
    /// Internal backend failure.
    Internal,
    /// The app is not authorized to use the backend.
    NotAuthorized,
    /// The backend could not be reached.
    ServiceUnavailable,
    /// Quota exhausted.
    ResourceExhausted,
    /// Not enough visual data was gathered to host.
    HostingDatasetProcessingFailed,
    /// No hosted anchor has this id.
    CloudIdNotFound,
    /// The surroundings did not match the hosted anchor.
    ResolvingLocalizationNoMatch,
    /// The anchor was hosted with a newer SDK.
    ResolvingSdkVersionTooOld,
    /// The anchor was hosted with an older, unsupported SDK.
    ResolvingSdkVersionTooNew,
}

/// Cloud state of an anchor as classified by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudAnchorState {
    /// Not a cloud anchor.
    None,
    /// Hosting or resolving is still running.
    TaskInProgress,
    /// Hosting or resolving finished.
    Success,
    /// Hosting or resolving failed for good.
    Error(CloudAnchorError),
}

impl CloudAnchorState {
    /// Success or a defined error: no further transitions happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, CloudAnchorState::Success | CloudAnchorState::Error(_))
    }
}

/// Camera tracking state for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingState {
    /// Poses are valid.
    Tracking,
    /// Tracking is temporarily lost.
    Paused,
    /// Tracking has stopped.
    Stopped,
}

/// Rigid transform in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    /// Translation in meters.
    pub translation: [f32; 3],
    /// Rotation quaternion `(x, y, z, w)`.
    pub rotation: [f32; 4],
}

/// Screen coordinates of a single tap, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenTap {
    /// Horizontal pixel.
    pub x: f32,
    /// Vertical pixel.
    pub y: f32,
}

/// What a hit-test ray struck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitSurface {
    /// A detected plane, inside its polygon.
    PlaneInsidePolygon,
    /// A detected plane's extent, outside its polygon.
    PlaneOutsidePolygon,
    /// A feature point with an estimated surface normal.
    OrientedPoint,
    /// A feature point without orientation.
    Point,
    /// Anything else the session reports.
    Other,
}

/// One hit-test result, nearest first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitResult {
    /// Where the ray struck.
    pub pose: Pose,
    /// What it struck.
    pub surface: HitSurface,
}

impl HitResult {
    /// Anchors may be placed on plane interiors and on oriented points.
    pub fn is_placeable(&self) -> bool {
        matches!(
            self.surface,
            HitSurface::PlaneInsidePolygon | HitSurface::OrientedPoint
        )
    }
}

/// Handle to a session anchor. Cloning yields another handle to the same
/// anchor.
pub trait LocalAnchor: Clone + Send + Sync + 'static {
    /// Identity shared by every handle to this anchor.
    fn key(&self) -> AnchorKey;
    /// Current cloud state.
    fn cloud_state(&self) -> CloudAnchorState;
    /// Backend id, once hosting succeeded or for resolved anchors.
    fn cloud_anchor_id(&self) -> Option<CloudAnchorId>;
    /// Stop tracking the anchor and release its resources.
    fn detach(&self);
}

/// The AR session as seen by the coordination logic.
///
/// `host_anchor` and `resolve_anchor` only start backend work; progress is
/// observed through [`SessionDriver::poll_updated_anchors`] once per frame.
pub trait SessionDriver: Send + Sync + 'static {
    /// Anchor handle type.
    type Anchor: LocalAnchor;

    /// Camera tracking state for the current frame.
    fn camera_tracking_state(&self) -> TrackingState;
    /// Hit-test a tap against the current frame, nearest result first.
    fn hit_test(&self, tap: ScreenTap) -> Vec<HitResult>;
    /// Create a local anchor at a hit pose.
    fn create_anchor_from_hit(&self, hit: &HitResult) -> Result<Self::Anchor, SessionError>;
    /// Start hosting `anchor`; returns the anchor that tracks the hosting.
    fn host_anchor(&self, anchor: &Self::Anchor) -> Result<Self::Anchor, SessionError>;
    /// Start resolving `anchor_id`; returns the anchor that tracks the resolve.
    fn resolve_anchor(&self, anchor_id: &CloudAnchorId) -> Result<Self::Anchor, SessionError>;
    /// Anchors whose state changed since the previous frame.
    fn poll_updated_anchors(&self) -> Vec<Self::Anchor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_success_and_errors_are_terminal() {
        assert!(!CloudAnchorState::None.is_terminal());
        assert!(!CloudAnchorState::TaskInProgress.is_terminal());
        assert!(CloudAnchorState::Success.is_terminal());
        assert!(CloudAnchorState::Error(CloudAnchorError::CloudIdNotFound).is_terminal());
    }

    #[test]
    fn hits_on_plane_edges_and_bare_points_are_not_placeable() {
        let hit = |surface| HitResult {
            pose: Pose::default(),
            surface,
        };
        assert!(hit(HitSurface::PlaneInsidePolygon).is_placeable());
        assert!(hit(HitSurface::OrientedPoint).is_placeable());
        assert!(!hit(HitSurface::PlaneOutsidePolygon).is_placeable());
        assert!(!hit(HitSurface::Point).is_placeable());
        assert!(!hit(HitSurface::Other).is_placeable());
    }
}

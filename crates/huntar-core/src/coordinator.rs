// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-device composition of the hosting and resolving flows.
//!
//! The render thread calls [`AnchorCoordinator::on_frame`] once per frame; the
//! UI thread queues taps and starts/cancels operations. Everything the UI
//! needs to show is reported as a [`CoordinatorEvent`] on a channel.
//!
//! Lock order when handling a tap: tap queue, then anchor slot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};

use huntar_room_proto::{CloudAnchorId, RoomCode, DEFAULT_DISPLAY_NAME};
use tracing::{debug, error, info, warn};

use crate::allocator::{RoomCodeAllocator, DEFAULT_MAX_ATTEMPTS};
use crate::anchor::{
    AnchorKey, CloudAnchorError, LocalAnchor, ScreenTap, SessionDriver, TrackingState,
};
use crate::error::{AllocationError, CoordinationError, NotifyError, SessionError};
use crate::manager::{AnchorOutcome, CloudAnchorManager, TerminalState};
use crate::notify::TopicNotifier;
use crate::publisher::{PairingPublisher, PublishReport, RoomJoin, TreasureDraft};
use crate::slot::AnchorSlot;
use crate::store::SharedRoomStore;
use crate::subscription::{RoomSubscription, WatchEvent};
use crate::tap::TapQueue;

/// Topic planted-treasure notifications go to unless configured otherwise.
pub const DEFAULT_TOPIC: &str = "treasure-hunt";

/// Which long-running operation the device is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HostResolveMode {
    /// Idle: taps place or move the anchor.
    #[default]
    None,
    /// Hosting the placed anchor and publishing it.
    Hosting,
    /// Watching a room and resolving its anchor.
    Resolving,
}

/// Progress reported to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A tap placed a new anchor or moved the existing one.
    AnchorPlaced {
        /// The new anchor.
        anchor: AnchorKey,
        /// True when an earlier anchor was replaced.
        repositioned: bool,
    },
    /// The session could not create an anchor at the tapped hit.
    PlacementFailed(SessionError),
    /// The hosting attempt got its room code.
    RoomCodeAllocated(RoomCode),
    /// The room code transaction failed; hosting continues, nothing is published.
    AllocationFailed(AllocationError),
    /// The backend hosted the anchor.
    AnchorHosted(CloudAnchorId),
    /// The backend failed to host the anchor.
    HostFailed(CloudAnchorError),
    /// The pairing was written to the room store.
    Published(PublishReport),
    /// The planted-treasure notification went out.
    NotificationSent {
        /// Published room.
        room: RoomCode,
        /// Topic used.
        topic: String,
    },
    /// The planted-treasure notification could not be sent.
    NotificationFailed {
        /// Published room.
        room: RoomCode,
        /// Why.
        error: NotifyError,
    },
    /// A room watch is attached.
    WatchingRoom(RoomCode),
    /// The watched room delivered an anchor id.
    AnchorIdReceived {
        /// Watched room.
        room: RoomCode,
        /// Delivered id.
        anchor_id: CloudAnchorId,
    },
    /// The session refused to start resolving.
    ResolveStartFailed {
        /// Id that was to be resolved.
        anchor_id: CloudAnchorId,
        /// Why.
        error: SessionError,
    },
    /// The anchor was resolved and is now displayed.
    AnchorResolved {
        /// Watched room.
        room: RoomCode,
        /// Resolved id.
        anchor_id: CloudAnchorId,
    },
    /// The backend failed to resolve the anchor.
    ResolveFailed {
        /// Watched room.
        room: RoomCode,
        /// Id that failed.
        anchor_id: CloudAnchorId,
        /// Backend error.
        error: CloudAnchorError,
    },
    /// The room store ended the watch.
    WatchCancelled {
        /// Watched room.
        room: RoomCode,
        /// Store-supplied reason.
        reason: String,
    },
    /// A frame failed; state was kept for the next frame.
    FrameFailed(String),
    /// Everything was reset to idle.
    Reset,
}

/// Tunables for a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Topic for planted-treasure notifications.
    pub topic: String,
    /// Room counter transaction attempts.
    pub counter_attempts: u32,
    /// Display name written into room records.
    pub display_name: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            counter_attempts: DEFAULT_MAX_ATTEMPTS,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
        }
    }
}

struct HostingAttempt {
    generation: u64,
    join: Mutex<RoomJoin>,
    draft: TreasureDraft,
}

struct Shared<D: SessionDriver> {
    manager: CloudAnchorManager<D>,
    slot: AnchorSlot<D::Anchor>,
    taps: TapQueue,
    mode: Mutex<HostResolveMode>,
    hosting: Mutex<Option<Arc<HostingAttempt>>>,
    // Bumped by reset; callbacks from an older generation are ignored.
    generation: AtomicU64,
    allocator: RoomCodeAllocator,
    publisher: PairingPublisher,
    subscription: RoomSubscription,
    notifier: Option<Arc<dyn TopicNotifier>>,
    topic: String,
    events: Sender<CoordinatorEvent>,
}

impl<D: SessionDriver> Shared<D> {
    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    fn mode(&self) -> HostResolveMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Switch from idle into `mode`, returning the generation it runs under.
    fn enter(&self, mode: HostResolveMode) -> Result<u64, CoordinationError> {
        let mut current = self.mode.lock().unwrap_or_else(|e| e.into_inner());
        if *current != HostResolveMode::None {
            return Err(CoordinationError::Busy);
        }
        *current = mode;
        Ok(self.generation.load(Ordering::SeqCst))
    }

    fn leave(&self, generation: u64) {
        if self.is_current(generation) {
            *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = HostResolveMode::None;
        }
    }

    fn frame(&self) {
        let updated = self.manager.driver().poll_updated_anchors();
        self.manager.on_update(&updated);
        let tracking = self.manager.driver().camera_tracking_state();
        self.handle_tap(tracking);
    }

    fn handle_tap(&self, tracking: TrackingState) {
        let mut queued = self.taps.lock();
        let Some(tap) = queued.take() else {
            return;
        };
        if tracking != TrackingState::Tracking || self.mode() != HostResolveMode::None {
            debug!(?tracking, "tap ignored");
            return;
        }
        let mut slot = self.slot.lock();
        let driver = self.manager.driver();
        let Some(hit) = driver.hit_test(tap).into_iter().find(|h| h.is_placeable()) else {
            return;
        };
        match driver.create_anchor_from_hit(&hit) {
            Ok(anchor) => {
                let repositioned = slot.current().is_some();
                let key = anchor.key();
                slot.replace(Some(anchor));
                debug!(anchor = key.0, repositioned, "anchor placed");
                self.emit(CoordinatorEvent::AnchorPlaced {
                    anchor: key,
                    repositioned,
                });
            }
            Err(err) => {
                warn!(%err, "anchor placement failed");
                self.emit(CoordinatorEvent::PlacementFailed(err));
            }
        }
    }

    fn on_room_code(&self, attempt: &HostingAttempt, result: Result<RoomCode, AllocationError>) {
        if !self.is_current(attempt.generation) {
            debug!("room code arrived after reset; dropped");
            return;
        }
        match result {
            Ok(room) => {
                let mut join = attempt.join.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(err) = join.set_room_code(room) {
                    warn!(%err, "room code ignored");
                    return;
                }
                self.emit(CoordinatorEvent::RoomCodeAllocated(room));
                self.maybe_publish(attempt, &mut join);
            }
            Err(err) => {
                warn!(%err, "room code allocation failed");
                self.emit(CoordinatorEvent::AllocationFailed(err));
            }
        }
    }

    fn on_hosted(&self, attempt: &HostingAttempt, outcome: AnchorOutcome<D::Anchor>) {
        if !self.is_current(attempt.generation) {
            outcome.anchor.detach();
            return;
        }
        let anchor_id = match (outcome.state, outcome.cloud_anchor_id()) {
            (TerminalState::Success, Some(id)) => id,
            (TerminalState::Success, None) => {
                warn!("hosted anchor carries no cloud id");
                self.emit(CoordinatorEvent::HostFailed(CloudAnchorError::Internal));
                return;
            }
            (TerminalState::Failed(err), _) => {
                warn!(?err, "hosting failed");
                self.emit(CoordinatorEvent::HostFailed(err));
                return;
            }
        };
        self.slot.replace(Some(outcome.anchor));
        info!(anchor = %anchor_id, "anchor hosted");
        self.emit(CoordinatorEvent::AnchorHosted(anchor_id.clone()));
        let mut join = attempt.join.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = join.set_anchor_id(anchor_id) {
            warn!(%err, "anchor id ignored");
            return;
        }
        self.maybe_publish(attempt, &mut join);
    }

    /// Claim a completed join and write it from a worker thread; the frame
    /// that completed it never waits on the store.
    fn maybe_publish(&self, attempt: &HostingAttempt, join: &mut RoomJoin) {
        let Some((room, anchor)) = join.claim() else {
            return;
        };
        debug!(%room, "pairing complete; publishing");
        let notifier = self.notifier.clone();
        let topic = self.topic.clone();
        let events = self.events.clone();
        self.publisher
            .publish_in_background(room, anchor, attempt.draft.clone(), move |report| {
                announce(report, notifier.as_deref(), topic, &events);
            });
    }

    fn on_resolved(
        &self,
        generation: u64,
        room: RoomCode,
        anchor_id: CloudAnchorId,
        outcome: AnchorOutcome<D::Anchor>,
    ) {
        if !self.is_current(generation) {
            outcome.anchor.detach();
            return;
        }
        match outcome.state {
            TerminalState::Success => {
                self.slot.replace(Some(outcome.anchor));
                info!(%room, anchor = %anchor_id, "anchor resolved");
                self.emit(CoordinatorEvent::AnchorResolved { room, anchor_id });
            }
            TerminalState::Failed(error) => {
                warn!(%room, anchor = %anchor_id, ?error, "resolve failed");
                self.emit(CoordinatorEvent::ResolveFailed {
                    room,
                    anchor_id,
                    error,
                });
            }
        }
    }
}

fn announce(
    report: PublishReport,
    notifier: Option<&dyn TopicNotifier>,
    topic: String,
    events: &Sender<CoordinatorEvent>,
) {
    let room = report.room;
    let notification = report.notification.clone();
    let _ = events.send(CoordinatorEvent::Published(report));
    let Some(notifier) = notifier else {
        return;
    };
    let event = match notifier.publish(&topic, &notification) {
        Ok(()) => CoordinatorEvent::NotificationSent { room, topic },
        Err(error) => {
            warn!(%room, %error, "planted-treasure notification failed");
            CoordinatorEvent::NotificationFailed { room, error }
        }
    };
    let _ = events.send(event);
}

fn on_watch_event<D: SessionDriver>(
    weak: &Weak<Shared<D>>,
    generation: u64,
    room: RoomCode,
    event: WatchEvent,
) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    if !shared.is_current(generation) {
        return;
    }
    match event {
        WatchEvent::AnchorId(anchor_id) => {
            shared.emit(CoordinatorEvent::AnchorIdReceived {
                room,
                anchor_id: anchor_id.clone(),
            });
            let w = weak.clone();
            let id = anchor_id.clone();
            let started = shared.manager.resolve_anchor(&anchor_id, move |outcome| {
                if let Some(shared) = w.upgrade() {
                    shared.on_resolved(generation, room, id, outcome);
                }
            });
            if let Err(error) = started {
                warn!(%room, anchor = %anchor_id, %error, "resolve could not start");
                shared.emit(CoordinatorEvent::ResolveStartFailed { anchor_id, error });
            }
        }
        WatchEvent::Cancelled(reason) => {
            shared.emit(CoordinatorEvent::WatchCancelled { room, reason });
        }
    }
}

/// Hosting and resolving for one device and one AR session.
pub struct AnchorCoordinator<D: SessionDriver> {
    shared: Arc<Shared<D>>,
}

impl<D: SessionDriver> AnchorCoordinator<D> {
    /// Coordinator with default options and no topic notifier.
    pub fn new(driver: Arc<D>, store: SharedRoomStore) -> (Self, Receiver<CoordinatorEvent>) {
        Self::with_options(driver, store, None, CoordinatorOptions::default())
    }

    /// Fully configured coordinator.
    pub fn with_options(
        driver: Arc<D>,
        store: SharedRoomStore,
        notifier: Option<Arc<dyn TopicNotifier>>,
        options: CoordinatorOptions,
    ) -> (Self, Receiver<CoordinatorEvent>) {
        let (events, rx) = mpsc::channel();
        let shared = Shared {
            manager: CloudAnchorManager::new(driver),
            slot: AnchorSlot::new(),
            taps: TapQueue::new(),
            mode: Mutex::new(HostResolveMode::None),
            hosting: Mutex::new(None),
            generation: AtomicU64::new(0),
            allocator: RoomCodeAllocator::new(store.clone())
                .with_max_attempts(options.counter_attempts),
            publisher: PairingPublisher::new(store.clone())
                .with_display_name(options.display_name),
            subscription: RoomSubscription::new(store),
            notifier,
            topic: options.topic,
            events,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Current mode.
    pub fn mode(&self) -> HostResolveMode {
        self.shared.mode()
    }

    /// Anchor currently displayed.
    pub fn current_anchor(&self) -> Option<D::Anchor> {
        self.shared.slot.current()
    }

    /// Tasks still waiting on the backend.
    pub fn pending_tasks(&self) -> usize {
        self.shared.manager.pending_count()
    }

    /// Room code of the active hosting attempt, once allocated.
    pub fn hosting_room(&self) -> Option<RoomCode> {
        let hosting = self
            .shared
            .hosting
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        hosting.as_ref().and_then(|attempt| {
            attempt
                .join
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .room_code()
        })
    }

    /// Room watched by the resolving flow.
    pub fn watched_room(&self) -> Option<RoomCode> {
        self.shared.subscription.watched_room()
    }

    /// Record a user tap; it is handled on the next frame.
    pub fn queue_tap(&self, tap: ScreenTap) {
        self.shared.taps.queue(tap);
    }

    /// Drive one frame: deliver anchor updates, then handle the queued tap.
    ///
    /// A panic inside the frame is caught and reported as
    /// [`CoordinatorEvent::FrameFailed`]; the coordinator stays usable.
    pub fn on_frame(&self) {
        let shared = &self.shared;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| shared.frame())) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%message, "frame failed");
            shared.emit(CoordinatorEvent::FrameFailed(message));
        }
    }

    /// Host the placed anchor and publish it under a fresh room code.
    ///
    /// Room code allocation runs on a worker thread while the backend hosts;
    /// whichever finishes last triggers the publish, which runs on its own
    /// worker thread.
    pub fn host_current_anchor(&self, draft: TreasureDraft) -> Result<(), CoordinationError> {
        let shared = &self.shared;
        let generation = shared.enter(HostResolveMode::Hosting)?;
        let Some(anchor) = shared.slot.current() else {
            shared.leave(generation);
            return Err(CoordinationError::NoAnchorPlaced);
        };
        let attempt = Arc::new(HostingAttempt {
            generation,
            join: Mutex::new(RoomJoin::new()),
            draft,
        });

        let weak = Arc::downgrade(shared);
        let hosted = attempt.clone();
        let started = shared.manager.host_anchor(&anchor, move |outcome| {
            if let Some(shared) = weak.upgrade() {
                shared.on_hosted(&hosted, outcome);
            }
        });
        if let Err(err) = started {
            shared.leave(generation);
            return Err(err.into());
        }
        *shared.hosting.lock().unwrap_or_else(|e| e.into_inner()) = Some(attempt.clone());

        let weak = Arc::downgrade(shared);
        shared.allocator.allocate_in_background(move |result| {
            if let Some(shared) = weak.upgrade() {
                shared.on_room_code(&attempt, result);
            }
        });
        info!("hosting started");
        Ok(())
    }

    /// Watch `room` and resolve each distinct anchor id it delivers.
    pub fn resolve_room(&self, room: RoomCode) -> Result<(), CoordinationError> {
        let shared = &self.shared;
        let generation = shared.enter(HostResolveMode::Resolving)?;
        let weak = Arc::downgrade(shared);
        let watched = shared
            .subscription
            .watch_events(room, move |event| on_watch_event(&weak, generation, room, event));
        if let Err(err) = watched {
            shared.leave(generation);
            return Err(err.into());
        }
        info!(%room, "resolving room");
        shared.emit(CoordinatorEvent::WatchingRoom(room));
        Ok(())
    }

    /// Abandon whatever is in progress and return to idle.
    ///
    /// Unwatches the room, drops the hosting attempt, detaches the displayed
    /// anchor and forgets pending tasks. Completions that arrive afterwards
    /// are ignored.
    pub fn reset(&self) {
        let shared = &self.shared;
        shared.generation.fetch_add(1, Ordering::SeqCst);
        shared.subscription.unwatch();
        shared.hosting.lock().unwrap_or_else(|e| e.into_inner()).take();
        shared.slot.clear();
        shared.manager.clear_listeners();
        *shared.mode.lock().unwrap_or_else(|e| e.into_inner()) = HostResolveMode::None;
        info!("coordinator reset");
        shared.emit(CoordinatorEvent::Reset);
    }
}

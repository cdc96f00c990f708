// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pending host/resolve tasks and their one-shot completions.
//!
//! Every task moves `PENDING → TASK_COMPLETE` exactly once: on the first
//! [`CloudAnchorManager::on_update`] call in which its anchor is reported with
//! a terminal cloud state. Completions run after the pending lock has been
//! released, so they may call back into the manager.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use huntar_room_proto::CloudAnchorId;
use tracing::{debug, warn};

use crate::anchor::{CloudAnchorError, CloudAnchorState, LocalAnchor, SessionDriver};
use crate::error::SessionError;

/// Identifier of one host or resolve task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Kind of backend operation a task tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Local anchor → hosted cloud anchor.
    Host,
    /// Cloud anchor id → local anchor.
    Resolve,
}

/// Terminal cloud state delivered with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalState {
    /// The backend finished the operation.
    Success,
    /// The backend gave up. The error is passed through untouched.
    Failed(CloudAnchorError),
}

impl TerminalState {
    fn from_cloud(state: CloudAnchorState) -> Option<Self> {
        match state {
            CloudAnchorState::Success => Some(TerminalState::Success),
            CloudAnchorState::Error(err) => Some(TerminalState::Failed(err)),
            CloudAnchorState::None | CloudAnchorState::TaskInProgress => None,
        }
    }
}

/// Result handed to a task's completion.
#[derive(Debug, Clone)]
pub struct AnchorOutcome<A> {
    /// Task that finished.
    pub task: TaskId,
    /// Host or resolve.
    pub kind: TaskKind,
    /// The tracked anchor; ownership passes to the completion.
    pub anchor: A,
    /// How it finished.
    pub state: TerminalState,
}

impl<A: LocalAnchor> AnchorOutcome<A> {
    /// True when the backend reported success.
    pub fn is_success(&self) -> bool {
        self.state == TerminalState::Success
    }

    /// Backend id of a successful outcome.
    pub fn cloud_anchor_id(&self) -> Option<CloudAnchorId> {
        if self.is_success() {
            self.anchor.cloud_anchor_id()
        } else {
            None
        }
    }
}

/// Boxed one-shot completion.
pub type AnchorCompletion<A> = Box<dyn FnOnce(AnchorOutcome<A>) + Send>;

struct PendingTask<A> {
    id: TaskId,
    kind: TaskKind,
    anchor: A,
    on_complete: AnchorCompletion<A>,
}

/// Tracks outstanding host/resolve tasks for one AR session.
pub struct CloudAnchorManager<D: SessionDriver> {
    driver: Arc<D>,
    pending: Mutex<Vec<PendingTask<D::Anchor>>>,
    next_task: AtomicU64,
}

impl<D: SessionDriver> CloudAnchorManager<D> {
    /// Create a manager over a session driver.
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            pending: Mutex::new(Vec::new()),
            next_task: AtomicU64::new(1),
        }
    }

    /// The underlying session driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Start hosting `anchor` and register `on_complete` for its outcome.
    pub fn host_anchor<F>(&self, anchor: &D::Anchor, on_complete: F) -> Result<TaskId, SessionError>
    where
        F: FnOnce(AnchorOutcome<D::Anchor>) + Send + 'static,
    {
        let tracked = self.driver.host_anchor(anchor)?;
        Ok(self.register(TaskKind::Host, tracked, Box::new(on_complete)))
    }

    /// Start resolving `anchor_id` and register `on_complete` for its outcome.
    pub fn resolve_anchor<F>(
        &self,
        anchor_id: &CloudAnchorId,
        on_complete: F,
    ) -> Result<TaskId, SessionError>
    where
        F: FnOnce(AnchorOutcome<D::Anchor>) + Send + 'static,
    {
        let tracked = self.driver.resolve_anchor(anchor_id)?;
        Ok(self.register(TaskKind::Resolve, tracked, Box::new(on_complete)))
    }

    fn register(
        &self,
        kind: TaskKind,
        anchor: D::Anchor,
        on_complete: AnchorCompletion<D::Anchor>,
    ) -> TaskId {
        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        debug!(task = id.0, ?kind, anchor = anchor.key().0, "anchor task pending");
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PendingTask {
                id,
                kind,
                anchor,
                on_complete,
            });
        id
    }

    /// Process one frame's updated anchors. Returns how many completions fired.
    ///
    /// Every finished task's completion runs even if an earlier one panics;
    /// the first panic is resumed once all of them have run.
    pub fn on_update(&self, updated: &[D::Anchor]) -> usize {
        let mut finished = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            for anchor in updated {
                let Some(state) = TerminalState::from_cloud(anchor.cloud_state()) else {
                    continue;
                };
                let key = anchor.key();
                let mut i = 0;
                while i < pending.len() {
                    if pending[i].anchor.key() == key {
                        finished.push((pending.swap_remove(i), state));
                    } else {
                        i += 1;
                    }
                }
            }
        }
        // Deterministic firing order regardless of swap_remove shuffling.
        finished.sort_by_key(|(task, _)| task.id);
        let fired = finished.len();
        let mut first_panic = None;
        for (task, state) in finished {
            if let TerminalState::Failed(err) = state {
                warn!(task = task.id.0, kind = ?task.kind, ?err, "anchor task failed");
            } else {
                debug!(task = task.id.0, kind = ?task.kind, "anchor task complete");
            }
            let id = task.id;
            let outcome = AnchorOutcome {
                task: task.id,
                kind: task.kind,
                anchor: task.anchor,
                state,
            };
            let on_complete = task.on_complete;
            // A panicking completion must not starve the others in this batch.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_complete(outcome))) {
                warn!(task = id.0, "anchor task completion panicked");
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        fired
    }

    /// Forget every pending task without firing it. Backend work continues.
    pub fn clear_listeners(&self) {
        let dropped = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "cleared pending anchor tasks");
        }
    }

    /// Number of tasks still waiting for a terminal state.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether `task` is still pending.
    pub fn is_pending(&self, task: TaskId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| t.id == task)
    }
}

/// Hands out completions that forward outcomes into one channel.
pub struct CompletionSender<A> {
    tx: Sender<AnchorOutcome<A>>,
}

impl<A> Clone for CompletionSender<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<A: Send + 'static> CompletionSender<A> {
    /// A completion that sends its outcome down the channel.
    pub fn completion(&self) -> AnchorCompletion<A> {
        let tx = self.tx.clone();
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        })
    }
}

/// Adapt completions to an `mpsc` receiver.
pub fn completion_channel<A>() -> (CompletionSender<A>, Receiver<AnchorOutcome<A>>) {
    let (tx, rx) = mpsc::channel();
    (CompletionSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::anchor::{AnchorKey, HitResult, ScreenTap, TrackingState};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct StubAnchor {
        key: u64,
        state: Arc<Mutex<CloudAnchorState>>,
    }

    impl LocalAnchor for StubAnchor {
        fn key(&self) -> AnchorKey {
            AnchorKey(self.key)
        }
        fn cloud_state(&self) -> CloudAnchorState {
            *self.state.lock().unwrap()
        }
        fn cloud_anchor_id(&self) -> Option<CloudAnchorId> {
            CloudAnchorId::new(format!("cloud-{}", self.key))
        }
        fn detach(&self) {}
    }

    struct StubDriver;

    impl SessionDriver for StubDriver {
        type Anchor = StubAnchor;
        fn camera_tracking_state(&self) -> TrackingState {
            TrackingState::Tracking
        }
        fn hit_test(&self, _tap: ScreenTap) -> Vec<HitResult> {
            Vec::new()
        }
        fn create_anchor_from_hit(&self, _hit: &HitResult) -> Result<StubAnchor, SessionError> {
            Err(SessionError::NotTracking)
        }
        fn host_anchor(&self, anchor: &StubAnchor) -> Result<StubAnchor, SessionError> {
            *anchor.state.lock().unwrap() = CloudAnchorState::TaskInProgress;
            Ok(anchor.clone())
        }
        fn resolve_anchor(&self, id: &CloudAnchorId) -> Result<StubAnchor, SessionError> {
            Err(SessionError::Backend(format!("unknown {id}")))
        }
        fn poll_updated_anchors(&self) -> Vec<StubAnchor> {
            Vec::new()
        }
    }

    fn anchor(key: u64) -> StubAnchor {
        StubAnchor {
            key,
            state: Arc::new(Mutex::new(CloudAnchorState::None)),
        }
    }

    #[test]
    fn non_terminal_updates_keep_the_task_pending() {
        let manager = CloudAnchorManager::new(Arc::new(StubDriver));
        let fired = Arc::new(AtomicUsize::new(0));
        let a = anchor(1);
        let f = fired.clone();
        let task = manager
            .host_anchor(&a, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(manager.on_update(std::slice::from_ref(&a)), 0);
        assert!(manager.is_pending(task));

        *a.state.lock().unwrap() = CloudAnchorState::Error(CloudAnchorError::Internal);
        assert_eq!(manager.on_update(std::slice::from_ref(&a)), 1);
        assert_eq!(manager.on_update(std::slice::from_ref(&a)), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn driver_refusal_registers_nothing() {
        let manager = CloudAnchorManager::new(Arc::new(StubDriver));
        let id = CloudAnchorId::new("missing").unwrap();
        assert!(manager.resolve_anchor(&id, |_| {}).is_err());
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn completion_can_reenter_the_manager() {
        let manager = Arc::new(CloudAnchorManager::new(Arc::new(StubDriver)));
        let a = anchor(7);
        let m = manager.clone();
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let s = seen.clone();
        manager
            .host_anchor(&a, move |_| s.store(m.pending_count(), Ordering::SeqCst))
            .unwrap();
        *a.state.lock().unwrap() = CloudAnchorState::Success;
        manager.on_update(&[a]);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_channel_delivers_outcomes() {
        let manager = CloudAnchorManager::new(Arc::new(StubDriver));
        let (sender, rx) = completion_channel();
        let a = anchor(3);
        manager.host_anchor(&a, sender.completion()).unwrap();
        *a.state.lock().unwrap() = CloudAnchorState::Success;
        manager.on_update(&[a]);
        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.kind, TaskKind::Host);
        assert_eq!(outcome.cloud_anchor_id().unwrap().as_str(), "cloud-3");
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_completion_does_not_drop_its_siblings() {
        let manager = CloudAnchorManager::new(Arc::new(StubDriver));
        let fired = Arc::new(AtomicUsize::new(0));
        let (a, b) = (anchor(1), anchor(2));
        manager
            .host_anchor(&a, |_| panic!("completion blew up"))
            .unwrap();
        let f = fired.clone();
        manager
            .host_anchor(&b, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        *a.state.lock().unwrap() = CloudAnchorState::Success;
        *b.state.lock().unwrap() = CloudAnchorState::Success;

        let both = [a, b.clone()];
        let result = panic::catch_unwind(AssertUnwindSafe(|| manager.on_update(&both)));
        assert!(result.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending_count(), 0);

        assert_eq!(manager.on_update(&[b]), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

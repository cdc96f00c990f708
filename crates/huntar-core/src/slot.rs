// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The single anchor currently displayed by this device.

use std::sync::{Mutex, MutexGuard};

use crate::anchor::LocalAnchor;

/// Owner of at most one live anchor.
///
/// Replacing the anchor detaches the previous one before the new one is
/// stored, inside one critical section: no reader ever observes a detached
/// anchor in the slot.
pub struct AnchorSlot<A> {
    inner: Mutex<Option<A>>,
}

impl<A> Default for AnchorSlot<A> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<A: LocalAnchor> AnchorSlot<A> {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot for a compound update.
    pub fn lock(&self) -> SlotGuard<'_, A> {
        SlotGuard {
            guard: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Detach the current anchor, if any, then hold `anchor`.
    pub fn replace(&self, anchor: Option<A>) {
        self.lock().replace(anchor);
    }

    /// Detach and forget the current anchor.
    pub fn clear(&self) {
        self.replace(None);
    }

    /// Handle to the current anchor.
    pub fn current(&self) -> Option<A> {
        self.lock().current().cloned()
    }

    /// True when no anchor is held.
    pub fn is_empty(&self) -> bool {
        self.lock().current().is_none()
    }
}

/// Exclusive access to an [`AnchorSlot`].
pub struct SlotGuard<'a, A> {
    guard: MutexGuard<'a, Option<A>>,
}

impl<A: LocalAnchor> SlotGuard<'_, A> {
    /// Current anchor.
    pub fn current(&self) -> Option<&A> {
        self.guard.as_ref()
    }

    /// Detach the current anchor, if any, then hold `anchor`.
    pub fn replace(&mut self, anchor: Option<A>) {
        if let Some(old) = self.guard.take() {
            old.detach();
        }
        *self.guard = anchor;
    }
}

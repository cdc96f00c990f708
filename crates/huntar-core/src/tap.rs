// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Latest user tap, handed from the UI thread to the frame loop.

use std::sync::{Mutex, MutexGuard};

use crate::anchor::ScreenTap;

/// Holds at most one tap; a newer tap overwrites an unconsumed one.
#[derive(Default)]
pub struct TapQueue {
    inner: Mutex<Option<ScreenTap>>,
}

impl TapQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tap from the UI thread.
    pub fn queue(&self, tap: ScreenTap) {
        *self.lock() = Some(tap);
    }

    /// Consume the queued tap.
    pub fn take(&self) -> Option<ScreenTap> {
        self.lock().take()
    }

    /// Lock the queue while the frame loop handles a tap.
    pub fn lock(&self) -> MutexGuard<'_, Option<ScreenTap>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_tap_wins() {
        let taps = TapQueue::new();
        taps.queue(ScreenTap { x: 1.0, y: 1.0 });
        taps.queue(ScreenTap { x: 2.0, y: 3.0 });
        assert_eq!(taps.take(), Some(ScreenTap { x: 2.0, y: 3.0 }));
        assert_eq!(taps.take(), None);
    }
}

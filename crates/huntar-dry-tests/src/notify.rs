// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Topic notifier that keeps what it was asked to publish.

use std::sync::{Arc, Mutex};

use huntar_core::error::{NotifyError, StoreError};
use huntar_core::notify::TopicNotifier;
use huntar_room_proto::HuntNotification;

#[derive(Default)]
struct Inner {
    published: Vec<(String, HuntNotification)>,
    fail: bool,
}

/// Records `(topic, notification)` pairs. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingNotifier {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<(String, HuntNotification)> {
        self.lock().published.clone()
    }

    /// Make publishes fail with a transport error.
    pub fn set_fail(&self, fail: bool) {
        self.lock().fail = fail;
    }
}

impl TopicNotifier for RecordingNotifier {
    fn publish(&self, topic: &str, notification: &HuntNotification) -> Result<(), NotifyError> {
        let mut inner = self.lock();
        if inner.fail {
            return Err(NotifyError::Transport(StoreError::Disconnected));
        }
        inner
            .published
            .push((topic.to_string(), notification.clone()));
        Ok(())
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory config store fake for testing preferences without filesystem I/O.

use huntar_app_core::config::{ConfigError, ConfigStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory implementation of [`ConfigStore`] for testing.
///
/// Clones share state, so a test can hand one clone to a
/// [`ConfigService`](huntar_app_core::config::ConfigService) and inspect the
/// other.
///
/// # Example
///
/// ```
/// use huntar_dry_tests::InMemoryConfigStore;
/// use huntar_app_core::config::ConfigService;
/// use huntar_app_core::prefs::{ClientPrefs, CLIENT_PREFS_KEY};
///
/// let store = InMemoryConfigStore::new();
/// let service = ConfigService::new(store.clone());
///
/// let prefs: ClientPrefs = service.load_or_init(CLIENT_PREFS_KEY);
/// assert_eq!(prefs, ClientPrefs::default());
/// assert!(store.contains_key(CLIENT_PREFS_KEY));
/// ```
#[derive(Clone, Default)]
pub struct InMemoryConfigStore {
    inner: Arc<Mutex<InMemoryConfigStoreInner>>,
}

#[derive(Default)]
struct InMemoryConfigStoreInner {
    data: HashMap<String, Vec<u8>>,
    load_count: usize,
    save_count: usize,
    fail_on_load: bool,
    fail_on_save: bool,
}

impl InMemoryConfigStore {
    /// Create a new empty in-memory config store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding one raw JSON document under `key`.
    pub fn with_json(key: &str, json: &str) -> Self {
        let store = Self::default();
        store
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .insert(key.to_string(), json.as_bytes().to_vec());
        store
    }

    /// Configure the store to fail on load operations.
    pub fn set_fail_on_load(&self, fail: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).fail_on_load = fail;
    }

    /// Configure the store to fail on save operations.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).fail_on_save = fail;
    }

    /// Number of `load_raw` attempts, failed ones included.
    pub fn load_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .load_count
    }

    /// Number of `save_raw` attempts, failed ones included.
    pub fn save_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .save_count
    }

    /// Check if a key exists in the store.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .contains_key(key)
    }

    /// Raw bytes stored under `key`, as UTF-8.
    pub fn raw_string(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .get(key)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.load_count += 1;

        if inner.fail_on_load {
            return Err(ConfigError::Other("simulated load failure".into()));
        }

        inner.data.get(key).cloned().ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.save_count += 1;

        if inner.fail_on_save {
            return Err(ConfigError::Other("simulated save failure".into()));
        }

        inner.data.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use huntar_app_core::config::ConfigService;
    use huntar_app_core::prefs::{ClientPrefs, HubPrefs, CLIENT_PREFS_KEY, HUB_PREFS_KEY};

    #[test]
    fn missing_prefs_are_initialised_and_persisted() {
        let store = InMemoryConfigStore::new();
        let service = ConfigService::new(store.clone());
        let prefs: HubPrefs = service.load_or_init(HUB_PREFS_KEY);
        assert_eq!(prefs, HubPrefs::default());
        assert_eq!(store.save_count(), 1);
        let saved: HubPrefs =
            serde_json::from_str(&store.raw_string(HUB_PREFS_KEY).unwrap()).unwrap();
        assert_eq!(saved, prefs);
    }

    #[test]
    fn stored_prefs_win_over_defaults() {
        let store = InMemoryConfigStore::with_json(
            CLIENT_PREFS_KEY,
            r#"{ "request_timeout_ms": 250, "notification_topic": "park-hunt" }"#,
        );
        let service = ConfigService::new(store.clone());
        let prefs: ClientPrefs = service.load_or_init(CLIENT_PREFS_KEY);
        assert_eq!(prefs.request_timeout_ms, 250);
        assert_eq!(prefs.notification_topic, "park-hunt");
        assert_eq!(prefs.counter_attempts, ClientPrefs::default().counter_attempts);
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn broken_store_falls_back_to_defaults() {
        let store = InMemoryConfigStore::new();
        store.set_fail_on_load(true);
        store.set_fail_on_save(true);
        let service = ConfigService::new(store.clone());
        let prefs: ClientPrefs = service.load_or_init(CLIENT_PREFS_KEY);
        assert_eq!(prefs, ClientPrefs::default());
        assert_eq!(store.load_count(), 1);
        assert!(!store.contains_key(CLIENT_PREFS_KEY));
    }

    #[test]
    fn clone_shares_state_between_instances() {
        let a = InMemoryConfigStore::new();
        let b = a.clone();
        a.save_raw("shared", b"1").unwrap();
        assert_eq!(b.load_raw("shared").unwrap(), b"1");
        assert_eq!(b.save_count(), 1);
        assert_eq!(a.load_count(), 1);
    }
}

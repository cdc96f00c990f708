// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON preference blobs for the room hub and room clients.
//!
//! Storage is a port ([`ConfigStore`]); [`ConfigService`] owns the JSON
//! encoding and the "first run writes the defaults" rule.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Raw blob storage keyed by preference name (`room_hub`, `room_client`).
pub trait ConfigStore {
    /// Bytes stored under `key`, or [`ConfigError::NotFound`].
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replace the bytes stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failures reading or writing preferences.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("not found")]
    NotFound,
    /// The backing store failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The stored blob is not valid JSON for the requested type.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Store-specific failure.
    #[error("other: {0}")]
    Other(String),
}

/// Typed JSON access to a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Service over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Value stored under `key`; `Ok(None)` when the key is missing or empty.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(ConfigError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Store `value` under `key` as pretty JSON.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }

    /// Value under `key`, writing `T::default()` there first when missing.
    ///
    /// Load and save failures are returned; an unreadable blob is never
    /// overwritten.
    pub fn try_load_or_init<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        if let Some(value) = self.load(key)? {
            return Ok(value);
        }
        let value = T::default();
        self.save(key, &value)?;
        debug!(key, "wrote default preferences");
        Ok(value)
    }

    /// Like [`try_load_or_init`](Self::try_load_or_init), but any failure is
    /// logged and the defaults are used.
    pub fn load_or_init<T>(&self, key: &str) -> T
    where
        T: DeserializeOwned + Serialize + Default,
    {
        match self.load(key) {
            Ok(Some(value)) => value,
            Ok(None) => {
                let value = T::default();
                match self.save(key, &value) {
                    Ok(()) => debug!(key, "wrote default preferences"),
                    Err(err) => warn!(key, %err, "could not persist default preferences"),
                }
                value
            }
            Err(err) => {
                warn!(key, %err, "unreadable preferences; using defaults");
                T::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Blobs {
        data: RefCell<HashMap<String, Vec<u8>>>,
        read_only: bool,
    }

    impl ConfigStore for Blobs {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.data.borrow().get(key).cloned().ok_or(ConfigError::NotFound)
        }
        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            if self.read_only {
                return Err(ConfigError::Other("read-only".into()));
            }
            self.data.borrow_mut().insert(key.to_string(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn save_failure_surfaces_from_try_load_or_init() {
        let service = ConfigService::new(Blobs {
            read_only: true,
            ..Blobs::default()
        });
        let err = service.try_load_or_init::<u32>("room_hub").unwrap_err();
        assert!(matches!(err, ConfigError::Other(_)));
        // The lenient variant still hands back defaults.
        assert_eq!(service.load_or_init::<u32>("room_hub"), 0);
    }

    #[test]
    fn unreadable_blob_is_reported_and_left_alone() {
        let blobs = Blobs::default();
        blobs
            .data
            .borrow_mut()
            .insert("room_client".into(), b"{not json".to_vec());
        let service = ConfigService::new(blobs);
        assert!(matches!(
            service.try_load_or_init::<u32>("room_client"),
            Err(ConfigError::Serde(_))
        ));
        assert_eq!(service.load_or_init::<u32>("room_client"), 0);
        assert_eq!(
            service.store.load_raw("room_client").unwrap(),
            b"{not json".to_vec()
        );
    }

    #[test]
    fn empty_blob_counts_as_missing() {
        let blobs = Blobs::default();
        blobs.data.borrow_mut().insert("room_hub".into(), Vec::new());
        let service = ConfigService::new(blobs);
        assert_eq!(service.try_load_or_init::<u32>("room_hub").unwrap(), 0);
        assert_eq!(service.store.load_raw("room_hub").unwrap(), b"0".to_vec());
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Preferences for the room hub and for device-side room clients.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Config key under which [`HubPrefs`] are stored.
pub const HUB_PREFS_KEY: &str = "room_hub";
/// Config key under which [`ClientPrefs`] are stored.
pub const CLIENT_PREFS_KEY: &str = "room_client";

/// Default topic planted-treasure notifications are fanned out on.
pub const DEFAULT_NOTIFICATION_TOPIC: &str = "treasure-hunt";

/// Default Unix socket path for the room hub.
///
/// Prefers a per-user runtime dir (XDG_RUNTIME_DIR) and falls back to `/tmp`
/// when unavailable.
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("huntar-rooms.sock")
}

/// Saved preferences for the room hub process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HubPrefs {
    /// Unix socket the hub listens on.
    pub socket_path: String,
}

impl Default for HubPrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().display().to_string(),
        }
    }
}

/// Saved preferences for a device talking to the room hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientPrefs {
    /// Unix socket of the hub.
    pub socket_path: String,
    /// How long a request waits for its reply, in milliseconds.
    pub request_timeout_ms: u64,
    /// Topic planted-treasure notifications are published to.
    pub notification_topic: String,
    /// Attempts a room-code counter transaction makes before giving up.
    pub counter_attempts: u32,
    /// Display name written into published room records.
    pub display_name: String,
}

impl Default for ClientPrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().display().to_string(),
            request_timeout_ms: 5_000,
            notification_topic: DEFAULT_NOTIFICATION_TOPIC.to_string(),
            counter_attempts: 25,
            display_name: "Hunt AR App".to_string(),
        }
    }
}

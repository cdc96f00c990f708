// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Room hub daemon.
//!
//! Usage: `huntar-room-hub [SOCKET_PATH]`. Without an argument the socket
//! path comes from the saved hub preferences.

use anyhow::Result;
use huntar_app_core::config::ConfigService;
use huntar_app_core::prefs::{HubPrefs, HUB_PREFS_KEY};
use huntar_config_fs::FsConfigStore;
use huntar_room_hub::{serve, HubState};
use tokio::net::UnixListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // Config (best-effort)
    let config: Option<ConfigService<FsConfigStore>> =
        FsConfigStore::new().map(ConfigService::new).ok();
    let prefs: HubPrefs = config
        .as_ref()
        .map(|c| c.load_or_init(HUB_PREFS_KEY))
        .unwrap_or_default();

    let socket_path = std::env::args().nth(1).unwrap_or(prefs.socket_path);

    // Remove stale socket if present
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    info!("room hub listening at {}", socket_path);

    serve(listener, HubState::new().shared()).await
}

//! Append-only JSONL log of terminal command statuses, one file per network.

use super::types::{check_network_name, StatusUpdate};
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current UTC time as ISO 8601 with second precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Derive the event log path for a network.
pub fn event_log_path(state_dir: &Path, network: &str) -> PathBuf {
    state_dir.join(network).join("events.jsonl")
}

/// Append a status update to the network's event log.
pub fn append_event(state_dir: &Path, status: &StatusUpdate) -> Result<(), String> {
    check_network_name(&status.network)?;
    let path = event_log_path(state_dir, &status.network);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {}", e))?;
    }

    let json = serde_json::to_string(status).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

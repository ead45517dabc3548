//! Crash-recovery checkpoints and the data model behind the cooperative
//! restart handshake. Grounded on the teacher's `scheduler/daemon.rs`
//! PID-file lifecycle (`write_pid`/`cleanup`) and the atomic-write technique
//! used throughout this crate for torn-write-proof JSON (temp file, rename).

use crate::bridge::BridgeRegistry;
use crate::config::{Config, ConfigError};
use crate::fsutil;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

const MIN_NOTIFY_AGE_SECS: i64 = 120;
const MAX_NOTIFY_AGE_SECS: i64 = 3600;

/// Crash-recovery record per (user, in-flight message). Invariant: at most
/// one per user; written before the LLM prompt, deleted on every exit path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCheckpoint {
    pub text: String,
    pub channel_id: String,
    pub platform: String,
    pub timestamp: DateTime<Utc>,
}

/// Single-slot record written before a cooperative restart, read and
/// cleared on the next startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartMarker {
    pub user_id: String,
    pub channel_id: String,
    pub platform: String,
    pub reason: String,
}

pub struct CrashRecovery {
    pending_dir: PathBuf,
}

impl CrashRecovery {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { pending_dir: data_dir.into().join("pending") }
    }

    fn checkpoint_path(&self, user_id: &str) -> PathBuf {
        self.pending_dir.join(format!("{user_id}.json"))
    }

    fn restart_marker_path(&self) -> PathBuf {
        self.pending_dir.join("restart.json")
    }

    fn config_snapshot_path(&self) -> PathBuf {
        self.pending_dir.join("config.yml.pre-restart")
    }

    /// Written just before an LLM prompt for a real (non-synthetic) user
    /// message.
    pub async fn write_checkpoint(&self, user_id: &str, checkpoint: &PendingCheckpoint) -> std::io::Result<()> {
        fsutil::write_json_atomic(&self.checkpoint_path(user_id), checkpoint).await
    }

    /// Deleted on every exit path for that message, success or failure.
    pub async fn delete_checkpoint(&self, user_id: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.checkpoint_path(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Startup sweep: every leftover checkpoint file is deleted first, so a
    /// repeated crash during notification can never re-notify the user; only
    /// checkpoints aged into `[2 min, 1 hr]` get an apology sent through
    /// their bridge, everything else is discarded silently.
    pub async fn sweep_checkpoints(&self, bridges: &BridgeRegistry) {
        let mut entries = match tokio::fs::read_dir(&self.pending_dir).await {
            Ok(e) => e,
            Err(_) => return,
        };
        let now = Utc::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if name == "restart.json" || name == "config.yml.pre-restart" || !name.ends_with(".json") {
                continue;
            }
            let checkpoint: Option<PendingCheckpoint> = fsutil::read_json(&path).await.unwrap_or(None);
            let _ = tokio::fs::remove_file(&path).await;
            let Some(checkpoint) = checkpoint else { continue };
            let age = (now - checkpoint.timestamp).num_seconds();
            if !(MIN_NOTIFY_AGE_SECS..=MAX_NOTIFY_AGE_SECS).contains(&age) {
                continue;
            }
            if let Err(err) = bridges
                .send(&checkpoint.platform, &checkpoint.channel_id, "I crashed while working on your last message; resend?")
                .await
            {
                warn!(error = %err, "failed to deliver crash-recovery notice");
            }
        }
    }

    /// Part of the cooperative-restart handshake: the caller writes this,
    /// flushes, then exits with status 42.
    pub async fn write_restart_marker(&self, marker: &RestartMarker) -> std::io::Result<()> {
        fsutil::write_json_atomic(&self.restart_marker_path(), marker).await
    }

    /// Startup: takes (reads then deletes) the marker left by a cooperative
    /// restart, if any, so the caller can greet the user with "Back online".
    pub async fn take_restart_marker(&self) -> Option<RestartMarker> {
        let path = self.restart_marker_path();
        let marker = fsutil::read_json(&path).await.ok().flatten();
        if marker.is_some() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        marker
    }

    /// Snapshots the live config before a restart so a bad edit made between
    /// now and the relaunch can be rolled back.
    pub async fn snapshot_config(&self, config_path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.pending_dir).await?;
        tokio::fs::copy(config_path, self.config_snapshot_path()).await?;
        Ok(())
    }

    /// Startup: loads `config_path`; on parse failure, if a pre-restart
    /// snapshot exists, restores it, deletes the snapshot, and reloads.
    /// Returns the config plus whether a rollback happened, so the operator
    /// surface can be told.
    pub async fn load_with_rollback(&self, config_path: &Path) -> Result<(Config, bool), ConfigError> {
        match crate::config::load(config_path) {
            Ok(config) => Ok((config, false)),
            Err(err) => {
                let snapshot = self.config_snapshot_path();
                if !tokio::fs::try_exists(&snapshot).await.unwrap_or(false) {
                    return Err(err);
                }
                warn!(error = %err, "config failed to parse after restart; rolling back to pre-restart snapshot");
                tokio::fs::copy(&snapshot, config_path).await.map_err(|source| ConfigError::Read {
                    path: config_path.display().to_string(),
                    source,
                })?;
                let _ = tokio::fs::remove_file(&snapshot).await;
                let config = crate::config::load(config_path)?;
                Ok((config, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::InMemoryBridge;
    use std::sync::Arc;

    #[tokio::test]
    async fn checkpoint_roundtrips_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = CrashRecovery::new(dir.path());
        let checkpoint = PendingCheckpoint {
            text: "hi".into(),
            channel_id: "c1".into(),
            platform: "console".into(),
            timestamp: Utc::now(),
        };
        recovery.write_checkpoint("u1", &checkpoint).await.unwrap();
        assert!(recovery.checkpoint_path("u1").exists());
        recovery.delete_checkpoint("u1").await.unwrap();
        assert!(!recovery.checkpoint_path("u1").exists());
        // Deleting a checkpoint that never existed is not an error.
        recovery.delete_checkpoint("u1").await.unwrap();
    }

    #[tokio::test]
    async fn sweep_notifies_only_in_age_window_and_always_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = CrashRecovery::new(dir.path());
        let bridges = BridgeRegistry::new();
        let bridge = Arc::new(InMemoryBridge::new());
        bridges.register("console", bridge.clone());

        let too_fresh = PendingCheckpoint {
            text: "a".into(),
            channel_id: "fresh".into(),
            platform: "console".into(),
            timestamp: Utc::now(),
        };
        let in_window = PendingCheckpoint {
            text: "b".into(),
            channel_id: "window".into(),
            platform: "console".into(),
            timestamp: Utc::now() - chrono::Duration::minutes(5),
        };
        let too_old = PendingCheckpoint {
            text: "c".into(),
            channel_id: "old".into(),
            platform: "console".into(),
            timestamp: Utc::now() - chrono::Duration::hours(5),
        };
        recovery.write_checkpoint("fresh", &too_fresh).await.unwrap();
        recovery.write_checkpoint("window", &in_window).await.unwrap();
        recovery.write_checkpoint("old", &too_old).await.unwrap();

        recovery.sweep_checkpoints(&bridges).await;

        let sent = bridge.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "window");
        assert!(!recovery.checkpoint_path("fresh").exists());
        assert!(!recovery.checkpoint_path("window").exists());
        assert!(!recovery.checkpoint_path("old").exists());
    }

    #[tokio::test]
    async fn restart_marker_roundtrips_once() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = CrashRecovery::new(dir.path());
        let marker = RestartMarker {
            user_id: "u1".into(),
            channel_id: "c1".into(),
            platform: "console".into(),
            reason: "config reload".into(),
        };
        recovery.write_restart_marker(&marker).await.unwrap();
        let taken = recovery.take_restart_marker().await.unwrap();
        assert_eq!(taken.user_id, "u1");
        assert!(recovery.take_restart_marker().await.is_none());
    }

    #[tokio::test]
    async fn rolls_back_to_snapshot_on_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = CrashRecovery::new(dir.path());
        let config_path = dir.path().join("config.yml");
        tokio::fs::write(&config_path, "agent:\n  model: \"openai/gpt-4o-mini\"\n").await.unwrap();
        recovery.snapshot_config(&config_path).await.unwrap();

        tokio::fs::write(&config_path, "not: valid: yaml: [").await.unwrap();
        let (config, rolled_back) = recovery.load_with_rollback(&config_path).await.unwrap();
        assert!(rolled_back);
        assert_eq!(config.agent.model, "openai/gpt-4o-mini");
        assert!(!recovery.config_snapshot_path().exists());
    }
}

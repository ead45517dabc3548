//! Cooperative-restart supervisor: relaunches the daemon binary in a loop,
//! treating exit code [`crate::RESTART_EXIT_CODE`] as "restart me" and any
//! other exit as a real stop. Separate from the in-process session-repair
//! recovery in `mylm_core::session`; this is the outer process-level half
//! of the restart protocol described in the crate's crash-recovery design.

use crate::RESTART_EXIT_CODE;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub async fn run(config: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate current executable")?;
    loop {
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.arg("--config").arg(config);
        if let Some(dir) = &data_dir {
            cmd.arg("--data-dir").arg(dir);
        }

        info!(?exe, "supervisor launching daemon");
        let status = cmd.status().await.context("failed to spawn daemon process")?;

        match status.code() {
            Some(RESTART_EXIT_CODE) => {
                info!("daemon requested a restart, relaunching");
                continue;
            }
            Some(code) => {
                info!(code, "daemon exited normally, supervisor stopping");
                return Ok(());
            }
            None => {
                warn!("daemon was terminated by a signal, supervisor stopping");
                return Ok(());
            }
        }
    }
}

//! Minimal outer supervisor: it only knows how to start the relay child and
//! restart it when the child asks. All relay state lives in the child, so a
//! recycle resets everything cleanly.

use anyhow::Context;
use std::time::Duration;
use tracing::{info, warn};

use crate::RESTART_EXIT_CODE;
use crate::cli::Args;

pub async fn supervise(args: &Args) -> anyhow::Result<i32> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let child_args = args.child_args();
    let mut restarts = 0u32;

    loop {
        info!(restarts, "starting relay child");
        let status = tokio::process::Command::new(&exe)
            .args(&child_args)
            .status()
            .await
            .context("spawning relay child")?;

        match status.code() {
            Some(code) if code == RESTART_EXIT_CODE => {
                restarts += 1;
                warn!(restarts, "relay asked to be recycled, restarting");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Some(0) => {
                info!("relay finished");
                return Ok(0);
            }
            Some(code) => {
                warn!(code, "relay exited abnormally, not restarting");
                return Ok(code);
            }
            // Killed by a signal: the operator meant it.
            None => {
                warn!("relay terminated by signal");
                return Ok(0);
            }
        }
    }
}

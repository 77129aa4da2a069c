mod cli;
mod config;
mod supervisor;

use anyhow::Context;
use clap::Parser;
use shiftcast_engine::{Relay, RunOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::cli::{Args, Commands};

/// Exit code `run` uses to ask its supervisor for a fresh process.
pub(crate) const RESTART_EXIT_CODE: i32 = 75;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    match dispatch(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn dispatch(args: Args) -> anyhow::Result<i32> {
    match args.command {
        Commands::Run => run_relay(&args).await,
        Commands::Supervise => supervisor::supervise(&args).await,
    }
}

async fn run_relay(args: &Args) -> anyhow::Result<i32> {
    let config = config::load(args)?;
    info!(
        url = %config.upstream.playlist_url,
        work_dir = %config.work_dir.display(),
        delay_secs = config.output.target_delay.as_secs(),
        "starting relay"
    );

    let token = CancellationToken::new();
    let mut relay_task = tokio::spawn(Relay::new(config).run(token.clone()));

    let outcome = tokio::select! {
        res = &mut relay_task => res.context("relay task")??,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            token.cancel();
            relay_task.await.context("relay task")??
        }
        _ = hangup() => {
            info!("SIGHUP received, recycling the relay");
            token.cancel();
            let _ = relay_task.await.context("relay task")??;
            RunOutcome::RestartRequested
        }
    };
    Ok(match outcome {
        RunOutcome::Completed => 0,
        RunOutcome::RestartRequested => RESTART_EXIT_CODE,
    })
}

/// Resolves when a SIGHUP arrives; pends forever where that signal does not
/// exist.
#[cfg(unix)]
async fn hangup() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::hangup()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending::<()>().await
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,shiftcast={level},shiftcast_engine={level},procwatch={level}"
        ))
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

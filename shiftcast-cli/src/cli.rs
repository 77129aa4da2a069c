use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "shiftcast",
    version,
    about = "Relay a live segmented audio stream to an Icecast mount after a configurable delay"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the TOML config file (default: <config dir>/shiftcast/config.toml).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the upstream playlist URL.
    #[arg(short, long, global = true, env = "SHIFTCAST_URL")]
    pub url: Option<String>,

    /// Override the working directory.
    #[arg(short, long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// Override the target delay, in seconds.
    #[arg(short, long, global = true)]
    pub delay: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the relay in the foreground until interrupted or fatally stuck.
    Run,
    /// Run the relay as a supervised child process, restarting it whenever
    /// it asks to be recycled.
    Supervise,
}

impl Args {
    /// Arguments to re-issue for a supervised `run` child, preserving every
    /// global flag.
    pub fn child_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if let Some(config) = &self.config {
            args.push("--config".into());
            args.push(config.display().to_string());
        }
        if let Some(url) = &self.url {
            args.push("--url".into());
            args.push(url.clone());
        }
        if let Some(work_dir) = &self.work_dir {
            args.push("--work-dir".into());
            args.push(work_dir.display().to_string());
        }
        if let Some(delay) = self.delay {
            args.push("--delay".into());
            args.push(delay.to_string());
        }
        for _ in 0..self.verbose {
            args.push("--verbose".into());
        }
        if self.quiet {
            args.push("--quiet".into());
        }
        args
    }
}

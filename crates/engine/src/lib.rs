//! Relay engine for time-shifted rebroadcast of a segmented live stream.
//!
//! The pipeline: a [`playlist::PlaylistPoller`] discovers segments from the
//! upstream live playlist and runs them through a [`index::SegmentIndex`]
//! (ordering, dedup, gap detection); accepted segments flow through a
//! [`downloader`] worker into the two-slot [`slots::DelayBuffer`], which
//! feeds a looping playlist consumed by an external broadcast process owned
//! by the [`output::OutputDriver`]. The driver watches drift between wall
//! clock and the airing segment's source timestamp and fast-forwards through
//! backlog when the relay falls behind its target delay.

pub mod config;
pub mod downloader;
pub mod error;
pub mod history;
pub mod index;
pub mod metadata;
pub mod observer;
pub mod output;
pub mod playlist;
pub mod relay;
pub mod retry;
pub mod segment;
pub mod sink;
pub mod slots;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use relay::{Relay, RunOutcome};

//! Panauricon: continuous audio capture into time-rotated WAV segments, a
//! segment index for time-based lookup, and playback from any instant.
//!
//! # Modules
//!
//! - [`audio`] blocks, the bounded queue, the per-block transform hook and
//!   the device seam ([`audio::AudioHost`], backed by cpal).
//! - [`storage`] rotation partitions, segment files and the index.
//! - [`pipeline`] the capture and playback pipelines.
//! - [`config`] typed settings persisted as TOML.

pub mod audio;
pub mod config;
pub mod pipeline;
pub mod storage;

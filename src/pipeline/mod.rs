//! Capture and playback pipelines.
//!
//! Both pipelines are blocking and run on a worker thread (the binary uses
//! `tokio::task::spawn_blocking`).  Each one connects a device callback to
//! that worker through a bounded block queue and stops cooperatively when
//! its [`CancelToken`] fires.
//!
//! # Architecture
//!
//! ```text
//!            Capture::run                              Playback::run
//!                 │                                          │
//!   input callback ─▶ queue ─▶ writer         query_from ─▶ reader ─▶ queue
//!                              │  rotate                               │
//!                              ▼                                       ▼
//!                 SegmentWriter + IndexStore               output callback
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use panauricon::audio::CpalHost;
//! use panauricon::config::AppConfig;
//! use panauricon::pipeline::{CancelToken, Capture, CaptureSettings};
//! use panauricon::storage::IndexStore;
//!
//! let config = AppConfig::load().unwrap();
//! let index = IndexStore::open(config.index_file()).unwrap();
//! let host = CpalHost::new();
//! let cancel = CancelToken::new();
//!
//! // Runs until `cancel.cancel()` is called from another thread.
//! let report = Capture::new(&host, index, CaptureSettings::from_config(&config))
//!     .run(&cancel)
//!     .unwrap();
//! println!("{} segment(s) written", report.segments);
//! ```

pub mod cancel;
pub mod capture;
pub mod clock;
pub mod playback;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use cancel::CancelToken;
pub use capture::{Capture, CaptureError, CaptureReport, CaptureSettings};
pub use clock::{Clock, FixedClock, SystemClock};
pub use playback::{
    Playback, PlaybackError, PlaybackFeeder, PlaybackReport, PlaybackSettings, StopReason,
};

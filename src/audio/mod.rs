//! Audio primitives shared by the capture and playback pipelines.
//!
//! # Data path
//!
//! ```text
//! capture:  device callback → BlockAssembler → BlockProducer ─┐
//!                                                              │ bounded queue
//!           writer thread ← BlockTransform ← BlockConsumer  ◀──┘
//!
//! playback: reader thread → BlockProducer ─┐
//!                                          │ bounded queue
//!           device callback ← BlockConsumer ◀┘
//! ```
//!
//! Devices are reached only through the [`AudioHost`] trait;
//! [`CpalHost`] talks to real hardware.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use panauricon::audio::{AudioHost, CpalHost};
//!
//! let host = CpalHost::new();
//! for device in host.devices().unwrap() {
//!     println!("{device}");
//! }
//! ```

pub mod block;
pub mod cpal_host;
pub mod host;
pub mod queue;
#[cfg(test)]
pub mod synthetic;
pub mod transform;

pub use block::{AudioBlock, BlockAssembler};
pub use cpal_host::CpalHost;
pub use host::{
    AudioHost, CallbackFlow, DeviceDescriptor, DeviceError, DeviceStream, Direction,
    FaultCallback, InputCallback, OutputCallback, StreamFault, StreamSpec,
};
pub use queue::{
    block_queue, drop_oldest_queue, BlockConsumer, BlockProducer, Pop, PushError, PushOutcome,
};
pub use transform::{BlockTransform, Passthrough, SegmentContext, TransformOutcome};

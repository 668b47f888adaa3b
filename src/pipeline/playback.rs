//! Playback pipeline: index query → segment reader → bounded queue → output
//! device.
//!
//! Segments starting at or after the requested instant are played in
//! chronological order, one output stream per segment.  For each segment
//! the reader pre-fills the queue, opens the stream, and keeps the queue
//! topped up while the device callback ([`PlaybackFeeder`]) drains it.
//!
//! The callback never blocks.  When the queue is empty it pads the buffer
//! with silence and stops the stream for that segment, reporting whether
//! the reader fell behind ([`StopReason::Underrun`]) or the file simply
//! ended ([`StopReason::EndOfStream`]).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver};
use thiserror::Error;
use uuid::Uuid;

use crate::audio::{
    block_queue, AudioBlock, AudioHost, BlockConsumer, CallbackFlow, DeviceDescriptor,
    DeviceError, Direction, Pop, PushError, StreamFault, StreamSpec,
};
use crate::config::AppConfig;
use crate::storage::{IndexError, IndexStore, Segment, SegmentReader};

use super::cancel::CancelToken;

/// Upper bound on a single wait of the feeding loop.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

const FAULT_QUEUE: usize = 32;

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

/// Fatal playback failures.  Missing or unreadable segment files are not
/// errors; they are skipped and counted in [`PlaybackReport::skipped`].
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("output stream for segment {id} aborted by the driver: {message}")]
    Stream { id: Uuid, message: String },
}

// ---------------------------------------------------------------------------
// Settings and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub device: Option<String>,
    pub block_frames: usize,
    pub queue_capacity: usize,
}

impl PlaybackSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            device: config.audio.output_device.clone(),
            block_frames: config.audio.block_frames,
            queue_capacity: config.audio.queue_capacity,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Segments whose stream was started.
    pub played: usize,
    /// Segments skipped because their file was missing or unreadable.
    pub skipped: usize,
    /// Segments cut short because the queue ran dry.
    pub underruns: usize,
}

// ---------------------------------------------------------------------------
// PlaybackFeeder  (real-time side)
// ---------------------------------------------------------------------------

/// Why a feeder stopped its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Running,
    /// The reader closed the queue and every block was played.
    EndOfStream,
    /// The queue was empty while the reader was still going.
    Underrun,
}

impl StopReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StopReason::EndOfStream,
            2 => StopReason::Underrun,
            _ => StopReason::Running,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StopReason::Running => 0,
            StopReason::EndOfStream => 1,
            StopReason::Underrun => 2,
        }
    }
}

/// Output callback state: copies queued blocks into device buffers.
///
/// A block larger than the device buffer is carried over to the next
/// invocation, so block size and driver buffer size are independent.
pub struct PlaybackFeeder {
    consumer: BlockConsumer,
    current: Option<AudioBlock>,
    position: usize,
    reason: Arc<AtomicU8>,
}

impl PlaybackFeeder {
    pub fn new(consumer: BlockConsumer) -> Self {
        Self {
            consumer,
            current: None,
            position: 0,
            reason: Arc::new(AtomicU8::new(StopReason::Running.as_u8())),
        }
    }

    /// Handle for reading the stop reason from another thread.
    pub fn reason_handle(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.reason)
    }

    pub fn reason(&self) -> StopReason {
        StopReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    /// Fill `out` completely.  Returns [`CallbackFlow::Stop`] once the queue
    /// is empty; the unfilled tail of `out` is silence.
    pub fn fill(&mut self, out: &mut [f32]) -> CallbackFlow {
        let mut written = 0;
        while written < out.len() {
            let exhausted = self
                .current
                .as_ref()
                .map_or(true, |b| self.position >= b.samples.len());
            if exhausted {
                match self.consumer.try_pop() {
                    Pop::Block(block) => {
                        self.current = Some(block);
                        self.position = 0;
                        continue;
                    }
                    Pop::Empty => return self.stop(out, written, StopReason::Underrun),
                    Pop::Closed => return self.stop(out, written, StopReason::EndOfStream),
                }
            }
            if let Some(block) = &self.current {
                let n = (block.samples.len() - self.position).min(out.len() - written);
                out[written..written + n]
                    .copy_from_slice(&block.samples[self.position..self.position + n]);
                self.position += n;
                written += n;
            }
        }
        CallbackFlow::Continue
    }

    fn stop(&mut self, out: &mut [f32], written: usize, reason: StopReason) -> CallbackFlow {
        out[written..].fill(0.0);
        self.reason.store(reason.as_u8(), Ordering::Release);
        CallbackFlow::Stop
    }
}

// ---------------------------------------------------------------------------
// Playback  (worker side)
// ---------------------------------------------------------------------------

enum SegmentEnd {
    Finished(StopReason),
    Cancelled,
}

pub struct Playback<'a> {
    host: &'a dyn AudioHost,
    index: IndexStore,
    settings: PlaybackSettings,
}

impl<'a> Playback<'a> {
    pub fn new(host: &'a dyn AudioHost, index: IndexStore, settings: PlaybackSettings) -> Self {
        Self {
            host,
            index,
            settings,
        }
    }

    /// Play every segment starting at or after `from`.
    ///
    /// An empty result set returns a zero report without touching the
    /// output device.
    pub fn run(
        &self,
        from: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<PlaybackReport, PlaybackError> {
        let segments = self.index.query_from(from)?;
        let mut report = PlaybackReport::default();
        if segments.is_empty() {
            log::info!("playback: nothing recorded at or after {from}");
            return Ok(report);
        }

        let device = self
            .host
            .resolve(Direction::Output, self.settings.device.as_deref())?;
        log::info!(
            "playback: {} segment(s) from {from} on `{}`",
            segments.len(),
            device.name
        );

        for segment in &segments {
            if cancel.is_cancelled() {
                log::info!("playback: stop requested");
                break;
            }
            let reader = match SegmentReader::open(&segment.file_path()) {
                Ok(reader) => reader,
                Err(e) => {
                    log::warn!("playback: skipping segment {}: {e}", segment.id);
                    report.skipped += 1;
                    continue;
                }
            };
            match self.play_segment(&device, segment, reader, cancel)? {
                SegmentEnd::Finished(reason) => {
                    report.played += 1;
                    if reason == StopReason::Underrun {
                        report.underruns += 1;
                    }
                }
                SegmentEnd::Cancelled => {
                    report.played += 1;
                    log::info!("playback: stop requested");
                    break;
                }
            }
        }

        log::info!(
            "playback: played {} segment(s), skipped {}, {} underrun(s)",
            report.played,
            report.skipped,
            report.underruns
        );
        Ok(report)
    }

    fn play_segment(
        &self,
        device: &DeviceDescriptor,
        segment: &Segment,
        reader: SegmentReader,
        cancel: &CancelToken,
    ) -> Result<SegmentEnd, PlaybackError> {
        let spec = StreamSpec {
            sample_rate: reader.sample_rate(),
            channels: reader.channels(),
        };
        let (producer, consumer) = block_queue(self.settings.queue_capacity);
        let mut source = BlockSource::new(reader, segment, self.settings.block_frames);

        // Pre-fill so the first callbacks find audio waiting.
        let mut producer = Some(producer);
        let mut pending = None;
        while let Some(p) = producer.as_ref() {
            if p.is_full() {
                break;
            }
            match source.next_block() {
                Some(block) => {
                    if let Err(PushError::Full(block)) = p.try_push(block) {
                        pending = Some(block);
                        break;
                    }
                }
                None => producer = None,
            }
        }

        let mut feeder = PlaybackFeeder::new(consumer);
        let reason = feeder.reason_handle();
        let (fault_tx, fault_rx) = bounded::<StreamFault>(FAULT_QUEUE);

        let stream = self.host.open_output(
            device,
            spec,
            Box::new(move |out: &mut [f32]| feeder.fill(out)),
            Box::new(move |fault: StreamFault| {
                let _ = fault_tx.try_send(fault);
            }),
        )?;
        log::debug!(
            "playback: segment {} started ({} frames)",
            segment.id,
            source.total_frames
        );

        loop {
            if stream.has_stopped() {
                break;
            }
            if cancel.is_cancelled() {
                return Ok(SegmentEnd::Cancelled);
            }
            check_faults(&fault_rx, segment)?;

            let Some(p) = producer.as_ref() else {
                thread::sleep(POLL_INTERVAL);
                continue;
            };
            let block = match pending.take().or_else(|| source.next_block()) {
                Some(block) => block,
                None => {
                    // Dropping the producer tells the feeder the file ended.
                    producer = None;
                    continue;
                }
            };
            match p.push_timeout(block, POLL_INTERVAL) {
                Ok(()) => {}
                Err(PushError::Full(block)) => pending = Some(block),
                Err(PushError::Closed) => break,
            }
        }
        drop(stream);

        let reason = StopReason::from_u8(reason.load(Ordering::Acquire));
        match reason {
            StopReason::Underrun => log::warn!(
                "playback: queue empty, segment {} stopped early (reader too slow)",
                segment.id
            ),
            _ => log::debug!("playback: segment {} reached end of file", segment.id),
        }
        Ok(SegmentEnd::Finished(reason))
    }
}

fn check_faults(faults: &Receiver<StreamFault>, segment: &Segment) -> Result<(), PlaybackError> {
    while let Ok(fault) = faults.try_recv() {
        if fault.fatal {
            return Err(PlaybackError::Stream {
                id: segment.id,
                message: fault.message,
            });
        }
        log::warn!("playback: stream fault: {}", fault.message);
    }
    Ok(())
}

/// Turns a [`SegmentReader`] into numbered blocks.  A read error ends the
/// segment early.
struct BlockSource {
    reader: Option<SegmentReader>,
    id: Uuid,
    block_frames: usize,
    channels: u16,
    total_frames: u64,
    sequence: u64,
    frame_offset: u64,
}

impl BlockSource {
    fn new(reader: SegmentReader, segment: &Segment, block_frames: usize) -> Self {
        Self {
            channels: reader.channels(),
            total_frames: reader.total_frames(),
            reader: Some(reader),
            id: segment.id,
            block_frames: block_frames.max(1),
            sequence: 0,
            frame_offset: 0,
        }
    }

    fn next_block(&mut self) -> Option<AudioBlock> {
        let reader = self.reader.as_mut()?;
        match reader.read_block(self.block_frames) {
            Ok(Some(samples)) => {
                let block = AudioBlock::new(self.sequence, self.frame_offset, self.channels, samples);
                self.sequence += 1;
                self.frame_offset += block.frames() as u64;
                Some(block)
            }
            Ok(None) => {
                self.reader = None;
                None
            }
            Err(e) => {
                log::warn!("playback: segment {} truncated: {e}", self.id);
                self.reader = None;
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

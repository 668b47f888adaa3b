//! Capture pipeline: input device → bounded queue → segment writer.
//!
//! [`Capture::run`] opens the input stream and then loops on the calling
//! thread until the [`CancelToken`] fires or the driver aborts the stream.
//!
//! ```text
//! device callback (real-time)              writer (this thread)
//!   BlockAssembler                           pop_timeout
//!   push_drop_oldest ───── queue ─────────▶  timestamp = anchor + offset
//!                                            rotate if partition changed
//!                                            BlockTransform
//!                                            SegmentWriter::write_block
//! ```
//!
//! Segments are registered in the [`IndexStore`] as soon as their file is
//! created, with no end time.  Closing a segment (rotation, a `Restart` from
//! the transform, cancellation) writes the WAV header and records the end
//! time.  A failed write flags the record before the error is returned.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver};
use thiserror::Error;
use uuid::Uuid;

use crate::audio::{
    drop_oldest_queue, AudioBlock, AudioHost, BlockAssembler, BlockConsumer, BlockTransform,
    CallbackFlow, DeviceError, Direction, Passthrough, Pop, PushOutcome, SegmentContext,
    StreamFault, StreamSpec, TransformOutcome,
};
use crate::config::AppConfig;
use crate::storage::{
    frames_to_duration, partition, IndexError, IndexStore, Partition, SampleEncoding, Segment,
    SegmentWriter, StorageError, TimeComponent,
};

use super::cancel::CancelToken;
use super::clock::{Clock, SystemClock};

/// How long the writer waits for a block before re-checking cancellation
/// and stream faults.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Driver faults buffered between the real-time thread and the writer.
const FAULT_QUEUE: usize = 32;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The driver aborted the input stream.
    #[error("input stream aborted by the driver: {message}")]
    Stream { message: String },

    /// Partition directory could not be created.
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("segment {id} ({path}) starting {start}: {source}")]
    Segment {
        id: Uuid,
        path: PathBuf,
        start: DateTime<Utc>,
        #[source]
        source: StorageError,
    },

    #[error("segment {id}: index update failed: {source}")]
    Index {
        id: Uuid,
        #[source]
        source: IndexError,
    },
}

// ---------------------------------------------------------------------------
// Settings and report
// ---------------------------------------------------------------------------

/// Everything the capture pipeline reads from the settings, resolved once.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: u16,
    pub block_frames: usize,
    pub queue_capacity: usize,
    pub recordings_dir: PathBuf,
    pub prefix: String,
    pub encoding: SampleEncoding,
    pub template: Vec<TimeComponent>,
    pub version: String,
}

impl CaptureSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            device: config.audio.input_device.clone(),
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            block_frames: config.audio.block_frames,
            queue_capacity: config.audio.queue_capacity,
            recordings_dir: config.recordings_dir(),
            prefix: config.storage.prefix.clone(),
            encoding: config.storage.encoding,
            template: config.rotation.template.clone(),
            version: config.version.clone(),
        }
    }
}

/// Summary of a finished capture session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    /// Segment files opened.
    pub segments: usize,
    /// Frames written across all segments.
    pub frames: u64,
    /// Blocks lost to queue overflow.
    pub dropped_blocks: u64,
    /// Blocks discarded by the transform.
    pub discarded_blocks: u64,
    /// Non-fatal driver faults.
    pub faults: usize,
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

pub struct Capture<'a> {
    host: &'a dyn AudioHost,
    index: IndexStore,
    settings: CaptureSettings,
    clock: Box<dyn Clock>,
    transform: Box<dyn BlockTransform>,
}

impl<'a> Capture<'a> {
    pub fn new(host: &'a dyn AudioHost, index: IndexStore, settings: CaptureSettings) -> Self {
        Self {
            host,
            index,
            settings,
            clock: Box::new(SystemClock),
            transform: Box::new(Passthrough),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_transform(mut self, transform: impl BlockTransform + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }

    /// Record until `cancel` fires.
    ///
    /// Returns `Ok` after a requested stop, once every queued block has been
    /// written and the last segment closed.  A driver abort still closes the
    /// active segment before [`CaptureError::Stream`] is returned.
    pub fn run(mut self, cancel: &CancelToken) -> Result<CaptureReport, CaptureError> {
        let device = self
            .host
            .resolve(Direction::Input, self.settings.device.as_deref())?;
        let spec = StreamSpec {
            sample_rate: self
                .settings
                .sample_rate
                .unwrap_or(device.default_sample_rate),
            channels: self.settings.channels,
        };

        let (producer, consumer) = drop_oldest_queue(self.settings.queue_capacity);
        let (fault_tx, fault_rx) = bounded::<StreamFault>(FAULT_QUEUE);

        let mut assembler = BlockAssembler::new(self.settings.block_frames, spec.channels);
        let on_data = Box::new(move |data: &[f32]| {
            let mut flow = CallbackFlow::Continue;
            assembler.push(data, |block| {
                if producer.push_drop_oldest(block) == PushOutcome::Closed {
                    flow = CallbackFlow::Stop;
                }
            });
            flow
        });
        let on_fault = Box::new(move |fault: StreamFault| {
            let _ = fault_tx.try_send(fault);
        });

        let anchor = self.clock.now();
        let stream = self.host.open_input(&device, spec, on_data, on_fault)?;
        log::info!(
            "capture: recording from `{}` at {} Hz, {} ch into {}",
            device.name,
            spec.sample_rate,
            spec.channels,
            self.settings.recordings_dir.display()
        );

        let mut writer = Writer {
            index: &self.index,
            settings: &self.settings,
            transform: self.transform.as_mut(),
            anchor,
            sample_rate: spec.sample_rate,
            active: None,
            ctx: SegmentContext::default(),
            next_sequence: 0,
            report: CaptureReport::default(),
        };

        let mut abort = None;
        loop {
            if let Some(message) = writer.check_faults(&fault_rx) {
                abort = Some(message);
                break;
            }
            if cancel.is_cancelled() {
                log::info!("capture: stop requested");
                break;
            }
            match consumer.pop_timeout(POLL_INTERVAL) {
                Pop::Block(block) => writer.handle(block)?,
                Pop::Empty => continue,
                Pop::Closed => break,
            }
        }

        // Stopping the stream drops the producer, so the drain below ends.
        drop(stream);
        writer.drain(&consumer)?;
        writer.close_active()?;
        writer.report.dropped_blocks = consumer.dropped();

        if let Some(message) = abort {
            log::error!("capture: input stream aborted: {message}");
            return Err(CaptureError::Stream { message });
        }

        let report = writer.report;
        log::info!(
            "capture: stopped after {} segment(s), {} frames, {} block(s) dropped",
            report.segments,
            report.frames,
            report.dropped_blocks
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct ActiveSegment {
    writer: SegmentWriter,
    partition: Partition,
}

/// Writer-side state of one capture session.
struct Writer<'r> {
    index: &'r IndexStore,
    settings: &'r CaptureSettings,
    transform: &'r mut dyn BlockTransform,
    anchor: DateTime<Utc>,
    sample_rate: u32,
    active: Option<ActiveSegment>,
    ctx: SegmentContext,
    next_sequence: u64,
    report: CaptureReport,
}

impl Writer<'_> {
    /// Log recoverable faults; return the message of a fatal one.
    fn check_faults(&mut self, faults: &Receiver<StreamFault>) -> Option<String> {
        while let Ok(fault) = faults.try_recv() {
            if fault.fatal {
                return Some(fault.message);
            }
            self.report.faults += 1;
            log::warn!("capture: stream fault: {}", fault.message);
        }
        None
    }

    fn drain(&mut self, consumer: &BlockConsumer) -> Result<(), CaptureError> {
        let mut drained = 0usize;
        while let Pop::Block(block) = consumer.try_pop() {
            self.handle(block)?;
            drained += 1;
        }
        if drained > 0 {
            log::debug!("capture: drained {drained} queued block(s)");
        }
        Ok(())
    }

    fn handle(&mut self, block: AudioBlock) -> Result<(), CaptureError> {
        if block.sequence != self.next_sequence {
            log::warn!(
                "capture: queue overflow, {} block(s) lost before block {}",
                block.sequence.saturating_sub(self.next_sequence),
                block.sequence
            );
        }
        self.next_sequence = block.sequence + 1;

        let ts = self.anchor + frames_to_duration(block.frame_offset, self.sample_rate);
        let part = partition(&ts, &self.settings.template);
        if self.active.as_ref().is_some_and(|a| a.partition != part) {
            self.close_active()?;
        }

        self.ctx.blocks_seen += 1;
        match self.transform.transform(block, &mut self.ctx) {
            TransformOutcome::Keep(block) => {
                if self.active.is_none() {
                    self.open(ts, part)?;
                }
                self.write(&block)
            }
            TransformOutcome::Drop => {
                self.report.discarded_blocks += 1;
                Ok(())
            }
            TransformOutcome::Restart => {
                self.report.discarded_blocks += 1;
                log::debug!("capture: transform requested a new segment at {ts}");
                self.close_active()
            }
        }
    }

    fn open(&mut self, start: DateTime<Utc>, part: Partition) -> Result<(), CaptureError> {
        let root = &self.settings.recordings_dir;
        let dir = part
            .ensure_dir(root)
            .map_err(|source| StorageError::CreateDir {
                path: part.dir_under(root),
                source,
            })?;
        let segment = Segment::new(
            &dir,
            &self.settings.prefix,
            start,
            self.settings.encoding,
            self.sample_rate,
            self.settings.channels,
            &self.settings.version,
        );
        let (id, path) = (segment.id, segment.file_path());

        let writer = SegmentWriter::create(segment).map_err(|source| CaptureError::Segment {
            id,
            path,
            start,
            source,
        })?;
        let path = writer.segment().file_path();
        self.index
            .insert(writer.segment())
            .map_err(|source| CaptureError::Index { id, source })?;

        log::info!("capture: opened segment {id} at {}", path.display());
        self.report.segments += 1;
        self.active = Some(ActiveSegment {
            writer,
            partition: part,
        });
        Ok(())
    }

    fn write(&mut self, block: &AudioBlock) -> Result<(), CaptureError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if let Err(source) = active.writer.write_block(&block.samples) {
            let failed = active.writer.segment().clone();
            self.active = None;
            return Err(self.fail(failed, source));
        }
        self.report.frames += block.frames() as u64;
        Ok(())
    }

    /// Close the active segment, if any, and record its end time.
    fn close_active(&mut self) -> Result<(), CaptureError> {
        self.ctx = SegmentContext::default();
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let open = active.writer.segment().clone();
        let frames = active.writer.frames();

        let closed = match active.writer.finish() {
            Ok(closed) => closed,
            Err(source) => return Err(self.fail(open, source)),
        };
        let end = closed.end.unwrap_or(closed.start);
        self.index
            .update_end_time(closed.id, end)
            .map_err(|source| CaptureError::Index {
                id: closed.id,
                source,
            })?;
        log::info!(
            "capture: closed segment {} ({frames} frames, ends {end})",
            closed.id
        );
        Ok(())
    }

    /// Flag `segment` as failed in the index and build the error to return.
    fn fail(&self, segment: Segment, source: StorageError) -> CaptureError {
        log::error!("capture: segment {} failed: {source}", segment.id);
        if let Err(e) = self.index.mark_failed(segment.id, &source.to_string()) {
            log::error!("capture: could not flag segment {} as failed: {e}", segment.id);
        }
        CaptureError::Segment {
            id: segment.id,
            path: segment.file_path(),
            start: segment.start,
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

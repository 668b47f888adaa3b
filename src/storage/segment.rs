//! Recording segments and their WAV files.
//!
//! A [`Segment`] is the index record of one contiguous capture file.  The
//! file itself is written through [`SegmentWriter`] and read back through
//! [`SegmentReader`]; both wrap `hound`, which the rest of the crate treats
//! as an opaque block writer/reader.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// File-level failures while writing or reading segments.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("segment file {path} does not exist")]
    Missing { path: PathBuf },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("failed to finalize {path}: {source}")]
    Finalize {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Fixed-width, lexicographically sortable timestamp: `YYYYMMDDHHMMSSmmm`.
pub mod stamp {
    use super::*;
    use serde::{Deserializer, Serializer};

    const SECONDS_FORMAT: &str = "%Y%m%d%H%M%S";

    /// Encode `ts` (UTC) as 17 ASCII digits.
    pub fn encode(ts: &DateTime<Utc>) -> String {
        format!(
            "{}{:03}",
            ts.format(SECONDS_FORMAT),
            ts.timestamp_subsec_millis().min(999)
        )
    }

    /// Decode a string produced by [`encode`].
    pub fn decode(s: &str) -> Option<DateTime<Utc>> {
        if s.len() != 17 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let (secs, millis) = s.split_at(14);
        let naive = NaiveDateTime::parse_from_str(secs, SECONDS_FORMAT).ok()?;
        let millis: i64 = millis.parse().ok()?;
        Some(naive.and_utc() + Duration::milliseconds(millis))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&encode(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        decode(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad timestamp `{raw}`")))
    }

    /// Same encoding for `Option<DateTime<Utc>>` fields.
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_some(&encode(ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => decode(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("bad timestamp `{raw}`"))),
                None => Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SampleEncoding
// ---------------------------------------------------------------------------

/// Sample format of a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleEncoding {
    /// 32-bit IEEE float.
    #[serde(rename = "f32")]
    Float32,
    /// 16-bit signed PCM.
    #[serde(rename = "i16")]
    Int16,
}

impl SampleEncoding {
    fn wav_spec(self, channels: u16, sample_rate: u32) -> WavSpec {
        let (bits_per_sample, sample_format) = match self {
            SampleEncoding::Float32 => (32, SampleFormat::Float),
            SampleEncoding::Int16 => (16, SampleFormat::Int),
        };
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample,
            sample_format,
        }
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// Lifecycle of a segment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    /// File is being written, or the writer crashed before closing it.
    Open,
    /// File was closed and its end time recorded.
    Complete,
    /// A write failed; the file content is not trustworthy.
    Failed,
}

/// Index record of one contiguous capture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    /// Directory holding the file.
    pub path: PathBuf,
    pub filename: String,
    #[serde(with = "stamp")]
    pub start: DateTime<Utc>,
    /// `None` until the segment is closed.
    #[serde(with = "stamp::option", default)]
    pub end: Option<DateTime<Utc>>,
    pub encoding: SampleEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    /// Application version that wrote the file.
    pub version: String,
    pub status: SegmentStatus,
    /// Failure reason when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Segment {
    /// Build the record for a new file in `dir` starting at `start`.
    ///
    /// The identifier is a fresh v4 UUID; the filename is
    /// `<prefix><YYYYMMDDHHMMSSmmm>.wav`.
    pub fn new(
        dir: &Path,
        prefix: &str,
        start: DateTime<Utc>,
        encoding: SampleEncoding,
        sample_rate: u32,
        channels: u16,
        version: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: dir.to_path_buf(),
            filename: format!("{prefix}{}.wav", stamp::encode(&start)),
            start,
            end: None,
            encoding,
            sample_rate,
            channels,
            version: version.to_string(),
            status: SegmentStatus::Open,
            error: None,
        }
    }

    /// Full path of the segment file.
    pub fn file_path(&self) -> PathBuf {
        self.path.join(&self.filename)
    }

    /// Filename with a short id suffix, used when the plain name is taken.
    fn disambiguated_filename(&self) -> String {
        let stem = self.filename.strip_suffix(".wav").unwrap_or(&self.filename);
        let id = self.id.simple().to_string();
        format!("{stem}-{}.wav", &id[..8])
    }
}

/// Wall-clock duration of `frames` frames at `sample_rate`.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::zero();
    }
    let micros = (frames as u128 * 1_000_000 / sample_rate as u128) as i64;
    Duration::microseconds(micros)
}

// ---------------------------------------------------------------------------
// SegmentWriter
// ---------------------------------------------------------------------------

/// Sequential writer for one segment file.
///
/// The WAV header is rewritten at least once per second of audio, so a
/// file left behind by a crash still reads back up to the last flush.
pub struct SegmentWriter {
    segment: Segment,
    writer: WavWriter<BufWriter<File>>,
    frames: u64,
    unflushed: u64,
}

impl SegmentWriter {
    /// Create the file described by `segment`.  The directory must exist.
    ///
    /// An existing file is never overwritten: if the name is taken the
    /// segment gets a disambiguated filename instead.
    pub fn create(mut segment: Segment) -> Result<Self, StorageError> {
        let file = match create_new(&segment.file_path()) {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let taken = segment.file_path();
                segment.filename = segment.disambiguated_filename();
                log::warn!(
                    "storage: {} already exists, writing {} instead",
                    taken.display(),
                    segment.filename
                );
                create_new(&segment.file_path())
            }
            other => other,
        }
        .map_err(|source| StorageError::Open {
            path: segment.file_path(),
            source: hound::Error::IoError(source),
        })?;

        let spec = segment
            .encoding
            .wav_spec(segment.channels, segment.sample_rate);
        let writer = WavWriter::new(BufWriter::new(file), spec).map_err(|source| {
            StorageError::Open {
                path: segment.file_path(),
                source,
            }
        })?;
        Ok(Self {
            segment,
            writer,
            frames: 0,
            unflushed: 0,
        })
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Frames written so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Start time plus the duration of every frame written.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.segment.start + frames_to_duration(self.frames, self.segment.sample_rate)
    }

    /// Append interleaved samples.
    pub fn write_block(&mut self, samples: &[f32]) -> Result<(), StorageError> {
        let result = match self.segment.encoding {
            SampleEncoding::Float32 => samples
                .iter()
                .try_for_each(|&s| self.writer.write_sample(s)),
            SampleEncoding::Int16 => samples.iter().try_for_each(|&s| {
                let scaled = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                self.writer.write_sample(scaled)
            }),
        };
        result.map_err(|source| StorageError::Write {
            path: self.segment.file_path(),
            source,
        })?;
        let frames = (samples.len() / self.segment.channels.max(1) as usize) as u64;
        self.frames += frames;
        self.unflushed += frames;
        if self.unflushed >= self.segment.sample_rate.max(1) as u64 {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered samples and bring the header's length up to date.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.writer.flush().map_err(|source| StorageError::Write {
            path: self.segment.file_path(),
            source,
        })?;
        self.unflushed = 0;
        Ok(())
    }

    /// Flush the header and close the file, returning the completed record.
    pub fn finish(self) -> Result<Segment, StorageError> {
        let end = self.end_time();
        let mut segment = self.segment;
        self.writer
            .finalize()
            .map_err(|source| StorageError::Finalize {
                path: segment.file_path(),
                source,
            })?;
        segment.end = Some(end);
        segment.status = SegmentStatus::Complete;
        Ok(segment)
    }
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

// ---------------------------------------------------------------------------
// SegmentReader
// ---------------------------------------------------------------------------

/// Sequential block reader for a segment file; the sample format is taken
/// from the file header.
pub struct SegmentReader {
    path: PathBuf,
    reader: WavReader<BufReader<File>>,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::Missing {
                path: path.to_path_buf(),
            },
            _ => StorageError::Open {
                path: path.to_path_buf(),
                source: hound::Error::IoError(e),
            },
        })?;
        let reader = WavReader::new(BufReader::new(file)).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.reader.spec().sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.reader.spec().channels
    }

    /// Total frames in the file according to its header.
    pub fn total_frames(&self) -> u64 {
        self.reader.duration() as u64
    }

    /// Read up to `frames` frames of interleaved `f32` samples.
    ///
    /// Returns `Ok(None)` once the file is exhausted; the last block may be
    /// shorter than requested.
    pub fn read_block(&mut self, frames: usize) -> Result<Option<Vec<f32>>, StorageError> {
        let spec = self.reader.spec();
        let wanted = frames * spec.channels.max(1) as usize;
        let block: Result<Vec<f32>, hound::Error> = match spec.sample_format {
            SampleFormat::Float => self.reader.samples::<f32>().take(wanted).collect(),
            SampleFormat::Int => {
                let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
                self.reader
                    .samples::<i32>()
                    .take(wanted)
                    .map(|s| s.map(|v| v as f32 / max_value))
                    .collect()
            }
        };
        let block = block.map_err(|source| StorageError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(if block.is_empty() { None } else { Some(block) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamp_is_fixed_width_and_sortable() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = a + Duration::milliseconds(7);
        let c = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();

        assert_eq!(stamp::encode(&a), "20240102030405000");
        assert_eq!(stamp::encode(&b), "20240102030405007");
        assert!(stamp::encode(&a) < stamp::encode(&b));
        assert!(stamp::encode(&b) < stamp::encode(&c));
        assert_eq!(stamp::decode(&stamp::encode(&b)), Some(b));
    }

    #[test]
    fn stamp_rejects_malformed_input() {
        assert_eq!(stamp::decode("2024"), None);
        assert_eq!(stamp::decode("2024010203040500x"), None);
        assert_eq!(stamp::decode("20241301030405000"), None);
    }

    #[test]
    fn frames_to_duration_is_sample_accurate() {
        assert_eq!(frames_to_duration(48_000, 48_000), Duration::seconds(1));
        assert_eq!(frames_to_duration(4_000, 8_000), Duration::milliseconds(500));
        assert_eq!(frames_to_duration(10, 0), Duration::zero());
    }

    #[test]
    fn writer_records_end_time_and_reader_returns_blocks() {
        let dir = tempfile::tempdir().expect("temp dir");
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let segment = Segment::new(dir.path(), "mic-", start, SampleEncoding::Float32, 1000, 1, "0.1.0");
        assert_eq!(segment.filename, "mic-20240301080000000.wav");

        let mut writer = SegmentWriter::create(segment).expect("create");
        writer.write_block(&[0.25; 600]).expect("write");
        writer.write_block(&[-0.5; 150]).expect("write");
        let done = writer.finish().expect("finish");

        assert_eq!(done.status, SegmentStatus::Complete);
        assert_eq!(done.end, Some(start + Duration::milliseconds(750)));

        let mut reader = SegmentReader::open(&done.file_path()).expect("open");
        assert_eq!(reader.sample_rate(), 1000);
        assert_eq!(reader.total_frames(), 750);

        let first = reader.read_block(500).unwrap().unwrap();
        assert_eq!(first.len(), 500);
        let second = reader.read_block(500).unwrap().unwrap();
        assert_eq!(second.len(), 250, "last block is partial");
        assert_eq!(second[249], -0.5);
        assert!(reader.read_block(500).unwrap().is_none());
    }

    #[test]
    fn int16_segments_read_back_as_normalised_floats() {
        let dir = tempfile::tempdir().expect("temp dir");
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let segment = Segment::new(dir.path(), "", start, SampleEncoding::Int16, 8000, 2, "0.1.0");

        let mut writer = SegmentWriter::create(segment).expect("create");
        writer.write_block(&[0.5, -0.5, 1.0, -1.0]).expect("write");
        assert_eq!(writer.frames(), 2);
        let done = writer.finish().expect("finish");

        let mut reader = SegmentReader::open(&done.file_path()).expect("open");
        assert_eq!(reader.channels(), 2);
        let block = reader.read_block(16).unwrap().unwrap();
        assert_eq!(block.len(), 4);
        assert!((block[0] - 0.5).abs() < 1e-3);
        assert!((block[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn flushed_audio_survives_an_abandoned_writer() {
        let dir = tempfile::tempdir().expect("temp dir");
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let segment = Segment::new(dir.path(), "", start, SampleEncoding::Float32, 8000, 1, "0.1.0");
        let path = segment.file_path();

        let mut writer = SegmentWriter::create(segment).expect("create");
        for _ in 0..10 {
            writer.write_block(&[0.25; 800]).expect("write");
        }
        // One second at 8 kHz has gone through, so the header is current.
        std::mem::forget(writer);

        let reader = SegmentReader::open(&path).expect("open");
        assert_eq!(reader.total_frames(), 8000);
    }

    #[test]
    fn explicit_flush_makes_partial_second_readable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let segment = Segment::new(dir.path(), "", start, SampleEncoding::Int16, 8000, 1, "0.1.0");
        let path = segment.file_path();

        let mut writer = SegmentWriter::create(segment).expect("create");
        writer.write_block(&[0.5; 300]).expect("write");
        writer.flush().expect("flush");
        std::mem::forget(writer);

        let mut reader = SegmentReader::open(&path).expect("open");
        assert_eq!(reader.total_frames(), 300);
        assert_eq!(reader.read_block(1000).unwrap().unwrap().len(), 300);
    }

    #[test]
    fn existing_file_is_never_truncated() {
        let dir = tempfile::tempdir().expect("temp dir");
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let first = Segment::new(dir.path(), "mic-", start, SampleEncoding::Float32, 1000, 1, "0.1.0");
        let second = Segment::new(dir.path(), "mic-", start, SampleEncoding::Float32, 1000, 1, "0.1.0");
        assert_eq!(first.filename, second.filename);

        let mut writer = SegmentWriter::create(first).expect("create first");
        writer.write_block(&[0.1; 200]).expect("write");
        let first = writer.finish().expect("finish");

        let writer = SegmentWriter::create(second).expect("create second");
        let second = writer.finish().expect("finish");

        assert_ne!(first.filename, second.filename);
        assert!(second.filename.starts_with("mic-20240301080000000-"));
        assert!(second.filename.ends_with(".wav"));
        let reader = SegmentReader::open(&first.file_path()).expect("open");
        assert_eq!(reader.total_frames(), 200);
    }

    #[test]
    fn opening_a_missing_file_is_distinguished() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = SegmentReader::open(&dir.path().join("gone.wav"))
            .err()
            .expect("missing file must fail");
        assert!(matches!(err, StorageError::Missing { .. }));
    }
}

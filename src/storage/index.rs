//! Append-only segment catalog persisted as JSON Lines.
//!
//! Every mutation is a single line appended to `index.jsonl`:
//!
//! ```text
//! {"op":"insert","segment":{...}}
//! {"op":"finalize","id":"...","end":"20240517130000000"}
//! {"op":"fail","id":"...","reason":"..."}
//! {"op":"delete","id":"..."}
//! ```
//!
//! Queries replay the file into a fresh snapshot, so a reader running while
//! the capture writer appends sees every line that was complete when it
//! opened the file.  A torn trailing line (crash mid-append) is skipped.
//!
//! Only one capture session writes to a store at a time; the store does no
//! locking of its own.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::segment::{stamp, Segment, SegmentStatus};

// ---------------------------------------------------------------------------
// IndexError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index {path} is unreachable: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index {path} is corrupt at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode index record for segment {id}: {source}")]
    Encode {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Index events
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum IndexEvent {
    Insert {
        segment: Segment,
    },
    Finalize {
        id: Uuid,
        #[serde(with = "stamp")]
        end: DateTime<Utc>,
    },
    Fail {
        id: Uuid,
        reason: String,
    },
    Delete {
        id: Uuid,
    },
}

impl IndexEvent {
    fn id(&self) -> Uuid {
        match self {
            IndexEvent::Insert { segment } => segment.id,
            IndexEvent::Finalize { id, .. }
            | IndexEvent::Fail { id, .. }
            | IndexEvent::Delete { id } => *id,
        }
    }
}

// ---------------------------------------------------------------------------
// IndexStore
// ---------------------------------------------------------------------------

/// Handle to the catalog file.  Cheap to clone; holds no open descriptors.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    /// Open (creating if needed) the index at `path`.
    ///
    /// Fails if the parent directory cannot be created or the file cannot be
    /// opened for append, so an unusable store is caught at pipeline start.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| IndexError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let store = Self { path };
        store.repair_tail()?;
        store.append_handle()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a new segment.  Capture calls this when it opens the file, so
    /// the record exists (with `end = None`) even if the process dies.
    pub fn insert(&self, segment: &Segment) -> Result<(), IndexError> {
        self.append(&IndexEvent::Insert {
            segment: segment.clone(),
        })
    }

    /// Record the end time of a closed segment and mark it complete.
    pub fn update_end_time(&self, id: Uuid, end: DateTime<Utc>) -> Result<(), IndexError> {
        self.append(&IndexEvent::Finalize { id, end })
    }

    /// Flag a segment whose file could not be written completely.
    pub fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), IndexError> {
        self.append(&IndexEvent::Fail {
            id,
            reason: reason.to_string(),
        })
    }

    /// Remove a segment from the catalog.  The file is the caller's concern.
    pub fn delete(&self, id: Uuid) -> Result<(), IndexError> {
        self.append(&IndexEvent::Delete { id })
    }

    /// Look up one segment by identifier.
    pub fn get(&self, id: Uuid) -> Result<Option<Segment>, IndexError> {
        Ok(self.snapshot()?.remove(&id))
    }

    /// All live segments, ascending by start time.
    pub fn all(&self) -> Result<Vec<Segment>, IndexError> {
        let mut segments: Vec<Segment> = self.snapshot()?.into_values().collect();
        segments.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(segments)
    }

    /// Segments whose start is at or after `from`, ascending by start time.
    ///
    /// Filtering compares the fixed-width timestamp strings, which order the
    /// same way as the instants they encode.
    pub fn query_from(&self, from: DateTime<Utc>) -> Result<Vec<Segment>, IndexError> {
        let lower = stamp::encode(&from);
        let mut segments: Vec<Segment> = self
            .snapshot()?
            .into_values()
            .filter(|s| stamp::encode(&s.start) >= lower)
            .collect();
        segments.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(segments)
    }

    /// Rewrite the log so it holds one `insert` per live segment.
    pub fn compact(&self) -> Result<usize, IndexError> {
        let segments = self.all()?;
        let tmp = self.path.with_extension("jsonl.tmp");
        let io_err = |source| IndexError::Io {
            path: tmp.clone(),
            source,
        };
        {
            let mut file = File::create(&tmp).map_err(io_err)?;
            for segment in &segments {
                let line = encode_line(&IndexEvent::Insert {
                    segment: segment.clone(),
                })?;
                file.write_all(line.as_bytes()).map_err(io_err)?;
            }
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(|source| IndexError::Io {
            path: self.path.clone(),
            source,
        })?;
        log::info!("index: compacted {} to {} segments", self.path.display(), segments.len());
        Ok(segments.len())
    }

    /// Remove the index file entirely.
    pub fn remove(self) -> Result<(), IndexError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(IndexError::Io {
                path: self.path,
                source,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn append_handle(&self) -> Result<File, IndexError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| IndexError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Drop a record left half-written by a crash so later appends start on
    /// a fresh line.
    fn repair_tail(&self) -> Result<(), IndexError> {
        let io_err = |source| IndexError::Io {
            path: self.path.clone(),
            source,
        };
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(e)),
        };
        if data.is_empty() || data.ends_with(b"\n") {
            return Ok(());
        }
        let keep = data.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
        OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|f| f.set_len(keep as u64))
            .map_err(io_err)?;
        log::warn!(
            "index: truncated {} torn bytes from {}",
            data.len() - keep,
            self.path.display()
        );
        Ok(())
    }

    fn append(&self, event: &IndexEvent) -> Result<(), IndexError> {
        let line = encode_line(event)?;
        let mut file = self.append_handle()?;
        // One write per record keeps concurrent readers from seeing half a
        // line except at a crash boundary.
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| IndexError::Io {
                path: self.path.clone(),
                source,
            })?;
        log::debug!("index: appended {} for {}", op_name(event), event.id());
        Ok(())
    }

    /// Replay the log into a map of live segments.
    fn snapshot(&self) -> Result<HashMap<Uuid, Segment>, IndexError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => {
                return Err(IndexError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|source| IndexError::Io {
                path: self.path.clone(),
                source,
            })?;

        let mut live: HashMap<Uuid, Segment> = HashMap::new();
        let last = lines.len();
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: IndexEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(source) if n + 1 == last => {
                    log::warn!(
                        "index: ignoring torn trailing record in {} ({source})",
                        self.path.display()
                    );
                    continue;
                }
                Err(source) => {
                    return Err(IndexError::Corrupt {
                        path: self.path.clone(),
                        line: n + 1,
                        source,
                    })
                }
            };
            apply(&mut live, event);
        }
        Ok(live)
    }
}

fn apply(live: &mut HashMap<Uuid, Segment>, event: IndexEvent) {
    match event {
        IndexEvent::Insert { segment } => {
            live.insert(segment.id, segment);
        }
        IndexEvent::Finalize { id, end } => {
            if let Some(segment) = live.get_mut(&id) {
                segment.end = Some(end);
                if segment.status == SegmentStatus::Open {
                    segment.status = SegmentStatus::Complete;
                }
            }
        }
        IndexEvent::Fail { id, reason } => {
            if let Some(segment) = live.get_mut(&id) {
                segment.status = SegmentStatus::Failed;
                segment.error = Some(reason);
            }
        }
        IndexEvent::Delete { id } => {
            live.remove(&id);
        }
    }
}

fn encode_line(event: &IndexEvent) -> Result<String, IndexError> {
    let mut line = serde_json::to_string(event).map_err(|source| IndexError::Encode {
        id: event.id(),
        source,
    })?;
    line.push('\n');
    Ok(line)
}

fn op_name(event: &IndexEvent) -> &'static str {
    match event {
        IndexEvent::Insert { .. } => "insert",
        IndexEvent::Finalize { .. } => "finalize",
        IndexEvent::Fail { .. } => "fail",
        IndexEvent::Delete { .. } => "delete",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

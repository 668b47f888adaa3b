//! Rotation partitions: hierarchical time-bucket paths.
//!
//! A template is an ordered list of [`TimeComponent`]s applied from coarse to
//! fine.  `[Year, Month, Day, Hour]` maps `2024-05-17T13:42:07Z` to
//! `2024/05/17/13`.  The finest component is also the rotation period: the
//! capture writer closes its segment whenever the partition of the incoming
//! block differs from the one the segment was opened in.
//!
//! All partitions are computed in UTC so a daylight-saving shift can never
//! map two instants to the same bucket out of order.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// One level of the partition hierarchy.
///
/// Declaration order is coarse-to-fine; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeComponent {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl TimeComponent {
    /// Zero-padded directory name for this component of `ts`.
    fn render(self, ts: &DateTime<Utc>) -> String {
        match self {
            TimeComponent::Year => format!("{:04}", ts.year()),
            TimeComponent::Month => format!("{:02}", ts.month()),
            TimeComponent::Day => format!("{:02}", ts.day()),
            TimeComponent::Hour => format!("{:02}", ts.hour()),
            TimeComponent::Minute => format!("{:02}", ts.minute()),
            TimeComponent::Second => format!("{:02}", ts.second()),
        }
    }
}

/// A storage subpath derived from a timestamp and a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition(PathBuf);

impl Partition {
    /// Relative path, e.g. `2024/05/17/13`.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Absolute directory of this partition under `root`.
    pub fn dir_under(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }

    /// Create the partition directory under `root` if it does not exist yet.
    ///
    /// Creating an existing directory is a no-op, so repeated calls for the
    /// same partition never fail.
    pub fn ensure_dir(&self, root: &Path) -> std::io::Result<PathBuf> {
        let dir = self.dir_under(root);
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir)?;
            log::info!("storage: created partition directory {}", dir.display());
        }
        Ok(dir)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Compute the partition of `ts` under `template`.
///
/// Pure and deterministic: identical inputs always yield identical paths.
pub fn partition(ts: &DateTime<Utc>, template: &[TimeComponent]) -> Partition {
    Partition(template.iter().map(|c| c.render(ts)).collect())
}

//! On-disk state: rotation partitions, segment files and the segment index.
//!
//! ```text
//! <root>/index.jsonl                         IndexStore
//! <root>/recordings/2024/05/17/13/<file>.wav SegmentWriter / SegmentReader
//!                   └── partition(ts, template)
//! ```

pub mod index;
pub mod partition;
pub mod purge;
pub mod segment;

pub use index::{IndexError, IndexStore};
pub use partition::{partition, Partition, TimeComponent};
pub use purge::{purge, PurgeError, PurgeReport};
pub use segment::{
    frames_to_duration, stamp, SampleEncoding, Segment, SegmentReader, SegmentStatus,
    SegmentWriter, StorageError,
};

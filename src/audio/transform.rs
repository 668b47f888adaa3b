//! Per-block processing hook applied by the capture writer.
//!
//! [`BlockTransform`] sees every captured block before it reaches the
//! segment file.  The only shipped implementation is [`Passthrough`]; the
//! trait is the seam for silence suppression, gain and similar filters.
//!
//! A transform answers with a [`TransformOutcome`]:
//!
//! | Variant         | Writer action                                        |
//! |-----------------|------------------------------------------------------|
//! | `Keep(block)`   | write `block` to the active segment                  |
//! | `Drop`          | discard this block, keep the segment open            |
//! | `Restart`       | discard this block and close the active segment; the |
//! |                 | next kept block opens a new one                      |
//!
//! [`SegmentContext`] carries transform state for the lifetime of one
//! segment and is reset whenever the writer rotates.

use super::block::AudioBlock;

/// Decision returned by a [`BlockTransform`].
#[derive(Debug, PartialEq)]
pub enum TransformOutcome {
    Keep(AudioBlock),
    Drop,
    Restart,
}

/// State shared between a transform and the writer for one segment.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SegmentContext {
    /// Blocks handed to the transform since the segment opened.
    pub blocks_seen: u64,
}

/// Object-safe hook run on the capture worker thread, never in the device
/// callback.
pub trait BlockTransform: Send {
    fn transform(&mut self, block: AudioBlock, ctx: &mut SegmentContext) -> TransformOutcome;
}

/// Keeps every block unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl BlockTransform for Passthrough {
    fn transform(&mut self, block: AudioBlock, _ctx: &mut SegmentContext) -> TransformOutcome {
        TransformOutcome::Keep(block)
    }
}

// Compile-time assertion: Box<dyn BlockTransform> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn BlockTransform>) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_keeps_block_untouched() {
        let block = AudioBlock::new(3, 300, 1, vec![0.1, -0.2, 0.3]);
        let mut ctx = SegmentContext::default();
        let out = Passthrough.transform(block.clone(), &mut ctx);
        assert_eq!(out, TransformOutcome::Keep(block));
        assert_eq!(ctx, SegmentContext::default());
    }
}

//! The unit of audio exchanged between device callbacks and workers.

/// A buffer of interleaved `f32` samples copied out of a device callback.
///
/// `sequence` increases by one per block produced on a stream and
/// `frame_offset` counts frames since the stream started, so a consumer can
/// both detect gaps (dropped blocks) and place the block in time.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub sequence: u64,
    pub frame_offset: u64,
    pub channels: u16,
    /// Interleaved PCM samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
}

impl AudioBlock {
    pub fn new(sequence: u64, frame_offset: u64, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sequence,
            frame_offset,
            channels,
            samples,
        }
    }

    /// Number of frames (samples per channel) in the block.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Re-chunks arbitrarily sized device buffers into fixed-size blocks.
///
/// Lives inside the capture callback.  The staging buffer is allocated once
/// with the block's exact capacity; each emitted block takes that buffer and
/// a fresh one of the same size replaces it.
pub struct BlockAssembler {
    block_samples: usize,
    channels: u16,
    staging: Vec<f32>,
    next_sequence: u64,
    frames_emitted: u64,
}

impl BlockAssembler {
    pub fn new(block_frames: usize, channels: u16) -> Self {
        let block_samples = block_frames.max(1) * channels.max(1) as usize;
        Self {
            block_samples,
            channels,
            staging: Vec::with_capacity(block_samples),
            next_sequence: 0,
            frames_emitted: 0,
        }
    }

    /// Feed device samples; `emit` is called once per completed block.
    pub fn push(&mut self, mut data: &[f32], mut emit: impl FnMut(AudioBlock)) {
        while !data.is_empty() {
            let room = self.block_samples - self.staging.len();
            let take = room.min(data.len());
            self.staging.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.staging.len() == self.block_samples {
                let samples = std::mem::replace(
                    &mut self.staging,
                    Vec::with_capacity(self.block_samples),
                );
                let block = AudioBlock::new(
                    self.next_sequence,
                    self.frames_emitted,
                    self.channels,
                    samples,
                );
                self.next_sequence += 1;
                self.frames_emitted += block.frames() as u64;
                emit(block);
            }
        }
    }

    /// Samples waiting for the current block to fill.
    pub fn pending(&self) -> usize {
        self.staging.len()
    }
}

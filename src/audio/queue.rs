//! Bounded single-producer/single-consumer queue of [`AudioBlock`]s.
//!
//! The queue is the only synchronisation point between a real-time device
//! callback and a worker thread.  Capacity is fixed when the pipeline starts
//! and never grows.
//!
//! ## Overflow behaviour
//!
//! The capture callback may not block, so a queue built with
//! [`drop_oldest_queue`] evicts the oldest queued block to make room for the
//! newest one in [`BlockProducer::push_drop_oldest`] and counts the loss.
//! A stalled disk therefore costs the oldest unwritten audio, and memory
//! stays bounded at `capacity` blocks.
//!
//! The playback worker runs outside the real-time context and uses
//! [`BlockProducer::push_timeout`], which waits for the callback to free a
//! slot.
//!
//! ## Closing
//!
//! Dropping the [`BlockProducer`] closes the queue.  The consumer still
//! drains every queued block and then observes [`Pop::Closed`], which lets
//! playback tell the end of a file apart from an underrun ([`Pop::Empty`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};

use super::block::AudioBlock;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueCounters {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What happened to a block handed to [`BlockProducer::push_drop_oldest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after evicting the oldest block.
    ReplacedOldest,
    /// The queue was full and cannot evict; the new block was discarded.
    DroppedNewest,
    /// The consumer is gone; the block was discarded.
    Closed,
}

/// Result of a dequeue attempt.
#[derive(Debug, PartialEq)]
pub enum Pop {
    Block(AudioBlock),
    /// Nothing queued right now (or the wait timed out).
    Empty,
    /// The producer is gone and every block has been consumed.
    Closed,
}

/// [`BlockProducer::push_timeout`] could not queue the block.
#[derive(Debug, PartialEq)]
pub enum PushError {
    /// The queue stayed full for the whole timeout; the block is returned.
    Full(AudioBlock),
    /// The consumer is gone.
    Closed,
}

// ---------------------------------------------------------------------------
// Constructor
// ---------------------------------------------------------------------------

/// Create a queue holding at most `capacity` blocks whose producer waits
/// (or is refused) when the queue is full.
///
/// # Panics
///
/// Panics if `capacity == 0`; settings validation rejects that value.
pub fn block_queue(capacity: usize) -> (BlockProducer, BlockConsumer) {
    build(capacity, false)
}

/// Create a queue holding at most `capacity` blocks whose producer evicts
/// the oldest block when the queue is full.
///
/// The producer keeps a receiving handle for eviction, so dropping the
/// consumer does not close this queue; stop the producer first.
///
/// # Panics
///
/// Panics if `capacity == 0`.
pub fn drop_oldest_queue(capacity: usize) -> (BlockProducer, BlockConsumer) {
    build(capacity, true)
}

fn build(capacity: usize, evicting: bool) -> (BlockProducer, BlockConsumer) {
    assert!(capacity > 0, "block queue capacity must be > 0");
    let (tx, rx) = bounded(capacity);
    let counters = Arc::new(QueueCounters::default());
    (
        BlockProducer {
            tx,
            evict: evicting.then(|| rx.clone()),
            counters: Arc::clone(&counters),
        },
        BlockConsumer { rx, counters },
    )
}

// ---------------------------------------------------------------------------
// BlockProducer
// ---------------------------------------------------------------------------

pub struct BlockProducer {
    tx: Sender<AudioBlock>,
    /// Receiver handle used only to evict the oldest block on overflow.
    evict: Option<Receiver<AudioBlock>>,
    counters: Arc<QueueCounters>,
}

impl BlockProducer {
    /// Non-blocking push that never fails for lack of space: when the queue is
    /// full the oldest block is dropped first.  Safe to call from a real-time
    /// callback.
    ///
    /// On a queue built without eviction the incoming block is the one
    /// dropped instead.
    pub fn push_drop_oldest(&self, block: AudioBlock) -> PushOutcome {
        let block = match self.tx.try_send(block) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                return PushOutcome::Queued;
            }
            Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
            Err(TrySendError::Full(block)) => block,
        };

        let Some(evict) = &self.evict else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::DroppedNewest;
        };

        // Full: make room.  The consumer may have freed a slot in between, in
        // which case nothing is evicted.
        let evicted = evict.try_recv().is_ok();
        match self.tx.try_send(block) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                if evicted {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    PushOutcome::ReplacedOldest
                } else {
                    PushOutcome::Queued
                }
            }
            Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
            Err(TrySendError::Full(_)) => {
                // Unreachable with a single producer; count it as a drop.
                self.counters.dropped.fetch_add(1 + evicted as u64, Ordering::Relaxed);
                PushOutcome::ReplacedOldest
            }
        }
    }

    /// Non-blocking push; a full queue hands the block back.
    pub fn try_push(&self, block: AudioBlock) -> Result<(), PushError> {
        match self.tx.try_send(block) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(block)) => Err(PushError::Full(block)),
            Err(TrySendError::Disconnected(_)) => Err(PushError::Closed),
        }
    }

    /// Blocking push for worker threads; waits up to `timeout` for space.
    pub fn push_timeout(&self, block: AudioBlock, timeout: Duration) -> Result<(), PushError> {
        match self.tx.send_timeout(block, timeout) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(block)) => Err(PushError::Full(block)),
            Err(SendTimeoutError::Disconnected(_)) => Err(PushError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }
}

// ---------------------------------------------------------------------------
// BlockConsumer
// ---------------------------------------------------------------------------

pub struct BlockConsumer {
    rx: Receiver<AudioBlock>,
    counters: Arc<QueueCounters>,
}

impl BlockConsumer {
    /// Non-blocking pop; safe to call from a real-time callback.
    pub fn try_pop(&self) -> Pop {
        match self.rx.try_recv() {
            Ok(block) => Pop::Block(block),
            Err(TryRecvError::Empty) => Pop::Empty,
            Err(TryRecvError::Disconnected) => Pop::Closed,
        }
    }

    /// Blocking pop for worker threads; [`Pop::Empty`] means the wait timed
    /// out.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        match self.rx.recv_timeout(timeout) {
            Ok(block) => Pop::Block(block),
            Err(RecvTimeoutError::Timeout) => Pop::Empty,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocks accepted by the queue so far.
    pub fn pushed(&self) -> u64 {
        self.counters.pushed.load(Ordering::Relaxed)
    }

    /// Blocks evicted by overflow so far.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn block(seq: u64) -> AudioBlock {
        AudioBlock::new(seq, seq * 4, 1, vec![seq as f32; 4])
    }

    fn drain(consumer: &BlockConsumer) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Pop::Block(b) = consumer.try_pop() {
            seqs.push(b.sequence);
        }
        seqs
    }

    // ---- FIFO within capacity ---------------------------------------------

    #[test]
    fn fifo_without_loss_within_capacity() {
        let (producer, consumer) = drop_oldest_queue(8);
        for seq in 0..8 {
            assert_eq!(producer.push_drop_oldest(block(seq)), PushOutcome::Queued);
        }
        assert!(producer.is_full());
        assert_eq!(drain(&consumer), (0..8).collect::<Vec<_>>());
        assert_eq!(consumer.dropped(), 0);
        assert_eq!(consumer.pushed(), 8);
    }

    #[test]
    fn interleaved_push_pop_keeps_order() {
        let (producer, consumer) = drop_oldest_queue(2);
        let mut seen = Vec::new();
        for seq in 0..10 {
            producer.push_drop_oldest(block(seq));
            if seq % 2 == 1 {
                seen.extend(drain(&consumer));
            }
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    // ---- Overflow (oldest discarded) ---------------------------------------

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let (producer, consumer) = drop_oldest_queue(3);
        for seq in 0..3 {
            producer.push_drop_oldest(block(seq));
        }
        assert_eq!(producer.push_drop_oldest(block(3)), PushOutcome::ReplacedOldest);
        assert_eq!(producer.push_drop_oldest(block(4)), PushOutcome::ReplacedOldest);

        assert_eq!(producer.len(), 3, "capacity is never exceeded");
        assert_eq!(drain(&consumer), vec![2, 3, 4]);
        assert_eq!(consumer.dropped(), 2);
    }

    #[test]
    fn try_push_returns_block_when_full() {
        let (producer, _consumer) = block_queue(1);
        producer.try_push(block(0)).unwrap();
        match producer.try_push(block(1)) {
            Err(PushError::Full(b)) => assert_eq!(b.sequence, 1),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn push_timeout_gives_up_on_a_stuck_consumer() {
        let (producer, _consumer) = block_queue(1);
        producer.try_push(block(0)).unwrap();
        let err = producer
            .push_timeout(block(1), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, PushError::Full(_)));
    }

    // ---- Closing -------------------------------------------------------------

    #[test]
    fn consumer_drains_before_reporting_closed() {
        let (producer, consumer) = block_queue(4);
        producer.try_push(block(0)).unwrap();
        producer.try_push(block(1)).unwrap();
        drop(producer);

        assert!(matches!(consumer.try_pop(), Pop::Block(b) if b.sequence == 0));
        assert!(matches!(consumer.try_pop(), Pop::Block(b) if b.sequence == 1));
        assert_eq!(consumer.try_pop(), Pop::Closed);
    }

    #[test]
    fn empty_is_distinct_from_closed() {
        let (producer, consumer) = block_queue(4);
        assert_eq!(consumer.try_pop(), Pop::Empty);
        assert_eq!(consumer.pop_timeout(Duration::from_millis(5)), Pop::Empty);
        drop(producer);
        assert_eq!(consumer.pop_timeout(Duration::from_millis(5)), Pop::Closed);
    }

    #[test]
    fn producer_sees_closed_consumer() {
        let (producer, consumer) = block_queue(2);
        drop(consumer);
        assert_eq!(producer.try_push(block(0)), Err(PushError::Closed));
        assert_eq!(
            producer.push_timeout(block(1), Duration::from_millis(5)),
            Err(PushError::Closed)
        );
    }

    #[test]
    fn non_evicting_queue_drops_the_newest_block() {
        let (producer, consumer) = block_queue(1);
        producer.try_push(block(0)).unwrap();
        assert_eq!(producer.push_drop_oldest(block(1)), PushOutcome::DroppedNewest);
        assert_eq!(drain(&consumer), vec![0]);
        assert_eq!(consumer.dropped(), 1);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = block_queue(0);
    }
}

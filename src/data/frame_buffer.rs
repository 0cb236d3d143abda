//! Bounded ring of frame slots shared by one producer and one consumer.
//!
//! The acquisition task writes, the saving task reads, and this buffer is the
//! only state they share. Every access goes through a reservation:
//!
//! ```text
//! writer: reserve_for_write ──► commit_write          Empty/Saved ─► Writing ─► Filled
//! reader: reserve_for_read  ──► commit_read/fail_read  Filled ─► Saving ─► Saved/Errored
//! ```
//!
//! # Invariants
//!
//! - Sequence numbers are assigned at write reservation, strictly increasing,
//!   and never reused. The slot of sequence `s` is `s % capacity`.
//! - At most one outstanding write reservation and one outstanding read
//!   reservation. A second one fails with [`BufferError::SlotBusy`].
//! - The reader receives frames in sequence order.
//! - A slot still holding an unread frame is never overwritten, except under
//!   [`OverflowPolicy::DropOldest`], which turns the oldest unread frame into
//!   `Dropped` and counts it.
//! - Capacity is fixed at construction.
//!
//! Blocking waits use `tokio::sync::Notify`. A waiter is registered before the
//! ring state is re-checked, so a commit that lands between the check and the
//! wait is never lost.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::data::frame::{FrameRecord, RawFrame};
use crate::error::DaqError;

/// Producer behaviour when every slot holds an unread frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait (bounded) for the reader to free a slot.
    #[default]
    Block,
    /// Discard the oldest unread frame to make room.
    ///
    /// A frame the reader holds cannot be reclaimed. While it is being saved
    /// the incoming frame is discarded instead, so with a slow consumer most
    /// overflows land on incoming frames, as under `DropNewest`.
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

/// Lifecycle of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotStatus {
    /// Never written in this session.
    Empty,
    /// Reserved by the writer, payload not committed yet.
    Writing,
    /// Holds a frame waiting for the reader.
    Filled,
    /// Handed to the reader.
    Saving,
    /// Persisted; free for reuse.
    Saved,
    /// Reclaimed under `DropOldest` before it was read.
    Dropped,
    /// The reader failed to persist it, or it was abandoned on drain.
    Errored,
}

/// Reservation failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("frame buffer is full")]
    Full,
    #[error("no filled frame is available")]
    Empty,
    #[error("slot busy: {0}")]
    SlotBusy(&'static str),
    #[error("reservation timed out after {0:?}")]
    Timeout(Duration),
    #[error("writers were cancelled")]
    Cancelled,
    #[error("writes are finished and the buffer is drained")]
    Finished,
}

impl From<BufferError> for DaqError {
    fn from(value: BufferError) -> Self {
        match value {
            BufferError::Full => DaqError::Overflow("frame buffer is full".into()),
            BufferError::Empty => DaqError::SlotBusy("no filled frame is available".into()),
            BufferError::SlotBusy(reason) => DaqError::SlotBusy(reason.into()),
            BufferError::Timeout(bound) => DaqError::timeout("frame buffer reservation", bound),
            BufferError::Cancelled | BufferError::Finished => DaqError::Cancelled,
        }
    }
}

/// Exclusive right to fill the slot of one sequence number.
#[derive(Debug)]
#[must_use = "a write reservation blocks the writer until it is committed"]
pub struct WriteReservation {
    sequence: u64,
    timestamp: DateTime<Utc>,
    reclaimed: Option<u64>,
}

impl WriteReservation {
    /// Sequence number assigned to the incoming frame.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Sequence of the unread frame dropped to make room, if any.
    pub fn reclaimed(&self) -> Option<u64> {
        self.reclaimed
    }
}

/// Exclusive right to persist one filled frame.
#[derive(Debug)]
#[must_use = "a read reservation blocks the reader until it is committed or failed"]
pub struct ReadReservation {
    record: FrameRecord,
}

impl ReadReservation {
    /// Sequence number of the frame.
    pub fn sequence(&self) -> u64 {
        self.record.sequence
    }

    /// The frame and its capture metadata.
    pub fn record(&self) -> &FrameRecord {
        &self.record
    }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Number of slots
    pub capacity: usize,
    /// Slots currently holding a frame not yet released by the reader
    pub pending: usize,
    /// Frames committed by the writer
    pub written: u64,
    /// Frames committed by the reader
    pub saved: u64,
    /// Frames reclaimed under `DropOldest`
    pub dropped: u64,
    /// Frames failed by the reader or abandoned on drain
    pub errored: u64,
    /// Sequence number the next write reservation will receive
    pub next_sequence: u64,
}

#[derive(Debug)]
struct Slot {
    sequence: u64,
    status: SlotStatus,
    record: Option<FrameRecord>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            sequence: 0,
            status: SlotStatus::Empty,
            record: None,
        }
    }
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Slot>,
    policy: OverflowPolicy,
    next_sequence: u64,
    read_cursor: u64,
    writing: Option<u64>,
    reading: Option<u64>,
    cancelled: bool,
    finished: bool,
    written: u64,
    saved: u64,
    dropped: u64,
    errored: u64,
}

impl Ring {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            policy,
            next_sequence: 0,
            read_cursor: 0,
            writing: None,
            reading: None,
            cancelled: false,
            finished: false,
            written: 0,
            saved: 0,
            dropped: 0,
            errored: 0,
        }
    }

    /// Oldest sequence still occupying a slot.
    fn tail(&self) -> u64 {
        self.reading.unwrap_or(self.read_cursor)
    }

    fn pending(&self) -> usize {
        (self.next_sequence - self.tail()) as usize
    }

    fn slot_mut(&mut self, sequence: u64) -> &mut Slot {
        let index = (sequence % self.slots.len() as u64) as usize;
        &mut self.slots[index]
    }

    fn slot(&self, sequence: u64) -> &Slot {
        let index = (sequence % self.slots.len() as u64) as usize;
        &self.slots[index]
    }
}

/// Fixed-capacity frame ring with reservation-based access.
#[derive(Debug)]
pub struct FrameBuffer {
    capacity: usize,
    ring: Mutex<Ring>,
    space_freed: Notify,
    data_ready: Notify,
}

impl FrameBuffer {
    /// Create a buffer with `capacity` slots (at least one).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring::new(capacity, policy)),
            space_freed: Notify::new(),
            data_ready: Notify::new(),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current overflow policy.
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.ring.lock().policy
    }

    /// Change the overflow policy. Takes effect on the next write reservation.
    pub fn set_overflow_policy(&self, policy: OverflowPolicy) {
        self.ring.lock().policy = policy;
    }

    // =========================================================================
    // Writer side
    // =========================================================================

    /// Reserve the next slot without waiting.
    ///
    /// # Errors
    /// - `Full` when no slot is free under `Block` or `DropNewest`
    /// - `SlotBusy` when a write reservation is outstanding, or under
    ///   `DropOldest` when the oldest frame is being saved and cannot be reclaimed
    /// - `Cancelled` after [`cancel_writers`](Self::cancel_writers)
    /// - `Finished` after [`finish_writes`](Self::finish_writes)
    pub fn try_reserve_for_write(&self) -> Result<WriteReservation, BufferError> {
        let mut ring = self.ring.lock();

        if ring.cancelled {
            return Err(BufferError::Cancelled);
        }
        if ring.finished {
            return Err(BufferError::Finished);
        }
        if ring.writing.is_some() {
            return Err(BufferError::SlotBusy("a write reservation is outstanding"));
        }

        let mut reclaimed = None;
        if ring.pending() >= self.capacity {
            match ring.policy {
                OverflowPolicy::Block | OverflowPolicy::DropNewest => {
                    return Err(BufferError::Full);
                }
                OverflowPolicy::DropOldest => {
                    if ring.reading.is_some() {
                        return Err(BufferError::SlotBusy("the oldest frame is being saved"));
                    }
                    let oldest = ring.read_cursor;
                    let slot = ring.slot_mut(oldest);
                    slot.status = SlotStatus::Dropped;
                    slot.record = None;
                    ring.read_cursor += 1;
                    ring.dropped += 1;
                    reclaimed = Some(oldest);
                    debug!(sequence = oldest, "Reclaimed oldest unread frame");
                }
            }
        }

        let sequence = ring.next_sequence;
        ring.next_sequence += 1;
        ring.writing = Some(sequence);
        let slot = ring.slot_mut(sequence);
        slot.sequence = sequence;
        slot.status = SlotStatus::Writing;
        slot.record = None;

        trace!(sequence, "Write slot reserved");
        Ok(WriteReservation {
            sequence,
            timestamp: Utc::now(),
            reclaimed,
        })
    }

    /// Reserve the next slot, waiting up to `timeout` for the reader to free one.
    ///
    /// Only `Full` is waited on; every other error is returned immediately.
    /// [`cancel_writers`](Self::cancel_writers) wakes the waiter at once with
    /// `Cancelled`.
    pub async fn reserve_for_write(
        &self,
        timeout: Duration,
    ) -> Result<WriteReservation, BufferError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.space_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_reserve_for_write() {
                Err(BufferError::Full) => {}
                other => return other,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BufferError::Timeout(timeout));
            }
        }
    }

    /// Publish the frame for the reservation, `Writing → Filled`.
    pub fn commit_write(
        &self,
        reservation: WriteReservation,
        frame: RawFrame,
    ) -> Result<(), BufferError> {
        let mut ring = self.ring.lock();
        if ring.writing != Some(reservation.sequence) {
            return Err(BufferError::SlotBusy("write reservation is not outstanding"));
        }

        let slot = ring.slot_mut(reservation.sequence);
        slot.status = SlotStatus::Filled;
        slot.record = Some(FrameRecord {
            sequence: reservation.sequence,
            timestamp: reservation.timestamp,
            frame,
        });
        ring.writing = None;
        ring.written += 1;
        drop(ring);

        self.data_ready.notify_one();
        Ok(())
    }

    /// Refuse all further write reservations and wake a blocked writer.
    pub fn cancel_writers(&self) {
        self.ring.lock().cancelled = true;
        self.space_freed.notify_waiters();
    }

    /// Mark the end of the session's writes. Once the remaining frames are read,
    /// the reader gets `Finished`.
    pub fn finish_writes(&self) {
        self.ring.lock().finished = true;
        self.data_ready.notify_waiters();
        self.data_ready.notify_one();
    }

    // =========================================================================
    // Reader side
    // =========================================================================

    /// Take the next frame in sequence order without waiting, `Filled → Saving`.
    pub fn try_reserve_for_read(&self) -> Result<ReadReservation, BufferError> {
        let mut ring = self.ring.lock();

        if ring.reading.is_some() {
            return Err(BufferError::SlotBusy("a read reservation is outstanding"));
        }

        let sequence = ring.read_cursor;
        if sequence >= ring.next_sequence {
            return Err(if ring.finished {
                BufferError::Finished
            } else {
                BufferError::Empty
            });
        }

        let slot = ring.slot_mut(sequence);
        if slot.status != SlotStatus::Filled {
            // Reserved by the writer but not committed yet
            return Err(BufferError::Empty);
        }
        let Some(record) = slot.record.take() else {
            return Err(BufferError::Empty);
        };
        slot.status = SlotStatus::Saving;
        ring.read_cursor += 1;
        ring.reading = Some(sequence);

        trace!(sequence, "Read slot reserved");
        Ok(ReadReservation { record })
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// Returns `Finished` once writes are finished and every frame was handed out.
    pub async fn reserve_for_read(
        &self,
        timeout: Duration,
    ) -> Result<ReadReservation, BufferError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_reserve_for_read() {
                Err(BufferError::Empty) => {}
                other => return other,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BufferError::Timeout(timeout));
            }
        }
    }

    /// The frame was persisted, `Saving → Saved`. Frees the slot.
    pub fn commit_read(&self, reservation: ReadReservation) -> Result<(), BufferError> {
        self.release_read(reservation.sequence(), SlotStatus::Saved)
    }

    /// The frame could not be persisted, `Saving → Errored`. Frees the slot.
    pub fn fail_read(&self, reservation: ReadReservation) -> Result<(), BufferError> {
        self.release_read(reservation.sequence(), SlotStatus::Errored)
    }

    fn release_read(&self, sequence: u64, status: SlotStatus) -> Result<(), BufferError> {
        let mut ring = self.ring.lock();
        if ring.reading != Some(sequence) {
            return Err(BufferError::SlotBusy("read reservation is not outstanding"));
        }
        ring.slot_mut(sequence).status = status;
        ring.reading = None;
        if status == SlotStatus::Saved {
            ring.saved += 1;
        } else {
            ring.errored += 1;
        }
        drop(ring);

        self.space_freed.notify_one();
        Ok(())
    }

    /// Abandon every frame the reader has not released, marking it `Errored`.
    ///
    /// Covers an outstanding read reservation whose holder went away. Returns
    /// the affected sequences in order.
    pub fn drain_unread(&self) -> Vec<u64> {
        let mut ring = self.ring.lock();
        let mut abandoned = Vec::new();

        if let Some(sequence) = ring.reading.take() {
            ring.slot_mut(sequence).status = SlotStatus::Errored;
            ring.errored += 1;
            abandoned.push(sequence);
        }

        for sequence in ring.read_cursor..ring.next_sequence {
            let slot = ring.slot_mut(sequence);
            if slot.status == SlotStatus::Filled {
                slot.status = SlotStatus::Errored;
                slot.record = None;
                ring.errored += 1;
                abandoned.push(sequence);
            }
        }
        ring.read_cursor = ring.next_sequence;
        drop(ring);

        self.space_freed.notify_waiters();
        abandoned
    }

    // =========================================================================
    // Session management
    // =========================================================================

    /// Empty every slot and restart numbering at zero.
    ///
    /// Only called between sessions, when neither side holds a reservation.
    pub fn reset(&self) {
        let mut ring = self.ring.lock();
        let policy = ring.policy;
        *ring = Ring::new(self.capacity, policy);
    }

    /// Status of the slot currently holding `sequence`, if it was not reused.
    pub fn slot_status(&self, sequence: u64) -> Option<SlotStatus> {
        let ring = self.ring.lock();
        if sequence >= ring.next_sequence {
            return None;
        }
        let slot = ring.slot(sequence);
        (slot.sequence == sequence).then_some(slot.status)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BufferStats {
        let ring = self.ring.lock();
        BufferStats {
            capacity: self.capacity,
            pending: ring.pending(),
            written: ring.written,
            saved: ring.saved,
            dropped: ring.dropped,
            errored: ring.errored,
            next_sequence: ring.next_sequence,
        }
    }
}

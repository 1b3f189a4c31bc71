// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capture buffer queue.
//!
//! Buffers cycle between the producer (user space, which queues empty buffers)
//! and the consumer (the capture pipeline, which fills them and returns them).
//! [`BufferQueue`] owns admission and sizing; the FIFO hand-off lists live in a
//! [`Transfer`] structure behind its own lock because the completion context
//! pops from them concurrently with control-context operations. That lock is
//! only ever held for single list operations.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::format::PixelFormat;
use crate::CaptureError;
use crate::CaptureResult;

/// Minimum pipelining depth. Allocation requests are clamped so the queue
/// never ends up with fewer buffers than this.
pub const MIN_QUEUED_BUFFERS: u32 = 3;

/// Why a buffer was handed back to the producer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DoneStatus {
    /// The buffer holds a captured frame.
    Captured,
    /// The stream was torn down, the contents are invalid.
    Aborted,
    /// Graceful return on a failed stream start. Not an error, the buffer is
    /// immediately reusable.
    Requeued,
}

/// Ownership of a single buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the producer.
    Free,
    /// Queued, waiting for the capture pipeline in FIFO order.
    QueuedWaiting,
    /// Currently being filled by the capture pipeline.
    QueuedInFlight,
    /// Returned by the consumer, waiting for the producer to dequeue it.
    Done(DoneStatus),
}

/// I/O path the wrapper layer exposes to user space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IoMode {
    /// Buffer-queue streaming I/O.
    #[default]
    Stream,
    /// Out-of-band byte-stream reads. Incompatible with single-field capture
    /// since a byte stream has no way to convey field boundaries.
    ByteStream,
}

/// Backing memory of one buffer. The allocator that produced it keeps
/// ownership semantics opaque to this crate.
pub trait BufferMemory: std::fmt::Debug + Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type MemoryHandle = Box<dyn BufferMemory>;

/// External allocator providing buffer backing memory.
pub trait BufferAllocator {
    fn allocate(&mut self, len: usize) -> anyhow::Result<MemoryHandle>;
}

/// Plain heap allocator, enough for software capture paths and tests.
#[derive(Debug, Default)]
pub struct HeapAllocator;

#[derive(Debug)]
struct HeapMemory(Vec<u8>);

impl BufferMemory for HeapMemory {
    fn len(&self) -> usize {
        self.0.len()
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&mut self, len: usize) -> anyhow::Result<MemoryHandle> {
        Ok(Box::new(HeapMemory(vec![0; len])))
    }
}

/// A capture buffer admitted into the queue.
#[derive(Debug)]
pub struct Buffer {
    pub index: u32,
    pub memory: MemoryHandle,
    /// Usable bytes in `memory`. Checked against the negotiated image size
    /// before every admission.
    pub payload_size: u32,
}

/// A buffer the consumer side finished with, ready to be dequeued.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Completed {
    pub index: u32,
    pub status: DoneStatus,
    /// Capture sequence number. Only present for [`DoneStatus::Captured`].
    pub sequence: Option<u32>,
}

/// State shared between the control context and the completion context. All
/// fields are index-based so no buffer memory is ever touched under this lock.
#[derive(Debug, Default)]
pub(crate) struct Transfer {
    pub(crate) states: Vec<BufferState>,
    pub(crate) waiting: VecDeque<u32>,
    pub(crate) in_flight: VecDeque<u32>,
    pub(crate) done: VecDeque<Completed>,
    pub(crate) sequence: u32,
    pub(crate) streaming: bool,
}

/// Admission, sizing and hand-off of capture buffers.
#[derive(Debug)]
pub struct BufferQueue {
    buffers: Vec<Buffer>,
    format: PixelFormat,
    io_mode: IoMode,
    transfer: Arc<Mutex<Transfer>>,
}

impl BufferQueue {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            buffers: Vec::new(),
            format,
            io_mode: IoMode::default(),
            transfer: Arc::new(Mutex::new(Transfer::default())),
        }
    }

    pub(crate) fn transfer(&self) -> Arc<Mutex<Transfer>> {
        Arc::clone(&self.transfer)
    }

    /// Format snapshot buffers are sized against. The device only renegotiates
    /// while the queue is empty, so the format is immutable for the lifetime
    /// of an allocated queue.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub(crate) fn set_format(&mut self, format: PixelFormat) {
        debug_assert!(self.buffers.is_empty());
        self.format = format;
    }

    pub fn io_mode(&self) -> IoMode {
        self.io_mode
    }

    /// Selects the I/O path. Refused while buffers are admitted.
    pub fn set_io_mode(&mut self, io_mode: IoMode) -> CaptureResult<()> {
        if !self.buffers.is_empty() {
            return Err(CaptureError::Busy);
        }
        self.io_mode = io_mode;
        Ok(())
    }

    pub fn allocated_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    /// Buffers currently owned by the consumer side, waiting or in flight.
    pub fn queued_count(&self) -> u32 {
        let transfer = self.transfer.lock().unwrap();
        (transfer.waiting.len() + transfer.in_flight.len()) as u32
    }

    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.transfer.lock().unwrap().states.get(index as usize).copied()
    }

    pub fn buffer(&self, index: u32) -> Option<&Buffer> {
        self.buffers.get(index as usize)
    }

    /// Computes how many buffers an allocation request for `requested` more
    /// buffers is granted: never so few that the total outstanding population
    /// drops below [`MIN_QUEUED_BUFFERS`].
    pub fn propose_allocation(&self, requested: u32) -> CaptureResult<u32> {
        if self.format.image_size == 0 {
            return Err(CaptureError::InvalidState);
        }
        // Single-field capture cannot be mixed with the byte-stream read path.
        if self.format.field.is_alternate() && self.io_mode == IoMode::ByteStream {
            return Err(CaptureError::InvalidState);
        }

        let floor = MIN_QUEUED_BUFFERS.saturating_sub(self.allocated_count());
        Ok(requested.max(floor))
    }

    /// Fails with [`CaptureError::BufferTooSmall`] unless `candidate` bytes can
    /// hold one negotiated frame.
    pub fn validate_size(&self, candidate: u32) -> CaptureResult<()> {
        if candidate < self.format.image_size {
            return Err(CaptureError::BufferTooSmall {
                required: self.format.image_size,
                got: candidate,
            });
        }
        Ok(())
    }

    /// The pool may only be touched while no session is running and no buffer
    /// is owned by the consumer side; the engine keeps using its completion
    /// handle for the whole session, even across moments where every queued
    /// buffer happens to be completed.
    fn check_pool_idle(&self) -> CaptureResult<()> {
        let transfer = self.transfer.lock().unwrap();
        if transfer.streaming || !transfer.waiting.is_empty() || !transfer.in_flight.is_empty() {
            return Err(CaptureError::Busy);
        }
        Ok(())
    }

    /// Replaces the buffer population with `requested` (clamped) freshly
    /// allocated buffers. On allocator failure every handle acquired so far is
    /// released again, newest first, before the error is surfaced.
    pub fn allocate_buffers(
        &mut self,
        requested: u32,
        allocator: &mut dyn BufferAllocator,
    ) -> CaptureResult<u32> {
        self.check_pool_idle()?;

        self.buffers.clear();
        {
            let mut transfer = self.transfer.lock().unwrap();
            transfer.states.clear();
            transfer.done.clear();
        }

        let count = self.propose_allocation(requested)?;
        let len = self.format.image_size;

        let mut handles = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match allocator.allocate(len as usize) {
                Ok(handle) if (handle.len() as u32) >= len => handles.push(handle),
                Ok(_) => {
                    // Unwind newest-first before surfacing the failure.
                    while handles.pop().is_some() {}
                    return Err(CaptureError::AllocationFailed(anyhow::anyhow!(
                        "allocator returned a buffer shorter than {} bytes",
                        len
                    )));
                }
                Err(e) => {
                    while handles.pop().is_some() {}
                    return Err(CaptureError::AllocationFailed(e));
                }
            }
        }

        for (index, memory) in handles.into_iter().enumerate() {
            self.buffers.push(Buffer { index: index as u32, memory, payload_size: len });
        }

        self.transfer.lock().unwrap().states.resize(count as usize, BufferState::Free);

        log::debug!("allocated {} capture buffers of {} bytes", count, len);
        Ok(count)
    }

    /// Drops every buffer and its memory handle. Refused while a session is
    /// running or any buffer is still queued.
    pub fn release_buffers(&mut self) -> CaptureResult<()> {
        self.check_pool_idle()?;
        self.buffers.clear();
        let mut transfer = self.transfer.lock().unwrap();
        transfer.states.clear();
        transfer.done.clear();
        Ok(())
    }

    /// Hands buffer `index` to the consumer side: Free -> QueuedWaiting, FIFO
    /// append. Insertion order defines fill order.
    pub fn enqueue(&mut self, index: u32) -> CaptureResult<()> {
        let buffer = self.buffers.get(index as usize).ok_or(CaptureError::InvalidState)?;
        self.validate_size(buffer.payload_size)?;

        let mut transfer = self.transfer.lock().unwrap();
        match transfer.states[index as usize] {
            BufferState::Free | BufferState::Done(_) => (),
            // Already owned by the consumer side.
            BufferState::QueuedWaiting | BufferState::QueuedInFlight => {
                return Err(CaptureError::InvalidState)
            }
        }
        transfer.states[index as usize] = BufferState::QueuedWaiting;
        transfer.waiting.push_back(index);
        Ok(())
    }

    /// Takes every waiting and in-flight buffer away from the consumer side.
    ///
    /// [`DoneStatus::Requeued`] returns buffers straight to [`BufferState::Free`]
    /// so a failed stream start can be retried; any other status parks them in
    /// the done list for the producer to reap. The transfer lock is reacquired
    /// per buffer so the completion context is never starved.
    pub fn drain(&mut self, status: DoneStatus) {
        let mut drained = 0u32;
        loop {
            let mut transfer = self.transfer.lock().unwrap();
            let index = match transfer.waiting.pop_front() {
                Some(index) => index,
                None => match transfer.in_flight.pop_front() {
                    Some(index) => index,
                    None => break,
                },
            };
            if status == DoneStatus::Requeued {
                transfer.states[index as usize] = BufferState::Free;
            } else {
                transfer.states[index as usize] = BufferState::Done(status);
                transfer.done.push_back(Completed { index, status, sequence: None });
            }
            drained += 1;
        }
        if drained > 0 {
            log::debug!("drained {} buffers with status {:?}", drained, status);
        }
    }

    /// Reaps the oldest finished buffer, returning it to producer ownership.
    pub fn dequeue_done(&mut self) -> Option<Completed> {
        let mut transfer = self.transfer.lock().unwrap();
        let completed = transfer.done.pop_front()?;
        transfer.states[completed.index as usize] = BufferState::Free;
        Some(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::negotiate;
    use crate::format::DvTimings;
    use crate::format::VideoInput;
    use crate::format::VideoStandard;

    fn sd_queue() -> BufferQueue {
        BufferQueue::new(negotiate(
            VideoInput::Composite,
            VideoStandard::default(),
            DvTimings::default(),
        ))
    }

    fn filled_queue(count: u32) -> BufferQueue {
        let mut queue = sd_queue();
        queue.allocate_buffers(count, &mut HeapAllocator).unwrap();
        queue
    }

    #[test]
    fn proposal_enforces_minimum_depth() {
        let queue = sd_queue();
        assert_eq!(queue.propose_allocation(1).unwrap(), 3);
        assert_eq!(queue.propose_allocation(3).unwrap(), 3);
        assert_eq!(queue.propose_allocation(8).unwrap(), 8);
    }

    #[test]
    fn proposal_counts_existing_buffers() {
        let queue = filled_queue(3);
        assert_eq!(queue.propose_allocation(1).unwrap(), 1);
    }

    #[test]
    fn proposal_requires_negotiated_format() {
        let queue = BufferQueue::new(PixelFormat::default());
        assert!(matches!(queue.propose_allocation(4), Err(CaptureError::InvalidState)));
    }

    #[test]
    fn proposal_rejects_alternate_field_bytestream() {
        let interlaced = DvTimings { width: 1280, height: 720, interlaced: true };
        let mut queue =
            BufferQueue::new(negotiate(VideoInput::Hdmi, VideoStandard::default(), interlaced));
        queue.set_io_mode(IoMode::ByteStream).unwrap();
        assert!(matches!(queue.propose_allocation(4), Err(CaptureError::InvalidState)));

        queue.set_io_mode(IoMode::Stream).unwrap();
        assert_eq!(queue.propose_allocation(4).unwrap(), 4);
    }

    #[test]
    fn size_validation() {
        let queue = sd_queue();
        let image_size = queue.format().image_size;
        assert!(queue.validate_size(image_size).is_ok());
        assert!(queue.validate_size(image_size + 64).is_ok());
        assert!(matches!(
            queue.validate_size(image_size - 1),
            Err(CaptureError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn enqueue_is_fifo() {
        let mut queue = filled_queue(3);
        for index in [2, 0, 1] {
            queue.enqueue(index).unwrap();
            assert_eq!(queue.state(index), Some(BufferState::QueuedWaiting));
        }

        let transfer = queue.transfer();
        let order: Vec<u32> = transfer.lock().unwrap().waiting.iter().copied().collect();
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn double_enqueue_is_rejected() {
        let mut queue = filled_queue(3);
        queue.enqueue(0).unwrap();
        assert!(matches!(queue.enqueue(0), Err(CaptureError::InvalidState)));
    }

    #[test]
    fn abort_drain_parks_buffers_in_done_list() {
        let mut queue = filled_queue(3);
        for index in 0..3 {
            queue.enqueue(index).unwrap();
        }

        queue.drain(DoneStatus::Aborted);

        assert_eq!(queue.queued_count(), 0);
        for index in 0..3 {
            assert_eq!(queue.state(index), Some(BufferState::Done(DoneStatus::Aborted)));
        }
        for _ in 0..3 {
            let completed = queue.dequeue_done().unwrap();
            assert_eq!(completed.status, DoneStatus::Aborted);
            assert_eq!(completed.sequence, None);
        }
        assert!(queue.dequeue_done().is_none());
    }

    #[test]
    fn requeue_drain_frees_buffers_for_retry() {
        let mut queue = filled_queue(3);
        queue.enqueue(1).unwrap();

        queue.drain(DoneStatus::Requeued);

        assert_eq!(queue.queued_count(), 0);
        assert_eq!(queue.state(1), Some(BufferState::Free));
        assert!(queue.dequeue_done().is_none());
        // Retry works.
        queue.enqueue(1).unwrap();
    }

    #[test]
    fn reconfiguration_refused_while_queued() {
        let mut queue = filled_queue(3);
        queue.enqueue(0).unwrap();

        assert!(matches!(
            queue.allocate_buffers(4, &mut HeapAllocator),
            Err(CaptureError::Busy)
        ));
        assert!(matches!(queue.release_buffers(), Err(CaptureError::Busy)));
        assert!(matches!(queue.set_io_mode(IoMode::ByteStream), Err(CaptureError::Busy)));

        queue.drain(DoneStatus::Requeued);
        queue.release_buffers().unwrap();
        assert_eq!(queue.allocated_count(), 0);
    }

    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    /// Allocator that fails after a fixed number of successes and counts live
    /// handles so the unwind can be observed.
    struct FlakyAllocator {
        successes_left: u32,
        live: Arc<AtomicU32>,
    }

    #[derive(Debug)]
    struct CountedMemory {
        len: usize,
        live: Arc<AtomicU32>,
    }

    impl BufferMemory for CountedMemory {
        fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for CountedMemory {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl BufferAllocator for FlakyAllocator {
        fn allocate(&mut self, len: usize) -> anyhow::Result<MemoryHandle> {
            if self.successes_left == 0 {
                anyhow::bail!("out of contiguous memory");
            }
            self.successes_left -= 1;
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountedMemory { len, live: Arc::clone(&self.live) }))
        }
    }

    #[test]
    fn failed_allocation_unwinds_acquired_handles() {
        let live = Arc::new(AtomicU32::new(0));
        let mut allocator = FlakyAllocator { successes_left: 2, live: Arc::clone(&live) };

        let mut queue = sd_queue();
        let result = queue.allocate_buffers(4, &mut allocator);

        assert!(matches!(result, Err(CaptureError::AllocationFailed(_))));
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(queue.allocated_count(), 0);
    }
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Streaming state machine.
//!
//! [`StreamController`] owns the Idle/Streaming transition and orchestrates the
//! queue drains around it. The capture engine itself is out of scope; a
//! [`CompletionHandle`] is handed to it instead, through which it reports
//! filled frames from its own execution context.

use std::sync::Arc;
use std::sync::Mutex;

use crate::queue::BufferQueue;
use crate::queue::BufferState;
use crate::queue::Completed;
use crate::queue::DoneStatus;
use crate::queue::Transfer;
use crate::CaptureError;
use crate::CaptureResult;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
}

/// Start/stop orchestration of a capture session.
#[derive(Debug)]
pub struct StreamController {
    state: StreamState,
    transfer: Arc<Mutex<Transfer>>,
}

impl StreamController {
    pub fn new(queue: &BufferQueue) -> Self {
        Self { state: StreamState::Idle, transfer: queue.transfer() }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Starts a streaming session.
    ///
    /// Requires at least `min_needed` buffers queued. Any failure past the
    /// re-entrancy check drains the queued buffers back to free so the caller
    /// can fix up and retry; the re-entrancy check itself must not touch the
    /// queue since it belongs to the already running session.
    pub fn start(&mut self, queue: &mut BufferQueue, min_needed: u32) -> CaptureResult<()> {
        if self.state == StreamState::Streaming {
            return Err(CaptureError::AlreadyStreaming);
        }

        let queued = queue.queued_count();
        if queued < min_needed {
            queue.drain(DoneStatus::Requeued);
            return Err(CaptureError::InsufficientBuffers { needed: min_needed, queued });
        }

        {
            let mut transfer = self.transfer.lock().unwrap();
            transfer.sequence = 0;
            transfer.streaming = true;
        }
        self.state = StreamState::Streaming;
        log::info!("stream started with {} buffers queued", queued);
        Ok(())
    }

    /// Stops the session and aborts every queued and in-flight buffer.
    ///
    /// Unconditional: this is the recovery path for fatal device errors as
    /// well as the regular stop, and calling it while idle is a no-op.
    pub fn stop(&mut self, queue: &mut BufferQueue) {
        if self.state == StreamState::Idle {
            return;
        }

        self.transfer.lock().unwrap().streaming = false;
        queue.drain(DoneStatus::Aborted);
        self.state = StreamState::Idle;
        log::info!("stream stopped");
    }

    /// Handle for the capture engine to report completed frames through.
    pub fn completion_handle(&self) -> CompletionHandle {
        CompletionHandle { transfer: Arc::clone(&self.transfer) }
    }
}

/// Consumer-side endpoint of the buffer hand-off.
///
/// Clonable and `Send`; the engine may call it concurrently with control
/// operations. Every method takes the transfer lock for a handful of list
/// operations and never blocks beyond that.
#[derive(Clone, Debug)]
pub struct CompletionHandle {
    transfer: Arc<Mutex<Transfer>>,
}

impl CompletionHandle {
    /// Claims the oldest waiting buffer for filling.
    ///
    /// An empty wait list is a frame drop, reported as
    /// [`CaptureError::NoBufferAvailable`]; the session stays intact.
    pub fn begin_frame(&self) -> CaptureResult<u32> {
        let mut transfer = self.transfer.lock().unwrap();
        if !transfer.streaming {
            return Err(CaptureError::InvalidState);
        }
        let Some(index) = transfer.waiting.pop_front() else {
            log::warn!("no buffer queued, dropping frame");
            return Err(CaptureError::NoBufferAvailable);
        };
        transfer.states[index as usize] = BufferState::QueuedInFlight;
        transfer.in_flight.push_back(index);
        Ok(index)
    }

    /// Returns the oldest in-flight buffer as a captured frame, stamping it
    /// with the next sequence number.
    pub fn finish_frame(&self, index: u32) -> CaptureResult<Completed> {
        let mut transfer = self.transfer.lock().unwrap();
        if !transfer.streaming {
            return Err(CaptureError::InvalidState);
        }
        // Fill order is FIFO, so out-of-order completion is an engine bug.
        if transfer.in_flight.front() != Some(&index) {
            return Err(CaptureError::InvalidState);
        }
        transfer.in_flight.pop_front();

        let sequence = transfer.sequence;
        // Long sessions may exhaust the counter; frame numbering just wraps.
        transfer.sequence = transfer.sequence.wrapping_add(1);
        transfer.states[index as usize] = BufferState::Done(DoneStatus::Captured);
        let completed =
            Completed { index, status: DoneStatus::Captured, sequence: Some(sequence) };
        transfer.done.push_back(completed);
        log::debug!("frame {} captured into buffer {}", sequence, index);
        Ok(completed)
    }

    /// Single-shot hand-off: claim the oldest waiting buffer and immediately
    /// return it filled.
    pub fn complete_frame(&self) -> CaptureResult<Completed> {
        let index = self.begin_frame()?;
        self.finish_frame(index)
    }
}

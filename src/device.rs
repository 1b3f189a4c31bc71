// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device aggregation.
//!
//! [`CaptureDevice`] ties the negotiator, the buffer queue and the stream
//! controller together and enforces the cross-cutting rules: the format is a
//! pure function of the input selection, and nothing about the selection may
//! change while buffers are admitted. One instance exists per hardware unit,
//! exclusively owned by the driver-registration shell; that exclusive
//! ownership is what serializes the control context.

use crate::controls::ControlId;
use crate::controls::ControlRange;
use crate::controls::Controls;
use crate::format;
use crate::format::DvTimings;
use crate::format::PixelFormat;
use crate::format::VideoInput;
use crate::format::VideoStandard;
use crate::queue::BufferAllocator;
use crate::queue::BufferQueue;
use crate::queue::Completed;
use crate::queue::MIN_QUEUED_BUFFERS;
use crate::stream::CompletionHandle;
use crate::stream::StreamController;
use crate::stream::StreamState;
use crate::CaptureError;
use crate::CaptureResult;
use crate::Fourcc;

/// One capture endpoint: input/standard/timings selection, the negotiated
/// format, the buffer queue and the streaming session.
#[derive(Debug)]
pub struct CaptureDevice {
    input: VideoInput,
    standard: VideoStandard,
    timings: DvTimings,
    format: PixelFormat,
    controls: Controls,
    queue: BufferQueue,
    stream: StreamController,
}

impl Default for CaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice {
    /// Constructs the device in its attach-time default configuration:
    /// composite input, 625-line/50Hz standard, 720p timings.
    pub fn new() -> Self {
        let input = VideoInput::Composite;
        let standard = VideoStandard::default();
        let timings = DvTimings::default();
        let format = format::negotiate(input, standard, timings);
        let queue = BufferQueue::new(format);
        let stream = StreamController::new(&queue);
        log::info!("capture device attached, format {:?}", format);
        Self { input, standard, timings, format, controls: Controls::default(), queue, stream }
    }

    /// Detach-time teardown. Only valid once streaming has been stopped;
    /// releases every buffer memory handle.
    pub fn detach(&mut self) -> CaptureResult<()> {
        if self.stream.state() == StreamState::Streaming {
            return Err(CaptureError::InvalidState);
        }
        self.queue.release_buffers()?;
        log::info!("capture device detached");
        Ok(())
    }

    fn check_unconfigurable(&self) -> CaptureResult<()> {
        // The negotiated format is frozen as long as buffers sized against it
        // exist.
        if self.queue.allocated_count() > 0 {
            return Err(CaptureError::Busy);
        }
        Ok(())
    }

    fn renegotiate(&mut self) {
        self.format = format::negotiate(self.input, self.standard, self.timings);
        self.queue.set_format(self.format);
        log::debug!("format renegotiated to {:?}", self.format);
    }

    pub fn input(&self) -> VideoInput {
        self.input
    }

    pub fn set_input(&mut self, input: VideoInput) -> CaptureResult<()> {
        self.check_unconfigurable()?;
        self.input = input;
        self.renegotiate();
        Ok(())
    }

    pub fn standard(&self) -> VideoStandard {
        self.standard
    }

    /// Selects the analog broadcast standard. Only meaningful on the
    /// composite input.
    pub fn set_standard(&mut self, standard: VideoStandard) -> CaptureResult<()> {
        if self.input != VideoInput::Composite {
            return Err(CaptureError::NotApplicable);
        }
        if standard == self.standard {
            return Ok(());
        }
        self.check_unconfigurable()?;
        self.standard = standard;
        self.renegotiate();
        Ok(())
    }

    pub fn dv_timings(&self) -> DvTimings {
        self.timings
    }

    /// Selects the digital video timings. Only meaningful on the HDMI input.
    pub fn set_dv_timings(&mut self, timings: DvTimings) -> CaptureResult<()> {
        if self.input != VideoInput::Hdmi {
            return Err(CaptureError::NotApplicable);
        }
        if !timings.supported() {
            return Err(CaptureError::InvalidTimings);
        }
        if timings == self.timings {
            return Ok(());
        }
        self.check_unconfigurable()?;
        self.timings = timings;
        self.renegotiate();
        Ok(())
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Applies a format request. The geometry of `requested` is advisory
    /// only: the device captures whatever the selected input produces, so the
    /// negotiated format is returned regardless. Only the pixel encoding is
    /// binding, and only one is supported.
    pub fn set_format(&mut self, requested: &PixelFormat) -> CaptureResult<PixelFormat> {
        if requested.fourcc != Fourcc::YUYV {
            return Err(CaptureError::UnsupportedEncoding);
        }
        self.check_unconfigurable()?;
        self.renegotiate();
        Ok(self.format)
    }

    /// Same negotiation as [`set_format`](Self::set_format) without any state
    /// change, usable at any time.
    pub fn try_format(&self, requested: &PixelFormat) -> CaptureResult<PixelFormat> {
        if requested.fourcc != Fourcc::YUYV {
            return Err(CaptureError::UnsupportedEncoding);
        }
        Ok(format::negotiate(self.input, self.standard, self.timings))
    }

    /// Validates and stores a control value addressed by raw id.
    pub fn apply_control(&mut self, id: u32, value: i32) -> CaptureResult<()> {
        let id = ControlId::from_raw(id).ok_or(CaptureError::UnknownControl)?;
        self.controls.apply(id, value)
    }

    pub fn control(&self, id: u32) -> CaptureResult<i32> {
        let id = ControlId::from_raw(id).ok_or(CaptureError::UnknownControl)?;
        Ok(self.controls.get(id))
    }

    pub fn query_control(&self, id: u32) -> CaptureResult<ControlRange> {
        let id = ControlId::from_raw(id).ok_or(CaptureError::UnknownControl)?;
        Ok(id.range())
    }

    /// The `queue_setup`/`REQBUFS` entry point: allocates `requested`
    /// (clamped) buffers through the external allocator.
    pub fn request_buffers(
        &mut self,
        requested: u32,
        allocator: &mut dyn BufferAllocator,
    ) -> CaptureResult<u32> {
        self.queue.allocate_buffers(requested, allocator)
    }

    /// The `buf_prepare` entry point.
    pub fn prepare_buffer(&self, candidate_size: u32) -> CaptureResult<()> {
        self.queue.validate_size(candidate_size)
    }

    /// The `buf_queue` entry point.
    pub fn queue_buffer(&mut self, index: u32) -> CaptureResult<()> {
        self.queue.enqueue(index)
    }

    /// Reaps the oldest buffer the consumer side finished with.
    pub fn dequeue_buffer(&mut self) -> Option<Completed> {
        self.queue.dequeue_done()
    }

    /// The `start_streaming` entry point.
    pub fn start_streaming(&mut self) -> CaptureResult<()> {
        self.stream.start(&mut self.queue, MIN_QUEUED_BUFFERS)
    }

    /// The `stop_streaming` entry point. Never fails.
    pub fn stop_streaming(&mut self) {
        self.stream.stop(&mut self.queue)
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    /// Handle the capture engine reports completed frames through.
    pub fn completion_handle(&self) -> CompletionHandle {
        self.stream.completion_handle()
    }

    pub fn buffer_queue(&self) -> &BufferQueue {
        &self.queue
    }

    pub fn buffer_queue_mut(&mut self) -> &mut BufferQueue {
        &mut self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BufferState;
    use crate::queue::DoneStatus;
    use crate::queue::HeapAllocator;
    use crate::Resolution;
    use nix::errno::Errno;

    fn device_with_buffers() -> CaptureDevice {
        let mut device = CaptureDevice::new();
        device.request_buffers(3, &mut HeapAllocator).unwrap();
        device
    }

    #[test]
    fn attach_defaults() {
        let device = CaptureDevice::new();
        assert_eq!(device.input(), VideoInput::Composite);
        assert_eq!(device.standard(), VideoStandard::STD_625_50);
        assert_eq!(device.format().size, Resolution::new(720, 576));
    }

    #[test]
    fn input_round_trip() {
        let mut device = CaptureDevice::new();
        for input in [VideoInput::Hdmi, VideoInput::Composite] {
            device.set_input(input).unwrap();
            assert_eq!(device.input(), input);
        }
    }

    #[test]
    fn input_switch_renegotiates_format() {
        let mut device = CaptureDevice::new();
        device.set_input(VideoInput::Hdmi).unwrap();
        assert_eq!(device.format().size, Resolution::new(1280, 720));

        device.set_input(VideoInput::Composite).unwrap();
        assert_eq!(device.format().size, Resolution::new(720, 576));
    }

    #[test]
    fn setters_fail_busy_while_buffers_admitted() {
        let mut device = device_with_buffers();

        assert!(matches!(device.set_input(VideoInput::Hdmi), Err(CaptureError::Busy)));
        assert!(matches!(
            device.set_standard(VideoStandard::NTSC),
            Err(CaptureError::Busy)
        ));
        let requested = device.format();
        assert!(matches!(device.set_format(&requested), Err(CaptureError::Busy)));

        device.buffer_queue_mut().release_buffers().unwrap();
        device.set_standard(VideoStandard::NTSC).unwrap();
        assert_eq!(device.format().size, Resolution::new(720, 480));
        device.set_input(VideoInput::Hdmi).unwrap();
        assert!(matches!(
            device.set_dv_timings(DvTimings { width: 1920, height: 1080, interlaced: false }),
            Ok(())
        ));
    }

    #[test]
    fn timings_setter_busy_only_when_changing() {
        let mut device = CaptureDevice::new();
        device.set_input(VideoInput::Hdmi).unwrap();
        device.request_buffers(3, &mut HeapAllocator).unwrap();

        // Unchanged selection is a no-op even with buffers admitted.
        device.set_dv_timings(DvTimings::default()).unwrap();

        assert!(matches!(
            device.set_dv_timings(DvTimings { width: 1920, height: 1080, interlaced: false }),
            Err(CaptureError::Busy)
        ));
    }

    #[test]
    fn standard_and_timings_track_their_input() {
        let mut device = CaptureDevice::new();
        assert!(matches!(
            device.set_dv_timings(DvTimings::default()),
            Err(CaptureError::NotApplicable)
        ));

        device.set_input(VideoInput::Hdmi).unwrap();
        assert!(matches!(
            device.set_standard(VideoStandard::NTSC),
            Err(CaptureError::NotApplicable)
        ));
        assert!(matches!(
            device.set_dv_timings(DvTimings { width: 100, height: 100, interlaced: false }),
            Err(CaptureError::InvalidTimings)
        ));
    }

    #[test]
    fn format_geometry_is_advisory() {
        let mut device = CaptureDevice::new();
        let mut requested = device.format();
        requested.size = Resolution::new(4096, 4096);

        let applied = device.set_format(&requested).unwrap();
        assert_eq!(applied.size, Resolution::new(720, 576));
        assert_eq!(applied, device.format());
    }

    #[test]
    fn format_rejects_foreign_encoding() {
        let mut device = CaptureDevice::new();
        let mut requested = device.format();
        requested.fourcc = Fourcc::from_bytes(b"NV12");

        assert!(matches!(
            device.set_format(&requested),
            Err(CaptureError::UnsupportedEncoding)
        ));
        assert!(matches!(
            device.try_format(&requested),
            Err(CaptureError::UnsupportedEncoding)
        ));
    }

    #[test]
    fn try_format_never_blocks_on_admitted_buffers() {
        let device = device_with_buffers();
        let negotiated = device.try_format(&device.format()).unwrap();
        assert_eq!(negotiated, device.format());
    }

    #[test]
    fn streaming_session_end_to_end() {
        let mut device = device_with_buffers();
        for index in 0..3 {
            let size = device.buffer_queue().buffer(index).unwrap().payload_size;
            device.prepare_buffer(size).unwrap();
            device.queue_buffer(index).unwrap();
        }

        device.start_streaming().unwrap();
        assert_eq!(device.stream_state(), StreamState::Streaming);

        let engine = device.completion_handle();
        let completed = engine.complete_frame().unwrap();
        assert_eq!(completed.sequence, Some(0));
        assert_eq!(device.dequeue_buffer().unwrap().index, completed.index);

        device.stop_streaming();
        assert_eq!(device.stream_state(), StreamState::Idle);
        while let Some(completed) = device.dequeue_buffer() {
            assert_eq!(completed.status, DoneStatus::Aborted);
        }
    }

    #[test]
    fn start_without_enough_buffers_is_retry_safe() {
        let mut device = device_with_buffers();
        device.queue_buffer(0).unwrap();

        let err = device.start_streaming().unwrap_err();
        assert_eq!(err.errno(), Errno::ENOBUFS);
        assert_eq!(device.buffer_queue().state(0), Some(BufferState::Free));
        assert_eq!(device.stream_state(), StreamState::Idle);
    }

    #[test]
    fn detach_requires_stopped_stream() {
        let mut device = device_with_buffers();
        for index in 0..3 {
            device.queue_buffer(index).unwrap();
        }
        device.start_streaming().unwrap();

        assert!(matches!(device.detach(), Err(CaptureError::InvalidState)));

        device.stop_streaming();
        device.detach().unwrap();
        assert_eq!(device.buffer_queue().allocated_count(), 0);
    }

    #[test]
    fn controls_round_trip_by_raw_id() {
        let mut device = CaptureDevice::new();
        device.apply_control(0x0098_0900, 200).unwrap();
        assert_eq!(device.control(0x0098_0900).unwrap(), 200);

        let err = device.apply_control(0xdead_beef, 0).unwrap_err();
        assert!(matches!(err, CaptureError::UnknownControl));
        assert_eq!(err.errno(), Errno::EINVAL);

        let range = device.query_control(0x0098_0903).unwrap();
        assert_eq!((range.min, range.max), (-128, 127));
    }
}

//! Render stage: paces converted frames into the device buffer.
//!
//! The stage pops one frame at a time and feeds it to a [`RenderSink`]
//! without ever writing more than the free space the sink reports. When the
//! buffer is full it waits, bounded by the configured poll interval; the
//! CPAL sink wakes it earlier as the device callback frees room. On end of
//! stream the stage lets the buffered tail play out before stopping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::device::DeviceFormat;
use crate::error::PlayerError;
use crate::queue::BoundedQueue;
use crate::stage::{StageError, Step};
use crate::unit::{AudioFrame, StreamUnit};

/// Extra time allowed for the device to finish consuming buffered audio
/// after the last frame was written.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// One open render session on an output device.
///
/// The hardware buffer behind it is observable only through capacity,
/// padding (frames written but not yet consumed), bounded writes into the
/// free region, and a space-available wait.
pub trait RenderSink {
    fn format(&self) -> &DeviceFormat;

    /// Total buffer capacity in frames.
    fn buffer_frames(&self) -> usize;

    /// Frames currently queued for the device. Never exceeds
    /// [`buffer_frames`](Self::buffer_frames).
    fn padding(&self) -> Result<usize, PlayerError>;

    /// Append interleaved samples into the free region; returns frames
    /// accepted. Callers never offer more than `buffer_frames - padding`.
    fn write(&mut self, samples: &[f32]) -> Result<usize, PlayerError>;

    /// Wait until space is freed or `timeout` elapses. Returns `true` when
    /// the wait observed space becoming available.
    fn wait_space(&self, timeout: Duration) -> bool;

    /// Stop the session. Called once after the stream has drained; dropping
    /// the sink must release the device even when this was skipped.
    fn stop(&mut self);
}

/// Pops converted frames and writes them to the sink under flow control.
pub struct RenderStage {
    input: Arc<BoundedQueue<StreamUnit<AudioFrame>>>,
    sink: Box<dyn RenderSink>,
    token: CancelToken,
    poll: Duration,
}

impl RenderStage {
    pub fn new(
        input: Arc<BoundedQueue<StreamUnit<AudioFrame>>>,
        sink: Box<dyn RenderSink>,
        token: CancelToken,
        poll: Duration,
    ) -> Self {
        Self {
            input,
            sink,
            token,
            poll,
        }
    }

    pub fn step(&mut self) -> Result<Step, StageError> {
        match self.input.pop()? {
            StreamUnit::EndOfStream => {
                self.drain()?;
                self.sink.stop();
                Ok(Step::Done)
            }
            StreamUnit::Payload(frame) => {
                self.write_frame(&frame)?;
                Ok(Step::Continue)
            }
        }
    }

    /// Write one frame completely before returning.
    ///
    /// Each pass writes at most `buffer_frames - padding`; a full buffer
    /// parks the stage in a bounded wait instead of spinning.
    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), StageError> {
        let channels = frame.channels.max(1);
        let total = self.sink.buffer_frames();
        let mut offset = 0usize;
        let mut remaining = frame.frames();

        while remaining > 0 {
            if self.token.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            let padding = self.sink.padding().map_err(StageError::Fatal)?;
            let available = total.saturating_sub(padding);
            let to_write = available.min(remaining);

            if to_write == 0 {
                self.sink.wait_space(self.poll);
                continue;
            }

            let start = offset * channels;
            let end = start + to_write * channels;
            let accepted = self
                .sink
                .write(&frame.samples[start..end])
                .map_err(StageError::Fatal)?;
            offset += accepted;
            remaining -= accepted.min(remaining);
        }
        Ok(())
    }

    /// Let the device consume what is still buffered before stopping, so
    /// the tail of the track is audible. Bounded by the buffer depth plus a
    /// small grace.
    fn drain(&mut self) -> Result<(), StageError> {
        let rate = self.sink.format().rate.max(1);
        let buffered = Duration::from_secs_f64(self.sink.buffer_frames() as f64 / rate as f64);
        let deadline = Instant::now() + buffered + DRAIN_GRACE;

        loop {
            if self.token.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let padding = self.sink.padding().map_err(StageError::Fatal)?;
            if padding == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    padding_frames = padding,
                    "drain deadline reached with audio still buffered"
                );
                return Ok(());
            }
            self.sink.wait_space(self.poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SampleRepr;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Default)]
    struct MockState {
        padding: Cell<usize>,
        writes: RefCell<Vec<usize>>,
        waits: Cell<usize>,
        stopped: Cell<bool>,
    }

    struct MockSink {
        format: DeviceFormat,
        buffer_frames: usize,
        consume_per_wait: usize,
        state: Rc<MockState>,
    }

    impl MockSink {
        fn new(buffer_frames: usize, consume_per_wait: usize) -> (Self, Rc<MockState>) {
            let state = Rc::new(MockState::default());
            let sink = Self {
                format: DeviceFormat {
                    rate: 48_000,
                    channels: 2,
                    repr: SampleRepr::F32,
                },
                buffer_frames,
                consume_per_wait,
                state: state.clone(),
            };
            (sink, state)
        }
    }

    impl RenderSink for MockSink {
        fn format(&self) -> &DeviceFormat {
            &self.format
        }

        fn buffer_frames(&self) -> usize {
            self.buffer_frames
        }

        fn padding(&self) -> Result<usize, PlayerError> {
            Ok(self.state.padding.get())
        }

        fn write(&mut self, samples: &[f32]) -> Result<usize, PlayerError> {
            let frames = samples.len() / self.format.channels;
            let available = self.buffer_frames - self.state.padding.get();
            assert!(frames <= available, "write of {frames} exceeds available {available}");
            self.state.padding.set(self.state.padding.get() + frames);
            self.state.writes.borrow_mut().push(frames);
            Ok(frames)
        }

        fn wait_space(&self, _timeout: Duration) -> bool {
            self.state.waits.set(self.state.waits.get() + 1);
            let consumed = self.consume_per_wait.min(self.state.padding.get());
            self.state.padding.set(self.state.padding.get() - consumed);
            consumed > 0
        }

        fn stop(&mut self) {
            self.state.stopped.set(true);
        }
    }

    fn stage_with(
        sink: MockSink,
        token: &CancelToken,
    ) -> (RenderStage, Arc<BoundedQueue<StreamUnit<AudioFrame>>>) {
        let input = BoundedQueue::new(8, token);
        let stage = RenderStage::new(
            input.clone(),
            Box::new(sink),
            token.clone(),
            Duration::from_millis(1),
        );
        (stage, input)
    }

    fn stereo_frame(frames: usize) -> AudioFrame {
        AudioFrame {
            samples: vec![0.5; frames * 2],
            channels: 2,
            rate: 48_000,
        }
    }

    #[test]
    fn large_frame_is_written_in_buffer_sized_slices() {
        let token = CancelToken::new();
        let (sink, state) = MockSink::new(64, 64);
        let (mut stage, input) = stage_with(sink, &token);

        input.push(StreamUnit::Payload(stereo_frame(200))).unwrap();
        assert_eq!(stage.step().unwrap(), Step::Continue);

        let writes = state.writes.borrow();
        // 200 frames through a 64-frame buffer: at least ceil(200/64) writes.
        assert!(writes.len() >= 4, "got {writes:?}");
        assert_eq!(writes.iter().sum::<usize>(), 200);
        assert!(writes.iter().all(|&w| w <= 64));
        assert!(state.waits.get() >= 3, "full buffer must park the writer");
    }

    #[test]
    fn slow_consumer_forces_more_smaller_writes() {
        let token = CancelToken::new();
        let (sink, state) = MockSink::new(64, 16);
        let (mut stage, input) = stage_with(sink, &token);

        input.push(StreamUnit::Payload(stereo_frame(200))).unwrap();
        assert_eq!(stage.step().unwrap(), Step::Continue);

        let writes = state.writes.borrow();
        assert_eq!(writes.iter().sum::<usize>(), 200);
        assert!(writes.len() > 4);
        assert!(writes.iter().all(|&w| w <= 64));
    }

    #[test]
    fn small_frame_fits_in_one_write() {
        let token = CancelToken::new();
        let (sink, state) = MockSink::new(64, 64);
        let (mut stage, input) = stage_with(sink, &token);

        input.push(StreamUnit::Payload(stereo_frame(10))).unwrap();
        assert_eq!(stage.step().unwrap(), Step::Continue);

        assert_eq!(*state.writes.borrow(), vec![10]);
        assert_eq!(state.waits.get(), 0);
    }

    #[test]
    fn end_of_stream_drains_then_stops() {
        let token = CancelToken::new();
        let (sink, state) = MockSink::new(64, 16);
        state.padding.set(50);
        let (mut stage, input) = stage_with(sink, &token);

        input.push(StreamUnit::EndOfStream).unwrap();
        assert_eq!(stage.step().unwrap(), Step::Done);

        assert_eq!(state.padding.get(), 0, "buffered tail must play out");
        assert!(state.stopped.get());
    }

    #[test]
    fn cancellation_interrupts_a_full_buffer_wait() {
        let token = CancelToken::new();
        // Consumer never frees space, so the writer would wait forever.
        let (sink, state) = MockSink::new(64, 0);
        state.padding.set(64);
        let (mut stage, input) = stage_with(sink, &token);

        input.push(StreamUnit::Payload(stereo_frame(10))).unwrap();
        token.cancel();

        // The queue pop itself reports the cancellation first.
        assert!(matches!(stage.step(), Err(StageError::Cancelled)));
    }

    #[test]
    fn cancellation_interrupts_mid_frame() {
        let token = CancelToken::new();
        // The first slice fills the buffer and nothing ever consumes it, so
        // the stage parks in bounded waits until the cancel lands.
        let (sink, state) = MockSink::new(64, 0);
        let (mut stage, input) = stage_with(sink, &token);
        input.push(StreamUnit::Payload(stereo_frame(100))).unwrap();

        let canceller = std::thread::spawn({
            let token = token.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                token.cancel();
            }
        });
        let result = stage.step();
        canceller.join().unwrap();

        assert!(matches!(result, Err(StageError::Cancelled)));
        assert_eq!(*state.writes.borrow(), vec![64]);
    }
}

//! CPAL-backed render sink.
//!
//! The sink owns a bounded sample ring sized to the configured buffer
//! duration. The render stage writes into the ring under flow control; the
//! CPAL output callback drains it, converting `f32` to the device sample
//! format and substituting silence (counted as underrun) when it runs dry.
//! Padding, in device terms, is exactly what sits in the ring: written but
//! not yet consumed.
//!
//! Opening the sink pre-rolls one full buffer of silence before starting
//! the stream, so the device never begins on an empty buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};

use crate::cancel::{CancelToken, Wake};
use crate::device::{self, DeviceFormat};
use crate::error::PlayerError;
use crate::render::RenderSink;

/// Playback counters shared with the supervisor for the final summary.
#[derive(Clone, Default)]
pub struct RenderCounters {
    /// Frames actually delivered to the device callback.
    pub played_frames: Arc<AtomicU64>,
    /// Frames of silence substituted because the ring ran dry.
    pub underrun_frames: Arc<AtomicU64>,
    /// Number of times the callback found the ring dry.
    pub underrun_events: Arc<AtomicU64>,
}

/// Bounded sample ring between the render stage and the device callback.
pub(crate) struct Ring {
    inner: Mutex<RingState>,
    space: Condvar,
    capacity_samples: usize,
    channels: usize,
    counters: RenderCounters,
}

struct RingState {
    queued: VecDeque<f32>,
    /// Set by the stream error callback; surfaces through `padding_frames`.
    fault: Option<String>,
}

impl Ring {
    fn new(channels: usize, capacity_frames: usize, counters: RenderCounters) -> Arc<Self> {
        let channels = channels.max(1);
        Arc::new(Self {
            inner: Mutex::new(RingState {
                queued: VecDeque::with_capacity(capacity_frames * channels),
                fault: None,
            }),
            space: Condvar::new(),
            capacity_samples: capacity_frames.max(1) * channels,
            channels,
            counters,
        })
    }

    fn capacity_frames(&self) -> usize {
        self.capacity_samples / self.channels
    }

    /// Frames written but not yet consumed by the device callback.
    ///
    /// Reports a stream fault instead, once the error callback has fired.
    fn padding_frames(&self) -> Result<usize, PlayerError> {
        let state = self.inner.lock().unwrap();
        if let Some(reason) = &state.fault {
            return Err(PlayerError::Device {
                op: "output stream",
                reason: reason.clone(),
            });
        }
        Ok(state.queued.len() / self.channels)
    }

    /// Append up to the free capacity; returns frames accepted.
    fn write_frames(&self, samples: &[f32]) -> usize {
        let mut state = self.inner.lock().unwrap();
        let free = self.capacity_samples - state.queued.len();
        let take = samples.len().min(free);
        state.queued.extend(samples[..take].iter().copied());
        take / self.channels
    }

    /// Fill the ring to capacity with silence. Used once, before the stream
    /// starts.
    fn preroll_silence(&self) {
        let mut state = self.inner.lock().unwrap();
        let fill = self.capacity_samples - state.queued.len();
        state.queued.extend(std::iter::repeat_n(0.0f32, fill));
    }

    /// Wait until the callback frees space, `timeout` elapses, or the ring
    /// is faulted. Returns `true` when space is available on return.
    fn wait_space(&self, timeout: Duration) -> bool {
        let state = self.inner.lock().unwrap();
        if state.fault.is_some() || state.queued.len() < self.capacity_samples {
            return true;
        }
        let (state, _timeout) = self.space.wait_timeout(state, timeout).unwrap();
        state.fault.is_some() || state.queued.len() < self.capacity_samples
    }

    /// Drain into a device buffer, converting to the stream sample type.
    ///
    /// Runs on the CPAL callback thread: one short lock, no waiting. A dry
    /// ring is padded with silence and counted as an underrun.
    fn consume_into<T>(&self, data: &mut [T])
    where
        T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
    {
        let mut state = self.inner.lock().unwrap();
        let take = state.queued.len().min(data.len());
        for slot in data[..take].iter_mut() {
            let s = state.queued.pop_front().unwrap_or(0.0);
            *slot = <T as cpal::Sample>::from_sample::<f32>(s);
        }
        drop(state);

        if take < data.len() {
            for slot in data[take..].iter_mut() {
                *slot = <T as cpal::Sample>::from_sample::<f32>(0.0);
            }
            self.counters
                .underrun_events
                .fetch_add(1, Ordering::Relaxed);
            self.counters
                .underrun_frames
                .fetch_add(((data.len() - take) / self.channels) as u64, Ordering::Relaxed);
        }
        if take > 0 {
            self.counters
                .played_frames
                .fetch_add((take / self.channels) as u64, Ordering::Relaxed);
        }

        self.space.notify_all();
    }

    /// Record a stream error and wake the writer so it notices.
    fn set_fault(&self, reason: String) {
        let mut state = self.inner.lock().unwrap();
        if state.fault.is_none() {
            state.fault = Some(reason);
        }
        drop(state);
        self.space.notify_all();
    }
}

impl Wake for Ring {
    fn wake(&self) {
        // Hold the lock so the cancel flag cannot be missed by a writer
        // between its check and its wait.
        let _state = self.inner.lock().unwrap();
        self.space.notify_all();
    }
}

/// Open render session on a CPAL output device.
pub struct CpalSink {
    // Declared first so the stream is torn down before the ring it drains.
    stream: cpal::Stream,
    ring: Arc<Ring>,
    format: DeviceFormat,
    buffer_frames: usize,
}

impl CpalSink {
    /// Acquire the device, verify the negotiated format still holds, build
    /// the ring and the output stream, pre-roll silence, and start.
    ///
    /// Called on the render worker thread; the CPAL stream stays on the
    /// thread that built it.
    pub fn open(
        selector: Option<&str>,
        expected: &DeviceFormat,
        buffer: Duration,
        token: &CancelToken,
        counters: RenderCounters,
    ) -> Result<Self, PlayerError> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, selector)?;

        let supported = device
            .default_output_config()
            .map_err(|e| PlayerError::device("Device::default_output_config", e))?;
        let sample_format = supported.sample_format();

        let actual = device::format_from_config(&supported)?;
        if actual != *expected {
            return Err(PlayerError::Device {
                op: "Device::default_output_config",
                reason: format!(
                    "device format changed since negotiation: expected {expected:?}, got {actual:?}"
                ),
            });
        }

        let buffer_frames = ((expected.rate as f64) * buffer.as_secs_f64()).ceil() as usize;
        let buffer_frames = buffer_frames.max(1);

        let ring = Ring::new(expected.channels, buffer_frames, counters);
        token.register(&ring);

        let config: cpal::StreamConfig = supported.into();
        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, &ring),
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, &ring),
            cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, &ring),
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, &ring),
            other => Err(PlayerError::UnsupportedMixFormat {
                format: format!("{other:?}"),
            }),
        }?;

        ring.preroll_silence();
        stream
            .play()
            .map_err(|e| PlayerError::device("Stream::play", e))?;

        tracing::info!(
            buffer_frames,
            rate_hz = expected.rate,
            channels = expected.channels,
            repr = %expected.repr,
            "render session open"
        );

        Ok(Self {
            stream,
            ring,
            format: expected.clone(),
            buffer_frames,
        })
    }
}

impl RenderSink for CpalSink {
    fn format(&self) -> &DeviceFormat {
        &self.format
    }

    fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    fn padding(&self) -> Result<usize, PlayerError> {
        self.ring.padding_frames()
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize, PlayerError> {
        Ok(self.ring.write_frames(samples))
    }

    fn wait_space(&self, timeout: Duration) -> bool {
        self.ring.wait_space(timeout)
    }

    fn stop(&mut self) {
        if let Err(e) = self.stream.pause() {
            tracing::debug!("stream pause on stop: {e}");
        }
        tracing::debug!("render session stopped");
    }
}

/// Type-specialized stream builder for CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: &Arc<Ring>,
) -> Result<cpal::Stream, PlayerError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let ring_cb = ring.clone();
    let ring_err = ring.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                ring_cb.consume_into(data);
            },
            move |err| {
                tracing::warn!("stream error: {err}");
                ring_err.set_fault(err.to_string());
            },
            None,
        )
        .map_err(|e| PlayerError::device("Device::build_output_stream", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ring_with_counters(channels: usize, capacity_frames: usize) -> (Arc<Ring>, RenderCounters) {
        let counters = RenderCounters::default();
        let ring = Ring::new(channels, capacity_frames, counters.clone());
        (ring, counters)
    }

    #[test]
    fn write_respects_capacity() {
        let (ring, _) = ring_with_counters(2, 8);
        let accepted = ring.write_frames(&vec![0.1; 10 * 2]);
        assert_eq!(accepted, 8);
        assert_eq!(ring.padding_frames().unwrap(), 8);
    }

    #[test]
    fn consume_pops_written_samples_in_order() {
        let (ring, counters) = ring_with_counters(2, 8);
        ring.write_frames(&[0.1, 0.2, 0.3, 0.4]);

        let mut out = [0.0f32; 4];
        ring.consume_into(&mut out);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(ring.padding_frames().unwrap(), 0);
        assert_eq!(counters.played_frames.load(Ordering::Relaxed), 2);
        assert_eq!(counters.underrun_events.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dry_ring_yields_silence_and_counts_underrun() {
        let (ring, counters) = ring_with_counters(2, 8);
        let mut out = [0.7f32; 6];
        ring.consume_into(&mut out);
        assert_eq!(out, [0.0; 6]);
        assert_eq!(counters.underrun_events.load(Ordering::Relaxed), 1);
        assert_eq!(counters.underrun_frames.load(Ordering::Relaxed), 3);
        assert_eq!(counters.played_frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn partial_consume_counts_the_shortfall() {
        let (ring, counters) = ring_with_counters(2, 8);
        ring.write_frames(&[0.5, 0.5, 0.5, 0.5]);

        let mut out = [0.9f32; 8];
        ring.consume_into(&mut out);
        assert_eq!(&out[..4], &[0.5; 4]);
        assert_eq!(&out[4..], &[0.0; 4]);
        assert_eq!(counters.played_frames.load(Ordering::Relaxed), 2);
        assert_eq!(counters.underrun_frames.load(Ordering::Relaxed), 2);
        assert_eq!(counters.underrun_events.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn preroll_fills_to_capacity() {
        let (ring, _) = ring_with_counters(2, 16);
        ring.preroll_silence();
        assert_eq!(ring.padding_frames().unwrap(), 16);
        assert_eq!(ring.capacity_frames(), 16);
    }

    #[test]
    fn conversion_to_integer_formats_keeps_sign() {
        let (ring, _) = ring_with_counters(1, 8);
        ring.write_frames(&[0.5, -0.5, 0.0]);

        let mut out = [0i16; 3];
        ring.consume_into(&mut out);
        assert!(out[0] > 0);
        assert!(out[1] < 0);
        assert_eq!(out[2], 0);
    }

    #[test]
    fn wait_space_returns_when_callback_frees_room() {
        let (ring, _) = ring_with_counters(1, 4);
        ring.preroll_silence();
        assert!(!ring.wait_space(Duration::from_millis(10)), "full ring, no consumer");

        let ring_cb = ring.clone();
        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut out = [0.0f32; 2];
            ring_cb.consume_into(&mut out);
        });

        assert!(ring.wait_space(Duration::from_millis(500)));
        consumer.join().unwrap();
    }

    #[test]
    fn fault_surfaces_through_padding() {
        let (ring, _) = ring_with_counters(2, 8);
        ring.set_fault("device disappeared".into());
        match ring.padding_frames() {
            Err(PlayerError::Device { op, reason }) => {
                assert_eq!(op, "output stream");
                assert!(reason.contains("disappeared"));
            }
            other => panic!("expected device error, got {other:?}"),
        }
        // A faulted ring must not park the writer.
        assert!(ring.wait_space(Duration::from_millis(1)));
    }
}

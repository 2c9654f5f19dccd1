//! Convert stage: decoded frames in, device-format frames out.
//!
//! Adapts channel layout first (so the resampler runs at the target channel
//! count), then converts the sample rate with Rubato's streaming sinc
//! resampler. Input frames arrive in whatever sizes the codec produced, so
//! the converter accumulates them into fixed input chunks and flushes the
//! remainder when the stream ends. Equal-rate sources bypass Rubato
//! entirely and conversion is exact.

use std::sync::Arc;

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::device::DeviceFormat;
use crate::error::PlayerError;
use crate::queue::BoundedQueue;
use crate::source::SourceInfo;
use crate::stage::{StageError, Step};
use crate::unit::{AudioFrame, StreamUnit};

/// Conservative output frame count for `input_frames` at a new rate.
///
/// Rounds up, so sizing a buffer with this never truncates a conversion.
pub fn estimated_output_frames(input_frames: usize, src_rate: u32, dst_rate: u32) -> usize {
    if src_rate == 0 {
        return input_frames;
    }
    ((input_frames as u64 * dst_rate as u64).div_ceil(src_rate as u64)) as usize
}

/// Remap interleaved samples to a different channel count.
///
/// Mapping rules:
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: best-effort clamp to available channels
fn map_channels(input: &[f32], src_channels: usize, dst_channels: usize) -> Vec<f32> {
    let frames = input.len() / src_channels;
    let mut out = Vec::with_capacity(frames * dst_channels);
    for frame in 0..frames {
        let base = frame * src_channels;
        match (src_channels, dst_channels) {
            (1, 2) => {
                let s = input[base];
                out.push(s);
                out.push(s);
            }
            (2, 1) => out.push(0.5 * (input[base] + input[base + 1])),
            _ => {
                for ch in 0..dst_channels {
                    out.push(input[base + ch.min(src_channels - 1)]);
                }
            }
        }
    }
    out
}

/// Converts decoded audio to the negotiated device format.
///
/// The target is fixed at construction from the [`DeviceFormat`]; a source
/// whose frames stop matching the probed format mid-stream is rejected
/// rather than silently renegotiated.
pub struct SampleConverter {
    src_rate: u32,
    src_channels: usize,
    dst_rate: u32,
    dst_channels: usize,
    chunk_frames: usize,
    /// `None` when source and device rates match.
    resampler: Option<Box<dyn Resampler<f32>>>,
    /// Channel-mapped samples waiting to fill the next input chunk.
    pending: Vec<f32>,
    out_interleaved: Vec<f32>,
}

impl SampleConverter {
    /// Build a converter from the probed source to the negotiated device
    /// format.
    ///
    /// Fails only when the resampler rejects the rate pair; that happens
    /// before any worker starts.
    pub fn new(
        src: &SourceInfo,
        target: &DeviceFormat,
        chunk_frames: usize,
    ) -> Result<Self, PlayerError> {
        let chunk_frames = chunk_frames.max(1);
        let src_rate = src.rate;
        let dst_rate = target.rate;
        let dst_channels = target.channels;

        // Every sample path below divides by a channel count.
        if src.channels == 0 || dst_channels == 0 {
            return Err(PlayerError::ConverterSetup {
                src_rate,
                src_channels: src.channels,
                dst_rate,
                dst_channels,
                reason: "zero channel count".into(),
            });
        }

        let resampler = if src_rate == dst_rate {
            tracing::debug!(rate_hz = src_rate, "sample rates match; resampler bypassed");
            None
        } else {
            let f_ratio = dst_rate as f64 / src_rate as f64;

            let sinc_len = 128;
            let window = WindowFunction::BlackmanHarris2;
            let params = SincInterpolationParameters {
                sinc_len,
                f_cutoff: calculate_cutoff(sinc_len, window),
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 256,
                window,
            };

            let resampler = Async::<f32>::new_sinc(
                f_ratio,
                1.1,
                &params,
                chunk_frames,
                dst_channels,
                FixedAsync::Input,
            )
            .map_err(|e| PlayerError::ConverterSetup {
                src_rate,
                src_channels: src.channels,
                dst_rate,
                dst_channels,
                reason: e.to_string(),
            })?;

            tracing::debug!(
                src_rate_hz = src_rate,
                dst_rate_hz = dst_rate,
                chunk_frames,
                "sinc resampler ready"
            );
            Some(Box::new(resampler) as Box<dyn Resampler<f32>>)
        };

        // Headroom for the rate ratio plus one chunk of flush padding.
        let out_cap_frames = estimated_output_frames(chunk_frames, src_rate, dst_rate) + chunk_frames;

        Ok(Self {
            src_rate,
            src_channels: src.channels,
            dst_rate,
            dst_channels,
            chunk_frames,
            resampler,
            pending: Vec::new(),
            out_interleaved: vec![0.0f32; dst_channels * out_cap_frames],
        })
    }

    pub fn target_rate(&self) -> u32 {
        self.dst_rate
    }

    pub fn target_channels(&self) -> usize {
        self.dst_channels
    }

    /// Convert one decoded frame into zero or more device-format frames.
    ///
    /// With the resampler engaged, output is produced one full input chunk
    /// at a time; anything shorter stays pending until more input (or the
    /// end-of-stream flush) arrives.
    pub fn convert(&mut self, frame: &AudioFrame) -> Result<Vec<AudioFrame>, PlayerError> {
        if frame.rate != self.src_rate || frame.channels != self.src_channels {
            return Err(PlayerError::Convert {
                reason: format!(
                    "source format changed mid-stream: {}ch @ {} Hz -> {}ch @ {} Hz",
                    self.src_channels, self.src_rate, frame.channels, frame.rate
                ),
            });
        }

        let mapped;
        let samples: &[f32] = if frame.channels == self.dst_channels {
            &frame.samples
        } else {
            mapped = map_channels(&frame.samples, frame.channels, self.dst_channels);
            &mapped
        };

        if self.resampler.is_none() {
            if samples.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![AudioFrame {
                samples: samples.to_vec(),
                channels: self.dst_channels,
                rate: self.dst_rate,
            }]);
        }

        self.pending.extend_from_slice(samples);

        let chunk_samples = self.chunk_frames * self.dst_channels;
        let mut out = Vec::new();
        while self.pending.len() >= chunk_samples {
            let produced = self.process_chunk(chunk_samples, None)?;
            self.pending.drain(..chunk_samples);
            if let Some(frame) = produced {
                out.push(frame);
            }
        }
        Ok(out)
    }

    /// Push the buffered tail through the resampler at end of stream.
    pub fn flush(&mut self) -> Result<Vec<AudioFrame>, PlayerError> {
        if self.resampler.is_none() || self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let tail_frames = self.pending.len() / self.dst_channels;
        let tail_samples = tail_frames * self.dst_channels;
        let produced = self.process_chunk(tail_samples, Some(tail_frames))?;
        self.pending.clear();
        Ok(produced.into_iter().collect())
    }

    /// Run one resampler call over `pending[..len]`.
    ///
    /// `partial_len` marks a short final chunk; the resampler pads it
    /// internally and drains its own delay line into the output.
    fn process_chunk(
        &mut self,
        len: usize,
        partial_len: Option<usize>,
    ) -> Result<Option<AudioFrame>, PlayerError> {
        let resampler = self.resampler.as_mut().expect("resampler engaged");

        let in_frames = len / self.dst_channels;
        let input_adapter = InterleavedSlice::new(&self.pending[..len], self.dst_channels, in_frames)
            .map_err(|e| PlayerError::Convert {
                reason: format!("interleaved input adapter: {e}"),
            })?;

        let out_capacity_frames = self.out_interleaved.len() / self.dst_channels;
        let mut output_adapter = InterleavedSlice::new_mut(
            &mut self.out_interleaved,
            self.dst_channels,
            out_capacity_frames,
        )
        .map_err(|e| PlayerError::Convert {
            reason: format!("interleaved output adapter: {e}"),
        })?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };

        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| PlayerError::Convert {
                reason: e.to_string(),
            })?;

        if nbr_out == 0 {
            return Ok(None);
        }

        let produced_samples = nbr_out * self.dst_channels;
        Ok(Some(AudioFrame {
            samples: self.out_interleaved[..produced_samples].to_vec(),
            channels: self.dst_channels,
            rate: self.dst_rate,
        }))
    }
}

/// Pops decoded frames, converts them, pushes device-format frames.
pub struct ConvertStage {
    input: Arc<BoundedQueue<StreamUnit<AudioFrame>>>,
    output: Arc<BoundedQueue<StreamUnit<AudioFrame>>>,
    converter: SampleConverter,
}

impl ConvertStage {
    pub fn new(
        input: Arc<BoundedQueue<StreamUnit<AudioFrame>>>,
        output: Arc<BoundedQueue<StreamUnit<AudioFrame>>>,
        converter: SampleConverter,
    ) -> Self {
        Self {
            input,
            output,
            converter,
        }
    }

    /// Output frame count need not match input count: short inputs
    /// accumulate (zero outputs), one input can span several chunks.
    pub fn step(&mut self) -> Result<Step, StageError> {
        match self.input.pop()? {
            StreamUnit::EndOfStream => {
                let tail = self.converter.flush().map_err(StageError::Fatal)?;
                for frame in tail {
                    self.output.push(StreamUnit::Payload(frame))?;
                }
                self.output.push(StreamUnit::EndOfStream)?;
                Ok(Step::Done)
            }
            StreamUnit::Payload(frame) => {
                let converted = self.converter.convert(&frame).map_err(StageError::Fatal)?;
                for frame in converted {
                    self.output.push(StreamUnit::Payload(frame))?;
                }
                Ok(Step::Continue)
            }
        }
    }
}

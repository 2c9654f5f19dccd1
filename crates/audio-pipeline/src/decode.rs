//! Decode stage: compressed packets in, interleaved `f32` frames out.
//!
//! Wraps Symphonia's codec registry. One undecodable packet is not the end
//! of the world; the stage reports it as recoverable and the worker loop
//! skips it, giving up only after several misses in a row.

use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;

use crate::error::PlayerError;
use crate::queue::BoundedQueue;
use crate::stage::{StageError, Step};
use crate::unit::{AudioFrame, AudioPacket, StreamUnit};

/// Turns one compressed packet into zero or more PCM frames.
///
/// Zero frames is legitimate (codec priming, metadata-only packets) and must
/// not be treated as end of stream.
pub trait PacketDecoder: Send {
    fn decode(&mut self, packet: AudioPacket) -> Result<Vec<AudioFrame>, PlayerError>;
}

/// Production decoder backed by Symphonia.
pub struct SymphoniaDecoder {
    decoder: Box<dyn Decoder>,
}

impl SymphoniaDecoder {
    /// Build a decoder for the probed track.
    ///
    /// An unsupported codec fails here, before any worker starts.
    pub fn new(codec_params: &CodecParameters) -> Result<Self, PlayerError> {
        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| PlayerError::Decode {
                reason: format!("unsupported codec: {e}"),
            })?;
        Ok(Self { decoder })
    }
}

impl PacketDecoder for SymphoniaDecoder {
    fn decode(&mut self, packet: AudioPacket) -> Result<Vec<AudioFrame>, PlayerError> {
        let packet = Packet::new_from_boxed_slice(packet.track_id, packet.ts, packet.dur, packet.data);

        let decoded = self
            .decoder
            .decode(&packet)
            .map_err(|e| PlayerError::Decode {
                reason: e.to_string(),
            })?;

        if decoded.frames() == 0 {
            return Ok(Vec::new());
        }

        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        Ok(vec![AudioFrame {
            samples: sample_buf.samples().to_vec(),
            channels: spec.channels.count(),
            rate: spec.rate,
        }])
    }
}

/// Pops packets, decodes them, pushes the resulting frames in order.
pub struct DecodeStage {
    input: Arc<BoundedQueue<StreamUnit<AudioPacket>>>,
    output: Arc<BoundedQueue<StreamUnit<AudioFrame>>>,
    decoder: Box<dyn PacketDecoder>,
}

impl DecodeStage {
    pub fn new(
        input: Arc<BoundedQueue<StreamUnit<AudioPacket>>>,
        output: Arc<BoundedQueue<StreamUnit<AudioFrame>>>,
        decoder: Box<dyn PacketDecoder>,
    ) -> Self {
        Self {
            input,
            output,
            decoder,
        }
    }

    pub fn step(&mut self) -> Result<Step, StageError> {
        match self.input.pop()? {
            StreamUnit::EndOfStream => {
                self.output.push(StreamUnit::EndOfStream)?;
                Ok(Step::Done)
            }
            StreamUnit::Payload(packet) => {
                let frames = self
                    .decoder
                    .decode(packet)
                    .map_err(StageError::Retryable)?;
                for frame in frames {
                    self.output.push(StreamUnit::Payload(frame))?;
                }
                Ok(Step::Continue)
            }
        }
    }
}

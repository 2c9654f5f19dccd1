//! Data units carried between pipeline stages.
//!
//! Stages hand each other [`StreamUnit`]s over bounded queues:
//! - reader → decoder: compressed [`AudioPacket`]s
//! - decoder → converter, converter → renderer: PCM [`AudioFrame`]s
//!
//! End of stream travels in-band: after its last payload a producing stage
//! pushes a single [`StreamUnit::EndOfStream`] and stops, so no payload ever
//! follows the marker on the same queue.

/// One queue unit: either a payload or the end-of-stream marker.
#[derive(Debug)]
pub enum StreamUnit<T> {
    Payload(T),
    EndOfStream,
}

/// A compressed, container-demultiplexed chunk of the source stream.
///
/// Carries the demuxer metadata needed to hand the bytes back to the codec.
/// `dur` is the packet duration in frames (best effort, may be zero).
#[derive(Debug)]
pub struct AudioPacket {
    pub track_id: u32,
    pub ts: u64,
    pub dur: u64,
    pub data: Box<[u8]>,
}

/// Decoded (or converted) PCM audio.
///
/// Samples are stored **interleaved**:
/// `frame0[ch0], frame0[ch1], ..., frame1[ch0], frame1[ch1], ...`
///
/// In-flight audio is always `f32`; the device sample format is applied at
/// the render sink.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub rate: u32,
}

impl AudioFrame {
    /// Number of sample-frames held (`samples.len() / channels`).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels
    }
}

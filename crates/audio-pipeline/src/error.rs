//! Error taxonomy for the playback pipeline.
//!
//! Configuration problems (unopenable input, unusable device, rejected
//! conversion) surface before any worker thread starts. Platform failures
//! carry the operation that failed plus a readable reason, so a log line is
//! enough to see where the device API gave up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("cannot open input {path}: {reason}")]
    OpenInput { path: String, reason: String },

    #[error("no usable audio track in {path}")]
    NoAudioTrack { path: String },

    #[error("no output device matched: {needle}")]
    NoMatchingDevice { needle: String },

    #[error("no default output device")]
    NoOutputDevice,

    #[error("unsupported device sample format: {format}")]
    UnsupportedMixFormat { format: String },

    #[error(
        "converter rejected {src_rate} Hz/{src_channels}ch -> {dst_rate} Hz/{dst_channels}ch: {reason}"
    )]
    ConverterSetup {
        src_rate: u32,
        src_channels: usize,
        dst_rate: u32,
        dst_channels: usize,
        reason: String,
    },

    /// A platform audio call failed. `op` names the call site.
    #[error("{op}: {reason}")]
    Device { op: &'static str, reason: String },

    /// The container handed back bytes the demuxer cannot parse.
    #[error("malformed stream: {reason}")]
    Demux { reason: String },

    #[error("decode: {reason}")]
    Decode { reason: String },

    #[error("convert: {reason}")]
    Convert { reason: String },

    /// A worker died without reporting an exit.
    #[error("{stage} stage panicked")]
    StagePanicked { stage: &'static str },
}

impl PlayerError {
    /// Shorthand for platform failures, keeping call sites one line.
    pub fn device(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Device {
            op,
            reason: err.to_string(),
        }
    }
}

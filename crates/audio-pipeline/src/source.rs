//! Reader stage: pulls compressed packets out of the container.
//!
//! Uses Symphonia to probe the input and demultiplex the default audio
//! track. The stage pushes one [`AudioPacket`] per step into the packet
//! queue and a single end-of-stream marker when the source is exhausted.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::codecs::CodecParameters;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::{
    formats::FormatOptions, formats::FormatReader, io::MediaSourceStream, meta::MetadataOptions,
    probe::Hint,
};

use crate::error::PlayerError;
use crate::queue::BoundedQueue;
use crate::stage::{StageError, Step};
use crate::unit::{AudioPacket, StreamUnit};

/// Where compressed packets come from.
///
/// `Ok(None)` signals a clean end of stream. Mock implementations drive the
/// pipeline in tests; [`FileSource`] is the production one.
pub trait PacketSource: Send {
    fn next_packet(&mut self) -> Result<Option<AudioPacket>, PlayerError>;
}

/// Metadata captured while probing the source, for converter setup and
/// startup logging.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    pub rate: u32,
    pub channels: usize,
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Track duration in milliseconds (best-effort).
    pub duration_ms: Option<u64>,
}

/// Demuxes one local file's default audio track.
pub struct FileSource {
    format: Box<dyn FormatReader>,
    track_id: u32,
    codec_params: CodecParameters,
    info: SourceInfo,
}

impl FileSource {
    /// Probe `path` and select its default audio track.
    ///
    /// Fails before anything else is set up when the file cannot be opened,
    /// the container cannot be probed, or the track lacks the parameters the
    /// rest of the pipeline needs.
    pub fn open(path: &Path) -> Result<Self, PlayerError> {
        let shown = path.display().to_string();
        let file = File::open(path).map_err(|e| PlayerError::OpenInput {
            path: shown.clone(),
            reason: e.to_string(),
        })?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| PlayerError::OpenInput {
                path: shown.clone(),
                reason: e.to_string(),
            })?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or(PlayerError::NoAudioTrack { path: shown.clone() })?;

        let channels = channel_count_from_params(&track.codec_params, &shown)?;

        let rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| PlayerError::OpenInput {
                path: shown.clone(),
                reason: "unknown sample rate".into(),
            })?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let info = SourceInfo {
            rate,
            channels,
            codec: codec_name_from_params(&codec_params),
            bit_depth: codec_params
                .bits_per_sample
                .or(codec_params.bits_per_coded_sample)
                .and_then(|v| u16::try_from(v).ok()),
            duration_ms: duration_ms_from_codec_params(&codec_params),
        };

        Ok(Self {
            format,
            track_id,
            codec_params,
            info,
        })
    }

    /// Codec parameters of the selected track, for decoder construction.
    pub fn codec_params(&self) -> CodecParameters {
        self.codec_params.clone()
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }
}

impl PacketSource for FileSource {
    fn next_packet(&mut self) -> Result<Option<AudioPacket>, PlayerError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                // Symphonia signals a clean end of stream this way.
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    return Err(PlayerError::Demux {
                        reason: "stream parameters changed mid-file".into(),
                    });
                }
                Err(e) => {
                    return Err(PlayerError::Demux {
                        reason: e.to_string(),
                    });
                }
            };

            // Other tracks (video, subtitles) are not ours to play.
            if packet.track_id() != self.track_id {
                continue;
            }

            return Ok(Some(AudioPacket {
                track_id: packet.track_id(),
                ts: packet.ts(),
                dur: packet.dur(),
                data: packet.data,
            }));
        }
    }
}

/// Reads packets from a [`PacketSource`] into the packet queue.
pub struct ReaderStage {
    source: Box<dyn PacketSource>,
    output: Arc<BoundedQueue<StreamUnit<AudioPacket>>>,
}

impl ReaderStage {
    pub fn new(
        source: Box<dyn PacketSource>,
        output: Arc<BoundedQueue<StreamUnit<AudioPacket>>>,
    ) -> Self {
        Self { source, output }
    }

    /// Pull one packet and forward it; emit the marker once at end of
    /// stream. Demux failures are fatal: a container we can no longer parse
    /// cannot be skipped over.
    pub fn step(&mut self) -> Result<Step, StageError> {
        match self.source.next_packet() {
            Ok(Some(packet)) => {
                self.output.push(StreamUnit::Payload(packet))?;
                Ok(Step::Continue)
            }
            Ok(None) => {
                self.output.push(StreamUnit::EndOfStream)?;
                tracing::debug!("source exhausted");
                Ok(Step::Done)
            }
            Err(err) => Err(StageError::Fatal(err)),
        }
    }
}

/// Channel count of the selected track, rejecting absent and empty layouts
/// alike.
///
/// An extensible WAV header can carry a present-but-all-zero channel mask,
/// which symphonia reports as `Some(Channels::empty())`; a zero count would
/// poison every per-frame division downstream.
fn channel_count_from_params(params: &CodecParameters, path: &str) -> Result<usize, PlayerError> {
    let channels = params
        .channels
        .ok_or_else(|| PlayerError::OpenInput {
            path: path.to_string(),
            reason: "unknown channel layout".into(),
        })?
        .count();
    if channels == 0 {
        return Err(PlayerError::OpenInput {
            path: path.to_string(),
            reason: "no audio channels".into(),
        });
    }
    Ok(channels)
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label for startup logging.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}

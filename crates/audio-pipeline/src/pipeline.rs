//! Pipeline assembly and supervision.
//!
//! `run` sets up every fallible component on the calling thread, then hands
//! the pieces to `drive`, which spawns one worker per stage and joins them.
//! Stages talk only through bounded queues; the shared [`CancelToken`]
//! unwinds the whole set when any stage fails or the caller cancels.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use cpal::traits::DeviceTrait;
use crossbeam_channel::unbounded;

use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::convert::{ConvertStage, SampleConverter};
use crate::decode::{DecodeStage, PacketDecoder, SymphoniaDecoder};
use crate::device::{self, DeviceFormat};
use crate::error::PlayerError;
use crate::queue::BoundedQueue;
use crate::render::{RenderSink, RenderStage};
use crate::sink::{CpalSink, RenderCounters};
use crate::source::{FileSource, PacketSource, ReaderStage, SourceInfo};
use crate::stage::{StageExit, run_stage};
use crate::unit::{AudioFrame, AudioPacket, StreamUnit};

/// Why a playback session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The file was fully decoded, rendered, and drained out of the device.
    Completed,
    /// Cancellation cut the session short.
    Stopped,
}

/// Final report for one playback session.
#[derive(Debug, Clone)]
pub struct PlaybackSummary {
    pub reason: EndReason,
    pub source: SourceInfo,
    pub output: DeviceFormat,
    pub played_frames: u64,
    pub underrun_frames: u64,
    pub underrun_events: u64,
}

/// Builds the render sink on the render worker thread.
///
/// CPAL streams are not `Send`, so the sink cannot be constructed up front
/// and moved; the factory crosses the thread boundary instead.
pub(crate) type SinkFactory =
    Box<dyn FnOnce() -> Result<Box<dyn RenderSink>, PlayerError> + Send>;

/// Pre-built stage components, ready to be wired and spawned.
pub(crate) struct PipelineParts {
    pub source: Box<dyn PacketSource>,
    pub decoder: Box<dyn PacketDecoder>,
    pub converter: SampleConverter,
    pub sink_factory: SinkFactory,
}

/// Play one file to completion, cancellation, or failure.
///
/// Device selection, format negotiation, demuxer, decoder, and converter
/// setup all happen here, before any worker starts; a failure in any of
/// them returns with nothing to unwind.
pub fn run(
    path: &Path,
    config: &PipelineConfig,
    token: &CancelToken,
) -> Result<PlaybackSummary, PlayerError> {
    let host = cpal::default_host();
    let dev = device::pick_device(&host, config.device.as_deref())?;
    let output = device::negotiate_format(&dev)?;
    let device_name = dev
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    tracing::info!(
        device = %device_name,
        rate_hz = output.rate,
        channels = output.channels,
        repr = %output.repr,
        "output negotiated"
    );

    let source = FileSource::open(path)?;
    let info = source.info().clone();
    tracing::info!(
        path = %path.display(),
        codec = info.codec.as_deref().unwrap_or("unknown"),
        rate_hz = info.rate,
        channels = info.channels,
        "input open"
    );

    let decoder = SymphoniaDecoder::new(&source.codec_params())?;
    let converter = SampleConverter::new(&info, &output, config.chunk_frames)?;

    let counters = RenderCounters::default();
    let sink_counters = counters.clone();
    let sink_token = token.clone();
    let selector = config.device.clone();
    let expected = output.clone();
    let buffer = config.device_buffer;
    let sink_factory: SinkFactory = Box::new(move || {
        let sink = CpalSink::open(
            selector.as_deref(),
            &expected,
            buffer,
            &sink_token,
            sink_counters,
        )?;
        Ok(Box::new(sink) as Box<dyn RenderSink>)
    });

    let reason = drive(
        PipelineParts {
            source: Box::new(source),
            decoder: Box::new(decoder),
            converter,
            sink_factory,
        },
        config,
        token,
    )?;

    Ok(PlaybackSummary {
        reason,
        source: info,
        output,
        played_frames: counters.played_frames.load(Ordering::Relaxed),
        underrun_frames: counters.underrun_frames.load(Ordering::Relaxed),
        underrun_events: counters.underrun_events.load(Ordering::Relaxed),
    })
}

/// Spawn the four stage workers, wait for all of them, and fold their exit
/// reports into one result.
///
/// The first reported failure wins; a stage that panics instead of
/// reporting counts as a failure too. A cancelled run without either is a
/// clean stop.
pub(crate) fn drive(
    parts: PipelineParts,
    config: &PipelineConfig,
    token: &CancelToken,
) -> Result<EndReason, PlayerError> {
    let packet_q: Arc<BoundedQueue<StreamUnit<AudioPacket>>> =
        BoundedQueue::new(config.queue_capacity, token);
    let decoded_q: Arc<BoundedQueue<StreamUnit<AudioFrame>>> =
        BoundedQueue::new(config.queue_capacity, token);
    let render_q: Arc<BoundedQueue<StreamUnit<AudioFrame>>> =
        BoundedQueue::new(config.queue_capacity, token);

    let (exit_tx, exit_rx) = unbounded::<(&'static str, StageExit)>();

    let reader_token = token.clone();
    let reader_q = packet_q.clone();
    let reader_tx = exit_tx.clone();
    let source = parts.source;
    let reader = thread::spawn(move || {
        let mut stage = ReaderStage::new(source, reader_q);
        let exit = run_stage("reader", &reader_token, || stage.step());
        let _ = reader_tx.send(("reader", exit));
    });

    let decoder_token = token.clone();
    let decoder_in = packet_q.clone();
    let decoder_out = decoded_q.clone();
    let decoder_tx = exit_tx.clone();
    let decoder = parts.decoder;
    let decode = thread::spawn(move || {
        let mut stage = DecodeStage::new(decoder_in, decoder_out, decoder);
        let exit = run_stage("decoder", &decoder_token, || stage.step());
        let _ = decoder_tx.send(("decoder", exit));
    });

    let convert_token = token.clone();
    let convert_in = decoded_q.clone();
    let convert_out = render_q.clone();
    let convert_tx = exit_tx.clone();
    let converter = parts.converter;
    let convert = thread::spawn(move || {
        let mut stage = ConvertStage::new(convert_in, convert_out, converter);
        let exit = run_stage("converter", &convert_token, || stage.step());
        let _ = convert_tx.send(("converter", exit));
    });

    let render_token = token.clone();
    let render_in = render_q.clone();
    let render_tx = exit_tx.clone();
    let sink_factory = parts.sink_factory;
    let poll = config.poll_interval;
    let render = thread::spawn(move || {
        // The sink opens here so the CPAL stream lives and dies on this
        // thread. An open failure takes the whole pipeline down.
        let sink = match sink_factory() {
            Ok(sink) => sink,
            Err(e) => {
                tracing::error!("renderer: {e}");
                render_token.cancel();
                let _ = render_tx.send(("renderer", StageExit::Failed(e)));
                return;
            }
        };
        let mut stage = RenderStage::new(render_in, sink, render_token.clone(), poll);
        let exit = run_stage("renderer", &render_token, || stage.step());
        let _ = render_tx.send(("renderer", exit));
    });

    let mut panicked: Option<&'static str> = None;
    for (name, handle) in [
        ("reader", reader),
        ("decoder", decode),
        ("converter", convert),
        ("renderer", render),
    ] {
        if handle.join().is_err() {
            // A panicked stage cannot send an exit report; record it here
            // and make sure the rest unwind.
            tracing::error!(stage = name, "stage panicked");
            if panicked.is_none() {
                panicked = Some(name);
            }
            token.cancel();
        }
    }
    drop(exit_tx);

    let mut failure: Option<PlayerError> = None;
    let mut cancelled = false;
    for (name, exit) in exit_rx.try_iter() {
        tracing::debug!(stage = name, exit = ?exit, "stage finished");
        match exit {
            StageExit::Completed => {}
            StageExit::Cancelled => cancelled = true,
            StageExit::Failed(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if let Some(stage) = panicked {
        return Err(PlayerError::StagePanicked { stage });
    }
    if cancelled || token.is_cancelled() {
        Ok(EndReason::Stopped)
    } else {
        Ok(EndReason::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SampleRepr;
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            queue_capacity: 8,
            poll_interval: Duration::from_millis(1),
            chunk_frames: 64,
            ..PipelineConfig::default()
        }
    }

    fn output_format() -> DeviceFormat {
        DeviceFormat {
            rate: 48_000,
            channels: 2,
            repr: SampleRepr::F32,
        }
    }

    fn source_info() -> SourceInfo {
        SourceInfo {
            rate: 48_000,
            channels: 2,
            codec: Some("test".to_string()),
            bit_depth: None,
            duration_ms: None,
        }
    }

    struct ScriptedSource {
        next_ts: u64,
        total: u64,
    }

    impl PacketSource for ScriptedSource {
        fn next_packet(&mut self) -> Result<Option<AudioPacket>, PlayerError> {
            if self.next_ts >= self.total {
                return Ok(None);
            }
            let ts = self.next_ts;
            self.next_ts += 1;
            Ok(Some(AudioPacket {
                track_id: 0,
                ts,
                dur: 1,
                data: Box::new([]),
            }))
        }
    }

    struct EndlessSource;

    impl PacketSource for EndlessSource {
        fn next_packet(&mut self) -> Result<Option<AudioPacket>, PlayerError> {
            Ok(Some(AudioPacket {
                track_id: 0,
                ts: 0,
                dur: 1,
                data: Box::new([]),
            }))
        }
    }

    /// Two-frame payload per packet; packets with odd timestamps decode to
    /// nothing, like a codec priming packet.
    struct ScriptedDecoder;

    impl PacketDecoder for ScriptedDecoder {
        fn decode(&mut self, packet: AudioPacket) -> Result<Vec<AudioFrame>, PlayerError> {
            if packet.ts % 2 == 1 {
                return Ok(Vec::new());
            }
            let base = packet.ts as f32;
            Ok(vec![AudioFrame {
                samples: vec![base, base, base + 0.5, base + 0.5],
                channels: 2,
                rate: 48_000,
            }])
        }
    }

    /// Decoder stand-in that dies on the first packet, like a codec bug.
    struct PanickingDecoder;

    impl PacketDecoder for PanickingDecoder {
        fn decode(&mut self, packet: AudioPacket) -> Result<Vec<AudioFrame>, PlayerError> {
            panic!("no decoder state for packet ts {}", packet.ts);
        }
    }

    #[derive(Default)]
    struct SinkLog {
        samples: Vec<f32>,
        writes: usize,
        stopped: bool,
    }

    /// Device stand-in whose buffer is always empty, so every write is
    /// accepted whole.
    struct OpenSink {
        format: DeviceFormat,
        log: Arc<Mutex<SinkLog>>,
    }

    impl RenderSink for OpenSink {
        fn format(&self) -> &DeviceFormat {
            &self.format
        }

        fn buffer_frames(&self) -> usize {
            4096
        }

        fn padding(&self) -> Result<usize, PlayerError> {
            Ok(0)
        }

        fn write(&mut self, samples: &[f32]) -> Result<usize, PlayerError> {
            let mut log = self.log.lock().unwrap();
            log.samples.extend_from_slice(samples);
            log.writes += 1;
            Ok(samples.len() / self.format.channels)
        }

        fn wait_space(&self, _timeout: Duration) -> bool {
            true
        }

        fn stop(&mut self) {
            self.log.lock().unwrap().stopped = true;
        }
    }

    /// Device stand-in that is permanently full; writers can only wait.
    struct FullSink {
        format: DeviceFormat,
    }

    impl RenderSink for FullSink {
        fn format(&self) -> &DeviceFormat {
            &self.format
        }

        fn buffer_frames(&self) -> usize {
            64
        }

        fn padding(&self) -> Result<usize, PlayerError> {
            Ok(64)
        }

        fn write(&mut self, _samples: &[f32]) -> Result<usize, PlayerError> {
            Ok(0)
        }

        fn wait_space(&self, timeout: Duration) -> bool {
            thread::sleep(timeout);
            false
        }

        fn stop(&mut self) {}
    }

    /// Sink whose very first padding query reports a dead device.
    struct BrokenSink {
        format: DeviceFormat,
    }

    impl RenderSink for BrokenSink {
        fn format(&self) -> &DeviceFormat {
            &self.format
        }

        fn buffer_frames(&self) -> usize {
            64
        }

        fn padding(&self) -> Result<usize, PlayerError> {
            Err(PlayerError::Device {
                op: "output stream",
                reason: "device unplugged".to_string(),
            })
        }

        fn write(&mut self, _samples: &[f32]) -> Result<usize, PlayerError> {
            Ok(0)
        }

        fn wait_space(&self, _timeout: Duration) -> bool {
            true
        }

        fn stop(&mut self) {}
    }

    fn passthrough_converter() -> SampleConverter {
        SampleConverter::new(&source_info(), &output_format(), 64).unwrap()
    }

    #[test]
    fn full_run_delivers_every_decoded_sample_in_order() {
        let token = CancelToken::new();
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let log_for_sink = log.clone();
        let format = output_format();

        let parts = PipelineParts {
            source: Box::new(ScriptedSource { next_ts: 0, total: 3 }),
            decoder: Box::new(ScriptedDecoder),
            converter: passthrough_converter(),
            sink_factory: Box::new(move || {
                Ok(Box::new(OpenSink {
                    format,
                    log: log_for_sink,
                }) as Box<dyn RenderSink>)
            }),
        };

        let reason = drive(parts, &small_config(), &token).unwrap();
        assert_eq!(reason, EndReason::Completed);
        assert!(!token.is_cancelled());

        // Packets ts 0 and 2 decode to payloads; ts 1 decodes to nothing
        // and must simply vanish without stalling anything.
        let log = log.lock().unwrap();
        assert_eq!(log.writes, 2);
        assert_eq!(
            log.samples,
            vec![0.0, 0.0, 0.5, 0.5, 2.0, 2.0, 2.5, 2.5]
        );
        assert!(log.stopped, "end of stream must stop the sink");
    }

    #[test]
    fn sink_open_failure_fails_the_run_and_cancels() {
        let token = CancelToken::new();
        let parts = PipelineParts {
            source: Box::new(EndlessSource),
            decoder: Box::new(ScriptedDecoder),
            converter: passthrough_converter(),
            sink_factory: Box::new(|| {
                Err(PlayerError::NoOutputDevice)
            }),
        };

        let err = drive(parts, &small_config(), &token).unwrap_err();
        assert!(matches!(err, PlayerError::NoOutputDevice));
        assert!(token.is_cancelled());
    }

    #[test]
    fn dead_device_fails_the_run_and_cancels() {
        let token = CancelToken::new();
        let format = output_format();
        let parts = PipelineParts {
            source: Box::new(EndlessSource),
            decoder: Box::new(ScriptedDecoder),
            converter: passthrough_converter(),
            sink_factory: Box::new(move || {
                Ok(Box::new(BrokenSink { format }) as Box<dyn RenderSink>)
            }),
        };

        let err = drive(parts, &small_config(), &token).unwrap_err();
        assert!(matches!(err, PlayerError::Device { .. }));
        assert!(token.is_cancelled());
    }

    #[test]
    fn stage_panic_fails_the_run_and_cancels() {
        let token = CancelToken::new();
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let format = output_format();

        // A finite source: the reader finishes on its own, so the join
        // loop reaches the dead decoder without anyone stuck pushing.
        let parts = PipelineParts {
            source: Box::new(ScriptedSource { next_ts: 0, total: 3 }),
            decoder: Box::new(PanickingDecoder),
            converter: passthrough_converter(),
            sink_factory: Box::new(move || {
                Ok(Box::new(OpenSink { format, log }) as Box<dyn RenderSink>)
            }),
        };

        let err = drive(parts, &small_config(), &token).unwrap_err();
        assert!(
            matches!(err, PlayerError::StagePanicked { stage: "decoder" }),
            "a dead worker must surface as a failure, got {err:?}"
        );
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancellation_stops_a_wedged_pipeline() {
        let token = CancelToken::new();
        let format = output_format();
        let parts = PipelineParts {
            source: Box::new(EndlessSource),
            decoder: Box::new(ScriptedDecoder),
            converter: passthrough_converter(),
            sink_factory: Box::new(move || {
                Ok(Box::new(FullSink { format }) as Box<dyn RenderSink>)
            }),
        };

        let (done_tx, done_rx) = mpsc::channel();
        let config = small_config();
        let drive_token = token.clone();
        thread::spawn(move || {
            let _ = done_tx.send(drive(parts, &config, &drive_token));
        });

        // Let the stages wedge against the full device, then pull the plug.
        thread::sleep(Duration::from_millis(30));
        token.cancel();

        let result = done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("pipeline must unwind after cancel");
        assert_eq!(result.unwrap(), EndReason::Stopped);
    }
}

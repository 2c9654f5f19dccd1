//! Fileplay: a small CLI utility that decodes a compressed audio file and
//! plays it on the default (or selected) CPAL output device.
//!
//! ## Pipeline
//! 1. **Read**: a worker thread demuxes the container into compressed packets.
//! 2. **Decode**: a worker thread turns packets into interleaved `f32` frames.
//! 3. **Convert**: a worker thread maps channels and resamples to the device format.
//! 4. **Render**: a worker thread feeds the device under buffer flow control.
//!
//! Stages communicate via bounded queues sized by `--queue-capacity`; the
//! device buffer (`--buffer-ms`) absorbs scheduling hiccups. Ctrl-C cancels
//! the whole set and the player exits after a clean teardown.

mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use audio_pipeline::cancel::CancelToken;
use audio_pipeline::config::PipelineConfig;
use audio_pipeline::device;
use audio_pipeline::pipeline::{self, EndReason};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,fileplay=info")
        }))
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        for (i, name) in device::output_device_names(&host)?.iter().enumerate() {
            println!("#{i}: {name}");
        }
        return Ok(());
    }

    let input = args.input.clone().context("an input file is required")?;
    let config = PipelineConfig {
        queue_capacity: args.queue_capacity,
        device_buffer: Duration::from_millis(args.buffer_ms),
        poll_interval: Duration::from_millis(args.poll_ms),
        chunk_frames: args.chunk_frames,
        device: args.device.clone(),
    };

    let token = CancelToken::new();
    let token_for_signal = token.clone();
    let _ = ctrlc::set_handler(move || {
        tracing::info!("interrupt received; stopping");
        token_for_signal.cancel();
    });

    let summary = pipeline::run(&input, &config, &token)
        .with_context(|| format!("play {}", input.display()))?;

    match summary.reason {
        EndReason::Completed => {
            tracing::info!(played_frames = summary.played_frames, "playback complete");
        }
        EndReason::Stopped => {
            tracing::info!(played_frames = summary.played_frames, "playback stopped");
        }
    }
    if summary.underrun_frames > 0 {
        tracing::warn!(
            frames = summary.underrun_frames,
            events = summary.underrun_events,
            "underruns during playback"
        );
    }

    Ok(())
}

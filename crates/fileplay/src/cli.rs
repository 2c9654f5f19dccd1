use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "fileplay", version)]
pub struct Args {
    /// Path to the audio file to play
    #[arg(required_unless_present = "list_devices")]
    pub input: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Capacity of each inter-stage queue, in packets/frames
    #[arg(long, default_value_t = 128)]
    pub queue_capacity: usize,

    /// Device buffer target in milliseconds (higher => more underrun resistance, more latency)
    #[arg(long, default_value_t = 1000)]
    pub buffer_ms: u64,

    /// Wait slice while the device buffer is full, in milliseconds
    #[arg(long, default_value_t = 5)]
    pub poll_ms: u64,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,
}

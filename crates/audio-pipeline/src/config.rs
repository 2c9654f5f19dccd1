//! Tunables for a playback run.

use std::time::Duration;

/// Knobs for the pipeline; the defaults are good for local playback.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Capacity of each stage queue, in units (packets or frames).
    pub queue_capacity: usize,

    /// How much audio the device-side buffer holds.
    pub device_buffer: Duration,

    /// Upper bound on one wait for device-buffer space. The render stage
    /// normally wakes earlier, when the device callback frees room.
    pub poll_interval: Duration,

    /// Input chunk size in frames for the sample-rate converter
    /// (higher => more latency, lower => more overhead).
    pub chunk_frames: usize,

    /// Substring match against output device names; `None` = default device.
    pub device: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            device_buffer: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(5),
            chunk_frames: 1024,
            device: None,
        }
    }
}

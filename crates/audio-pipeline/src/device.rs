//! Output device selection and format negotiation.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - reading the device's native mix format into a [`DeviceFormat`]
//!
//! Negotiation happens on the calling thread before any worker starts, so an
//! unusable device fails the run without opening a session.

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::PlayerError;

/// How the device represents one sample on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleRepr {
    F32,
    I16,
    I32,
    U16,
}

impl SampleRepr {
    /// Map a CPAL sample format; `None` means we cannot feed this device.
    pub fn from_cpal(format: cpal::SampleFormat) -> Option<Self> {
        match format {
            cpal::SampleFormat::F32 => Some(Self::F32),
            cpal::SampleFormat::I16 => Some(Self::I16),
            cpal::SampleFormat::I32 => Some(Self::I32),
            cpal::SampleFormat::U16 => Some(Self::U16),
            _ => None,
        }
    }

    /// Bytes per sample.
    pub fn bytes(&self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::I16 | Self::U16 => 2,
        }
    }
}

impl std::fmt::Display for SampleRepr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::F32 => "f32",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::U16 => "u16",
        };
        f.write_str(name)
    }
}

/// The output format negotiated with the device, fixed for one session.
///
/// The converter reads this as its target; the render sink verifies it when
/// the session opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFormat {
    pub rate: u32,
    pub channels: usize,
    pub repr: SampleRepr,
}

impl DeviceFormat {
    /// Bytes per sample-frame (all channels of one frame).
    pub fn block_align(&self) -> usize {
        self.channels * self.repr.bytes()
    }
}

/// Pick a CPAL output device.
///
/// - If `needle` is `Some`, chooses the first output device whose name
///   contains the substring (case-insensitive).
/// - Otherwise, returns the host default output device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device, PlayerError> {
    if let Some(needle) = needle {
        let mut devices = host
            .output_devices()
            .map_err(|e| PlayerError::device("Host::output_devices", e))?;
        if let Some(d) = devices.find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(PlayerError::NoMatchingDevice {
            needle: needle.to_string(),
        });
    }

    host.default_output_device()
        .ok_or(PlayerError::NoOutputDevice)
}

/// Read the device's native mix format.
///
/// Fails with a configuration error when the device reports a sample format
/// the pipeline cannot produce; nothing has been opened at that point.
pub fn negotiate_format(device: &cpal::Device) -> Result<DeviceFormat, PlayerError> {
    let config = device
        .default_output_config()
        .map_err(|e| PlayerError::device("Device::default_output_config", e))?;
    format_from_config(&config)
}

/// Interpret a CPAL output config as a [`DeviceFormat`].
pub fn format_from_config(config: &cpal::SupportedStreamConfig) -> Result<DeviceFormat, PlayerError> {
    let repr = SampleRepr::from_cpal(config.sample_format()).ok_or_else(|| {
        PlayerError::UnsupportedMixFormat {
            format: format!("{:?}", config.sample_format()),
        }
    })?;

    Ok(DeviceFormat {
        rate: config.sample_rate(),
        channels: config.channels() as usize,
        repr,
    })
}

/// Names of all output devices on `host`, for `--list-devices`.
pub fn output_device_names(host: &cpal::Host) -> Result<Vec<String>, PlayerError> {
    let devices = host
        .output_devices()
        .map_err(|e| PlayerError::device("Host::output_devices", e))?;
    let mut names = Vec::new();
    for d in devices {
        match d.description() {
            Ok(desc) => names.push(desc.to_string()),
            Err(e) => names.push(format!("<unknown: {e}>")),
        }
    }
    Ok(names)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

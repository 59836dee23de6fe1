//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::constants::SUPPORTED_SAMPLE_RATES;
use crate::error::AudioError;

/// Which side of a device a stream uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn prefix(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Device description for listings and the monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioDeviceInfo {
    /// `input:<name>` or `output:<name>`
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Split a device id into direction and name. Bare names are inputs.
pub fn parse_device_id(id: &str) -> (Direction, &str) {
    if let Some(name) = id.strip_prefix("output:") {
        (Direction::Output, name)
    } else if let Some(name) = id.strip_prefix("input:") {
        (Direction::Input, name)
    } else {
        (Direction::Input, id)
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    for direction in [Direction::Input, Direction::Output] {
        let default_name = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        }
        .and_then(|d| d.name().ok());

        let found = match direction {
            Direction::Input => host.input_devices(),
            Direction::Output => host.output_devices(),
        };
        let Ok(found) = found else {
            continue;
        };

        for device in found {
            let Ok(name) = device.name() else {
                continue;
            };
            let is_default = default_name.as_deref() == Some(name.as_str());
            let (sample_rates, channels) = capabilities(&device, direction);

            devices.push(AudioDeviceInfo {
                id: format!("{}:{}", direction.prefix(), name),
                name,
                is_input: direction == Direction::Input,
                is_output: direction == Direction::Output,
                is_default,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

/// Supported rates (from the session's accepted set) and channel counts
fn capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|c| c.collect()),
        Direction::Output => device.supported_output_configs().map(|c| c.collect()),
    }
    .unwrap_or_default();

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for range in &ranges {
        for rate in SUPPORTED_SAMPLE_RATES {
            let sr = cpal::SampleRate(rate);
            if sr >= range.min_sample_rate() && sr <= range.max_sample_rate() && !sample_rates.contains(&rate) {
                sample_rates.push(rate);
            }
        }
        if !channels.contains(&range.channels()) {
            channels.push(range.channels());
        }
    }
    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Find a device by id, or the default device for `direction` when `id` is
/// `None`.
pub fn find_device(id: Option<&str>, direction: Direction) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| {
            AudioError::DeviceNotFound(format!("no default {} device", direction.prefix()))
        });
    };

    let (_, name) = parse_device_id(id);
    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Channel count to open `device` with: the session's count if supported at
/// `sample_rate`, else the device default.
pub fn negotiate_channels(
    device: &cpal::Device,
    direction: Direction,
    sample_rate: u32,
    wanted: u16,
) -> Result<u16, AudioError> {
    let sr = cpal::SampleRate(sample_rate);
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|c| c.collect()),
        Direction::Output => device.supported_output_configs().map(|c| c.collect()),
    }
    .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;

    let at_rate = |r: &&cpal::SupportedStreamConfigRange| {
        r.min_sample_rate() <= sr && sr <= r.max_sample_rate()
    };
    if ranges.iter().filter(at_rate).any(|r| r.channels() == wanted) {
        return Ok(wanted);
    }
    ranges
        .iter()
        .find(at_rate)
        .map(|r| r.channels())
        .ok_or_else(|| AudioError::UnsupportedFormat(format!("{} Hz not supported", sample_rate)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("output:Speakers"), (Direction::Output, "Speakers"));
        assert_eq!(parse_device_id("input:Mic: USB"), (Direction::Input, "Mic: USB"));
        assert_eq!(parse_device_id("Line In"), (Direction::Input, "Line In"));
    }

    #[test]
    fn test_listing_is_consistent() {
        // Hosts without audio hardware simply list nothing
        for device in list_devices() {
            assert!(device.is_input != device.is_output);
            assert!(device.id.ends_with(&device.name));
            assert!(device.sample_rates.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

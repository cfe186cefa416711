//! Audio device records, enumeration and spec resolution

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::warn;

use crate::config::{DeviceSelector, DeviceSpec};
use crate::{MAX_CHANNELS, SAMPLE_RATE};

use super::error::AudioError;

/// Transfer direction of a device. Each device is strictly one or the other;
/// a duplex interface is opened as two devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Monotonic handle for one opened device. Assigned at construction and used
/// as the routing key between broker and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// The immutable half of a device: everything the worker and broker need to
/// know that never changes after construction.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub direction: Direction,
    pub channels: u16,
}

/// One enumerated device as shown by `devices list`.
#[derive(Debug, Clone)]
pub struct DeviceListing {
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub is_default_input: bool,
    pub is_default_output: bool,
}

/// Enumerate every device the host exposes, with channel capabilities and
/// default markers.
pub fn list_devices() -> Vec<DeviceListing> {
    let host = cpal::default_host();
    let default_in = host
        .default_input_device()
        .and_then(|d| d.name().ok());
    let default_out = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    let mut listings = Vec::new();
    let Ok(devices) = host.devices() else {
        return listings;
    };
    for device in devices {
        let Ok(name) = device.name() else { continue };
        listings.push(DeviceListing {
            max_input_channels: max_channels(&device, Direction::Input),
            max_output_channels: max_channels(&device, Direction::Output),
            is_default_input: default_in.as_ref() == Some(&name),
            is_default_output: default_out.as_ref() == Some(&name),
            name,
        });
    }
    listings
}

fn max_channels(device: &cpal::Device, direction: Direction) -> u16 {
    let configs: Vec<_> = match direction {
        Direction::Input => device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default(),
        Direction::Output => device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default(),
    };
    configs
        .iter()
        .filter(|c| {
            c.min_sample_rate().0 <= SAMPLE_RATE && SAMPLE_RATE <= c.max_sample_rate().0
        })
        .map(|c| c.channels())
        .max()
        .unwrap_or(0)
}

/// Resolve one parsed device spec against the host: find the cpal device,
/// settle direction and channel count, and mint the `DeviceInfo`.
pub fn resolve_spec(
    spec: &DeviceSpec,
    id: DeviceId,
) -> Result<(DeviceInfo, cpal::Device), AudioError> {
    let host = cpal::default_host();
    let device = match &spec.selector {
        DeviceSelector::Default => match spec.direction {
            Some(Direction::Input) | None => host.default_input_device(),
            Some(Direction::Output) => host.default_output_device(),
        }
        .ok_or_else(|| AudioError::DeviceNotFound("no default device".to_string()))?,
        DeviceSelector::Index(idx) => host
            .devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .nth(*idx)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("index {idx}")))?,
        DeviceSelector::Name(fragment) => find_by_name(&host, fragment)?,
    };

    let name = device
        .name()
        .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?;
    let in_max = max_channels(&device, Direction::Input);
    let out_max = max_channels(&device, Direction::Output);

    let direction = match spec.direction {
        Some(d) => d,
        None => {
            // Guess only when the hardware leaves no doubt.
            if out_max == 0 && in_max != 0 {
                Direction::Input
            } else if in_max == 0 && out_max != 0 {
                Direction::Output
            } else {
                return Err(AudioError::AmbiguousDirection(name));
            }
        }
    };
    let max = match direction {
        Direction::Input => in_max,
        Direction::Output => out_max,
    };

    let channels = match spec.channels {
        Some(ch) => {
            if ch == 0 || ch > MAX_CHANNELS {
                return Err(AudioError::BadChannelCount(ch));
            }
            if ch > max {
                return Err(AudioError::TooManyChannels {
                    name,
                    direction: direction.as_str(),
                    max,
                    requested: ch,
                });
            }
            ch
        }
        None => {
            let ch = max.min(2);
            if ch == 0 {
                return Err(AudioError::DeviceNotFound(format!(
                    "\"{name}\" has no {} channels at {SAMPLE_RATE} Hz",
                    direction.as_str()
                )));
            }
            ch
        }
    };

    Ok((
        DeviceInfo {
            id,
            name,
            direction,
            channels,
        },
        device,
    ))
}

/// Case-insensitive substring match over device names. The first match wins;
/// further matches only produce a warning.
fn find_by_name(host: &cpal::Host, fragment: &str) -> Result<cpal::Device, AudioError> {
    let needle = fragment.to_lowercase();
    let mut choice: Option<(String, cpal::Device)> = None;
    let devices = host
        .devices()
        .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?;
    for device in devices {
        let Ok(name) = device.name() else { continue };
        if name.to_lowercase().contains(&needle) {
            match &choice {
                None => choice = Some((name, device)),
                Some((chosen, _)) => {
                    warn!("ambiguous device name \"{fragment}\"; choosing \"{chosen}\"");
                    break;
                }
            }
        }
    }
    choice
        .map(|(_, d)| d)
        .ok_or_else(|| AudioError::DeviceNotFound(fragment.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId(3).to_string(), "dev3");
    }

    #[test]
    fn test_list_devices_does_not_panic() {
        // Device availability depends on the machine; only check that
        // enumeration is total.
        let _ = list_devices();
    }
}

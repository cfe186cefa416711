//! Engine configuration
//!
//! Device specs come in as `<direction>:<name_or_numeric_id>:<channels>`
//! strings where each segment is optional. Parsing happens here, without
//! touching the audio host; resolution against real devices is the audio
//! layer's job.

use thiserror::Error;

use crate::audio::Direction;
use crate::MAX_CHANNELS;

/// How a spec names its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// No name given: the host's default device for the direction.
    Default,
    /// Numeric position in the host's device enumeration.
    Index(usize),
    /// Case-insensitive substring of the device name.
    Name(String),
}

/// One parsed `--device` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub direction: Option<Direction>,
    pub selector: DeviceSelector,
    pub channels: Option<u16>,
}

/// Errors from device-spec parsing. These are configuration errors: reported
/// once on stderr, then the process exits nonzero.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid input/output specifier \"{0}\"")]
    BadDirection(String),

    #[error("invalid channel specifier \"{0}\"")]
    BadChannels(String),

    #[error("invalid channel count {0}; must be between 1 and 16")]
    ChannelsOutOfRange(u16),
}

/// Immutable options record handed to the engine after CLI parsing.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub devices: Vec<DeviceSpec>,
    pub targets: Vec<String>,
    pub port: u16,
}

impl DeviceSpec {
    /// Parse a `<direction>:<name_or_id>:<channels>` string. A bare token
    /// with no colon is a name or numeric id; with colons, the first segment
    /// is the direction and the third, when present, the channel count.
    /// Empty segments fall back to their defaults.
    pub fn parse(s: &str) -> Result<DeviceSpec, ConfigError> {
        let (direction_part, name_part, channels_part) = match s.split_once(':') {
            None => (None, s, None),
            Some((dir, rest)) => match rest.split_once(':') {
                None => (Some(dir), rest, None),
                Some((name, chans)) => (Some(dir), name, Some(chans)),
            },
        };

        let direction = match direction_part {
            None | Some("") => None,
            Some(word) => Some(parse_direction(word)?),
        };

        let selector = if name_part.is_empty() {
            DeviceSelector::Default
        } else if let Ok(idx) = name_part.parse::<usize>() {
            DeviceSelector::Index(idx)
        } else {
            DeviceSelector::Name(name_part.to_string())
        };

        let channels = match channels_part {
            None | Some("") => None,
            Some(word) => {
                let ch: u16 = word
                    .parse()
                    .map_err(|_| ConfigError::BadChannels(word.to_string()))?;
                if ch == 0 || ch > MAX_CHANNELS {
                    return Err(ConfigError::ChannelsOutOfRange(ch));
                }
                Some(ch)
            }
        };

        Ok(DeviceSpec {
            direction,
            selector,
            channels,
        })
    }

    /// The default device pair used when no `--device` options are given:
    /// default input and default output, up to two channels each.
    pub fn defaults() -> Vec<DeviceSpec> {
        vec![
            DeviceSpec {
                direction: Some(Direction::Input),
                selector: DeviceSelector::Default,
                channels: None,
            },
            DeviceSpec {
                direction: Some(Direction::Output),
                selector: DeviceSelector::Default,
                channels: None,
            },
        ]
    }
}

/// Accept any unambiguous prefix of "input" or "output", case-insensitive.
fn parse_direction(word: &str) -> Result<Direction, ConfigError> {
    let lower = word.to_lowercase();
    if !lower.is_empty() && "input".starts_with(&lower) {
        Ok(Direction::Input)
    } else if !lower.is_empty() && "output".starts_with(&lower) {
        Ok(Direction::Output)
    } else {
        Err(ConfigError::BadDirection(word.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name() {
        let spec = DeviceSpec::parse("Scarlett").unwrap();
        assert_eq!(spec.direction, None);
        assert_eq!(spec.selector, DeviceSelector::Name("Scarlett".to_string()));
        assert_eq!(spec.channels, None);
    }

    #[test]
    fn test_bare_numeric_id() {
        let spec = DeviceSpec::parse("3").unwrap();
        assert_eq!(spec.selector, DeviceSelector::Index(3));
    }

    #[test]
    fn test_full_spec() {
        let spec = DeviceSpec::parse("input:Scarlett 2i2:2").unwrap();
        assert_eq!(spec.direction, Some(Direction::Input));
        assert_eq!(
            spec.selector,
            DeviceSelector::Name("Scarlett 2i2".to_string())
        );
        assert_eq!(spec.channels, Some(2));
    }

    #[test]
    fn test_direction_prefixes() {
        assert_eq!(
            DeviceSpec::parse("in:x").unwrap().direction,
            Some(Direction::Input)
        );
        assert_eq!(
            DeviceSpec::parse("OUT:x").unwrap().direction,
            Some(Direction::Output)
        );
        assert!(DeviceSpec::parse("sideways:x").is_err());
    }

    #[test]
    fn test_empty_segments_default() {
        let spec = DeviceSpec::parse("output::4").unwrap();
        assert_eq!(spec.direction, Some(Direction::Output));
        assert_eq!(spec.selector, DeviceSelector::Default);
        assert_eq!(spec.channels, Some(4));

        let spec = DeviceSpec::parse(":mic:").unwrap();
        assert_eq!(spec.direction, None);
        assert_eq!(spec.selector, DeviceSelector::Name("mic".to_string()));
        assert_eq!(spec.channels, None);
    }

    #[test]
    fn test_channel_bounds() {
        assert!(DeviceSpec::parse("input:x:0").is_err());
        assert!(DeviceSpec::parse("input:x:17").is_err());
        assert!(DeviceSpec::parse("input:x:16").is_ok());
        assert!(DeviceSpec::parse("input:x:two").is_err());
    }

    #[test]
    fn test_defaults_pair() {
        let specs = DeviceSpec::defaults();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].direction, Some(Direction::Input));
        assert_eq!(specs[1].direction, Some(Direction::Output));
    }
}

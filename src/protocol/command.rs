//! Device command wire format
//!
//! Commands travel from the broker to each worker as
//! `{type: u8, datalen: u16 big-endian, payload: datalen bytes}`.
//! The `ClientList` payload is a NUL-separated identity list terminated by
//! an extra NUL byte.

use super::PeerId;

const CMD_INVALID: u8 = 0;
const CMD_SHUTDOWN: u8 = 1;
const CMD_CLIENTLIST: u8 = 2;

/// A command addressed to one device worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Unrecognized or truncated command. Workers ignore it.
    Invalid,
    /// Stop the worker loop and release the device.
    Shutdown,
    /// The authoritative set of inbound peers, replacing the previous set.
    ClientList { identities: Vec<PeerId> },
}

impl DeviceCommand {
    /// Serialize into the command wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            DeviceCommand::Invalid => encode(CMD_INVALID, &[]),
            DeviceCommand::Shutdown => encode(CMD_SHUTDOWN, &[]),
            DeviceCommand::ClientList { identities } => {
                let mut payload = Vec::new();
                for id in identities {
                    payload.extend_from_slice(id.as_bytes());
                    payload.push(0);
                }
                payload.push(0);
                encode(CMD_CLIENTLIST, &payload)
            }
        }
    }

    /// Parse a command from the wire. Truncated or unknown input yields
    /// `Invalid` rather than an error: a worker must never die because the
    /// broker spoke a newer dialect.
    pub fn from_bytes(data: &[u8]) -> DeviceCommand {
        if data.len() < 3 {
            return DeviceCommand::Invalid;
        }
        let datalen = u16::from_be_bytes([data[1], data[2]]) as usize;
        if data.len() < 3 + datalen {
            return DeviceCommand::Invalid;
        }
        let payload = &data[3..3 + datalen];

        match data[0] {
            CMD_SHUTDOWN => DeviceCommand::Shutdown,
            CMD_CLIENTLIST => match parse_identity_list(payload) {
                Some(identities) => DeviceCommand::ClientList { identities },
                None => DeviceCommand::Invalid,
            },
            _ => DeviceCommand::Invalid,
        }
    }
}

fn encode(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + payload.len());
    buf.push(kind);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Walk NUL-separated identities until the zero-length terminator entry.
fn parse_identity_list(payload: &[u8]) -> Option<Vec<PeerId>> {
    let mut identities = Vec::new();
    let mut idx = 0;
    loop {
        let rest = payload.get(idx..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        if nul == 0 {
            return Some(identities);
        }
        let id = std::str::from_utf8(&rest[..nul]).ok()?;
        identities.push(PeerId(id.to_string()));
        idx += nul + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_roundtrip() {
        let cmd = DeviceCommand::Shutdown;
        assert_eq!(DeviceCommand::from_bytes(&cmd.to_bytes()), cmd);
    }

    #[test]
    fn test_invalid_roundtrip() {
        let cmd = DeviceCommand::Invalid;
        assert_eq!(DeviceCommand::from_bytes(&cmd.to_bytes()), cmd);
    }

    #[test]
    fn test_client_list_roundtrip() {
        let cmd = DeviceCommand::ClientList {
            identities: vec![
                PeerId::from("fe80::1%eth0:5040"),
                PeerId::from("192.168.1.7:5040"),
            ],
        };
        assert_eq!(DeviceCommand::from_bytes(&cmd.to_bytes()), cmd);
    }

    #[test]
    fn test_empty_client_list_roundtrip() {
        let cmd = DeviceCommand::ClientList { identities: vec![] };
        let bytes = cmd.to_bytes();
        // type + datalen + single terminator NUL
        assert_eq!(bytes.len(), 4);
        assert_eq!(DeviceCommand::from_bytes(&bytes), cmd);
    }

    #[test]
    fn test_client_list_wire_layout() {
        let cmd = DeviceCommand::ClientList {
            identities: vec![PeerId::from("ab"), PeerId::from("c")],
        };
        let bytes = cmd.to_bytes();
        assert_eq!(bytes[0], 2);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 6);
        assert_eq!(&bytes[3..], b"ab\0c\0\0");
    }

    #[test]
    fn test_truncated_is_invalid() {
        assert_eq!(DeviceCommand::from_bytes(&[]), DeviceCommand::Invalid);
        assert_eq!(DeviceCommand::from_bytes(&[1]), DeviceCommand::Invalid);
        // datalen promises more bytes than present
        assert_eq!(
            DeviceCommand::from_bytes(&[2, 0, 9, 0]),
            DeviceCommand::Invalid
        );
    }

    #[test]
    fn test_unknown_type_is_invalid() {
        assert_eq!(
            DeviceCommand::from_bytes(&[77, 0, 0]),
            DeviceCommand::Invalid
        );
    }

    #[test]
    fn test_client_list_missing_terminator_is_invalid() {
        // "ab\0" without the extra terminating NUL
        assert_eq!(
            DeviceCommand::from_bytes(&[2, 0, 3, b'a', b'b', 0]),
            DeviceCommand::Invalid
        );
    }
}

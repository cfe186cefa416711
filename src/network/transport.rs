//! UDP world transport
//!
//! The broker speaks to the outside world over one UDP socket carrying the
//! framed world messages. Sockets are built with socket2 so SO_REUSEADDR,
//! receive timeouts and multicast membership can be set before binding; all
//! I/O afterwards is plain blocking reads inside the owning thread.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    decode_identity_reply, encode_identity_reply, WorldMessage,
};
use crate::PeerId;

use super::error::NetworkError;

/// Receive-buffer size: comfortably larger than any framed audio message.
const RECV_BUFFER_LEN: usize = 4096;

/// Broker tick length; the world socket blocks at most this long per recv.
pub const WORLD_RECV_TIMEOUT: Duration = Duration::from_millis(10);

/// How long an identity probe waits for its reply.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// The broker's socket to the outside world, plus the identity we announce.
pub struct WorldSocket {
    socket: UdpSocket,
    identity: PeerId,
    recv_buf: Vec<u8>,
}

impl WorldSocket {
    /// Bind on `port` with SO_REUSEADDR and the broker-tick read timeout.
    pub fn bind(port: u16) -> Result<Self, NetworkError> {
        let socket = udp_socket(
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            Some(WORLD_RECV_TIMEOUT),
        )?;
        let port = socket.local_addr()?.port();
        let identity = self_identity(port)?;
        info!("world socket on port {port}, identity {identity}");
        Ok(Self {
            socket,
            identity,
            recv_buf: vec![0u8; RECV_BUFFER_LEN],
        })
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// The port actually bound, which differs from the requested one when
    /// binding port 0.
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Receive one world message. `Ok(None)` means the tick elapsed with no
    /// traffic; malformed datagrams are logged and reported as `None` too,
    /// since a single bad peer must not stall the broker.
    pub fn recv(&mut self) -> Result<Option<(WorldMessage, SocketAddr)>, NetworkError> {
        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((len, addr)) => match WorldMessage::from_bytes(&self.recv_buf[..len]) {
                Some(msg) => {
                    trace!("world recv {len}B from {addr}");
                    Ok(Some((msg, addr)))
                }
                None => {
                    warn!("malformed {len}B datagram from {addr}");
                    Ok(None)
                }
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send a world message to `addr`. Send failures are the caller's to
    /// log; the peer itself is retained.
    pub fn send(&self, msg: &WorldMessage, addr: SocketAddr) -> Result<(), NetworkError> {
        self.socket.send_to(&msg.to_bytes(), addr)?;
        Ok(())
    }

    /// Answer an identity probe.
    pub fn send_identity_reply(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        self.socket
            .send_to(&encode_identity_reply(&self.identity), addr)?;
        Ok(())
    }
}

/// Probe `addr` for its identity from a short-lived socket: send an empty
/// probe, wait up to two seconds for the NUL-terminated reply.
pub fn probe_peer(addr: SocketAddr, our_identity: &PeerId) -> Result<PeerId, NetworkError> {
    let socket = udp_socket(
        SocketAddr::new(unspecified_for(addr), 0),
        Some(Duration::from_millis(100)),
    )?;
    let probe = WorldMessage::Probe {
        from: our_identity.clone(),
    }
    .to_bytes();

    let deadline = Instant::now() + PROBE_TIMEOUT;
    socket.send_to(&probe, addr)?;

    let mut buf = [0u8; RECV_BUFFER_LEN];
    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if from != addr {
                    debug!("ignoring stray probe reply from {from}");
                    continue;
                }
                if let Some(identity) = decode_identity_reply(&buf[..len]) {
                    return Ok(identity);
                }
                return Err(NetworkError::InvalidMessage(from));
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Re-probe; cooperative LANs drop datagrams too.
                socket.send_to(&probe, addr)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(NetworkError::ProbeTimeout(addr, PROBE_TIMEOUT))
}

/// Join an IPv6 multicast group on `port` with loopback disabled, for the
/// packet-stream receiver.
pub fn bind_multicast(group: Ipv6Addr, port: u16) -> Result<UdpSocket, NetworkError> {
    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.join_multicast_v6(&group, 0)?;
    socket.set_multicast_loop_v6(false)?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;
    info!("joined multicast group {group} on port {port}");
    Ok(socket.into())
}

/// Build a plain UDP socket for the timing side channel.
pub fn bind_udp(port: u16, read_timeout: Option<Duration>) -> Result<UdpSocket, NetworkError> {
    udp_socket(
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        read_timeout,
    )
}

fn udp_socket(
    bind_addr: SocketAddr,
    read_timeout: Option<Duration>,
) -> Result<UdpSocket, NetworkError> {
    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if domain == Domain::IPV6 {
        // Accept IPv4 peers on the same socket.
        socket.set_only_v6(false)?;
    }
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(read_timeout)?;
    Ok(socket)
}

fn unspecified_for(addr: SocketAddr) -> IpAddr {
    if addr.is_ipv4() {
        IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}

/// Our self identity: a stable local address plus the listen port. Prefers a
/// link-local IPv6 address, then any discovered interface address, then
/// loopback (machines with no configured interface still work standalone).
fn self_identity(port: u16) -> Result<PeerId, NetworkError> {
    if let Ok(netifas) = local_ip_address::list_afinet_netifas() {
        if let Some((_, ip)) = netifas.iter().find(|(_, ip)| match ip {
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            IpAddr::V4(_) => false,
        }) {
            return Ok(PeerId(format!("{ip}:{port}")));
        }
    }
    match local_ip_address::local_ip() {
        Ok(ip) => Ok(PeerId(format!("{ip}:{port}"))),
        Err(_) => {
            warn!("no interface address found, using loopback identity");
            Ok(PeerId(format!("::1:{port}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_recv_times_out_quietly() {
        let mut world = WorldSocket::bind(0).unwrap();
        assert!(world.recv().unwrap().is_none());
    }

    #[test]
    fn test_world_send_recv() {
        let mut a = WorldSocket::bind(0).unwrap();
        let b = WorldSocket::bind(0).unwrap();
        let a_port = a.local_port();

        let msg = WorldMessage::Audio {
            from: b.identity().clone(),
            decoded_len: 960,
            channels: 1,
            payload: vec![9; 60],
        };
        b.send(&msg, format!("[::1]:{a_port}").parse().unwrap())
            .unwrap();

        let mut got = None;
        for _ in 0..50 {
            if let Some((m, _)) = a.recv().unwrap() {
                got = Some(m);
                break;
            }
        }
        assert_eq!(got, Some(msg));
    }
}

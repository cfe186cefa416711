//! Network error types

use std::net::SocketAddr;

use thiserror::Error;

/// Errors from the network subsystem.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("no usable local address for self identity")]
    NoLocalAddress,

    #[error("peer {0} did not answer the identity probe within {1:?}")]
    ProbeTimeout(SocketAddr, std::time::Duration),

    #[error("malformed message from {0}")]
    InvalidMessage(SocketAddr),

    #[error("a broker channel closed unexpectedly")]
    ChannelClosed,
}

pub mod csum;
pub mod fragment;
pub mod ipv4;
pub mod ipv6;
mod macros;
pub mod nat;
pub mod protocols;

pub use self::{
    csum::checksum,
    ipv4::{Ipv4Header, Ipv4Packet},
    nat::{NatError, NatTable, NatTableParam},
};

/// Initializes the logging / tracing library
///
/// ### Arguments
/// * `level` - Verbosity count (0 => WARN, 1 => INFO, 2 => DEBUG, 3+ => TRACE)
pub fn init_tracing(level: u8) {
    let tracing_level = match level {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing_level)
        .pretty()
        .init();
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("not enough data for payload, got = {0}, expected = {1}")]
    NotEnoughData(usize, usize),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("packet fragmentation required. size = {0}")]
    FragmentationRequired(usize),

    #[error("{0}")]
    Other(String),
}

//! Collection of transport layer protocols

pub mod icmp;
pub mod tcp;
pub mod udp;

pub const NET_PROTOCOL_ICMP: u8 = 1;
pub const NET_PROTOCOL_TCP: u8 = 6;
pub const NET_PROTOCOL_UDP: u8 = 17;

pub use self::{
    icmp::{IcmpMessage, IcmpType},
    tcp::{TcpFlags, TcpHeader, TcpSegment},
    udp::{UdpDatagram, UdpHeader},
};

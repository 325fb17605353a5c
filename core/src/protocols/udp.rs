//! UDP header and datagram (RFC 768)

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::{
    cast,
    csum::{ph6_checksum, ph_checksum},
    ProtocolError,
};

use super::NET_PROTOCOL_UDP;

/// UDP headers are always 8 bytes (or 64-bits)
pub const UDP_HDR_SZ: usize = 8;

mod field {
    use std::ops::Range;

    pub const SRC_PORT: Range<usize> = 0..2;
    pub const DST_PORT: Range<usize> = 2..4;
    pub const LENGTH: Range<usize> = 4..6;
    pub const CHECKSUM: Range<usize> = 6..8;
}

/// Offset of the checksum field inside a UDP header
pub const UDP_CHECKSUM_OFFSET: usize = field::CHECKSUM.start;

/// Represents a UDP header
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    /// Identifies the source (sender's) port
    pub src_port: u16,

    /// Identifies the destination (receiver's) port
    pub dst_port: u16,

    /// Length of the UDP header + UDP data
    pub length: u16,

    /// Used for error-checking on destination, optional in IPv4
    pub checksum: u16,
}

impl UdpHeader {
    /// returns the size of a UDP header
    pub const fn size() -> usize {
        UDP_HDR_SZ
    }

    /// Extracts the header fields from a slice of data
    ///
    /// The UDP header is expected to be a the start of the byte slice.  The data
    /// is expected to be in network (big) endian format.
    pub fn extract_from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::size() {
            return Err(ProtocolError::NotEnoughData(data.len(), Self::size()));
        }

        let dgram = UdpDatagram::new_unchecked(data);
        Ok(Self {
            src_port: dgram.src_port(),
            dst_port: dgram.dst_port(),
            length: dgram.len(),
            checksum: dgram.checksum(),
        })
    }

    /// Writes this header into the first 8 bytes of `buf`
    pub fn as_bytes(&self, buf: &mut [u8]) {
        let mut dgram = UdpDatagram::new_unchecked(buf);
        dgram.set_src_port(self.src_port);
        dgram.set_dst_port(self.dst_port);
        dgram.set_len(self.length);
        dgram.set_checksum(self.checksum);
    }
}

/// A view over a buffer holding a UDP datagram (header + data)
#[derive(Debug, Clone)]
pub struct UdpDatagram<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> UdpDatagram<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wraps a buffer, ensuring the whole datagram is present (see `check_size`)
    pub fn new_checked(buffer: T) -> Result<Self, ProtocolError> {
        let dgram = Self::new_unchecked(buffer);
        dgram.check_size()?;
        Ok(dgram)
    }

    /// Ensures the header fits and the length field lies between 8 and the size of
    /// the buffer
    pub fn check_size(&self) -> Result<(), ProtocolError> {
        let len = self.buffer.as_ref().len();
        if len < UDP_HDR_SZ {
            return Err(ProtocolError::NotEnoughData(len, UDP_HDR_SZ));
        }

        let dgram_len = usize::from(self.len());
        if dgram_len < UDP_HDR_SZ {
            return Err(ProtocolError::MalformedPacket(format!(
                "udp: length field too small ({dgram_len})"
            )));
        }

        if len < dgram_len {
            return Err(ProtocolError::NotEnoughData(len, dgram_len));
        }

        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn src_port(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::SRC_PORT])
    }

    pub fn dst_port(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::DST_PORT])
    }

    /// Length of header + data, as carried in the header
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::LENGTH])
    }

    pub fn checksum(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::CHECKSUM])
    }

    /// End of the datagram, bounded by the buffer
    fn end(&self) -> usize {
        usize::from(self.len()).clamp(UDP_HDR_SZ, self.buffer.as_ref().len())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[UDP_HDR_SZ..self.end()]
    }

    /// Returns true if the checksum (with IPv4 pseudo header) is valid
    ///
    /// A zero checksum means the sender did not compute one and always passes.
    pub fn check_checksum(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        if self.checksum() == 0 {
            return true;
        }

        ph_checksum(src, dst, NET_PROTOCOL_UDP, &self.buffer.as_ref()[..self.end()]) == 0
    }

    /// Returns true if the checksum (with IPv6 pseudo header) is valid
    pub fn check_checksum_v6(&self, src: Ipv6Addr, dst: Ipv6Addr) -> bool {
        ph6_checksum(src, dst, NET_PROTOCOL_UDP, &self.buffer.as_ref()[..self.end()]) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpDatagram<T> {
    pub fn set_src_port(&mut self, port: u16) {
        self.buffer.as_mut()[field::SRC_PORT].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.buffer.as_mut()[field::DST_PORT].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_len(&mut self, len: u16) {
        self.buffer.as_mut()[field::LENGTH].copy_from_slice(&len.to_be_bytes());
    }

    pub fn set_checksum(&mut self, csum: u16) {
        self.buffer.as_mut()[field::CHECKSUM].copy_from_slice(&csum.to_be_bytes());
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.end();
        &mut self.buffer.as_mut()[UDP_HDR_SZ..end]
    }

    /// Recomputes the checksum over the IPv4 pseudo header and the datagram
    ///
    /// A computed value of zero is transmitted as all ones.
    pub fn update_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        self.set_checksum(0);
        let end = self.end();
        let csum = ph_checksum(src, dst, NET_PROTOCOL_UDP, &self.buffer.as_ref()[..end]);
        self.set_checksum(match csum {
            0 => 0xFFFF,
            csum => csum,
        });
    }

    /// Recomputes the checksum over the IPv6 pseudo header and the datagram
    pub fn update_checksum_v6(&mut self, src: Ipv6Addr, dst: Ipv6Addr) {
        self.set_checksum(0);
        let end = self.end();
        let csum = ph6_checksum(src, dst, NET_PROTOCOL_UDP, &self.buffer.as_ref()[..end]);
        self.set_checksum(match csum {
            0 => 0xFFFF,
            csum => csum,
        });
    }
}

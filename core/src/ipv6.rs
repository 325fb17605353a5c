//! IPv6 header view (RFC 8200)
//!
//! Only the fixed 40-byte header is interpreted, extension headers are part of the
//! payload. Used to compute TCP/UDP checksums with the IPv6 pseudo header.

use std::net::Ipv6Addr;

use crate::{cast, ProtocolError};

/// IPv6 headers are always 40 bytes
pub const IPV6_HDR_SZ: usize = 40;

mod field {
    use std::ops::Range;

    pub const VER_TC_FLOW: Range<usize> = 0..4;
    pub const LENGTH: Range<usize> = 4..6;
    pub const NEXT_HEADER: usize = 6;
    pub const HOP_LIMIT: usize = 7;
    pub const SRC: Range<usize> = 8..24;
    pub const DST: Range<usize> = 24..40;
}

/// A view over a buffer containing an IPv6 packet
#[derive(Debug, Clone)]
pub struct Ipv6Packet<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Ipv6Packet<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wraps a buffer, ensuring it holds a complete IPv6 packet (see `check`)
    pub fn new_checked(buffer: T) -> Result<Self, ProtocolError> {
        let pkt = Self::new_unchecked(buffer);
        pkt.check()?;
        Ok(pkt)
    }

    /// Validates the fixed header and that the payload length fits in the buffer
    pub fn check(&self) -> Result<(), ProtocolError> {
        self.check_header()?;

        let data = self.buffer.as_ref();
        let total = IPV6_HDR_SZ + usize::from(self.payload_len());
        if data.len() < total {
            return Err(ProtocolError::NotEnoughData(data.len(), total));
        }

        Ok(())
    }

    /// Validates the fixed header only
    pub fn check_header(&self) -> Result<(), ProtocolError> {
        let data = self.buffer.as_ref();
        if data.len() < IPV6_HDR_SZ {
            return Err(ProtocolError::NotEnoughData(data.len(), IPV6_HDR_SZ));
        }

        if self.version() != 6 {
            return Err(ProtocolError::MalformedPacket(format!(
                "ipv6: bad version {}",
                self.version()
            )));
        }

        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    fn first_word(&self) -> u32 {
        cast!(be32, self.buffer.as_ref()[field::VER_TC_FLOW])
    }

    /// 4 bits, 6 for IPv6
    pub fn version(&self) -> u8 {
        (self.first_word() >> 28) as u8
    }

    /// 8 bits
    pub fn traffic_class(&self) -> u8 {
        (self.first_word() >> 20) as u8
    }

    /// 20 bits
    pub fn flow_label(&self) -> u32 {
        self.first_word() & 0x000F_FFFF
    }

    /// Length of everything following the fixed header
    pub fn payload_len(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::LENGTH])
    }

    pub fn next_header(&self) -> u8 {
        self.buffer.as_ref()[field::NEXT_HEADER]
    }

    pub fn hop_limit(&self) -> u8 {
        self.buffer.as_ref()[field::HOP_LIMIT]
    }

    pub fn src(&self) -> Ipv6Addr {
        Ipv6Addr::from(cast!(be128, self.buffer.as_ref()[field::SRC]))
    }

    pub fn dst(&self) -> Ipv6Addr {
        Ipv6Addr::from(cast!(be128, self.buffer.as_ref()[field::DST]))
    }

    /// Payload bytes, bounded by the payload length and the buffer
    pub fn payload(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        let end = (IPV6_HDR_SZ + usize::from(self.payload_len())).min(data.len());
        &data[IPV6_HDR_SZ..end]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv6Packet<T> {
    fn set_first_word(&mut self, word: u32) {
        self.buffer.as_mut()[field::VER_TC_FLOW].copy_from_slice(&word.to_be_bytes());
    }

    pub fn set_version(&mut self, version: u8) {
        let word = (self.first_word() & 0x0FFF_FFFF) | (u32::from(version & 0x0F) << 28);
        self.set_first_word(word);
    }

    pub fn set_traffic_class(&mut self, tc: u8) {
        let word = (self.first_word() & 0xF00F_FFFF) | (u32::from(tc) << 20);
        self.set_first_word(word);
    }

    pub fn set_flow_label(&mut self, label: u32) {
        let word = (self.first_word() & 0xFFF0_0000) | (label & 0x000F_FFFF);
        self.set_first_word(word);
    }

    pub fn set_payload_len(&mut self, len: u16) {
        self.buffer.as_mut()[field::LENGTH].copy_from_slice(&len.to_be_bytes());
    }

    pub fn set_next_header(&mut self, next: u8) {
        self.buffer.as_mut()[field::NEXT_HEADER] = next;
    }

    pub fn set_hop_limit(&mut self, limit: u8) {
        self.buffer.as_mut()[field::HOP_LIMIT] = limit;
    }

    pub fn set_src(&mut self, ip: Ipv6Addr) {
        self.buffer.as_mut()[field::SRC].copy_from_slice(&ip.octets());
    }

    pub fn set_dst(&mut self, ip: Ipv6Addr) {
        self.buffer.as_mut()[field::DST].copy_from_slice(&ip.octets());
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = IPV6_HDR_SZ + usize::from(self.payload_len());
        let data = self.buffer.as_mut();
        let end = end.min(data.len());
        &mut data[IPV6_HDR_SZ..end]
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::{Ipv6Packet, IPV6_HDR_SZ};

    #[test]
    fn first_word_fields_do_not_bleed() {
        let mut buf = [0u8; IPV6_HDR_SZ];
        let mut pkt = Ipv6Packet::new_unchecked(&mut buf[..]);
        pkt.set_version(6);
        pkt.set_traffic_class(0xAB);
        pkt.set_flow_label(0xF_EDCB);

        assert_eq!(pkt.version(), 6);
        assert_eq!(pkt.traffic_class(), 0xAB);
        assert_eq!(pkt.flow_label(), 0xF_EDCB);

        pkt.set_traffic_class(0x12);
        assert_eq!(pkt.version(), 6);
        assert_eq!(pkt.flow_label(), 0xF_EDCB);
        assert_eq!(buf[0..4], [0x61, 0x2F, 0xED, 0xCB]);
    }

    #[test]
    fn check_payload_length() {
        let mut buf = vec![0u8; IPV6_HDR_SZ + 8];
        let mut pkt = Ipv6Packet::new_unchecked(&mut buf[..]);
        pkt.set_version(6);
        pkt.set_payload_len(8);
        pkt.set_next_header(17);
        pkt.set_hop_limit(64);
        pkt.set_src(Ipv6Addr::LOCALHOST);
        pkt.set_dst("2001:db8::1".parse().unwrap());

        let pkt = Ipv6Packet::new_checked(&buf[..]).unwrap();
        assert_eq!(pkt.payload().len(), 8);
        assert_eq!(pkt.src(), Ipv6Addr::LOCALHOST);
        assert_eq!(pkt.next_header(), 17);

        assert!(Ipv6Packet::new_checked(&buf[..IPV6_HDR_SZ + 4]).is_err());
    }

    #[test]
    fn reject_ipv4_buffer() {
        let mut buf = [0u8; IPV6_HDR_SZ];
        buf[0] = 0x45;
        assert!(Ipv6Packet::new_checked(&buf[..]).is_err());
    }
}

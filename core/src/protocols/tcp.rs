//! TCP header and segment (RFC 793, RFC 3168, RFC 3540)

use std::{
    fmt::Display,
    net::{Ipv4Addr, Ipv6Addr},
};

use bitflags::bitflags;

use crate::{
    cast,
    csum::{ph6_checksum, ph_checksum},
    ProtocolError,
};

use super::NET_PROTOCOL_TCP;

/// TCP headers are at least 20 bytes
pub const TCP_MIN_HDR_SZ: usize = 20;

mod field {
    use std::ops::Range;

    pub const SRC_PORT: Range<usize> = 0..2;
    pub const DST_PORT: Range<usize> = 2..4;
    pub const SEQ_NUM: Range<usize> = 4..8;
    pub const ACK_NUM: Range<usize> = 8..12;
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WINDOW: Range<usize> = 14..16;
    pub const CHECKSUM: Range<usize> = 16..18;
    pub const URGENT: Range<usize> = 18..20;
}

/// Offset of the checksum field inside a TCP header
pub const TCP_CHECKSUM_OFFSET: usize = field::CHECKSUM.start;

/// Represents a TCP header
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    /// Identifies the source (sender's) port
    pub src_port: u16,

    /// Identifies the destination (receiver's) port
    pub dst_port: u16,

    /// Sequence Number
    /// - If SYN is set, this is the initial sequence number
    /// - If SYN is unset, this is the accumulated sequence number
    pub seq_num: u32,

    /// Acknowledgment number (if the ACK flag is set)
    pub ack_num: u32,

    /// Size of the TCP header in DWORDs, minimum size is 5, max is 15
    pub data_offset: u8,

    /// Various TCP control flags
    pub flags: TcpFlags,

    /// Size of the receive window
    pub window_size: u16,

    /// Used for error-checking on destination, incorporates the IP pseudo-header
    pub checksum: u16,

    /// If URG is set, offset from sequence number indiciating the last urgent data byte
    pub urgent_pointer: u16,
}

bitflags! {
    /// Represents the flags that can be set on a TCP packet
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TcpFlags: u8 {
        /// Last packet from sender
        const FIN = 0b00000001;

        /// SYNchronize sequence numbers (first packet from sender)
        const SYN = 0b00000010;

        /// Reset the connection
        const RST = 0b00000100;

        /// Push function -- push buffered data to the receiving application
        const PSH = 0b00001000;

        /// Acknowledgment field is significant (aka contains the seq_num of the last recv'd packet)
        const ACK = 0b00010000;

        /// Urgent pointer field is significant (set)
        const URG = 0b00100000;

        /// ECN-Echo, varies based on SYN flag:
        /// - SYN is set (1): TCP peer is ECN capable
        /// - SYN is unset (0): possible network congestion
        const ECE = 0b01000000;

        /// Congestion Window Reduced
        /// Set by sending host to indicate it received a TCP segment with the ECE flag set
        const CWR = 0b10000000;
    }
}

impl TcpHeader {
    /// returns the size of a TCP header
    pub const fn min_size() -> usize {
        TCP_MIN_HDR_SZ
    }

    /// Extracts the header fields from a slice of data
    ///
    /// The TCP header is expected to be a the start of the byte slice.  The data
    /// is expected to be in network (big) endian format.
    pub fn extract_from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        let seg = TcpSegment::new_checked(data)?;

        Ok(Self {
            src_port: seg.src_port(),
            dst_port: seg.dst_port(),
            seq_num: seg.seq_num(),
            ack_num: seg.ack_num(),
            data_offset: seg.header_len(),
            flags: seg.flags(),
            window_size: seg.window_size(),
            checksum: seg.checksum(),
            urgent_pointer: seg.urgent_pointer(),
        })
    }

    /// Returns the size of the header based on the data_offset field
    pub fn size(&self) -> usize {
        usize::from(self.data_offset) * 4
    }
}

macro_rules! flag_append {
    ($str:expr, $flags:expr, $flag:expr, $set:expr, $unset:expr) => {
        if $flags.contains($flag) {
            $str.push($set);
        } else {
            $str.push($unset);
        }
    };
}

impl Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut flags = String::from("");
        flag_append!(flags, self, TcpFlags::FIN, 'F', '_');
        flag_append!(flags, self, TcpFlags::SYN, 'S', '_');
        flag_append!(flags, self, TcpFlags::RST, 'R', '_');
        flag_append!(flags, self, TcpFlags::PSH, 'P', '_');
        flag_append!(flags, self, TcpFlags::ACK, 'A', '_');
        flag_append!(flags, self, TcpFlags::URG, 'U', '_');
        flag_append!(flags, self, TcpFlags::ECE, 'E', '_');
        flag_append!(flags, self, TcpFlags::CWR, 'C', '_');

        write!(f, "{flags}")
    }
}

/// A view over a buffer holding a TCP segment (header + data)
///
/// The buffer is expected to end where the segment ends, so checksums are computed
/// over the whole buffer.
#[derive(Debug, Clone)]
pub struct TcpSegment<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> TcpSegment<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wraps a buffer, ensuring the header is present (see `check_size`)
    pub fn new_checked(buffer: T) -> Result<Self, ProtocolError> {
        let seg = Self::new_unchecked(buffer);
        seg.check_size()?;
        Ok(seg)
    }

    /// Ensures the fixed header fits and the data offset describes a header
    /// between 20 bytes and the size of the buffer
    pub fn check_size(&self) -> Result<(), ProtocolError> {
        let len = self.buffer.as_ref().len();
        if len < TCP_MIN_HDR_SZ {
            return Err(ProtocolError::NotEnoughData(len, TCP_MIN_HDR_SZ));
        }

        let hdr_sz = self.header_size();
        if hdr_sz < TCP_MIN_HDR_SZ {
            return Err(ProtocolError::MalformedPacket(format!(
                "tcp: data offset too small ({hdr_sz} bytes)"
            )));
        }

        if len < hdr_sz {
            return Err(ProtocolError::NotEnoughData(len, hdr_sz));
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

    pub fn seq_num(&self) -> u32 {
        cast!(be32, self.buffer.as_ref()[field::SEQ_NUM])
    }

    pub fn ack_num(&self) -> u32 {
        cast!(be32, self.buffer.as_ref()[field::ACK_NUM])
    }

    /// 4 bits, size of the header in 32-bit words
    pub fn header_len(&self) -> u8 {
        self.buffer.as_ref()[field::DATA_OFFSET] >> 4
    }

    /// Size of the header in bytes
    pub fn header_size(&self) -> usize {
        usize::from(self.header_len()) * 4
    }

    /// ECN-nonce concealment protection (RFC 3540)
    pub fn is_ns(&self) -> bool {
        self.buffer.as_ref()[field::DATA_OFFSET] & 0x01 != 0
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_truncate(self.buffer.as_ref()[field::FLAGS])
    }

    pub fn is_cwr(&self) -> bool {
        self.flags().contains(TcpFlags::CWR)
    }

    pub fn is_ece(&self) -> bool {
        self.flags().contains(TcpFlags::ECE)
    }

    pub fn is_urg(&self) -> bool {
        self.flags().contains(TcpFlags::URG)
    }

    pub fn is_ack(&self) -> bool {
        self.flags().contains(TcpFlags::ACK)
    }

    pub fn is_psh(&self) -> bool {
        self.flags().contains(TcpFlags::PSH)
    }

    pub fn is_rst(&self) -> bool {
        self.flags().contains(TcpFlags::RST)
    }

    pub fn is_syn(&self) -> bool {
        self.flags().contains(TcpFlags::SYN)
    }

    pub fn is_fin(&self) -> bool {
        self.flags().contains(TcpFlags::FIN)
    }

    pub fn window_size(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::WINDOW])
    }

    pub fn checksum(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::CHECKSUM])
    }

    pub fn urgent_pointer(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::URGENT])
    }

    pub fn options(&self) -> &[u8] {
        &self.buffer.as_ref()[TCP_MIN_HDR_SZ..self.header_size()]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.header_size()..]
    }

    /// Returns true if the checksum (with IPv4 pseudo header) is valid
    pub fn check_checksum(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        ph_checksum(src, dst, NET_PROTOCOL_TCP, self.buffer.as_ref()) == 0
    }

    /// Returns true if the checksum (with IPv6 pseudo header) is valid
    pub fn check_checksum_v6(&self, src: Ipv6Addr, dst: Ipv6Addr) -> bool {
        ph6_checksum(src, dst, NET_PROTOCOL_TCP, self.buffer.as_ref()) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpSegment<T> {
    pub fn set_src_port(&mut self, port: u16) {
        self.buffer.as_mut()[field::SRC_PORT].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.buffer.as_mut()[field::DST_PORT].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_seq_num(&mut self, num: u32) {
        self.buffer.as_mut()[field::SEQ_NUM].copy_from_slice(&num.to_be_bytes());
    }

    pub fn set_ack_num(&mut self, num: u32) {
        self.buffer.as_mut()[field::ACK_NUM].copy_from_slice(&num.to_be_bytes());
    }

    pub fn set_header_len(&mut self, len: u8) {
        let b = &mut self.buffer.as_mut()[field::DATA_OFFSET];
        *b = (*b & 0x0F) | (len << 4);
    }

    pub fn set_ns(&mut self, ns: bool) {
        let b = &mut self.buffer.as_mut()[field::DATA_OFFSET];
        *b = (*b & 0xFE) | u8::from(ns);
    }

    pub fn set_flags(&mut self, flags: TcpFlags) {
        self.buffer.as_mut()[field::FLAGS] = flags.bits();
    }

    pub fn set_window_size(&mut self, size: u16) {
        self.buffer.as_mut()[field::WINDOW].copy_from_slice(&size.to_be_bytes());
    }

    pub fn set_checksum(&mut self, csum: u16) {
        self.buffer.as_mut()[field::CHECKSUM].copy_from_slice(&csum.to_be_bytes());
    }

    pub fn set_urgent_pointer(&mut self, ptr: u16) {
        self.buffer.as_mut()[field::URGENT].copy_from_slice(&ptr.to_be_bytes());
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_size();
        &mut self.buffer.as_mut()[start..]
    }

    /// Recomputes the checksum over the IPv4 pseudo header and the whole segment
    pub fn update_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        self.set_checksum(0);
        let csum = ph_checksum(src, dst, NET_PROTOCOL_TCP, self.buffer.as_ref());
        self.set_checksum(csum);
    }

    /// Recomputes the checksum over the IPv6 pseudo header and the whole segment
    pub fn update_checksum_v6(&mut self, src: Ipv6Addr, dst: Ipv6Addr) {
        self.set_checksum(0);
        let csum = ph6_checksum(src, dst, NET_PROTOCOL_TCP, self.buffer.as_ref());
        self.set_checksum(csum);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::{TcpFlags, TcpHeader, TcpSegment};

    // TCP header (with 12 bytes of options) + "GET" from a captured HTTP request
    const SEG: [u8; 35] = [
        0x88, 0xce, 0x00, 0x50, 0xe1, 0xff, 0xf9, 0x7d, 0x3a, 0x1b, 0xca, 0x1e, 0x80, 0x18, 0x03,
        0xec, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x08, 0x0a, 0x0b, 0xeb, 0x07, 0x19, 0x71, 0xcb,
        0x4d, 0xf2, 0x47, 0x45, 0x54,
    ];

    #[test]
    fn parse_header() {
        let hdr = TcpHeader::extract_from_slice(&SEG).unwrap();
        assert_eq!(hdr.src_port, 35022);
        assert_eq!(hdr.dst_port, 80);
        assert_eq!(hdr.size(), 32);
        assert_eq!(hdr.flags, TcpFlags::PSH | TcpFlags::ACK);
        assert_eq!(hdr.flags.to_string(), "___PA___");
        assert_eq!(hdr.window_size, 0x03ec);
    }

    #[test]
    fn view_options_and_payload() {
        let seg = TcpSegment::new_checked(&SEG[..]).unwrap();
        assert_eq!(seg.options().len(), 12);
        assert_eq!(seg.payload(), b"GET");
        assert!(seg.is_ack() && seg.is_psh() && !seg.is_syn());
        assert!(!seg.is_ns());
    }

    #[test]
    fn check_size_rejects_bad_offsets() {
        assert!(TcpSegment::new_checked(&SEG[..19]).is_err());

        // data offset claims 60 bytes
        let mut seg = SEG;
        seg[12] = 0xF0;
        assert!(TcpSegment::new_checked(&seg[..]).is_err());

        // data offset smaller than the fixed header
        seg[12] = 0x40;
        assert!(TcpSegment::new_checked(&seg[..]).is_err());
    }

    #[test]
    fn ns_bit_is_independent_of_offset() {
        let mut seg = SEG;
        let mut view = TcpSegment::new_unchecked(&mut seg[..]);
        view.set_ns(true);
        assert!(view.is_ns());
        assert_eq!(view.header_len(), 8);
        view.set_header_len(5);
        assert!(view.is_ns());
        assert_eq!(seg[12], 0x51);
    }

    #[test]
    fn checksum_round_trip_v4() {
        let src = Ipv4Addr::new(10, 67, 213, 100);
        let dst = Ipv4Addr::new(34, 160, 111, 145);

        let mut seg = SEG;
        let mut view = TcpSegment::new_unchecked(&mut seg[..]);
        view.update_checksum(src, dst);
        assert!(view.check_checksum(src, dst));
        assert!(!view.check_checksum(Ipv4Addr::new(10, 67, 213, 101), dst));
    }

    #[test]
    fn checksum_round_trip_v6() {
        let src: Ipv6Addr = "2001:db8::10".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::20".parse().unwrap();

        let mut seg = SEG;
        let mut view = TcpSegment::new_unchecked(&mut seg[..]);
        view.update_checksum_v6(src, dst);
        assert!(view.check_checksum_v6(src, dst));
        assert!(!view.check_checksum_v6(dst, "2001:db8::30".parse().unwrap()));
    }
}

//! IPv4 related structures
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |   DSCP    |ECN|          Total Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification        |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Time to Live |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options                    |    Padding    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::{fmt::Display, net::Ipv4Addr};

use bitflags::bitflags;
use rand::Rng;

use crate::{cast, checksum, ProtocolError};

/// A DWORD is a "double word", or 4 bytes (32-bits)
const DWORD_SIZE: usize = 4;

/// Size of an IPv4 header without any options
pub const IPV4_HDR_SZ: usize = 20;

mod field {
    use std::ops::Range;

    pub const VER_IHL: usize = 0;
    pub const TOS: usize = 1;
    pub const LENGTH: Range<usize> = 2..4;
    pub const IDENT: Range<usize> = 4..6;
    pub const FLAGS: usize = 6;
    pub const FRAG: Range<usize> = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Range<usize> = 10..12;
    pub const SRC: Range<usize> = 12..16;
    pub const DST: Range<usize> = 16..20;
}

bitflags! {
    /// Represents the flags that can be set on a IPv4 packet
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Ipv4Flags: u8 {
        const MoreFragments = 0b001;
        const DontFragment  = 0b010;
        const Reserved = 0b100;
    }
}

impl Display for Ipv4Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}", self.bits())
    }
}

/// Uniquely identifies the fragments belonging to one datagram (RFC 791)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4PacketIdentifier {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub identification: u16,
    pub protocol: u8,
}

/// Represents the Ipv4 header
///
/// For more information, view: https://en.wikipedia.org/wiki/IPv4
#[derive(Debug, Clone)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub length: u16,
    pub id: u16,
    pub flags: Ipv4Flags,

    /// Offset of this fragment, in units of 8 octets
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Creates a new IPv4 header from the supplied values
    ///
    /// ### Arguments
    /// * `src` - Source address
    /// * `dst` - Destination address
    /// * `protocol` - Next header protocol (e.g., TCP, UDP, etc)
    /// * `length` - Length of the expected payload data
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> Self {
        let mut rng = rand::thread_rng();

        Self {
            version: 4,
            ihl: 5,
            tos: 0,
            length: length + IPV4_HDR_SZ as u16,
            id: rng.gen(),
            flags: Ipv4Flags::DontFragment,
            frag_offset: 0,
            ttl: 64,
            protocol,
            checksum: 0,
            src,
            dst,
        }
    }

    /// Extracts the IPv4 header from a slice of bytes, or returns an error
    /// if the supplied buffer is too small
    ///
    /// ### Arguments
    /// * `hdr` - Buffer containing ipv4 header
    pub fn extract_from_slice(hdr: &[u8]) -> Result<Self, ProtocolError> {
        let pkt = Ipv4Packet::new_unchecked(hdr);
        pkt.check_header()?;

        Ok(Self {
            version: pkt.version(),
            ihl: pkt.header_len(),
            tos: pkt.tos(),
            length: pkt.total_len(),
            id: pkt.ident(),
            flags: pkt.flags(),
            frag_offset: pkt.frag_offset(),
            ttl: pkt.ttl(),
            protocol: pkt.protocol(),
            checksum: pkt.checksum(),
            src: pkt.src(),
            dst: pkt.dst(),
        })
    }

    /// Returns the length, in bytes, of the header
    pub fn header_length(&self) -> usize {
        usize::from(self.ihl) * DWORD_SIZE
    }

    /// Writes this header into the first 20 bytes of `rpkt`
    ///
    /// Options are not emitted (the IHL is always written as 5) and the checksum
    /// is computed over the written bytes
    pub fn as_bytes(&self, rpkt: &mut [u8]) {
        let flags = u16::from(self.flags.bits());
        let flags_frag = (flags << 13) | (self.frag_offset & 0x1FFF);

        rpkt[field::VER_IHL] = (self.version << 4) | 5; // Generally 0x45
        rpkt[field::TOS] = self.tos;
        rpkt[field::LENGTH].copy_from_slice(&self.length.to_be_bytes());
        rpkt[field::IDENT].copy_from_slice(&self.id.to_be_bytes());
        rpkt[field::FRAG].copy_from_slice(&flags_frag.to_be_bytes());
        rpkt[field::TTL] = self.ttl;
        rpkt[field::PROTOCOL] = self.protocol;
        rpkt[field::CHECKSUM].copy_from_slice(&[0x00, 0x00]); // clear checksum
        rpkt[field::SRC].copy_from_slice(&self.src.octets());
        rpkt[field::DST].copy_from_slice(&self.dst.octets());

        let csum = checksum(&rpkt[0..IPV4_HDR_SZ]);
        rpkt[field::CHECKSUM].copy_from_slice(&csum.to_be_bytes());
    }

    /// Returns this header an array of bytes
    pub fn into_bytes(self) -> [u8; IPV4_HDR_SZ] {
        let mut buf = [0u8; IPV4_HDR_SZ];
        self.as_bytes(&mut buf);
        buf
    }
}

/// A view over a buffer containing an IPv4 packet
///
/// The getters/setters read and write the wire format in place. Use `new_checked`
/// to validate the buffer first; accessors on an unchecked view panic if the buffer
/// is shorter than the field being accessed.
#[derive(Debug, Clone)]
pub struct Ipv4Packet<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Ipv4Packet<T> {
    /// Wraps a buffer without validating it
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wraps a buffer, ensuring it holds a complete IPv4 packet (see `check`)
    pub fn new_checked(buffer: T) -> Result<Self, ProtocolError> {
        let pkt = Self::new_unchecked(buffer);
        pkt.check()?;
        Ok(pkt)
    }

    /// Validates the header only: enough bytes for the fixed header, version 4
    /// and a header length that fits inside the buffer
    ///
    /// The total length field is not compared against the buffer, which makes this
    /// suitable for the truncated datagram quoted inside ICMP error messages.
    pub fn check_header(&self) -> Result<(), ProtocolError> {
        let data = self.buffer.as_ref();
        if data.len() < IPV4_HDR_SZ {
            return Err(ProtocolError::NotEnoughData(data.len(), IPV4_HDR_SZ));
        }

        if self.version() != 4 {
            return Err(ProtocolError::MalformedPacket(format!(
                "ipv4: bad version {}",
                self.version()
            )));
        }

        let hdr_sz = self.header_size();
        if hdr_sz < IPV4_HDR_SZ {
            return Err(ProtocolError::MalformedPacket(format!(
                "ipv4: header length too small ({hdr_sz} bytes)"
            )));
        }

        if data.len() < hdr_sz {
            return Err(ProtocolError::NotEnoughData(data.len(), hdr_sz));
        }

        Ok(())
    }

    /// Validates the header (see `check_header`) and ensures the declared total
    /// length covers the header and is present in the buffer
    pub fn check(&self) -> Result<(), ProtocolError> {
        self.check_header()?;

        let data = self.buffer.as_ref();
        let total = usize::from(self.total_len());
        if total < self.header_size() {
            return Err(ProtocolError::MalformedPacket(format!(
                "ipv4: total length ({total}) shorter than header ({})",
                self.header_size()
            )));
        }

        if data.len() < total {
            return Err(ProtocolError::NotEnoughData(data.len(), total));
        }

        Ok(())
    }

    /// Returns the underlying buffer
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// 4 bits, 4 for IPv4
    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VER_IHL] >> 4
    }

    /// 4 bits, count of 32-bit words in the header (including options)
    pub fn header_len(&self) -> u8 {
        self.buffer.as_ref()[field::VER_IHL] & 0x0F
    }

    /// Header size, in bytes
    pub fn header_size(&self) -> usize {
        usize::from(self.header_len()) * DWORD_SIZE
    }

    /// Type of service byte (DSCP + ECN)
    pub fn tos(&self) -> u8 {
        self.buffer.as_ref()[field::TOS]
    }

    /// 6 bits, differentiated services code point (RFC 2474)
    pub fn dscp(&self) -> u8 {
        self.tos() >> 2
    }

    /// 2 bits, explicit congestion notification (RFC 3168)
    pub fn ecn(&self) -> u8 {
        self.tos() & 0x03
    }

    /// Total size of the packet (header + payload), in bytes
    pub fn total_len(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::LENGTH])
    }

    /// Returns the unique identifer for this packet
    pub fn ident(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::IDENT])
    }

    /// Returns the flags set on this packet
    pub fn flags(&self) -> Ipv4Flags {
        Ipv4Flags::from_bits_truncate(self.buffer.as_ref()[field::FLAGS] >> 5)
    }

    /// Don't Fragment
    pub fn is_df(&self) -> bool {
        self.buffer.as_ref()[field::FLAGS] & 0x40 != 0
    }

    /// More Fragments (false on the last fragment)
    pub fn is_mf(&self) -> bool {
        self.buffer.as_ref()[field::FLAGS] & 0x20 != 0
    }

    /// 13 bits, fragment offset measured in units of 8 octets
    pub fn frag_offset(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::FRAG]) & 0x1FFF
    }

    /// True if this packet is one piece of a fragmented datagram
    pub fn is_fragment(&self) -> bool {
        self.is_mf() || self.frag_offset() != 0
    }

    /// Time to live
    pub fn ttl(&self) -> u8 {
        self.buffer.as_ref()[field::TTL]
    }

    /// Returns the next layer (i.e., transport) layer protocol
    pub fn protocol(&self) -> u8 {
        self.buffer.as_ref()[field::PROTOCOL]
    }

    /// Header checksum as stored in the packet
    pub fn checksum(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::CHECKSUM])
    }

    /// Returns the source ip address
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(cast!(be32, self.buffer.as_ref()[field::SRC]))
    }

    /// Returns the destination ip address
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(cast!(be32, self.buffer.as_ref()[field::DST]))
    }

    /// Returns the fragment reassembly key for this packet
    pub fn identifier(&self) -> Ipv4PacketIdentifier {
        Ipv4PacketIdentifier {
            source: self.src(),
            destination: self.dst(),
            identification: self.ident(),
            protocol: self.protocol(),
        }
    }

    /// Returns the header bytes, including options
    pub fn header(&self) -> &[u8] {
        &self.buffer.as_ref()[..self.header_size()]
    }

    /// Returns the option bytes (empty if IHL is 5)
    pub fn options(&self) -> &[u8] {
        &self.buffer.as_ref()[IPV4_HDR_SZ..self.header_size()]
    }

    /// Returns the slice of data containing the packet's payload (aka the transport
    /// layer data)
    ///
    /// The payload ends at the declared total length, or at the end of the buffer if
    /// the packet was truncated.
    pub fn payload(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        let start = self.header_size();
        let end = usize::from(self.total_len()).clamp(start, data.len());
        &data[start..end]
    }

    /// Returns true if the header checksum is valid
    pub fn check_checksum(&self) -> bool {
        checksum(self.header()) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv4Packet<T> {
    pub fn set_version(&mut self, version: u8) {
        let b = &mut self.buffer.as_mut()[field::VER_IHL];
        *b = (*b & 0x0F) | (version << 4);
    }

    pub fn set_header_len(&mut self, len: u8) {
        let b = &mut self.buffer.as_mut()[field::VER_IHL];
        *b = (*b & 0xF0) | (len & 0x0F);
    }

    pub fn set_tos(&mut self, tos: u8) {
        self.buffer.as_mut()[field::TOS] = tos;
    }

    pub fn set_dscp(&mut self, dscp: u8) {
        let tos = (self.tos() & 0x03) | ((dscp & 0x3F) << 2);
        self.set_tos(tos);
    }

    pub fn set_ecn(&mut self, ecn: u8) {
        let tos = (self.tos() & 0xFC) | (ecn & 0x03);
        self.set_tos(tos);
    }

    pub fn set_total_len(&mut self, len: u16) {
        self.buffer.as_mut()[field::LENGTH].copy_from_slice(&len.to_be_bytes());
    }

    pub fn set_ident(&mut self, id: u16) {
        self.buffer.as_mut()[field::IDENT].copy_from_slice(&id.to_be_bytes());
    }

    pub fn set_df(&mut self, df: bool) {
        let b = &mut self.buffer.as_mut()[field::FLAGS];
        *b = (*b & 0xBF) | if df { 0x40 } else { 0 };
    }

    pub fn set_mf(&mut self, mf: bool) {
        let b = &mut self.buffer.as_mut()[field::FLAGS];
        *b = (*b & 0xDF) | if mf { 0x20 } else { 0 };
    }

    /// Sets the 13-bit fragment offset (units of 8 octets), preserving the flags
    pub fn set_frag_offset(&mut self, offset: u16) {
        let data = self.buffer.as_mut();
        data[field::FLAGS] = (data[field::FLAGS] & 0xE0) | ((offset >> 8) as u8 & 0x1F);
        data[field::FLAGS + 1] = offset as u8;
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.buffer.as_mut()[field::TTL] = ttl;
    }

    pub fn set_protocol(&mut self, protocol: u8) {
        self.buffer.as_mut()[field::PROTOCOL] = protocol;
    }

    pub fn set_checksum(&mut self, csum: u16) {
        self.buffer.as_mut()[field::CHECKSUM].copy_from_slice(&csum.to_be_bytes());
    }

    pub fn set_src(&mut self, ip: Ipv4Addr) {
        self.buffer.as_mut()[field::SRC].copy_from_slice(&ip.octets());
    }

    pub fn set_dst(&mut self, ip: Ipv4Addr) {
        self.buffer.as_mut()[field::DST].copy_from_slice(&ip.octets());
    }

    /// Mutable access to the payload (see `payload`)
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_size();
        let total = usize::from(self.total_len());
        let data = self.buffer.as_mut();
        let end = total.clamp(start, data.len());
        &mut data[start..end]
    }

    /// Recomputes the header checksum over the header bytes (including options)
    pub fn update_checksum(&mut self) {
        self.set_checksum(0);
        let csum = checksum(self.header());
        self.set_checksum(csum);
    }
}

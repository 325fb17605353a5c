//! ICMP message view (RFC 792, RFC 950, RFC 1191)

use std::{fmt::Display, net::Ipv4Addr};

use crate::{cast, checksum, ProtocolError};

/// Type, code, checksum and the 4-byte rest-of-header
pub const ICMP_HDR_SZ: usize = 8;

mod field {
    use std::ops::Range;

    pub const TYPE: usize = 0;
    pub const CODE: usize = 1;
    pub const CHECKSUM: Range<usize> = 2..4;

    // echo / timestamp / address mask
    pub const IDENTIFIER: Range<usize> = 4..6;
    pub const SEQUENCE: Range<usize> = 6..8;

    pub const GATEWAY: Range<usize> = 4..8;
    pub const POINTER: usize = 4;
    pub const NEXT_HOP_MTU: Range<usize> = 6..8;
}

/// Offset of the checksum field inside an ICMP header
pub const ICMP_CHECKSUM_OFFSET: usize = field::CHECKSUM.start;

/// Offset of the echo identifier / sequence number pair inside an ICMP header
pub const ICMP_ECHO_OFFSET: usize = field::IDENTIFIER.start;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpType {
    EchoReply,
    DestinationUnreachable,
    Redirect,
    Echo,
    TimeExceeded,
    ParameterProblem,
    Timestamp,
    TimestampReply,
    AddressMaskRequest,
    AddressMaskReply,
    Other(u8),
}

impl IcmpType {
    /// Error messages quote the offending datagram after the header
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::DestinationUnreachable
                | Self::Redirect
                | Self::TimeExceeded
                | Self::ParameterProblem
        )
    }
}

impl From<u8> for IcmpType {
    fn from(ty: u8) -> Self {
        match ty {
            0 => Self::EchoReply,
            3 => Self::DestinationUnreachable,
            5 => Self::Redirect,
            8 => Self::Echo,
            11 => Self::TimeExceeded,
            12 => Self::ParameterProblem,
            13 => Self::Timestamp,
            14 => Self::TimestampReply,
            17 => Self::AddressMaskRequest,
            18 => Self::AddressMaskReply,
            ty => Self::Other(ty),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(ty: IcmpType) -> Self {
        match ty {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::Redirect => 5,
            IcmpType::Echo => 8,
            IcmpType::TimeExceeded => 11,
            IcmpType::ParameterProblem => 12,
            IcmpType::Timestamp => 13,
            IcmpType::TimestampReply => 14,
            IcmpType::AddressMaskRequest => 17,
            IcmpType::AddressMaskReply => 18,
            IcmpType::Other(ty) => ty,
        }
    }
}

impl Display for IcmpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EchoReply => write!(f, "echo-reply"),
            Self::DestinationUnreachable => write!(f, "dest-unreachable"),
            Self::Redirect => write!(f, "redirect"),
            Self::Echo => write!(f, "echo"),
            Self::TimeExceeded => write!(f, "time-exceeded"),
            Self::ParameterProblem => write!(f, "param-problem"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::TimestampReply => write!(f, "timestamp-reply"),
            Self::AddressMaskRequest => write!(f, "mask-request"),
            Self::AddressMaskReply => write!(f, "mask-reply"),
            Self::Other(ty) => write!(f, "type-{ty}"),
        }
    }
}

/// A view over a buffer holding an ICMP message
///
/// The rest-of-header accessors don't look at the type, callers pick the ones
/// that make sense for the message they hold.
#[derive(Debug, Clone)]
pub struct IcmpMessage<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> IcmpMessage<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Self, ProtocolError> {
        let msg = Self::new_unchecked(buffer);
        msg.check()?;
        Ok(msg)
    }

    pub fn check(&self) -> Result<(), ProtocolError> {
        let len = self.buffer.as_ref().len();
        match len < ICMP_HDR_SZ {
            true => Err(ProtocolError::NotEnoughData(len, ICMP_HDR_SZ)),
            false => Ok(()),
        }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn msg_type(&self) -> IcmpType {
        IcmpType::from(self.buffer.as_ref()[field::TYPE])
    }

    pub fn code(&self) -> u8 {
        self.buffer.as_ref()[field::CODE]
    }

    pub fn checksum(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::CHECKSUM])
    }

    pub fn echo_identifier(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::IDENTIFIER])
    }

    pub fn echo_sequence_number(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::SEQUENCE])
    }

    pub fn redirect_gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(cast!(be32, self.buffer.as_ref()[field::GATEWAY]))
    }

    pub fn parameter_problem_pointer(&self) -> u8 {
        self.buffer.as_ref()[field::POINTER]
    }

    pub fn timestamp_identifier(&self) -> u16 {
        self.echo_identifier()
    }

    pub fn timestamp_sequence_number(&self) -> u16 {
        self.echo_sequence_number()
    }

    pub fn address_mask_identifier(&self) -> u16 {
        self.echo_identifier()
    }

    pub fn address_mask_sequence_number(&self) -> u16 {
        self.echo_sequence_number()
    }

    /// Path MTU discovery (dest-unreachable, code 4)
    pub fn next_hop_mtu(&self) -> u16 {
        cast!(be16, self.buffer.as_ref()[field::NEXT_HOP_MTU])
    }

    /// Everything after the 8-byte header (echo data, or the quoted datagram of an
    /// error message)
    pub fn content(&self) -> &[u8] {
        &self.buffer.as_ref()[ICMP_HDR_SZ..]
    }

    pub fn check_checksum(&self) -> bool {
        checksum(self.buffer.as_ref()) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IcmpMessage<T> {
    pub fn set_msg_type(&mut self, ty: IcmpType) {
        self.buffer.as_mut()[field::TYPE] = ty.into();
    }

    pub fn set_code(&mut self, code: u8) {
        self.buffer.as_mut()[field::CODE] = code;
    }

    pub fn set_checksum(&mut self, csum: u16) {
        self.buffer.as_mut()[field::CHECKSUM].copy_from_slice(&csum.to_be_bytes());
    }

    pub fn set_echo_identifier(&mut self, id: u16) {
        self.buffer.as_mut()[field::IDENTIFIER].copy_from_slice(&id.to_be_bytes());
    }

    pub fn set_echo_sequence_number(&mut self, seq: u16) {
        self.buffer.as_mut()[field::SEQUENCE].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn set_redirect_gateway(&mut self, gw: Ipv4Addr) {
        self.buffer.as_mut()[field::GATEWAY].copy_from_slice(&gw.octets());
    }

    pub fn set_parameter_problem_pointer(&mut self, ptr: u8) {
        self.buffer.as_mut()[field::POINTER] = ptr;
    }

    pub fn set_timestamp_identifier(&mut self, id: u16) {
        self.set_echo_identifier(id);
    }

    pub fn set_timestamp_sequence_number(&mut self, seq: u16) {
        self.set_echo_sequence_number(seq);
    }

    pub fn set_address_mask_identifier(&mut self, id: u16) {
        self.set_echo_identifier(id);
    }

    pub fn set_address_mask_sequence_number(&mut self, seq: u16) {
        self.set_echo_sequence_number(seq);
    }

    pub fn set_next_hop_mtu(&mut self, mtu: u16) {
        self.buffer.as_mut()[field::NEXT_HOP_MTU].copy_from_slice(&mtu.to_be_bytes());
    }

    pub fn content_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[ICMP_HDR_SZ..]
    }

    /// Recomputes the checksum over the whole message
    pub fn update_checksum(&mut self) {
        self.set_checksum(0);
        let csum = checksum(self.buffer.as_ref());
        self.set_checksum(csum);
    }
}

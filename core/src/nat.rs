//! NAT table implementation
//!
//! Rewrites IPv4 datagrams in place between an internal network and a single
//! external address. TCP and UDP flows are multiplexed over a range of external
//! ports, ICMP echo probes over a range of sequence numbers under one fixed
//! identifier.

mod mapping;

use std::{collections::HashMap, net::Ipv4Addr, ops::Range};

use serde::{Deserialize, Serialize};

use crate::{
    cast,
    csum::{adjust, updated_checksum},
    protocols::{
        icmp::{IcmpMessage, IcmpType, ICMP_CHECKSUM_OFFSET, ICMP_ECHO_OFFSET, ICMP_HDR_SZ},
        tcp::{TcpSegment, TCP_CHECKSUM_OFFSET},
        udp::{UdpDatagram, UDP_CHECKSUM_OFFSET, UDP_HDR_SZ},
        NET_PROTOCOL_ICMP, NET_PROTOCOL_TCP, NET_PROTOCOL_UDP,
    },
    Ipv4Packet, ProtocolError,
};

pub use self::mapping::{NatTableMapping, NatTablePort};

/// Number of distinct IPv4 identification values
const FRAGMENT_TABLE_SZ: usize = 1 << 16;

/// Bytes of the offending datagram's payload an ICMP error quotes (RFC 792)
const ICMP_QUOTED_PAYLOAD_SZ: usize = 8;

/// Port fields shared by the TCP and UDP headers
const SRC_PORT: Range<usize> = 0..2;
const DST_PORT: Range<usize> = 2..4;

/// Reasons a packet could not be translated. The packet must be dropped.
#[derive(thiserror::Error, Debug)]
pub enum NatError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),

    #[error("no mapping found for packet")]
    NoMapping,

    #[error("port mapping table is full")]
    TableFull,

    #[error("packet not addressed to nat address (dst = {0})")]
    NotAddressed(Ipv4Addr),

    #[error("nat table not initialized")]
    NotInitialized,

    #[error("invalid nat parameter: {0}")]
    InvalidParam(String),
}

fn default_port_begin() -> u16 {
    1024
}

fn default_port_end() -> u16 {
    65535
}

fn default_icmp_echo_identifier() -> u16 {
    30000
}

/// Configuration of a `NatTable`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct NatTableParam {
    /// External address all translated traffic appears to come from
    pub target_address: Ipv4Addr,

    /// First external TCP port (inclusive)
    #[serde(default = "default_port_begin")]
    pub tcp_port_begin: u16,

    /// Last external TCP port (inclusive)
    #[serde(default = "default_port_end")]
    pub tcp_port_end: u16,

    /// First external UDP port (inclusive)
    #[serde(default = "default_port_begin")]
    pub udp_port_begin: u16,

    /// Last external UDP port (inclusive)
    #[serde(default = "default_port_end")]
    pub udp_port_end: u16,

    /// Identifier carried by every outgoing ICMP echo request
    #[serde(default = "default_icmp_echo_identifier")]
    pub icmp_echo_identifier: u16,
}

impl NatTableParam {
    /// Creates a parameter set for `target_address` with the default port ranges
    pub fn new(target_address: Ipv4Addr) -> Self {
        Self {
            target_address,
            tcp_port_begin: default_port_begin(),
            tcp_port_end: default_port_end(),
            udp_port_begin: default_port_begin(),
            udp_port_end: default_port_end(),
            icmp_echo_identifier: default_icmp_echo_identifier(),
        }
    }
}

/// Internal origin of an ICMP echo request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IcmpEchoAddress {
    pub ip: Ipv4Addr,
    pub identifier: u16,
    pub sequence_number: u16,
}

/// Association between an internal echo request and the sequence number it was
/// sent out with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpEchoElement {
    pub address: IcmpEchoAddress,
    pub sequence_number_target: u16,
}

/// Network Address Translation (NAT) table
///
/// Not internally synchronized, all packets are expected to be fed from a single
/// owner.
#[derive(Debug, Default)]
pub struct NatTable {
    param: Option<NatTableParam>,

    tcp: NatTableMapping,
    udp: NatTableMapping,

    /// last sequence number handed out to an echo request
    icmp_echo_sequence_current: u16,
    icmp_echo_outgoing: HashMap<IcmpEchoAddress, IcmpEchoElement>,
    icmp_echo_incoming: HashMap<u16, IcmpEchoElement>,

    /// internal destination of incoming fragmented datagrams, indexed by the IPv4
    /// identification field
    tcp_fragments: Box<[Option<Ipv4Addr>]>,
    udp_fragments: Box<[Option<Ipv4Addr>]>,
}

impl NatTable {
    /// Creates a new, uninitialized NAT table
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and initializes a NAT table in one step
    pub fn with_param(param: &NatTableParam) -> Result<Self, NatError> {
        let mut table = Self::new();
        table.initialize(param)?;
        Ok(table)
    }

    /// Sets up the port mappings and fragment tables
    ///
    /// Initializing an already initialized table is a no-op.
    ///
    /// ### Arguments
    /// * `param` - Target address, port ranges and echo identifier
    pub fn initialize(&mut self, param: &NatTableParam) -> Result<(), NatError> {
        if self.param.is_some() {
            return Ok(());
        }

        if param.target_address.is_unspecified() {
            return Err(NatError::InvalidParam(String::from(
                "target address must not be 0.0.0.0",
            )));
        }

        // validate both ranges before touching any state
        for (begin, end) in [
            (param.tcp_port_begin, param.tcp_port_end),
            (param.udp_port_begin, param.udp_port_end),
        ] {
            if end < begin {
                return Err(NatError::InvalidParam(format!(
                    "port range {begin}-{end} is empty"
                )));
            }
        }

        self.tcp.initialize(param.tcp_port_begin, param.tcp_port_end)?;
        self.udp.initialize(param.udp_port_begin, param.udp_port_end)?;
        self.tcp_fragments = vec![None; FRAGMENT_TABLE_SZ].into_boxed_slice();
        self.udp_fragments = vec![None; FRAGMENT_TABLE_SZ].into_boxed_slice();
        self.param = Some(*param);

        tracing::debug!(
            addr = %param.target_address,
            tcp = ?(param.tcp_port_begin..=param.tcp_port_end),
            udp = ?(param.udp_port_begin..=param.udp_port_end),
            icmp_id = param.icmp_echo_identifier,
            "[nat] table initialized"
        );

        Ok(())
    }

    /// Returns the parameters this table was initialized with
    pub fn param(&self) -> Option<&NatTableParam> {
        self.param.as_ref()
    }

    pub fn tcp_mapping(&self) -> &NatTableMapping {
        &self.tcp
    }

    pub fn udp_mapping(&self) -> &NatTableMapping {
        &self.udp
    }

    fn active_param(&self) -> Result<NatTableParam, NatError> {
        self.param.ok_or(NatError::NotInitialized)
    }

    fn mapping_mut(&mut self, protocol: u8) -> &mut NatTableMapping {
        match protocol {
            NET_PROTOCOL_TCP => &mut self.tcp,
            _ => &mut self.udp,
        }
    }

    fn fragments_mut(&mut self, protocol: u8) -> &mut [Option<Ipv4Addr>] {
        match protocol {
            NET_PROTOCOL_TCP => &mut self.tcp_fragments,
            _ => &mut self.udp_fragments,
        }
    }

    /// Translates a datagram leaving the internal network
    ///
    /// On error the packet must be dropped; its contents are unspecified.
    ///
    /// ### Arguments
    /// * `packet` - IPv4 datagram (header + payload), rewritten in place
    /// * `tick` - Current time, used to age port mappings
    pub fn translate_outgoing(&mut self, packet: &mut [u8], tick: u64) -> Result<(), NatError> {
        let param = self.active_param()?;
        let mut pkt = Ipv4Packet::new_checked(packet)?;

        match pkt.protocol() {
            NET_PROTOCOL_TCP | NET_PROTOCOL_UDP => {
                self.outgoing_transport(&mut pkt, &param, tick)?
            }
            NET_PROTOCOL_ICMP => self.outgoing_icmp(&mut pkt, &param, tick)?,
            proto => {
                tracing::trace!(proto, "[nat] outgoing: unsupported protocol");
                return Err(NatError::Unsupported("ip protocol"));
            }
        }

        pkt.set_src(param.target_address);
        pkt.update_checksum();
        Ok(())
    }

    /// Translates a datagram entering from the external network
    ///
    /// On error the packet must be dropped; its contents are unspecified.
    ///
    /// ### Arguments
    /// * `packet` - IPv4 datagram (header + payload), rewritten in place
    /// * `tick` - Current time, used to age port mappings
    pub fn translate_incoming(&mut self, packet: &mut [u8], tick: u64) -> Result<(), NatError> {
        let param = self.active_param()?;
        let mut pkt = Ipv4Packet::new_checked(packet)?;

        if pkt.dst() != param.target_address {
            return Err(NatError::NotAddressed(pkt.dst()));
        }

        let internal = match pkt.protocol() {
            NET_PROTOCOL_TCP | NET_PROTOCOL_UDP => self.incoming_transport(&mut pkt, &param, tick)?,
            NET_PROTOCOL_ICMP => self.incoming_icmp(&mut pkt, &param, tick)?,
            proto => {
                tracing::trace!(proto, "[nat] incoming: unsupported protocol");
                return Err(NatError::Unsupported("ip protocol"));
            }
        };

        pkt.set_dst(internal);
        pkt.update_checksum();
        Ok(())
    }

    /// Returns the external sequence number for an internal echo request,
    /// allocating the next one if this request wasn't seen before
    ///
    /// Allocating a sequence number releases whichever request previously owned it.
    pub fn mapped_icmp_echo_sequence_number(&mut self, address: IcmpEchoAddress) -> u16 {
        if let Some(element) = self.icmp_echo_outgoing.get(&address) {
            return element.sequence_number_target;
        }

        self.icmp_echo_sequence_current = self.icmp_echo_sequence_current.wrapping_add(1);
        let seq = self.icmp_echo_sequence_current;

        if let Some(stale) = self.icmp_echo_incoming.get(&seq) {
            tracing::debug!(ip = %stale.address.ip, seq, "[nat] reusing icmp echo sequence");
            self.icmp_echo_outgoing.remove(&stale.address);
        }

        let element = IcmpEchoElement {
            address,
            sequence_number_target: seq,
        };
        self.icmp_echo_outgoing.insert(address, element);
        self.icmp_echo_incoming.insert(seq, element);
        seq
    }

    /// TCP / UDP leaving the network: map (src ip, src port) to an external port
    fn outgoing_transport(
        &mut self,
        pkt: &mut Ipv4Packet<&mut [u8]>,
        param: &NatTableParam,
        tick: u64,
    ) -> Result<(), NatError> {
        // later fragments carry no transport header
        if pkt.frag_offset() != 0 {
            tracing::trace!(id = pkt.ident(), "[nat] outgoing: non-first fragment");
            return Ok(());
        }

        let protocol = pkt.protocol();
        let src = pkt.src();
        let csum_at = check_transport(protocol, pkt.payload(), pkt.is_mf())?;
        let sport = cast!(be16, pkt.payload()[SRC_PORT]);
        let external = self.mapping_mut(protocol).map_to_external(src, sport, tick)?;

        let seg = pkt.payload_mut();
        seg[SRC_PORT].copy_from_slice(&external.to_be_bytes());
        fix_transport_checksum(
            protocol,
            &mut seg[csum_at..csum_at + 2],
            (src, sport),
            (param.target_address, external),
        );

        tracing::trace!(proto = protocol, %src, sport, external, "[nat] outgoing");
        Ok(())
    }

    /// TCP / UDP entering the network: route by destination port, or by
    /// identification for later fragments
    fn incoming_transport(
        &mut self,
        pkt: &mut Ipv4Packet<&mut [u8]>,
        param: &NatTableParam,
        tick: u64,
    ) -> Result<Ipv4Addr, NatError> {
        let protocol = pkt.protocol();
        let id = usize::from(pkt.ident());

        if pkt.frag_offset() != 0 {
            let more_fragments = pkt.is_mf();
            let slot = &mut self.fragments_mut(protocol)[id];
            let internal = slot.ok_or(NatError::NoMapping)?;
            if !more_fragments {
                *slot = None;
            }

            tracing::trace!(proto = protocol, id, %internal, "[nat] incoming: fragment");
            return Ok(internal);
        }

        let more_fragments = pkt.is_mf();
        let csum_at = check_transport(protocol, pkt.payload(), more_fragments)?;
        let dport = cast!(be16, pkt.payload()[DST_PORT]);
        let (internal, port) = self
            .mapping_mut(protocol)
            .map_to_internal(dport, tick)
            .ok_or(NatError::NoMapping)?;

        let seg = pkt.payload_mut();
        seg[DST_PORT].copy_from_slice(&port.to_be_bytes());
        fix_transport_checksum(
            protocol,
            &mut seg[csum_at..csum_at + 2],
            (param.target_address, dport),
            (internal, port),
        );

        if more_fragments {
            self.fragments_mut(protocol)[id] = Some(internal);
        }

        tracing::trace!(proto = protocol, dport, %internal, port, "[nat] incoming");
        Ok(internal)
    }

    fn outgoing_icmp(
        &mut self,
        pkt: &mut Ipv4Packet<&mut [u8]>,
        param: &NatTableParam,
        tick: u64,
    ) -> Result<(), NatError> {
        if pkt.is_fragment() {
            return Err(NatError::Unsupported("fragmented icmp"));
        }

        let src = pkt.src();
        let (ty, identifier, sequence_number) = {
            let msg = IcmpMessage::new_checked(pkt.payload())?;
            (
                msg.msg_type(),
                msg.echo_identifier(),
                msg.echo_sequence_number(),
            )
        };

        match ty {
            IcmpType::Echo => {
                let seq = self.mapped_icmp_echo_sequence_number(IcmpEchoAddress {
                    ip: src,
                    identifier,
                    sequence_number,
                });

                let mut msg = IcmpMessage::new_unchecked(pkt.payload_mut());
                msg.set_echo_identifier(param.icmp_echo_identifier);
                msg.set_echo_sequence_number(seq);
                msg.update_checksum();

                tracing::trace!(%src, identifier, sequence_number, seq, "[nat] outgoing: echo");
            }
            IcmpType::DestinationUnreachable | IcmpType::TimeExceeded => {
                self.outgoing_icmp_error(pkt.payload_mut(), src, param, tick)?;
            }
            ty => {
                tracing::trace!(%ty, "[nat] outgoing: unsupported icmp type");
                return Err(NatError::Unsupported("icmp type"));
            }
        }

        Ok(())
    }

    /// An internal host reports an error about a datagram it received through the
    /// NAT. The quoted datagram is addressed to the internal host and has to be
    /// made to look like it was addressed to the external port again.
    fn outgoing_icmp_error(
        &mut self,
        icmp: &mut [u8],
        sender: Ipv4Addr,
        param: &NatTableParam,
        tick: u64,
    ) -> Result<(), NatError> {
        let quoted = &mut icmp[ICMP_HDR_SZ..];
        let (protocol, hdr_sz, orig_dst) = check_quoted(quoted)?;
        if orig_dst != sender {
            return Err(NatError::Unsupported("icmp error quotes a foreign datagram"));
        }

        if protocol != NET_PROTOCOL_TCP && protocol != NET_PROTOCOL_UDP {
            return Err(NatError::Unsupported("icmp error quotes unsupported protocol"));
        }

        let dport = cast!(be16, quoted[hdr_sz..][DST_PORT]);
        let external = self
            .mapping_mut(protocol)
            .find_external(orig_dst, dport, tick)
            .ok_or(NatError::NoMapping)?;

        let (hdr, seg) = quoted.split_at_mut(hdr_sz);
        seg[DST_PORT].copy_from_slice(&external.to_be_bytes());
        let csum_at = transport_checksum_offset(protocol);
        if let Some(csum) = seg.get_mut(csum_at..csum_at + 2) {
            csum.fill(0);
        }

        let mut orig = Ipv4Packet::new_unchecked(hdr);
        orig.set_dst(param.target_address);
        orig.update_checksum();

        IcmpMessage::new_unchecked(icmp).update_checksum();

        tracing::trace!(proto = protocol, %sender, dport, external, "[nat] outgoing: icmp error");
        Ok(())
    }

    fn incoming_icmp(
        &mut self,
        pkt: &mut Ipv4Packet<&mut [u8]>,
        param: &NatTableParam,
        tick: u64,
    ) -> Result<Ipv4Addr, NatError> {
        if pkt.is_fragment() {
            return Err(NatError::Unsupported("fragmented icmp"));
        }

        let (ty, identifier, seq) = {
            let msg = IcmpMessage::new_checked(pkt.payload())?;
            (
                msg.msg_type(),
                msg.echo_identifier(),
                msg.echo_sequence_number(),
            )
        };

        let internal = match ty {
            IcmpType::EchoReply => {
                let element = self.echo_element(param, identifier, seq)?;

                let mut msg = IcmpMessage::new_unchecked(pkt.payload_mut());
                msg.set_echo_identifier(element.address.identifier);
                msg.set_echo_sequence_number(element.address.sequence_number);
                msg.update_checksum();

                tracing::trace!(
                    ip = %element.address.ip,
                    identifier = element.address.identifier,
                    seq = element.address.sequence_number,
                    "[nat] incoming: echo reply"
                );
                element.address.ip
            }
            IcmpType::DestinationUnreachable | IcmpType::TimeExceeded => {
                self.incoming_icmp_error(pkt.payload_mut(), param, tick)?
            }
            ty => {
                tracing::trace!(%ty, "[nat] incoming: unsupported icmp type");
                return Err(NatError::Unsupported("icmp type"));
            }
        };

        Ok(internal)
    }

    /// A remote host reports an error about a datagram the NAT sent on behalf of an
    /// internal host. The quoted datagram gets its internal source back.
    fn incoming_icmp_error(
        &mut self,
        icmp: &mut [u8],
        param: &NatTableParam,
        tick: u64,
    ) -> Result<Ipv4Addr, NatError> {
        let quoted = &mut icmp[ICMP_HDR_SZ..];
        let (protocol, hdr_sz, _) = check_quoted(quoted)?;
        let orig_src = Ipv4Packet::new_unchecked(&quoted[..]).src();
        if orig_src != param.target_address {
            return Err(NatError::Unsupported("icmp error quotes a foreign datagram"));
        }

        let (hdr, seg) = quoted.split_at_mut(hdr_sz);
        let internal = match protocol {
            NET_PROTOCOL_TCP | NET_PROTOCOL_UDP => {
                let sport = cast!(be16, seg[SRC_PORT]);
                let (internal, port) = self
                    .mapping_mut(protocol)
                    .map_to_internal(sport, tick)
                    .ok_or(NatError::NoMapping)?;

                seg[SRC_PORT].copy_from_slice(&port.to_be_bytes());
                let csum_at = transport_checksum_offset(protocol);
                if let Some(csum) = seg.get_mut(csum_at..csum_at + 2) {
                    fix_transport_checksum(
                        protocol,
                        csum,
                        (param.target_address, sport),
                        (internal, port),
                    );
                }

                tracing::trace!(
                    proto = protocol,
                    sport,
                    %internal,
                    port,
                    "[nat] incoming: icmp error"
                );
                internal
            }
            NET_PROTOCOL_ICMP => {
                let (identifier, seq) = {
                    let echo = IcmpMessage::new_unchecked(&seg[..]);
                    (echo.echo_identifier(), echo.echo_sequence_number())
                };
                let element = self.echo_element(param, identifier, seq)?;

                let echo_at = ICMP_ECHO_OFFSET;
                let mut old = [0u8; 4];
                old.copy_from_slice(&seg[echo_at..echo_at + 4]);
                let mut echo = IcmpMessage::new_unchecked(&mut seg[..]);
                echo.set_echo_identifier(element.address.identifier);
                echo.set_echo_sequence_number(element.address.sequence_number);

                let new = &seg[echo_at..echo_at + 4];
                let csum = cast!(be16, seg[ICMP_CHECKSUM_OFFSET..]);
                let csum = adjust(csum, &old, new);
                seg[ICMP_CHECKSUM_OFFSET..ICMP_CHECKSUM_OFFSET + 2]
                    .copy_from_slice(&csum.to_be_bytes());

                tracing::trace!(
                    ip = %element.address.ip,
                    seq,
                    "[nat] incoming: icmp error (echo)"
                );
                element.address.ip
            }
            _ => return Err(NatError::Unsupported("icmp error quotes unsupported protocol")),
        };

        let mut orig = Ipv4Packet::new_unchecked(hdr);
        orig.set_src(internal);
        orig.update_checksum();

        IcmpMessage::new_unchecked(icmp).update_checksum();
        Ok(internal)
    }

    /// Looks up the internal echo request an external sequence number belongs to
    fn echo_element(
        &self,
        param: &NatTableParam,
        identifier: u16,
        seq: u16,
    ) -> Result<IcmpEchoElement, NatError> {
        if identifier != param.icmp_echo_identifier {
            return Err(NatError::NoMapping);
        }

        self.icmp_echo_incoming
            .get(&seq)
            .copied()
            .ok_or(NatError::NoMapping)
    }
}

/// Offset of the checksum inside a TCP or UDP header
fn transport_checksum_offset(protocol: u8) -> usize {
    match protocol {
        NET_PROTOCOL_TCP => TCP_CHECKSUM_OFFSET,
        _ => UDP_CHECKSUM_OFFSET,
    }
}

/// Validates the transport header at the start of `payload`, returning the offset
/// of its checksum field
///
/// The first fragment of a fragmented UDP datagram only has to hold the header.
fn check_transport(protocol: u8, payload: &[u8], more_fragments: bool) -> Result<usize, NatError> {
    match protocol {
        NET_PROTOCOL_TCP => {
            TcpSegment::new_checked(payload)?;
        }
        _ if more_fragments => {
            if payload.len() < UDP_HDR_SZ {
                return Err(ProtocolError::NotEnoughData(payload.len(), UDP_HDR_SZ).into());
            }
        }
        _ => {
            UdpDatagram::new_checked(payload)?;
        }
    }

    Ok(transport_checksum_offset(protocol))
}

/// Validates the datagram quoted by an ICMP error (header + 8 bytes), returning its
/// protocol, header size and destination
fn check_quoted(quoted: &[u8]) -> Result<(u8, usize, Ipv4Addr), NatError> {
    let orig = Ipv4Packet::new_unchecked(quoted);
    orig.check_header()?;

    let hdr_sz = orig.header_size();
    let needed = hdr_sz + ICMP_QUOTED_PAYLOAD_SZ;
    if quoted.len() < needed {
        return Err(ProtocolError::NotEnoughData(quoted.len(), needed).into());
    }

    Ok((orig.protocol(), hdr_sz, orig.dst()))
}

/// Incrementally updates a TCP/UDP checksum after one pseudo header address and
/// one port changed
///
/// UDP datagrams sent without a checksum keep it disabled.
fn fix_transport_checksum(
    protocol: u8,
    field: &mut [u8],
    (old_ip, old_port): (Ipv4Addr, u16),
    (new_ip, new_port): (Ipv4Addr, u16),
) {
    let csum = cast!(be16, field);
    if protocol == NET_PROTOCOL_UDP && csum == 0 {
        return;
    }

    let csum = match updated_checksum(csum, old_ip, new_ip, old_port, new_port) {
        0 if protocol == NET_PROTOCOL_UDP => 0xFFFF,
        csum => csum,
    };
    field.copy_from_slice(&csum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::{
        ipv4::Ipv4Packet,
        protocols::{
            icmp::IcmpMessage, tcp::TcpSegment, udp::UdpDatagram, NET_PROTOCOL_UDP,
        },
        testutil,
    };

    use super::{IcmpEchoAddress, NatError, NatTable, NatTableParam};

    const TARGET: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);
    const ROUTER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 254);

    fn table() -> NatTable {
        testutil::init_tracing();
        let mut param = NatTableParam::new(TARGET);
        param.tcp_port_begin = 40000;
        param.tcp_port_end = 40999;
        param.udp_port_begin = 50000;
        param.udp_port_end = 50999;
        NatTable::with_param(&param).unwrap()
    }

    fn ip(pkt: &[u8]) -> Ipv4Packet<&[u8]> {
        Ipv4Packet::new_checked(pkt).unwrap()
    }

    #[test]
    fn not_initialized() {
        let mut nat = NatTable::new();
        let mut pkt = testutil::tcp(HOST, 5000, REMOTE, 80, b"");
        assert!(matches!(
            nat.translate_outgoing(&mut pkt, 0),
            Err(NatError::NotInitialized)
        ));
        assert!(matches!(
            nat.translate_incoming(&mut pkt, 0),
            Err(NatError::NotInitialized)
        ));
    }

    #[test]
    fn invalid_params() {
        let param = NatTableParam::new(Ipv4Addr::UNSPECIFIED);
        assert!(matches!(
            NatTable::with_param(&param),
            Err(NatError::InvalidParam(_))
        ));

        let mut param = NatTableParam::new(TARGET);
        param.udp_port_begin = 2000;
        param.udp_port_end = 1000;
        let mut nat = NatTable::new();
        assert!(matches!(
            nat.initialize(&param),
            Err(NatError::InvalidParam(_))
        ));
        assert!(nat.param().is_none());
        assert!(!nat.tcp_mapping().is_initialized());
    }

    #[test]
    fn reinitialize_is_noop() {
        let mut nat = table();
        let other = NatTableParam::new(Ipv4Addr::new(1, 1, 1, 1));
        nat.initialize(&other).unwrap();
        assert_eq!(nat.param().unwrap().target_address, TARGET);
        assert_eq!(nat.tcp_mapping().port_range(), Some(40000..=40999));
    }

    #[test]
    fn param_defaults() {
        let param: NatTableParam =
            serde_json::from_str(r#"{ "target_address": "203.0.113.1", "udp_port_end": 2000 }"#)
                .unwrap();
        assert_eq!(param.target_address, TARGET);
        assert_eq!(param.tcp_port_begin, 1024);
        assert_eq!(param.tcp_port_end, 65535);
        assert_eq!(param.udp_port_end, 2000);
        assert_eq!(param.icmp_echo_identifier, 30000);
    }

    #[test]
    fn tcp_round_trip() {
        let mut nat = table();

        let mut pkt = testutil::tcp(HOST, 5000, REMOTE, 80, b"hello");
        nat.translate_outgoing(&mut pkt, 1).unwrap();

        let out = ip(&pkt);
        assert_eq!(out.src(), TARGET);
        assert_eq!(out.dst(), REMOTE);
        assert!(out.check_checksum());

        let seg = TcpSegment::new_checked(out.payload()).unwrap();
        let external = seg.src_port();
        assert!((40000..=40999).contains(&external));
        assert_eq!(seg.dst_port(), 80);
        assert!(seg.check_checksum(TARGET, REMOTE));
        assert_eq!(seg.payload(), b"hello");

        let mut reply = testutil::tcp(REMOTE, 80, TARGET, external, b"world");
        nat.translate_incoming(&mut reply, 2).unwrap();

        let back = ip(&reply);
        assert_eq!(back.src(), REMOTE);
        assert_eq!(back.dst(), HOST);
        assert!(back.check_checksum());

        let seg = TcpSegment::new_checked(back.payload()).unwrap();
        assert_eq!(seg.src_port(), 80);
        assert_eq!(seg.dst_port(), 5000);
        assert!(seg.check_checksum(REMOTE, HOST));
    }

    #[test]
    fn same_flow_reuses_port() {
        let mut nat = table();

        let mut a = testutil::udp(HOST, 6000, REMOTE, 53, b"q1");
        let mut b = testutil::udp(HOST, 6000, REMOTE, 53, b"q2");
        let mut c = testutil::udp(HOST, 6001, REMOTE, 53, b"q3");
        nat.translate_outgoing(&mut a, 1).unwrap();
        nat.translate_outgoing(&mut b, 2).unwrap();
        nat.translate_outgoing(&mut c, 3).unwrap();

        let port = |p: &[u8]| UdpDatagram::new_checked(ip(p).payload()).unwrap().src_port();
        assert_eq!(port(&a), port(&b));
        assert_ne!(port(&a), port(&c));
        assert_eq!(nat.udp_mapping().len(), 2);
    }

    #[test]
    fn udp_round_trip() {
        let mut nat = table();

        let mut pkt = testutil::udp(HOST, 6000, REMOTE, 53, b"query");
        nat.translate_outgoing(&mut pkt, 1).unwrap();

        let out = ip(&pkt);
        let dgram = UdpDatagram::new_checked(out.payload()).unwrap();
        let external = dgram.src_port();
        assert!((50000..=50999).contains(&external));
        assert!(dgram.check_checksum(TARGET, REMOTE));
        assert_ne!(dgram.checksum(), 0);

        let mut reply = testutil::udp(REMOTE, 53, TARGET, external, b"answer");
        nat.translate_incoming(&mut reply, 2).unwrap();

        let back = ip(&reply);
        assert_eq!(back.dst(), HOST);
        let dgram = UdpDatagram::new_checked(back.payload()).unwrap();
        assert_eq!(dgram.dst_port(), 6000);
        assert!(dgram.check_checksum(REMOTE, HOST));
    }

    #[test]
    fn udp_without_checksum_stays_without() {
        let mut nat = table();

        let mut pkt = testutil::udp(HOST, 6000, REMOTE, 53, b"query");
        pkt[20 + 6..20 + 8].fill(0);
        nat.translate_outgoing(&mut pkt, 1).unwrap();

        let out = ip(&pkt);
        let dgram = UdpDatagram::new_checked(out.payload()).unwrap();
        assert_eq!(dgram.checksum(), 0);
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let mut nat = table();

        let mut pkt = testutil::udp(HOST, 6000, REMOTE, 53, b"q");
        pkt.extend_from_slice(&[0u8; 12]);
        nat.translate_outgoing(&mut pkt, 1).unwrap();

        let out = ip(&pkt);
        let dgram = UdpDatagram::new_checked(out.payload()).unwrap();
        assert!(dgram.check_checksum(TARGET, REMOTE));
        assert_eq!(pkt[pkt.len() - 12..], [0u8; 12]);
    }

    #[test]
    fn unsupported_protocol() {
        let mut nat = table();
        let mut pkt = testutil::ipv4(HOST, REMOTE, 47, &[0u8; 16]);
        assert!(matches!(
            nat.translate_outgoing(&mut pkt, 0),
            Err(NatError::Unsupported(_))
        ));
    }

    #[test]
    fn incoming_requires_target_address() {
        let mut nat = table();
        let mut pkt = testutil::udp(REMOTE, 53, Ipv4Addr::new(203, 0, 113, 2), 50000, b"");
        assert!(matches!(
            nat.translate_incoming(&mut pkt, 0),
            Err(NatError::NotAddressed(_))
        ));
    }

    #[test]
    fn incoming_without_mapping() {
        let mut nat = table();
        let mut pkt = testutil::tcp(REMOTE, 80, TARGET, 40000, b"");
        assert!(matches!(
            nat.translate_incoming(&mut pkt, 0),
            Err(NatError::NoMapping)
        ));

        // outside of the configured range
        let mut pkt = testutil::tcp(REMOTE, 80, TARGET, 22, b"");
        assert!(matches!(
            nat.translate_incoming(&mut pkt, 0),
            Err(NatError::NoMapping)
        ));
    }

    #[test]
    fn malformed_packets_are_dropped() {
        let mut nat = table();

        let mut short = [0x45u8, 0, 0, 20, 0, 0, 0, 0, 64, 6];
        let copy = short;
        assert!(matches!(
            nat.translate_outgoing(&mut short, 0),
            Err(NatError::Malformed(_))
        ));
        assert!(matches!(
            nat.translate_incoming(&mut short, 0),
            Err(NatError::Malformed(_))
        ));
        assert_eq!(short, copy);

        // header length beyond the buffer
        let mut pkt = testutil::tcp(HOST, 5000, REMOTE, 80, b"");
        pkt[0] = 0x4F;
        pkt.truncate(40);
        let copy = pkt.clone();
        assert!(nat.translate_outgoing(&mut pkt, 0).is_err());
        assert_eq!(pkt, copy);

        // truncated tcp header
        let mut pkt = testutil::ipv4(HOST, REMOTE, 6, &[0u8; 12]);
        let copy = pkt.clone();
        assert!(matches!(
            nat.translate_outgoing(&mut pkt, 0),
            Err(NatError::Malformed(_))
        ));
        assert_eq!(pkt, copy);

        // table still works afterwards
        let mut pkt = testutil::tcp(HOST, 5000, REMOTE, 80, b"");
        nat.translate_outgoing(&mut pkt, 1).unwrap();
    }

    #[test]
    fn icmp_echo_round_trip() {
        let mut nat = table();

        let mut ping = testutil::icmp_echo(HOST, REMOTE, 8, 1234, 1, b"abcdefgh");
        nat.translate_outgoing(&mut ping, 1).unwrap();

        let out = ip(&ping);
        assert_eq!(out.src(), TARGET);
        assert!(out.check_checksum());
        let msg = IcmpMessage::new_checked(out.payload()).unwrap();
        assert_eq!(msg.echo_identifier(), 30000);
        assert!(msg.check_checksum());
        let seq = msg.echo_sequence_number();

        let mut pong = testutil::icmp_echo(REMOTE, TARGET, 0, 30000, seq, b"abcdefgh");
        nat.translate_incoming(&mut pong, 2).unwrap();

        let back = ip(&pong);
        assert_eq!(back.dst(), HOST);
        assert!(back.check_checksum());
        let msg = IcmpMessage::new_checked(back.payload()).unwrap();
        assert_eq!(msg.echo_identifier(), 1234);
        assert_eq!(msg.echo_sequence_number(), 1);
        assert!(msg.check_checksum());
    }

    #[test]
    fn echo_reply_with_foreign_identifier() {
        let mut nat = table();

        let mut ping = testutil::icmp_echo(HOST, REMOTE, 8, 1234, 1, b"");
        nat.translate_outgoing(&mut ping, 1).unwrap();
        let seq = IcmpMessage::new_checked(ip(&ping).payload())
            .unwrap()
            .echo_sequence_number();

        let mut pong = testutil::icmp_echo(REMOTE, TARGET, 0, 1234, seq, b"");
        assert!(matches!(
            nat.translate_incoming(&mut pong, 2),
            Err(NatError::NoMapping)
        ));

        let mut pong = testutil::icmp_echo(REMOTE, TARGET, 0, 30000, seq.wrapping_add(1), b"");
        assert!(matches!(
            nat.translate_incoming(&mut pong, 2),
            Err(NatError::NoMapping)
        ));
    }

    #[test]
    fn echo_sequence_allocation() {
        let mut nat = table();
        let a = IcmpEchoAddress {
            ip: HOST,
            identifier: 1,
            sequence_number: 1,
        };
        let b = IcmpEchoAddress {
            sequence_number: 2,
            ..a
        };

        let sa = nat.mapped_icmp_echo_sequence_number(a);
        let sb = nat.mapped_icmp_echo_sequence_number(b);
        assert_eq!(sa, 1);
        assert_eq!(sb, 2);
        assert_eq!(nat.mapped_icmp_echo_sequence_number(a), sa);
    }

    #[test]
    fn echo_sequence_wraps_and_evicts() {
        let mut nat = table();
        let a = IcmpEchoAddress {
            ip: HOST,
            identifier: 7,
            sequence_number: 100,
        };
        let b = IcmpEchoAddress {
            ip: Ipv4Addr::new(10, 0, 0, 6),
            ..a
        };

        nat.icmp_echo_sequence_current = u16::MAX;
        assert_eq!(nat.mapped_icmp_echo_sequence_number(a), 0);

        // counter wrapped all the way around, b takes over sequence 0
        nat.icmp_echo_sequence_current = u16::MAX;
        assert_eq!(nat.mapped_icmp_echo_sequence_number(b), 0);
        assert_eq!(nat.icmp_echo_incoming[&0].address, b);
        assert!(!nat.icmp_echo_outgoing.contains_key(&a));

        // a gets a fresh sequence number
        assert_eq!(nat.mapped_icmp_echo_sequence_number(a), 1);
    }

    #[test]
    fn fragmented_icmp_is_rejected() {
        let mut nat = table();
        let mut ping = testutil::icmp_echo(HOST, REMOTE, 8, 1, 1, b"abcdefgh");
        Ipv4Packet::new_unchecked(&mut ping[..]).set_mf(true);
        assert!(matches!(
            nat.translate_outgoing(&mut ping, 0),
            Err(NatError::Unsupported(_))
        ));
    }

    #[test]
    fn outgoing_non_first_fragment_rewrites_ip_only() {
        let mut nat = table();
        let payload = [0xAAu8; 16];
        let mut frag =
            testutil::ipv4_fragment(HOST, REMOTE, NET_PROTOCOL_UDP, 0x4242, false, 3, &payload);
        nat.translate_outgoing(&mut frag, 0).unwrap();

        let out = ip(&frag);
        assert_eq!(out.src(), TARGET);
        assert!(out.check_checksum());
        assert_eq!(out.payload(), payload);
        assert!(nat.udp_mapping().is_empty());
    }

    #[test]
    fn incoming_fragment_routing() {
        let mut nat = table();

        let mut pkt = testutil::udp(HOST, 6000, REMOTE, 53, b"q");
        nat.translate_outgoing(&mut pkt, 1).unwrap();
        let external = UdpDatagram::new_checked(ip(&pkt).payload())
            .unwrap()
            .src_port();

        let data: Vec<u8> = (0..24u8).collect();
        let seg = testutil::udp_segment(REMOTE, 53, TARGET, external, &data);
        let id = 0x1111;

        let mut first =
            testutil::ipv4_fragment(REMOTE, TARGET, NET_PROTOCOL_UDP, id, true, 0, &seg[..16]);
        nat.translate_incoming(&mut first, 2).unwrap();
        let out = ip(&first);
        assert_eq!(out.dst(), HOST);
        assert_eq!(UdpDatagram::new_unchecked(out.payload()).dst_port(), 6000);

        let mut last =
            testutil::ipv4_fragment(REMOTE, TARGET, NET_PROTOCOL_UDP, id, false, 2, &seg[16..]);
        nat.translate_incoming(&mut last, 3).unwrap();
        let out = ip(&last);
        assert_eq!(out.dst(), HOST);
        assert!(out.check_checksum());
        assert_eq!(out.payload(), &seg[16..]);

        // slot was released by the last fragment
        let mut again =
            testutil::ipv4_fragment(REMOTE, TARGET, NET_PROTOCOL_UDP, id, false, 2, &seg[16..]);
        assert!(matches!(
            nat.translate_incoming(&mut again, 4),
            Err(NatError::NoMapping)
        ));
    }

    #[test]
    fn incoming_icmp_error_about_udp() {
        let mut nat = table();

        let original = testutil::udp(HOST, 6000, REMOTE, 53, b"query");
        let mut pkt = original.clone();
        nat.translate_outgoing(&mut pkt, 1).unwrap();

        // time exceeded, quoting the translated datagram
        let mut err = testutil::icmp_error(ROUTER, TARGET, 11, 0, &pkt);
        nat.translate_incoming(&mut err, 2).unwrap();

        let out = ip(&err);
        assert_eq!(out.src(), ROUTER);
        assert_eq!(out.dst(), HOST);
        assert!(out.check_checksum());

        let msg = IcmpMessage::new_checked(out.payload()).unwrap();
        assert!(msg.check_checksum());

        // the quoted datagram is the one the host sent, checksums included
        assert_eq!(msg.content(), &original[..28]);
    }

    #[test]
    fn incoming_icmp_error_about_echo() {
        let mut nat = table();

        let original = testutil::icmp_echo(HOST, REMOTE, 8, 1234, 9, b"abcdefgh");
        let mut ping = original.clone();
        nat.translate_outgoing(&mut ping, 1).unwrap();

        let mut err = testutil::icmp_error(ROUTER, TARGET, 3, 1, &ping);
        nat.translate_incoming(&mut err, 2).unwrap();

        let out = ip(&err);
        assert_eq!(out.dst(), HOST);
        let msg = IcmpMessage::new_checked(out.payload()).unwrap();
        assert!(msg.check_checksum());
        assert_eq!(msg.content(), &original[..28]);
    }

    #[test]
    fn incoming_icmp_error_checks_quote() {
        let mut nat = table();

        let mut pkt = testutil::udp(HOST, 6000, REMOTE, 53, b"query");
        nat.translate_outgoing(&mut pkt, 1).unwrap();

        // quoted datagram was not sent by the nat
        let foreign = testutil::udp(REMOTE, 53, HOST, 6000, b"query");
        let mut err = testutil::icmp_error(ROUTER, TARGET, 11, 0, &foreign);
        assert!(matches!(
            nat.translate_incoming(&mut err, 2),
            Err(NatError::Unsupported(_))
        ));

        // quote shorter than header + 8 bytes
        let mut err = testutil::icmp_error(ROUTER, TARGET, 11, 0, &pkt);
        err.truncate(err.len() - 1);
        let total = (err.len() as u16).to_be_bytes();
        err[2..4].copy_from_slice(&total);
        assert!(matches!(
            nat.translate_incoming(&mut err, 2),
            Err(NatError::Malformed(_))
        ));
    }

    #[test]
    fn outgoing_icmp_error_about_udp() {
        let mut nat = table();

        let mut pkt = testutil::udp(HOST, 6000, REMOTE, 53, b"query");
        nat.translate_outgoing(&mut pkt, 1).unwrap();
        let external = UdpDatagram::new_checked(ip(&pkt).payload())
            .unwrap()
            .src_port();

        // reply arrives, host answers with port unreachable
        let mut reply = testutil::udp(REMOTE, 53, TARGET, external, b"answer");
        nat.translate_incoming(&mut reply, 2).unwrap();

        let mut err = testutil::icmp_error(HOST, REMOTE, 3, 3, &reply);
        nat.translate_outgoing(&mut err, 3).unwrap();

        let out = ip(&err);
        assert_eq!(out.src(), TARGET);
        assert_eq!(out.dst(), REMOTE);
        assert!(out.check_checksum());

        let msg = IcmpMessage::new_checked(out.payload()).unwrap();
        assert!(msg.check_checksum());

        let quoted = Ipv4Packet::new_unchecked(msg.content());
        assert!(quoted.check_checksum());
        assert_eq!(quoted.src(), REMOTE);
        assert_eq!(quoted.dst(), TARGET);

        let dgram = UdpDatagram::new_unchecked(&msg.content()[20..]);
        assert_eq!(dgram.src_port(), 53);
        assert_eq!(dgram.dst_port(), external);
        assert_eq!(dgram.checksum(), 0);
    }

    #[test]
    fn outgoing_icmp_error_without_mapping() {
        let mut nat = table();

        let stray = testutil::udp(REMOTE, 53, HOST, 6000, b"answer");
        let mut err = testutil::icmp_error(HOST, REMOTE, 3, 3, &stray);
        assert!(matches!(
            nat.translate_outgoing(&mut err, 0),
            Err(NatError::NoMapping)
        ));
        assert!(nat.udp_mapping().is_empty());
    }

    #[test]
    fn unsupported_icmp_type() {
        let mut nat = table();
        let mut msg = testutil::icmp_echo(HOST, REMOTE, 13, 1, 1, &[0u8; 12]);
        assert!(matches!(
            nat.translate_outgoing(&mut msg, 0),
            Err(NatError::Unsupported(_))
        ));
    }
}

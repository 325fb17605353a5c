//! handles pcap related tasks

use std::{
    fs::File,
    io::BufReader,
    net::Ipv4Addr,
    path::Path,
    time::Duration,
};

use anyhow::Context;
use jiff::Timestamp;
use natbox_core::{
    protocols::{
        icmp::IcmpMessage, tcp::TcpHeader, udp::UdpHeader, NET_PROTOCOL_ICMP, NET_PROTOCOL_TCP,
        NET_PROTOCOL_UDP,
    },
    Ipv4Packet,
};
use pcap_file::pcap::PcapReader;
use serde::{Deserialize, Serialize};

use super::LinkType;

macro_rules! print_netflow {
    (header) => {
        println!(
            "| {:^30} | {:^10} | {:^11} | {:^60} |",
            "Date/Time", "Protocol", "Size", "Details"
        )
    };
    (separator) => {
        println!(
            "| {:-^30} | {:-^10} | {:-^11} | {:-^60} |",
            "--", "--", "--", "--"
        )
    };
    ($ts:expr, $proto:expr, $len:expr, $msg:expr) => {{
        println!(
            "| {:<30} | {:<10} | {:>5} bytes | {:<60} |",
            $ts.to_string(),
            $proto,
            $len,
            $msg
        )
    }};
}

#[derive(Debug, Deserialize, Serialize)]
enum NetflowL4Protocol {
    Tcp {
        src_port: u16,
        dst_port: u16,
        flags: String,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Icmp {
        msg_type: String,
        code: u8,
    },
    Fragment {
        protocol: u8,
        offset: u16,
    },
    Other {
        protocol: u8,
    },
}

#[derive(Debug, Deserialize, Serialize)]
enum NetflowL3Protocol {
    Ipv4 {
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        proto: NetflowL4Protocol,
    },
}

/// Represents a netflow record
#[derive(Debug, Deserialize, Serialize)]
struct NetflowRecord {
    ts: Timestamp,
    size: usize,
    protocol: NetflowL3Protocol,
}

impl NetflowRecord {
    /// Builds a record from an ipv4 packet, or `None` if the packet is malformed
    ///
    /// ### Arguments
    /// * `ts` - Capture time of the packet
    /// * `data` - Ipv4 packet (header + payload)
    fn parse(ts: Timestamp, data: &[u8]) -> Option<Self> {
        let ipv4 = match Ipv4Packet::new_checked(data) {
            Ok(pkt) => pkt,
            Err(error) => {
                tracing::debug!(%error, "[netflow] skipping malformed ipv4 packet");
                return None;
            }
        };

        let payload = ipv4.payload();
        let protocol = ipv4.protocol();

        // only the first fragment carries the transport header
        let proto = match (protocol, ipv4.frag_offset()) {
            (protocol, offset) if offset != 0 => NetflowL4Protocol::Fragment { protocol, offset },
            (NET_PROTOCOL_TCP, _) => match TcpHeader::extract_from_slice(payload) {
                Ok(tcp) => NetflowL4Protocol::Tcp {
                    src_port: tcp.src_port,
                    dst_port: tcp.dst_port,
                    flags: tcp.flags.to_string(),
                },
                Err(_) => NetflowL4Protocol::Other { protocol },
            },
            (NET_PROTOCOL_UDP, _) => match UdpHeader::extract_from_slice(payload) {
                Ok(udp) => NetflowL4Protocol::Udp {
                    src_port: udp.src_port,
                    dst_port: udp.dst_port,
                },
                Err(_) => NetflowL4Protocol::Other { protocol },
            },
            (NET_PROTOCOL_ICMP, _) => match IcmpMessage::new_checked(payload) {
                Ok(icmp) => NetflowL4Protocol::Icmp {
                    msg_type: icmp.msg_type().to_string(),
                    code: icmp.code(),
                },
                Err(_) => NetflowL4Protocol::Other { protocol },
            },
            (protocol, _) => NetflowL4Protocol::Other { protocol },
        };

        Some(Self {
            ts,
            size: usize::from(ipv4.total_len()),
            protocol: NetflowL3Protocol::Ipv4 {
                src_ip: ipv4.src(),
                dst_ip: ipv4.dst(),
                proto,
            },
        })
    }

    fn print(&self) {
        let NetflowL3Protocol::Ipv4 {
            src_ip,
            dst_ip,
            proto,
        } = &self.protocol;

        match proto {
            NetflowL4Protocol::Tcp {
                src_port,
                dst_port,
                flags,
            } => print_netflow!(
                self.ts,
                "ipv4/tcp",
                self.size,
                format!("[{flags}] {src_ip}:{src_port} --> {dst_ip}:{dst_port}")
            ),
            NetflowL4Protocol::Udp { src_port, dst_port } => print_netflow!(
                self.ts,
                "ipv4/udp",
                self.size,
                format!("{src_ip}:{src_port} --> {dst_ip}:{dst_port}")
            ),
            NetflowL4Protocol::Icmp { msg_type, code } => print_netflow!(
                self.ts,
                "ipv4/icmp",
                self.size,
                format!("[{msg_type}/{code}] {src_ip} --> {dst_ip}")
            ),
            NetflowL4Protocol::Fragment { protocol, offset } => print_netflow!(
                self.ts,
                "ipv4/frag",
                self.size,
                format!("{src_ip} --> {dst_ip} [proto: 0x{protocol:02x}, offset: {offset}]")
            ),
            NetflowL4Protocol::Other { protocol } => print_netflow!(
                self.ts,
                "ipv4/????",
                self.size,
                format!("{src_ip} --> {dst_ip} [proto: 0x{protocol:02x}]")
            ),
        }
    }
}

/// Converts a pcap record timestamp (time since the unix epoch)
fn timestamp(ts: Duration) -> Timestamp {
    i64::try_from(ts.as_secs())
        .ok()
        .and_then(|secs| Timestamp::new(secs, ts.subsec_nanos() as i32).ok())
        .unwrap_or(Timestamp::UNIX_EPOCH)
}

/// Prints every ipv4 packet contained in a capture file
///
/// ### Arguments
/// * `input` - Path to the capture file
/// * `json` - Print one json record per line instead of a table
pub fn dump(input: &Path, json: bool) -> anyhow::Result<()> {
    let file = File::open(input)
        .with_context(|| format!("unable to open capture {}", input.display()))?;
    let mut reader = PcapReader::new(BufReader::new(file))
        .with_context(|| format!("unable to read capture {}", input.display()))?;
    let link = LinkType::try_from(reader.header().datalink)?;

    if !json {
        print_netflow!(separator);
        print_netflow!(header);
        print_netflow!(separator);
    }

    while let Some(pkt) = reader.next_packet() {
        let pkt = pkt?;
        tracing::trace!("[netflow] read {} bytes", pkt.data.len());

        let Some((_, l3)) = link.split(&pkt.data) else {
            tracing::debug!("[netflow] skipping non-ipv4 frame");
            continue;
        };

        let Some(record) = NetflowRecord::parse(timestamp(pkt.timestamp), l3) else {
            continue;
        };

        match json {
            true => println!("{}", serde_json::to_string(&record)?),
            false => record.print(),
        }
    }

    if !json {
        print_netflow!(separator);
    }

    Ok(())
}

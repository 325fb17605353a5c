//! Natbox application

mod pcap;

use std::{
    fmt::Display,
    fs::File,
    io::{BufReader, BufWriter},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use natbox_core::{
    fragment::{make_fragments, Ipv4Fragmentation},
    Ipv4Packet, NatTable,
};
use pcap_file::{
    pcap::{PcapPacket, PcapReader, PcapWriter},
    DataLink,
};

use crate::{
    config::{NatboxConfig, YamlConfig},
    Command, Direction,
};

const ETHERNET_HDR_SZ: usize = 14;
const VLAN_TAG_SZ: usize = 4;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;

const MAX_BYTES: u64 = 1024;
const MAX_KILOBYTES: u64 = MAX_BYTES * 1024;
const MAX_MEGABYTES: u64 = MAX_KILOBYTES * 1024;
const MAX_GIGABYTES: u64 = MAX_MEGABYTES * 1024;
const MAX_TERABYTES: u64 = MAX_GIGABYTES * 1024;

macro_rules! human_bytes {
    ($b:expr) => {{
        match $b {
            x if x < MAX_BYTES => format!("{} B", $b),
            x if x < MAX_KILOBYTES => format!("{} KB", $b / MAX_BYTES),
            x if x < MAX_MEGABYTES => format!("{} MB", $b / MAX_KILOBYTES),
            x if x < MAX_GIGABYTES => format!("{} GB", $b / MAX_MEGABYTES),
            x if x < MAX_TERABYTES => format!("{} TB", $b / MAX_GIGABYTES),
            _ => format!("a whole lot, more than a petabyte"),
        }
    }};
}

/// Link layer of a capture file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II frames, optionally with one 802.1Q tag
    Ethernet,

    /// Bare ipv4 packets
    Raw,
}

impl TryFrom<DataLink> for LinkType {
    type Error = anyhow::Error;

    fn try_from(link: DataLink) -> Result<Self, Self::Error> {
        match link {
            DataLink::ETHERNET => Ok(Self::Ethernet),
            DataLink::RAW | DataLink::IPV4 => Ok(Self::Raw),
            link => Err(anyhow::anyhow!("unsupported pcap link type: {link:?}")),
        }
    }
}

impl LinkType {
    /// Splits a captured frame into its link-layer header and the ipv4 packet it
    /// carries, or `None` if the frame doesn't carry ipv4
    ///
    /// ### Arguments
    /// * `frame` - Captured bytes of one record
    pub fn split(self, frame: &[u8]) -> Option<(&[u8], &[u8])> {
        let hdr_sz = match self {
            Self::Raw => 0,
            Self::Ethernet => {
                if frame.len() < ETHERNET_HDR_SZ {
                    return None;
                }

                match u16::from_be_bytes([frame[12], frame[13]]) {
                    ETHERTYPE_IPV4 => ETHERNET_HDR_SZ,
                    ETHERTYPE_VLAN if frame.len() >= ETHERNET_HDR_SZ + VLAN_TAG_SZ => {
                        match u16::from_be_bytes([frame[16], frame[17]]) {
                            ETHERTYPE_IPV4 => ETHERNET_HDR_SZ + VLAN_TAG_SZ,
                            _ => return None,
                        }
                    }
                    _ => return None,
                }
            }
        };

        let (l2, l3) = frame.split_at(hdr_sz);
        match l3.first() {
            Some(b) if b >> 4 == 4 => Some((l2, l3)),
            _ => None,
        }
    }
}

/// Counters reported at the end of a replay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranslateStats {
    /// Records read from the input capture
    pub read: u64,

    /// Records that didn't carry ipv4
    pub skipped: u64,

    /// Fragments held back waiting for the rest of their datagram
    pub buffered: u64,

    /// Datagrams rejected by the reassembler or the nat table
    pub dropped: u64,

    /// Datagrams successfully translated
    pub translated: u64,

    /// Records written to the output capture
    pub written: u64,

    /// Bytes written to the output capture
    pub bytes: u64,
}

impl Display for TranslateStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "read:       {:>10}", self.read)?;
        writeln!(f, "skipped:    {:>10}", self.skipped)?;
        writeln!(f, "buffered:   {:>10}", self.buffered)?;
        writeln!(f, "dropped:    {:>10}", self.dropped)?;
        writeln!(f, "translated: {:>10}", self.translated)?;
        write!(
            f,
            "written:    {:>10} ({})",
            self.written,
            human_bytes!(self.bytes)
        )
    }
}

/// Runs captured frames through a NAT table
pub struct Translator {
    nat: NatTable,
    fragments: Option<Ipv4Fragmentation>,
    direction: Direction,
    target: Ipv4Addr,
    mtu: Option<usize>,
    stats: TranslateStats,
}

impl Translator {
    /// Creates a translator from a loaded configuration
    ///
    /// ### Arguments
    /// * `cfg` - NAT parameters and reassembly timeout
    /// * `direction` - Direction applied to every frame
    /// * `reassemble` - Reassemble fragments before translating them
    /// * `mtu` - Re-fragment translated datagrams larger than this
    pub fn new(
        cfg: &NatboxConfig,
        direction: Direction,
        reassemble: bool,
        mtu: Option<usize>,
    ) -> anyhow::Result<Self> {
        let nat = NatTable::with_param(&cfg.nat).context("invalid nat configuration")?;
        let fragments = reassemble.then(|| Ipv4Fragmentation::new(cfg.fragment_timeout));

        Ok(Self {
            nat,
            fragments,
            direction,
            target: cfg.nat.target_address,
            mtu,
            stats: TranslateStats::default(),
        })
    }

    pub fn stats(&self) -> TranslateStats {
        self.stats
    }

    /// Translates one captured frame, returning the frames to write out
    ///
    /// Frames that don't carry ipv4 are skipped, datagrams the table rejects are
    /// dropped. Both cases return an empty list.
    ///
    /// ### Arguments
    /// * `link` - Link layer of the capture
    /// * `frame` - Captured bytes
    /// * `tick` - Capture time, in milliseconds
    pub fn process(&mut self, link: LinkType, frame: &[u8], tick: u64) -> Vec<Vec<u8>> {
        self.stats.read += 1;

        let Some((l2, l3)) = link.split(frame) else {
            tracing::debug!(len = frame.len(), "[natbox] skipping non-ipv4 frame");
            self.stats.skipped += 1;
            return Vec::new();
        };

        let mut datagram = match self.fragments.as_mut() {
            Some(fragments) => {
                fragments.collect_garbage(tick);
                match fragments.combine(l3, tick) {
                    Ok(Some(datagram)) => datagram,
                    Ok(None) => {
                        self.stats.buffered += 1;
                        return Vec::new();
                    }
                    Err(error) => {
                        tracing::warn!(%error, "[natbox] dropping fragment");
                        self.stats.dropped += 1;
                        return Vec::new();
                    }
                }
            }
            None => l3.to_vec(),
        };

        let incoming = match self.direction {
            Direction::Outgoing => false,
            Direction::Incoming => true,
            Direction::Auto => Ipv4Packet::new_checked(&datagram[..])
                .is_ok_and(|pkt| pkt.dst() == self.target),
        };

        let res = match incoming {
            true => self.nat.translate_incoming(&mut datagram, tick),
            false => self.nat.translate_outgoing(&mut datagram, tick),
        };

        if let Err(error) = res {
            tracing::warn!(%error, incoming, "[natbox] dropping packet");
            self.stats.dropped += 1;
            return Vec::new();
        }

        self.stats.translated += 1;

        let datagrams = match self.mtu {
            Some(mtu) => match make_fragments(&datagram, mtu) {
                Ok(datagrams) => datagrams,
                Err(error) => {
                    tracing::warn!(%error, mtu, "[natbox] unable to fragment packet");
                    self.stats.dropped += 1;
                    return Vec::new();
                }
            },
            None => vec![datagram],
        };

        datagrams
            .into_iter()
            .map(|datagram| {
                let mut out = Vec::with_capacity(l2.len() + datagram.len());
                out.extend_from_slice(l2);
                out.extend_from_slice(&datagram);
                self.stats.written += 1;
                self.stats.bytes += out.len() as u64;
                out
            })
            .collect()
    }
}

/// Internal application state
pub struct App {
    /// Path to the configuration file
    config: PathBuf,
}

impl App {
    /// Creates a new application
    ///
    /// ### Arguments
    /// * `config` - Path to the configuration file, only read by commands that need it
    pub fn new(config: PathBuf) -> Self {
        Self { config }
    }

    /// Runs the command passed on the command line
    pub fn run(self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Translate {
                input,
                output,
                direction,
                reassemble,
                mtu,
            } => self.translate(&input, &output, direction, reassemble, mtu),
            Command::Dump { input, json } => pcap::dump(&input, json),
        }
    }

    fn translate(
        self,
        input: &Path,
        output: &Path,
        direction: Direction,
        reassemble: bool,
        mtu: Option<usize>,
    ) -> anyhow::Result<()> {
        let cfg = NatboxConfig::read_yaml_from_file(&self.config)?;
        tracing::debug!("loaded configuration:\n{cfg:#?}");

        let mut translator = Translator::new(&cfg, direction, reassemble, mtu)?;

        let file = File::open(input)
            .with_context(|| format!("unable to open capture {}", input.display()))?;
        let mut reader = PcapReader::new(BufReader::new(file))
            .with_context(|| format!("unable to read capture {}", input.display()))?;

        let header = reader.header();
        let link = LinkType::try_from(header.datalink)?;

        let file = File::create(output)
            .with_context(|| format!("unable to create capture {}", output.display()))?;
        let mut writer = PcapWriter::with_header(BufWriter::new(file), header)?;

        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            ?link,
            ?direction,
            "[natbox] replaying capture"
        );

        while let Some(pkt) = reader.next_packet() {
            let pkt = pkt?;
            let tick = u64::try_from(pkt.timestamp.as_millis()).unwrap_or(u64::MAX);

            for frame in translator.process(link, &pkt.data, tick) {
                let len = u32::try_from(frame.len())?;
                writer.write_packet(&PcapPacket::new(pkt.timestamp, len, &frame))?;
            }
        }

        let stats = translator.stats();
        tracing::info!(?stats, "[natbox] replay complete");
        println!("{stats}");

        Ok(())
    }
}

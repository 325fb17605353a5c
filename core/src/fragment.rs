//! IPv4 fragmentation and reassembly (RFC 791, RFC 815, RFC 5722)

use std::collections::{BTreeMap, HashMap};

use crate::{ipv4::Ipv4PacketIdentifier, Ipv4Packet, ProtocolError};

/// Largest possible IPv4 datagram
const MAX_DATAGRAM_SZ: usize = 65535;

/// Fragment offsets count in blocks of 8 octets
const FRAGMENT_BLOCK_SZ: usize = 8;

/// A datagram being put back together
#[derive(Debug)]
struct Ipv4FragmentedPacket {
    /// Header of the first fragment, once it arrived
    header: Option<Vec<u8>>,

    /// Payload pieces, keyed by byte offset
    pieces: BTreeMap<usize, Vec<u8>>,

    /// Payload length, known once the last fragment arrived
    total: Option<usize>,

    /// Tick at which the first piece (in arrival order) was received
    created: u64,
}

impl Ipv4FragmentedPacket {
    fn new(tick: u64) -> Self {
        Self {
            header: None,
            pieces: BTreeMap::new(),
            total: None,
            created: tick,
        }
    }

    /// Returns an error if `data` at `offset` disagrees with a piece already stored
    fn check_overlap(&self, offset: usize, data: &[u8]) -> Result<(), ProtocolError> {
        let end = offset + data.len();
        for (&start, piece) in self.pieces.range(..end) {
            let piece_end = start + piece.len();
            if piece_end <= offset {
                continue;
            }

            let lo = offset.max(start);
            let hi = end.min(piece_end);
            if data[lo - offset..hi - offset] != piece[lo - start..hi - start] {
                return Err(ProtocolError::MalformedPacket(format!(
                    "fragment {offset}..{end} conflicts with {start}..{piece_end}"
                )));
            }
        }

        Ok(())
    }

    /// True once the first and last fragments are present and the pieces cover the
    /// payload without holes
    fn is_complete(&self) -> bool {
        let (Some(_), Some(total)) = (&self.header, self.total) else {
            return false;
        };

        let mut covered = 0;
        for (&start, piece) in &self.pieces {
            if start > covered {
                return false;
            }
            covered = covered.max(start + piece.len());
        }

        covered >= total
    }

    /// Furthest payload byte known so far: the total once the last fragment
    /// arrived, the end of the furthest piece otherwise
    fn payload_end(&self) -> usize {
        let furthest = self
            .pieces
            .iter()
            .map(|(start, piece)| start + piece.len())
            .max()
            .unwrap_or_default();
        self.total.unwrap_or_default().max(furthest)
    }

    fn assemble(self) -> Result<Vec<u8>, ProtocolError> {
        let header = self
            .header
            .ok_or_else(|| ProtocolError::Other(String::from("reassembly without first fragment")))?;
        let total = self.total.unwrap_or_default();

        let hdr_sz = header.len();
        let total_len = u16::try_from(hdr_sz + total).map_err(|_| {
            ProtocolError::MalformedPacket(format!(
                "reassembled datagram exceeds {MAX_DATAGRAM_SZ} bytes ({})",
                hdr_sz + total
            ))
        })?;

        let mut buf = vec![0u8; hdr_sz + total];
        buf[..hdr_sz].copy_from_slice(&header);
        for (start, piece) in self.pieces {
            let end = (start + piece.len()).min(total);
            if start < end {
                buf[hdr_sz + start..hdr_sz + end].copy_from_slice(&piece[..end - start]);
            }
        }

        let mut pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
        pkt.set_total_len(total_len);
        pkt.set_mf(false);
        pkt.set_frag_offset(0);
        pkt.update_checksum();
        Ok(buf)
    }
}

/// Reassembly table for fragmented IPv4 datagrams
#[derive(Debug)]
pub struct Ipv4Fragmentation {
    packets: HashMap<Ipv4PacketIdentifier, Ipv4FragmentedPacket>,

    /// Ticks an incomplete datagram is kept around
    timeout: u64,
}

impl Ipv4Fragmentation {
    /// Creates an empty reassembly table
    ///
    /// ### Arguments
    /// * `timeout` - Number of ticks after which incomplete datagrams are dropped
    pub fn new(timeout: u64) -> Self {
        Self {
            packets: HashMap::new(),
            timeout,
        }
    }

    /// Number of datagrams currently waiting for fragments
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Feeds one packet into the table
    ///
    /// Returns the packet itself if it isn't fragmented, the reassembled datagram if
    /// this fragment completed one, or `None` while fragments are still missing.
    /// A fragment that conflicts with data already received discards the whole
    /// datagram.
    ///
    /// ### Arguments
    /// * `packet` - IPv4 packet (header + payload)
    /// * `tick` - Current time
    pub fn combine(&mut self, packet: &[u8], tick: u64) -> Result<Option<Vec<u8>>, ProtocolError> {
        let pkt = Ipv4Packet::new_checked(packet)?;
        let total_len = usize::from(pkt.total_len());
        if !pkt.is_fragment() {
            return Ok(Some(packet[..total_len].to_vec()));
        }

        let key = pkt.identifier();
        let offset = usize::from(pkt.frag_offset()) * FRAGMENT_BLOCK_SZ;
        let data = pkt.payload();
        let end = offset + data.len();

        if pkt.is_mf() && (data.is_empty() || data.len() % FRAGMENT_BLOCK_SZ != 0) {
            return Err(ProtocolError::MalformedPacket(format!(
                "fragment length {} is not a multiple of 8",
                data.len()
            )));
        }

        if pkt.header_size() + end > MAX_DATAGRAM_SZ {
            return Err(ProtocolError::MalformedPacket(format!(
                "fragment ends past the maximum datagram size ({end})"
            )));
        }

        let entry = self
            .packets
            .entry(key)
            .or_insert_with(|| Ipv4FragmentedPacket::new(tick));

        // the reassembled datagram carries the header of the first fragment
        let first_hdr_sz = match offset {
            0 => Some(pkt.header_size()),
            _ => entry.header.as_ref().map(Vec::len),
        };

        let conflict = match entry.check_overlap(offset, data) {
            Err(e) => Some(e),
            Ok(()) if !pkt.is_mf() && entry.total.is_some_and(|t| t != end) => Some(
                ProtocolError::MalformedPacket(String::from("conflicting last fragments")),
            ),
            Ok(()) if pkt.is_mf() && entry.total.is_some_and(|t| end > t) => {
                Some(ProtocolError::MalformedPacket(format!(
                    "fragment ends at {end}, past the last fragment"
                )))
            }
            Ok(()) if !pkt.is_mf() && entry.payload_end() > end => {
                Some(ProtocolError::MalformedPacket(format!(
                    "last fragment ends at {end}, before data already received"
                )))
            }
            Ok(())
                if first_hdr_sz
                    .is_some_and(|h| h + end.max(entry.payload_end()) > MAX_DATAGRAM_SZ) =>
            {
                Some(ProtocolError::MalformedPacket(format!(
                    "reassembled datagram would exceed {MAX_DATAGRAM_SZ} bytes"
                )))
            }
            Ok(()) => None,
        };

        if let Some(e) = conflict {
            tracing::debug!(?key, "[frag] dropping datagram: {e}");
            self.packets.remove(&key);
            return Err(e);
        }

        if offset == 0 {
            entry.header = Some(pkt.header().to_vec());
        }

        if !pkt.is_mf() {
            entry.total = Some(end);
        }

        entry.pieces.insert(offset, data.to_vec());
        tracing::trace!(?key, offset, end, more = pkt.is_mf(), "[frag] stored fragment");

        if !entry.is_complete() {
            return Ok(None);
        }

        match self.packets.remove(&key) {
            Some(packet) => packet.assemble().map(Some),
            None => Ok(None),
        }
    }

    /// Drops incomplete datagrams whose first fragment is at least `timeout` ticks old
    pub fn collect_garbage(&mut self, tick: u64) {
        let timeout = self.timeout;
        let before = self.packets.len();
        self.packets
            .retain(|_, p| tick.saturating_sub(p.created) < timeout);

        let dropped = before - self.packets.len();
        if dropped > 0 {
            tracing::debug!(dropped, "[frag] expired incomplete datagrams");
        }
    }
}

/// Splits a datagram into fragments no larger than `mtu` bytes
///
/// Every fragment carries a copy of the original header (including options). A
/// datagram that already fits is returned unchanged.
///
/// ### Arguments
/// * `packet` - IPv4 packet (header + payload), may itself be a fragment
/// * `mtu` - Maximum size of each fragment, header included
pub fn make_fragments(packet: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let pkt = Ipv4Packet::new_checked(packet)?;
    let total_len = usize::from(pkt.total_len());
    if total_len <= mtu {
        return Ok(vec![packet[..total_len].to_vec()]);
    }

    if pkt.is_df() {
        return Err(ProtocolError::FragmentationRequired(total_len));
    }

    let hdr_sz = pkt.header_size();
    let chunk_sz = mtu.saturating_sub(hdr_sz) / FRAGMENT_BLOCK_SZ * FRAGMENT_BLOCK_SZ;
    if chunk_sz == 0 {
        return Err(ProtocolError::Other(format!(
            "mtu {mtu} too small for a {hdr_sz} byte header"
        )));
    }

    let base = usize::from(pkt.frag_offset()) * FRAGMENT_BLOCK_SZ;
    let more_after = pkt.is_mf();
    let payload = pkt.payload();
    let count = payload.len().div_ceil(chunk_sz);

    let fragments = payload
        .chunks(chunk_sz)
        .enumerate()
        .map(|(i, chunk)| {
            let mut buf = Vec::with_capacity(hdr_sz + chunk.len());
            buf.extend_from_slice(pkt.header());
            buf.extend_from_slice(chunk);

            let mut frag = Ipv4Packet::new_unchecked(&mut buf[..]);
            frag.set_total_len((hdr_sz + chunk.len()) as u16);
            frag.set_frag_offset(((base + i * chunk_sz) / FRAGMENT_BLOCK_SZ) as u16);
            frag.set_mf(i + 1 < count || more_after);
            frag.update_checksum();
            buf
        })
        .collect();

    Ok(fragments)
}

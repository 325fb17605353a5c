//! Checksum related functions
//!
//! All arithmetic is the 16-bit one's complement sum used by IPv4, ICMP, TCP and UDP
//! (RFC 1071). Sums are carried around as folded `u32` values so partial sums (pseudo
//! header, header, payload) can be chained through the `add` argument.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::cast;

/// Computes the checksum used in various networking protocols
///
/// Algorithm is the one's complement of the sum of the data as big-endian u16 values
///
/// ### Arguments
/// * `data` - Data to checksum
pub fn checksum(data: &[u8]) -> u16 {
    !fold(one_complement_sum(data, 0))
}

/// Sums `data` as big-endian 16-bit words, folding carries back into the low 16 bits
///
/// A trailing odd byte is treated as if padded with a zero byte. The result is always
/// `<= 0xFFFF` so it can be passed back in as `add` for the next chunk of data.
///
/// ### Arguments
/// * `data` - Data to sum
/// * `add` - Initial value of the accumulator
pub fn one_complement_sum(data: &[u8], add: u32) -> u32 {
    let mut sum = u64::from(add);
    let mut chunks = data.chunks_exact(2);
    for b in &mut chunks {
        sum += u64::from(cast!(be16, b));
    }

    if let [b0] = chunks.remainder() {
        sum += u64::from(u16::from_be_bytes([*b0, 0x00]));
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u32
}

/// Folds a 32-bit accumulator into a 16-bit one's complement sum
pub fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Incrementally updates a checksum after a field changed from `old` to `new`
///
/// Implements eqn. 3 of RFC 1624: `HC' = ~(~HC + ~m + m')`, applied word by word.
/// Both slices must have the same, even, length.
///
/// ### Arguments
/// * `original` - Checksum as currently stored in the packet
/// * `old` - Bytes of the field(s) before the change
/// * `new` - Bytes of the field(s) after the change
pub fn adjust(original: u16, old: &[u8], new: &[u8]) -> u16 {
    debug_assert_eq!(old.len(), new.len());
    debug_assert_eq!(old.len() % 2, 0);

    let mut sum = u32::from(!original);
    for (o, n) in old.chunks_exact(2).zip(new.chunks_exact(2)) {
        sum += u32::from(!cast!(be16, o));
        sum += u32::from(cast!(be16, n));
    }

    !fold(sum)
}

/// Returns the TCP/UDP checksum after one IPv4 address and one port were replaced
///
/// The address is part of the pseudo header, the port part of the transport header;
/// both contribute to the same checksum so they are adjusted together.
///
/// ### Arguments
/// * `original` - Current transport checksum
/// * `old_ip` / `new_ip` - Address before / after translation
/// * `old_port` / `new_port` - Port before / after translation
pub fn updated_checksum(
    original: u16,
    old_ip: Ipv4Addr,
    new_ip: Ipv4Addr,
    old_port: u16,
    new_port: u16,
) -> u16 {
    let mut old = [0u8; 6];
    old[0..4].copy_from_slice(&old_ip.octets());
    old[4..6].copy_from_slice(&old_port.to_be_bytes());

    let mut new = [0u8; 6];
    new[0..4].copy_from_slice(&new_ip.octets());
    new[4..6].copy_from_slice(&new_port.to_be_bytes());

    adjust(original, &old, &new)
}

/// Computes the (folded, uncomplemented) IPv4 pseudo-header sum as used by TCP and UDP
///
/// The pseudo-header consists of:
/// * Source IP (32 bits)
/// * Destination IP (32 bits)
/// * Zero (8 bits) + Protocol (8 bits)
/// * Header + Payload Length (16 bits)
///
/// ### Arguments
/// * `src` - Source IPv4 Address
/// * `dst` - Destination IPv4 Address
/// * `proto` - Protocol Number (i.e. 6 for TCP)
/// * `len` - Length of the TCP/UDP header + payload
pub fn ph_sum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: u16) -> u32 {
    let mut sum = one_complement_sum(&src.octets(), 0);
    sum = one_complement_sum(&dst.octets(), sum);
    sum += u32::from(proto);
    sum += u32::from(len);
    u32::from(fold(sum))
}

/// Computes the (folded, uncomplemented) IPv6 pseudo-header sum (RFC 8200, section 8.1)
///
/// Unlike IPv4 the length is 32 bits wide and the next header value sits in the last
/// byte of a 32-bit word preceded by three zero bytes.
///
/// ### Arguments
/// * `src` - Source IPv6 Address
/// * `dst` - Destination IPv6 Address
/// * `next_header` - Upper-layer protocol number
/// * `len` - Upper-layer packet length
pub fn ph6_sum(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, len: u32) -> u32 {
    let mut sum = one_complement_sum(&src.octets(), 0);
    sum = one_complement_sum(&dst.octets(), sum);
    sum = one_complement_sum(&len.to_be_bytes(), sum);
    sum += u32::from(next_header);
    u32::from(fold(sum))
}

/// Computes the pseudo-header checksum as used by TCP and UDP over IPv4
///
/// The checksum field inside `data` is expected to be zero.
///
/// ### Arguments
/// * `src` - Source IPv4 Address
/// * `dst` - Destination IPv4 Address
/// * `proto` - Protocol Number (i.e. 6 for TCP)
/// * `data` - TCP/UDP header + payload
pub fn ph_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, data: &[u8]) -> u16 {
    let sum = ph_sum(src, dst, proto, (data.len() & 0xFFFF) as u16);
    !fold(one_complement_sum(data, sum))
}

/// Computes the pseudo-header checksum as used by TCP and UDP over IPv6
///
/// ### Arguments
/// * `src` - Source IPv6 Address
/// * `dst` - Destination IPv6 Address
/// * `next_header` - Upper-layer protocol number
/// * `data` - Upper-layer header + payload
pub fn ph6_checksum(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, data: &[u8]) -> u16 {
    let sum = ph6_sum(src, dst, next_header, data.len() as u32);
    !fold(one_complement_sum(data, sum))
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use rand::Rng;

    use super::{
        adjust, checksum, one_complement_sum, ph6_checksum, ph_checksum, ph_sum,
        updated_checksum,
    };

    // TCP/IP packet with checksums zero'd out
    const PKT: [u8; 144] = [
        0x52, 0x54, 0x00, 0x81, 0xf1, 0x33, 0x00, 0x56, 0x50, 0xde, 0xad, 0x00, 0x08, 0x00, 0x45,
        0x00, 0x00, 0x82, 0x42, 0xcd, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0x0a, 0x43, 0xd5, 0x64,
        0x22, 0xa0, 0x6f, 0x91, 0x88, 0xce, 0x00, 0x50, 0xe1, 0xff, 0xf9, 0x7d, 0x3a, 0x1b, 0xca,
        0x1e, 0x80, 0x18, 0x03, 0xec, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x08, 0x0a, 0x0b, 0xeb,
        0x07, 0x19, 0x71, 0xcb, 0x4d, 0xf2, 0x47, 0x45, 0x54, 0x20, 0x2f, 0x70, 0x6c, 0x61, 0x69,
        0x6e, 0x20, 0x48, 0x54, 0x54, 0x50, 0x2f, 0x31, 0x2e, 0x31, 0x0d, 0x0a, 0x48, 0x6f, 0x73,
        0x74, 0x3a, 0x20, 0x69, 0x70, 0x65, 0x63, 0x68, 0x6f, 0x2e, 0x6e, 0x65, 0x74, 0x0d, 0x0a,
        0x55, 0x73, 0x65, 0x72, 0x2d, 0x41, 0x67, 0x65, 0x6e, 0x74, 0x3a, 0x20, 0x57, 0x67, 0x65,
        0x74, 0x0d, 0x0a, 0x43, 0x6f, 0x6e, 0x6e, 0x65, 0x63, 0x74, 0x69, 0x6f, 0x6e, 0x3a, 0x20,
        0x63, 0x6c, 0x6f, 0x73, 0x65, 0x0d, 0x0a, 0x0d, 0x0a,
    ];

    fn get_ipv4_src() -> Ipv4Addr {
        Ipv4Addr::new(PKT[26], PKT[27], PKT[28], PKT[29])
    }

    fn get_ipv4_dst() -> Ipv4Addr {
        Ipv4Addr::new(PKT[30], PKT[31], PKT[32], PKT[33])
    }

    fn get_ipv4_proto() -> u8 {
        PKT[23]
    }

    fn get_ipv4_payload() -> &'static [u8] {
        &PKT[34..]
    }

    #[test]
    fn valid_ip_checksum() {
        let csum = checksum(&PKT[14..34]);
        assert_eq!(csum, 0x85d0, "bad ip checksum");
    }

    #[test]
    fn invalid_ip_checksum() {
        let csum = checksum(&PKT[13..33]);
        assert_ne!(csum, 0x85d0, "got correct ip checksum, expected bad value");
    }

    #[test]
    fn valid_pseudo_header_sum() {
        let payload = get_ipv4_payload();
        let sum = ph_sum(
            get_ipv4_src(),
            get_ipv4_dst(),
            get_ipv4_proto(),
            payload.len() as u16,
        );
        assert_eq!(sum, 0x724d, "bad psuedo-header sum");
    }

    #[test]
    fn valid_full_cusm() {
        let full = ph_checksum(
            get_ipv4_src(),
            get_ipv4_dst(),
            get_ipv4_proto(),
            get_ipv4_payload(),
        );
        assert_eq!(full, 0x854c, "bad full psuedo-header checksum");
    }

    #[test]
    fn invalid_full_csum() {
        let full = ph_checksum(
            Ipv4Addr::new(0, 0, 0, 0),
            get_ipv4_dst(),
            get_ipv4_proto(),
            get_ipv4_payload(),
        );
        assert_ne!(
            full, 0x854c,
            "got correct full checksum, expected bad value"
        );
    }

    #[test]
    fn odd_length_is_zero_padded() {
        assert_eq!(
            one_complement_sum(&[0x12, 0x34, 0x56], 0),
            one_complement_sum(&[0x12, 0x34, 0x56, 0x00], 0)
        );
    }

    #[test]
    fn sums_chain_through_add() {
        let whole = one_complement_sum(&PKT[14..], 0);
        let head = one_complement_sum(&PKT[14..34], 0);
        assert_eq!(one_complement_sum(&PKT[34..], head), whole);
    }

    #[test]
    fn filled_checksum_sums_to_zero() {
        let mut hdr = PKT[14..34].to_vec();
        let csum = checksum(&hdr);
        hdr[10..12].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(checksum(&hdr), 0);
    }

    #[test]
    fn incremental_update_matches_recompute() {
        let mut rng = rand::thread_rng();
        let src = get_ipv4_src();
        let dst = get_ipv4_dst();
        let proto = get_ipv4_proto();

        let mut segment = get_ipv4_payload().to_vec();
        let csum = ph_checksum(src, dst, proto, &segment);
        segment[16..18].copy_from_slice(&csum.to_be_bytes());
        let old_port = u16::from_be_bytes([segment[0], segment[1]]);

        for _ in 0..2000 {
            let new_ip = Ipv4Addr::from(rng.gen::<u32>());
            let new_port: u16 = rng.gen();

            let mut mutated = segment.clone();
            mutated[0..2].copy_from_slice(&new_port.to_be_bytes());
            mutated[16..18].copy_from_slice(&[0, 0]);
            let expected = ph_checksum(new_ip, dst, proto, &mutated);

            let updated = updated_checksum(csum, src, new_ip, old_port, new_port);
            assert_eq!(
                updated, expected,
                "incremental update diverged for {new_ip}:{new_port}"
            );
        }
    }

    #[test]
    fn adjust_with_no_change_is_identity() {
        let csum = checksum(&PKT[14..34]);
        assert_eq!(adjust(csum, &PKT[26..30], &PKT[26..30]), csum);
    }

    #[test]
    fn ipv6_pseudo_header_layout() {
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let dst: Ipv6Addr = "fe80::2".parse().unwrap();
        let data = [0x12u8, 0x34, 0x56, 0x78, 0x00, 0x08, 0x00, 0x00];

        let mut manual = Vec::new();
        manual.extend_from_slice(&src.octets());
        manual.extend_from_slice(&dst.octets());
        manual.extend_from_slice(&(data.len() as u32).to_be_bytes());
        manual.extend_from_slice(&[0, 0, 0, 17]);
        manual.extend_from_slice(&data);

        assert_eq!(ph6_checksum(src, dst, 17, &data), checksum(&manual));
    }
}

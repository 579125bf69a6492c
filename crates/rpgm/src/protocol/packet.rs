// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PGM packet framing: header codec, checksum, type-specific bodies and the
//! two parse variants (raw IP and UDP-encapsulated).
//!
//! Packet layout (network byte order):
//!
//! ```text
//! +--------+--------+--------+--------+
//! | source port     | destination port|
//! | type   | options| checksum        |
//! | global session identifier ...     |
//! | ...  gsi        | tsdu length     |
//! | type-specific body ...            |
//! +--------+--------+--------+--------+
//! ```

use crate::buffer::SkBuff;
use crate::config::{IPPROTO_PGM, PGM_HEADER_LEN};
use crate::protocol::tsi::{Gsi, Tsi};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ============================================================================
// Constants
// ============================================================================

/// Address family indicator for IPv4 network-layer addresses.
pub const AFI_IP: u16 = 1;
/// Address family indicator for IPv6 network-layer addresses.
pub const AFI_IP6: u16 = 2;

/// Header options flag: options area present after the type-specific header.
pub const OPT_PRESENT: u8 = 0x01;

/// Option type: total options length (always first).
pub const OPT_LENGTH: u8 = 0x00;
/// Option type: APDU fragmentation descriptor.
pub const OPT_FRAGMENT: u8 = 0x01;
/// Flag on the option type byte marking the final option.
pub const OPT_END: u8 = 0x80;

const OPT_LENGTH_LEN: usize = 4;
const OPT_FRAGMENT_LEN: usize = 16;

/// Fixed body length of ODATA/RDATA before options and payload.
pub const DATA_HEADER_LEN: usize = 8;

// ============================================================================
// Packet types
// ============================================================================

/// PGM packet type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PgmType {
    Spm = 0x00,
    Poll = 0x01,
    Polr = 0x02,
    Odata = 0x04,
    Rdata = 0x05,
    Nak = 0x08,
    Nnak = 0x09,
    Ncf = 0x0a,
    Spmr = 0x0c,
}

impl PgmType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PgmType::Spm),
            0x01 => Some(PgmType::Poll),
            0x02 => Some(PgmType::Polr),
            0x04 => Some(PgmType::Odata),
            0x05 => Some(PgmType::Rdata),
            0x08 => Some(PgmType::Nak),
            0x09 => Some(PgmType::Nnak),
            0x0a => Some(PgmType::Ncf),
            0x0c => Some(PgmType::Spmr),
            _ => None,
        }
    }

    /// Source-to-receiver packet types.
    #[must_use]
    pub fn is_downstream(self) -> bool {
        matches!(
            self,
            PgmType::Spm | PgmType::Odata | PgmType::Rdata | PgmType::Ncf
        )
    }

    /// Receiver-to-source packet types.
    #[must_use]
    pub fn is_upstream(self) -> bool {
        matches!(self, PgmType::Nak | PgmType::Nnak | PgmType::Spmr)
    }

    /// Receiver-to-receiver packet types.
    #[must_use]
    pub fn is_peer(self) -> bool {
        matches!(self, PgmType::Nak | PgmType::Spmr)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            PgmType::Spm => "SPM",
            PgmType::Poll => "POLL",
            PgmType::Polr => "POLR",
            PgmType::Odata => "ODATA",
            PgmType::Rdata => "RDATA",
            PgmType::Nak => "NAK",
            PgmType::Nnak => "NNAK",
            PgmType::Ncf => "NCF",
            PgmType::Spmr => "SPMR",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Packet validation failures.
///
/// The checksum variant is distinguished because the classifier attributes
/// it to a dedicated counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Packet shorter than the framing requires.
    Truncated,
    /// PGM checksum mismatch.
    Checksum,
    /// Raw-IP framing does not carry PGM.
    BadProtocol(u8),
    /// Unassigned PGM type value.
    UnknownType(u8),
    /// Structurally invalid field.
    Malformed(&'static str),
    /// No destination address recoverable from ancillary data.
    NoDestination,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated => write!(f, "truncated packet"),
            ParseError::Checksum => write!(f, "checksum mismatch"),
            ParseError::BadProtocol(p) => write!(f, "not a PGM packet (ip proto {})", p),
            ParseError::UnknownType(t) => write!(f, "unknown PGM type {:#x}", t),
            ParseError::Malformed(what) => write!(f, "malformed {}", what),
            ParseError::NoDestination => write!(f, "no destination address recoverable"),
        }
    }
}

impl std::error::Error for ParseError {}

// ============================================================================
// Header codec
// ============================================================================

/// Decoded fixed PGM header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgmHeader {
    pub sport: u16,
    pub dport: u16,
    pub pgm_type: PgmType,
    pub options: u8,
    pub checksum: u16,
    pub gsi: Gsi,
    pub tsdu_len: u16,
}

impl PgmHeader {
    /// Decode the fixed header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < PGM_HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        let pgm_type = PgmType::from_u8(buf[4]).ok_or(ParseError::UnknownType(buf[4]))?;
        let mut gsi = [0u8; 6];
        gsi.copy_from_slice(&buf[8..14]);
        Ok(Self {
            sport: u16::from_be_bytes([buf[0], buf[1]]),
            dport: u16::from_be_bytes([buf[2], buf[3]]),
            pgm_type,
            options: buf[5],
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
            gsi: Gsi::new(gsi),
            tsdu_len: u16::from_be_bytes([buf[14], buf[15]]),
        })
    }

    /// Sender TSI as stated in the header.
    #[must_use]
    pub fn sender_tsi(&self) -> Tsi {
        Tsi::new(self.gsi, self.sport)
    }

    /// Subject TSI for upstream and peer-to-peer messages, where the port
    /// pair is reversed and the destination port names the source session.
    #[must_use]
    pub fn subject_tsi(&self) -> Tsi {
        Tsi::new(self.gsi, self.dport)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sport.to_be_bytes());
        out.extend_from_slice(&self.dport.to_be_bytes());
        out.push(self.pgm_type as u8);
        out.push(self.options);
        out.extend_from_slice(&[0, 0]); // checksum patched after the body
        out.extend_from_slice(self.gsi.as_bytes());
        out.extend_from_slice(&self.tsdu_len.to_be_bytes());
    }
}

// ============================================================================
// Checksum
// ============================================================================

/// Internet ones-complement checksum over `buf`.
///
/// The caller zeroes the checksum field before computing.
#[must_use]
pub fn internet_checksum(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = buf.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Verify the PGM checksum of a whole packet (header plus body).
#[must_use]
pub fn verify_checksum(packet: &[u8]) -> bool {
    if packet.len() < PGM_HEADER_LEN {
        return false;
    }
    let stored = u16::from_be_bytes([packet[6], packet[7]]);
    let mut sum: u32 = 0;
    for (i, pair) in packet.chunks(2).enumerate() {
        if i == 3 {
            continue; // checksum field counts as zero
        }
        let word = match pair {
            [a, b] => u16::from_be_bytes([*a, *b]),
            [a] => u16::from_be_bytes([*a, 0]),
            _ => unreachable!(),
        };
        sum += u32::from(word);
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16) == stored
}

fn patch_checksum(packet: &mut [u8]) {
    packet[6] = 0;
    packet[7] = 0;
    let sum = internet_checksum(packet);
    packet[6..8].copy_from_slice(&sum.to_be_bytes());
}

// ============================================================================
// Type-specific bodies
// ============================================================================

/// ODATA/RDATA fixed body: sequence number and advertised trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub sqn: u32,
    pub trail: u32,
}

impl DataHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < DATA_HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        Ok(Self {
            sqn: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            trail: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// SPM body: sequence ordering, window bounds, path network-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpmInfo {
    pub sqn: u32,
    pub trail: u32,
    pub lead: u32,
    pub path: IpAddr,
}

impl SpmInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 16 {
            return Err(ParseError::Truncated);
        }
        let (path, _) = decode_nla(&buf[12..])?;
        Ok(Self {
            sqn: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            trail: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            lead: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            path,
        })
    }
}

/// NAK/NNAK/NCF body: requested sequence plus source and group addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakInfo {
    pub sqn: u32,
    pub source: IpAddr,
    pub group: IpAddr,
}

impl NakInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 4 {
            return Err(ParseError::Truncated);
        }
        let sqn = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let (source, used) = decode_nla(&buf[4..])?;
        let (group, _) = decode_nla(&buf[4 + used..])?;
        Ok(Self { sqn, source, group })
    }
}

/// APDU fragmentation descriptor carried in the options area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Sequence number of the first TPDU of the APDU.
    pub first_sqn: u32,
    /// Byte offset of this fragment within the APDU.
    pub offset: u32,
    /// Total APDU length in bytes.
    pub apdu_len: u32,
}

/// Network-layer address: AFI, reserved, address bytes.
fn decode_nla(buf: &[u8]) -> Result<(IpAddr, usize), ParseError> {
    if buf.len() < 4 {
        return Err(ParseError::Truncated);
    }
    let afi = u16::from_be_bytes([buf[0], buf[1]]);
    match afi {
        AFI_IP => {
            if buf.len() < 8 {
                return Err(ParseError::Truncated);
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[4..8]);
            Ok((IpAddr::V4(Ipv4Addr::from(octets)), 8))
        }
        AFI_IP6 => {
            if buf.len() < 20 {
                return Err(ParseError::Truncated);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            Ok((IpAddr::V6(Ipv6Addr::from(octets)), 20))
        }
        _ => Err(ParseError::Malformed("nla afi")),
    }
}

fn encode_nla(addr: IpAddr, out: &mut Vec<u8>) {
    match addr {
        IpAddr::V4(v4) => {
            out.extend_from_slice(&AFI_IP.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.extend_from_slice(&AFI_IP6.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&v6.octets());
        }
    }
}

/// Walk the options area, returning the fragment descriptor when present
/// and the number of bytes consumed.
pub fn decode_options(buf: &[u8]) -> Result<(Option<FragmentInfo>, usize), ParseError> {
    let mut offset = 0usize;
    let mut fragment = None;
    loop {
        if buf.len() < offset + 2 {
            return Err(ParseError::Truncated);
        }
        let opt_type = buf[offset];
        let opt_len = buf[offset + 1] as usize;
        if opt_len < 2 || buf.len() < offset + opt_len {
            return Err(ParseError::Malformed("option length"));
        }
        let body = &buf[offset + 2..offset + opt_len];
        match opt_type & !OPT_END {
            OPT_LENGTH => {
                if opt_len != OPT_LENGTH_LEN {
                    return Err(ParseError::Malformed("opt_length"));
                }
            }
            OPT_FRAGMENT => {
                if opt_len != OPT_FRAGMENT_LEN {
                    return Err(ParseError::Malformed("opt_fragment"));
                }
                fragment = Some(FragmentInfo {
                    first_sqn: u32::from_be_bytes([body[2], body[3], body[4], body[5]]),
                    offset: u32::from_be_bytes([body[6], body[7], body[8], body[9]]),
                    apdu_len: u32::from_be_bytes([body[10], body[11], body[12], body[13]]),
                });
            }
            // unrecognised options are skipped, not fatal
            _ => {}
        }
        offset += opt_len;
        if opt_type & OPT_END != 0 {
            return Ok((fragment, offset));
        }
    }
}

fn encode_options(fragment: Option<FragmentInfo>, out: &mut Vec<u8>) {
    let total = OPT_LENGTH_LEN + fragment.map_or(0, |_| OPT_FRAGMENT_LEN);
    let end_on_length = fragment.is_none();
    out.push(if end_on_length {
        OPT_LENGTH | OPT_END
    } else {
        OPT_LENGTH
    });
    out.push(OPT_LENGTH_LEN as u8);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    if let Some(frag) = fragment {
        out.push(OPT_FRAGMENT | OPT_END);
        out.push(OPT_FRAGMENT_LEN as u8);
        out.extend_from_slice(&[0, 0]); // reserved
        out.extend_from_slice(&frag.first_sqn.to_be_bytes());
        out.extend_from_slice(&frag.offset.to_be_bytes());
        out.extend_from_slice(&frag.apdu_len.to_be_bytes());
    }
}

// ============================================================================
// Packet builders
// ============================================================================

/// Build an ODATA or RDATA packet.
pub fn build_data(
    pgm_type: PgmType,
    tsi: Tsi,
    dport: u16,
    sqn: u32,
    trail: u32,
    fragment: Option<FragmentInfo>,
    payload: &[u8],
) -> Vec<u8> {
    debug_assert!(matches!(pgm_type, PgmType::Odata | PgmType::Rdata));
    let header = PgmHeader {
        sport: tsi.sport,
        dport,
        pgm_type,
        options: if fragment.is_some() { OPT_PRESENT } else { 0 },
        checksum: 0,
        gsi: tsi.gsi,
        tsdu_len: payload.len() as u16,
    };
    let mut out = Vec::with_capacity(PGM_HEADER_LEN + DATA_HEADER_LEN + payload.len() + 24);
    header.encode_into(&mut out);
    out.extend_from_slice(&sqn.to_be_bytes());
    out.extend_from_slice(&trail.to_be_bytes());
    if fragment.is_some() {
        encode_options(fragment, &mut out);
    }
    out.extend_from_slice(payload);
    patch_checksum(&mut out);
    out
}

/// Build an SPM packet.
pub fn build_spm(tsi: Tsi, dport: u16, sqn: u32, trail: u32, lead: u32, path: IpAddr) -> Vec<u8> {
    let header = PgmHeader {
        sport: tsi.sport,
        dport,
        pgm_type: PgmType::Spm,
        options: 0,
        checksum: 0,
        gsi: tsi.gsi,
        tsdu_len: 0,
    };
    let mut out = Vec::with_capacity(PGM_HEADER_LEN + 32);
    header.encode_into(&mut out);
    out.extend_from_slice(&sqn.to_be_bytes());
    out.extend_from_slice(&trail.to_be_bytes());
    out.extend_from_slice(&lead.to_be_bytes());
    encode_nla(path, &mut out);
    patch_checksum(&mut out);
    out
}

/// Build a NAK, NNAK or NCF packet about `subject` sequence `sqn`.
///
/// Upstream framing reverses the port pair: the source port carries the
/// session's data-destination port and the destination port carries the
/// subject source's port.
pub fn build_nak(
    pgm_type: PgmType,
    subject: Tsi,
    session_dport: u16,
    sqn: u32,
    source: IpAddr,
    group: IpAddr,
) -> Vec<u8> {
    debug_assert!(matches!(
        pgm_type,
        PgmType::Nak | PgmType::Nnak | PgmType::Ncf
    ));
    let header = PgmHeader {
        sport: session_dport,
        dport: subject.sport,
        pgm_type,
        options: 0,
        checksum: 0,
        gsi: subject.gsi,
        tsdu_len: 0,
    };
    let mut out = Vec::with_capacity(PGM_HEADER_LEN + 44);
    header.encode_into(&mut out);
    out.extend_from_slice(&sqn.to_be_bytes());
    encode_nla(source, &mut out);
    encode_nla(group, &mut out);
    patch_checksum(&mut out);
    out
}

/// Build an SPMR packet about `subject`.
pub fn build_spmr(subject: Tsi, session_dport: u16) -> Vec<u8> {
    let header = PgmHeader {
        sport: session_dport,
        dport: subject.sport,
        pgm_type: PgmType::Spmr,
        options: 0,
        checksum: 0,
        gsi: subject.gsi,
        tsdu_len: 0,
    };
    let mut out = Vec::with_capacity(PGM_HEADER_LEN);
    header.encode_into(&mut out);
    patch_checksum(&mut out);
    out
}

// ============================================================================
// Parse variants
// ============================================================================

/// Validate a UDP-encapsulated buffer: the datagram payload is the PGM
/// packet itself.
pub fn parse_udp_encap(skb: &mut SkBuff) -> Result<(), ParseError> {
    parse_pgm_at(skb, 0)
}

/// Validate a raw-IP buffer: the IPv4 header is visible to userspace and
/// carries the destination address.
pub fn parse_raw(skb: &mut SkBuff) -> Result<(), ParseError> {
    let buf = skb.filled();
    if buf.len() < 20 {
        return Err(ParseError::Truncated);
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return Err(ParseError::Malformed("ip version"));
    }
    let ihl = usize::from(buf[0] & 0x0f) * 4;
    if ihl < 20 || buf.len() < ihl {
        return Err(ParseError::Malformed("ip header length"));
    }
    let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    if total_len > buf.len() || total_len < ihl {
        return Err(ParseError::Truncated);
    }
    if buf[9] != IPPROTO_PGM {
        return Err(ParseError::BadProtocol(buf[9]));
    }
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
    skb.truncate(total_len);
    skb.set_dst_addr(IpAddr::V4(dst));
    parse_pgm_at(skb, ihl)
}

fn parse_pgm_at(skb: &mut SkBuff, offset: usize) -> Result<(), ParseError> {
    let pgm = &skb.filled()[offset..];
    let header = PgmHeader::decode(pgm)?;
    if !verify_checksum(pgm) {
        return Err(ParseError::Checksum);
    }
    skb.set_pgm(offset, header);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tsi() -> Tsi {
        Tsi::new(Gsi::new([10, 0, 0, 1, 0, 1]), 2000)
    }

    #[test]
    fn type_predicates_are_total() {
        for value in 0u8..=0x0c {
            if let Some(t) = PgmType::from_u8(value) {
                // POLL/POLR belong to no direction and classify unknown
                let directions =
                    [t.is_downstream(), t.is_upstream(), t.is_peer()];
                if matches!(t, PgmType::Poll | PgmType::Polr) {
                    assert_eq!(directions, [false, false, false]);
                } else {
                    assert!(directions.iter().any(|d| *d), "{:?} unclassified", t);
                }
            }
        }
        assert!(PgmType::from_u8(0x03).is_none());
        assert!(PgmType::from_u8(0xff).is_none());
    }

    #[test]
    fn header_roundtrip() {
        let packet = build_data(PgmType::Odata, test_tsi(), 7500, 7, 1, None, b"ABC");
        let header = PgmHeader::decode(&packet).expect("decode");
        assert_eq!(header.sport, 2000);
        assert_eq!(header.dport, 7500);
        assert_eq!(header.pgm_type, PgmType::Odata);
        assert_eq!(header.tsdu_len, 3);
        assert_eq!(header.sender_tsi(), test_tsi());
    }

    #[test]
    fn checksum_verifies_and_detects_corruption() {
        let mut packet = build_data(PgmType::Odata, test_tsi(), 7500, 7, 1, None, b"ABC");
        assert!(verify_checksum(&packet));
        packet[PGM_HEADER_LEN + DATA_HEADER_LEN] ^= 0x01;
        assert!(!verify_checksum(&packet));
    }

    #[test]
    fn checksum_odd_length_payload() {
        let packet = build_data(PgmType::Odata, test_tsi(), 7500, 1, 1, None, b"ABCDE");
        assert!(verify_checksum(&packet));
    }

    #[test]
    fn data_header_decodes() {
        let packet = build_data(PgmType::Rdata, test_tsi(), 7500, 42, 40, None, b"x");
        let body = DataHeader::decode(&packet[PGM_HEADER_LEN..]).expect("decode");
        assert_eq!(body.sqn, 42);
        assert_eq!(body.trail, 40);
    }

    #[test]
    fn fragment_option_roundtrip() {
        let frag = FragmentInfo {
            first_sqn: 5,
            offset: 1000,
            apdu_len: 3000,
        };
        let packet = build_data(PgmType::Odata, test_tsi(), 7500, 6, 1, Some(frag), b"chunk");
        let header = PgmHeader::decode(&packet).expect("decode");
        assert_eq!(header.options & OPT_PRESENT, OPT_PRESENT);
        let opts = &packet[PGM_HEADER_LEN + DATA_HEADER_LEN..];
        let (parsed, consumed) = decode_options(opts).expect("options");
        assert_eq!(parsed, Some(frag));
        assert_eq!(&opts[consumed..], b"chunk");
    }

    #[test]
    fn nak_roundtrip() {
        let subject = test_tsi();
        let packet = build_nak(
            PgmType::Nak,
            subject,
            7500,
            9,
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1)),
        );
        let header = PgmHeader::decode(&packet).expect("decode");
        assert_eq!(header.sport, 7500);
        assert_eq!(header.dport, subject.sport);
        assert_eq!(header.subject_tsi(), subject);
        let body = NakInfo::decode(&packet[PGM_HEADER_LEN..]).expect("body");
        assert_eq!(body.sqn, 9);
        assert_eq!(body.group, IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1)));
        assert!(verify_checksum(&packet));
    }

    #[test]
    fn spm_roundtrip() {
        let packet = build_spm(
            test_tsi(),
            7500,
            3,
            10,
            20,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        );
        let body = SpmInfo::decode(&packet[PGM_HEADER_LEN..]).expect("body");
        assert_eq!(body.sqn, 3);
        assert_eq!(body.trail, 10);
        assert_eq!(body.lead, 20);
        assert_eq!(body.path, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn truncated_header_rejected() {
        assert_eq!(
            PgmHeader::decode(&[0u8; 8]),
            Err(ParseError::Truncated)
        );
    }

    #[test]
    fn unknown_type_rejected() {
        let mut packet = build_spmr(test_tsi(), 7500);
        packet[4] = 0x03;
        assert_eq!(PgmHeader::decode(&packet), Err(ParseError::UnknownType(0x03)));
    }
}

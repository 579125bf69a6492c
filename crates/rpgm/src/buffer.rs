// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive packet buffer.
//!
//! One `SkBuff` holds one datagram plus its decode state. The transport
//! owns a single current buffer; when a data packet is accepted into a
//! receive window the buffer moves into the window and the transport
//! allocates a replacement.

use crate::protocol::packet::{FragmentInfo, PgmHeader};
use crate::protocol::tsi::Tsi;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

const UNSPECIFIED: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Packet buffer with head/cursor bookkeeping over the datagram bytes.
#[derive(Debug)]
pub struct SkBuff {
    storage: Vec<u8>,
    /// Valid bytes received into `storage`.
    len: usize,
    /// Cursor, advanced past framing and protocol headers during dispatch.
    data: usize,
    /// Offset of the PGM header within `storage`.
    pgm: usize,
    /// Offset of the application payload, set for data packets.
    payload: usize,
    pub tstamp: Instant,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// Decoded PGM header, set by the parse stage.
    pub header: Option<PgmHeader>,
    /// Sender TSI, set by the parse stage.
    pub tsi: Tsi,
    /// PGM sequence number, set for ODATA/RDATA.
    pub seq: u32,
    /// Fragmentation descriptor, set for fragmented APDUs.
    pub frag: Option<FragmentInfo>,
}

impl SkBuff {
    /// Allocate a buffer able to hold one maximum-TPDU datagram.
    #[must_use]
    pub fn with_capacity(max_tpdu: usize) -> Self {
        Self {
            storage: vec![0u8; max_tpdu],
            len: 0,
            data: 0,
            pgm: 0,
            payload: 0,
            tstamp: Instant::now(),
            src: UNSPECIFIED,
            dst: UNSPECIFIED,
            header: None,
            tsi: Tsi::default(),
            seq: 0,
            frag: None,
        }
    }

    /// Whole backing storage, for the socket reader to fill.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// Record a freshly received datagram, resetting all decode state.
    pub fn set_received(&mut self, len: usize, src: SocketAddr, dst: SocketAddr, tstamp: Instant) {
        self.len = len.min(self.storage.len());
        self.data = 0;
        self.pgm = 0;
        self.payload = 0;
        self.tstamp = tstamp;
        self.src = src;
        self.dst = dst;
        self.header = None;
        self.tsi = Tsi::default();
        self.seq = 0;
        self.frag = None;
    }

    /// Received bytes.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the valid region, used when IP framing states a shorter
    /// total length than the datagram read.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    pub fn set_dst_addr(&mut self, addr: IpAddr) {
        self.dst = SocketAddr::new(addr, self.dst.port());
    }

    /// Record the validated PGM header location and decoded sender TSI.
    pub fn set_pgm(&mut self, offset: usize, header: PgmHeader) {
        self.pgm = offset;
        self.data = offset;
        self.tsi = header.sender_tsi();
        self.header = Some(header);
    }

    /// Advance the cursor past consumed header bytes.
    pub fn advance(&mut self, n: usize) {
        self.data = (self.data + n).min(self.len);
    }

    /// Unconsumed bytes from the cursor.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.storage[self.data..self.len]
    }

    /// Mark the cursor position as the start of the application payload.
    pub fn mark_payload(&mut self) {
        self.payload = self.data;
    }

    /// Application payload bytes of a data packet, bounded by the header's
    /// TSDU length.
    #[must_use]
    pub fn tsdu(&self) -> &[u8] {
        let tsdu_len = self
            .header
            .map(|h| usize::from(h.tsdu_len))
            .unwrap_or(0);
        let end = (self.payload + tsdu_len).min(self.len);
        &self.storage[self.payload..end]
    }
}

impl Default for SkBuff {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{build_data, parse_udp_encap, PgmType};
    use crate::protocol::packet::{DataHeader, DATA_HEADER_LEN};
    use crate::protocol::tsi::{Gsi, Tsi};

    fn loaded(packet: &[u8]) -> SkBuff {
        let mut skb = SkBuff::with_capacity(1500);
        skb.storage_mut()[..packet.len()].copy_from_slice(packet);
        skb.set_received(packet.len(), UNSPECIFIED, UNSPECIFIED, Instant::now());
        skb
    }

    #[test]
    fn cursor_walks_headers_to_payload() {
        let tsi = Tsi::new(Gsi::new([1, 2, 3, 4, 5, 6]), 2000);
        let packet = build_data(PgmType::Odata, tsi, 7500, 9, 9, None, b"hello");
        let mut skb = loaded(&packet);
        parse_udp_encap(&mut skb).expect("parse");
        assert_eq!(skb.tsi, tsi);

        skb.advance(crate::config::PGM_HEADER_LEN);
        let body = DataHeader::decode(skb.remaining()).expect("data header");
        assert_eq!(body.sqn, 9);
        skb.advance(DATA_HEADER_LEN);
        skb.mark_payload();
        assert_eq!(skb.tsdu(), b"hello");
    }

    #[test]
    fn set_received_resets_state() {
        let tsi = Tsi::new(Gsi::new([1, 2, 3, 4, 5, 6]), 2000);
        let packet = build_data(PgmType::Odata, tsi, 7500, 9, 9, None, b"hello");
        let mut skb = loaded(&packet);
        parse_udp_encap(&mut skb).expect("parse");
        assert!(skb.header.is_some());

        skb.set_received(3, UNSPECIFIED, UNSPECIFIED, Instant::now());
        assert!(skb.header.is_none());
        assert_eq!(skb.len(), 3);
        assert_eq!(skb.remaining().len(), 3);
    }
}

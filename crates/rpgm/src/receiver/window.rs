// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer receive window.
//!
//! Buffers out-of-order TPDUs by sequence number, reassembles fragmented
//! APDUs and drains contiguous APDUs in strictly increasing sequence order.
//! Unrecoverable gaps are surfaced exactly once as a loss event, after
//! which delivery resumes past the gap.

use crate::buffer::SkBuff;
use crate::protocol::seq;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
enum Slot {
    Data(Arc<SkBuff>),
    Lost,
}

/// Why an append was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Sequence already delivered, already buffered, or behind the trail.
    Duplicate,
    /// Sequence too far ahead of the contiguous base.
    OutOfWindow,
}

/// Outcome of inserting one packet.
#[derive(Debug)]
pub enum Append {
    /// Packet accepted; ownership moved into the window. `fresh_gaps` lists
    /// sequences newly discovered missing, oldest first.
    Accepted { fresh_gaps: Vec<u32> },
    /// Packet rejected; ownership returned to the caller.
    Rejected { skb: SkBuff, reason: RejectReason },
}

/// One drained unit.
#[derive(Debug)]
pub enum Drained {
    /// A complete APDU: scatter segments in sequence order plus total length.
    Apdu {
        segments: Vec<Arc<SkBuff>>,
        len: usize,
    },
    /// An unrecoverable gap was consumed; delivery continues past it on the
    /// next drain.
    Loss,
}

enum RunState {
    Complete { count: u32, len: usize },
    Incomplete,
    Broken { count: u32 },
}

#[derive(Debug)]
pub struct ReceiveWindow {
    max_span: u32,
    /// Next sequence to deliver; `None` until the first packet.
    base: Option<u32>,
    /// Highest sequence accepted.
    lead: Option<u32>,
    /// Source-advertised trail; data behind it is unrepairable.
    trail: Option<u32>,
    slots: HashMap<u32, Slot>,
}

impl ReceiveWindow {
    #[must_use]
    pub fn new(max_span: u32) -> Self {
        Self {
            max_span: max_span.max(1),
            base: None,
            lead: None,
            trail: None,
            slots: HashMap::new(),
        }
    }

    /// Insert one data packet. `trail` is the packet's advertised trail.
    pub fn append(&mut self, skb: SkBuff, trail: u32) -> Append {
        let sqn = skb.seq;

        if let Some(base) = self.base {
            if seq::lt(sqn, base) {
                return Append::Rejected {
                    skb,
                    reason: RejectReason::Duplicate,
                };
            }
            if seq::dist(sqn, base) >= self.max_span {
                return Append::Rejected {
                    skb,
                    reason: RejectReason::OutOfWindow,
                };
            }
        }
        if self.slots.contains_key(&sqn) {
            return Append::Rejected {
                skb,
                reason: RejectReason::Duplicate,
            };
        }

        if self.base.is_none() {
            // open the window at the advertised trail so repairable
            // predecessors of a mid-stream first packet are not rejected
            let start = if seq::le(trail, sqn) && seq::dist(sqn, trail) < self.max_span {
                trail
            } else {
                sqn
            };
            self.base = Some(start);
            self.lead = Some(start.wrapping_sub(1));
        }

        let fresh_gaps = match self.lead {
            Some(lead) if seq::gt(sqn, lead.wrapping_add(1)) => {
                let mut gaps = Vec::new();
                let mut s = lead.wrapping_add(1);
                while seq::lt(s, sqn) {
                    gaps.push(s);
                    s = s.wrapping_add(1);
                }
                gaps
            }
            _ => Vec::new(),
        };
        if self.lead.map_or(true, |lead| seq::gt(sqn, lead)) {
            self.lead = Some(sqn);
        }
        self.slots.insert(sqn, Slot::Data(Arc::new(skb)));
        self.advance_trail(trail);

        Append::Accepted { fresh_gaps }
    }

    /// Advance the source trail; missing sequences behind it can never be
    /// repaired and convert to unrecoverable loss.
    pub fn advance_trail(&mut self, trail: u32) {
        match self.trail {
            Some(current) if !seq::gt(trail, current) => return,
            _ => self.trail = Some(trail),
        }
        if let Some(base) = self.base {
            let mut s = base;
            let mut guard = 0u32;
            while seq::lt(s, trail) && guard < self.max_span {
                self.slots.entry(s).or_insert(Slot::Lost);
                s = s.wrapping_add(1);
                guard += 1;
            }
        }
    }

    /// Declare one missing sequence unrecoverable (repair gave up on it).
    pub fn declare_lost(&mut self, sqn: u32) {
        let in_window = match self.base {
            Some(base) => seq::ge(sqn, base) && seq::dist(sqn, base) < self.max_span,
            None => false,
        };
        if in_window {
            self.slots.entry(sqn).or_insert(Slot::Lost);
        }
    }

    /// Whether a drain would yield something right now.
    #[must_use]
    pub fn has_deliverable(&self) -> bool {
        let Some(base) = self.base else {
            return false;
        };
        match self.slots.get(&base) {
            Some(Slot::Lost) => true,
            Some(Slot::Data(_)) => !matches!(self.apdu_run(base), RunState::Incomplete),
            None => false,
        }
    }

    /// Drain the next contiguous unit, if any.
    pub fn pop_next(&mut self) -> Option<Drained> {
        loop {
            let base = self.base?;
            match self.slots.get(&base) {
                None => return None,
                Some(Slot::Lost) => {
                    let mut s = base;
                    while matches!(self.slots.get(&s), Some(Slot::Lost)) {
                        self.slots.remove(&s);
                        s = s.wrapping_add(1);
                    }
                    self.base = Some(s);
                    return Some(Drained::Loss);
                }
                Some(Slot::Data(_)) => match self.apdu_run(base) {
                    RunState::Incomplete => return None,
                    RunState::Broken { count } => {
                        // irrecoverably inconsistent fragment run: convert to loss
                        let mut s = base;
                        for _ in 0..count {
                            self.slots.insert(s, Slot::Lost);
                            s = s.wrapping_add(1);
                        }
                    }
                    RunState::Complete { count, len } => {
                        let mut segments = Vec::with_capacity(count as usize);
                        let mut s = base;
                        for _ in 0..count {
                            match self.slots.remove(&s) {
                                Some(Slot::Data(skb)) => segments.push(skb),
                                _ => unreachable!("complete run holds data slots"),
                            }
                            s = s.wrapping_add(1);
                        }
                        self.base = Some(s);
                        return Some(Drained::Apdu { segments, len });
                    }
                },
            }
        }
    }

    /// Walk the fragment run starting at `base`.
    fn apdu_run(&self, base: u32) -> RunState {
        let first = match self.slots.get(&base) {
            Some(Slot::Data(skb)) => skb,
            _ => return RunState::Incomplete,
        };
        let Some(frag) = first.frag else {
            return RunState::Complete {
                count: 1,
                len: first.tsdu().len(),
            };
        };
        if frag.first_sqn != base {
            // source restarted mid-APDU; the head fragments are gone
            return RunState::Broken { count: 1 };
        }

        let mut total = 0usize;
        let mut count = 0u32;
        let mut s = base;
        loop {
            match self.slots.get(&s) {
                Some(Slot::Data(skb)) => {
                    match skb.frag {
                        Some(f) if f.first_sqn == base => {}
                        // run interrupted by a foreign packet
                        _ => return RunState::Broken { count },
                    }
                    total += skb.tsdu().len();
                    count += 1;
                    if total >= frag.apdu_len as usize {
                        return RunState::Complete { count, len: total };
                    }
                }
                Some(Slot::Lost) => return RunState::Broken { count },
                None => return RunState::Incomplete,
            }
            s = s.wrapping_add(1);
            if count >= self.max_span {
                return RunState::Broken { count };
            }
        }
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{build_data, parse_udp_encap, FragmentInfo, PgmType};
    use crate::protocol::packet::{DataHeader, DATA_HEADER_LEN};
    use crate::protocol::tsi::{Gsi, Tsi};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Instant;

    fn data_skb(sqn: u32, frag: Option<FragmentInfo>, payload: &[u8]) -> SkBuff {
        let tsi = Tsi::new(Gsi::new([1, 2, 3, 4, 5, 6]), 2000);
        let packet = build_data(PgmType::Odata, tsi, 7500, sqn, 0, frag, payload);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let mut skb = SkBuff::with_capacity(1500);
        skb.storage_mut()[..packet.len()].copy_from_slice(&packet);
        skb.set_received(packet.len(), addr, addr, Instant::now());
        parse_udp_encap(&mut skb).expect("parse");
        skb.advance(crate::config::PGM_HEADER_LEN);
        let body = DataHeader::decode(skb.remaining()).expect("data header");
        skb.advance(DATA_HEADER_LEN);
        if frag.is_some() {
            let (parsed, consumed) =
                crate::protocol::packet::decode_options(skb.remaining()).expect("options");
            skb.frag = parsed;
            skb.advance(consumed);
        }
        skb.mark_payload();
        skb.seq = body.sqn;
        skb
    }

    fn apdu_bytes(drained: Drained) -> Vec<u8> {
        match drained {
            Drained::Apdu { segments, .. } => {
                let mut out = Vec::new();
                for seg in segments {
                    out.extend_from_slice(seg.tsdu());
                }
                out
            }
            Drained::Loss => panic!("expected apdu"),
        }
    }

    #[test]
    fn in_order_delivery() {
        let mut window = ReceiveWindow::new(64);
        assert!(matches!(
            window.append(data_skb(1, None, b"a"), 1),
            Append::Accepted { .. }
        ));
        assert!(window.has_deliverable());
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"a");
        assert!(window.pop_next().is_none());
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut window = ReceiveWindow::new(64);
        window.append(data_skb(1, None, b"a"), 1);
        let gaps = match window.append(data_skb(3, None, b"c"), 1) {
            Append::Accepted { fresh_gaps } => fresh_gaps,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(gaps, vec![2]);

        // only seq 1 is deliverable until the gap fills
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"a");
        assert!(window.pop_next().is_none());

        window.append(data_skb(2, None, b"b"), 1);
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"b");
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"c");
    }

    #[test]
    fn duplicates_rejected() {
        let mut window = ReceiveWindow::new(64);
        window.append(data_skb(5, None, b"x"), 5);
        match window.append(data_skb(5, None, b"x"), 5) {
            Append::Rejected { reason, .. } => assert_eq!(reason, RejectReason::Duplicate),
            other => panic!("unexpected {:?}", other),
        }
        // delivered sequences also count as duplicates
        window.pop_next().expect("apdu");
        match window.append(data_skb(4, None, b"old"), 4) {
            Append::Rejected { reason, .. } => assert_eq!(reason, RejectReason::Duplicate),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn out_of_window_rejected() {
        let mut window = ReceiveWindow::new(8);
        window.append(data_skb(1, None, b"a"), 1);
        match window.append(data_skb(100, None, b"far"), 1) {
            Append::Rejected { reason, .. } => assert_eq!(reason, RejectReason::OutOfWindow),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fragmented_apdu_assembles_across_tpdus() {
        let mut window = ReceiveWindow::new(64);
        let frag = |off| FragmentInfo {
            first_sqn: 10,
            offset: off,
            apdu_len: 6,
        };
        window.append(data_skb(10, Some(frag(0)), b"ab"), 10);
        window.append(data_skb(12, Some(frag(4)), b"ef"), 10);
        assert!(!window.has_deliverable());

        window.append(data_skb(11, Some(frag(2)), b"cd"), 10);
        assert!(window.has_deliverable());
        match window.pop_next().expect("apdu") {
            Drained::Apdu { segments, len } => {
                assert_eq!(len, 6);
                assert_eq!(segments.len(), 3);
                let all: Vec<u8> = segments.iter().flat_map(|s| s.tsdu().to_vec()).collect();
                assert_eq!(all, b"abcdef");
            }
            Drained::Loss => panic!("unexpected loss"),
        }
    }

    #[test]
    fn declared_loss_surfaces_once_then_resumes() {
        let mut window = ReceiveWindow::new(64);
        window.append(data_skb(1, None, b"a"), 1);
        window.append(data_skb(3, None, b"c"), 1);
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"a");

        window.declare_lost(2);
        assert!(window.has_deliverable());
        assert!(matches!(window.pop_next(), Some(Drained::Loss)));

        // delivery resumes past the gap
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"c");
        assert!(window.pop_next().is_none());
    }

    #[test]
    fn trail_advance_converts_gap_to_loss() {
        let mut window = ReceiveWindow::new(64);
        window.append(data_skb(1, None, b"a"), 1);
        window.pop_next().expect("apdu");

        // 2 never arrives and the source trail moves past it
        window.append(data_skb(3, None, b"c"), 3);
        assert!(matches!(window.pop_next(), Some(Drained::Loss)));
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"c");
    }

    #[test]
    fn mid_stream_first_packet_opens_at_trail() {
        let mut window = ReceiveWindow::new(64);
        // sequence 2 arrives first; its trail says 1 is still repairable
        let gaps = match window.append(data_skb(2, None, b"b"), 1) {
            Append::Accepted { fresh_gaps } => fresh_gaps,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(gaps, vec![1]);
        assert!(!window.has_deliverable());

        window.append(data_skb(1, None, b"a"), 1);
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"a");
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"b");
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut window = ReceiveWindow::new(64);
        window.append(data_skb(u32::MAX, None, b"end"), u32::MAX);
        window.append(data_skb(0, None, b"wrap"), u32::MAX);
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"end");
        assert_eq!(apdu_bytes(window.pop_next().expect("apdu")), b"wrap");
    }
}

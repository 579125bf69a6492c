// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer state for remote PGM sources.
//!
//! One [`Peer`] exists per remote TSI, created lazily on the first
//! well-formed downstream packet. It owns the receive window and the NAK
//! repair state for that source.

pub mod nak;
pub mod window;

use crate::protocol::seq;
use crate::protocol::tsi::Tsi;
use crate::stats::PeerStats;
use nak::{NakConfig, NakRecords};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use window::ReceiveWindow;

/// Per-source receiver state, keyed by TSI in the transport's peer table.
#[derive(Debug)]
pub struct Peer {
    pub tsi: Tsi,
    /// Where repair requests are sent: the packet source address until an
    /// SPM advertises the source path NLA.
    nla: Mutex<SocketAddr>,
    /// Multicast group this source was observed on.
    group_nla: Mutex<Option<SocketAddr>>,
    last_packet: Mutex<Instant>,
    /// Highest SPM sequence seen; stale SPMs are discarded.
    spm_sqn: Mutex<Option<u32>>,
    pub window: Mutex<ReceiveWindow>,
    pub nak: Mutex<NakRecords>,
    /// Membership marker for the transport's pending list.
    pending: AtomicBool,
    pub stats: PeerStats,
}

impl Peer {
    #[must_use]
    pub fn new(tsi: Tsi, src: SocketAddr, rxw_sqns: u32, nak_config: NakConfig) -> Self {
        Self {
            tsi,
            nla: Mutex::new(src),
            group_nla: Mutex::new(None),
            last_packet: Mutex::new(Instant::now()),
            spm_sqn: Mutex::new(None),
            window: Mutex::new(ReceiveWindow::new(rxw_sqns)),
            nak: Mutex::new(NakRecords::new(nak_config)),
            pending: AtomicBool::new(false),
            stats: PeerStats::new(),
        }
    }

    /// Whether this peer currently has a deliverable unit (data or loss).
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.window.lock().has_deliverable()
    }

    /// Claim pending-list membership. Returns `true` when the caller must
    /// append this peer to the list (first claim wins).
    pub fn mark_pending(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    pub fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn touch(&self, now: Instant) {
        *self.last_packet.lock() = now;
    }

    #[must_use]
    pub fn last_packet(&self) -> Instant {
        *self.last_packet.lock()
    }

    #[must_use]
    pub fn nla(&self) -> SocketAddr {
        *self.nla.lock()
    }

    pub fn set_nla(&self, addr: SocketAddr) {
        *self.nla.lock() = addr;
    }

    #[must_use]
    pub fn group_nla(&self) -> Option<SocketAddr> {
        *self.group_nla.lock()
    }

    pub fn set_group_nla(&self, addr: SocketAddr) {
        *self.group_nla.lock() = Some(addr);
    }

    /// Record an SPM sequence number; returns `false` for stale SPMs.
    pub fn accept_spm(&self, sqn: u32) -> bool {
        let mut guard = self.spm_sqn.lock();
        match *guard {
            Some(last) if !seq::gt(sqn, last) => false,
            _ => {
                *guard = Some(sqn);
                true
            }
        }
    }
}

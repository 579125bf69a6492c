// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cumulative transport and peer statistics.
//!
//! Counters are written from the ingest thread and may be read atomically
//! from any thread for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Transport-wide statistic codes.
///
/// The `Source*` family is only meaningful when the endpoint can send data;
/// the `Receiver*` family tracks the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatCounter {
    SourcePacketsDiscarded,
    SourceCksumErrors,
    SourceNaksReceived,
    SourceNnaksReceived,
    SourceSpmrsReceived,
    ReceiverPacketsDiscarded,
    ReceiverBytesReceived,
    ReceiverApdusDelivered,
    ReceiverNaksSent,
    ReceiverNakSendFailures,
    ReceiverPeersCreated,
}

const COUNTER_SLOTS: usize = 11;

/// Atomic counter block indexed by [`StatCounter`].
#[derive(Debug, Default)]
pub struct TransportStats {
    counters: [AtomicU64; COUNTER_SLOTS],
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(&self, counter: StatCounter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: StatCounter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, counter: StatCounter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }
}

/// Per-peer statistic block.
#[derive(Debug, Default)]
pub struct PeerStats {
    pub bytes_received: AtomicU64,
    pub packets_discarded: AtomicU64,
    pub apdus_delivered: AtomicU64,
    pub naks_sent: AtomicU64,
}

impl PeerStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_delivered(&self) {
        self.apdus_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_naks(&self) {
        self.naks_sent.fetch_add(1, Ordering::Relaxed);
    }
}

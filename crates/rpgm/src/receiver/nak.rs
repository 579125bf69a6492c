// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer NAK state machine.
//!
//! One record tracks one missing sequence number through
//! `BackOff -> WaitNcf -> WaitData`, re-arming on interval expiry until the
//! retry budgets run out, at which point the sequence is cancelled and the
//! window declares unrecoverable loss.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Repair timing and retry budgets.
#[derive(Debug, Clone, Copy)]
pub struct NakConfig {
    /// Gap detected -> first NAK transmitted.
    pub bo_ivl: Duration,
    /// NAK transmitted -> NCF expected.
    pub rpt_ivl: Duration,
    /// NCF seen -> repair data expected.
    pub rdata_ivl: Duration,
    /// NAK retransmissions tolerated without an NCF.
    pub ncf_retries: u32,
    /// Repair-data waits tolerated after NCFs.
    pub data_retries: u32,
}

impl Default for NakConfig {
    fn default() -> Self {
        Self {
            bo_ivl: crate::config::DEFAULT_NAK_BO_IVL,
            rpt_ivl: crate::config::DEFAULT_NAK_RPT_IVL,
            rdata_ivl: crate::config::DEFAULT_NAK_RDATA_IVL,
            ncf_retries: crate::config::DEFAULT_NAK_NCF_RETRIES,
            data_retries: crate::config::DEFAULT_NAK_DATA_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NakPhase {
    BackOff,
    WaitNcf,
    WaitData,
}

#[derive(Debug)]
struct NakRecord {
    phase: NakPhase,
    deadline: Instant,
    ncf_retries_used: u32,
    data_retries_used: u32,
}

/// Timer-driven action produced by [`NakRecords::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakAction {
    /// Transmit a NAK for this sequence.
    Send(u32),
    /// Give up on this sequence; the window must declare it lost.
    Cancel(u32),
}

/// All outstanding repair state for one peer.
#[derive(Debug)]
pub struct NakRecords {
    config: NakConfig,
    records: HashMap<u32, NakRecord>,
}

impl NakRecords {
    #[must_use]
    pub fn new(config: NakConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    /// Start repair for a newly detected missing sequence.
    pub fn on_gap(&mut self, sqn: u32, now: Instant) {
        self.records.entry(sqn).or_insert(NakRecord {
            phase: NakPhase::BackOff,
            deadline: now + self.config.bo_ivl,
            ncf_retries_used: 0,
            data_retries_used: 0,
        });
    }

    /// An NCF confirmed the source heard our NAK; wait for repair data.
    ///
    /// Returns whether a matching record existed.
    pub fn on_ncf(&mut self, sqn: u32, now: Instant) -> bool {
        match self.records.get_mut(&sqn) {
            Some(record) => {
                record.phase = NakPhase::WaitData;
                record.deadline = now + self.config.rdata_ivl;
                true
            }
            None => false,
        }
    }

    /// A peer's multicast NAK covers this sequence; suppress our own NAK
    /// the same way an NCF would.
    pub fn on_peer_nak(&mut self, sqn: u32, now: Instant) -> bool {
        self.on_ncf(sqn, now)
    }

    /// Data (original or repair) arrived for this sequence.
    pub fn on_data(&mut self, sqn: u32) {
        self.records.remove(&sqn);
    }

    /// Earliest pending deadline across all records.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.records.values().map(|r| r.deadline).min()
    }

    /// Fire every record whose deadline has passed, collecting the
    /// transmissions and cancellations the caller must carry out.
    pub fn advance(&mut self, now: Instant) -> Vec<NakAction> {
        let mut actions = Vec::new();
        let mut cancelled = Vec::new();

        for (&sqn, record) in self.records.iter_mut() {
            if record.deadline > now {
                continue;
            }
            match record.phase {
                NakPhase::BackOff => {
                    actions.push(NakAction::Send(sqn));
                    record.phase = NakPhase::WaitNcf;
                    record.deadline = now + self.config.rpt_ivl;
                }
                NakPhase::WaitNcf => {
                    if record.ncf_retries_used < self.config.ncf_retries {
                        record.ncf_retries_used += 1;
                        actions.push(NakAction::Send(sqn));
                        record.deadline = now + self.config.rpt_ivl;
                    } else {
                        cancelled.push(sqn);
                    }
                }
                NakPhase::WaitData => {
                    if record.data_retries_used < self.config.data_retries {
                        record.data_retries_used += 1;
                        actions.push(NakAction::Send(sqn));
                        record.phase = NakPhase::WaitNcf;
                        record.deadline = now + self.config.rpt_ivl;
                    } else {
                        cancelled.push(sqn);
                    }
                }
            }
        }

        for sqn in cancelled {
            self.records.remove(&sqn);
            actions.push(NakAction::Cancel(sqn));
        }
        actions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

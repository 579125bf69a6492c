// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol timer interleave.
//!
//! The ingest loop never blocks past the next timer expiration. Dispatch
//! advances every peer's NAK state machine on the calling thread, so timer
//! actions observe all state mutated by packet dispatches in the same call.

use crate::receiver::nak::NakAction;
use crate::transport::{PendingState, Transport};
use std::time::{Duration, Instant};

/// Timer bookkeeping, guarded by the pending mutex.
#[derive(Debug)]
pub struct TimerState {
    next_poll: Instant,
    tick: Duration,
}

impl TimerState {
    #[must_use]
    pub fn new(tick: Duration) -> Self {
        Self {
            next_poll: Instant::now(),
            tick,
        }
    }

    /// Whether the timers are due.
    #[must_use]
    pub fn check(&self, now: Instant) -> bool {
        now >= self.next_poll
    }

    /// Time remaining until the next expiration; bounds every blocking wait.
    #[must_use]
    pub fn expiration(&self, now: Instant) -> Duration {
        self.next_poll.saturating_duration_since(now)
    }

    pub(crate) fn set_next(&mut self, next: Instant) {
        self.next_poll = next;
    }

    #[must_use]
    pub fn tick(&self) -> Duration {
        self.tick
    }
}

/// Recompute the next expiration: the earliest peer repair deadline,
/// bounded by the keepalive tick.
pub(crate) fn prepare(transport: &Transport, pending: &mut PendingState, now: Instant) {
    let mut next = now + pending.timer.tick();
    for peer in transport.peers_snapshot() {
        if let Some(deadline) = peer.nak.lock().next_deadline() {
            if deadline < next {
                next = deadline;
            }
        }
    }
    pending.timer.set_next(next.max(now));
}

/// Fire due repair timers: transmit NAKs and cancel exhausted sequences,
/// converting them to unrecoverable loss.
pub(crate) fn dispatch(transport: &Transport, pending: &mut PendingState, now: Instant) {
    for peer in transport.peers_snapshot() {
        let actions = peer.nak.lock().advance(now);
        if actions.is_empty() {
            continue;
        }
        for action in actions {
            match action {
                NakAction::Send(sqn) => transport.send_nak(&peer, sqn),
                NakAction::Cancel(sqn) => {
                    log::debug!(
                        "[timer] repair cancelled sqn={} tsi={}, declaring loss",
                        sqn,
                        peer.tsi
                    );
                    peer.window.lock().declare_lost(sqn);
                }
            }
        }
        if peer.has_pending() {
            Transport::flag_peer_pending(pending, &peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_due() {
        let state = TimerState::new(Duration::from_millis(100));
        assert!(state.check(Instant::now() + Duration::from_millis(1)));
    }

    #[test]
    fn expiration_counts_down() {
        let mut state = TimerState::new(Duration::from_millis(100));
        let now = Instant::now();
        state.set_next(now + Duration::from_millis(40));
        assert!(!state.check(now));
        let remaining = state.expiration(now);
        assert!(remaining > Duration::from_millis(30) && remaining <= Duration::from_millis(40));
        // past the deadline the expiration saturates at zero
        assert_eq!(
            state.expiration(now + Duration::from_millis(50)),
            Duration::ZERO
        );
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport endpoint: socket ownership, identity, roles, peer table and
//! the shared state the ingest loop runs over.
//!
//! Construction goes through [`TransportBuilder`]; interface enumeration
//! and multicast group joining are the caller's concern (hand a
//! pre-configured socket to [`TransportBuilder::bind_with_socket`]).

pub mod notify;
pub(crate) mod udp;

use crate::buffer::SkBuff;
use crate::config::{
    DEFAULT_DATA_DESTINATION_PORT, DEFAULT_MAX_TPDU, DEFAULT_RXW_SQNS, DEFAULT_TIMER_TICK,
};
use crate::protocol::packet::{build_nak, PgmType};
use crate::protocol::tsi::{Gsi, Tsi};
use crate::receiver::nak::NakConfig;
use crate::receiver::Peer;
use crate::stats::{StatCounter, TransportStats};
use crate::timer::TimerState;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use notify::NotifyChannel;
use parking_lot::{Mutex, RwLock};
use socket2::Socket;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const TOKEN_RECV: Token = Token(0);
pub(crate) const TOKEN_PENDING: Token = Token(1);

/// How PGM packets are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encapsulation {
    /// Raw IP, protocol 113; the IPv4 header is visible to userspace.
    RawIp,
    /// UDP-encapsulated; destination recovery requires PKTINFO.
    UdpEncap,
}

/// Readable descriptors an external poller should watch.
#[derive(Debug, Clone, Copy)]
pub struct PollInfo {
    /// The receive socket.
    pub recv_fd: RawFd,
    /// The pending-delivery notification channel.
    pub pending_fd: RawFd,
}

/// State guarded by the pending mutex: everything the edge/level and reset
/// machinery observes.
pub(crate) struct PendingState {
    /// Peers holding deliverable APDUs, in insertion order.
    pub(crate) peers_pending: VecDeque<Arc<Peer>>,
    /// Exactly one token is queued on the notify channel iff set.
    pub(crate) is_pending_read: bool,
    /// Latched on unrecoverable loss until surfaced.
    pub(crate) is_reset: bool,
    pub(crate) timer: TimerState,
}

/// Per-call ingest state; touched only by the thread executing the ingest
/// loop.
pub(crate) struct IngestState {
    pub(crate) rx_buffer: SkBuff,
    pub(crate) poll: Poll,
    pub(crate) events: Events,
}

/// A bound PGM transport endpoint (receive path).
pub struct Transport {
    pub(crate) socket: Arc<Socket>,
    pub(crate) encapsulation: Encapsulation,
    pub(crate) max_tpdu: usize,
    pub(crate) tsi: Tsi,
    pub(crate) dport: u16,
    pub(crate) local_port: u16,
    pub(crate) can_send_data: bool,
    pub(crate) can_recv_data: bool,
    pub(crate) abort_on_reset: bool,
    pub(crate) edge_triggered_recv: bool,
    pub(crate) rxw_sqns: u32,
    pub(crate) nak_config: NakConfig,
    pub(crate) is_destroyed: AtomicBool,
    pub(crate) peers: RwLock<HashMap<Tsi, Arc<Peer>>>,
    pub(crate) pending: Mutex<PendingState>,
    pub(crate) ingest: Mutex<IngestState>,
    pub(crate) notify: NotifyChannel,
    pub(crate) stats: TransportStats,
}

impl Transport {
    /// This endpoint's own transport session identifier.
    #[must_use]
    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    /// Data-destination port of the session this endpoint receives on.
    #[must_use]
    pub fn dport(&self) -> u16 {
        self.dport
    }

    #[must_use]
    pub fn encapsulation(&self) -> Encapsulation {
        self.encapsulation
    }

    /// Local socket address the endpoint is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "not an inet socket"))
    }

    /// Cumulative statistics.
    #[must_use]
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Descriptors for external readiness polling.
    #[must_use]
    pub fn poll_info(&self) -> PollInfo {
        PollInfo {
            recv_fd: self.socket.as_raw_fd(),
            pending_fd: self.notify.read_fd(),
        }
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Mark the endpoint destroyed; subsequent receive calls fail with a
    /// bad-transport error.
    pub fn close(&self) {
        self.is_destroyed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.is_destroyed.load(Ordering::Acquire)
    }

    /// Whether destination recovery requires PKTINFO on this endpoint.
    pub(crate) fn require_pktinfo(&self) -> bool {
        self.encapsulation == Encapsulation::UdpEncap
            || self
                .local_addr()
                .map(|addr| addr.is_ipv6())
                .unwrap_or(false)
    }

    pub(crate) fn find_peer(&self, tsi: &Tsi) -> Option<Arc<Peer>> {
        self.peers.read().get(tsi).cloned()
    }

    /// Create a peer for a first-contact downstream source.
    ///
    /// Check-then-insert under the write lock keeps insertion idempotent
    /// should ingest ever run on more than one thread.
    pub(crate) fn new_peer(&self, tsi: Tsi, src: SocketAddr) -> Arc<Peer> {
        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(&tsi) {
            return Arc::clone(existing);
        }
        log::debug!("[peer] new peer {} from {}", tsi, src);
        self.stats.incr(StatCounter::ReceiverPeersCreated);
        let peer = Arc::new(Peer::new(tsi, src, self.rxw_sqns, self.nak_config));
        peers.insert(tsi, Arc::clone(&peer));
        peer
    }

    pub(crate) fn peers_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Append a peer to the pending list unless it is already a member.
    pub(crate) fn flag_peer_pending(pending: &mut PendingState, peer: &Arc<Peer>) {
        if peer.mark_pending() {
            pending.peers_pending.push_back(Arc::clone(peer));
        }
    }

    /// Transmit a repair request for `sqn` to the peer's path NLA.
    pub(crate) fn send_nak(&self, peer: &Peer, sqn: u32) {
        let target = peer.nla();
        let group = peer
            .group_nla()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let packet = build_nak(PgmType::Nak, peer.tsi, self.dport, sqn, target.ip(), group);
        match self.socket.send_to(&packet, &socket2::SockAddr::from(target)) {
            Ok(_) => {
                log::debug!("[timer] NAK sqn={} -> {} tsi={}", sqn, target, peer.tsi);
                self.stats.incr(StatCounter::ReceiverNaksSent);
                peer.stats.incr_naks();
            }
            Err(err) => {
                log::debug!("[timer] NAK send failed sqn={} -> {}: {}", sqn, target, err);
                self.stats.incr(StatCounter::ReceiverNakSendFailures);
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("tsi", &self.tsi)
            .field("dport", &self.dport)
            .field("encapsulation", &self.encapsulation)
            .field("can_send_data", &self.can_send_data)
            .field("can_recv_data", &self.can_recv_data)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and binds a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportBuilder {
    gsi: Gsi,
    sport: u16,
    dport: u16,
    encapsulation: Encapsulation,
    bind_addr: SocketAddr,
    max_tpdu: usize,
    rxw_sqns: u32,
    nak_config: NakConfig,
    can_send_data: bool,
    can_recv_data: bool,
    abort_on_reset: bool,
    edge_triggered_recv: bool,
    timer_tick: Duration,
}

impl TransportBuilder {
    #[must_use]
    pub fn new(gsi: Gsi) -> Self {
        Self {
            gsi,
            sport: 0,
            dport: DEFAULT_DATA_DESTINATION_PORT,
            encapsulation: Encapsulation::UdpEncap,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            max_tpdu: DEFAULT_MAX_TPDU,
            rxw_sqns: DEFAULT_RXW_SQNS,
            nak_config: NakConfig::default(),
            can_send_data: true,
            can_recv_data: true,
            abort_on_reset: false,
            edge_triggered_recv: false,
            timer_tick: DEFAULT_TIMER_TICK,
        }
    }

    /// Source port of this endpoint's own TSI.
    #[must_use]
    pub fn sport(mut self, sport: u16) -> Self {
        self.sport = sport;
        self
    }

    /// Data-destination port of the session.
    #[must_use]
    pub fn dport(mut self, dport: u16) -> Self {
        self.dport = dport;
        self
    }

    #[must_use]
    pub fn encapsulation(mut self, encapsulation: Encapsulation) -> Self {
        self.encapsulation = encapsulation;
        self
    }

    #[must_use]
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    #[must_use]
    pub fn max_tpdu(mut self, max_tpdu: usize) -> Self {
        self.max_tpdu = max_tpdu;
        self
    }

    /// Receive-window span in sequence numbers.
    #[must_use]
    pub fn rxw_sqns(mut self, sqns: u32) -> Self {
        self.rxw_sqns = sqns;
        self
    }

    /// Repair timing and retry budgets.
    #[must_use]
    pub fn nak_config(mut self, config: NakConfig) -> Self {
        self.nak_config = config;
        self
    }

    /// Mute the receive path: this endpoint only sources data.
    #[must_use]
    pub fn send_only(mut self) -> Self {
        self.can_send_data = true;
        self.can_recv_data = false;
        self
    }

    /// Mute the source path: this endpoint only receives data.
    #[must_use]
    pub fn recv_only(mut self) -> Self {
        self.can_send_data = false;
        self.can_recv_data = true;
        self
    }

    /// Keep the reset latch set after surfacing, making the transport
    /// terminal on unrecoverable loss.
    #[must_use]
    pub fn abort_on_reset(mut self, abort: bool) -> Self {
        self.abort_on_reset = abort;
        self
    }

    /// Edge-triggered (rather than level-triggered) pending notification.
    #[must_use]
    pub fn edge_triggered(mut self, edge: bool) -> Self {
        self.edge_triggered_recv = edge;
        self
    }

    /// Upper bound on the protocol timer period.
    #[must_use]
    pub fn timer_tick(mut self, tick: Duration) -> Self {
        self.timer_tick = tick;
        self
    }

    /// Create the socket per the encapsulation mode and bind.
    pub fn bind(self) -> io::Result<Transport> {
        let socket = match self.encapsulation {
            Encapsulation::UdpEncap => udp::create_udp_socket(self.bind_addr)?,
            Encapsulation::RawIp => udp::create_raw_socket(self.bind_addr)?,
        };
        self.finish(socket)
    }

    /// Adopt a caller-prepared socket (multicast groups already joined).
    pub fn bind_with_socket(self, socket: Socket) -> io::Result<Transport> {
        udp::configure(&socket, self.bind_addr.is_ipv6())?;
        self.finish(socket)
    }

    fn finish(self, socket: Socket) -> io::Result<Transport> {
        if self.max_tpdu < crate::config::PGM_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_tpdu smaller than a PGM header",
            ));
        }
        let local_port = socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .unwrap_or(0);

        let notify = NotifyChannel::new()?;
        let poll = Poll::new()?;
        let recv_fd = socket.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&recv_fd), TOKEN_RECV, Interest::READABLE)?;
        let pending_fd = notify.read_fd();
        poll.registry()
            .register(&mut SourceFd(&pending_fd), TOKEN_PENDING, Interest::READABLE)?;

        log::debug!(
            "[transport] bound tsi={}.{} dport={} port={} encap={:?}",
            self.gsi,
            self.sport,
            self.dport,
            local_port,
            self.encapsulation
        );

        Ok(Transport {
            socket: Arc::new(socket),
            encapsulation: self.encapsulation,
            max_tpdu: self.max_tpdu,
            tsi: Tsi::new(self.gsi, self.sport),
            dport: self.dport,
            local_port,
            can_send_data: self.can_send_data,
            can_recv_data: self.can_recv_data,
            abort_on_reset: self.abort_on_reset,
            edge_triggered_recv: self.edge_triggered_recv,
            rxw_sqns: self.rxw_sqns,
            nak_config: self.nak_config,
            is_destroyed: AtomicBool::new(false),
            peers: RwLock::new(HashMap::new()),
            pending: Mutex::new(PendingState {
                peers_pending: VecDeque::new(),
                is_pending_read: false,
                is_reset: false,
                timer: TimerState::new(self.timer_tick),
            }),
            ingest: Mutex::new(IngestState {
                rx_buffer: SkBuff::with_capacity(self.max_tpdu),
                poll,
                events: Events::with_capacity(8),
            }),
            notify,
            stats: TransportStats::new(),
        })
    }
}

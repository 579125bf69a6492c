// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rpgm - PGM reliable multicast transport (receive path)
//!
//! A pure Rust implementation of the receive side of a PGM (Pragmatic
//! General Multicast, RFC 3208) transport endpoint: a single-threaded
//! packet-ingest dispatcher that classifies datagrams against the
//! endpoint's identity, feeds per-peer reassembly windows, interleaves
//! protocol timers and delivers ordered, contiguous application data
//! units.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rpgm::{Gsi, RecvData, RecvFlags, TransportBuilder};
//!
//! fn main() -> std::io::Result<()> {
//!     let transport = TransportBuilder::new(Gsi::new([10, 0, 0, 1, 0, 1]))
//!         .dport(7500)
//!         .recv_only()
//!         .bind()?;
//!
//!     let mut msgv = Vec::new();
//!     loop {
//!         match transport.recvmsgv(&mut msgv, 16, RecvFlags::BLOCKING) {
//!             Ok(RecvData::Apdus { count, bytes }) => {
//!                 println!("{} APDUs, {} bytes", count, bytes);
//!             }
//!             Ok(RecvData::WouldBlock) => continue,
//!             Ok(RecvData::Reset(tsi)) => {
//!                 eprintln!("unrecoverable loss from {}", tsi);
//!             }
//!             Err(err) => return Err(std::io::Error::other(err.to_string())),
//!         }
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                      recvmsgv / recvfrom / recv                  |
//! +------------------------------------------------------------------+
//! |  Ingest loop: flush pending -> read -> parse -> classify ->      |
//! |  dispatch -> wait (bounded by next timer expiration)             |
//! +------------------------------------------------------------------+
//! |  Peer table (TSI -> peer) | receive windows | NAK state machines |
//! +------------------------------------------------------------------+
//! |  Socket reader (PKTINFO) | wire codec | notify channel | timers  |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`transport`] - endpoint construction, socket ownership, peer table
//! - [`recv`] - the packet-ingest dispatcher and receive API
//! - [`receiver`] - per-peer state: receive window, NAK repair
//! - [`protocol`] - wire codec, session identifiers, serial arithmetic
//! - [`timer`] - protocol timer interleave
//!
//! Interface enumeration, multicast group joining and the data send path
//! are out of scope; hand a prepared socket to
//! [`TransportBuilder::bind_with_socket`].

pub mod buffer;
pub mod config;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod recv;
pub mod stats;
pub mod timer;
pub mod transport;

pub use buffer::SkBuff;
pub use error::{RecvError, RecvErrorKind};
pub use protocol::{Gsi, PgmType, Tsi};
pub use receiver::nak::NakConfig;
pub use recv::{classify, Apdu, Direction, RecvBytes, RecvData, RecvFlags};
pub use stats::StatCounter;
pub use transport::{Encapsulation, PollInfo, Transport, TransportBuilder};

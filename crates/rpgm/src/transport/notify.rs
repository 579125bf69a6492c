// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pending-delivery notification channel.
//!
//! A capacity-1 token queue backed by a socket pair so that external
//! pollers can select on a real file descriptor. The one-token discipline
//! is enforced by the transport's `is_pending_read` latch, which is only
//! updated under the pending mutex.

use nix::sys::socket::{recv, MsgFlags};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// One-token notification channel with a pollable read descriptor.
#[derive(Debug)]
pub struct NotifyChannel {
    tx: UnixStream,
    rx: UnixStream,
}

impl NotifyChannel {
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self { tx, rx })
    }

    /// Write one token. Safe to call from any thread.
    pub fn send(&self) {
        if let Err(err) = (&self.tx).write(&[1u8]) {
            if err.kind() != io::ErrorKind::WouldBlock {
                log::debug!("[notify] send failed: {}", err);
            }
        }
    }

    /// Drain every queued token.
    pub fn clear(&self) {
        let mut buf = [0u8; 16];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::debug!("[notify] clear failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Non-destructively check whether a token is queued.
    #[must_use]
    pub fn token_pending(&self) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            recv(
                self.rx.as_raw_fd(),
                &mut buf,
                MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
            ),
            Ok(n) if n > 0
        )
    }

    /// Descriptor external pollers watch for readability.
    #[must_use]
    pub fn read_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.read_fd() >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let notify = NotifyChannel::new().expect("channel");
        assert!(!notify.token_pending());

        notify.send();
        assert!(notify.token_pending());
        // peek does not consume
        assert!(notify.token_pending());

        notify.clear();
        assert!(!notify.token_pending());
    }

    #[test]
    fn clear_drains_multiple_tokens() {
        let notify = NotifyChannel::new().expect("channel");
        notify.send();
        notify.send();
        notify.clear();
        assert!(!notify.token_pending());
    }

    #[test]
    fn descriptor_is_valid() {
        let notify = NotifyChannel::new().expect("channel");
        assert!(notify.is_valid());
    }
}

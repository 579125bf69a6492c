// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Caller-visible receive errors.
//!
//! Parse and classification failures never reach the caller; they are
//! counted and the ingest loop retries. Errors of this type are reserved for
//! argument validation, wait-stage syscall failures and unrecoverable loss.

use std::fmt;
use std::io;

/// Error kinds surfaced by the receive API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvErrorKind {
    /// Invalid or destroyed transport handle.
    Badf,
    /// Low-level syscall failure in the wait stage.
    Fault,
    /// Blocking wait interrupted by a signal.
    Intr,
    /// Argument validation failure.
    Inval,
    /// Allocation failure.
    Nomem,
    /// Session reset on unrecoverable loss.
    ConnReset,
    /// Catch-all for unmapped failures.
    Failed,
}

impl RecvErrorKind {
    /// Map an OS errno onto the receive taxonomy.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBADF => RecvErrorKind::Badf,
            libc::EFAULT => RecvErrorKind::Fault,
            libc::EINTR => RecvErrorKind::Intr,
            libc::EINVAL => RecvErrorKind::Inval,
            libc::ENOMEM => RecvErrorKind::Nomem,
            _ => RecvErrorKind::Failed,
        }
    }

    fn label(self) -> &'static str {
        match self {
            RecvErrorKind::Badf => "bad transport",
            RecvErrorKind::Fault => "fault",
            RecvErrorKind::Intr => "interrupted",
            RecvErrorKind::Inval => "invalid argument",
            RecvErrorKind::Nomem => "out of memory",
            RecvErrorKind::ConnReset => "connection reset",
            RecvErrorKind::Failed => "failed",
        }
    }
}

/// Receive-path error with a taxonomy kind and context message.
#[derive(Debug, Clone)]
pub struct RecvError {
    kind: RecvErrorKind,
    message: String,
}

impl RecvError {
    pub fn new(kind: RecvErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wrap a wait-stage I/O error, mapping its errno through the taxonomy.
    pub fn from_io(err: &io::Error, context: &str) -> Self {
        let kind = err
            .raw_os_error()
            .map(RecvErrorKind::from_errno)
            .unwrap_or(RecvErrorKind::Failed);
        Self::new(kind, format!("{}: {}", context, err))
    }

    #[must_use]
    pub fn kind(&self) -> RecvErrorKind {
        self.kind
    }
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for RecvError {}

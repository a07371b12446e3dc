// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Local IPC transport.
//!
//! Carries framed discovery messages over Unix-domain stream sockets. Both
//! endpoints run a dedicated reactor thread built on mio's poll-based event
//! loop:
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                       reactor thread                          |
//! |  +---------------------------------------------------------+  |
//! |  |                      mio::Poll                          |  |
//! |  |  - listener / stream readiness                          |  |
//! |  |  - waker (commands + software events from user threads) |  |
//! |  |  - connect-retry deadline (poll timeout)                |  |
//! |  +---------------------------------------------------------+  |
//! |                            |                                  |
//! |                            v                                  |
//! |        on_connected / on_message / on_disconnected            |
//! |              (invoked with no transport mutex held)           |
//! +---------------------------------------------------------------+
//! ```
//!
//! Sends are synchronous from the calling thread; receives are asynchronous
//! and re-armed after every message.

pub mod client;
pub mod frame;
pub mod server;

pub use client::{IpcClient, IpcClientHandle};
pub use server::{IpcServer, IpcServerHandle};

use std::fmt;
use std::path::{Path, PathBuf};

/// Opaque handle identifying one accepted connection on the broker side.
///
/// Handles increase monotonically and are never reused within one server
/// lifetime.
pub type ConnectionHandle = u64;

/// The binding plane a participant belongs to.
///
/// A service instance lives on exactly one plane; updates are never leaked
/// across planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    Ipc,
    ZeroCopy,
}

impl BindingType {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            BindingType::Ipc => 0,
            BindingType::ZeroCopy => 1,
        }
    }

    pub(crate) fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(BindingType::Ipc),
            1 => Some(BindingType::ZeroCopy),
            _ => None,
        }
    }
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingType::Ipc => write!(f, "Ipc"),
            BindingType::ZeroCopy => write!(f, "ZeroCopy"),
        }
    }
}

/// Why a connection was closed.
///
/// Communicated to the disconnect callback. The broker uses it to decide
/// whether implicitly retracted offers are announced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseConnectionCause {
    /// Close requested by the peer or by local bookkeeping.
    Default,
    /// Close triggered by a shutdown of the endpoint itself.
    Shutdown,
    /// Abnormal connection close (transport-level failure).
    AbnormalClose,
    /// User-defined cause.
    User(u8),
}

impl fmt::Display for CloseConnectionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseConnectionCause::Default => write!(f, "Default"),
            CloseConnectionCause::Shutdown => write!(f, "Shutdown"),
            CloseConnectionCause::AbnormalClose => write!(f, "AbnormalClose"),
            CloseConnectionCause::User(value) => write!(f, "User({value})"),
        }
    }
}

/// Name of a local IPC listening endpoint, value-compared as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnicastAddress {
    pub domain: u32,
    pub port: u32,
}

impl UnicastAddress {
    pub const fn new(domain: u32, port: u32) -> Self {
        Self { domain, port }
    }

    /// Filesystem path of the Unix-domain socket behind this address.
    pub fn socket_path(&self, root: &Path) -> PathBuf {
        root.join(format!("ipcsd_{}_{}.sock", self.domain, self.port))
    }
}

impl fmt::Display for UnicastAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Domain: {}, Port: {}]", self.domain, self.port)
    }
}

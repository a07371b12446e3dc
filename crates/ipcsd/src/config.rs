// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Wire constants and participant configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::transport::{BindingType, UnicastAddress};

/// Protocol version carried in every `Init` message. Broker and clients must
/// agree; a mismatch drops the connection.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on the encoded size of a single discovery message.
///
/// The transport rejects larger sends before touching the wire and sizes its
/// receive buffers to exactly this bound.
pub const MAX_MESSAGE_SIZE: usize = 32;

/// Default delay between connection establishment attempts towards the
/// broker.
pub const DEFAULT_CONNECT_RETRY_TIME: Duration = Duration::from_secs(1);

/// Default broker endpoint, shared by both binding planes.
pub const DEFAULT_BROKER_ADDRESS: UnicastAddress = UnicastAddress::new(0, 7400);

/// Configuration of one participant-side discovery client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory holding the broker's socket.
    pub address_root: PathBuf,
    /// Endpoint the broker listens on.
    pub broker_address: UnicastAddress,
    /// Binding plane all updates of this client are scoped to.
    pub binding_type: BindingType,
    /// Delay between connection establishment retries.
    pub connect_retry_time: Duration,
}

impl ClientConfig {
    pub fn new(binding_type: BindingType) -> Self {
        Self {
            address_root: PathBuf::from("/tmp"),
            broker_address: DEFAULT_BROKER_ADDRESS,
            binding_type,
            connect_retry_time: DEFAULT_CONNECT_RETRY_TIME,
        }
    }

    /// Filesystem path of the broker socket this client connects to.
    pub fn broker_socket_path(&self) -> PathBuf {
        self.broker_address.socket_path(&self.address_root)
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Error codes for the service discovery protocol and its transport.
//!
//! The set is closed: every fallible operation in this crate reports one of
//! these codes. Protocol violations never travel on the wire as error
//! messages; the offending connection is closed instead and the peer observes
//! a disconnect.

use thiserror::Error;

/// All error codes surfaced by the discovery API and transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DiscoveryError {
    /// Sentinel, never emitted on success paths.
    #[error("default error")]
    DefaultError,

    /// Connection to the peer was lost mid-operation.
    #[error("disconnected from peer")]
    Disconnected,

    /// The transport send buffer cannot accept the message right now.
    #[error("send buffer of ipc connection is full")]
    SendBufferFull,

    /// A received message failed to decode or violated a message invariant.
    #[error("received message is corrupted")]
    MessageCorrupted,

    /// Message exceeds the configured maximum message size.
    #[error("violation of the maximum message size")]
    MessageSizeMaximum,

    /// No connection with the given handle exists.
    #[error("no such connection exists")]
    NoSuchConnection,

    /// No such entry in a service registry. Internal, not surfaced to users.
    #[error("no such entry in the service registry exists")]
    NoSuchEntry,

    /// The client has not registered with an `Init` message.
    #[error("the client is not registered")]
    ClientNotRegistered,

    /// The client sent a second `Init` message.
    #[error("the client is already registered")]
    ClientAlreadyRegistered,

    /// Catch-all for violations of the discovery protocol.
    #[error("violation of the service discovery protocol")]
    ProtocolError,

    /// Service instance is already provided.
    #[error("service instance is already provided")]
    AlreadyProvided,

    /// Service instance is provided, but with a different endpoint.
    #[error("service instance is provided with a different endpoint")]
    ProvidedDifferentEndpoint,

    /// Service instance is or was provided by a different client.
    #[error("service instance is or was provided by a different client")]
    ProvidedDifferentClient,

    /// Service instance is currently not provided.
    #[error("service instance is currently not provided")]
    NotProvided,

    /// Service instance was never provided.
    #[error("service instance was never provided")]
    NeverProvided,

    /// Service instance is already required.
    #[error("service instance is already required")]
    AlreadyRequired,

    /// Service instance is currently not required.
    #[error("service instance is currently not required")]
    NotRequired,

    /// Service instance was never required.
    #[error("service instance was never required")]
    NeverRequired,
}

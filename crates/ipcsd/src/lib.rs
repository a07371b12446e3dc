// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! # ipcsd - centralized IPC service discovery
//!
//! A service-discovery broker for local inter-process communication.
//! Processes on one host advertise (*offer*) and subscribe to (*listen*)
//! service instances identified by `(service_id, instance_id, major_version,
//! minor_version)`; a central broker relays the advertisements so that
//! subscribers learn the endpoints of matching providers as they come and go.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------+          +-------------------+
//! |  participant A    |          |  participant B    |
//! |  IpcServiceDisc.  |          |  IpcServiceDisc.  |
//! |   SdClient        |          |   SdClient        |
//! |    IpcClient -----+---+  +---+---- IpcClient     |
//! +-------------------+   |  |   +-------------------+
//!                         v  v
//!                  +---------------+
//!                  |   IpcServer   |        broker process
//!                  |   SdServer    |        (ipcsd-broker)
//!                  +---------------+
//! ```
//!
//! Messages travel as fixed-shape frames over Unix-domain stream sockets.
//! Two binding planes (`Ipc`, `ZeroCopy`) coexist under one broker; a
//! service instance belongs to exactly one plane and updates never cross
//! planes.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use ipcsd::{
//!     ClientConfig, IpcServiceDiscovery, ProvidedInstance, RequiredInstance, UnicastAddress,
//! };
//! use ipcsd::transport::BindingType;
//!
//! fn main() -> std::io::Result<()> {
//!     let config = ClientConfig::new(BindingType::Ipc);
//!     let mut discovery = IpcServiceDiscovery::new(&config)?;
//!     discovery.initialize();
//!
//!     // Offer a service instance at a local endpoint.
//!     let instance = ProvidedInstance::new(42, 7, 1, 0);
//!     let endpoint = UnicastAddress::new(1, 100);
//!     discovery.offer_service(instance, endpoint).expect("offer");
//!
//!     // Subscribe with a wildcard and react to matching providers.
//!     let pattern = RequiredInstance::new(42, ipcsd::INSTANCE_ID_ALL, 1, 0);
//!     discovery
//!         .listen_service(
//!             pattern,
//!             Some(std::sync::Arc::new(|required, endpoint, state| {
//!                 println!("{required}: {} is {state:?}", endpoint.address);
//!             })),
//!         )
//!         .expect("listen");
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`instance`] - identifiers and wildcard matching
//! - [`registry`] - identifier-keyed registries
//! - [`protocol`] - the framed wire messages
//! - [`transport`] - reactor-driven IPC client and server
//! - [`sd_client`] - participant-side protocol engine
//! - [`sd_server`] - broker-side protocol engine

pub mod config;
pub mod error;
pub mod instance;
pub mod protocol;
pub mod registry;
pub mod sd_client;
pub mod sd_server;
pub mod service_discovery;
pub mod transport;

pub use config::{ClientConfig, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use error::DiscoveryError;
pub use instance::{
    ProvidedInstance, RequiredInstance, ServiceInstanceId, INSTANCE_ID_ALL, MINOR_VERSION_ANY,
};
pub use registry::{ProvidedState, RequiredState};
pub use sd_client::{ListenServiceCallback, SdClient, ServiceInstanceEndpoint};
pub use sd_server::SdServer;
pub use service_discovery::IpcServiceDiscovery;
pub use transport::{BindingType, CloseConnectionCause, ConnectionHandle, UnicastAddress};

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Participant facade.
//!
//! Wraps the discovery client behind an explicit initialize/deinitialize
//! lifecycle. All discovery calls require a prior [`IpcServiceDiscovery::initialize`];
//! violating the lifecycle is a caller bug and fatal.

use std::io;

use crate::config::ClientConfig;
use crate::error::DiscoveryError;
use crate::instance::{ProvidedInstance, RequiredInstance};
use crate::sd_client::{ListenServiceCallback, SdClient, ServiceInstanceEndpoint};
use crate::transport::UnicastAddress;

/// One participant's handle to the centralized service discovery.
///
/// A participant belongs to exactly one binding plane, fixed in the
/// [`ClientConfig`].
pub struct IpcServiceDiscovery {
    client: SdClient,
    initialized: bool,
}

impl IpcServiceDiscovery {
    pub fn new(config: &ClientConfig) -> io::Result<Self> {
        Ok(Self {
            client: SdClient::new(config)?,
            initialized: false,
        })
    }

    /// Connect to the broker.
    ///
    /// # Panics
    ///
    /// Panics when already initialized.
    pub fn initialize(&mut self) {
        assert!(!self.initialized, "already initialized");
        self.initialized = true;
        self.client.connect();
    }

    /// Disconnect from the broker and drop all remote knowledge.
    ///
    /// # Panics
    ///
    /// Panics when not initialized.
    pub fn deinitialize(&mut self) {
        assert!(self.initialized, "not initialized");
        self.initialized = false;
        self.client.close();
    }

    pub fn offer_service(
        &self,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        self.assert_initialized();
        self.client.offer_service(instance, address)
    }

    pub fn stop_offer_service(
        &self,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        self.assert_initialized();
        self.client.stop_offer_service(instance, address)
    }

    pub fn listen_service(
        &self,
        instance: RequiredInstance,
        callback: Option<ListenServiceCallback>,
    ) -> Result<(), DiscoveryError> {
        self.assert_initialized();
        self.client.listen_service(instance, callback)
    }

    pub fn stop_listen_service(&self, instance: RequiredInstance) -> Result<(), DiscoveryError> {
        self.assert_initialized();
        self.client.stop_listen_service(instance)
    }

    pub fn poll_service(
        &self,
        instance: RequiredInstance,
    ) -> Result<Vec<ServiceInstanceEndpoint>, DiscoveryError> {
        self.assert_initialized();
        self.client.poll_required(instance)
    }

    pub fn poll_service_instance(
        &self,
        instance: ProvidedInstance,
    ) -> Result<Option<UnicastAddress>, DiscoveryError> {
        self.assert_initialized();
        self.client.poll_provided(instance)
    }

    fn assert_initialized(&self) {
        assert!(self.initialized, "not initialized");
    }
}

impl Drop for IpcServiceDiscovery {
    fn drop(&mut self) {
        if self.initialized {
            self.deinitialize();
        }
    }
}

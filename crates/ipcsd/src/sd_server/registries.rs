// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Broker-side registries.
//!
//! The client registry tracks every registered connection with its binding
//! plane and the instances it currently provides or requires. The provided
//! and required service registries hold the central view per binding plane;
//! their update methods perform the per-connection protocol validation whose
//! error codes decide whether the broker drops a client.

use std::collections::{HashMap, HashSet};

use crate::error::DiscoveryError;
use crate::instance::{ProvidedInstance, RequiredInstance};
use crate::registry::{ProvidedState, ServiceRegistry};
use crate::transport::{BindingType, ConnectionHandle, UnicastAddress};

/// Per-connection bookkeeping of a registered client.
#[derive(Debug, Clone)]
pub(crate) struct ClientEntry {
    pub(crate) binding_type: BindingType,
    pub(crate) provided: HashSet<ProvidedInstance>,
    pub(crate) required: HashSet<RequiredInstance>,
}

/// Registered clients, indexed by connection handle.
#[derive(Debug, Default)]
pub(crate) struct ClientRegistry {
    clients: HashMap<ConnectionHandle, ClientEntry>,
}

impl ClientRegistry {
    /// Register a connection after a valid `Init`.
    ///
    /// # Panics
    ///
    /// Panics if the handle is already registered; the caller checks first.
    pub(crate) fn register(&mut self, handle: ConnectionHandle, binding_type: BindingType) {
        let previous = self.clients.insert(
            handle,
            ClientEntry {
                binding_type,
                provided: HashSet::new(),
                required: HashSet::new(),
            },
        );
        assert!(previous.is_none(), "client {handle} already registered");
    }

    pub(crate) fn unregister(&mut self, handle: ConnectionHandle) -> Option<ClientEntry> {
        self.clients.remove(&handle)
    }

    pub(crate) fn is_registered(&self, handle: ConnectionHandle) -> bool {
        self.clients.contains_key(&handle)
    }

    pub(crate) fn get(&self, handle: ConnectionHandle) -> Result<&ClientEntry, DiscoveryError> {
        self.clients
            .get(&handle)
            .ok_or(DiscoveryError::ClientNotRegistered)
    }

    pub(crate) fn add_provided(&mut self, handle: ConnectionHandle, instance: ProvidedInstance) {
        let entry = self.clients.get_mut(&handle).expect("client is registered");
        entry.provided.insert(instance);
    }

    pub(crate) fn remove_provided(&mut self, handle: ConnectionHandle, instance: ProvidedInstance) {
        let entry = self.clients.get_mut(&handle).expect("client is registered");
        entry.provided.remove(&instance);
    }

    pub(crate) fn add_required(&mut self, handle: ConnectionHandle, instance: RequiredInstance) {
        let entry = self.clients.get_mut(&handle).expect("client is registered");
        entry.required.insert(instance);
    }

    pub(crate) fn remove_required(&mut self, handle: ConnectionHandle, instance: RequiredInstance) {
        let entry = self.clients.get_mut(&handle).expect("client is registered");
        entry.required.remove(&instance);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }
}

/// Central provided-service entry: the endpoint plus the connection that made
/// the offer. The last field binds an offer to its publisher so a stop-offer
/// from the wrong connection is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProvidedServiceEntry {
    pub(crate) state: ProvidedState,
    pub(crate) address: UnicastAddress,
    pub(crate) last_providing_client: ConnectionHandle,
}

/// Central registry of provided service instances on one binding plane.
#[derive(Debug, Default)]
pub(crate) struct ServerProvidedRegistry {
    registry: ServiceRegistry<ProvidedInstance, ProvidedServiceEntry>,
}

impl ServerProvidedRegistry {
    /// Apply an `OfferService` from a client.
    ///
    /// An instance may be re-offered (also by another client) once it is
    /// `NotProvided`; an active offer is protected against duplicates and
    /// endpoint changes.
    pub(crate) fn update_provided(
        &mut self,
        handle: ConnectionHandle,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        if let Some(entry) = self.registry.find(&instance) {
            if entry.state == ProvidedState::Provided {
                return Err(if entry.address == address {
                    DiscoveryError::AlreadyProvided
                } else {
                    DiscoveryError::ProvidedDifferentEndpoint
                });
            }
        }
        self.registry.insert(
            instance,
            ProvidedServiceEntry {
                state: ProvidedState::Provided,
                address,
                last_providing_client: handle,
            },
        );
        Ok(())
    }

    /// Apply a `StopOfferService` from a client.
    pub(crate) fn update_not_provided(
        &mut self,
        handle: ConnectionHandle,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        match self.registry.find_mut(&instance) {
            None => Err(DiscoveryError::NeverProvided),
            Some(entry) => {
                if entry.state != ProvidedState::Provided {
                    return Err(DiscoveryError::NotProvided);
                }
                if entry.last_providing_client != handle {
                    return Err(DiscoveryError::ProvidedDifferentClient);
                }
                if entry.address != address {
                    return Err(DiscoveryError::ProvidedDifferentEndpoint);
                }
                entry.state = ProvidedState::NotProvided;
                Ok(())
            }
        }
    }

    /// Transition one instance of a vanished client to `NotProvided`,
    /// returning the endpoint it was offered at.
    pub(crate) fn retract_on_disconnect(
        &mut self,
        handle: ConnectionHandle,
        instance: ProvidedInstance,
    ) -> Option<UnicastAddress> {
        let entry = self.registry.find_mut(&instance)?;
        if entry.state != ProvidedState::Provided || entry.last_providing_client != handle {
            return None;
        }
        entry.state = ProvidedState::NotProvided;
        Some(entry.address)
    }

    /// Entries in state `Provided` matching a subscription, for the
    /// listen-path replay.
    pub(crate) fn provided_matches(
        &self,
        required: &RequiredInstance,
    ) -> Vec<(ProvidedInstance, UnicastAddress)> {
        self.registry
            .match_and_get(required)
            .into_iter()
            .filter(|(_, entry)| entry.state == ProvidedState::Provided)
            .map(|(instance, entry)| (instance, entry.address))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn find(&self, instance: &ProvidedInstance) -> Option<&ProvidedServiceEntry> {
        self.registry.find(instance)
    }
}

/// Central registry of subscriptions on one binding plane.
#[derive(Debug, Default)]
pub(crate) struct ServerRequiredRegistry {
    registry: ServiceRegistry<RequiredInstance, HashSet<ConnectionHandle>>,
}

impl ServerRequiredRegistry {
    /// Apply a `ListenService` from a client.
    pub(crate) fn update_required(
        &mut self,
        handle: ConnectionHandle,
        instance: RequiredInstance,
    ) -> Result<(), DiscoveryError> {
        match self.registry.find_mut(&instance) {
            Some(clients) => {
                if clients.insert(handle) {
                    Ok(())
                } else {
                    Err(DiscoveryError::AlreadyRequired)
                }
            }
            None => {
                let mut clients = HashSet::new();
                clients.insert(handle);
                self.registry.insert(instance, clients);
                Ok(())
            }
        }
    }

    /// Apply a `StopListenService` from a client.
    pub(crate) fn update_not_required(
        &mut self,
        handle: ConnectionHandle,
        instance: RequiredInstance,
    ) -> Result<(), DiscoveryError> {
        match self.registry.find_mut(&instance) {
            Some(clients) => {
                if clients.remove(&handle) {
                    Ok(())
                } else {
                    Err(DiscoveryError::NotRequired)
                }
            }
            None => Err(DiscoveryError::NotRequired),
        }
    }

    /// Strip a vanished client from every entry.
    pub(crate) fn remove_client(&mut self, handle: ConnectionHandle) {
        for (_, clients) in self.registry.iter_mut() {
            clients.remove(&handle);
        }
    }

    /// Subscribing connections matching a provided instance.
    pub(crate) fn requiring_clients(&self, instance: &ProvidedInstance) -> Vec<ConnectionHandle> {
        self.registry
            .match_and_get(instance)
            .into_iter()
            .flat_map(|(_, clients)| clients.iter().copied().collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ProvidedInstance {
        ProvidedInstance::new(42, 7, 1, 0)
    }

    fn address(port: u32) -> UnicastAddress {
        UnicastAddress::new(1, port)
    }

    #[test]
    fn test_client_registry_lifecycle() {
        let mut registry = ClientRegistry::default();
        assert!(!registry.is_registered(1));
        assert_eq!(registry.get(1).unwrap_err(), DiscoveryError::ClientNotRegistered);

        registry.register(1, BindingType::Ipc);
        assert!(registry.is_registered(1));
        assert_eq!(registry.get(1).unwrap().binding_type, BindingType::Ipc);

        registry.add_provided(1, instance());
        registry.add_required(1, RequiredInstance::new(9, 9, 9, 9));
        let entry = registry.unregister(1).unwrap();
        assert_eq!(entry.provided.len(), 1);
        assert_eq!(entry.required.len(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_register_panics() {
        let mut registry = ClientRegistry::default();
        registry.register(1, BindingType::Ipc);
        registry.register(1, BindingType::ZeroCopy);
    }

    #[test]
    fn test_update_provided_validation() {
        let mut registry = ServerProvidedRegistry::default();
        registry.update_provided(1, instance(), address(100)).unwrap();
        assert_eq!(
            registry.update_provided(1, instance(), address(100)),
            Err(DiscoveryError::AlreadyProvided)
        );
        assert_eq!(
            registry.update_provided(2, instance(), address(101)),
            Err(DiscoveryError::ProvidedDifferentEndpoint)
        );
    }

    #[test]
    fn test_update_not_provided_validation() {
        let mut registry = ServerProvidedRegistry::default();
        assert_eq!(
            registry.update_not_provided(1, instance(), address(100)),
            Err(DiscoveryError::NeverProvided)
        );

        registry.update_provided(1, instance(), address(100)).unwrap();
        assert_eq!(
            registry.update_not_provided(2, instance(), address(100)),
            Err(DiscoveryError::ProvidedDifferentClient)
        );
        assert_eq!(
            registry.update_not_provided(1, instance(), address(101)),
            Err(DiscoveryError::ProvidedDifferentEndpoint)
        );

        registry.update_not_provided(1, instance(), address(100)).unwrap();
        assert_eq!(
            registry.update_not_provided(1, instance(), address(100)),
            Err(DiscoveryError::NotProvided)
        );
        // The entry survives in state NotProvided with its address.
        let entry = registry.find(&instance()).unwrap();
        assert_eq!(entry.state, ProvidedState::NotProvided);
        assert_eq!(entry.address, address(100));
    }

    #[test]
    fn test_another_client_may_take_over_a_stopped_instance() {
        let mut registry = ServerProvidedRegistry::default();
        registry.update_provided(1, instance(), address(100)).unwrap();
        registry.update_not_provided(1, instance(), address(100)).unwrap();
        registry.update_provided(2, instance(), address(200)).unwrap();
        let entry = registry.find(&instance()).unwrap();
        assert_eq!(entry.last_providing_client, 2);
        assert_eq!(entry.address, address(200));
    }

    #[test]
    fn test_retract_on_disconnect() {
        let mut registry = ServerProvidedRegistry::default();
        registry.update_provided(1, instance(), address(100)).unwrap();
        assert_eq!(
            registry.retract_on_disconnect(1, instance()),
            Some(address(100))
        );
        // Already retracted, nothing to announce.
        assert_eq!(registry.retract_on_disconnect(1, instance()), None);
    }

    #[test]
    fn test_required_registry_membership() {
        let mut registry = ServerRequiredRegistry::default();
        let required = RequiredInstance::new(42, crate::instance::INSTANCE_ID_ALL, 1, 0);

        registry.update_required(1, required).unwrap();
        assert_eq!(
            registry.update_required(1, required),
            Err(DiscoveryError::AlreadyRequired)
        );
        registry.update_required(2, required).unwrap();

        let mut clients = registry.requiring_clients(&instance());
        clients.sort_unstable();
        assert_eq!(clients, vec![1, 2]);

        registry.update_not_required(1, required).unwrap();
        assert_eq!(
            registry.update_not_required(1, required),
            Err(DiscoveryError::NotRequired)
        );
        assert_eq!(
            registry.update_not_required(3, RequiredInstance::new(5, 5, 5, 5)),
            Err(DiscoveryError::NotRequired)
        );

        registry.remove_client(2);
        assert!(registry.requiring_clients(&instance()).is_empty());
    }

    #[test]
    fn test_provided_matches_for_listen_replay() {
        let mut registry = ServerProvidedRegistry::default();
        registry.update_provided(1, instance(), address(100)).unwrap();
        let other = ProvidedInstance::new(42, 8, 1, 2);
        registry.update_provided(2, other, address(101)).unwrap();
        registry.update_not_provided(2, other, address(101)).unwrap();

        let required = RequiredInstance::new(42, crate::instance::INSTANCE_ID_ALL, 1, 0);
        let matches = registry.provided_matches(&required);
        assert_eq!(matches, vec![(instance(), address(100))]);
    }
}

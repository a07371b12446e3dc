// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Participant-side service registries.
//!
//! Provided instances are split across two registries: `local` for services
//! this process offers and `remote` for services learned from the broker. A
//! given identifier may only ever live in one of the two; the facade checks
//! the opposite registry on every write and reports
//! [`DiscoveryError::ProvidedDifferentClient`] on a cross-over. Keeping the
//! split structural makes the invariant hold by construction instead of by
//! bookkeeping.
//!
//! Entries are never erased on state transitions. A `NotProvided` or
//! `NotRequired` entry records that the identifier was seen before, which is
//! what distinguishes `NotProvided` from `NeverProvided` in the protocol
//! error reporting. The one exception is the bulk clear of the remote
//! registry when the broker connection drops.

use std::sync::Arc;

use crate::error::DiscoveryError;
use crate::instance::{ProvidedInstance, RequiredInstance};
use crate::registry::{ProvidedState, RequiredState, ServiceRegistry};
use crate::transport::UnicastAddress;

use super::ServiceInstanceEndpoint;

/// Callback invoked for every observed state transition of a matching
/// provided instance. Runs on the reactor thread with no registry lock held.
pub type ListenServiceCallback =
    Arc<dyn Fn(RequiredInstance, ServiceInstanceEndpoint, ProvidedState) + Send + Sync>;

/// Entry value of the provided registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvidedEntryValue {
    pub state: ProvidedState,
    pub address: UnicastAddress,
}

/// One provided registry (either the local or the remote one).
#[derive(Debug, Default)]
pub(crate) struct ClientProvidedRegistry {
    registry: ServiceRegistry<ProvidedInstance, ProvidedEntryValue>,
}

impl ClientProvidedRegistry {
    /// Transition an entry to `Provided`, inserting it on first sight.
    ///
    /// With protocol validation, re-providing an already provided instance is
    /// `AlreadyProvided` (same endpoint) or `ProvidedDifferentEndpoint`.
    /// Without validation the same codes only flag a no-op write, which the
    /// message handlers use to discard duplicate updates.
    pub(crate) fn set_provided(
        &mut self,
        instance: ProvidedInstance,
        address: UnicastAddress,
        validate: bool,
    ) -> Result<(), DiscoveryError> {
        match self.registry.find_mut(&instance) {
            Some(entry) => {
                let new_value = ProvidedEntryValue {
                    state: ProvidedState::Provided,
                    address,
                };
                if validate {
                    if entry.state == ProvidedState::Provided {
                        return Err(if entry.address == address {
                            DiscoveryError::AlreadyProvided
                        } else {
                            DiscoveryError::ProvidedDifferentEndpoint
                        });
                    }
                    *entry = new_value;
                    Ok(())
                } else if *entry == new_value {
                    Err(DiscoveryError::AlreadyProvided)
                } else {
                    *entry = new_value;
                    Ok(())
                }
            }
            None => {
                self.registry.insert(
                    instance,
                    ProvidedEntryValue {
                        state: ProvidedState::Provided,
                        address,
                    },
                );
                Ok(())
            }
        }
    }

    /// Transition an entry to `NotProvided`. The entry is preserved.
    pub(crate) fn set_not_provided(
        &mut self,
        instance: ProvidedInstance,
        address: UnicastAddress,
        validate: bool,
    ) -> Result<(), DiscoveryError> {
        match self.registry.find_mut(&instance) {
            None => Err(DiscoveryError::NeverProvided),
            Some(entry) => {
                let new_value = ProvidedEntryValue {
                    state: ProvidedState::NotProvided,
                    address,
                };
                if validate {
                    if entry.state == ProvidedState::NotProvided {
                        return Err(DiscoveryError::NotProvided);
                    }
                    if entry.address != address {
                        return Err(DiscoveryError::ProvidedDifferentEndpoint);
                    }
                    *entry = new_value;
                    Ok(())
                } else if *entry == new_value {
                    Err(DiscoveryError::NotProvided)
                } else {
                    *entry = new_value;
                    Ok(())
                }
            }
        }
    }

    pub(crate) fn was_ever_provided(&self, instance: &ProvidedInstance) -> bool {
        self.registry.contains(instance)
    }

    pub(crate) fn find(&self, instance: &ProvidedInstance) -> Option<&ProvidedEntryValue> {
        self.registry.find(instance)
    }

    pub(crate) fn contains(&self, instance: &ProvidedInstance) -> bool {
        self.registry.contains(instance)
    }

    /// Matching entries currently in state `Provided`.
    ///
    /// No match at all is `NeverProvided`; matches that are all off is
    /// `NotProvided`.
    pub(crate) fn provided_matches(
        &self,
        required: &RequiredInstance,
    ) -> Result<Vec<(ProvidedInstance, ProvidedEntryValue)>, DiscoveryError> {
        let matches = self.registry.match_and_get(required);
        if matches.is_empty() {
            return Err(DiscoveryError::NeverProvided);
        }
        let provided: Vec<_> = matches
            .into_iter()
            .filter(|(_, value)| value.state == ProvidedState::Provided)
            .map(|(instance, value)| (instance, *value))
            .collect();
        if provided.is_empty() {
            return Err(DiscoveryError::NotProvided);
        }
        Ok(provided)
    }

    /// All entries currently in state `Provided`.
    pub(crate) fn provided_entries(&self) -> Vec<(ProvidedInstance, ProvidedEntryValue)> {
        self.registry
            .iter()
            .filter(|(_, value)| value.state == ProvidedState::Provided)
            .map(|(instance, value)| (*instance, *value))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.registry.clear();
    }
}

/// The local/remote provided registry pair.
#[derive(Debug, Default)]
pub(crate) struct ProvidedServiceRegistries {
    local: ClientProvidedRegistry,
    remote: ClientProvidedRegistry,
}

impl ProvidedServiceRegistries {
    pub(crate) fn local(&self) -> &ClientProvidedRegistry {
        &self.local
    }

    pub(crate) fn remote(&self) -> &ClientProvidedRegistry {
        &self.remote
    }

    pub(crate) fn set_local_provided(
        &mut self,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        self.check_never_remotely_provided(&instance)?;
        self.local.set_provided(instance, address, true)
    }

    pub(crate) fn set_local_not_provided(
        &mut self,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        self.check_never_remotely_provided(&instance)?;
        self.local.set_not_provided(instance, address, true)
    }

    pub(crate) fn set_remote_provided(
        &mut self,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        self.check_never_locally_provided(&instance)?;
        self.remote.set_provided(instance, address, false)
    }

    pub(crate) fn set_remote_not_provided(
        &mut self,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        self.check_never_locally_provided(&instance)?;
        self.remote.set_not_provided(instance, address, false)
    }

    pub(crate) fn clear_remote(&mut self) {
        self.remote.clear();
    }

    fn check_never_locally_provided(
        &self,
        instance: &ProvidedInstance,
    ) -> Result<(), DiscoveryError> {
        if self.local.was_ever_provided(instance) {
            Err(DiscoveryError::ProvidedDifferentClient)
        } else {
            Ok(())
        }
    }

    fn check_never_remotely_provided(
        &self,
        instance: &ProvidedInstance,
    ) -> Result<(), DiscoveryError> {
        if self.remote.was_ever_provided(instance) {
            Err(DiscoveryError::ProvidedDifferentClient)
        } else {
            Ok(())
        }
    }
}

/// Entry value of the required registry. Exactly one callback slot per
/// identifier.
#[derive(Default)]
pub(crate) struct RequiredEntryValue {
    pub(crate) state: RequiredState,
    pub(crate) callback: Option<ListenServiceCallback>,
}

/// Registry of subscriptions this participant holds.
#[derive(Default)]
pub(crate) struct ClientRequiredRegistry {
    registry: ServiceRegistry<RequiredInstance, RequiredEntryValue>,
}

impl ClientRequiredRegistry {
    pub(crate) fn set_required(
        &mut self,
        instance: RequiredInstance,
        callback: Option<ListenServiceCallback>,
    ) -> Result<(), DiscoveryError> {
        match self.registry.find_mut(&instance) {
            Some(entry) => {
                if entry.state == RequiredState::Required {
                    return Err(DiscoveryError::AlreadyRequired);
                }
                entry.state = RequiredState::Required;
                entry.callback = callback;
                Ok(())
            }
            None => {
                self.registry.insert(
                    instance,
                    RequiredEntryValue {
                        state: RequiredState::Required,
                        callback,
                    },
                );
                Ok(())
            }
        }
    }

    pub(crate) fn set_not_required(
        &mut self,
        instance: RequiredInstance,
    ) -> Result<(), DiscoveryError> {
        match self.registry.find_mut(&instance) {
            None => Err(DiscoveryError::NeverRequired),
            Some(entry) => {
                if entry.state == RequiredState::NotRequired {
                    return Err(DiscoveryError::NotRequired);
                }
                entry.state = RequiredState::NotRequired;
                Ok(())
            }
        }
    }

    pub(crate) fn is_required(&self, instance: &RequiredInstance) -> Result<(), DiscoveryError> {
        match self.registry.find(instance) {
            None => Err(DiscoveryError::NeverRequired),
            Some(entry) if entry.state == RequiredState::Required => Ok(()),
            Some(_) => Err(DiscoveryError::NotRequired),
        }
    }

    /// Matching subscriptions currently in state `Required`, with their
    /// callbacks cloned out so they can be fired without the registry lock.
    pub(crate) fn required_matches(
        &self,
        provided: &ProvidedInstance,
    ) -> Result<Vec<(RequiredInstance, Option<ListenServiceCallback>)>, DiscoveryError> {
        let matches = self.registry.match_and_get(provided);
        if matches.is_empty() {
            return Err(DiscoveryError::NeverRequired);
        }
        let required: Vec<_> = matches
            .into_iter()
            .filter(|(_, value)| value.state == RequiredState::Required)
            .map(|(instance, value)| (instance, value.callback.clone()))
            .collect();
        if required.is_empty() {
            return Err(DiscoveryError::NotRequired);
        }
        Ok(required)
    }

    /// Like [`ClientRequiredRegistry::required_matches`], without touching
    /// the callbacks.
    pub(crate) fn check_required_matches(
        &self,
        provided: &ProvidedInstance,
    ) -> Result<(), DiscoveryError> {
        let matches = self.registry.match_and_get(provided);
        if matches.is_empty() {
            return Err(DiscoveryError::NeverRequired);
        }
        if matches
            .iter()
            .any(|(_, value)| value.state == RequiredState::Required)
        {
            Ok(())
        } else {
            Err(DiscoveryError::NotRequired)
        }
    }

    /// All subscriptions currently in state `Required`.
    pub(crate) fn required_entries(&self) -> Vec<RequiredInstance> {
        self.registry
            .iter()
            .filter(|(_, value)| value.state == RequiredState::Required)
            .map(|(instance, _)| *instance)
            .collect()
    }

    /// All subscriptions with a callback in state `Required`, for the bulk
    /// fan-out on disconnect.
    pub(crate) fn required_entries_with_callbacks(
        &self,
    ) -> Vec<(RequiredInstance, ListenServiceCallback)> {
        self.registry
            .iter()
            .filter(|(_, value)| value.state == RequiredState::Required)
            .filter_map(|(instance, value)| {
                value.callback.clone().map(|callback| (*instance, callback))
            })
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
    fn test_local_offer_then_stop() {
        let mut registries = ProvidedServiceRegistries::default();
        registries
            .set_local_provided(instance(), address(100))
            .unwrap();
        registries
            .set_local_not_provided(instance(), address(100))
            .unwrap();
        // Entry is preserved in state NotProvided.
        let entry = registries.local().find(&instance()).unwrap();
        assert_eq!(entry.state, ProvidedState::NotProvided);
        assert_eq!(entry.address, address(100));
    }

    #[test]
    fn test_double_offer_is_already_provided() {
        let mut registries = ProvidedServiceRegistries::default();
        registries
            .set_local_provided(instance(), address(100))
            .unwrap();
        assert_eq!(
            registries.set_local_provided(instance(), address(100)),
            Err(DiscoveryError::AlreadyProvided)
        );
        assert_eq!(
            registries.set_local_provided(instance(), address(101)),
            Err(DiscoveryError::ProvidedDifferentEndpoint)
        );
    }

    #[test]
    fn test_stop_offer_validation_table() {
        let mut registries = ProvidedServiceRegistries::default();
        assert_eq!(
            registries.set_local_not_provided(instance(), address(100)),
            Err(DiscoveryError::NeverProvided)
        );

        registries
            .set_local_provided(instance(), address(100))
            .unwrap();
        assert_eq!(
            registries.set_local_not_provided(instance(), address(101)),
            Err(DiscoveryError::ProvidedDifferentEndpoint)
        );

        registries
            .set_local_not_provided(instance(), address(100))
            .unwrap();
        assert_eq!(
            registries.set_local_not_provided(instance(), address(100)),
            Err(DiscoveryError::NotProvided)
        );
    }

    #[test]
    fn test_reoffer_after_stop_may_change_endpoint() {
        let mut registries = ProvidedServiceRegistries::default();
        registries
            .set_local_provided(instance(), address(100))
            .unwrap();
        registries
            .set_local_not_provided(instance(), address(100))
            .unwrap();
        registries
            .set_local_provided(instance(), address(200))
            .unwrap();
        assert_eq!(
            registries.local().find(&instance()).unwrap().address,
            address(200)
        );
    }

    #[test]
    fn test_local_and_remote_are_disjoint() {
        let mut registries = ProvidedServiceRegistries::default();
        registries
            .set_remote_provided(instance(), address(100))
            .unwrap();
        assert_eq!(
            registries.set_local_provided(instance(), address(101)),
            Err(DiscoveryError::ProvidedDifferentClient)
        );

        let mut registries = ProvidedServiceRegistries::default();
        registries
            .set_local_provided(instance(), address(100))
            .unwrap();
        assert_eq!(
            registries.set_remote_provided(instance(), address(101)),
            Err(DiscoveryError::ProvidedDifferentClient)
        );
        // The guard persists after a stop: "was provided" is enough.
        registries
            .set_local_not_provided(instance(), address(100))
            .unwrap();
        assert_eq!(
            registries.set_remote_provided(instance(), address(101)),
            Err(DiscoveryError::ProvidedDifferentClient)
        );
    }

    #[test]
    fn test_remote_no_op_detection() {
        let mut registries = ProvidedServiceRegistries::default();
        registries
            .set_remote_provided(instance(), address(100))
            .unwrap();
        // Same state, same endpoint: a duplicate update to discard.
        assert_eq!(
            registries.set_remote_provided(instance(), address(100)),
            Err(DiscoveryError::AlreadyProvided)
        );
        // Different endpoint is applied without protocol validation.
        registries
            .set_remote_provided(instance(), address(101))
            .unwrap();

        registries
            .set_remote_not_provided(instance(), address(101))
            .unwrap();
        assert_eq!(
            registries.set_remote_not_provided(instance(), address(101)),
            Err(DiscoveryError::NotProvided)
        );
    }

    #[test]
    fn test_remote_stop_for_unknown_instance() {
        let mut registries = ProvidedServiceRegistries::default();
        assert_eq!(
            registries.set_remote_not_provided(instance(), address(100)),
            Err(DiscoveryError::NeverProvided)
        );
    }

    #[test]
    fn test_provided_matches_error_codes() {
        let mut registry = ClientProvidedRegistry::default();
        let query = RequiredInstance::new(42, 7, 1, 0);
        assert_eq!(
            registry.provided_matches(&query),
            Err(DiscoveryError::NeverProvided)
        );

        registry.set_provided(instance(), address(100), true).unwrap();
        registry
            .set_not_provided(instance(), address(100), true)
            .unwrap();
        assert_eq!(
            registry.provided_matches(&query),
            Err(DiscoveryError::NotProvided)
        );

        registry.set_provided(instance(), address(100), true).unwrap();
        let matches = registry.provided_matches(&query).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, instance());
    }

    #[test]
    fn test_required_registry_state_machine() {
        let mut registry = ClientRequiredRegistry::default();
        let required = RequiredInstance::new(42, 7, 1, 0);

        assert_eq!(
            registry.set_not_required(required),
            Err(DiscoveryError::NeverRequired)
        );
        assert_eq!(
            registry.is_required(&required),
            Err(DiscoveryError::NeverRequired)
        );

        registry.set_required(required, None).unwrap();
        assert_eq!(
            registry.set_required(required, None),
            Err(DiscoveryError::AlreadyRequired)
        );
        assert!(registry.is_required(&required).is_ok());

        registry.set_not_required(required).unwrap();
        assert_eq!(
            registry.set_not_required(required),
            Err(DiscoveryError::NotRequired)
        );
        assert_eq!(
            registry.is_required(&required),
            Err(DiscoveryError::NotRequired)
        );

        // Re-listening flips the state back and installs a new callback.
        registry
            .set_required(required, Some(Arc::new(|_, _, _| {})))
            .unwrap();
        assert!(registry.is_required(&required).is_ok());
    }

    #[test]
    fn test_required_matches_filters_inactive() {
        let mut registry = ClientRequiredRegistry::default();
        let active = RequiredInstance::new(42, crate::instance::INSTANCE_ID_ALL, 1, 0);
        let inactive = RequiredInstance::new(42, 7, 1, 0);
        registry.set_required(active, None).unwrap();
        registry.set_required(inactive, None).unwrap();
        registry.set_not_required(inactive).unwrap();

        let matches = registry.required_matches(&instance()).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, active);

        registry.set_not_required(active).unwrap();
        assert!(matches!(
            registry.required_matches(&instance()),
            Err(DiscoveryError::NotRequired)
        ));
        assert_eq!(
            registry.check_required_matches(&instance()),
            Err(DiscoveryError::NotRequired)
        );
    }
}

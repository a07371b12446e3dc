// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Participant-side discovery protocol engine.
//!
//! The client mirrors its own offers and subscriptions into local registries,
//! forwards every change to the broker, and applies inbound broker updates to
//! a remote registry, fanning matching transitions out to the user's listen
//! callbacks.
//!
//! Registration is a local assertion: after the transport connects, the
//! client sends `Init` followed by a replay of its current registries and
//! considers itself `Registered`. No acknowledgement exists. On connection
//! loss the remote registry is cleared, listeners observe `NotProvided` for
//! everything they knew, and the transport retry loop re-establishes and
//! replays.
//!
//! Lock discipline: user operations take the registry write lock (held across
//! the synchronous send so replay and direct sends cannot reorder), poll
//! operations take the read lock, and every user callback is invoked with no
//! lock held.

pub mod registries;

pub use registries::{ListenServiceCallback, ProvidedEntryValue};

use std::io;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::config::ClientConfig;
use crate::error::DiscoveryError;
use crate::instance::{ProvidedInstance, RequiredInstance};
use crate::protocol::{
    InitMessage, ListenServiceMessage, Message, OfferServiceMessage, StopListenServiceMessage,
    StopOfferServiceMessage,
};
use crate::registry::ProvidedState;
use crate::transport::{BindingType, CloseConnectionCause, IpcClient, IpcClientHandle,
    UnicastAddress};

use registries::{ClientRequiredRegistry, ProvidedServiceRegistries};

/// A concrete provided instance together with the endpoint it is reachable
/// at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInstanceEndpoint {
    pub instance: ProvidedInstance,
    pub address: UnicastAddress,
}

/// Registration state per transport generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdState {
    /// No `Init` sent on the current connection; outbound updates are held
    /// back for the replay.
    NotRegistered,
    /// `Init` sent; updates flow directly.
    Registered,
}

struct SdRegistries {
    provided: ProvidedServiceRegistries,
    required: ClientRequiredRegistry,
    state: SdState,
}

struct SdClientInner {
    binding_type: BindingType,
    registries: RwLock<SdRegistries>,
    ipc: OnceLock<IpcClientHandle>,
}

/// What an inbound service message amounts to, decided under the lock and
/// acted on after releasing it.
enum InboundAction {
    Discard,
    Deliver(Vec<(RequiredInstance, ListenServiceCallback)>),
    ProtocolError(DiscoveryError),
}

impl SdClientInner {
    fn ipc(&self) -> &IpcClientHandle {
        self.ipc.get().expect("transport handle is set at construction")
    }

    /// Send while holding the registry write lock; failures are only logged
    /// because the reconnect replay restores consistency.
    fn send_message(&self, encoded: &[u8], what: &str) {
        if let Err(e) = self.ipc().send_sync(encoded) {
            log::warn!("{what} not sent ({e}); state is replayed on reconnect");
        }
    }

    fn on_connected(&self) {
        let mut reg = self.registries.write();
        reg.state = SdState::Registered;
        log::info!("connected to broker, replaying registries");
        self.send_message(
            &InitMessage::new(self.binding_type).encode(),
            "init message",
        );
        for (instance, value) in reg.provided.local().provided_entries() {
            self.send_message(
                &OfferServiceMessage::new(instance, value.address).encode(),
                "offer replay",
            );
        }
        for instance in reg.required.required_entries() {
            self.send_message(
                &ListenServiceMessage::new(instance).encode(),
                "listen replay",
            );
        }
    }

    fn on_disconnected(&self, cause: CloseConnectionCause) {
        log::info!("broker connection lost ({cause}), clearing remote registry");
        let retractions = {
            let mut reg = self.registries.write();
            reg.state = SdState::NotRegistered;
            let retractions = Self::collect_remote_retractions(&reg);
            reg.provided.clear_remote();
            retractions
        };
        for (required, callback, endpoint) in retractions {
            callback(required, endpoint, ProvidedState::NotProvided);
        }
    }

    /// Every (subscription, callback, endpoint) triple the remote registry
    /// currently satisfies; used to announce the loss of all of them.
    fn collect_remote_retractions(
        reg: &SdRegistries,
    ) -> Vec<(RequiredInstance, ListenServiceCallback, ServiceInstanceEndpoint)> {
        let mut retractions = Vec::new();
        for (required, callback) in reg.required.required_entries_with_callbacks() {
            if let Ok(matches) = reg.provided.remote().provided_matches(&required) {
                for (instance, value) in matches {
                    retractions.push((
                        required,
                        callback.clone(),
                        ServiceInstanceEndpoint {
                            instance,
                            address: value.address,
                        },
                    ));
                }
            }
        }
        retractions
    }

    fn on_message(&self, buffer: &[u8]) {
        match Message::decode(buffer) {
            Ok(Message::OfferService(message)) => self.handle_offer(message),
            Ok(Message::StopOfferService(message)) => self.handle_stop_offer(message),
            Ok(other) => {
                log::warn!(
                    "unexpected {:?} message from broker, reconnecting",
                    other.id()
                );
                self.reconnect();
            }
            Err(e) => {
                log::warn!("corrupted message from broker ({e}), reconnecting");
                self.reconnect();
            }
        }
    }

    fn handle_offer(&self, message: OfferServiceMessage) {
        let action = {
            let mut reg = self.registries.write();
            if reg.state != SdState::Registered {
                InboundAction::Discard
            } else {
                match reg.required.check_required_matches(&message.instance) {
                    Err(DiscoveryError::NeverRequired) => {
                        log::debug!("offer for never required {} discarded", message.instance);
                        InboundAction::Discard
                    }
                    _ => match reg
                        .provided
                        .set_remote_provided(message.instance, message.address)
                    {
                        Err(DiscoveryError::ProvidedDifferentClient) => {
                            // The broker echoes our own offers back.
                            log::debug!("self echo for {} discarded", message.instance);
                            InboundAction::Discard
                        }
                        Err(DiscoveryError::AlreadyProvided) => {
                            log::debug!("duplicate offer for {} discarded", message.instance);
                            InboundAction::Discard
                        }
                        Err(e) => InboundAction::ProtocolError(e),
                        Ok(()) => InboundAction::Deliver(Self::callbacks_for(&reg, &message)),
                    },
                }
            }
        };
        self.apply_inbound_action(action, message.instance, message.address, ProvidedState::Provided);
    }

    fn handle_stop_offer(&self, message: StopOfferServiceMessage) {
        let action = {
            let mut reg = self.registries.write();
            if reg.state != SdState::Registered {
                InboundAction::Discard
            } else if matches!(
                reg.required.check_required_matches(&message.instance),
                Err(DiscoveryError::NeverRequired)
            ) {
                log::debug!(
                    "stop offer for never required {} discarded",
                    message.instance
                );
                InboundAction::Discard
            } else if reg.provided.local().contains(&message.instance) {
                log::debug!("self echo stop offer for {} discarded", message.instance);
                InboundAction::Discard
            } else {
                match reg.provided.remote().find(&message.instance) {
                    None => {
                        log::debug!(
                            "stop offer for unknown {} discarded",
                            message.instance
                        );
                        InboundAction::Discard
                    }
                    Some(entry) if entry.state == ProvidedState::NotProvided => {
                        log::debug!(
                            "duplicate stop offer for {} discarded",
                            message.instance
                        );
                        InboundAction::Discard
                    }
                    Some(entry) if entry.address != message.address => {
                        InboundAction::ProtocolError(DiscoveryError::ProvidedDifferentEndpoint)
                    }
                    Some(_) => {
                        match reg
                            .provided
                            .set_remote_not_provided(message.instance, message.address)
                        {
                            Ok(()) => InboundAction::Deliver(Self::callbacks_for_stop(
                                &reg,
                                &message,
                            )),
                            Err(e) => InboundAction::ProtocolError(e),
                        }
                    }
                }
            }
        };
        self.apply_inbound_action(
            action,
            message.instance,
            message.address,
            ProvidedState::NotProvided,
        );
    }

    fn callbacks_for(
        reg: &SdRegistries,
        message: &OfferServiceMessage,
    ) -> Vec<(RequiredInstance, ListenServiceCallback)> {
        Self::matching_callbacks(reg, &message.instance)
    }

    fn callbacks_for_stop(
        reg: &SdRegistries,
        message: &StopOfferServiceMessage,
    ) -> Vec<(RequiredInstance, ListenServiceCallback)> {
        Self::matching_callbacks(reg, &message.instance)
    }

    fn matching_callbacks(
        reg: &SdRegistries,
        instance: &ProvidedInstance,
    ) -> Vec<(RequiredInstance, ListenServiceCallback)> {
        match reg.required.required_matches(instance) {
            Ok(matches) => matches
                .into_iter()
                .filter_map(|(required, callback)| callback.map(|cb| (required, cb)))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn apply_inbound_action(
        &self,
        action: InboundAction,
        instance: ProvidedInstance,
        address: UnicastAddress,
        state: ProvidedState,
    ) {
        match action {
            InboundAction::Discard => {}
            InboundAction::Deliver(callbacks) => {
                let endpoint = ServiceInstanceEndpoint { instance, address };
                for (required, callback) in callbacks {
                    callback(required, endpoint, state);
                }
            }
            InboundAction::ProtocolError(e) => {
                log::warn!("protocol violation in broker update ({e}), reconnecting");
                self.reconnect();
            }
        }
    }

    /// Drop the broker connection after a protocol violation; the transport
    /// retry loop re-establishes and the replay restores the broker's view.
    fn reconnect(&self) {
        let retractions = {
            let mut reg = self.registries.write();
            reg.state = SdState::NotRegistered;
            let retractions = Self::collect_remote_retractions(&reg);
            reg.provided.clear_remote();
            retractions
        };
        for (required, callback, endpoint) in retractions {
            callback(required, endpoint, ProvidedState::NotProvided);
        }
        let ipc = self.ipc();
        ipc.close();
        ipc.connect();
    }
}

/// Participant-side discovery client.
pub struct SdClient {
    inner: std::sync::Arc<SdClientInner>,
    ipc: IpcClient,
}

impl SdClient {
    /// Create the client and its transport. Call [`SdClient::connect`] to
    /// start talking to the broker.
    pub fn new(config: &ClientConfig) -> io::Result<Self> {
        let inner = std::sync::Arc::new(SdClientInner {
            binding_type: config.binding_type,
            registries: RwLock::new(SdRegistries {
                provided: ProvidedServiceRegistries::default(),
                required: ClientRequiredRegistry::default(),
                state: SdState::NotRegistered,
            }),
            ipc: OnceLock::new(),
        });

        let connected = inner.clone();
        let disconnected = inner.clone();
        let received = inner.clone();
        let ipc = IpcClient::new(
            config.broker_socket_path(),
            config.connect_retry_time,
            Box::new(move || connected.on_connected()),
            Box::new(move |cause| disconnected.on_disconnected(cause)),
            Box::new(move |buffer| received.on_message(buffer)),
        )?;
        inner
            .ipc
            .set(ipc.handle())
            .unwrap_or_else(|_| unreachable!("transport handle set once"));

        Ok(Self { inner, ipc })
    }

    /// Start connection establishment towards the broker.
    pub fn connect(&self) {
        self.ipc.connect();
    }

    /// Drop the broker connection and forget all remote state. No callbacks
    /// are fired.
    pub fn close(&self) {
        {
            let mut reg = self.inner.registries.write();
            reg.state = SdState::NotRegistered;
            reg.provided.clear_remote();
        }
        self.ipc.close();
    }

    /// Offer a service instance at the given endpoint.
    pub fn offer_service(
        &self,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        let mut reg = self.inner.registries.write();
        reg.provided.set_local_provided(instance, address)?;
        if reg.state == SdState::Registered {
            self.inner.send_message(
                &OfferServiceMessage::new(instance, address).encode(),
                "offer message",
            );
        }
        Ok(())
    }

    /// Retract a previously offered service instance.
    pub fn stop_offer_service(
        &self,
        instance: ProvidedInstance,
        address: UnicastAddress,
    ) -> Result<(), DiscoveryError> {
        let mut reg = self.inner.registries.write();
        reg.provided.set_local_not_provided(instance, address)?;
        if reg.state == SdState::Registered {
            self.inner.send_message(
                &StopOfferServiceMessage::new(instance, address).encode(),
                "stop offer message",
            );
        }
        Ok(())
    }

    /// Subscribe to service instances matching the identifier. With a
    /// callback, already-known matching offers are announced immediately.
    pub fn listen_service(
        &self,
        instance: RequiredInstance,
        callback: Option<ListenServiceCallback>,
    ) -> Result<(), DiscoveryError> {
        let known = {
            let mut reg = self.inner.registries.write();
            reg.required.set_required(instance, callback.clone())?;
            let mut known = Vec::new();
            if reg.state == SdState::Registered {
                self.inner.send_message(
                    &ListenServiceMessage::new(instance).encode(),
                    "listen message",
                );
                if callback.is_some() {
                    for source in [reg.provided.local(), reg.provided.remote()] {
                        if let Ok(matches) = source.provided_matches(&instance) {
                            known.extend(matches.into_iter().map(|(instance, value)| {
                                ServiceInstanceEndpoint {
                                    instance,
                                    address: value.address,
                                }
                            }));
                        }
                    }
                }
            }
            known
        };
        if let Some(callback) = callback {
            for endpoint in known {
                callback(instance, endpoint, ProvidedState::Provided);
            }
        }
        Ok(())
    }

    /// Withdraw a subscription. The registry entry is retained so later
    /// protocol errors stay diagnosable.
    pub fn stop_listen_service(&self, instance: RequiredInstance) -> Result<(), DiscoveryError> {
        let mut reg = self.inner.registries.write();
        reg.required.set_not_required(instance)?;
        if reg.state == SdState::Registered {
            self.inner.send_message(
                &StopListenServiceMessage::new(instance).encode(),
                "stop listen message",
            );
        }
        Ok(())
    }

    /// Currently provided endpoints matching a subscribed identifier.
    pub fn poll_required(
        &self,
        instance: RequiredInstance,
    ) -> Result<Vec<ServiceInstanceEndpoint>, DiscoveryError> {
        let reg = self.inner.registries.read();
        reg.required.is_required(&instance)?;
        let mut endpoints = Vec::new();
        for source in [reg.provided.local(), reg.provided.remote()] {
            if let Ok(matches) = source.provided_matches(&instance) {
                endpoints.extend(matches.into_iter().map(|(instance, value)| {
                    ServiceInstanceEndpoint {
                        instance,
                        address: value.address,
                    }
                }));
            }
        }
        Ok(endpoints)
    }

    /// Exact-lookup poll for one concrete instance.
    pub fn poll_provided(
        &self,
        instance: ProvidedInstance,
    ) -> Result<Option<UnicastAddress>, DiscoveryError> {
        let reg = self.inner.registries.read();
        reg.required.check_required_matches(&instance)?;
        let entry = reg
            .provided
            .local()
            .find(&instance)
            .or_else(|| reg.provided.remote().find(&instance));
        Ok(entry.and_then(|value| {
            (value.state == ProvidedState::Provided).then_some(value.address)
        }))
    }

    /// True while a user callback is on the reactor stack.
    pub fn is_in_use(&self) -> bool {
        self.ipc.is_in_use()
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Broker-side discovery protocol engine.
//!
//! The broker has no user-facing API; its entire job is to react to
//! transport callbacks. Every connection must introduce itself with `Init`
//! before anything else. Each accepted update is validated against the
//! central registries of the client's binding plane and then fanned out:
//! offers and stop-offers go to every matching subscriber, and a fresh
//! subscription receives a synthesized offer for every matching instance
//! already provided.
//!
//! Protocol violations are not answered on the wire; the offending
//! connection is dropped, which surviving peers cannot tell apart from a
//! normal close.
//!
//! The transport serialises all callbacks through its reactor, so the state
//! mutex below is uncontended; it exists to satisfy the compiler, not to
//! order threads.

pub mod registries;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::PROTOCOL_VERSION;
use crate::error::DiscoveryError;
use crate::protocol::{Message, OfferServiceMessage, StopOfferServiceMessage};
use crate::transport::{
    BindingType, CloseConnectionCause, ConnectionHandle, IpcServer, IpcServerHandle,
};

use registries::{ClientRegistry, ServerProvidedRegistry, ServerRequiredRegistry};

struct SdServerCore {
    clients: ClientRegistry,
    provided: HashMap<BindingType, ServerProvidedRegistry>,
    required: HashMap<BindingType, ServerRequiredRegistry>,
}

impl SdServerCore {
    fn new() -> Self {
        let mut provided = HashMap::new();
        provided.insert(BindingType::Ipc, ServerProvidedRegistry::default());
        provided.insert(BindingType::ZeroCopy, ServerProvidedRegistry::default());
        let mut required = HashMap::new();
        required.insert(BindingType::Ipc, ServerRequiredRegistry::default());
        required.insert(BindingType::ZeroCopy, ServerRequiredRegistry::default());
        Self {
            clients: ClientRegistry::default(),
            provided,
            required,
        }
    }

    fn provided_mut(&mut self, binding: BindingType) -> &mut ServerProvidedRegistry {
        self.provided
            .get_mut(&binding)
            .expect("registries exist for every binding plane")
    }

    fn required_mut(&mut self, binding: BindingType) -> &mut ServerRequiredRegistry {
        self.required
            .get_mut(&binding)
            .expect("registries exist for every binding plane")
    }

    fn required_ref(&self, binding: BindingType) -> &ServerRequiredRegistry {
        self.required
            .get(&binding)
            .expect("registries exist for every binding plane")
    }
}

struct SdServerInner {
    core: Mutex<SdServerCore>,
    ipc: OnceLock<IpcServerHandle>,
}

impl SdServerInner {
    fn ipc(&self) -> &IpcServerHandle {
        self.ipc.get().expect("transport handle is set at construction")
    }

    fn on_connected(&self, handle: ConnectionHandle) {
        log::debug!("client {handle} connected, awaiting init");
    }

    fn on_message(&self, handle: ConnectionHandle, buffer: &[u8]) {
        let mut core = self.core.lock();
        if !core.clients.is_registered(handle) {
            self.handle_init(&mut core, handle, buffer);
            return;
        }
        match Message::decode(buffer) {
            Ok(Message::Init(_)) => {
                self.drop_client(handle, DiscoveryError::ClientAlreadyRegistered);
            }
            Ok(Message::OfferService(message)) => self.handle_offer(&mut core, handle, message),
            Ok(Message::StopOfferService(message)) => {
                self.handle_stop_offer(&mut core, handle, message)
            }
            Ok(Message::ListenService(message)) => {
                self.handle_listen(&mut core, handle, message.instance)
            }
            Ok(Message::StopListenService(message)) => {
                self.handle_stop_listen(&mut core, handle, message.instance)
            }
            Err(e) => self.drop_client(handle, e),
        }
    }

    /// Only `Init` is accepted from an unregistered connection.
    fn handle_init(&self, core: &mut SdServerCore, handle: ConnectionHandle, buffer: &[u8]) {
        match Message::decode(buffer) {
            Ok(Message::Init(init)) => {
                if init.protocol_version != PROTOCOL_VERSION {
                    log::warn!(
                        "client {handle} speaks protocol version {} (expected {PROTOCOL_VERSION})",
                        init.protocol_version
                    );
                    self.drop_client(handle, DiscoveryError::ProtocolError);
                    return;
                }
                core.clients.register(handle, init.binding_type);
                log::info!(
                    "client {handle} registered on binding plane {}",
                    init.binding_type
                );
            }
            Ok(message) => {
                log::warn!(
                    "client {handle} sent {:?} before init",
                    message.id()
                );
                self.drop_client(handle, DiscoveryError::ClientNotRegistered);
            }
            Err(e) => self.drop_client(handle, e),
        }
    }

    fn handle_offer(
        &self,
        core: &mut SdServerCore,
        handle: ConnectionHandle,
        message: OfferServiceMessage,
    ) {
        let binding = match core.clients.get(handle) {
            Ok(entry) => entry.binding_type,
            Err(e) => {
                self.drop_client(handle, e);
                return;
            }
        };
        if let Err(e) =
            core.provided_mut(binding)
                .update_provided(handle, message.instance, message.address)
        {
            log::warn!("offer of {} by client {handle} rejected: {e}", message.instance);
            self.drop_client(handle, e);
            return;
        }
        core.clients.add_provided(handle, message.instance);
        log::debug!(
            "client {handle} offers {} at {}",
            message.instance,
            message.address
        );
        let listeners = core
            .required_ref(binding)
            .requiring_clients(&message.instance);
        self.fan_out(
            &listeners,
            &OfferServiceMessage::new(message.instance, message.address).encode(),
        );
    }

    fn handle_stop_offer(
        &self,
        core: &mut SdServerCore,
        handle: ConnectionHandle,
        message: StopOfferServiceMessage,
    ) {
        let binding = match core.clients.get(handle) {
            Ok(entry) => entry.binding_type,
            Err(e) => {
                self.drop_client(handle, e);
                return;
            }
        };
        if let Err(e) = core.provided_mut(binding).update_not_provided(
            handle,
            message.instance,
            message.address,
        ) {
            log::warn!(
                "stop offer of {} by client {handle} rejected: {e}",
                message.instance
            );
            self.drop_client(handle, e);
            return;
        }
        core.clients.remove_provided(handle, message.instance);
        log::debug!("client {handle} stopped offering {}", message.instance);
        let listeners = core
            .required_ref(binding)
            .requiring_clients(&message.instance);
        self.fan_out(
            &listeners,
            &StopOfferServiceMessage::new(message.instance, message.address).encode(),
        );
    }

    fn handle_listen(
        &self,
        core: &mut SdServerCore,
        handle: ConnectionHandle,
        instance: crate::instance::RequiredInstance,
    ) {
        let binding = match core.clients.get(handle) {
            Ok(entry) => entry.binding_type,
            Err(e) => {
                self.drop_client(handle, e);
                return;
            }
        };
        if let Err(e) = core.required_mut(binding).update_required(handle, instance) {
            log::warn!("listen on {instance} by client {handle} rejected: {e}");
            self.drop_client(handle, e);
            return;
        }
        core.clients.add_required(handle, instance);
        log::debug!("client {handle} listens on {instance}");

        // A late subscriber still learns everything already offered.
        let known = core
            .provided
            .get(&binding)
            .expect("registries exist for every binding plane")
            .provided_matches(&instance);
        for (provided, address) in known {
            self.fan_out(
                &[handle],
                &OfferServiceMessage::new(provided, address).encode(),
            );
        }
    }

    fn handle_stop_listen(
        &self,
        core: &mut SdServerCore,
        handle: ConnectionHandle,
        instance: crate::instance::RequiredInstance,
    ) {
        let binding = match core.clients.get(handle) {
            Ok(entry) => entry.binding_type,
            Err(e) => {
                self.drop_client(handle, e);
                return;
            }
        };
        if let Err(e) = core
            .required_mut(binding)
            .update_not_required(handle, instance)
        {
            log::warn!("stop listen on {instance} by client {handle} rejected: {e}");
            self.drop_client(handle, e);
            return;
        }
        core.clients.remove_required(handle, instance);
        log::debug!("client {handle} stopped listening on {instance}");
    }

    fn on_disconnected(
        &self,
        handle: ConnectionHandle,
        result: Result<CloseConnectionCause, DiscoveryError>,
    ) {
        let mut core = self.core.lock();
        let Some(entry) = core.clients.unregister(handle) else {
            log::debug!("unregistered client {handle} disconnected");
            return;
        };
        log::info!("client {handle} disconnected ({result:?})");
        let binding = entry.binding_type;

        let mut retracted = Vec::new();
        {
            let provided = core.provided_mut(binding);
            for instance in &entry.provided {
                if let Some(address) = provided.retract_on_disconnect(handle, *instance) {
                    retracted.push((*instance, address));
                }
            }
        }
        core.required_mut(binding).remove_client(handle);

        // On a broker-initiated shutdown the implicit retraction is
        // suppressed: subscribers disconnect themselves. Error-carried
        // closes are suppressed likewise.
        let announce = matches!(result, Ok(cause) if cause != CloseConnectionCause::Shutdown);
        if !announce {
            return;
        }
        for (instance, address) in retracted {
            let listeners = core.required_ref(binding).requiring_clients(&instance);
            self.fan_out(
                &listeners,
                &StopOfferServiceMessage::new(instance, address).encode(),
            );
        }
    }

    /// Send one message to each target; a failing send drops that subscriber
    /// and nobody else.
    fn fan_out(&self, targets: &[ConnectionHandle], encoded: &[u8]) {
        let ipc = self.ipc();
        for target in targets {
            if let Err(e) = ipc.send_sync(*target, encoded) {
                log::warn!("dropping subscriber {target}: send failed ({e})");
                let _ = ipc.close_connection(*target, CloseConnectionCause::Default);
            }
        }
    }

    fn drop_client(&self, handle: ConnectionHandle, error: DiscoveryError) {
        log::warn!("dropping client {handle}: {error}");
        let _ = self
            .ipc()
            .close_connection(handle, CloseConnectionCause::Default);
    }
}

/// Centralized discovery broker.
pub struct SdServer {
    inner: Arc<SdServerInner>,
    ipc: IpcServer,
}

impl SdServer {
    /// Create the broker listening endpoint. Call [`SdServer::start`] to
    /// begin accepting clients.
    pub fn new(socket_path: PathBuf) -> io::Result<Self> {
        let inner = Arc::new(SdServerInner {
            core: Mutex::new(SdServerCore::new()),
            ipc: OnceLock::new(),
        });
        let connected = inner.clone();
        let received = inner.clone();
        let disconnected = inner.clone();
        let ipc = IpcServer::new(
            socket_path,
            Box::new(move |handle| connected.on_connected(handle)),
            Box::new(move |handle, buffer| received.on_message(handle, buffer)),
            Box::new(move |handle, result| disconnected.on_disconnected(handle, result)),
        )?;
        inner
            .ipc
            .set(ipc.handle())
            .unwrap_or_else(|_| unreachable!("transport handle set once"));
        Ok(Self { inner, ipc })
    }

    /// Start accepting clients.
    pub fn start(&self) {
        self.ipc.start_accept();
        log::info!("service discovery broker started");
    }

    /// Stop accepting and close every client connection with cause
    /// `Shutdown`.
    pub fn stop(&self) {
        self.ipc.stop_accept();
        let closed = self.ipc.close_connections();
        log::info!("service discovery broker stopped ({} clients)", closed.len());
    }

    /// True while a callback is on the reactor stack.
    pub fn is_in_use(&self) -> bool {
        self.ipc.is_in_use()
    }

    #[cfg(test)]
    fn registered_clients(&self) -> usize {
        self.inner.core.lock().clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_MESSAGE_SIZE;
    use crate::instance::{ProvidedInstance, RequiredInstance};
    use crate::protocol::{InitMessage, ListenServiceMessage};
    use crate::transport::frame::FrameCodec;
    use crate::transport::UnicastAddress;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::time::{Duration, Instant};

    struct RawClient {
        stream: StdUnixStream,
        codec: FrameCodec,
    }

    impl RawClient {
        fn connect(path: &std::path::Path) -> Self {
            let stream = StdUnixStream::connect(path).expect("connect");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            Self {
                stream,
                codec: FrameCodec::new(MAX_MESSAGE_SIZE),
            }
        }

        fn send(&mut self, message: &[u8]) {
            self.stream
                .write_all(&FrameCodec::encode(message))
                .expect("send");
        }

        fn recv(&mut self) -> Option<Vec<u8>> {
            // On a blocking socket `Ok(None)` only arises from the read
            // timeout.
            match self.codec.read_frame(&mut self.stream) {
                Ok(Some(frame)) => Some(frame.to_vec()),
                Ok(None) => None,
                Err(_) => None,
            }
        }

        /// True once the broker closed this connection.
        fn closed(&mut self) -> bool {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => true,
                _ => false,
            }
        }
    }

    fn broker() -> (SdServer, tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let server = SdServer::new(path.clone()).expect("broker setup");
        server.start();
        (server, dir, path)
    }

    fn wait_registered(server: &SdServer, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.registered_clients() != count {
            assert!(Instant::now() < deadline, "registration timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_init_registers_client() {
        let (server, _dir, path) = broker();
        let mut client = RawClient::connect(&path);
        client.send(&InitMessage::new(BindingType::Ipc).encode());
        wait_registered(&server, 1);
    }

    #[test]
    fn test_wrong_protocol_version_drops_client() {
        let (server, _dir, path) = broker();
        let mut client = RawClient::connect(&path);
        let mut init = InitMessage::new(BindingType::Ipc);
        init.protocol_version = PROTOCOL_VERSION + 1;
        client.send(&init.encode());
        assert!(client.closed());
        assert_eq!(server.registered_clients(), 0);
    }

    #[test]
    fn test_message_before_init_drops_client() {
        let (_server, _dir, path) = broker();
        let mut client = RawClient::connect(&path);
        let offer = OfferServiceMessage::new(
            ProvidedInstance::new(42, 7, 1, 0),
            UnicastAddress::new(1, 100),
        );
        client.send(&offer.encode());
        assert!(client.closed());
    }

    #[test]
    fn test_duplicate_init_drops_client() {
        let (server, _dir, path) = broker();
        let mut client = RawClient::connect(&path);
        client.send(&InitMessage::new(BindingType::Ipc).encode());
        wait_registered(&server, 1);
        client.send(&InitMessage::new(BindingType::Ipc).encode());
        assert!(client.closed());
    }

    #[test]
    fn test_corrupted_message_drops_client() {
        let (server, _dir, path) = broker();
        let mut client = RawClient::connect(&path);
        client.send(&InitMessage::new(BindingType::Ipc).encode());
        wait_registered(&server, 1);
        client.send(&[0xff, 0x01, 0x02]);
        assert!(client.closed());
    }

    #[test]
    fn test_never_provided_stop_offer_drops_client() {
        let (server, _dir, path) = broker();
        let mut client = RawClient::connect(&path);
        client.send(&InitMessage::new(BindingType::Ipc).encode());
        wait_registered(&server, 1);
        let stop = StopOfferServiceMessage::new(
            ProvidedInstance::new(42, 7, 1, 0),
            UnicastAddress::new(1, 100),
        );
        client.send(&stop.encode());
        assert!(client.closed());
    }

    #[test]
    fn test_offer_reaches_listener_and_late_listener() {
        let (server, _dir, path) = broker();
        let instance = ProvidedInstance::new(42, 7, 1, 0);
        let address = UnicastAddress::new(1, 100);

        let mut publisher = RawClient::connect(&path);
        publisher.send(&InitMessage::new(BindingType::Ipc).encode());
        let mut subscriber = RawClient::connect(&path);
        subscriber.send(&InitMessage::new(BindingType::Ipc).encode());
        wait_registered(&server, 2);

        // Early listener gets the offer on publication.
        subscriber.send(
            &ListenServiceMessage::new(RequiredInstance::new(42, 7, 1, 0)).encode(),
        );
        std::thread::sleep(Duration::from_millis(50));
        publisher.send(&OfferServiceMessage::new(instance, address).encode());

        let frame = subscriber.recv().expect("offer fan-out");
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::OfferService(OfferServiceMessage::new(instance, address))
        );

        // Late listener gets a synthesized offer.
        let mut late = RawClient::connect(&path);
        late.send(&InitMessage::new(BindingType::Ipc).encode());
        late.send(&ListenServiceMessage::new(RequiredInstance::new(42, 7, 1, 0)).encode());
        let frame = late.recv().expect("synthesized offer");
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::OfferService(OfferServiceMessage::new(instance, address))
        );
    }

    #[test]
    fn test_binding_planes_are_isolated() {
        let (server, _dir, path) = broker();
        let instance = ProvidedInstance::new(42, 7, 1, 0);
        let address = UnicastAddress::new(1, 100);

        let mut publisher = RawClient::connect(&path);
        publisher.send(&InitMessage::new(BindingType::Ipc).encode());
        let mut subscriber = RawClient::connect(&path);
        subscriber.send(&InitMessage::new(BindingType::ZeroCopy).encode());
        wait_registered(&server, 2);

        subscriber.send(
            &ListenServiceMessage::new(RequiredInstance::new(42, 7, 1, 0)).encode(),
        );
        std::thread::sleep(Duration::from_millis(50));
        publisher.send(&OfferServiceMessage::new(instance, address).encode());

        // Nothing crosses the plane boundary.
        subscriber
            .stream
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        assert!(subscriber.recv().is_none());
    }

    #[test]
    fn test_publisher_disconnect_retracts_offers() {
        let (server, _dir, path) = broker();
        let instance = ProvidedInstance::new(42, 7, 1, 0);
        let address = UnicastAddress::new(1, 100);

        let mut subscriber = RawClient::connect(&path);
        subscriber.send(&InitMessage::new(BindingType::Ipc).encode());
        let mut publisher = RawClient::connect(&path);
        publisher.send(&InitMessage::new(BindingType::Ipc).encode());
        wait_registered(&server, 2);

        subscriber.send(
            &ListenServiceMessage::new(RequiredInstance::new(42, 7, 1, 0)).encode(),
        );
        std::thread::sleep(Duration::from_millis(50));
        publisher.send(&OfferServiceMessage::new(instance, address).encode());
        let _ = subscriber.recv().expect("offer");

        drop(publisher);
        let frame = subscriber.recv().expect("implicit stop offer");
        assert_eq!(
            Message::decode(&frame).unwrap(),
            Message::StopOfferService(StopOfferServiceMessage::new(instance, address))
        );
    }

    #[test]
    fn test_stop_suppressed_on_shutdown() {
        let (server, _dir, path) = broker();
        let instance = ProvidedInstance::new(42, 7, 1, 0);
        let address = UnicastAddress::new(1, 100);

        let mut subscriber = RawClient::connect(&path);
        subscriber.send(&InitMessage::new(BindingType::Ipc).encode());
        let mut publisher = RawClient::connect(&path);
        publisher.send(&InitMessage::new(BindingType::Ipc).encode());
        wait_registered(&server, 2);

        subscriber.send(
            &ListenServiceMessage::new(RequiredInstance::new(42, 7, 1, 0)).encode(),
        );
        std::thread::sleep(Duration::from_millis(50));
        publisher.send(&OfferServiceMessage::new(instance, address).encode());
        let _ = subscriber.recv().expect("offer");

        server.stop();
        // The subscriber observes its own disconnect, not a stop offer.
        let frame = subscriber.recv();
        assert!(frame.is_none(), "expected close, got {frame:?}");
    }
}

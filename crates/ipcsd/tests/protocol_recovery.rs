// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Recovery behavior against a misbehaving broker, driven by a raw
//! transport-level test double.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use ipcsd::protocol::{
    InitMessage, ListenServiceMessage, Message, OfferServiceMessage,
};
use ipcsd::transport::{BindingType, ConnectionHandle, IpcServer};
use ipcsd::{
    ClientConfig, ProvidedInstance, ProvidedState, RequiredInstance, SdClient, UnicastAddress,
    MAX_MESSAGE_SIZE,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum WireEvent {
    Connected(ConnectionHandle),
    Message(ConnectionHandle, Vec<u8>),
    Disconnected(ConnectionHandle),
}

/// A broker stand-in that records everything and sends whatever the test
/// tells it to.
fn rogue_broker(path: &Path) -> (IpcServer, mpsc::Receiver<WireEvent>) {
    let (tx, rx) = mpsc::channel();
    let tx_connected = tx.clone();
    let tx_message = tx.clone();
    let server = IpcServer::new(
        path.to_path_buf(),
        Box::new(move |handle| {
            let _ = tx_connected.send(WireEvent::Connected(handle));
        }),
        Box::new(move |handle, buffer| {
            let _ = tx_message.send(WireEvent::Message(handle, buffer.to_vec()));
        }),
        Box::new(move |handle, _result| {
            let _ = tx.send(WireEvent::Disconnected(handle));
        }),
    )
    .expect("rogue broker setup");
    server.start_accept();
    (server, rx)
}

fn recv(rx: &mpsc::Receiver<WireEvent>) -> WireEvent {
    rx.recv_timeout(EVENT_TIMEOUT).expect("wire event")
}

fn expect_connected(rx: &mpsc::Receiver<WireEvent>) -> ConnectionHandle {
    match recv(rx) {
        WireEvent::Connected(handle) => handle,
        other => panic!("expected connect, got {other:?}"),
    }
}

fn expect_message(rx: &mpsc::Receiver<WireEvent>, handle: ConnectionHandle) -> Message {
    match recv(rx) {
        WireEvent::Message(from, buffer) => {
            assert_eq!(from, handle);
            Message::decode(&buffer).expect("decodable message")
        }
        other => panic!("expected message, got {other:?}"),
    }
}

fn client(dir: &Path) -> SdClient {
    let mut config = ClientConfig::new(BindingType::Ipc);
    config.address_root = dir.to_path_buf();
    config.connect_retry_time = Duration::from_millis(100);
    let client = SdClient::new(&config).expect("client setup");
    client.connect();
    client
}

#[test]
fn test_protocol_violation_triggers_reconnect_and_replay() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("ipcsd_0_7400.sock");
    let (server, wire) = rogue_broker(&socket);

    let required = RequiredInstance::new(42, 7, 1, 0);
    let provided = ProvidedInstance::new(42, 7, 1, 0);
    let endpoint = UnicastAddress::new(1, 100);

    let (tx, listen_events) = mpsc::channel();
    let callback: ipcsd::ListenServiceCallback = Arc::new(move |_, endpoint, state| {
        let _ = tx.send((endpoint, state));
    });

    let sd = client(dir.path());
    sd.listen_service(required, Some(callback)).unwrap();

    // First connection: init plus the replayed subscription.
    let first = expect_connected(&wire);
    assert_eq!(
        expect_message(&wire, first),
        Message::Init(InitMessage::new(BindingType::Ipc))
    );
    assert_eq!(
        expect_message(&wire, first),
        Message::ListenService(ListenServiceMessage::new(required))
    );

    // A valid offer reaches the listener.
    server
        .send_sync(first, &OfferServiceMessage::new(provided, endpoint).encode())
        .unwrap();
    let (seen, state) = listen_events.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(seen.address, endpoint);
    assert_eq!(state, ProvidedState::Provided);
    assert_eq!(sd.poll_required(required).unwrap().len(), 1);

    // The broker direction may only carry offer updates; a listen message is
    // a protocol violation.
    server
        .send_sync(first, &ListenServiceMessage::new(required).encode())
        .unwrap();

    // The client drops the connection, clears its remote registry and
    // announces the loss.
    let (_, state) = listen_events.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(state, ProvidedState::NotProvided);
    assert_eq!(sd.poll_required(required), Ok(Vec::new()));

    // The retry loop re-establishes and the broker view is rebuilt from the
    // replay alone. The old connection's teardown and the new connection's
    // accept may surface in either order.
    let mut disconnected_first = false;
    let mut second = None;
    let mut replayed = Vec::new();
    while replayed.len() < 2 {
        match recv(&wire) {
            WireEvent::Disconnected(handle) => {
                assert_eq!(handle, first);
                disconnected_first = true;
            }
            WireEvent::Connected(handle) => {
                assert!(handle > first);
                second = Some(handle);
            }
            WireEvent::Message(handle, buffer) => {
                assert_eq!(Some(handle), second);
                replayed.push(Message::decode(&buffer).expect("decodable replay"));
            }
        }
    }
    assert!(disconnected_first);
    assert_eq!(
        replayed,
        vec![
            Message::Init(InitMessage::new(BindingType::Ipc)),
            Message::ListenService(ListenServiceMessage::new(required)),
        ]
    );
}

#[test]
fn test_corrupted_broker_bytes_trigger_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("ipcsd_0_7400.sock");
    let (server, wire) = rogue_broker(&socket);

    let sd = client(dir.path());
    sd.listen_service(RequiredInstance::new(42, 7, 1, 0), None)
        .unwrap();

    let first = expect_connected(&wire);
    let _init = expect_message(&wire, first);
    let _listen = expect_message(&wire, first);

    // Garbage with an out-of-bounds message id.
    server.send_sync(first, &[0xee; 17]).unwrap();

    let mut disconnected_first = false;
    let mut second = None;
    while second.is_none() || !disconnected_first {
        match recv(&wire) {
            WireEvent::Disconnected(handle) => {
                assert_eq!(handle, first);
                disconnected_first = true;
            }
            WireEvent::Connected(handle) => {
                assert!(handle > first);
                second = Some(handle);
            }
            WireEvent::Message(_, _) => {}
        }
    }
}

#[test]
fn test_maximum_message_size_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("ipcsd_0_7400.sock");
    let (server, wire) = rogue_broker(&socket);

    // A passive peer that just holds the connection open.
    let peer = std::os::unix::net::UnixStream::connect(&socket).unwrap();
    let handle = expect_connected(&wire);

    // Exactly the maximum goes through.
    let max_message = vec![0xab; MAX_MESSAGE_SIZE];
    server.send_sync(handle, &max_message).unwrap();

    // One byte more is rejected before touching the wire; the connection
    // stays usable.
    let oversized = vec![0xab; MAX_MESSAGE_SIZE + 1];
    assert_eq!(
        server.send_sync(handle, &oversized),
        Err(ipcsd::DiscoveryError::MessageSizeMaximum)
    );
    server.send_sync(handle, &max_message).unwrap();

    use std::io::Read;
    let mut received = vec![0u8; 2 * (4 + MAX_MESSAGE_SIZE)];
    let mut peer = peer;
    peer.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();
    peer.read_exact(&mut received).unwrap();
    assert_eq!(&received[4..4 + MAX_MESSAGE_SIZE], max_message.as_slice());
}

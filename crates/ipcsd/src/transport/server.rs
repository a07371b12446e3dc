// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Broker side of the IPC transport.
//!
//! An asynchronous acceptor plus a map from [`ConnectionHandle`] to the
//! per-connection record (stream, frame codec with a pooled receive buffer,
//! closure bookkeeping). Handles increase monotonically and are never reused.
//!
//! # Deferred cleanup
//!
//! A connection that errors from within its own receive or send path cannot
//! be destroyed synchronously; the callback that observed the error may still
//! be on the reactor stack. The server therefore keeps the live `connections`
//! map and a pending `connections_closed` queue, serviced by two software
//! events:
//!
//! - a *disconnect-dispatch* event drains `connections_closed` and issues
//!   `on_disconnected` per handle with the mutex released per call;
//! - a *cleanup* event destroys connections marked closed and returns their
//!   receive buffers to the pool.
//!
//! Each event is armed at most once between reactor turns; both are
//! idempotent.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use super::client::write_frame;
use super::frame::FrameCodec;
use super::{CloseConnectionCause, ConnectionHandle};
use crate::config::MAX_MESSAGE_SIZE;
use crate::error::DiscoveryError;

/// Invoked for every accepted connection.
pub type ConnectedCallback = Box<dyn FnMut(ConnectionHandle) + Send>;
/// Invoked once per received message; the view is valid for the call only.
pub type ReceiveMessageCallback = Box<dyn FnMut(ConnectionHandle, &[u8]) + Send>;
/// Invoked once per closed connection: a cause for a regular close, an error
/// code for an abnormal one.
pub type DisconnectedCallback =
    Box<dyn FnMut(ConnectionHandle, Result<CloseConnectionCause, DiscoveryError>) + Send>;

const WAKER_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Receive buffers retained for reuse.
const POOL_RETAINED_BUFFERS: usize = 8;

/// Small pool of receive buffers. A connection leases one buffer for the
/// lifetime of its frame codec and returns it on destruction.
#[derive(Debug)]
pub(crate) struct BufferPool {
    free: Vec<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            free: Vec::new(),
            buffer_size,
        }
    }

    pub(crate) fn acquire(&mut self) -> Vec<u8> {
        self.free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    pub(crate) fn release(&mut self, buffer: Vec<u8>) {
        if self.free.len() < POOL_RETAINED_BUFFERS {
            self.free.push(buffer);
        }
    }

    #[cfg(test)]
    fn retained(&self) -> usize {
        self.free.len()
    }
}

struct ServerConnection {
    stream: UnixStream,
    token: Token,
    codec: FrameCodec,
    /// Marked on every close path; no further callbacks for this handle
    /// except the pending disconnect notification.
    closed: bool,
}

struct ServerCore {
    listener: Option<UnixListener>,
    listener_registered: bool,
    accepting: bool,
    connections: HashMap<ConnectionHandle, ServerConnection>,
    token_to_handle: HashMap<Token, ConnectionHandle>,
    next_handle: ConnectionHandle,
    connections_closed: VecDeque<(ConnectionHandle, Result<CloseConnectionCause, DiscoveryError>)>,
    disconnect_armed: bool,
    cleanup_armed: bool,
    buffer_pool: BufferPool,
}

struct ServerShared {
    core: Mutex<ServerCore>,
    waker: Waker,
    running: AtomicBool,
    in_callback: AtomicBool,
}

impl ServerShared {
    /// Mark a connection closed and arm both software events.
    fn mark_closed(
        core: &mut ServerCore,
        waker: &Waker,
        handle: ConnectionHandle,
        result: Result<CloseConnectionCause, DiscoveryError>,
    ) {
        let Some(connection) = core.connections.get_mut(&handle) else {
            return;
        };
        if connection.closed {
            return;
        }
        connection.closed = true;
        core.connections_closed.push_back((handle, result));
        if !core.disconnect_armed || !core.cleanup_armed {
            core.disconnect_armed = true;
            core.cleanup_armed = true;
            let _ = waker.wake();
        }
    }
}

/// Cloneable handle for issuing server operations from any thread.
#[derive(Clone)]
pub struct IpcServerHandle {
    shared: Arc<ServerShared>,
}

impl IpcServerHandle {
    /// Send one message to a connection from the calling thread.
    pub fn send_sync(
        &self,
        handle: ConnectionHandle,
        message: &[u8],
    ) -> Result<(), DiscoveryError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(DiscoveryError::MessageSizeMaximum);
        }
        let mut core = self.shared.core.lock();
        let Some(connection) = core.connections.get_mut(&handle) else {
            return Err(DiscoveryError::NoSuchConnection);
        };
        if connection.closed {
            return Err(DiscoveryError::Disconnected);
        }
        let frame = FrameCodec::encode(message);
        match write_frame(&mut connection.stream, &frame) {
            Ok(()) => Ok(()),
            Err(DiscoveryError::SendBufferFull) => Err(DiscoveryError::SendBufferFull),
            Err(_) => {
                ServerShared::mark_closed(
                    &mut core,
                    &self.shared.waker,
                    handle,
                    Ok(CloseConnectionCause::AbnormalClose),
                );
                Err(DiscoveryError::Disconnected)
            }
        }
    }

    /// Mark a connection closed; the disconnect callback fires from the
    /// reactor with the given cause.
    pub fn close_connection(
        &self,
        handle: ConnectionHandle,
        cause: CloseConnectionCause,
    ) -> Result<(), DiscoveryError> {
        let mut core = self.shared.core.lock();
        match core.connections.get(&handle) {
            None => Err(DiscoveryError::NoSuchConnection),
            Some(connection) if connection.closed => Err(DiscoveryError::Disconnected),
            Some(_) => {
                ServerShared::mark_closed(&mut core, &self.shared.waker, handle, Ok(cause));
                Ok(())
            }
        }
    }

    /// Close every live connection with cause `Shutdown`; returns the handles
    /// that transitioned.
    pub fn close_connections(&self) -> Vec<ConnectionHandle> {
        let mut core = self.shared.core.lock();
        let live: Vec<ConnectionHandle> = core
            .connections
            .iter()
            .filter(|(_, connection)| !connection.closed)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &live {
            ServerShared::mark_closed(
                &mut core,
                &self.shared.waker,
                *handle,
                Ok(CloseConnectionCause::Shutdown),
            );
        }
        live
    }
}

/// Broker transport endpoint. Owns the reactor thread; dropping joins it.
pub struct IpcServer {
    shared: Arc<ServerShared>,
    socket_path: PathBuf,
    thread: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Create the server and spawn its reactor thread. The acceptor is not
    /// armed until [`IpcServer::start_accept`].
    pub fn new(
        socket_path: PathBuf,
        on_connected: ConnectedCallback,
        on_message: ReceiveMessageCallback,
        on_disconnected: DisconnectedCallback,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(ServerShared {
            core: Mutex::new(ServerCore {
                listener: None,
                listener_registered: false,
                accepting: false,
                connections: HashMap::new(),
                token_to_handle: HashMap::new(),
                next_handle: 0,
                connections_closed: VecDeque::new(),
                disconnect_armed: false,
                cleanup_armed: false,
                buffer_pool: BufferPool::new(MAX_MESSAGE_SIZE),
            }),
            waker,
            running: AtomicBool::new(true),
            in_callback: AtomicBool::new(false),
        });

        let reactor = ServerReactor {
            poll,
            shared: shared.clone(),
            on_connected,
            on_message,
            on_disconnected,
        };
        let thread = thread::Builder::new()
            .name("ipcsd-server-io".to_string())
            .spawn(move || reactor.run())?;

        Ok(Self {
            shared,
            socket_path,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> IpcServerHandle {
        IpcServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Bind the listening socket and start accepting connections.
    ///
    /// # Panics
    ///
    /// Panics if the acceptor cannot be armed; a broker that cannot listen
    /// has no way to operate.
    pub fn start_accept(&self) {
        let mut core = self.shared.core.lock();
        if core.accepting {
            return;
        }
        if core.listener.is_none() {
            // A stale socket file from a previous run blocks the bind.
            let _ = fs::remove_file(&self.socket_path);
            let listener = UnixListener::bind(&self.socket_path).unwrap_or_else(|e| {
                panic!("cannot arm acceptor at {:?}: {e}", self.socket_path);
            });
            core.listener = Some(listener);
        }
        core.accepting = true;
        drop(core);
        let _ = self.shared.waker.wake();
    }

    /// Stop accepting new connections. Existing connections are unaffected.
    pub fn stop_accept(&self) {
        let mut core = self.shared.core.lock();
        core.accepting = false;
        drop(core);
        let _ = self.shared.waker.wake();
    }

    pub fn send_sync(
        &self,
        handle: ConnectionHandle,
        message: &[u8],
    ) -> Result<(), DiscoveryError> {
        self.handle().send_sync(handle, message)
    }

    pub fn close_connection(
        &self,
        handle: ConnectionHandle,
        cause: CloseConnectionCause,
    ) -> Result<(), DiscoveryError> {
        self.handle().close_connection(handle, cause)
    }

    pub fn close_connections(&self) -> Vec<ConnectionHandle> {
        self.handle().close_connections()
    }

    /// True while a user callback is on the reactor stack.
    pub fn is_in_use(&self) -> bool {
        self.shared.in_callback.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.shared.core.lock().connections.len()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        let _ = self.shared.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

struct ServerReactor {
    poll: Poll,
    shared: Arc<ServerShared>,
    on_connected: ConnectedCallback,
    on_message: ReceiveMessageCallback,
    on_disconnected: DisconnectedCallback,
}

impl ServerReactor {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        while self.shared.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::warn!("ipc server poll error: {e}");
                }
                continue;
            }

            self.sync_listener();

            let mut accept_ready = false;
            let mut readable = Vec::new();
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => accept_ready = true,
                    token => {
                        if event.is_readable() {
                            readable.push(token);
                        }
                    }
                }
            }

            if accept_ready {
                self.handle_accept();
            }
            for token in readable {
                self.handle_connection_readable(token);
            }

            self.dispatch_disconnects();
            self.run_cleanup();
        }
    }

    /// Register or deregister the acceptor according to the accepting flag.
    fn sync_listener(&mut self) {
        let mut core = self.shared.core.lock();
        if core.accepting && !core.listener_registered {
            if let Some(listener) = core.listener.as_mut() {
                self.poll
                    .registry()
                    .register(listener, LISTENER_TOKEN, Interest::READABLE)
                    .unwrap_or_else(|e| panic!("cannot arm acceptor: {e}"));
                core.listener_registered = true;
            }
        } else if !core.accepting && core.listener_registered {
            if let Some(mut listener) = core.listener.take() {
                let _ = self.poll.registry().deregister(&mut listener);
            }
            core.listener_registered = false;
        }
    }

    fn handle_accept(&mut self) {
        loop {
            let accepted = {
                let mut core = self.shared.core.lock();
                if !core.accepting {
                    break;
                }
                let Some(listener) = core.listener.as_ref() else {
                    break;
                };
                match listener.accept() {
                    Ok((mut stream, _addr)) => {
                        let handle = core.next_handle;
                        let token = Token(CONNECTION_TOKEN_START + handle as usize);
                        match self
                            .poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                        {
                            Ok(()) => {
                                core.next_handle += 1;
                                let buffer = core.buffer_pool.acquire();
                                core.connections.insert(
                                    handle,
                                    ServerConnection {
                                        stream,
                                        token,
                                        codec: FrameCodec::with_buffer(MAX_MESSAGE_SIZE, buffer),
                                        closed: false,
                                    },
                                );
                                core.token_to_handle.insert(token, handle);
                                Some(handle)
                            }
                            Err(e) => {
                                log::warn!("ipc server failed to register connection: {e}");
                                None
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::error!("ipc server accept error: {e}");
                        break;
                    }
                }
            };
            if let Some(handle) = accepted {
                log::debug!("ipc server accepted connection {handle}");
                self.invoke(|reactor| (reactor.on_connected)(handle));
            }
        }
    }

    fn handle_connection_readable(&mut self, token: Token) {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        let handle;
        {
            let mut core = self.shared.core.lock();
            let Some(&found) = core.token_to_handle.get(&token) else {
                return;
            };
            handle = found;
            let Some(connection) = core.connections.get_mut(&handle) else {
                return;
            };
            if connection.closed {
                return;
            }
            let mut disconnect: Option<Result<CloseConnectionCause, DiscoveryError>> = None;
            loop {
                match connection.codec.read_frame(&mut connection.stream) {
                    Ok(Some(frame)) => frames.push(frame.to_vec()),
                    Ok(None) => break,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        disconnect = Some(Ok(CloseConnectionCause::Default));
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        log::debug!("ipc server framing violation on {handle}: {e}");
                        disconnect = Some(Err(DiscoveryError::MessageCorrupted));
                        break;
                    }
                    Err(e) => {
                        log::debug!("ipc server receive error on {handle}: {e}");
                        disconnect = Some(Ok(CloseConnectionCause::AbnormalClose));
                        break;
                    }
                }
            }
            if let Some(result) = disconnect {
                ServerShared::mark_closed(&mut core, &self.shared.waker, handle, result);
            }
        }

        for frame in &frames {
            self.invoke(|reactor| (reactor.on_message)(handle, frame));
        }
    }

    fn dispatch_disconnects(&mut self) {
        loop {
            let entry = {
                let mut core = self.shared.core.lock();
                match core.connections_closed.pop_front() {
                    Some(entry) => Some(entry),
                    None => {
                        core.disconnect_armed = false;
                        None
                    }
                }
            };
            let Some((handle, result)) = entry else { break };
            log::debug!("ipc server connection {handle} disconnected: {result:?}");
            self.invoke(|reactor| (reactor.on_disconnected)(handle, result));
        }
    }

    /// Destroy connections marked closed and recycle their buffers.
    fn run_cleanup(&mut self) {
        let mut core = self.shared.core.lock();
        if !core.cleanup_armed {
            return;
        }
        core.cleanup_armed = false;
        let done: Vec<ConnectionHandle> = core
            .connections
            .iter()
            .filter(|(_, connection)| connection.closed)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in done {
            if let Some(connection) = core.connections.remove(&handle) {
                let ServerConnection {
                    mut stream,
                    token,
                    codec,
                    ..
                } = connection;
                let _ = self.poll.registry().deregister(&mut stream);
                core.token_to_handle.remove(&token);
                core.buffer_pool.release(codec.into_buffer());
            }
        }
    }

    fn invoke(&mut self, f: impl FnOnce(&mut Self)) {
        self.shared.in_callback.store(true, Ordering::Release);
        f(self);
        self.shared.in_callback.store(false, Ordering::Release);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Client side of the IPC transport.
//!
//! One connection towards a known broker address with an automatic retry
//! loop:
//!
//! ```text
//!      +--------------+
//!      | Disconnected |<------------------ close()
//!      +------+-------+
//!             | connect()
//!             v
//!      +--------------+   attempt failed   +--------------+
//!      |  Connecting  |------------------->| ConnectRetry |
//!      +------+-------+                    +------+-------+
//!             | established                       | retry timer
//!             v                                   |
//!      +--------------+   connection lost         |
//!      |  Connected   |---------------------------+
//!      +--------------+
//! ```
//!
//! `connect`/`close` return immediately and schedule work on the reactor
//! thread; `send_sync` writes from the calling thread. All callbacks run on
//! the reactor thread with the client mutex released.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use super::frame::FrameCodec;
use super::CloseConnectionCause;
use crate::config::MAX_MESSAGE_SIZE;
use crate::error::DiscoveryError;

/// Invoked once per successful connection establishment.
pub type ConnectedCallback = Box<dyn FnMut() + Send>;
/// Invoked once per connection loss. Never called for an explicit `close`.
pub type DisconnectedCallback = Box<dyn FnMut(CloseConnectionCause) + Send>;
/// Invoked once per received message; the view is valid for the call only.
pub type ReceiveMessageCallback = Box<dyn FnMut(&[u8]) + Send>;

const WAKER_TOKEN: Token = Token(0);
const STREAM_TOKEN: Token = Token(1);

/// Default poll timeout of the reactor loop.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Connection state of the transport client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    ConnectRetry,
}

enum Command {
    Connect,
    Close,
    Disconnect {
        generation: u64,
        cause: CloseConnectionCause,
    },
}

struct ClientCore {
    state: ClientState,
    stream: Option<UnixStream>,
    /// Bumped on every established connection and on every explicit close;
    /// used to suppress callbacks that raced with `close`.
    generation: u64,
    commands: VecDeque<Command>,
}

struct ClientShared {
    core: Mutex<ClientCore>,
    waker: Waker,
    running: AtomicBool,
    in_callback: AtomicBool,
}

impl ClientShared {
    fn connect(&self) {
        let mut core = self.core.lock();
        if core.state != ClientState::Disconnected {
            return;
        }
        core.state = ClientState::Connecting;
        core.commands.push_back(Command::Connect);
        drop(core);
        let _ = self.waker.wake();
    }

    fn close(&self) {
        let mut core = self.core.lock();
        if core.state == ClientState::Disconnected {
            return;
        }
        core.state = ClientState::Disconnected;
        core.generation += 1;
        core.commands.push_back(Command::Close);
        drop(core);
        let _ = self.waker.wake();
    }

    fn send_sync(&self, message: &[u8]) -> Result<(), DiscoveryError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(DiscoveryError::MessageSizeMaximum);
        }
        let mut core = self.core.lock();
        if core.state != ClientState::Connected {
            return Err(DiscoveryError::Disconnected);
        }
        let generation = core.generation;
        let frame = FrameCodec::encode(message);
        let stream = core
            .stream
            .as_mut()
            .expect("connected state implies a stream");
        match write_frame(stream, &frame) {
            Ok(()) => Ok(()),
            Err(DiscoveryError::SendBufferFull) => Err(DiscoveryError::SendBufferFull),
            Err(_) => {
                // Tear-down and user notification happen on the reactor, with
                // the mutex released.
                core.commands.push_back(Command::Disconnect {
                    generation,
                    cause: CloseConnectionCause::AbnormalClose,
                });
                drop(core);
                let _ = self.waker.wake();
                Err(DiscoveryError::Disconnected)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.core.lock().state == ClientState::Connected
    }

    #[cfg(test)]
    fn state(&self) -> ClientState {
        self.core.lock().state
    }
}

/// Write one complete frame to a non-blocking stream.
///
/// A `WouldBlock` before the first byte reports `SendBufferFull` and leaves
/// the wire untouched. Once the kernel accepted part of the frame the
/// remainder is written out even if that means briefly waiting, so frame
/// boundaries are never torn by backpressure.
pub(crate) fn write_frame<W: io::Write>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), DiscoveryError> {
    let mut written = 0usize;
    while written < frame.len() {
        match writer.write(&frame[written..]) {
            Ok(0) => return Err(DiscoveryError::Disconnected),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if written == 0 {
                    return Err(DiscoveryError::SendBufferFull);
                }
                thread::sleep(Duration::from_micros(100));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return Err(DiscoveryError::Disconnected),
        }
    }
    Ok(())
}

/// Cloneable handle for issuing transport operations from any thread.
#[derive(Clone)]
pub struct IpcClientHandle {
    shared: Arc<ClientShared>,
}

impl IpcClientHandle {
    /// Kick off connection establishment. No-op unless `Disconnected`.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Drop the connection and cancel any retry. No disconnect callback is
    /// fired for an explicit close.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Send one message from the calling thread.
    pub fn send_sync(&self, message: &[u8]) -> Result<(), DiscoveryError> {
        self.shared.send_sync(message)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }
}

/// Client transport endpoint. Owns the reactor thread; dropping joins it.
pub struct IpcClient {
    shared: Arc<ClientShared>,
    thread: Option<JoinHandle<()>>,
}

impl IpcClient {
    /// Create the client and spawn its reactor thread.
    pub fn new(
        socket_path: PathBuf,
        connect_retry_time: Duration,
        on_connected: ConnectedCallback,
        on_disconnected: DisconnectedCallback,
        on_message: ReceiveMessageCallback,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(ClientShared {
            core: Mutex::new(ClientCore {
                state: ClientState::Disconnected,
                stream: None,
                generation: 0,
                commands: VecDeque::new(),
            }),
            waker,
            running: AtomicBool::new(true),
            in_callback: AtomicBool::new(false),
        });

        let reactor = ClientReactor {
            poll,
            shared: shared.clone(),
            socket_path,
            connect_retry_time,
            retry_deadline: None,
            codec: FrameCodec::new(MAX_MESSAGE_SIZE),
            on_connected,
            on_disconnected,
            on_message,
        };
        let thread = thread::Builder::new()
            .name("ipcsd-client-io".to_string())
            .spawn(move || reactor.run())?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> IpcClientHandle {
        IpcClientHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn connect(&self) {
        self.shared.connect();
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn send_sync(&self, message: &[u8]) -> Result<(), DiscoveryError> {
        self.shared.send_sync(message)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// True while a user callback is on the reactor stack.
    pub fn is_in_use(&self) -> bool {
        self.shared.in_callback.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn state(&self) -> ClientState {
        self.shared.state()
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        let _ = self.shared.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct ClientReactor {
    poll: Poll,
    shared: Arc<ClientShared>,
    socket_path: PathBuf,
    connect_retry_time: Duration,
    retry_deadline: Option<Instant>,
    codec: FrameCodec,
    on_connected: ConnectedCallback,
    on_disconnected: DisconnectedCallback,
    on_message: ReceiveMessageCallback,
}

impl ClientReactor {
    fn run(mut self) {
        let mut events = Events::with_capacity(16);
        while self.shared.running.load(Ordering::Relaxed) {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::warn!("ipc client poll error: {e}");
                }
                continue;
            }

            for event in events.iter() {
                if event.token() == STREAM_TOKEN {
                    if event.is_writable() {
                        self.handle_writable();
                    }
                    if event.is_readable() {
                        self.handle_readable();
                    }
                }
            }

            self.handle_commands();
            self.handle_retry_deadline();
        }
    }

    fn poll_timeout(&self) -> Duration {
        match self.retry_deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_TIMEOUT),
            None => POLL_TIMEOUT,
        }
    }

    fn handle_commands(&mut self) {
        loop {
            let command = self.shared.core.lock().commands.pop_front();
            let Some(command) = command else { break };
            match command {
                Command::Connect => self.attempt_connect(),
                Command::Close => self.handle_close(),
                Command::Disconnect { generation, cause } => {
                    self.handle_send_failure(generation, cause)
                }
            }
        }
    }

    fn arm_retry(&mut self) {
        self.retry_deadline = Some(Instant::now() + self.connect_retry_time);
    }

    fn attempt_connect(&mut self) {
        let mut core = self.shared.core.lock();
        if core.state != ClientState::Connecting {
            return;
        }
        match UnixStream::connect(&self.socket_path) {
            Ok(mut stream) => {
                match self
                    .poll
                    .registry()
                    .register(&mut stream, STREAM_TOKEN, Interest::WRITABLE)
                {
                    Ok(()) => {
                        core.stream = Some(stream);
                    }
                    Err(e) => {
                        log::warn!("ipc client failed to register stream: {e}");
                        core.state = ClientState::ConnectRetry;
                        drop(core);
                        self.arm_retry();
                    }
                }
            }
            Err(e) => {
                log::debug!(
                    "ipc client connect attempt to {:?} failed: {e}",
                    self.socket_path
                );
                core.state = ClientState::ConnectRetry;
                drop(core);
                self.arm_retry();
            }
        }
    }

    /// Writable readiness signals the completion of an in-flight connect.
    fn handle_writable(&mut self) {
        let established = {
            let mut core = self.shared.core.lock();
            if core.state != ClientState::Connecting || core.stream.is_none() {
                return;
            }
            let stream = core
                .stream
                .as_mut()
                .expect("checked above that a stream exists");
            let connect_error = match stream.take_error() {
                Ok(None) => None,
                Ok(Some(e)) => Some(e),
                Err(e) => Some(e),
            };
            match connect_error {
                None => {
                    match self
                        .poll
                        .registry()
                        .reregister(stream, STREAM_TOKEN, Interest::READABLE)
                    {
                        Ok(()) => {
                            core.state = ClientState::Connected;
                            core.generation += 1;
                            self.codec.reset();
                            true
                        }
                        Err(e) => {
                            log::warn!("ipc client failed to arm receive: {e}");
                            Self::drop_stream(&self.poll, &mut core);
                            core.state = ClientState::ConnectRetry;
                            false
                        }
                    }
                }
                Some(e) => {
                    log::debug!("ipc client connect failed: {e}");
                    Self::drop_stream(&self.poll, &mut core);
                    core.state = ClientState::ConnectRetry;
                    false
                }
            }
        };

        if established {
            log::debug!("ipc client connected to {:?}", self.socket_path);
            self.invoke_connected();
        } else {
            self.arm_retry();
        }
    }

    fn handle_readable(&mut self) {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        let mut disconnect: Option<CloseConnectionCause> = None;
        let generation;
        {
            let mut core = self.shared.core.lock();
            if core.state != ClientState::Connected {
                return;
            }
            generation = core.generation;
            let stream = core
                .stream
                .as_mut()
                .expect("connected state implies a stream");
            loop {
                match self.codec.read_frame(stream) {
                    Ok(Some(frame)) => frames.push(frame.to_vec()),
                    Ok(None) => break,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        disconnect = Some(CloseConnectionCause::Default);
                        break;
                    }
                    Err(e) => {
                        log::debug!("ipc client receive error: {e}");
                        disconnect = Some(CloseConnectionCause::AbnormalClose);
                        break;
                    }
                }
            }
            if disconnect.is_some() {
                Self::drop_stream(&self.poll, &mut core);
                core.state = ClientState::ConnectRetry;
                self.codec.reset();
            }
        }

        if disconnect.is_some() {
            self.arm_retry();
        }

        for frame in &frames {
            // Suppress deliveries that raced with an explicit close.
            if self.shared.core.lock().generation != generation {
                return;
            }
            self.invoke_message(frame);
        }

        if let Some(cause) = disconnect {
            if self.shared.core.lock().generation == generation {
                self.invoke_disconnected(cause);
            }
        }
    }

    /// A `send_sync` on some user thread observed a dead connection.
    fn handle_send_failure(&mut self, generation: u64, cause: CloseConnectionCause) {
        let fire = {
            let mut core = self.shared.core.lock();
            if core.generation != generation || core.state != ClientState::Connected {
                false
            } else {
                Self::drop_stream(&self.poll, &mut core);
                core.state = ClientState::ConnectRetry;
                self.codec.reset();
                true
            }
        };
        if fire {
            self.arm_retry();
            self.invoke_disconnected(cause);
        }
    }

    fn handle_close(&mut self) {
        let mut core = self.shared.core.lock();
        Self::drop_stream(&self.poll, &mut core);
        self.codec.reset();
        drop(core);
        self.retry_deadline = None;
    }

    fn handle_retry_deadline(&mut self) {
        let Some(deadline) = self.retry_deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }
        self.retry_deadline = None;
        {
            let mut core = self.shared.core.lock();
            if core.state != ClientState::ConnectRetry {
                return;
            }
            core.state = ClientState::Connecting;
        }
        self.attempt_connect();
    }

    fn drop_stream(poll: &Poll, core: &mut ClientCore) {
        if let Some(mut stream) = core.stream.take() {
            let _ = poll.registry().deregister(&mut stream);
        }
    }

    fn invoke_connected(&mut self) {
        self.shared.in_callback.store(true, Ordering::Release);
        (self.on_connected)();
        self.shared.in_callback.store(false, Ordering::Release);
    }

    fn invoke_disconnected(&mut self, cause: CloseConnectionCause) {
        self.shared.in_callback.store(true, Ordering::Release);
        (self.on_disconnected)(cause);
        self.shared.in_callback.store(false, Ordering::Release);
    }

    fn invoke_message(&mut self, frame: &[u8]) {
        self.shared.in_callback.store(true, Ordering::Release);
        (self.on_message)(frame);
        self.shared.in_callback.store(false, Ordering::Release);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Length-prefix framing over the stream socket.
//!
//! Unix-domain stream sockets do not preserve message boundaries, so every
//! discovery message travels as
//!
//! ```text
//! +----------------+------------------+
//! | length (4B NE) | message payload  |
//! +----------------+------------------+
//! ```
//!
//! with the length bounded by the configured maximum message size. The codec
//! keeps partial-read state so a frame split across reads is reassembled
//! transparently.

use std::io::{self, Read};

/// Frame header size (4 bytes for the length).
pub const FRAME_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Reading the 4-byte length header.
    Header { bytes_read: usize },
    /// Reading the message body.
    Body {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::Header { bytes_read: 0 }
    }
}

/// Incremental frame reader/writer with a leased body buffer.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    header: [u8; FRAME_HEADER_SIZE],
    buffer: Vec<u8>,
    max_size: usize,
}

impl FrameCodec {
    pub fn new(max_size: usize) -> Self {
        Self::with_buffer(max_size, Vec::with_capacity(max_size))
    }

    /// Create a codec whose body buffer is supplied by the caller, e.g. from
    /// a receive-buffer pool.
    pub fn with_buffer(max_size: usize, mut buffer: Vec<u8>) -> Self {
        buffer.clear();
        buffer.reserve(max_size);
        Self {
            state: ReadState::default(),
            header: [0u8; FRAME_HEADER_SIZE],
            buffer,
            max_size,
        }
    }

    /// Hand the body buffer back, e.g. to return it to the pool.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// Reset partial-read state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.state = ReadState::default();
    }

    /// Frame a payload for one transport write.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Read at most one complete frame from `src`.
    ///
    /// Returns `Ok(Some(payload))` when a frame completed, `Ok(None)` when
    /// the source would block before a frame completed. A read of zero bytes
    /// surfaces as `UnexpectedEof`; a declared length of zero or above the
    /// maximum as `InvalidData`.
    pub fn read_frame(&mut self, src: &mut impl Read) -> io::Result<Option<&[u8]>> {
        loop {
            match self.state {
                ReadState::Header { bytes_read } => {
                    match src.read(&mut self.header[bytes_read..]) {
                        Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                        Ok(n) => {
                            let bytes_read = bytes_read + n;
                            if bytes_read < FRAME_HEADER_SIZE {
                                self.state = ReadState::Header { bytes_read };
                                continue;
                            }
                            let expected_len = u32::from_ne_bytes(self.header) as usize;
                            if expected_len == 0 || expected_len > self.max_size {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!(
                                        "frame length {} outside (0, {}]",
                                        expected_len, self.max_size
                                    ),
                                ));
                            }
                            self.buffer.clear();
                            self.buffer.resize(expected_len, 0);
                            self.state = ReadState::Body {
                                expected_len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                ReadState::Body {
                    expected_len,
                    bytes_read,
                } => match src.read(&mut self.buffer[bytes_read..expected_len]) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => {
                        let bytes_read = bytes_read + n;
                        if bytes_read < expected_len {
                            self.state = ReadState::Body {
                                expected_len,
                                bytes_read,
                            };
                            continue;
                        }
                        self.state = ReadState::default();
                        return Ok(Some(&self.buffer[..expected_len]));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }
}

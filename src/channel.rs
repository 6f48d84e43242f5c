//! Length-prefixed message framing over a byte stream.
//!
//! A record is a little-endian `u32` byte length followed by that many bytes of
//! JSON. Bulk data is written raw; its size is always announced by the record
//! preceding it.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, ErrorKind, Read, Write},
    net::TcpStream,
    path::Path,
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_BULK_SIZE: usize = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer closed the connection")]
    Closed,
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("short write: {0}")]
    ShortWrite(io::Error),
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },
}

impl ChannelError {
    /// Whether the peer went away, as opposed to sending garbage.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ChannelError::Closed | ChannelError::ShortRead { .. } | ChannelError::ShortWrite(_)
        )
    }
}

/// A byte stream that can report whether input is waiting without blocking.
pub trait Transport: Read + Write {
    fn has_pending_input(&mut self) -> io::Result<bool>;
}

impl Transport for TcpStream {
    fn has_pending_input(&mut self) -> io::Result<bool> {
        self.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let peeked = self.peek(&mut byte);
        self.set_nonblocking(false)?;
        match peeked {
            // EOF counts as readable: the next receive reports `Closed`.
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// In-memory transport: reads drain `input`, writes append to `output`.
/// Used for scripted sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pub input: VecDeque<u8>,
    pub output: Vec<u8>,
}

impl MemoryTransport {
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }
}

impl Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.input.len());
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn has_pending_input(&mut self) -> io::Result<bool> {
        Ok(!self.input.is_empty())
    }
}

pub struct MessageChannel<T> {
    stream: T,
    max_message_size: usize,
    max_bulk_size: usize,
}

impl<T: Transport> MessageChannel<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_bulk_size: DEFAULT_MAX_BULK_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Upper bound for a single bulk payload read with [`Self::receive_bytes`].
    pub fn with_max_bulk_size(mut self, limit: usize) -> Self {
        self.max_bulk_size = limit;
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    pub fn poll_readable(&mut self) -> Result<bool, ChannelError> {
        Ok(self.stream.has_pending_input()?)
    }

    pub fn send<M: Serialize>(&mut self, message: &M) -> Result<(), ChannelError> {
        let body = serde_json::to_vec(message)?;
        if body.len() > self.max_message_size {
            return Err(ChannelError::Oversized {
                size: body.len(),
                limit: self.max_message_size,
            });
        }
        let len = u32::try_from(body.len()).map_err(|_| ChannelError::Oversized {
            size: body.len(),
            limit: u32::MAX as usize,
        })?;
        self.write_all(&len.to_le_bytes())?;
        self.write_all(&body)?;
        self.stream.flush().map_err(ChannelError::ShortWrite)
    }

    pub fn receive<M: DeserializeOwned>(&mut self) -> Result<M, ChannelError> {
        let mut prefix = [0u8; 4];
        let got = self.read_fully(&mut prefix)?;
        if got == 0 {
            return Err(ChannelError::Closed);
        }
        if got < prefix.len() {
            return Err(ChannelError::ShortRead {
                expected: prefix.len(),
                got,
            });
        }
        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_message_size {
            return Err(ChannelError::Oversized {
                size: len,
                limit: self.max_message_size,
            });
        }
        let body = self.read_exact_len(len)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.write_all(bytes)?;
        self.stream.flush().map_err(ChannelError::ShortWrite)
    }

    /// Streams a file's contents as bulk data.
    pub fn send_file(&mut self, path: &Path) -> Result<u64, ChannelError> {
        let mut file = File::open(path)?;
        let copied = io::copy(&mut file, &mut self.stream).map_err(ChannelError::ShortWrite)?;
        self.stream.flush().map_err(ChannelError::ShortWrite)?;
        Ok(copied)
    }

    /// Reads a bulk payload whose size was announced by the previous record.
    /// Sizes over the bulk limit are refused before allocating.
    pub fn receive_bytes(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        if len > self.max_bulk_size {
            return Err(ChannelError::Oversized {
                size: len,
                limit: self.max_bulk_size,
            });
        }
        self.read_exact_len(len)
    }

    fn read_exact_len(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; len];
        let got = self.read_fully(&mut buf)?;
        if got < len {
            return Err(ChannelError::ShortRead { expected: len, got });
        }
        Ok(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.stream.write_all(bytes).map_err(ChannelError::ShortWrite)
    }

    /// Reads until `buf` is full or the stream ends; returns the byte count.
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => break,
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
        Ok(filled)
    }
}

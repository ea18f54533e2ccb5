//! Length-prefixed framing over TCP
//!
//! Frame: `u32` big-endian length, then the bincode payload. Shared by the
//! mailbox and monitor protocols. Readers accumulate bytes through a
//! `FrameReader` so a read timeout mid-frame loses nothing: blocked reads
//! poll in bounded slices, letting callers observe shutdown flags between
//! polls.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use may::net::TcpStream;
use serde::Serialize;
use serde::de::DeserializeOwned;

// Frames past this size indicate a corrupt or hostile peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Read-timeout slice for blocked frame reads; the cadence at which
// cancellation flags get observed.
pub const READ_SLICE: Duration = Duration::from_millis(50);

/// Write one frame. Blocks until the payload is handed to the kernel.
pub fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Serialize and frame one message.
pub fn send_message<T: Serialize>(stream: &mut TcpStream, message: &T) -> io::Result<()> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(stream, &payload)
}

/// Incremental frame parser. Feed it reads; it yields complete payloads.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader::default()
    }

    /// Take one complete frame out of the buffer, if present.
    fn take_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized frame",
            ));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let payload = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(payload))
    }

    /// One bounded poll: parse a buffered frame if complete, otherwise read
    /// once from the stream (respecting its read timeout) and re-parse.
    /// `Ok(None)` means no complete frame yet; end-of-stream is
    /// `UnexpectedEof`.
    pub fn poll_frame(&mut self, stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
        if let Some(frame) = self.take_frame()? {
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                ));
            }
            Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        self.take_frame()
    }

    /// Block until a whole frame arrives or `timeout` elapses (`Ok(None)`).
    pub fn read_frame_timeout(
        &mut self,
        stream: &mut TcpStream,
        timeout: Duration,
    ) -> io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.poll_frame(stream)? {
                return Ok(Some(frame));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Decode helper for request/response exchanges.
    pub fn read_message_timeout<T: DeserializeOwned>(
        &mut self,
        stream: &mut TcpStream,
        timeout: Duration,
    ) -> io::Result<Option<T>> {
        match self.read_frame_timeout(stream, timeout)? {
            Some(payload) => bincode::deserialize(&payload)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

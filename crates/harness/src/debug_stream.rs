//! Captures the emulated machine's serial (kernel debug) output
//!
//! The serial port is an unframed byte stream. Lines are read one byte at a
//! time so a read never consumes anything past the requested delimiter.

use socket2::{SockRef, Socket};
use std::io::{ErrorKind, Read};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};
use xboxtest_common::{Error, Result, RetryPolicy};

const DRAIN_CHUNK: usize = 4096;

/// Reader over the debug channel of one instance
#[derive(Debug)]
pub struct DebugStreamReader {
    stream: TcpStream,
    port: u16,
}

impl DebugStreamReader {
    /// Connect to the emulator's serial listener, retrying until it is up
    pub async fn connect(port: u16, policy: &RetryPolicy) -> Result<Self> {
        let stream = policy
            .retry(&format!("debug stream connect to port {}", port), || async move {
                Ok(TcpStream::connect(("127.0.0.1", port)).await?)
            })
            .await?;
        debug!("Debug stream connected on port {}", port);
        Ok(Self::from_stream(stream, port))
    }

    pub fn from_stream(stream: TcpStream, port: u16) -> Self {
        Self { stream, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block until output is available, then return at most `max_chars` characters
    pub async fn read_chars(&mut self, max_chars: usize) -> Result<String> {
        if max_chars == 0 {
            return Ok(String::new());
        }

        let mut buf = vec![0u8; max_chars];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(self.closed("while waiting for output"));
        }

        let data = decode(&buf[..n]);
        debug!(port = self.port, "{}", data);
        Ok(data)
    }

    /// Block until a whole line is available and return it, newline included
    pub async fn read_line(&mut self) -> Result<String> {
        self.read_line_until(b'\n').await
    }

    /// Block until `delimiter` is read and return everything up to and including it
    pub async fn read_line_until(&mut self, delimiter: u8) -> Result<String> {
        let mut line = String::new();
        let mut byte = [0u8; 1];
        loop {
            if self.stream.read(&mut byte).await? == 0 {
                return Err(self.closed(&format!("with partial line {:?}", line)));
            }
            line.push(char::from(byte[0]));
            if byte[0] == delimiter {
                break;
            }
        }

        debug!(port = self.port, "{}", line.trim_end());
        Ok(line)
    }

    /// Return everything that can be read right now without blocking.
    ///
    /// Reads straight from the non-blocking socket until it reports that no
    /// more data is ready, so it returns an empty string when nothing is
    /// pending or the peer has closed.
    pub fn drain_available(&mut self) -> Result<String> {
        let sock = SockRef::from(&self.stream);
        let mut socket: &Socket = &sock;
        let mut data = String::new();
        let mut buf = [0u8; DRAIN_CHUNK];

        loop {
            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => data.push_str(&decode(&buf[..n])),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if !data.is_empty() {
            info!(port = self.port, "{}", data);
        }
        Ok(data)
    }

    /// Stop listening for output
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn closed(&self, context: &str) -> Error {
        Error::ConnectionClosed(format!("debug stream on port {} {}", self.port, context))
    }
}

/// One byte per character (Latin-1)
fn decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

//! Process-wide reservation of unused TCP ports
//!
//! The OS only knows about ports that currently have a socket bound to them.
//! Ports handed to an emulator are released by us before the emulator binds
//! them, so the registry remembers every port it has handed out and skips
//! those numbers until the reservation is dropped.

use crate::{Error, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::trace;

/// Registry of ports currently reserved by this process
#[derive(Debug, Default)]
pub struct PortRegistry {
    reserved: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a port that is unused by the OS and not reserved by anyone else.
    ///
    /// Sockets for already-reserved numbers stay bound until a fresh number has
    /// been committed so the OS cannot hand the same number straight back.
    pub fn reserve(self: &Arc<Self>) -> Result<PortReservation> {
        self.reserve_with(|| {
            let socket = bind_ephemeral()?;
            let port = local_port(&socket)?;
            Ok((port, socket))
        })
    }

    /// Commit the first number from `bind` that is not already reserved,
    /// holding every socket it returned until then
    fn reserve_with<S>(
        self: &Arc<Self>,
        mut bind: impl FnMut() -> Result<(u16, S)>,
    ) -> Result<PortReservation> {
        let mut held = Vec::new();
        let mut reserved = self.reserved.lock();

        let port = loop {
            let (port, socket) = bind()?;
            held.push(socket);
            if !reserved.contains(&port) {
                reserved.insert(port);
                break port;
            }
            trace!("Port {} already reserved, binding another", port);
        };
        drop(reserved);

        // Only close once the number is in the set
        drop(held);

        Ok(PortReservation {
            port,
            registry: Arc::clone(self),
        })
    }

    /// Whether `port` is held by a live reservation
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    fn release(&self, port: u16) {
        self.reserved.lock().remove(&port);
    }
}

/// An exclusively held port number, released on drop
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    registry: Arc<PortRegistry>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Give the port back to the registry
    pub fn release(self) {}
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.registry.release(self.port);
    }
}

fn bind_ephemeral() -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn local_port(socket: &Socket) -> Result<u16> {
    socket
        .local_addr()?
        .as_socket()
        .map(|addr| addr.port())
        .ok_or_else(|| Error::Internal("bound socket has no inet address".to_string()))
}

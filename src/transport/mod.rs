//! Socket abstraction for the connection engine.
//!
//! The engine never touches the network directly. It talks to a
//! [`SocketPair`]: a main socket for the handshake, commands and heartbeats,
//! and a listener socket that only exists until the port announcement
//! exchange is finished.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Connection engine               │
//! │      (pure state machine, no I/O)        │
//! └──────────────────┬──────────────────────┘
//!                    │ SocketPair
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  UdpSocketPair  │ │MemorySocketPair │
//! │  (tokio UDP)    │ │  (recording)    │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! Inbound datagrams do not flow through the trait: the
//! [driver](crate::session::driver) polls the UDP sockets and hands each
//! datagram to the engine together with the [`Endpoint`] it arrived on.

mod memory;
mod udp;

pub use memory::{MemorySocketPair, SentDatagram};
pub use udp::UdpSocketPair;

use std::io;

use crate::config::PortConfig;

/// Which local socket a datagram uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Handshake, commands and heartbeats
    Main,
    /// Port announcement exchange
    Listener,
}

impl Endpoint {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Listener => "listener",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The two local sockets of a control session.
///
/// Sends are synchronous: UDP either accepts the datagram immediately or
/// fails, and the engine treats both outcomes on the spot.
pub trait SocketPair {
    /// Open both sockets and resolve `host` as the remote peer.
    ///
    /// Any sockets still open are closed first.
    fn open(&mut self, host: &str, ports: &PortConfig) -> io::Result<()>;

    /// Open the listener socket again if it is closed.
    fn reopen_listener(&mut self, ports: &PortConfig) -> io::Result<()>;

    /// Send `payload` from `endpoint` to the remote `port`.
    fn send_to(&mut self, endpoint: Endpoint, port: u16, payload: &[u8]) -> io::Result<()>;

    /// Close the listener socket. No-op when already closed.
    fn close_listener(&mut self);

    /// Close both sockets. No-op when already closed.
    fn close(&mut self);

    /// Whether `endpoint` is currently open.
    fn is_open(&self, endpoint: Endpoint) -> bool;
}

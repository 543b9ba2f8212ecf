//! # K-Frame Control - UDP client for K-Frame video switchers
//!
//! Establishes and supervises a control session with a K-Frame production
//! switcher and sends it macro recalls, AUX bus routes and suite selections.
//!
//! ## Features
//!
//! - **Two-phase handshake**: Phase 1 on the device's initial port, a port
//!   announcement on a separate listener socket, Phase 2 on the negotiated
//!   session port
//! - **Keepalive supervision**: periodic heartbeats with a response watchdog
//! - **Automatic reconnection**: bounded retries with a fixed backoff
//! - **Commands**: macros (with acknowledgement correlation), AUX routing,
//!   suite switching
//!
//! ## Protocol Overview
//!
//! All messages are fixed-layout UDP datagrams. Handshake packets are
//! recognised by exact byte match, the stage they arrive in, and the remote
//! port they come from.
//!
//! ### Architecture
//!
//! ```text
//!  KFrameClient ──commands──> driver task ──datagrams──> K-Frame
//!       ^                         │  ^
//!       │                         v  │
//!       └──── events ──────── Connection engine
//!                             (handshake, timers, commands)
//! ```
//!
//! ### State Machine
//!
//! ```text
//!     [Disconnected] ──connect()──> [Connecting] ──> [Handshaking] ──> [Connected]
//!           ^                             ^                │                │
//!           │ retries spent               │ backoff        └── failure ─────┤
//!           └─────────────────────── [Reconnecting] <───────────────────────┘
//! ```
//!
//! ### Message Types
//!
//! | Message          | Direction      | Purpose                              |
//! |------------------|----------------|--------------------------------------|
//! | Packets 1-6      | main, initial  | Phase 1 handshake                    |
//! | Packets 7-10     | listener       | Port announcement                    |
//! | Packets 12-17    | main, session  | Phase 2 handshake                    |
//! | Heartbeat        | Client→Device  | Keepalive every interval             |
//! | Macro / ACK      | Bidirectional  | Macro recall with correlation id     |
//! | AUX route        | Client→Device  | Route a source to an AUX bus         |
//! | Suite            | Client→Device  | Two-packet suite selection           |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use kframe::{ConnectionConfig, ConnectionState, KFrameClient};
//!
//! let (client, _task) = KFrameClient::spawn(ConnectionConfig::new("192.168.1.50"));
//! client.connect().await?;
//! client
//!     .wait_for_state(ConnectionState::Connected, Duration::from_secs(10))
//!     .await?;
//!
//! let id = client.send_macro(12).await?;
//! client.send_aux_route(3, 101).await?;
//! ```
//!
//! ### Driving the engine directly
//!
//! ```rust,ignore
//! use std::time::Instant;
//! use kframe::{Connection, ConnectionConfig, MemorySocketPair};
//!
//! let mut conn = Connection::new(ConnectionConfig::new("10.0.0.20"), MemorySocketPair::new());
//! conn.connect(Instant::now())?;
//! // feed datagrams with handle_datagram(), time with handle_timeout()
//! while let Some(event) = conn.poll_event() {
//!     println!("{event:?}");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire constants, command encoding, handshake tables
//! - [`session`]: Connection engine and tokio driver
//! - [`transport`]: UDP socket pair abstraction
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{Config, ConnectionConfig, PortConfig};
pub use error::{KFrameError, Result};
pub use protocol::{HandshakeStage, Suite};
pub use session::{
    CommandKind, CommandResult, Connection, ConnectionEvent, ConnectionState, ConnectionStats,
    KFrameClient,
};
pub use transport::{Endpoint, MemorySocketPair, SocketPair, UdpSocketPair};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Connection lifecycle: handshake driving, keepalive supervision,
//! reconnection and command dispatch.
//!
//! # State Machine
//!
//! ```text
//!                connect()
//! [Disconnected] ─────────> [Connecting] ──sockets open──> [Handshaking]
//!       ^                        ^                              │
//!       │ retries spent          │ backoff elapsed              │ packet 17
//!       │ or disconnect()        │                              v
//!       └──────────────── [Reconnecting] <──── failure ──── [Connected]
//!                                ^                              │
//!                                └────────── failure ───────────┘
//! ```
//!
//! A failure is a handshake or heartbeat timeout, a socket error or a
//! handshake/heartbeat send error. A reset packet from the device moves a
//! live session back to `Handshaking` without counting as a failure.
//!
//! The engine ([`Connection`]) is synchronous and takes the current
//! [`Instant`](std::time::Instant) as input, so it runs the same under the
//! tokio [`driver`] and under a test clock.

mod connection;
pub mod driver;
mod event;
mod timers;

use std::time::Duration;

pub use connection::{Connection, ConnectionStats};
pub use driver::KFrameClient;
pub use event::{CommandKind, CommandResult, ConnectionEvent, ConnectionState};
pub use timers::{TimerKind, Timers};

/// Interval between packet 1 resends while waiting for packet 2.
pub const PACKET_1_RETRY_INTERVAL: Duration = Duration::from_secs(1);

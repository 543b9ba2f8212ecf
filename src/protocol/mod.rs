//! K-Frame control protocol: wire format, handshake tables and command ids.
//!
//! Everything in this module is pure. No sockets, no clocks: the
//! [`session`](crate::session) engine feeds bytes in and gets decisions out.
//!
//! # Protocol Overview
//!
//! A control session runs over two local UDP sockets. The main socket carries
//! the handshake, commands and heartbeats; the listener socket only receives
//! the device's port announcement and is closed once that exchange is done.
//!
//! ## Message Flow
//!
//! ```text
//! Client (main)          Device                 Client (listener)
//!    |                      |                           |
//!    |--- P1 (1/s) -------->| initial                   |
//!    |<-- P2 ---------------|                           |
//!    |--- P3 -------------->|                           |
//!    |<-- P4 ---------------|                           |
//!    |--- P5 "client" ----->|                           |
//!    |<-- P6 ---------------|   Phase 1 done            |
//!    |                      |-- P7 (announce port) ---->|
//!    |                      |<- P8 ---------------------|
//!    |                      |-- P9 [port @ 18] -------->|
//!    |                      |<- P10 --------------------|
//!    |--- P12 ------------->| announced                 |
//!    |<-- P13 --------------| (origin = dynamic port)   |
//!    |--- P14 ------------->| dynamic                   |
//!    |<-- P15 --------------|                           |
//!    |--- P16 (seq) ------->|                           |
//!    |<-- P17 --------------|   Connected               |
//!    |                      |                           |
//!    |--- heartbeat ------->| every keepalive interval  |
//!    |<-- heartbeat resp ---|                           |
//!    |--- macro (id) ------>|                           |
//!    |<-- 00 02 03 id ------|                           |
//! ```
//!
//! ## Commands
//!
//! | Command   | Range           | Layout                                   |
//! |-----------|-----------------|------------------------------------------|
//! | Macro     | 1-999           | 0-based index at byte 24, id at byte 3   |
//! | AUX route | aux 1-96, src 1-850 | aux at 23, source at 24, random id   |
//! | Suite     | 8 suites        | two fixed packets, 100 ms apart          |

mod correlation;
mod handshake;
mod suite;
pub mod wire;

pub use correlation::{MacroCorrelator, RECENT_WINDOW};
pub use handshake::{
    classify_announce, is_reset, lookup, AnnounceInput, AnnounceStage, Effect, HandshakeStage,
    PeerPort, RemotePorts, Transition, MAIN_TRANSITIONS,
};
pub use suite::{Suite, SUITE_FOLLOW_UP_DELAY};
pub use wire::Hex;

/// Packet 16 sequence value used for the first handshake.
pub const INITIAL_SEQUENCE: u16 = 3;

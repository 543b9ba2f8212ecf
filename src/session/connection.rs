//! The connection engine.
//!
//! [`Connection`] owns the handshake state, timers and command bookkeeping for
//! one device. It performs no I/O of its own beyond handing datagrams to its
//! [`SocketPair`]; inbound datagrams, socket errors and the passage of time
//! are fed in by the caller, and notifications are drained with
//! [`poll_event`](Connection::poll_event).
//!
//! # Failure policy
//!
//! Handshake timeout, heartbeat timeout, handshake or heartbeat send errors,
//! socket errors and socket setup errors all go through one path: while the
//! retry budget lasts the engine closes its sockets, reports
//! `Reconnecting` and tries again after one keepalive interval; once it is
//! spent everything is released and the state becomes `Disconnected`.
//! Command send errors only fail that command.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use super::event::{CommandKind, CommandResult, ConnectionEvent, ConnectionState};
use super::timers::{TimerKind, Timers};
use super::PACKET_1_RETRY_INTERVAL;
use crate::config::ConnectionConfig;
use crate::error::{KFrameError, Result};
use crate::protocol::wire::{self, Hex};
use crate::protocol::{
    classify_announce, is_reset, lookup, AnnounceInput, AnnounceStage, Effect, HandshakeStage,
    MacroCorrelator, PeerPort, RemotePorts, Suite, INITIAL_SEQUENCE, SUITE_FOLLOW_UP_DELAY,
};
use crate::transport::{Endpoint, SocketPair};

/// Counters for a connection's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Connection ID
    pub connection_id: String,
    /// Current state
    pub state: ConnectionState,
    /// Retries used in the current failure streak
    pub retry_count: u32,
    /// Socket setups attempted
    pub attempts: u64,
    /// Datagrams handed to the sockets
    pub datagrams_sent: u64,
    /// Datagrams accepted for processing
    pub datagrams_received: u64,
    /// Heartbeats sent
    pub heartbeats_sent: u64,
    /// Heartbeat responses received
    pub heartbeat_responses: u64,
    /// Macro acknowledgements matched
    pub macros_acknowledged: u64,
    /// Datagrams that matched nothing
    pub unknown_datagrams: u64,
}

/// Client side of one K-Frame control session.
#[derive(Debug)]
pub struct Connection<S> {
    id: String,
    config: ConnectionConfig,
    sockets: S,
    state: ConnectionState,
    stage: HandshakeStage,
    announce: AnnounceStage,
    ports: RemotePorts,
    /// Packet 16 sequence, kept across reconnects
    sequence: u16,
    retry_count: u32,
    closing: bool,
    watchdog_started: bool,
    macros: MacroCorrelator,
    follow_up: Option<&'static [u8]>,
    timers: Timers,
    rng: StdRng,
    events: VecDeque<ConnectionEvent>,
    stats: ConnectionStats,
}

impl<S: SocketPair> Connection<S> {
    /// Create a disconnected engine.
    pub fn new(config: ConnectionConfig, sockets: S) -> Self {
        let ports = RemotePorts {
            initial: config.ports.remote_initial,
            ..RemotePorts::default()
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            sockets,
            state: ConnectionState::Disconnected,
            stage: HandshakeStage::Init,
            announce: AnnounceStage::ExpectP7,
            ports,
            sequence: INITIAL_SEQUENCE,
            retry_count: 0,
            closing: true,
            watchdog_started: false,
            macros: MacroCorrelator::new(),
            follow_up: None,
            timers: Timers::default(),
            rng: StdRng::from_entropy(),
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
        }
    }

    /// Seed the AUX message-id generator.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Connection ID used in logs
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current coarse state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current handshake stage
    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// True only when the handshake is complete
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stage == HandshakeStage::Connected
    }

    /// Active configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Suite applied after the next handshake
    pub fn suite(&self) -> Suite {
        self.config.suite
    }

    /// Socket pair
    pub fn sockets(&self) -> &S {
        &self.sockets
    }

    /// Socket pair, mutably
    pub fn sockets_mut(&mut self) -> &mut S {
        &mut self.sockets
    }

    /// Port named in the device's announcement
    pub fn announced_port(&self) -> Option<u16> {
        self.ports.get(PeerPort::Announced)
    }

    /// Session port observed during Phase 2
    pub fn dynamic_port(&self) -> Option<u16> {
        self.ports.get(PeerPort::Dynamic)
    }

    /// Retries used in the current failure streak
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Correlation id of the macro awaiting acknowledgement
    pub fn awaiting_macro_ack(&self) -> Option<u8> {
        self.macros.awaiting()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connection_id: self.id.clone(),
            state: self.state,
            retry_count: self.retry_count,
            ..self.stats.clone()
        }
    }

    /// Earliest pending timer deadline
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.next()
    }

    /// Next queued notification
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Replace the configuration.
    ///
    /// A change of host, suite or ports while a session is active or being
    /// established restarts it; other changes apply from the next use. A
    /// configuration that fails [`ConnectionConfig::validate`] is rejected
    /// and the current one stays in effect.
    pub fn update_config(&mut self, config: ConnectionConfig, now: Instant) -> Result<()> {
        if let Err(e) = config.validate() {
            tracing::warn!("Rejecting configuration: {}", e);
            return Err(e);
        }

        let restart = self.state != ConnectionState::Disconnected
            && (config.host != self.config.host
                || config.suite != self.config.suite
                || config.ports != self.config.ports);
        self.config = config;

        if restart {
            tracing::info!(connection = %self.id, "Configuration changed, reconnecting");
            self.disconnect();
            if let Err(e) = self.connect(now) {
                tracing::warn!("Reconnect after configuration change failed: {}", e);
            }
        }
        Ok(())
    }

    /// Start connecting. No-op unless disconnected.
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.config.host.trim().is_empty() {
            tracing::warn!("Cannot connect: no host configured");
            return Err(KFrameError::Config("No host configured".to_string()));
        }
        if let Err(e) = self.config.validate() {
            tracing::warn!("Cannot connect: {}", e);
            return Err(e);
        }
        if self.state != ConnectionState::Disconnected {
            tracing::debug!("Connect ignored while {}", self.state);
            return Ok(());
        }

        tracing::info!(connection = %self.id, "Connecting to K-Frame at {}", self.config.host);
        self.closing = false;
        self.retry_count = 0;
        self.set_state(ConnectionState::Connecting);
        self.attempt(now);
        Ok(())
    }

    /// Stop everything and release the sockets. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            tracing::info!(connection = %self.id, "Disconnecting from {}", self.config.host);
        }
        self.cleanup();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Recall macro `macro_number` (1-999). Returns the correlation id.
    pub fn send_macro(&mut self, macro_number: u32) -> Result<u8> {
        if !self.is_connected() {
            return self.finish(CommandKind::Macro, Err(KFrameError::NotConnected));
        }
        if !wire::MACRO_RANGE.contains(&macro_number) {
            return self.finish(
                CommandKind::Macro,
                Err(KFrameError::InvalidMacro(macro_number)),
            );
        }

        let id = self.macros.allocate();
        let payload = match wire::encode_macro(macro_number, id) {
            Ok(payload) => payload,
            Err(e) => return self.finish(CommandKind::Macro, Err(e)),
        };
        tracing::debug!("Sending macro {} with id {}: {}", macro_number, id, Hex(&payload));

        self.macros.mark_awaiting(id);
        let sent = self
            .transmit(Endpoint::Main, self.ports.dynamic, &payload)
            .map(|()| id)
            .map_err(|e| {
                tracing::error!("Macro send error: {}", e);
                KFrameError::Io(e)
            });
        if sent.is_err() {
            self.macros.clear_awaiting();
        }
        self.finish(CommandKind::Macro, sent)
    }

    /// Route `source` (1-850) to AUX bus `aux` (1-96).
    pub fn send_aux_route(&mut self, aux: u32, source: u32) -> Result<()> {
        if !self.is_connected() {
            return self.finish(CommandKind::AuxRoute, Err(KFrameError::NotConnected));
        }

        let payload = match wire::encode_aux_route(aux, source, &mut self.rng) {
            Ok(payload) => payload,
            Err(e) => return self.finish(CommandKind::AuxRoute, Err(e)),
        };
        tracing::debug!("Routing source {} to aux {}: {}", source, aux, Hex(&payload));

        let sent = self
            .transmit(Endpoint::Main, self.ports.dynamic, &payload)
            .map_err(|e| {
                tracing::error!("AUX route send error: {}", e);
                KFrameError::Io(e)
            });
        self.finish(CommandKind::AuxRoute, sent)
    }

    /// Make `suite` the default and apply it now if connected.
    ///
    /// The suite is stored either way; while not connected the result is
    /// `NotConnected` and it takes effect after the next handshake.
    pub fn set_suite(&mut self, suite: Suite, now: Instant) -> Result<()> {
        tracing::debug!("Default suite set to {}", suite);
        self.config.suite = suite;
        self.send_suite_switch(suite, now)
    }

    /// Send the two-packet selection for `suite` without changing the default.
    pub fn send_suite_switch(&mut self, suite: Suite, now: Instant) -> Result<()> {
        if !self.is_connected() {
            return self.finish(CommandKind::SuiteSwitch, Err(KFrameError::NotConnected));
        }

        let sent = self.send_suite_packets(suite, now).map_err(|e| {
            tracing::error!("Suite send error: {}", e);
            KFrameError::Io(e)
        });
        self.finish(CommandKind::SuiteSwitch, sent)
    }

    /// Feed a datagram received on `endpoint`.
    pub fn handle_datagram(
        &mut self,
        endpoint: Endpoint,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) {
        if self.closing
            || matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Reconnecting
            )
        {
            tracing::trace!("Dropping datagram from {} while {}", from, self.state);
            return;
        }
        if !self.sockets.is_open(endpoint) {
            return;
        }

        self.stats.datagrams_received += 1;
        tracing::trace!("[{}] <- {}: {}", endpoint, from, Hex(payload));

        match endpoint {
            Endpoint::Main => self.on_main_datagram(from.port(), payload, now),
            Endpoint::Listener => self.on_listener_datagram(from.port(), payload, now),
        }
    }

    /// Report a receive-side socket error.
    pub fn handle_socket_error(&mut self, endpoint: Endpoint, err: &io::Error, now: Instant) {
        if self.closing || self.state == ConnectionState::Disconnected {
            return;
        }
        tracing::error!("[{}] socket error: {}", endpoint, err);
        self.events
            .push_back(ConnectionEvent::Error(format!("{endpoint} socket error: {err}")));
        self.handle_connection_failure(now);
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        for kind in self.timers.due(now) {
            if self.timers.take_if_due(kind, now) {
                self.on_timer(kind, now);
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::Packet1Retry => {
                if self.stage == HandshakeStage::ExpectP2 && !self.closing {
                    tracing::debug!("Resending packet 1");
                    if let Err(e) =
                        self.transmit(Endpoint::Main, self.ports.initial, wire::PACKET_1)
                    {
                        tracing::warn!("Packet 1 retry send error: {}", e);
                    }
                    self.timers
                        .arm(TimerKind::Packet1Retry, now + PACKET_1_RETRY_INTERVAL);
                }
            },
            TimerKind::HandshakeTimeout => {
                tracing::error!("Handshake timeout at stage {}", self.stage);
                self.handle_connection_failure(now);
            },
            TimerKind::Heartbeat => {
                if self.is_connected() {
                    self.timers
                        .arm(TimerKind::Heartbeat, now + self.config.keepalive_interval);
                    self.send_heartbeat(now);
                }
            },
            TimerKind::HeartbeatWatchdog => {
                tracing::warn!("Heartbeat timeout, no response from device");
                self.handle_connection_failure(now);
            },
            TimerKind::Reconnect => {
                if self.state == ConnectionState::Reconnecting {
                    tracing::info!(
                        "Reconnecting to {} (attempt {}/{})",
                        self.config.host,
                        self.retry_count,
                        self.config.max_retries
                    );
                    self.set_state(ConnectionState::Connecting);
                    self.attempt(now);
                }
            },
            TimerKind::SuiteFollowUp => {
                if let Some(packet) = self.follow_up.take() {
                    if let Err(e) = self.transmit(Endpoint::Main, self.ports.dynamic, packet) {
                        tracing::error!("Suite follow-up send error: {}", e);
                    }
                }
            },
        }
    }

    /// Open the sockets and start Phase 1.
    fn attempt(&mut self, now: Instant) {
        self.reset_handshake();
        self.stats.attempts += 1;

        if let Err(e) = self.sockets.open(&self.config.host, &self.config.ports) {
            tracing::error!("Failed to initialize sockets: {}", e);
            self.events
                .push_back(ConnectionEvent::Error(format!("Socket setup failed: {e}")));
            self.handle_connection_failure(now);
            return;
        }

        self.timers
            .arm(TimerKind::HandshakeTimeout, now + self.config.handshake_timeout());
        self.start_handshake(now);
    }

    fn start_handshake(&mut self, now: Instant) {
        self.set_state(ConnectionState::Handshaking);
        self.stage = HandshakeStage::ExpectP2;
        if self.send_step(Endpoint::Main, self.ports.initial, wire::PACKET_1, "Packet 1", now) {
            self.timers
                .arm(TimerKind::Packet1Retry, now + PACKET_1_RETRY_INTERVAL);
        }
    }

    fn on_main_datagram(&mut self, origin: u16, payload: &[u8], now: Instant) {
        if is_reset(self.stage, origin, &self.ports, payload) {
            self.restart_handshake(now);
            return;
        }

        if self.stage == HandshakeStage::Connected {
            if self.ports.get(PeerPort::Dynamic) == Some(origin) {
                self.on_session_datagram(payload, now);
            } else {
                self.unknown(Endpoint::Main, origin, payload);
            }
            return;
        }

        match lookup(self.stage, origin, &self.ports, payload) {
            Some(transition) => {
                tracing::debug!("Handshake {} -> {}", self.stage, transition.next);
                self.stage = transition.next;
                self.apply(transition.effect, origin, now);
            },
            None => self.unknown(Endpoint::Main, origin, payload),
        }
    }

    fn apply(&mut self, effect: Effect, origin: u16, now: Instant) {
        match effect {
            Effect::SendPacket3 => {
                self.timers.cancel(TimerKind::Packet1Retry);
                self.send_step(Endpoint::Main, self.ports.initial, wire::PACKET_3, "Packet 3", now);
            },
            Effect::SendPacket5 => {
                self.send_step(Endpoint::Main, self.ports.initial, wire::PACKET_5, "Packet 5", now);
            },
            Effect::AwaitAnnouncement => {
                tracing::info!("Handshake phase 1 complete");
                if self.ports.get(PeerPort::Announced).is_some() {
                    self.start_phase_two(now);
                } else {
                    tracing::debug!("Waiting for port announcement");
                }
            },
            Effect::CaptureDynamicPort => {
                tracing::debug!("Device session port is {}", origin);
                self.ports.dynamic = origin;
                self.send_step(Endpoint::Main, origin, wire::PACKET_14, "Packet 14", now);
            },
            Effect::SendPacket16 => {
                let packet = wire::encode_packet_16(self.sequence);
                self.sequence = self.sequence.wrapping_add(1);
                self.send_step(Endpoint::Main, self.ports.dynamic, &packet, "Packet 16", now);
            },
            Effect::Complete => self.complete_handshake(now),
        }
    }

    fn on_listener_datagram(&mut self, origin: u16, payload: &[u8], now: Instant) {
        let announce_port = self.config.ports.remote_announce;
        if origin != announce_port {
            self.unknown(Endpoint::Listener, origin, payload);
            return;
        }

        match classify_announce(self.announce, payload) {
            Some(AnnounceInput::Opener) => {
                tracing::debug!("Port announcement opener received");
                self.announce = AnnounceStage::ExpectAnnouncement;
                self.send_step(Endpoint::Listener, announce_port, wire::PACKET_8, "Packet 8", now);
            },
            Some(AnnounceInput::Announcement(port)) => {
                tracing::info!("Device announced port {}", port);
                self.ports.announced = port;
                if !self.send_step(
                    Endpoint::Listener,
                    announce_port,
                    wire::PACKET_10,
                    "Packet 10",
                    now,
                ) {
                    return;
                }
                self.announce = AnnounceStage::Done;
                self.sockets.close_listener();
                if self.stage == HandshakeStage::WaitAnnounce {
                    self.start_phase_two(now);
                }
            },
            Some(AnnounceInput::InvalidPort) => {
                tracing::warn!("Ignoring port announcement with port 0");
            },
            None => self.unknown(Endpoint::Listener, origin, payload),
        }
    }

    fn start_phase_two(&mut self, now: Instant) {
        tracing::debug!("Starting phase 2 on port {}", self.ports.announced);
        self.stage = HandshakeStage::ExpectP13;
        self.send_step(Endpoint::Main, self.ports.announced, wire::PACKET_12, "Packet 12", now);
    }

    fn complete_handshake(&mut self, now: Instant) {
        self.timers.cancel(TimerKind::HandshakeTimeout);
        self.timers.cancel(TimerKind::Packet1Retry);
        self.retry_count = 0;
        self.watchdog_started = false;
        self.set_state(ConnectionState::Connected);
        tracing::info!(
            connection = %self.id,
            "Connected to K-Frame at {} (session port {})",
            self.config.host,
            self.ports.dynamic
        );

        if let Err(e) = self.send_suite_packets(self.config.suite, now) {
            tracing::error!("Suite send error: {}", e);
        }
        self.timers
            .arm(TimerKind::Heartbeat, now + self.config.keepalive_interval);
    }

    /// Device restarted its side: start Phase 1 over without a failure.
    fn restart_handshake(&mut self, now: Instant) {
        tracing::warn!(
            "Device restarted the handshake (packet 1 at stage {}), starting over",
            self.stage
        );
        self.timers.cancel_all();
        self.reset_handshake();
        self.macros.clear_awaiting();

        if let Err(e) = self.sockets.reopen_listener(&self.config.ports) {
            tracing::error!("Failed to reopen listener: {}", e);
            self.events
                .push_back(ConnectionEvent::Error(format!("Socket setup failed: {e}")));
            self.handle_connection_failure(now);
            return;
        }

        self.timers
            .arm(TimerKind::HandshakeTimeout, now + self.config.handshake_timeout());
        self.start_handshake(now);
    }

    fn on_session_datagram(&mut self, payload: &[u8], now: Instant) {
        if let Some(id) = wire::parse_macro_ack(payload) {
            if self.macros.acknowledge(id) {
                tracing::debug!("Macro ACK received for id {}", id);
                self.stats.macros_acknowledged += 1;
                self.events.push_back(ConnectionEvent::MacroAcknowledged(id));
                return;
            }
        }

        if payload == wire::HEARTBEAT_RESPONSE {
            self.stats.heartbeat_responses += 1;
            self.timers
                .arm(TimerKind::HeartbeatWatchdog, now + self.config.heartbeat_timeout());
            return;
        }

        self.unknown(Endpoint::Main, self.ports.dynamic, payload);
    }

    fn send_heartbeat(&mut self, now: Instant) {
        match self.transmit(Endpoint::Main, self.ports.dynamic, wire::HEARTBEAT) {
            Ok(()) => {
                self.stats.heartbeats_sent += 1;
                if !self.watchdog_started {
                    self.watchdog_started = true;
                    self.timers
                        .arm(TimerKind::HeartbeatWatchdog, now + self.config.heartbeat_timeout());
                }
            },
            Err(e) => {
                tracing::warn!("Heartbeat send error: {}", e);
                self.handle_connection_failure(now);
            },
        }
    }

    /// First suite packet now, the second after [`SUITE_FOLLOW_UP_DELAY`].
    fn send_suite_packets(&mut self, suite: Suite, now: Instant) -> io::Result<()> {
        if let Some(pending) = self.follow_up.take() {
            self.timers.cancel(TimerKind::SuiteFollowUp);
            self.transmit(Endpoint::Main, self.ports.dynamic, pending)?;
        }

        let [first, second] = suite.packets();
        tracing::debug!("Selecting {}", suite);
        self.transmit(Endpoint::Main, self.ports.dynamic, first)?;
        self.follow_up = Some(second);
        self.timers
            .arm(TimerKind::SuiteFollowUp, now + SUITE_FOLLOW_UP_DELAY);
        Ok(())
    }

    /// Send a handshake step; a failure counts as a connection failure.
    fn send_step(
        &mut self,
        endpoint: Endpoint,
        port: u16,
        payload: &[u8],
        label: &str,
        now: Instant,
    ) -> bool {
        match self.transmit(endpoint, port, payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("{} send error: {}", label, e);
                self.handle_connection_failure(now);
                false
            },
        }
    }

    fn transmit(&mut self, endpoint: Endpoint, port: u16, payload: &[u8]) -> io::Result<()> {
        if port == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "remote port not negotiated",
            ));
        }
        self.sockets.send_to(endpoint, port, payload)?;
        self.stats.datagrams_sent += 1;
        tracing::trace!("[{}] -> {}: {}", endpoint, port, Hex(payload));
        Ok(())
    }

    fn handle_connection_failure(&mut self, now: Instant) {
        if self.closing
            || matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Reconnecting
            )
        {
            return;
        }

        self.timers.cancel_all();
        self.sockets.close();
        self.reset_handshake();
        self.macros.clear_awaiting();

        if self.retry_count < self.config.max_retries {
            self.retry_count += 1;
            tracing::warn!(
                "Connection failed, retrying in {:?} ({}/{})",
                self.config.keepalive_interval,
                self.retry_count,
                self.config.max_retries
            );
            self.set_state(ConnectionState::Reconnecting);
            self.timers
                .arm(TimerKind::Reconnect, now + self.config.keepalive_interval);
        } else {
            tracing::error!(
                "Giving up on {} after {} retries",
                self.config.host,
                self.config.max_retries
            );
            self.cleanup();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn cleanup(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.timers.cancel_all();
        self.sockets.close();
        self.reset_handshake();
        self.macros.reset();
        self.retry_count = 0;
    }

    fn reset_handshake(&mut self) {
        self.stage = HandshakeStage::Init;
        self.announce = AnnounceStage::ExpectP7;
        self.ports.initial = self.config.ports.remote_initial;
        self.ports.reset_negotiated();
        self.watchdog_started = false;
        self.follow_up = None;
    }

    fn unknown(&mut self, endpoint: Endpoint, origin: u16, payload: &[u8]) {
        self.stats.unknown_datagrams += 1;
        tracing::debug!(
            "[{}] Unknown message from port {} at stage {}: {}",
            endpoint,
            origin,
            self.stage,
            Hex(payload)
        );
    }

    fn finish<T>(&mut self, command: CommandKind, result: Result<T>) -> Result<T> {
        let outcome = match &result {
            Ok(_) => CommandResult::ok(command),
            Err(e) => {
                if !e.is_validation() {
                    tracing::warn!("{} failed: {}", command, e);
                }
                CommandResult::failed(command, e.to_string())
            },
        };
        self.events
            .push_back(ConnectionEvent::CommandCompleted(outcome));
        result
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(connection = %self.id, "State {} -> {}", self.state, state);
        self.state = state;
        self.events.push_back(ConnectionEvent::StateChanged(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::transport::MemorySocketPair;

    fn engine() -> Connection<MemorySocketPair> {
        Connection::new(ConnectionConfig::new("10.0.0.20"), MemorySocketPair::new())
            .with_rng_seed(7)
    }

    fn drain(conn: &mut Connection<MemorySocketPair>) -> Vec<ConnectionEvent> {
        std::iter::from_fn(|| conn.poll_event()).collect()
    }

    #[test]
    fn test_new_is_idle() {
        let mut conn = engine();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.stage(), HandshakeStage::Init);
        assert_eq!(conn.next_timeout(), None);
        assert!(conn.poll_event().is_none());
        assert_eq!(conn.id().len(), 36);
    }

    #[test]
    fn test_connect_without_host() {
        let mut conn = Connection::new(ConnectionConfig::default(), MemorySocketPair::new());
        let err = conn.connect(Instant::now()).unwrap_err();
        assert!(matches!(err, KFrameError::Config(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.sockets().opens(), 0);
    }

    #[test]
    fn test_connect_rejects_out_of_range_durations() {
        let now = Instant::now();
        let huge =
            ConnectionConfig::new("10.0.0.20").with_keepalive(Duration::from_secs(u64::MAX / 2));
        let mut conn = Connection::new(huge, MemorySocketPair::new());
        assert!(matches!(conn.connect(now), Err(KFrameError::Config(_))));
        conn.handle_timeout(now + Duration::from_secs(11));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.next_timeout(), None);
        assert_eq!(conn.sockets().opens(), 0);

        let endless = ConnectionConfig::new("10.0.0.20").with_timeout(Duration::MAX);
        let mut conn = Connection::new(endless, MemorySocketPair::new());
        assert!(matches!(conn.connect(now), Err(KFrameError::Config(_))));
        assert!(drain(&mut conn).is_empty());
    }

    #[test]
    fn test_update_config_rejects_out_of_range_durations() {
        let mut conn = engine();
        let now = Instant::now();
        conn.connect(now).unwrap();
        drain(&mut conn);

        let bad = conn.config().clone().with_timeout(Duration::MAX);
        assert!(matches!(conn.update_config(bad, now), Err(KFrameError::Config(_))));
        assert_eq!(conn.config().timeout, Duration::from_millis(5000));
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        assert!(drain(&mut conn).is_empty());

        // The engine keeps running on the previous configuration.
        conn.handle_timeout(now + PACKET_1_RETRY_INTERVAL);
        assert_eq!(conn.sockets().sent().len(), 2);
    }

    #[test]
    fn test_connect_sends_packet_1() {
        let mut conn = engine();
        let now = Instant::now();
        conn.connect(now).unwrap();

        assert_eq!(conn.state(), ConnectionState::Handshaking);
        assert_eq!(conn.stage(), HandshakeStage::ExpectP2);
        assert_eq!(
            drain(&mut conn),
            vec![
                ConnectionEvent::StateChanged(ConnectionState::Connecting),
                ConnectionEvent::StateChanged(ConnectionState::Handshaking),
            ]
        );
        let sent = conn.sockets().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, wire::PACKET_1);
        assert_eq!(sent[0].port, 5000);
        assert_eq!(conn.next_timeout(), Some(now + PACKET_1_RETRY_INTERVAL));

        // Second connect is a no-op.
        conn.connect(now).unwrap();
        assert_eq!(conn.sockets().opens(), 1);
    }

    #[test]
    fn test_commands_rejected_when_disconnected() {
        let mut conn = engine();
        let now = Instant::now();

        assert!(matches!(conn.send_macro(5), Err(KFrameError::NotConnected)));
        assert!(matches!(
            conn.send_aux_route(1, 1),
            Err(KFrameError::NotConnected)
        ));
        assert!(matches!(
            conn.send_suite_switch(Suite::Suite2a, now),
            Err(KFrameError::NotConnected)
        ));

        let events = drain(&mut conn);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(
            e,
            ConnectionEvent::CommandCompleted(CommandResult { success: false, .. })
        )));
        assert!(conn.sockets().sent().is_empty());
    }

    #[test]
    fn test_set_suite_stores_while_disconnected() {
        let mut conn = engine();
        assert!(conn.set_suite(Suite::Suite4b, Instant::now()).is_err());
        assert_eq!(conn.suite(), Suite::Suite4b);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut conn = engine();
        conn.connect(Instant::now()).unwrap();
        drain(&mut conn);

        conn.disconnect();
        conn.disconnect();
        assert_eq!(
            drain(&mut conn),
            vec![ConnectionEvent::StateChanged(ConnectionState::Disconnected)]
        );
        assert_eq!(conn.next_timeout(), None);
    }
}

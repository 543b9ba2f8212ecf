//! Handshake transition tables.
//!
//! The handshake is two back-to-back negotiations on the main socket plus an
//! independent port-announcement exchange on the listener socket:
//!
//! ```text
//!  main socket                                   listener socket
//!  ───────────                                   ───────────────
//!  [Init] ──P1──> [ExpectP2]  (P1 resent 1/s)
//!  [ExpectP2]  <──P2 (initial)──  send P3        [ExpectP7] <──P7 (announce)── send P8
//!  [ExpectP4]  <──P4 (initial)──  send P5        [ExpectAnnouncement] <──P9── send P10
//!  [ExpectP6]  <──P6 (initial)──                 [Done]  (listener closed)
//!  [WaitAnnounce] ─── both done ──> send P12 to announced port
//!  [ExpectP13] <──P13 (any but initial)── record origin port, send P14
//!  [ExpectP15] <──P15 (dynamic)──  send P16(seq)
//!  [ExpectP17] <──P17 (dynamic)──
//!  [Connected]
//! ```
//!
//! A step fires only when the stage, the sender's port role and the payload
//! all match. Everything else is unknown input and leaves the stage alone.

use std::fmt;

use super::wire::{
    parse_port_announcement, ANNOUNCEMENT_MIN_LEN, PACKET_1, PACKET_13, PACKET_15, PACKET_17,
    PACKET_2, PACKET_4, PACKET_6, PACKET_7,
};

/// Fine-grained handshake progress on the main socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum HandshakeStage {
    /// Nothing sent yet
    #[default]
    Init,
    /// Packet 1 sent, awaiting packet 2
    ExpectP2,
    /// Packet 3 sent, awaiting packet 4
    ExpectP4,
    /// Packet 5 sent, awaiting packet 6
    ExpectP6,
    /// Phase 1 done, awaiting the port announcement
    WaitAnnounce,
    /// Packet 12 sent, awaiting packet 13
    ExpectP13,
    /// Packet 14 sent, awaiting packet 15
    ExpectP15,
    /// Packet 16 sent, awaiting packet 17
    ExpectP17,
    /// Handshake complete
    Connected,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ExpectP2 => "expect_p2",
            Self::ExpectP4 => "expect_p4",
            Self::ExpectP6 => "expect_p6",
            Self::WaitAnnounce => "wait_announce",
            Self::ExpectP13 => "expect_p13",
            Self::ExpectP15 => "expect_p15",
            Self::ExpectP17 => "expect_p17",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Remote port a message must originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPort {
    /// Device's well-known Phase 1 port
    Initial,
    /// Port named in the port announcement
    Announced,
    /// Any port except the initial one; the device may answer Phase 2 from
    /// a fresh port instead of the announced one
    Negotiated,
    /// Origin port observed on packet 13
    Dynamic,
}

/// Remote ports known to the handshake. Zero means "not known yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemotePorts {
    /// Device's Phase 1 port
    pub initial: u16,
    /// Port from the announcement
    pub announced: u16,
    /// Port observed on packet 13
    pub dynamic: u16,
}

impl RemotePorts {
    /// Port bound to `peer`, if known. `Negotiated` resolves to the
    /// announced port.
    pub fn get(&self, peer: PeerPort) -> Option<u16> {
        let port = match peer {
            PeerPort::Initial => self.initial,
            PeerPort::Announced | PeerPort::Negotiated => self.announced,
            PeerPort::Dynamic => self.dynamic,
        };
        (port != 0).then_some(port)
    }

    /// Whether a datagram from `origin` satisfies `peer`.
    pub fn matches(&self, peer: PeerPort, origin: u16) -> bool {
        match peer {
            PeerPort::Negotiated => {
                self.announced != 0 && origin != 0 && origin != self.initial
            },
            _ => self.get(peer) == Some(origin),
        }
    }

    /// Forget the negotiated ports, keeping the initial one.
    pub fn reset_negotiated(&mut self) {
        self.announced = 0;
        self.dynamic = 0;
    }
}

/// Side effect of a main-socket transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Stop packet 1 retries and send packet 3
    SendPacket3,
    /// Send the identification packet 5
    SendPacket5,
    /// Phase 1 complete; start Phase 2 if the announcement already arrived
    AwaitAnnouncement,
    /// Record the sender's port as the dynamic port and send packet 14
    CaptureDynamicPort,
    /// Send packet 16 with the next sequence value
    SendPacket16,
    /// Handshake complete
    Complete,
}

/// One row of the main-socket transition table.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    /// Stage the row applies to
    pub stage: HandshakeStage,
    /// Required origin
    pub peer: PeerPort,
    /// Exact expected payload
    pub expect: &'static [u8],
    /// Stage after the row fires
    pub next: HandshakeStage,
    /// Action to perform
    pub effect: Effect,
}

/// Main-socket handshake transitions.
pub const MAIN_TRANSITIONS: [Transition; 6] = [
    Transition {
        stage: HandshakeStage::ExpectP2,
        peer: PeerPort::Initial,
        expect: PACKET_2,
        next: HandshakeStage::ExpectP4,
        effect: Effect::SendPacket3,
    },
    Transition {
        stage: HandshakeStage::ExpectP4,
        peer: PeerPort::Initial,
        expect: PACKET_4,
        next: HandshakeStage::ExpectP6,
        effect: Effect::SendPacket5,
    },
    Transition {
        stage: HandshakeStage::ExpectP6,
        peer: PeerPort::Initial,
        expect: PACKET_6,
        next: HandshakeStage::WaitAnnounce,
        effect: Effect::AwaitAnnouncement,
    },
    Transition {
        stage: HandshakeStage::ExpectP13,
        peer: PeerPort::Negotiated,
        expect: PACKET_13,
        next: HandshakeStage::ExpectP15,
        effect: Effect::CaptureDynamicPort,
    },
    Transition {
        stage: HandshakeStage::ExpectP15,
        peer: PeerPort::Dynamic,
        expect: PACKET_15,
        next: HandshakeStage::ExpectP17,
        effect: Effect::SendPacket16,
    },
    Transition {
        stage: HandshakeStage::ExpectP17,
        peer: PeerPort::Dynamic,
        expect: PACKET_17,
        next: HandshakeStage::Connected,
        effect: Effect::Complete,
    },
];

/// Find the transition for a main-socket datagram.
pub fn lookup(
    stage: HandshakeStage,
    origin_port: u16,
    ports: &RemotePorts,
    payload: &[u8],
) -> Option<&'static Transition> {
    MAIN_TRANSITIONS.iter().find(|t| {
        t.stage == stage && ports.matches(t.peer, origin_port) && t.expect == payload
    })
}

/// True when a main-socket datagram is the device-restart signal.
///
/// Packet 1's bytes arriving from the device's initial port mean the device
/// has restarted its side of the handshake.
pub fn is_reset(
    stage: HandshakeStage,
    origin_port: u16,
    ports: &RemotePorts,
    payload: &[u8],
) -> bool {
    stage != HandshakeStage::Init
        && ports.get(PeerPort::Initial) == Some(origin_port)
        && payload == PACKET_1
}

/// Progress of the listener-socket port announcement exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceStage {
    /// Awaiting packet 7
    #[default]
    ExpectP7,
    /// Packet 8 sent, awaiting the announcement (packet 9)
    ExpectAnnouncement,
    /// Packet 10 sent, listener closed
    Done,
}

/// Classified listener-socket input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceInput {
    /// Packet 7: reply with packet 8
    Opener,
    /// Packet 9 carrying a usable port
    Announcement(u16),
    /// Announcement-shaped datagram with port zero
    InvalidPort,
}

/// Classify a listener-socket datagram against the announce stage.
///
/// Returns `None` for anything the current stage does not expect.
pub fn classify_announce(stage: AnnounceStage, payload: &[u8]) -> Option<AnnounceInput> {
    match stage {
        AnnounceStage::ExpectP7 if payload == PACKET_7 => Some(AnnounceInput::Opener),
        AnnounceStage::ExpectAnnouncement if payload.len() >= ANNOUNCEMENT_MIN_LEN => {
            Some(match parse_port_announcement(payload) {
                Some(port) => AnnounceInput::Announcement(port),
                None => AnnounceInput::InvalidPort,
            })
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{PACKET_3, PACKET_5};

    fn ports() -> RemotePorts {
        RemotePorts {
            initial: 5000,
            announced: 6001,
            dynamic: 6002,
        }
    }

    #[test]
    fn test_stage_order() {
        assert!(HandshakeStage::Init < HandshakeStage::ExpectP2);
        assert!(HandshakeStage::ExpectP17 < HandshakeStage::Connected);
        assert_eq!(HandshakeStage::ExpectP13.to_string(), "expect_p13");
    }

    #[test]
    fn test_table_advances_forward_only() {
        for t in &MAIN_TRANSITIONS {
            assert!(t.next > t.stage, "{:?} must advance", t.stage);
        }
    }

    #[test]
    fn test_lookup_phase_one() {
        let t = lookup(HandshakeStage::ExpectP2, 5000, &ports(), PACKET_2).unwrap();
        assert_eq!(t.effect, Effect::SendPacket3);
        assert_eq!(t.next, HandshakeStage::ExpectP4);

        let t = lookup(HandshakeStage::ExpectP6, 5000, &ports(), PACKET_6).unwrap();
        assert_eq!(t.effect, Effect::AwaitAnnouncement);
    }

    #[test]
    fn test_lookup_rejects_wrong_origin() {
        // Byte-identical packet 2 from the wrong port is ignored.
        assert!(lookup(HandshakeStage::ExpectP2, 5001, &ports(), PACKET_2).is_none());
        // Packet 15 must come from the dynamic port.
        assert!(lookup(HandshakeStage::ExpectP15, 6001, &ports(), PACKET_15).is_none());
        assert!(lookup(HandshakeStage::ExpectP15, 6002, &ports(), PACKET_15).is_some());
    }

    #[test]
    fn test_packet_13_from_any_negotiated_port() {
        assert!(lookup(HandshakeStage::ExpectP13, 6001, &ports(), PACKET_13).is_some());
        assert!(lookup(HandshakeStage::ExpectP13, 7123, &ports(), PACKET_13).is_some());
        // Never from the Phase 1 port.
        assert!(lookup(HandshakeStage::ExpectP13, 5000, &ports(), PACKET_13).is_none());
        // Not before an announcement.
        let unannounced = RemotePorts {
            initial: 5000,
            ..Default::default()
        };
        assert!(lookup(HandshakeStage::ExpectP13, 7123, &unannounced, PACKET_13).is_none());
    }

    #[test]
    fn test_lookup_rejects_wrong_stage_or_payload() {
        assert!(lookup(HandshakeStage::ExpectP4, 5000, &ports(), PACKET_6).is_none());
        assert!(lookup(HandshakeStage::ExpectP2, 5000, &ports(), PACKET_3).is_none());
        assert!(lookup(HandshakeStage::Connected, 6002, &ports(), PACKET_17).is_none());
        assert!(lookup(HandshakeStage::ExpectP2, 5000, &ports(), PACKET_5).is_none());
    }

    #[test]
    fn test_unknown_ports_never_match() {
        let unset = RemotePorts {
            initial: 5000,
            ..Default::default()
        };
        assert!(lookup(HandshakeStage::ExpectP13, 0, &unset, PACKET_13).is_none());
        assert_eq!(unset.get(PeerPort::Dynamic), None);
    }

    #[test]
    fn test_reset_negotiated_keeps_initial() {
        let mut ports = ports();
        ports.reset_negotiated();
        assert_eq!(ports.get(PeerPort::Initial), Some(5000));
        assert_eq!(ports.get(PeerPort::Announced), None);
        assert_eq!(ports.get(PeerPort::Dynamic), None);
        assert!(lookup(HandshakeStage::ExpectP15, 6002, &ports, PACKET_15).is_none());
    }

    #[test]
    fn test_reset_detection() {
        assert!(is_reset(HandshakeStage::Connected, 5000, &ports(), PACKET_1));
        assert!(is_reset(HandshakeStage::ExpectP4, 5000, &ports(), PACKET_1));
        assert!(!is_reset(HandshakeStage::Init, 5000, &ports(), PACKET_1));
        assert!(!is_reset(HandshakeStage::Connected, 6002, &ports(), PACKET_1));
    }

    #[test]
    fn test_classify_announce() {
        assert_eq!(
            classify_announce(AnnounceStage::ExpectP7, PACKET_7),
            Some(AnnounceInput::Opener)
        );
        let mut announcement = [0u8; 20];
        announcement[18..].copy_from_slice(&6001u16.to_be_bytes());
        assert_eq!(
            classify_announce(AnnounceStage::ExpectAnnouncement, &announcement),
            Some(AnnounceInput::Announcement(6001))
        );
        assert_eq!(
            classify_announce(AnnounceStage::ExpectAnnouncement, &[0u8; 20]),
            Some(AnnounceInput::InvalidPort)
        );
        // Out-of-order and duplicate input is not classified.
        assert_eq!(classify_announce(AnnounceStage::ExpectP7, &announcement), None);
        assert_eq!(classify_announce(AnnounceStage::ExpectAnnouncement, PACKET_7), None);
        assert_eq!(classify_announce(AnnounceStage::Done, &announcement), None);
    }
}

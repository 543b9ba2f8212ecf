//! Deadline bookkeeping for the connection engine.
//!
//! Every timer is a single optional deadline. Arming a timer replaces its
//! previous deadline, so at most one instance of each can be pending.

use std::time::Instant;

/// Timers owned by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Resend packet 1 until packet 2 arrives
    Packet1Retry,
    /// Overall handshake deadline
    HandshakeTimeout,
    /// Next heartbeat send
    Heartbeat,
    /// Heartbeat response watchdog
    HeartbeatWatchdog,
    /// Backoff before the next connection attempt
    Reconnect,
    /// Second packet of a suite switch
    SuiteFollowUp,
}

impl TimerKind {
    const ALL: [TimerKind; 6] = [
        TimerKind::Packet1Retry,
        TimerKind::HandshakeTimeout,
        TimerKind::Heartbeat,
        TimerKind::HeartbeatWatchdog,
        TimerKind::Reconnect,
        TimerKind::SuiteFollowUp,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Pending deadlines, one slot per [`TimerKind`].
#[derive(Debug, Clone, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; 6],
}

impl Timers {
    /// Arm `kind` to fire at `at`, replacing any earlier deadline.
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines[kind.index()] = Some(at);
    }

    /// Disarm `kind`.
    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    /// Disarm everything.
    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 6];
    }

    /// Deadline of `kind`, if armed.
    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.index()]
    }

    /// Earliest pending deadline.
    pub fn next(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Timers due at `now`, earliest first.
    pub fn due(&self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = TimerKind::ALL
            .iter()
            .filter_map(|&kind| {
                self.deadline(kind)
                    .filter(|&at| at <= now)
                    .map(|at| (at, kind))
            })
            .collect();
        due.sort_by_key(|&(at, _)| at);
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    /// Disarm `kind` and return true if it is due at `now`.
    ///
    /// A timer re-armed or cancelled since [`due`](Self::due) was computed is
    /// left alone.
    pub fn take_if_due(&mut self, kind: TimerKind, now: Instant) -> bool {
        match self.deadlines[kind.index()] {
            Some(at) if at <= now => {
                self.deadlines[kind.index()] = None;
                true
            },
            _ => false,
        }
    }
}

//! Suite selection.
//!
//! A suite is a named device configuration profile. Switching to one is a
//! fixed two-packet sequence; the second packet follows the first after
//! [`SUITE_FOLLOW_UP_DELAY`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hex_literal::hex;
use serde::{Deserialize, Serialize};

use crate::error::KFrameError;

/// Delay between the two packets of a suite switch.
pub const SUITE_FOLLOW_UP_DELAY: Duration = Duration::from_millis(100);

// Second packets are shared by the A/B variant of suites 1-2 and 3-4.
const FOLLOW_UP_1_2: &[u8] = &hex!("000407a700020005000000090000001004b600000100000700");
const FOLLOW_UP_3_4: &[u8] = &hex!("000407ab00020005000000090000001004b600000100000700");

const SUITE_1A: &[u8] = &hex!("0004017c000200060000000c0000001417960200010000070000000a");
const SUITE_1B: &[u8] = &hex!("0004017c000200060000000c0000001417960200010000070000000b");
const SUITE_2A: &[u8] = &hex!("0004017a000200060000000c0000001417960200010000070000000c");
const SUITE_2B: &[u8] = &hex!("0004017a000200060000000c0000001417960200010000070000000d");
const SUITE_3A: &[u8] = &hex!("0004017e000200060000000c0000001417960200010000070000000e");
const SUITE_3B: &[u8] = &hex!("0004017e000200060000000c0000001417960200010000070000000f");
const SUITE_4A: &[u8] = &hex!("000401f7000200060000000c00000014179602000100000700000010");
const SUITE_4B: &[u8] = &hex!("00040232000200060000000c00000014179602000100000700000011");

/// Device suite profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suite {
    /// Suite 1A
    #[default]
    Suite1a,
    /// Suite 1B
    Suite1b,
    /// Suite 2A
    Suite2a,
    /// Suite 2B
    Suite2b,
    /// Suite 3A
    Suite3a,
    /// Suite 3B
    Suite3b,
    /// Suite 4A
    Suite4a,
    /// Suite 4B
    Suite4b,
}

impl Suite {
    /// Every suite, in menu order.
    pub const ALL: [Suite; 8] = [
        Suite::Suite1a,
        Suite::Suite1b,
        Suite::Suite2a,
        Suite::Suite2b,
        Suite::Suite3a,
        Suite::Suite3b,
        Suite::Suite4a,
        Suite::Suite4b,
    ];

    /// Config identifier (`suite1a` ... `suite4b`).
    pub fn id(&self) -> &'static str {
        match self {
            Self::Suite1a => "suite1a",
            Self::Suite1b => "suite1b",
            Self::Suite2a => "suite2a",
            Self::Suite2b => "suite2b",
            Self::Suite3a => "suite3a",
            Self::Suite3b => "suite3b",
            Self::Suite4a => "suite4a",
            Self::Suite4b => "suite4b",
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Suite1a => "Suite 1A",
            Self::Suite1b => "Suite 1B",
            Self::Suite2a => "Suite 2A",
            Self::Suite2b => "Suite 2B",
            Self::Suite3a => "Suite 3A",
            Self::Suite3b => "Suite 3B",
            Self::Suite4a => "Suite 4A",
            Self::Suite4b => "Suite 4B",
        }
    }

    /// The two-packet switch sequence for this suite.
    pub fn packets(&self) -> [&'static [u8]; 2] {
        match self {
            Self::Suite1a => [SUITE_1A, FOLLOW_UP_1_2],
            Self::Suite1b => [SUITE_1B, FOLLOW_UP_1_2],
            Self::Suite2a => [SUITE_2A, FOLLOW_UP_1_2],
            Self::Suite2b => [SUITE_2B, FOLLOW_UP_1_2],
            Self::Suite3a => [SUITE_3A, FOLLOW_UP_3_4],
            Self::Suite3b => [SUITE_3B, FOLLOW_UP_3_4],
            Self::Suite4a => [SUITE_4A, FOLLOW_UP_3_4],
            Self::Suite4b => [SUITE_4B, FOLLOW_UP_3_4],
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Suite {
    type Err = KFrameError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Suite::ALL
            .into_iter()
            .find(|suite| suite.id() == normalized || suite.id()[5..] == normalized)
            .ok_or_else(|| KFrameError::UnknownSuite(s.to_string()))
    }
}

//! Wire constants and command encoding.
//!
//! Every K-Frame message has a fixed layout. Handshake and heartbeat packets
//! are matched by exact byte equality; the only parsed shapes are the port
//! announcement (a big-endian port at a fixed offset) and the macro
//! acknowledgement (a fixed prefix plus the correlation id).
//!
//! # Command layouts
//!
//! ```text
//! Macro (28 bytes)
//!  0      4              16             20           24        26    28
//!  |000403|id|00020005 0000000c 00000013|00020000|77000000|index:u16|0000|
//!
//! AUX route (28 bytes)
//!  0    2         4                          20       23    24         26   28
//!  |0004|msgid:u16|00020005 0000000c 00000013|007e0000|190001|aux|source:u16|0001|
//!
//! Packet 16 (27 bytes)
//!  0                                 16           18   20          27
//!  |000400010002001f0000000b0000002c|sequence:u16|0000|"client\0"|
//! ```

use std::fmt;
use std::ops::RangeInclusive;

use bytes::{BufMut, Bytes, BytesMut};
use hex_literal::hex;
use rand::Rng;

use crate::error::{KFrameError, Result};

/// Phase 1 opener, also the device-restart reset signal.
pub const PACKET_1: &[u8] = &hex!("00060000");
/// Phase 1 acknowledgement of packet 1.
pub const PACKET_2: &[u8] = &hex!("00020000");
/// Phase 1 second client packet.
pub const PACKET_3: &[u8] = &hex!("00010000");
/// Phase 1 acknowledgement of packet 3.
pub const PACKET_4: &[u8] = &hex!("00020000");
/// Phase 1 client identification packet.
pub const PACKET_5: &[u8] = &hex!("000400010002001f0000000b0000002c00010000636c69656e7400");
/// Phase 1 completion.
pub const PACKET_6: &[u8] = &hex!("00020001");

/// Announcement opener from the device.
pub const PACKET_7: &[u8] = &hex!("00010000");
/// Client reply to packet 7.
pub const PACKET_8: &[u8] = &hex!("00020000");
/// Client acknowledgement of the port announcement.
pub const PACKET_10: &[u8] = &hex!("00020001");

/// Phase 2 opener, sent to the announced port.
pub const PACKET_12: &[u8] = &hex!("00060000");
/// Phase 2 acknowledgement of packet 12.
pub const PACKET_13: &[u8] = &hex!("00020000");
/// Phase 2 second client packet.
pub const PACKET_14: &[u8] = &hex!("00010000");
/// Phase 2 acknowledgement of packet 14.
pub const PACKET_15: &[u8] = &hex!("00020000");
/// Phase 2 completion.
pub const PACKET_17: &[u8] = &hex!("00020001");

const PACKET_16_BASE: [u8; 16] = hex!("000400010002001f0000000b0000002c");
const PACKET_16_CLIENT: [u8; 7] = hex!("636c69656e7400");

/// Keepalive request.
pub const HEARTBEAT: &[u8] = &hex!("00010000");
/// Keepalive response.
pub const HEARTBEAT_RESPONSE: &[u8] = &hex!("00020000");

/// Minimum length of a port announcement (packet 9).
pub const ANNOUNCEMENT_MIN_LEN: usize = 20;
/// Offset of the big-endian port inside a port announcement.
pub const ANNOUNCEMENT_PORT_OFFSET: usize = 18;

/// Offset of the big-endian macro index inside a macro command.
pub const MACRO_INDEX_OFFSET: usize = 24;
/// Offset of the zero-based AUX bus inside an AUX route command.
pub const AUX_INDEX_OFFSET: usize = 23;
/// Offset of the big-endian source inside an AUX route command.
pub const AUX_SOURCE_OFFSET: usize = 24;

/// Valid logical macro numbers.
pub const MACRO_RANGE: RangeInclusive<u32> = 1..=999;
/// Valid logical AUX bus numbers.
pub const AUX_RANGE: RangeInclusive<u32> = 1..=96;
/// Valid logical source numbers.
pub const SOURCE_RANGE: RangeInclusive<u32> = 1..=850;

const MACRO_PREFIX: [u8; 3] = [0x00, 0x04, 0x03];
const MACRO_BODY: [u8; 20] = hex!("000200050000000c000000130002000077000000");
const MACRO_ACK_PREFIX: [u8; 3] = [0x00, 0x02, 0x03];

const AUX_PREFIX: [u8; 2] = [0x00, 0x04];
const AUX_BODY: [u8; 19] = hex!("000200050000000c00000013007e0000190001");
const AUX_TRAILER: [u8; 2] = [0x00, 0x01];

/// Encode a macro recall command.
///
/// `macro_number` is the logical 1-based macro; the wire carries `n - 1`.
pub fn encode_macro(macro_number: u32, correlation_id: u8) -> Result<Bytes> {
    if !MACRO_RANGE.contains(&macro_number) {
        return Err(KFrameError::InvalidMacro(macro_number));
    }

    let mut buf = BytesMut::with_capacity(28);
    buf.put_slice(&MACRO_PREFIX);
    buf.put_u8(correlation_id);
    buf.put_slice(&MACRO_BODY);
    buf.put_u16((macro_number - 1) as u16);
    buf.put_u16(0);
    Ok(buf.freeze())
}

/// Encode an AUX route command with a random message id.
pub fn encode_aux_route<R: Rng>(aux: u32, source: u32, rng: &mut R) -> Result<Bytes> {
    if !AUX_RANGE.contains(&aux) {
        return Err(KFrameError::InvalidAux(aux));
    }
    if !SOURCE_RANGE.contains(&source) {
        return Err(KFrameError::InvalidSource(source));
    }

    let message_id: u16 = rng.gen();

    let mut buf = BytesMut::with_capacity(28);
    buf.put_slice(&AUX_PREFIX);
    buf.put_u16(message_id);
    buf.put_slice(&AUX_BODY);
    buf.put_u8((aux - 1) as u8);
    buf.put_u16(source as u16);
    buf.put_slice(&AUX_TRAILER);
    Ok(buf.freeze())
}

/// Build Phase 2 packet 16 carrying `sequence`.
pub fn encode_packet_16(sequence: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(27);
    buf.put_slice(&PACKET_16_BASE);
    buf.put_u16(sequence);
    buf.put_u16(0);
    buf.put_slice(&PACKET_16_CLIENT);
    buf.freeze()
}

/// Read the announced port from packet 9.
///
/// Returns `None` when the buffer is too short or the port is zero.
pub fn parse_port_announcement(buf: &[u8]) -> Option<u16> {
    if buf.len() < ANNOUNCEMENT_MIN_LEN {
        return None;
    }
    let port = u16::from_be_bytes([
        buf[ANNOUNCEMENT_PORT_OFFSET],
        buf[ANNOUNCEMENT_PORT_OFFSET + 1],
    ]);
    (port != 0).then_some(port)
}

/// Correlation id of a macro acknowledgement (`00 02 03 <id>`).
pub fn parse_macro_ack(buf: &[u8]) -> Option<u8> {
    match buf {
        [a, b, c, id] if [*a, *b, *c] == MACRO_ACK_PREFIX => Some(*id),
        _ => None,
    }
}

/// Lowercase hex rendering for log lines.
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

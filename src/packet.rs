// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Frame codec for the wire packet layout:
//! `[header][number][inverse number][payload][trailer]`

use crate::protocol::{IntegrityMode, SOH, STX};

/// Payload length of a legacy short block
pub const SHORT_BLOCK: usize = 128;

/// Payload length of an extended block
pub const LONG_BLOCK: usize = 1024;

/// Payload length selected by a start-of-packet header byte, or `None`
/// when the byte does not begin a data packet.
pub fn payload_len(header: u8) -> Option<usize> {
    match header {
        SOH => Some(SHORT_BLOCK),
        STX => Some(LONG_BLOCK),
        _ => None,
    }
}

/// The packet number and its inverse must always sum to 255; any other
/// pair is header corruption, not a different packet.
pub fn numbers_match(number: u8, inverse: u8) -> bool {
    number as u16 + inverse as u16 == 255
}

/// One outbound data packet. The payload must already be padded to a
/// full short or long block.
pub struct Frame<'a> {
    pub number: u8,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Serialize the packet for the wire, trailer included.
    pub fn encode(&self, mode: IntegrityMode) -> Vec<u8> {
        debug_assert!(self.payload.len() == SHORT_BLOCK || self.payload.len() == LONG_BLOCK);

        let header = if self.payload.len() == LONG_BLOCK { STX } else { SOH };

        let mut wire = Vec::with_capacity(3 + self.payload.len() + mode.trailer_len());
        wire.push(header);
        wire.push(self.number);
        wire.push(!self.number);
        wire.extend_from_slice(self.payload);
        wire.extend_from_slice(&mode.trailer(self.payload));
        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc16_ccitt;

    #[test]
    fn test_payload_len() {
        assert_eq!(payload_len(SOH), Some(128));
        assert_eq!(payload_len(STX), Some(1024));
        assert_eq!(payload_len(0x04), None);
        assert_eq!(payload_len(0x18), None);
    }

    #[test]
    fn test_numbers_match() {
        assert!(numbers_match(1, 254));
        assert!(numbers_match(0, 255));
        assert!(numbers_match(255, 0));
        assert!(!numbers_match(1, 253));
        assert!(!numbers_match(7, 7));
    }

    #[test]
    fn test_inverse_is_complement() {
        for n in 0u8..=255 {
            assert!(numbers_match(n, !n));
        }
    }

    #[test]
    fn test_encode_short_crc() {
        let payload = [0xA5u8; 128];
        let wire = Frame { number: 3, payload: &payload }.encode(IntegrityMode::Crc);

        assert_eq!(wire.len(), 133);
        assert_eq!(wire[0], SOH);
        assert_eq!(wire[1], 3);
        assert_eq!(wire[2], 252);
        assert_eq!(&wire[3..131], &payload[..]);

        let crc = crc16_ccitt(&payload);
        assert_eq!(wire[131], (crc >> 8) as u8);
        assert_eq!(wire[132], (crc & 0xFF) as u8);
    }

    #[test]
    fn test_encode_short_checksum() {
        let payload = [0x01u8; 128];
        let wire = Frame { number: 1, payload: &payload }.encode(IntegrityMode::Checksum);

        assert_eq!(wire.len(), 132);
        assert_eq!(wire[0], SOH);
        assert_eq!(wire[131], 128); // 128 bytes of 0x01
    }

    #[test]
    fn test_encode_long_block_header() {
        let payload = [0u8; 1024];
        let wire = Frame { number: 9, payload: &payload }.encode(IntegrityMode::Crc);

        assert_eq!(wire[0], STX);
        assert_eq!(wire.len(), 1029);
    }
}

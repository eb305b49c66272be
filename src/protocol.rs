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

//! XMODEM signaling bytes, timing constants and integrity trailers

use std::time::Duration;

use crc::{CRC_16_XMODEM, Crc};

/// Start of header - begins a 128-byte data packet
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte data packet
pub const STX: u8 = 0x02;

/// End of transmission - sender closes a completed transfer
pub const EOT: u8 = 0x04;

/// End of transmission block - alternate close code, treated like EOT
pub const ETB: u8 = 0x17;

/// Acknowledge - packet accepted
pub const ACK: u8 = 0x06;

/// Negative acknowledge - packet rejected, retransmit
pub const NAK: u8 = 0x15;

/// Cancel - abort signal, honored only when two arrive in a row
pub const CAN: u8 = 0x18;

/// Padding byte for a short final block (Ctrl-Z)
pub const SUB: u8 = 0x1A;

/// Mode probe sent by the receiver to request CRC trailers
pub const CRC_PROBE: u8 = b'C';

/// Per-byte receive timeout, ten 100ms ticks
pub const BYTE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for a single read while draining a noisy line; the drain
/// stops at the first quiet tick
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Retry budget shared by sync probes, packet retransmissions and
/// close attempts
pub const MAX_RETRIES: u32 = 10;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Integrity trailer negotiated once at session start by the receiver's
/// first probe byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityMode {
    /// CRC-16/CCITT, 2-byte trailer
    Crc,
    /// Legacy additive checksum, 1-byte trailer
    Checksum,
}

impl IntegrityMode {
    pub fn trailer_len(self) -> usize {
        match self {
            IntegrityMode::Crc => 2,
            IntegrityMode::Checksum => 1,
        }
    }

    /// Trailer bytes for a padded payload, in wire order (CRC high byte
    /// first).
    pub fn trailer(self, payload: &[u8]) -> Vec<u8> {
        match self {
            IntegrityMode::Crc => crc16_ccitt(payload).to_be_bytes().to_vec(),
            IntegrityMode::Checksum => vec![checksum8(payload)],
        }
    }
}

/// CRC-16/CCITT (polynomial 0x1021, zero init) over a packet payload.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Sum of all payload bytes modulo 256.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

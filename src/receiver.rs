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

use std::io::Write;
use std::marker::PhantomData;
use std::time::Duration;

use crate::packet::{self, LONG_BLOCK, SHORT_BLOCK};
use crate::protocol::*;
use crate::serial::SerialPort;

// ============================================================================
// Error Types
// ============================================================================

/// Terminal outcomes of an inbound transfer. Every run of the state
/// machine ends in exactly one of these.
#[derive(Debug)]
pub enum ReceiverError {
    Io(std::io::Error),
    /// Sender closed the session after at least one delivered packet
    TransferComplete,
    /// Sender closed the session before any data packet arrived
    NoData,
    /// No usable byte within the sync retry budget
    TimedOut,
    /// Retry budget exhausted on a single packet
    TooManyRetries,
    /// Two consecutive CAN bytes from the sender
    RemoteCancel,
}

impl std::fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverError::Io(e) => write!(f, "I/O error: {}", e),
            ReceiverError::TransferComplete => write!(f, "done."),
            ReceiverError::NoData => write!(f, "no data, terminating."),
            ReceiverError::TimedOut => write!(f, "time out, terminating."),
            ReceiverError::TooManyRetries => write!(f, "too many retries, terminating."),
            ReceiverError::RemoteCancel => write!(f, "remote cancel, terminating."),
        }
    }
}

impl std::error::Error for ReceiverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiverError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReceiverError {
    fn from(err: std::io::Error) -> Self {
        ReceiverError::Io(err)
    }
}

// ============================================================================
// States
// ============================================================================

pub struct Sync;
pub struct AwaitPacket;
pub struct ReadPacket;
pub struct AckPending;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    output: Box<dyn Write + Send>,
    mode: IntegrityMode,
    probe: u8,
    sync_attempts: u32,
    retries: u32,
    expected: u8,
    block_len: usize,
    block: [u8; LONG_BLOCK],
    // Last accepted payload; written out once the packet after it is
    // accepted, or with its padding trimmed when EOT arrives
    held: Option<Vec<u8>>,
    delivered: u64,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            output: self.output,
            mode: self.mode,
            probe: self.probe,
            sync_attempts: self.sync_attempts,
            retries: self.retries,
            expected: self.expected,
            block_len: self.block_len,
            block: self.block,
            held: self.held,
            delivered: self.delivered,
            debug: self.debug,
        })
    }

    fn io_error(&self, e: std::io::Error) -> ReceiverError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        ReceiverError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name),
        ))
    }

    /// One timed read; a timeout is a value, not a failure.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ReceiverError> {
        let mut buf = [0u8; 1];
        match self.serial.read_timeout(&mut buf, timeout) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Discard pending input until the line goes quiet for one tick.
    fn drain(&mut self) -> Result<(), ReceiverError> {
        while self.read_byte(DRAIN_TIMEOUT)?.is_some() {}
        Ok(())
    }

    /// Drain and send the triple-CAN abort sequence.
    fn cancel_session(&mut self) -> Result<(), ReceiverError> {
        self.drain()?;
        self.serial.write_all(&[CAN, CAN, CAN])?;
        if self.debug {
            println!("Sent: CAN CAN CAN");
        }
        Ok(())
    }

    /// Reject the current packet attempt: drain line noise, NAK, and
    /// re-enter the packet wait. Exhausting the budget aborts the
    /// session.
    fn reject(mut self) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        self.drain()?;
        self.serial.write_all(&[NAK])?;
        if self.debug {
            println!("Sent: NAK");
        }

        self.retries += 1;
        if self.retries >= MAX_RETRIES {
            self.cancel_session()?;
            return Err(ReceiverError::TooManyRetries);
        }

        Ok(self.transition::<AwaitPacket>() as Box<dyn ReceiverState>)
    }

    /// Handle EOT/ETB: drain, flush the final block with its SUB padding
    /// trimmed, acknowledge and finish.
    fn complete(mut self) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        self.drain()?;

        if let Some(last) = self.held.take() {
            let data = trim_padding(&last);
            if let Err(e) = self.output.write_all(data).and_then(|_| self.output.flush()) {
                self.cancel_session()?;
                return Err(self.io_error(e));
            }
        }

        self.serial.write_all(&[ACK])?;
        if self.debug {
            println!("Sent: ACK (end of transmission)");
        }

        if self.delivered == 0 {
            Err(ReceiverError::NoData)
        } else {
            Err(ReceiverError::TransferComplete)
        }
    }

    /// Confirm a CAN byte: only a consecutive pair is honored.
    fn confirm_cancel(&mut self) -> Result<bool, ReceiverError> {
        if self.read_byte(BYTE_TIMEOUT)? == Some(CAN) {
            self.drain()?;
            self.serial.write_all(&[ACK])?;
            if self.debug {
                println!("Received: CAN CAN (remote cancel)");
            }
            Ok(true)
        } else {
            // A lone CAN is line noise
            Ok(false)
        }
    }
}

impl ReceiverFsm<Sync> {
    /// Account for a failed probe attempt. After exhausting the CRC
    /// probe budget, fall back to checksum-mode NAK probes; after
    /// exhausting those too, abort.
    fn probe_again(mut self) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        self.sync_attempts += 1;
        if self.sync_attempts >= MAX_RETRIES {
            if self.probe == CRC_PROBE {
                if self.debug {
                    println!("No response to CRC probe, retrying in checksum mode");
                }
                self.probe = NAK;
                self.sync_attempts = 0;
            } else {
                self.cancel_session()?;
                return Err(ReceiverError::TimedOut);
            }
        }
        Ok(Box::new(self) as Box<dyn ReceiverState>)
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<Sync> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        fsm.serial.write_all(&[fsm.probe])?;
        if fsm.debug {
            println!("Sent probe: 0x{:02X}", fsm.probe);
        }

        match fsm.read_byte(BYTE_TIMEOUT)? {
            Some(header) => {
                if let Some(len) = packet::payload_len(header) {
                    // The probe that drew a response fixes the trailer mode
                    fsm.mode = if fsm.probe == CRC_PROBE {
                        IntegrityMode::Crc
                    } else {
                        IntegrityMode::Checksum
                    };
                    fsm.block_len = len;
                    if fsm.debug {
                        println!("Synchronized: {:?} mode, {} byte blocks", fsm.mode, len);
                    }
                    return Ok(fsm.transition::<ReadPacket>() as Box<dyn ReceiverState>);
                }

                match header {
                    EOT | ETB => fsm.complete(),
                    CAN => {
                        if fsm.confirm_cancel()? {
                            Err(ReceiverError::RemoteCancel)
                        } else {
                            fsm.probe_again()
                        }
                    }
                    _ => fsm.probe_again(),
                }
            }
            None => fsm.probe_again(),
        }
    }
}

impl ReceiverState for ReceiverFsm<AwaitPacket> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        match fsm.read_byte(BYTE_TIMEOUT)? {
            Some(header) => {
                if let Some(len) = packet::payload_len(header) {
                    fsm.block_len = len;
                    return Ok(fsm.transition::<ReadPacket>() as Box<dyn ReceiverState>);
                }

                match header {
                    EOT | ETB => fsm.complete(),
                    CAN => {
                        if fsm.confirm_cancel()? {
                            Err(ReceiverError::RemoteCancel)
                        } else {
                            fsm.reject()
                        }
                    }
                    _ => {
                        if fsm.debug {
                            println!("Unexpected byte 0x{:02X} while waiting for a packet", header);
                        }
                        fsm.reject()
                    }
                }
            }
            None => fsm.reject(),
        }
    }
}

impl ReceiverState for ReceiverFsm<ReadPacket> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        // Packet number and its inverse
        let number = match fsm.read_byte(BYTE_TIMEOUT)? {
            Some(b) => b,
            None => return fsm.reject(),
        };
        let inverse = match fsm.read_byte(BYTE_TIMEOUT)? {
            Some(b) => b,
            None => return fsm.reject(),
        };

        // Payload
        for i in 0..fsm.block_len {
            match fsm.read_byte(BYTE_TIMEOUT)? {
                Some(b) => fsm.block[i] = b,
                None => return fsm.reject(),
            }
        }

        // Trailer
        let mut trailer = [0u8; 2];
        for i in 0..fsm.mode.trailer_len() {
            match fsm.read_byte(BYTE_TIMEOUT)? {
                Some(b) => trailer[i] = b,
                None => return fsm.reject(),
            }
        }

        if !packet::numbers_match(number, inverse) {
            if fsm.debug {
                println!("Corrupt packet header: {} / {}", number, inverse);
            }
            return fsm.reject();
        }

        let expected_trailer = fsm.mode.trailer(&fsm.block[..fsm.block_len]);
        if trailer[..fsm.mode.trailer_len()] != expected_trailer[..] {
            if fsm.debug {
                println!("Trailer mismatch on packet {}", number);
            }
            return fsm.reject();
        }

        if number == fsm.expected {
            if fsm.debug {
                println!("Accepted packet {} ({} bytes)", number, fsm.block_len);
            }
            fsm.expected = fsm.expected.wrapping_add(1);
            fsm.retries = 0;
            Ok(fsm.transition::<AckPending>() as Box<dyn ReceiverState>)
        } else if number == fsm.expected.wrapping_sub(1) {
            // Duplicate of the last accepted packet: our ACK was lost.
            // Acknowledge again but never deliver a second copy.
            if fsm.debug {
                println!("Duplicate packet {}, re-acknowledging", number);
            }
            fsm.serial.write_all(&[ACK])?;
            Ok(fsm.transition::<AwaitPacket>() as Box<dyn ReceiverState>)
        } else {
            if fsm.debug {
                println!("Sequencing error: got packet {}, expected {}", number, fsm.expected);
            }
            fsm.reject()
        }
    }
}

impl ReceiverState for ReceiverFsm<AckPending> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiverError> {
        let mut fsm = *self;

        // Flush the previously accepted block before acknowledging the
        // new one, so a write failure is reported as an abort instead
        // of a stray ACK
        if let Some(prev) = fsm.held.take() {
            if let Err(e) = fsm.output.write_all(&prev) {
                fsm.cancel_session()?;
                return Err(fsm.io_error(e));
            }
        }

        fsm.serial.write_all(&[ACK])?;
        if fsm.debug {
            println!("Sent: ACK");
        }

        fsm.held = Some(fsm.block[..fsm.block_len].to_vec());
        fsm.delivered += 1;

        Ok(fsm.transition::<AwaitPacket>() as Box<dyn ReceiverState>)
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl ReceiverFsm<Sync> {
    pub fn new(
        serial: Box<dyn SerialPort>,
        output: Box<dyn Write + Send>,
        debug: bool,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<Sync>,
            serial,
            output,
            mode: IntegrityMode::Crc,
            probe: CRC_PROBE,
            sync_attempts: 0,
            retries: 0,
            expected: 1,
            block_len: SHORT_BLOCK,
            block: [0; LONG_BLOCK],
            held: None,
            delivered: 0,
            debug,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Strip the trailing SUB padding from the final block of a transfer.
fn trim_padding(block: &[u8]) -> &[u8] {
    let end = block.iter().rposition(|&b| b != SUB).map_or(0, |i| i + 1);
    &block[..end]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;
    use std::sync::{Arc, Mutex};

    /// Write sink that stays inspectable after the state machine
    /// consumed its boxed handle.
    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn new() -> Self {
            SharedBuf(Arc::new(Mutex::new(Vec::new())))
        }

        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Writer whose first write always fails, for the abort-on-IO path.
    struct FailWriter;

    impl Write for FailWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "disk full",
            ))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run_receiver(mut fsm: Box<dyn ReceiverState>) -> ReceiverError {
        loop {
            match fsm.step() {
                Ok(next) => fsm = next,
                Err(e) => return e,
            }
        }
    }

    fn padded(data: &[u8], len: usize) -> Vec<u8> {
        let mut block = data.to_vec();
        block.resize(len, SUB);
        block
    }

    fn push_packet(responses: &mut Vec<Option<u8>>, number: u8, payload: &[u8], trailer: &[u8]) {
        responses.push(Some(if payload.len() == LONG_BLOCK { STX } else { SOH }));
        responses.push(Some(number));
        responses.push(Some(!number));
        for &b in payload {
            responses.push(Some(b));
        }
        for &b in trailer {
            responses.push(Some(b));
        }
    }

    fn crc_trailer(payload: &[u8]) -> Vec<u8> {
        IntegrityMode::Crc.trailer(payload)
    }

    #[test]
    fn test_trim_padding() {
        assert_eq!(trim_padding(&padded(b"abc", 128)), b"abc");
        assert_eq!(trim_padding(&[SUB; 128]), b"");
        assert_eq!(trim_padding(&[7u8; 128]), &[7u8; 128][..]);
        // Only the trailing run is padding
        assert_eq!(trim_padding(&[SUB, 1, SUB, SUB]), &[SUB, 1]);
    }

    #[test]
    fn test_receiver_full_transfer_crc() {
        let block = padded(b"Test data", 128);

        let mut responses = Vec::new();
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_PROBE, ACK, ACK];

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), true);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
        assert_eq!(out.contents(), b"Test data");
    }

    #[test]
    fn test_receiver_checksum_fallback() {
        let block = padded(b"legacy", 128);
        let checksum = vec![checksum8(&block)];

        // Ten silent CRC probes force the checksum-mode fallback
        let mut responses = vec![None; 10];
        push_packet(&mut responses, 1, &block, &checksum);
        responses.push(Some(EOT));

        let mut expected_writes = vec![CRC_PROBE; 10];
        expected_writes.push(NAK);
        expected_writes.push(ACK);
        expected_writes.push(ACK);

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
        assert_eq!(out.contents(), b"legacy");
    }

    #[test]
    fn test_receiver_long_block() {
        let mut data = Vec::new();
        for i in 0..1000 {
            data.push((i % 255) as u8 + 1);
        }
        let block = padded(&data, LONG_BLOCK);

        let mut responses = Vec::new();
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        responses.push(Some(EOT));

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, vec![CRC_PROBE, ACK, ACK]));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
        assert_eq!(out.contents(), data);
    }

    #[test]
    fn test_receiver_corrupt_packet_never_delivered() {
        let block = padded(b"good data", 128);
        let mut corrupt = block.clone();
        corrupt[5] ^= 0x01; // single bit flip

        let mut responses = Vec::new();
        // Corrupt payload with the correct block's trailer
        push_packet(&mut responses, 1, &corrupt, &crc_trailer(&block));
        responses.push(None); // quiet point for the drain before NAK
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_PROBE, NAK, ACK, ACK];

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
        assert_eq!(out.contents(), b"good data");
    }

    #[test]
    fn test_receiver_bad_inverse_rejected() {
        let block = padded(b"data", 128);

        let mut responses = vec![Some(SOH), Some(1), Some(200)]; // 1 + 200 != 255
        for &b in &block {
            responses.push(Some(b));
        }
        for &b in &crc_trailer(&block) {
            responses.push(Some(b));
        }
        responses.push(None);
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        responses.push(Some(EOT));

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(
            responses,
            vec![CRC_PROBE, NAK, ACK, ACK],
        ));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
        assert_eq!(out.contents(), b"data");
    }

    #[test]
    fn test_receiver_duplicate_delivered_once() {
        let mut first = Vec::new();
        for i in 0..128 {
            first.push((i % 100) as u8 + 1);
        }
        let second = padded(b"tail", 128);

        let mut responses = Vec::new();
        push_packet(&mut responses, 1, &first, &crc_trailer(&first));
        // Retransmission of packet 1, as after a lost ACK
        push_packet(&mut responses, 1, &first, &crc_trailer(&first));
        push_packet(&mut responses, 2, &second, &crc_trailer(&second));
        responses.push(Some(EOT));

        // The duplicate is re-ACKed without a NAK in between
        let expected_writes = vec![CRC_PROBE, ACK, ACK, ACK, ACK];

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));

        let mut want = first.clone();
        want.extend_from_slice(b"tail");
        assert_eq!(out.contents(), want);
    }

    #[test]
    fn test_receiver_wraparound() {
        // 300 packets: numbers run 1..=255, 0, 1..=44
        let mut responses = Vec::new();
        let mut want = Vec::new();
        for i in 0u32..300 {
            let number = ((i + 1) % 256) as u8;
            let payload = vec![(i % 251) as u8 + 1; 128];
            push_packet(&mut responses, number, &payload, &crc_trailer(&payload));
            want.extend_from_slice(&payload);
        }
        responses.push(Some(EOT));

        let mut expected_writes = vec![CRC_PROBE];
        expected_writes.extend(std::iter::repeat(ACK).take(301));

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
        assert_eq!(out.contents(), want);
    }

    #[test]
    fn test_receiver_remote_cancel() {
        let block = padded(b"partial", 128);

        let mut responses = Vec::new();
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        responses.push(Some(CAN));
        responses.push(Some(CAN));

        let expected_writes = vec![CRC_PROBE, ACK, ACK];

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::RemoteCancel));
    }

    #[test]
    fn test_receiver_lone_can_is_noise() {
        let block = padded(b"kept", 128);

        let mut responses = Vec::new();
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        responses.push(Some(CAN));
        responses.push(Some(SOH)); // not a second CAN, so not a cancel
        // The SOH was consumed by the cancel check; the reject drains
        // the rest of the line before NAKing
        responses.push(None);
        push_packet(&mut responses, 2, &block, &crc_trailer(&block));
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_PROBE, ACK, NAK, ACK, ACK];

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
    }

    #[test]
    fn test_receiver_sync_exhaustion() {
        // A dead line: ten CRC probes, ten checksum probes, abort
        let responses = vec![None; 20];

        let mut expected_writes = vec![CRC_PROBE; 10];
        expected_writes.extend(std::iter::repeat(NAK).take(10));
        expected_writes.extend_from_slice(&[CAN, CAN, CAN]);

        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(SharedBuf::new()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TimedOut));
    }

    #[test]
    fn test_receiver_retry_exhaustion() {
        let block = padded(b"x", 128);
        let mut bad_trailer = crc_trailer(&block);
        bad_trailer[0] ^= 0xFF;

        // Ten corrupt packets in a row exhaust the retry budget
        let mut responses = Vec::new();
        for _ in 0..10 {
            push_packet(&mut responses, 1, &block, &bad_trailer);
            responses.push(None); // quiet point for each drain
        }

        let mut expected_writes = vec![CRC_PROBE];
        expected_writes.extend(std::iter::repeat(NAK).take(10));
        expected_writes.extend_from_slice(&[CAN, CAN, CAN]);

        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(SharedBuf::new()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TooManyRetries));
    }

    #[test]
    fn test_receiver_no_data() {
        let responses = vec![Some(EOT)];
        let expected_writes = vec![CRC_PROBE, ACK];

        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(SharedBuf::new()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::NoData));
    }

    #[test]
    fn test_receiver_etb_ends_transfer() {
        let block = padded(b"etb close", 128);

        let mut responses = Vec::new();
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        responses.push(Some(ETB));

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(responses, vec![CRC_PROBE, ACK, ACK]));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
        assert_eq!(out.contents(), b"etb close");
    }

    #[test]
    fn test_receiver_write_failure_aborts() {
        let block = padded(b"doomed", 128);

        let mut responses = Vec::new();
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        push_packet(&mut responses, 2, &block, &crc_trailer(&block));

        // Packet 1 is ACKed before its write is attempted; the write
        // fails while acknowledging packet 2, so only CANs follow
        let expected_writes = vec![CRC_PROBE, ACK, CAN, CAN, CAN];

        let serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(serial, Box::new(FailWriter), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::Io(_)));
    }

    #[test]
    fn test_receiver_sequencing_error_rejected() {
        let block = padded(b"seq", 128);

        let mut responses = Vec::new();
        // Packet 5 when packet 1 is expected
        push_packet(&mut responses, 5, &block, &crc_trailer(&block));
        responses.push(None);
        push_packet(&mut responses, 1, &block, &crc_trailer(&block));
        responses.push(Some(EOT));

        let out = SharedBuf::new();
        let serial = Box::new(MockSerialPort::new(
            responses,
            vec![CRC_PROBE, NAK, ACK, ACK],
        ));
        let fsm = ReceiverFsm::new(serial, Box::new(out.clone()), false);

        assert!(matches!(run_receiver(fsm), ReceiverError::TransferComplete));
        assert_eq!(out.contents(), b"seq");
    }
}

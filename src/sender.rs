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

use std::io::Read;
use std::marker::PhantomData;
use std::time::Duration;

use crate::packet::{Frame, SHORT_BLOCK};
use crate::protocol::*;
use crate::serial::SerialPort;

// ============================================================================
// Error Types
// ============================================================================

/// Terminal outcomes of an outbound transfer.
#[derive(Debug)]
pub enum SenderError {
    Io(std::io::Error),
    /// Final EOT acknowledged, session closed
    TransferComplete,
    /// No mode probe from the receiver within the sync budget
    SyncTimeout,
    /// Two consecutive CAN bytes from the receiver
    RemoteCancel,
    /// Retry budget exhausted on a packet or on the closing EOT
    TransmitError,
}

impl std::fmt::Display for SenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderError::Io(e) => write!(f, "I/O error: {}", e),
            SenderError::TransferComplete => write!(f, "done."),
            SenderError::SyncTimeout => write!(f, "time out, terminating."),
            SenderError::RemoteCancel => write!(f, "remote cancel, terminating."),
            SenderError::TransmitError => write!(f, "transmit error, terminating."),
        }
    }
}

impl std::error::Error for SenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SenderError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SenderError {
    fn from(err: std::io::Error) -> Self {
        SenderError::Io(err)
    }
}

// ============================================================================
// States
// ============================================================================

pub struct WaitSync;
pub struct NextBlock;
pub struct Transmit;
pub struct AwaitAck;
pub struct Closing;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    input: Box<dyn Read + Send>,
    mode: IntegrityMode,
    number: u8,
    attempts: u32,
    retries: u32,
    block: [u8; SHORT_BLOCK],
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError>;
}

// ============================================================================
// Helpers
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            input: self.input,
            mode: self.mode,
            number: self.number,
            attempts: self.attempts,
            retries: self.retries,
            block: self.block,
            debug: self.debug,
        })
    }

    fn io_error(&self, e: std::io::Error) -> SenderError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        SenderError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name),
        ))
    }

    /// One timed read; a timeout is a value, not a failure.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, SenderError> {
        let mut buf = [0u8; 1];
        match self.serial.read_timeout(&mut buf, timeout) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Discard pending input until the line goes quiet for one tick.
    fn drain(&mut self) -> Result<(), SenderError> {
        while self.read_byte(DRAIN_TIMEOUT)?.is_some() {}
        Ok(())
    }

    /// Drain and send the triple-CAN abort sequence.
    fn cancel_session(&mut self) -> Result<(), SenderError> {
        self.drain()?;
        self.serial.write_all(&[CAN, CAN, CAN])?;
        if self.debug {
            println!("Sent: CAN CAN CAN");
        }
        Ok(())
    }

    /// Confirm a CAN byte: only a consecutive pair is honored.
    fn confirm_cancel(&mut self) -> Result<bool, SenderError> {
        if self.read_byte(BYTE_TIMEOUT)? == Some(CAN) {
            self.serial.write_all(&[ACK])?;
            self.drain()?;
            if self.debug {
                println!("Received: CAN CAN (remote cancel)");
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl SenderFsm<AwaitAck> {
    /// Account for a rejected or unanswered packet and retransmit it
    /// unchanged; exhausting the budget ends the session.
    fn retransmit(mut self) -> Result<Box<dyn SenderState>, SenderError> {
        self.retries += 1;
        if self.retries >= MAX_RETRIES {
            self.drain()?;
            return Err(SenderError::TransmitError);
        }
        if self.debug {
            println!("Retransmitting packet {} (attempt {})", self.number, self.retries + 1);
        }
        Ok(self.transition::<Transmit>() as Box<dyn SenderState>)
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<WaitSync> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.read_byte(BYTE_TIMEOUT)? {
            Some(CRC_PROBE) => {
                fsm.mode = IntegrityMode::Crc;
                if fsm.debug {
                    println!("Receiver requested CRC mode");
                }
                Ok(fsm.transition::<NextBlock>() as Box<dyn SenderState>)
            }
            Some(NAK) => {
                fsm.mode = IntegrityMode::Checksum;
                if fsm.debug {
                    println!("Receiver requested checksum mode");
                }
                Ok(fsm.transition::<NextBlock>() as Box<dyn SenderState>)
            }
            Some(CAN) => {
                if fsm.confirm_cancel()? {
                    return Err(SenderError::RemoteCancel);
                }
                fsm.attempts += 1;
                if fsm.attempts >= MAX_RETRIES {
                    fsm.cancel_session()?;
                    return Err(SenderError::SyncTimeout);
                }
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            _ => {
                fsm.attempts += 1;
                if fsm.attempts >= MAX_RETRIES {
                    fsm.cancel_session()?;
                    return Err(SenderError::SyncTimeout);
                }
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
        }
    }
}

impl SenderState for SenderFsm<NextBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        // A read returning zero is the definitive end-of-input signal
        let mut filled = 0;
        while filled < fsm.block.len() {
            let n = match fsm.input.read(&mut fsm.block[filled..]) {
                Ok(n) => n,
                Err(e) => {
                    fsm.cancel_session()?;
                    return Err(fsm.io_error(e));
                }
            };
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            if fsm.debug {
                println!("End of input after {} packets", fsm.number.wrapping_sub(1));
            }
            fsm.attempts = 0;
            return Ok(fsm.transition::<Closing>() as Box<dyn SenderState>);
        }

        fsm.block[filled..].fill(SUB);
        fsm.retries = 0;
        if fsm.debug {
            println!("Prepared packet {} ({} data bytes)", fsm.number, filled);
        }

        Ok(fsm.transition::<Transmit>() as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<Transmit> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        let wire = Frame {
            number: fsm.number,
            payload: &fsm.block,
        }
        .encode(fsm.mode);

        fsm.serial.write_all(&wire)?;
        if fsm.debug {
            println!("Sent packet {} ({} bytes on the wire)", fsm.number, wire.len());
        }

        Ok(fsm.transition::<AwaitAck>() as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<AwaitAck> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        match fsm.read_byte(BYTE_TIMEOUT)? {
            Some(ACK) => {
                if fsm.debug {
                    println!("Received: ACK");
                }
                fsm.number = fsm.number.wrapping_add(1);
                Ok(fsm.transition::<NextBlock>() as Box<dyn SenderState>)
            }
            Some(NAK) => {
                if fsm.debug {
                    println!("Received: NAK");
                }
                fsm.retransmit()
            }
            Some(CAN) => {
                if fsm.confirm_cancel()? {
                    return Err(SenderError::RemoteCancel);
                }
                fsm.retransmit()
            }
            Some(other) => {
                if fsm.debug {
                    println!("Unexpected response 0x{:02X}", other);
                }
                fsm.retransmit()
            }
            None => fsm.retransmit(),
        }
    }
}

impl SenderState for SenderFsm<Closing> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, SenderError> {
        let mut fsm = *self;

        fsm.serial.write_all(&[EOT])?;
        if fsm.debug {
            println!("Sent: EOT");
        }

        match fsm.read_byte(BYTE_TIMEOUT)? {
            Some(ACK) => Err(SenderError::TransferComplete),
            _ => {
                fsm.attempts += 1;
                if fsm.attempts >= MAX_RETRIES {
                    fsm.drain()?;
                    return Err(SenderError::TransmitError);
                }
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
        }
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl SenderFsm<WaitSync> {
    pub fn new(
        serial: Box<dyn SerialPort>,
        input: Box<dyn Read + Send>,
        debug: bool,
    ) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<WaitSync>,
            serial,
            input,
            mode: IntegrityMode::Crc,
            number: 1,
            attempts: 0,
            retries: 0,
            block: [0; SHORT_BLOCK],
            debug,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

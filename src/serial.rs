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

use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort as SerialPortTrait, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte transport used by the transfer state machines.
///
/// A timed-out read is reported through `ErrorKind::TimedOut`, never by
/// blocking forever; transmission corruption is left for the integrity
/// trailer to catch.
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.port.read(buf)
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

/// Scripted port for single-sided state machine tests.
///
/// Reads are served one byte at a time from `responses`; a `None` entry
/// produces a single timeout (useful for marking the quiet point where a
/// line drain must stop). Everything the state machine writes is logged
/// and verified against `expected_writes` on drop.
#[cfg(test)]
pub struct MockSerialPort {
    responses: Vec<Option<u8>>,
    read_pos: usize,
    write_log: Vec<u8>,
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        // Script exhausted = the line has gone quiet
        if self.read_pos >= self.responses.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout",
            ));
        }

        match self.responses[self.read_pos] {
            Some(byte) => {
                self.read_pos += 1;
                buf[0] = byte;
                Ok(1)
            }
            None => {
                self.read_pos += 1;
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Mock timeout",
                ))
            }
        }
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        assert_eq!(
            self.read_pos,
            self.responses.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {})",
            self.responses.len() - self.read_pos,
            self.read_pos,
            self.responses.len()
        );

        assert_eq!(
            &self.write_log, &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

// ============================================================================
// In-Memory Channel Pair for Round-Trip Testing
// ============================================================================

/// One end of a lossless simulated serial line. Two of these, cross-wired
/// over mpsc channels, let a sender and a receiver state machine run
/// against each other on separate threads.
#[cfg(test)]
pub struct ChannelPort {
    tx: std::sync::mpsc::Sender<u8>,
    rx: std::sync::mpsc::Receiver<u8>,
}

#[cfg(test)]
pub fn channel_pair() -> (ChannelPort, ChannelPort) {
    let (tx_a, rx_b) = std::sync::mpsc::channel();
    let (tx_b, rx_a) = std::sync::mpsc::channel();
    (
        ChannelPort { tx: tx_a, rx: rx_a },
        ChannelPort { tx: tx_b, rx: rx_b },
    )
}

#[cfg(test)]
impl SerialPort for ChannelPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        // Send errors are ignored by contract: a vanished peer shows up
        // as a read timeout on the next receive.
        for &byte in buf {
            let _ = self.tx.send(byte);
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        match self.rx.recv_timeout(timeout) {
            Ok(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data on channel",
            )),
        }
    }
}

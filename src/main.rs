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

// XMODEM transfer utility
mod packet;
mod protocol;
mod receiver;
mod sender;
mod serial;

use std::fs::File;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serialport::{DataBits, Parity, StopBits};

use receiver::{ReceiverError, ReceiverFsm, ReceiverState};
use sender::{SenderError, SenderFsm, SenderState};
use serial::RealSerialPort;

#[derive(Parser)]
#[command(name = "xmodem")]
#[command(about = "XMODEM file transfer over a serial line", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "1200")]
    baud: BaudRate,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file; start an XMODEM receive on the remote side
    Send {
        /// File to send
        file: PathBuf,
    },
    /// Receive into a file (created or overwritten); start an XMODEM
    /// send on the remote side
    Receive {
        /// File to create
        file: PathBuf,
    },
}

/// The set of line speeds the original serial hardware supports.
#[derive(Clone, Copy, ValueEnum)]
enum BaudRate {
    #[value(name = "110")]
    B110,
    #[value(name = "150")]
    B150,
    #[value(name = "300")]
    B300,
    #[value(name = "600")]
    B600,
    #[value(name = "1200")]
    B1200,
    #[value(name = "2400")]
    B2400,
    #[value(name = "4800")]
    B4800,
    #[value(name = "9600")]
    B9600,
}

impl BaudRate {
    fn as_u32(self) -> u32 {
        match self {
            BaudRate::B110 => 110,
            BaudRate::B150 => 150,
            BaudRate::B300 => 300,
            BaudRate::B600 => 600,
            BaudRate::B1200 => 1200,
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
        }
    }
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!(
            "Invalid parity: {}. Must be 'none', 'odd', or 'even'",
            parity
        )),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn main() {
    let cli = Cli::parse();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Opening serial port: {}", cli.port);
    println!(
        "Settings: {} baud, {:?}, {:?}, {:?}",
        cli.baud.as_u32(),
        data_bits,
        parity,
        stop_bits
    );

    let serial_port =
        match RealSerialPort::open(&cli.port, cli.baud.as_u32(), data_bits, parity, stop_bits) {
            Ok(port) => port,
            Err(e) => {
                eprintln!("Failed to open serial port: {}", e);
                std::process::exit(1);
            }
        };

    match cli.command {
        Commands::Send { file } => {
            let input = match File::open(&file) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Cannot open {}: {}", file.display(), e);
                    std::process::exit(1);
                }
            };

            println!("Sending {}; start XMODEM receive on the remote side", file.display());

            let fsm = SenderFsm::new(Box::new(serial_port), Box::new(input), cli.debug);
            let outcome = run_sender(fsm);
            println!("{}", outcome);
            std::process::exit(sender_exit_code(&outcome));
        }
        Commands::Receive { file } => {
            let output = match File::create(&file) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Cannot create {}: {}", file.display(), e);
                    std::process::exit(1);
                }
            };

            println!("Receiving into {}; start XMODEM send on the remote side", file.display());

            let fsm = ReceiverFsm::new(Box::new(serial_port), Box::new(output), cli.debug);
            let outcome = run_receiver(fsm);
            println!("{}", outcome);
            std::process::exit(receiver_exit_code(&outcome));
        }
    }
}

/// Drive the sender state machine to its terminal outcome.
fn run_sender(mut state: Box<dyn SenderState>) -> SenderError {
    loop {
        match state.step() {
            Ok(next_state) => state = next_state,
            Err(outcome) => return outcome,
        }
    }
}

/// Drive the receiver state machine to its terminal outcome.
fn run_receiver(mut state: Box<dyn ReceiverState>) -> ReceiverError {
    loop {
        match state.step() {
            Ok(next_state) => state = next_state,
            Err(outcome) => return outcome,
        }
    }
}

fn sender_exit_code(outcome: &SenderError) -> i32 {
    match outcome {
        SenderError::TransferComplete => 0,
        SenderError::Io(_) => 1,
        SenderError::SyncTimeout => 3,
        SenderError::RemoteCancel => 4,
        SenderError::TransmitError => 5,
    }
}

fn receiver_exit_code(outcome: &ReceiverError) -> i32 {
    match outcome {
        ReceiverError::TransferComplete => 0,
        ReceiverError::Io(_) => 1,
        ReceiverError::NoData => 2,
        ReceiverError::TimedOut => 3,
        ReceiverError::RemoteCancel => 4,
        ReceiverError::TooManyRetries => 5,
    }
}

// ============================================================================
// Round-Trip Tests
// ============================================================================

//! Host side of a USB programmer for Microchip PIC16F, PIC18F and PIC32MX
//! microcontrollers.
//!
//! <br>
//!
//! The programmer is a small USB device exposing a vendor specific interface
//! with one bulk IN and one bulk OUT endpoint. Each target family has its own
//! firmware and command set; this crate loads Intel HEX images, splits them
//! into segments the firmware can take, and drives the command set of the
//! selected family to erase, program, verify, identify and dump the target.
//!
//! # Example
//!
//! Program a PIC18F and print its device ID!
//!
//! ```no_run
//! use picprog_rs::{Config, DeviceFamily, Engine, HexImage, PicprogConnection, Programmer};
//!
//! use rusb::Context;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = HexImage::load("blink.hex")?;
//!
//!     let config = Config::default();
//!     let conn = PicprogConnection::new(Context::new()?, None, config.clone())?;
//!     let mut engine = Engine::new(DeviceFamily::Pic18, conn, config);
//!
//!     engine.program(&image)?;
//!     println!("{}", engine.read_device_id()?);
//!
//!     Ok(())
//! }
//! ```

/// Microchip's USB vendor ID, used by the programmer.
pub const PICPROG_VID: u16 = 0x04d8;
/// Class code of the programmer's vendor specific interface.
pub const PICPROG_INTERFACE_CLASS: u8 = 0xff;

pub mod cmd;
pub use cmd::{CommandFrame, PicprogError};

pub mod config;
pub use config::Config;

pub mod family;
pub use family::{DeviceFamily, DeviceId, DumpSection, Engine, Programmer};

pub mod framing;
pub mod hex;
pub use hex::{HexImage, ParseError, Segment};

pub mod pic16;
pub mod pic18;
pub mod pic32;

pub mod transport;
pub use transport::Transport;

pub mod usb;
pub use usb::PicprogConnection;

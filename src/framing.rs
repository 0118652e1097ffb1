//! Request/response framing shared by the protocol engines.
//!
//! Every command is a single bulk OUT transfer. What comes back depends on
//! the command: a two byte "OK", a fixed amount of data, or a single status
//! byte. The PIC32MX firmware may also send "FAIL" and may interleave
//! unsolicited diagnostic frames starting with "DEBU" or "TEXT" at any time.

use std::fmt;

use crate::cmd::{CommandFrame, PicprogError, Result};
use crate::config::Config;
use crate::transport::Transport;

/// USB full speed bulk packet size, the largest frame the programmer sends.
pub const MAX_PACKET_SIZE: usize = 64;

const OK: &[u8] = b"OK";
const FAIL: &[u8] = b"FAIL";
const DEBUG_MARKER: &[u8] = b"DEBU";
const TEXT_MARKER: &[u8] = b"TEXT";

/// How responses are read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// One read per response; anything unexpected is an error.
    Strict,
    /// Keep reading past empty reads, diagnostic frames and frames of the
    /// wrong size or content until the expected shape (or "FAIL") arrives.
    SideChannel,
}

/// An unsolicited diagnostic frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// "DEBU" followed by a whole number of 32 bit words.
    Words(Vec<u32>),
    /// "DEBU" followed by a payload that is not a whole number of words.
    Bytes(Vec<u8>),
    /// "TEXT" followed by a message.
    Text(String),
}
impl Diagnostic {
    /// Recognises a diagnostic frame. The marker alone is not one.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() <= DEBUG_MARKER.len() {
            return None;
        }
        let (marker, payload) = frame.split_at(DEBUG_MARKER.len());
        if marker == DEBUG_MARKER {
            if frame.len() % 4 == 0 {
                let words = payload
                    .chunks_exact(4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .collect();
                Some(Diagnostic::Words(words))
            } else {
                Some(Diagnostic::Bytes(payload.to_vec()))
            }
        } else if marker == TEXT_MARKER {
            Some(Diagnostic::Text(
                String::from_utf8_lossy(payload)
                    .trim_end_matches('\0')
                    .to_string(),
            ))
        } else {
            None
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Words(words) => {
                write!(f, "DEBU:")?;
                for word in words {
                    write!(f, " {:08x}", word)?;
                }
                Ok(())
            }
            Diagnostic::Bytes(bytes) => write!(f, "DEBU: {}", HexBytes(bytes)),
            Diagnostic::Text(text) => write!(f, "TEXT: {}", text),
        }
    }
}

/// Formats bytes as space separated hex pairs.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Sends commands over a [`Transport`] and checks their responses.
#[derive(Debug)]
pub struct Framer<T: Transport> {
    transport: T,
    config: Config,
    discipline: Discipline,
}
impl<T: Transport> Framer<T> {
    pub fn new(transport: T, config: Config, discipline: Discipline) -> Self {
        Framer {
            transport,
            config,
            discipline,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn txrx_level(&self) -> log::Level {
        if self.config.print_txrx {
            log::Level::Info
        } else {
            log::Level::Trace
        }
    }

    pub fn send(&mut self, frame: &CommandFrame) -> Result<()> {
        log::log!(self.txrx_level(), "TX: {}", HexBytes(frame.as_bytes()));
        self.transport.send(frame.as_bytes())
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let data = self.transport.receive(max_len)?;
        log::log!(self.txrx_level(), "RX: {}", HexBytes(&data));
        Ok(data)
    }

    /// Sends `frame` and waits for "OK".
    pub fn command(&mut self, frame: &CommandFrame) -> Result<()> {
        self.send(frame)?;
        self.expect_ok()
    }

    /// Sends `frame` and waits for `len` bytes of data.
    pub fn query(&mut self, frame: &CommandFrame, len: usize) -> Result<Vec<u8>> {
        self.send(frame)?;
        self.expect_data(len)
    }

    /// Sends `frame` and waits for a single status byte.
    pub fn query_status(&mut self, frame: &CommandFrame) -> Result<u8> {
        self.send(frame)?;
        self.expect_status()
    }

    /// Waits for the two bytes "OK".
    pub fn expect_ok(&mut self) -> Result<()> {
        match self.discipline {
            Discipline::Strict => {
                let response = self.receive(MAX_PACKET_SIZE)?;
                match response.len() {
                    0 => Err(PicprogError::AckMissing),
                    2 if response == OK => Ok(()),
                    2 => Err(PicprogError::AckMismatch([response[0], response[1]])),
                    n => Err(PicprogError::AckLength(n)),
                }
            }
            Discipline::SideChannel => loop {
                let response = self.next_frame()?;
                if response == OK {
                    return Ok(());
                }
                if response == FAIL {
                    return Err(PicprogError::Fail);
                }
                if response.len() == 2 {
                    log::warn!("Waiting for an OK, but got {}", HexBytes(&response));
                    continue;
                }
                log::warn!(
                    "Waiting for an OK, but got {} bytes rather than 2: {}",
                    response.len(),
                    HexBytes(&response)
                );
            },
        }
    }

    /// Waits for exactly `len` bytes.
    pub fn expect_data(&mut self, len: usize) -> Result<Vec<u8>> {
        match self.discipline {
            Discipline::Strict => {
                let data = self.receive(len)?;
                if data.len() != len {
                    return Err(PicprogError::FrameLength {
                        expected: len,
                        actual: data.len(),
                    });
                }
                Ok(data)
            }
            Discipline::SideChannel => loop {
                let data = self.next_frame()?;
                if data.len() == len {
                    return Ok(data);
                }
                log::warn!(
                    "Expected {} bytes but got {}: ({})",
                    len,
                    data.len(),
                    HexBytes(&data)
                );
            },
        }
    }

    /// Waits for a single status byte.
    pub fn expect_status(&mut self) -> Result<u8> {
        match self.discipline {
            Discipline::Strict => {
                let data = self.receive(MAX_PACKET_SIZE)?;
                match data.as_slice() {
                    [status] => Ok(*status),
                    _ => Err(PicprogError::FrameLength {
                        expected: 1,
                        actual: data.len(),
                    }),
                }
            }
            Discipline::SideChannel => loop {
                let data = self.next_frame()?;
                if let [status] = data.as_slice() {
                    return Ok(*status);
                }
                log::warn!(
                    "Waiting for a result, but got {} bytes rather than 1: {}",
                    data.len(),
                    HexBytes(&data)
                );
            },
        }
    }

    /// Reads until a non-empty frame that is not a diagnostic arrives.
    fn next_frame(&mut self) -> Result<Vec<u8>> {
        let mut idle = 0u32;
        loop {
            let frame = self.receive(MAX_PACKET_SIZE)?;
            if frame.is_empty() {
                idle += 1;
                if let Some(limit) = self.config.idle_limit {
                    if idle >= limit {
                        return Err(PicprogError::IdleTimeout(idle));
                    }
                }
                log::debug!("Got 0 bytes, reading again");
                continue;
            }
            if let Some(diagnostic) = Diagnostic::parse(&frame) {
                log::info!("{}", diagnostic);
                continue;
            }
            return Ok(frame);
        }
    }
}

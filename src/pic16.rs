//! PIC16F protocol engine.
//!
//! The target bus is 14 bits wide and addressed in words. The hex file
//! holds each word as two little-endian bytes, so every file address is
//! twice the device address.

use std::thread::sleep;

use crate::cmd::{CommandFrame, Pic16CmdId, PicprogError, Result};
use crate::config::Config;
use crate::family::{
    finish, DeviceFamily, DeviceId, DeviceModel, DumpLayout, DumpSection, FamilyDescriptor,
    Programmer, Stage, VerifyException,
};
use crate::framing::{Discipline, Framer};
use crate::hex::{HexImage, Segment};
use crate::transport::Transport;

/// First word address past program memory.
pub const CONFIG_SPACE: u16 = 0x2000;
/// Word address of the configuration word.
pub const CONFIG_WORD: u16 = 0x2007;
/// Byte offset of the device ID within the first 16 bytes of config space.
const DEVICE_ID_OFFSET: usize = 12;

pub static DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    family: DeviceFamily::Pic16,
    name: "PIC16F",
    discipline: Discipline::Strict,
    id_mask: 0x3fe0,
    revision_shift: 0,
    revision_mask: 0x1f,
    id_digits: 4,
    models: &[
        DeviceModel {
            id: 0x1040,
            name: "16F627A",
        },
        DeviceModel {
            id: 0x1060,
            name: "16F628A",
        },
        DeviceModel {
            id: 0x1100,
            name: "16F648A",
        },
    ],
    exceptions: &[VerifyException::OddByteMask(0x3f)],
};

/// Device (word) address of a segment.
fn device_address(segment: &Segment) -> u32 {
    segment.address / 2
}

#[derive(Debug)]
pub struct Pic16<T: Transport> {
    framer: Framer<T>,
}
impl<T: Transport> Pic16<T> {
    pub fn new(transport: T, config: Config) -> Self {
        Pic16 {
            framer: Framer::new(transport, config, DESCRIPTOR.discipline),
        }
    }

    pub fn into_inner(self) -> T {
        self.framer.into_inner()
    }

    /// Turns on Vdd (+5V) on the target.
    pub fn vdd_on(&mut self) -> Result<()> {
        self.framer.command(&CommandFrame::bare(Pic16CmdId::VddOn as u8))
    }

    /// Turns on Vpp (+12V) on the target.
    pub fn vpp_on(&mut self) -> Result<()> {
        self.framer.command(&CommandFrame::bare(Pic16CmdId::VppOn as u8))
    }

    /// Turns off Vpp and Vdd. Vdd must go no later than 100ns after Vpp, so
    /// the firmware turns both off at once.
    pub fn vpp_vdd_off(&mut self) -> Result<()> {
        self.framer.command(&CommandFrame::bare(Pic16CmdId::VppVddOff as u8))
    }

    /// Reads `len` bytes starting at word address `addr`.
    pub fn read_bytes(&mut self, addr: u16, len: u8) -> Result<Vec<u8>> {
        let frame = CommandFrame::pic16_read_bytes(addr, len)?;
        self.framer.query(&frame, len as usize)
    }

    /// Programs `data` starting at word address `addr`.
    pub fn program_bytes(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        let frame = CommandFrame::pic16_program_bytes(addr, data)?;
        self.framer.command(&frame)
    }

    pub fn program_config_word(&mut self, word: u16) -> Result<()> {
        self.framer.command(&CommandFrame::pic16_program_config_word(word))
    }

    /// Runs `f` with programming voltages applied, powering down afterwards
    /// whatever the outcome.
    fn powered<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        Stage::PowerApplied.enter(DeviceFamily::Pic16);
        let result = self.vdd_on().and_then(|_| self.vpp_on()).and_then(|_| {
            sleep(self.framer.config().settle_delay);
            f(self)
        });
        let off = self.vpp_vdd_off();
        Stage::Idle.enter(DeviceFamily::Pic16);
        finish(result, off)
    }

    /// Programs code segments, then the configuration word. Returns the
    /// segments written, in the order they should be verified.
    fn program_segments(&mut self, image: &HexImage) -> Result<Vec<Segment>> {
        Stage::Programming.enter(DeviceFamily::Pic16);
        let mut programmed = Vec::with_capacity(image.len());
        let mut config = Vec::new();

        for segment in image {
            let addr = device_address(segment);
            if addr < CONFIG_SPACE as u32 {
                self.program_bytes(addr as u16, segment.data())?;
                programmed.push(*segment);
            } else if addr == CONFIG_WORD as u32 {
                config.push(*segment);
            } else {
                log::error!(
                    "EEPROM data not supported, skipping {} bytes at {:06x}",
                    segment.len(),
                    segment.address
                );
            }
        }

        for segment in config {
            let data = segment.data();
            let word = u16::from_le_bytes([data[0], data.get(1).copied().unwrap_or(0xff)]);
            log::debug!("Configuration word {:04x}", word);
            self.program_config_word(word)?;
            programmed.push(segment);
        }

        Ok(programmed)
    }

    /// Reads back every segment. A mismatch stops checking that segment but
    /// not the others.
    fn verify(&mut self, segments: &[Segment]) -> Result<()> {
        Stage::Verifying.enter(DeviceFamily::Pic16);
        let mut mismatches = 0;
        for segment in segments {
            let addr = device_address(segment) as u16;
            let actual = self.read_bytes(addr, segment.len() as u8)?;
            let mismatch = DESCRIPTOR.first_mismatch(segment.address, segment.data(), &actual);
            if let Some(mismatch) = mismatch {
                log::error!("{}", mismatch);
                mismatches += 1;
            }
        }

        if mismatches > 0 {
            return Err(PicprogError::VerifyFailed { mismatches });
        }
        Ok(())
    }

    /// Reads `words` words from word address `addr`, 8 words at a time.
    fn dump_window(&mut self, title: &'static str, addr: u16, words: u16) -> Result<DumpSection> {
        let mut data = Vec::with_capacity(words as usize * 2);
        for word in (0..words).step_by(8) {
            data.extend(self.read_bytes(addr + word, 16)?);
        }
        Ok(DumpSection {
            title,
            address: addr as u32,
            layout: DumpLayout::Words16,
            data,
        })
    }
}

impl<T: Transport> Programmer for Pic16<T> {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Pic16
    }

    fn erase(&mut self) -> Result<()> {
        self.powered(|pic| {
            Stage::Erasing.enter(DeviceFamily::Pic16);
            pic.framer.command(&CommandFrame::bare(Pic16CmdId::Erase as u8))
        })?;
        log::info!("Erased!");
        Ok(())
    }

    fn program(&mut self, image: &HexImage) -> Result<()> {
        self.powered(|pic| {
            let programmed = pic.program_segments(image)?;
            pic.verify(&programmed)
        })?;
        log::info!("Programmed!");
        Ok(())
    }

    fn read_device_id(&mut self) -> Result<DeviceId> {
        let config = self.powered(|pic| {
            Stage::Reading.enter(DeviceFamily::Pic16);
            pic.read_bytes(CONFIG_SPACE, 16)
        })?;
        let raw = u16::from_le_bytes([config[DEVICE_ID_OFFSET], config[DEVICE_ID_OFFSET + 1]]);
        Ok(DESCRIPTOR.decode_id(raw as u32))
    }

    fn dump(&mut self) -> Result<Vec<DumpSection>> {
        self.powered(|pic| {
            Stage::Reading.enter(DeviceFamily::Pic16);
            Ok(vec![
                pic.dump_window("Program space", 0x0000, 0x40)?,
                pic.dump_window("Configuration words", CONFIG_SPACE, 0x08)?,
            ])
        })
    }
}

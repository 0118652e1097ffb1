//! PIC18F protocol engine. Addresses are 24 bit byte addresses.

use std::ops::Range;
use std::thread::sleep;

use crate::cmd::{CommandFrame, Pic18CmdId, PicprogError, Result};
use crate::config::Config;
use crate::family::{
    finish, DeviceFamily, DeviceId, DeviceModel, DumpLayout, DumpSection, FamilyDescriptor,
    Programmer, Stage, VerifyException,
};
use crate::framing::{Discipline, Framer};
use crate::hex::{HexImage, Segment};
use crate::transport::Transport;

/// Configuration bytes, programmed one at a time after everything else.
pub const CONFIG_BYTES: Range<u32> = 0x300000..0x30000d;
/// Device ID window, read only.
pub const DEVICE_ID: Range<u32> = 0x3ffffe..0x400000;

pub static DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    family: DeviceFamily::Pic18,
    name: "PIC18F",
    discipline: Discipline::Strict,
    id_mask: 0xffe0,
    revision_shift: 0,
    revision_mask: 0x1f,
    id_digits: 4,
    models: &[
        DeviceModel { id: 0x1200, name: "18F4550" },
        DeviceModel { id: 0x1220, name: "18F4450" },
        DeviceModel { id: 0x1240, name: "18F2550" },
        DeviceModel { id: 0x1260, name: "18F2450" },
        DeviceModel { id: 0x5c00, name: "18F45K50" },
        DeviceModel { id: 0x5c20, name: "18F25K50" },
        DeviceModel { id: 0x5c60, name: "18F24K50" },
        DeviceModel { id: 0x5d20, name: "18F26K50" },
        DeviceModel { id: 0x5d60, name: "18F46K50" },
        DeviceModel { id: 0x1e00, name: "18F1230" },
        DeviceModel { id: 0x1e20, name: "18F1330" },
        DeviceModel { id: 0x1ee0, name: "18F1330-ICD" },
    ],
    // CONFIG3L and CONFIG4H are unimplemented and read as zero.
    exceptions: &[
        VerifyException::Ignore {
            start: 0x300004,
            end: 0x300005,
        },
        VerifyException::Ignore {
            start: 0x300007,
            end: 0x300008,
        },
    ],
};

/// Where a segment goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Code,
    Config,
    DeviceId,
    Unsupported,
}

fn destination(segment: &Segment) -> Destination {
    match segment.address {
        a if a < CONFIG_BYTES.start => Destination::Code,
        a if CONFIG_BYTES.contains(&a) => Destination::Config,
        a if DEVICE_ID.contains(&a) => Destination::DeviceId,
        _ => Destination::Unsupported,
    }
}

#[derive(Debug)]
pub struct Pic18<T: Transport> {
    framer: Framer<T>,
}
impl<T: Transport> Pic18<T> {
    pub fn new(transport: T, config: Config) -> Self {
        Pic18 {
            framer: Framer::new(transport, config, DESCRIPTOR.discipline),
        }
    }

    pub fn into_inner(self) -> T {
        self.framer.into_inner()
    }

    fn bare(&mut self, cmd_id: Pic18CmdId) -> Result<()> {
        self.framer.command(&CommandFrame::bare(cmd_id as u8))
    }

    /// Turns on Vdd (+5V) on the target.
    pub fn vdd_on(&mut self) -> Result<()> {
        self.bare(Pic18CmdId::VddOn)
    }

    /// Turns on Vpp (+12V) on the target.
    pub fn vpp_on(&mut self) -> Result<()> {
        self.bare(Pic18CmdId::VppOn)
    }

    pub fn vpp_vdd_off(&mut self) -> Result<()> {
        self.bare(Pic18CmdId::VppVddOff)
    }

    pub fn read_bytes(&mut self, addr: u32, len: u8) -> Result<Vec<u8>> {
        let frame = CommandFrame::pic18_read_bytes(addr, len)?;
        self.framer.query(&frame, len as usize)
    }

    pub fn program_bytes(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let frame = CommandFrame::pic18_program_bytes(addr, data)?;
        self.framer.command(&frame)
    }

    /// Programs one configuration byte, `addr` in 0x300000..0x30000d.
    pub fn program_config_byte(&mut self, addr: u32, byte: u8) -> Result<()> {
        self.framer.command(&CommandFrame::pic18_program_config_byte(addr, byte))
    }

    fn powered<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        Stage::PowerApplied.enter(DeviceFamily::Pic18);
        let result = self.vdd_on().and_then(|_| self.vpp_on()).and_then(|_| {
            sleep(self.framer.config().settle_delay);
            f(self)
        });
        let off = self.vpp_vdd_off();
        Stage::Idle.enter(DeviceFamily::Pic18);
        finish(result, off)
    }

    fn program_segments(&mut self, image: &HexImage) -> Result<Vec<Segment>> {
        Stage::Programming.enter(DeviceFamily::Pic18);
        let mut programmed = Vec::with_capacity(image.len());
        let mut config = Vec::new();

        for segment in image {
            match destination(segment) {
                Destination::Code => {
                    // The firmware does not take single byte writes.
                    if let [byte] = segment.data() {
                        self.program_bytes(segment.address, &[*byte, 0xff])?;
                    } else {
                        self.program_bytes(segment.address, segment.data())?;
                    }
                    programmed.push(*segment);
                }
                Destination::Config => config.push(*segment),
                Destination::DeviceId => {
                    log::debug!("Not programming device ID at {:06x}", segment.address)
                }
                Destination::Unsupported => log::error!(
                    "EEPROM data not supported, skipping {} bytes at {:06x}",
                    segment.len(),
                    segment.address
                ),
            }
        }

        for segment in config {
            for (addr, &byte) in (segment.address..).zip(segment.data()) {
                self.program_config_byte(addr, byte)?;
            }
            programmed.push(segment);
        }

        Ok(programmed)
    }

    fn verify(&mut self, segments: &[Segment]) -> Result<()> {
        Stage::Verifying.enter(DeviceFamily::Pic18);
        let mut mismatches = 0;
        for segment in segments {
            let actual = self.read_bytes(segment.address, segment.len() as u8)?;
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

    fn dump_window(&mut self, title: &'static str, addr: u32, len: u32) -> Result<DumpSection> {
        let mut data = Vec::with_capacity(len as usize);
        for offset in (0..len).step_by(16) {
            data.extend(self.read_bytes(addr + offset, 16)?);
        }
        Ok(DumpSection {
            title,
            address: addr,
            layout: DumpLayout::Bytes,
            data,
        })
    }
}

impl<T: Transport> Programmer for Pic18<T> {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Pic18
    }

    fn erase(&mut self) -> Result<()> {
        self.powered(|pic| {
            Stage::Erasing.enter(DeviceFamily::Pic18);
            pic.bare(Pic18CmdId::Erase)
        })?;
        log::info!("Erased!");
        Ok(())
    }

    /// Verification only runs once every segment has been written; a failed
    /// write ends the operation.
    fn program(&mut self, image: &HexImage) -> Result<()> {
        self.powered(|pic| {
            let programmed = pic.program_segments(image)?;
            pic.verify(&programmed)
        })?;
        log::info!("Programmed!");
        Ok(())
    }

    fn read_device_id(&mut self) -> Result<DeviceId> {
        let id = self.powered(|pic| {
            Stage::Reading.enter(DeviceFamily::Pic18);
            pic.read_bytes(DEVICE_ID.start, 2)
        })?;
        let raw = u16::from_le_bytes([id[0], id[1]]);
        Ok(DESCRIPTOR.decode_id(raw as u32))
    }

    fn dump(&mut self) -> Result<Vec<DumpSection>> {
        self.powered(|pic| {
            Stage::Reading.enter(DeviceFamily::Pic18);
            Ok(vec![
                pic.dump_window("Program memory", 0x000000, 0x400)?,
                pic.dump_window("Program memory", 0x000800, 0x1000)?,
                pic.dump_window("User ID words", 0x200000, 0x10)?,
                pic.dump_window("Configuration words", CONFIG_BYTES.start, 0x10)?,
                pic.dump_window("Device ID words", 0x3ffff0, 0x10)?,
            ])
        })
    }
}

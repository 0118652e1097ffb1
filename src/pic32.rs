//! PIC32MX protocol engine.
//!
//! The programmer drives the target over its debug port. Flash is written a
//! row at a time: the row is staged in target SRAM in 32 byte chunks and then
//! committed with a single command. Memory constants are those of the
//! PIC32MX220F032B.

use bitflags::bitflags;

use crate::cmd::{CommandFrame, Pic32CmdId, PicprogError, Result, SEND_WORDS_CHUNK};
use crate::config::Config;
use crate::family::{
    finish, DeviceFamily, DeviceId, DeviceModel, DumpLayout, DumpSection, FamilyDescriptor,
    Programmer, Stage, VerifyException,
};
use crate::framing::{Discipline, Framer, MAX_PACKET_SIZE};
use crate::hex::HexImage;
use crate::transport::Transport;

/// Physical address of the device ID word.
pub const DEVICE_ID_ADDRESS: u32 = 0xbf80f220;

pub const DEVICE_CONFIG_ADDRESS_0: u32 = 0x1fc00bfc;
pub const DEVICE_CONFIG_ADDRESS_1: u32 = 0x1fc00bf8;
pub const DEVICE_CONFIG_ADDRESS_2: u32 = 0x1fc00bf4;
pub const DEVICE_CONFIG_ADDRESS_3: u32 = 0x1fc00bf0;

/// Offset of an image address within its flash region.
const REGION_OFFSET_MASK: u32 = 0x000fffff;

bitflags! {
    /// The Microchip TAP status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MchpStatus: u8 {
        const DEVRST = 0x01;
        const FAEN = 0x02;
        const FCBUSY = 0x04;
        const CFGRDY = 0x08;
        const NVMERR = 0x20;
        const CPS = 0x80;
    }
}
impl MchpStatus {
    /// Ready for commands: flash controller idle and configuration read.
    pub fn is_ready(self) -> bool {
        !self.contains(MchpStatus::FCBUSY) && self.contains(MchpStatus::CFGRDY)
    }

    fn report(self, what: &str) {
        let raw = self.bits();
        if self.contains(MchpStatus::NVMERR) {
            log::error!("{}: NVMERR was asserted in MCHP_STATUS ({:02x})", what, raw);
        }
        if self.contains(MchpStatus::FCBUSY) {
            log::error!("{}: FCBUSY was asserted in MCHP_STATUS ({:02x})", what, raw);
        }
        if !self.contains(MchpStatus::CFGRDY) {
            log::error!("{}: CFGRDY was NOT asserted in MCHP_STATUS ({:02x})", what, raw);
        }
    }
}

/// A programmable flash window of the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    pub name: &'static str,
    pub start: u32,
    pub size: usize,
    /// Bytes programmed in one go.
    pub row_size: usize,
}

/// Program flash memory.
pub const PFM: FlashRegion = FlashRegion {
    name: "PFM",
    start: 0x1d000000,
    size: 0x20000,
    row_size: 0x80,
};

/// Boot flash memory.
pub const BFM: FlashRegion = FlashRegion {
    name: "BFM",
    start: 0x1fc00000,
    size: 0x0c00,
    row_size: 0x80,
};

pub static DESCRIPTOR: FamilyDescriptor = FamilyDescriptor {
    family: DeviceFamily::Pic32,
    name: "PIC32MX",
    discipline: Discipline::SideChannel,
    id_mask: 0x0fffffff,
    revision_shift: 28,
    revision_mask: 0xf,
    id_digits: 8,
    models: &[
        DeviceModel { id: 0x04A07053, name: "PIC32MX110F016B" },
        DeviceModel { id: 0x04A06053, name: "PIC32MX120F032B" },
        DeviceModel { id: 0x04D07053, name: "PIC32MX130F064B" },
        DeviceModel { id: 0x04D06053, name: "PIC32MX150F128B" },
        DeviceModel { id: 0x04A01053, name: "PIC32MX210F016B" },
        DeviceModel { id: 0x04A00053, name: "PIC32MX220F032B" },
        DeviceModel { id: 0x04D00053, name: "PIC32MX250F128B" },
        DeviceModel { id: 0x04D01053, name: "PIC32MX230F063B" },
    ],
    // DEVCFG0 always reads with its top bit clear, and JTAGEN cannot be
    // programmed to 0.
    exceptions: &[VerifyException::Ignore {
        start: DEVICE_CONFIG_ADDRESS_0,
        end: DEVICE_CONFIG_ADDRESS_0 + 4,
    }],
};

/// Contents of both flash regions as they should end up on the target.
/// Bytes not in the image are left erased (0xff).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    pub pfm: Vec<u8>,
    pub bfm: Vec<u8>,
}
impl FlashImage {
    pub fn assemble(image: &HexImage) -> Result<Self> {
        let mut flash = FlashImage {
            pfm: vec![0xff; PFM.size],
            bfm: vec![0xff; BFM.size],
        };
        for segment in image {
            let region = if segment.address >= BFM.start {
                &mut flash.bfm
            } else {
                &mut flash.pfm
            };
            let offset = (segment.address & REGION_OFFSET_MASK) as usize;
            region
                .get_mut(offset..offset + segment.len())
                .ok_or(PicprogError::AddressOutOfRange(segment.address))?
                .copy_from_slice(segment.data());
        }
        Ok(flash)
    }

    /// The buffer backing `region`, if it is one of [`PFM`] or [`BFM`].
    pub fn region_data(&self, region: &FlashRegion) -> Option<&[u8]> {
        match *region {
            r if r == PFM => Some(self.pfm.as_slice()),
            r if r == BFM => Some(self.bfm.as_slice()),
            _ => None,
        }
    }

    /// Rows of `region` holding anything other than 0xff, with their target
    /// addresses. A region not backed by the image has no rows.
    pub fn rows(&self, region: &FlashRegion) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        let data = self.region_data(region).unwrap_or_default();
        let start = region.start;
        let row_size = region.row_size;
        data.chunks(row_size)
            .enumerate()
            .filter(|(_, row)| row.iter().any(|&b| b != 0xff))
            .map(move |(i, row)| (start + (i * row_size) as u32, row))
    }
}

#[derive(Debug)]
pub struct Pic32<T: Transport> {
    framer: Framer<T>,
}
impl<T: Transport> Pic32<T> {
    pub fn new(transport: T, config: Config) -> Self {
        Pic32 {
            framer: Framer::new(transport, config, DESCRIPTOR.discipline),
        }
    }

    pub fn into_inner(self) -> T {
        self.framer.into_inner()
    }

    /// Checks that the target is powered and ready.
    pub fn check_device(&mut self) -> Result<MchpStatus> {
        let raw = self
            .framer
            .query_status(&CommandFrame::bare(Pic32CmdId::CheckDevice as u8))?;
        let status = MchpStatus::from_bits_retain(raw);
        if status.is_ready() {
            return Ok(status);
        }

        if raw == 0xff {
            log::error!(
                "MCHP_STATUS was 0xff. That usually means the PIC32MX is not powered"
            );
            return Err(PicprogError::NotPowered(raw));
        }
        status.report("CheckDevice");
        Err(PicprogError::DeviceStatus { status: raw })
    }

    /// Bulk erases the target.
    pub fn chip_erase(&mut self) -> Result<()> {
        let raw = self
            .framer
            .query_status(&CommandFrame::bare(Pic32CmdId::Erase as u8))?;
        let status = MchpStatus::from_bits_retain(raw);
        if status.is_ready() && !status.contains(MchpStatus::NVMERR) {
            return Ok(());
        }

        status.report("Erase");
        Err(PicprogError::EraseFailed { status: raw })
    }

    pub fn enter_programming_mode(&mut self) -> Result<()> {
        let frame = CommandFrame::bare(Pic32CmdId::EnterSerialExecutionMode as u8);
        self.framer.command(&frame)?;
        Stage::ProgrammingModeEntered.enter(DeviceFamily::Pic32);
        Ok(())
    }

    pub fn exit_programming_mode(&mut self) -> Result<()> {
        let frame = CommandFrame::bare(Pic32CmdId::ExitProgrammingMode as u8);
        self.framer.command(&frame)?;
        Stage::ProgrammingModeExited.enter(DeviceFamily::Pic32);
        Ok(())
    }

    /// Reads `count` words starting at `addr`.
    pub fn read_words(&mut self, addr: u32, count: usize) -> Result<Vec<u32>> {
        let max_words = MAX_PACKET_SIZE / 4;
        let mut words = Vec::with_capacity(count);
        let mut addr = addr;
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(max_words);
            let frame = CommandFrame::pic32_read_words(addr, n as u8)?;
            let data = self.framer.query(&frame, n * 4)?;
            words.extend(
                data.chunks_exact(4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])),
            );
            addr += (n * 4) as u32;
            remaining -= n;
        }
        Ok(words)
    }

    /// Reads `len` bytes at any alignment by reading the covering words.
    pub fn read_bytes(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let start = addr & !3;
        let end = (addr + len as u32 + 3) & !3;
        let words = self.read_words(start, ((end - start) / 4) as usize)?;
        let skip = (addr - start) as usize;
        Ok(words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .skip(skip)
            .take(len)
            .collect())
    }

    /// Stages 32 bytes at `offset` in the target's row buffer.
    pub fn send_words(&mut self, offset: u8, data: [u8; SEND_WORDS_CHUNK]) -> Result<()> {
        let frame = CommandFrame::pic32_send_words(offset, data)?;
        self.framer.command(&frame)
    }

    /// Commits the staged row to flash at `addr`.
    pub fn program_words(&mut self, addr: u32) -> Result<()> {
        let frame = CommandFrame::pic32_program_words(addr)?;
        self.framer.command(&frame)
    }

    fn program_region(&mut self, flash: &FlashImage, region: &FlashRegion) -> Result<()> {
        let mut rows = 0;
        for (addr, row) in flash.rows(region) {
            for (i, chunk) in row.chunks_exact(SEND_WORDS_CHUNK).enumerate() {
                let mut data = [0u8; SEND_WORDS_CHUNK];
                data.copy_from_slice(chunk);
                self.send_words((i * SEND_WORDS_CHUNK) as u8, data)?;
            }
            self.program_words(addr)?;
            rows += 1;
        }
        log::debug!("Programmed {} rows of {}", rows, region.name);
        Ok(())
    }

    /// Compares every segment of `image` with the target, stopping at the
    /// first mismatch.
    fn verify(&mut self, image: &HexImage) -> Result<()> {
        Stage::Verifying.enter(DeviceFamily::Pic32);
        for segment in image {
            let actual = self.read_bytes(segment.address, segment.len())?;
            let mismatch = DESCRIPTOR.first_mismatch(segment.address, segment.data(), &actual);
            if let Some(mismatch) = mismatch {
                log::error!("{}", mismatch);
                return Err(PicprogError::Verify {
                    address: mismatch.address,
                    expected: mismatch.expected,
                    actual: mismatch.actual,
                });
            }
        }
        Ok(())
    }

    /// Checks the device, optionally erases it, and runs `f` in programming
    /// mode. Programming mode is always left again.
    fn session<R>(&mut self, erase: bool, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.check_device()?;
        if erase {
            Stage::Erasing.enter(DeviceFamily::Pic32);
            self.chip_erase()?;
        }
        let result = self.enter_programming_mode().and_then(|_| f(self));
        let exit = self.exit_programming_mode();
        Stage::Idle.enter(DeviceFamily::Pic32);
        finish(result, exit)
    }

    fn dump_window(&mut self, title: &'static str, addr: u32, len: usize) -> Result<DumpSection> {
        let mut data = Vec::with_capacity(len);
        for offset in (0..len).step_by(16) {
            let count = ((len - offset).min(16) + 3) / 4;
            for word in self.read_words(addr + offset as u32, count)? {
                data.extend(word.to_le_bytes());
            }
        }
        Ok(DumpSection {
            title,
            address: addr,
            layout: DumpLayout::Words32,
            data,
        })
    }
}

impl<T: Transport> Programmer for Pic32<T> {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Pic32
    }

    fn erase(&mut self) -> Result<()> {
        self.session(true, |_| Ok(()))?;
        log::info!("Erased!");
        Ok(())
    }

    fn program(&mut self, image: &HexImage) -> Result<()> {
        let flash = FlashImage::assemble(image)?;
        self.session(true, |pic| {
            Stage::Programming.enter(DeviceFamily::Pic32);
            pic.program_region(&flash, &PFM)?;
            pic.program_region(&flash, &BFM)?;
            pic.verify(image)
        })?;
        log::info!("Programmed!");
        Ok(())
    }

    fn read_device_id(&mut self) -> Result<DeviceId> {
        let words = self.session(false, |pic| {
            Stage::Reading.enter(DeviceFamily::Pic32);
            pic.read_words(DEVICE_ID_ADDRESS, 1)
        })?;
        Ok(DESCRIPTOR.decode_id(words[0]))
    }

    fn dump(&mut self) -> Result<Vec<DumpSection>> {
        self.session(false, |pic| {
            Stage::Reading.enter(DeviceFamily::Pic32);
            Ok(vec![
                pic.dump_window("Program Flash Memory", PFM.start, 256)?,
                pic.dump_window("Boot Flash Memory", BFM.start, 256)?,
                pic.dump_window("Configuration words", DEVICE_CONFIG_ADDRESS_3, 0x10)?,
                pic.dump_window("Device ID", DEVICE_ID_ADDRESS, 4)?,
            ])
        })
    }
}

//! What differs between the supported device families, and the
//! [`Programmer`] interface all three engines implement.

use std::fmt;
use std::str::FromStr;

use crate::cmd::Result;
use crate::config::Config;
use crate::framing::Discipline;
use crate::hex::HexImage;
use crate::pic16::Pic16;
use crate::pic18::Pic18;
use crate::pic32::Pic32;
use crate::transport::Transport;

/// The family of the target microcontroller. Exactly one is chosen per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    /// PIC16F parts, 14 bit program words.
    Pic16,
    /// PIC18F parts.
    Pic18,
    /// PIC32MX parts.
    Pic32,
}
impl DeviceFamily {
    pub fn descriptor(self) -> &'static FamilyDescriptor {
        match self {
            DeviceFamily::Pic16 => &crate::pic16::DESCRIPTOR,
            DeviceFamily::Pic18 => &crate::pic18::DESCRIPTOR,
            DeviceFamily::Pic32 => &crate::pic32::DESCRIPTOR,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor().name)
    }
}

impl FromStr for DeviceFamily {
    type Err = String;

    fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "16" | "pic16" | "pic16f" => Ok(DeviceFamily::Pic16),
            "18" | "pic18" | "pic18f" => Ok(DeviceFamily::Pic18),
            "32" | "pic32" | "pic32mx" => Ok(DeviceFamily::Pic32),
            _ => Err(format!("unknown device family \"{}\"", s)),
        }
    }
}

/// A part recognised by its device ID.
#[derive(Debug, Clone, Copy)]
pub struct DeviceModel {
    pub id: u32,
    pub name: &'static str,
}

/// Target bytes that do not read back exactly as programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyException {
    /// Only the bits in the mask of odd addressed bytes exist on the target.
    OddByteMask(u8),
    /// Bytes in `start..end` are not compared at all.
    Ignore { start: u32, end: u32 },
}

/// Per family constants the engines and the generic code are parameterised by.
#[derive(Debug)]
pub struct FamilyDescriptor {
    pub family: DeviceFamily,
    pub name: &'static str,
    pub discipline: Discipline,
    /// Bits of the raw device ID that identify the model.
    pub id_mask: u32,
    pub revision_shift: u32,
    pub revision_mask: u32,
    /// Hex digits the raw device ID is printed with.
    pub id_digits: usize,
    pub models: &'static [DeviceModel],
    pub exceptions: &'static [VerifyException],
}
impl FamilyDescriptor {
    pub fn decode_id(&self, raw: u32) -> DeviceId {
        let model = self
            .models
            .iter()
            .find(|m| m.id == raw & self.id_mask)
            .map(|m| m.name);
        DeviceId {
            family: self.family,
            raw,
            model,
            revision: (raw >> self.revision_shift) & self.revision_mask,
        }
    }

    /// Whether `actual` read back from `address` matches the programmed
    /// `expected` byte.
    pub fn matches(&self, address: u32, expected: u8, actual: u8) -> bool {
        let mut mask = 0xff;
        for exception in self.exceptions {
            match *exception {
                VerifyException::OddByteMask(bits) if address % 2 == 1 => mask &= bits,
                VerifyException::Ignore { start, end } if (start..end).contains(&address) => {
                    return true
                }
                _ => {}
            }
        }
        expected & mask == actual & mask
    }

    /// First byte of `actual` that does not match `expected`.
    pub fn first_mismatch(&self, address: u32, expected: &[u8], actual: &[u8]) -> Option<Mismatch> {
        expected
            .iter()
            .zip(actual)
            .enumerate()
            .map(|(i, (&e, &a))| (address + i as u32, e, a))
            .find(|&(address, e, a)| !self.matches(address, e, a))
            .map(|(address, expected, actual)| Mismatch {
                address,
                expected,
                actual,
            })
    }
}

/// A byte that did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub address: u32,
    pub expected: u8,
    pub actual: u8,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Verification Error: Byte {:06x} should be {:02x}, but reads as {:02x}",
            self.address, self.expected, self.actual
        )
    }
}

/// A decoded device ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub family: DeviceFamily,
    pub raw: u32,
    pub model: Option<&'static str>,
    pub revision: u32,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.family.descriptor().id_digits;
        write!(f, "Dev_ID : 0x{:0digits$x}", self.raw, digits = digits)?;
        match self.model {
            Some(name) => write!(f, ", a {} rev {}.", name, self.revision),
            None => write!(f, ", an unknown part."),
        }
    }
}

/// How a dumped memory window is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpLayout {
    /// Little-endian 16 bit words, addresses in words.
    Words16,
    /// Single bytes.
    Bytes,
    /// Little-endian 32 bit words.
    Words32,
}

/// A window of target memory read by a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSection {
    pub title: &'static str,
    pub address: u32,
    pub layout: DumpLayout,
    pub data: Vec<u8>,
}

impl fmt::Display for DumpSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.title)?;
        for (line, chunk) in self.data.chunks(16).enumerate() {
            let offset = (line * 16) as u32;
            match self.layout {
                DumpLayout::Words16 => {
                    write!(f, "{:06x} :", self.address + offset / 2)?;
                    for (i, word) in chunk.chunks(2).enumerate() {
                        let sep = if i == 4 { "   " } else { " " };
                        let hi = word.get(1).copied().unwrap_or(0);
                        write!(f, "{}{:02x}{:02x}", sep, hi, word[0])?;
                    }
                }
                DumpLayout::Bytes => {
                    write!(f, "{:06x} :", self.address + offset)?;
                    for (i, byte) in chunk.iter().enumerate() {
                        let sep = if i > 0 && i % 4 == 0 { "   " } else { " " };
                        write!(f, "{}{:02x}", sep, byte)?;
                    }
                }
                DumpLayout::Words32 => {
                    write!(f, "{:08x} :", self.address + offset)?;
                    for word in chunk.chunks_exact(4) {
                        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                        write!(f, " {:08x}", word)?;
                    }
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Where an operation is in its power/programming mode sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    PowerApplied,
    ProgrammingModeEntered,
    Erasing,
    Programming,
    Verifying,
    Reading,
    ProgrammingModeExited,
}
impl Stage {
    pub(crate) fn enter(self, family: DeviceFamily) {
        log::debug!("{}: {:?}", family, self);
    }
}

/// Combines the result of an operation with the result of the clean up
/// (power down or leaving programming mode) that always follows it. The
/// operation's own error wins.
pub(crate) fn finish<R>(result: Result<R>, cleanup: Result<()>) -> Result<R> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            log::warn!("Clean up after failure also failed: {}", cleanup);
            Err(e)
        }
    }
}

/// Operations the orchestrator runs against the target.
pub trait Programmer {
    fn family(&self) -> DeviceFamily;

    /// Bulk erases the target.
    fn erase(&mut self) -> Result<()>;

    /// Programs `image` into the target and verifies it.
    fn program(&mut self, image: &HexImage) -> Result<()>;

    fn read_device_id(&mut self) -> Result<DeviceId>;

    /// Reads the family's fixed set of interesting memory windows.
    fn dump(&mut self) -> Result<Vec<DumpSection>>;
}

/// The protocol engine for the selected family.
#[derive(Debug)]
pub enum Engine<T: Transport> {
    Pic16(Pic16<T>),
    Pic18(Pic18<T>),
    Pic32(Pic32<T>),
}
impl<T: Transport> Engine<T> {
    pub fn new(family: DeviceFamily, transport: T, config: Config) -> Self {
        match family {
            DeviceFamily::Pic16 => Engine::Pic16(Pic16::new(transport, config)),
            DeviceFamily::Pic18 => Engine::Pic18(Pic18::new(transport, config)),
            DeviceFamily::Pic32 => Engine::Pic32(Pic32::new(transport, config)),
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Engine::Pic16(e) => e.into_inner(),
            Engine::Pic18(e) => e.into_inner(),
            Engine::Pic32(e) => e.into_inner(),
        }
    }

    fn programmer(&mut self) -> &mut dyn Programmer {
        match self {
            Engine::Pic16(e) => e,
            Engine::Pic18(e) => e,
            Engine::Pic32(e) => e,
        }
    }
}

impl<T: Transport> Programmer for Engine<T> {
    fn family(&self) -> DeviceFamily {
        match self {
            Engine::Pic16(_) => DeviceFamily::Pic16,
            Engine::Pic18(_) => DeviceFamily::Pic18,
            Engine::Pic32(_) => DeviceFamily::Pic32,
        }
    }

    fn erase(&mut self) -> Result<()> {
        self.programmer().erase()
    }

    fn program(&mut self, image: &HexImage) -> Result<()> {
        self.programmer().program(image)
    }

    fn read_device_id(&mut self) -> Result<DeviceId> {
        self.programmer().read_device_id()
    }

    fn dump(&mut self) -> Result<Vec<DumpSection>> {
        self.programmer().dump()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pic16_masks_the_high_byte_of_each_word() {
        let desc = DeviceFamily::Pic16.descriptor();
        assert!(desc.matches(0x0001, 0xff, 0x3f));
        assert!(desc.matches(0x0001, 0x3f, 0xff));
        assert!(!desc.matches(0x0001, 0x3f, 0x3e));
        assert!(!desc.matches(0x0000, 0xff, 0x3f));
    }

    #[test]
    fn pic18_skips_unreadable_config_bytes() {
        let desc = DeviceFamily::Pic18.descriptor();
        assert!(desc.matches(0x300004, 0x12, 0x00));
        assert!(desc.matches(0x300007, 0x12, 0x00));
        assert!(!desc.matches(0x300005, 0x12, 0x00));
        assert_eq!(
            desc.first_mismatch(0x300003, &[1, 2, 3, 4, 5, 6], &[1, 0, 3, 4, 0, 0]),
            Some(Mismatch {
                address: 0x300008,
                expected: 6,
                actual: 0
            })
        );
    }

    #[test]
    fn pic32_ignores_devcfg0() {
        let desc = DeviceFamily::Pic32.descriptor();
        assert!(desc.matches(0x1fc00bff, 0xff, 0x7f));
        assert!(desc.matches(0x1fc00bfc, 0xff, 0x00));
        assert!(!desc.matches(0x1fc00bfb, 0xff, 0x7f));
    }

    #[test]
    fn device_ids_decode_with_revision() {
        let id = DeviceFamily::Pic16.descriptor().decode_id(0x1066);
        assert_eq!(id.model, Some("16F628A"));
        assert_eq!(id.revision, 6);
        assert_eq!(id.to_string(), "Dev_ID : 0x1066, a 16F628A rev 6.");

        let id = DeviceFamily::Pic18.descriptor().decode_id(0x5c07);
        assert_eq!(id.model, Some("18F45K50"));
        assert_eq!(id.revision, 7);

        let id = DeviceFamily::Pic32.descriptor().decode_id(0x14a0_0053);
        assert_eq!(id.model, Some("PIC32MX220F032B"));
        assert_eq!(id.revision, 1);
        assert_eq!(
            id.to_string(),
            "Dev_ID : 0x14a00053, a PIC32MX220F032B rev 1."
        );

        let id = DeviceFamily::Pic18.descriptor().decode_id(0x0000);
        assert_eq!(id.model, None);
        assert_eq!(id.to_string(), "Dev_ID : 0x0000, an unknown part.");
    }

    #[test]
    fn families_parse_from_cli_names() {
        assert_eq!("pic18".parse::<DeviceFamily>(), Ok(DeviceFamily::Pic18));
        assert_eq!("32".parse::<DeviceFamily>(), Ok(DeviceFamily::Pic32));
        assert!("pic24".parse::<DeviceFamily>().is_err());
    }

    #[test]
    fn dump_sections_print_like_the_device_memory() {
        let section = DumpSection {
            title: "Configuration words",
            address: 0x2000,
            layout: DumpLayout::Words16,
            data: (0..16).collect(),
        };
        assert_eq!(
            section.to_string(),
            "Configuration words:\n\
             002000 : 0100 0302 0504 0706   0908 0b0a 0d0c 0f0e\n"
        );

        let section = DumpSection {
            title: "Device ID",
            address: 0xbf80f220,
            layout: DumpLayout::Words32,
            data: vec![0x53, 0x00, 0xa0, 0x14],
        };
        assert_eq!(section.to_string(), "Device ID:\nbf80f220 : 14a00053\n");
    }
}

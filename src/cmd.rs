use bincode::Options;
use serde::Serialize;
use thiserror::Error;

use crate::hex::ParseError;

/// Error type for this crate.
#[derive(Error, Debug)]
pub enum PicprogError {
    /// USB device not found.
    #[error("usb device not found, is the programmer connected?")]
    UsbDeviceNotFound,
    /// USB device found but could not be opened.
    #[error("failed to open usb device: {0}")]
    UsbOpenFailure(rusb::Error),
    /// Failed to enumerate USB devices.
    #[error("failed to list usb devices: {0}")]
    UsbListFailure(rusb::Error),
    /// Failed to get USB bulk endpoints.
    #[error("failed to get usb bulk endpoints")]
    UsbEndpointsNotFound,
    /// USB bulk endpoints returned unexpected results.
    #[error("usb bulk endpoints are not expected")]
    UsbEndpointsUnexpected,
    /// Failed to detach USB kernel driver.
    #[error("failed to detach usb kernel driver: {0}")]
    UsbDetachKernelDriverFailure(rusb::Error),
    /// Failed to claim USB interface.
    #[error("failed to claim usb interface: {0}")]
    UsbClaimInterfaceFailure(rusb::Error),
    /// Failed to configure alt USB setting.
    #[error("failed to set alt usb setting: {0}")]
    UsbSetAltSettingFailure(rusb::Error),
    /// Failed to read from USB bulk endpoint.
    #[error("failed to read bulk: {0}")]
    UsbReadBulkFailure(rusb::Error),
    /// Failed to write to USB bulk endpoint.
    #[error("failed to write bulk: {0}")]
    UsbWriteBulkFailure(rusb::Error),
    /// Written data to USB does not match expected size.
    #[error("wrote {written} bytes rather than the {expected} expected")]
    UsbWriteBulkMismatch { written: usize, expected: usize },

    /// Failed to serialize command for device.
    #[error("cmd failed to binary serialize: {0}")]
    CmdSerializeFailure(bincode::Error),

    /// Nothing came back while waiting for an "OK".
    #[error("waiting for an OK, but nothing came")]
    AckMissing,
    /// An acknowledgment of the wrong size came back.
    #[error("waiting for an OK, but got {0} bytes rather than 2")]
    AckLength(usize),
    /// A two byte response that is not "OK".
    #[error("waiting for an OK, but got {0:02x?}")]
    AckMismatch([u8; 2]),
    /// The programmer answered "FAIL".
    #[error("programmer reported FAIL")]
    Fail,
    /// A data response of the wrong size.
    #[error("expected {expected} bytes but got {actual}")]
    FrameLength { expected: usize, actual: usize },
    /// Too many consecutive empty reads while waiting for a response.
    #[error("no response after {0} empty reads")]
    IdleTimeout(u32),

    /// The status register reads 0xff.
    #[error("MCHP_STATUS was {0:#04x}, the target is probably not powered")]
    NotPowered(u8),
    /// The status register reports the device as busy or not ready.
    #[error("device not ready, MCHP_STATUS {status:#04x}")]
    DeviceStatus { status: u8 },
    /// The status register reports a failed erase.
    #[error("erase failed, MCHP_STATUS {status:#04x}")]
    EraseFailed { status: u8 },

    /// First verification mismatch on families that stop at the first one.
    #[error("byte {address:08x} should be {expected:02x}, but reads as {actual:02x}")]
    Verify { address: u32, expected: u8, actual: u8 },
    /// Verification finished with mismatching segments.
    #[error("verification failed in {mismatches} segment(s)")]
    VerifyFailed { mismatches: usize },

    /// Image data outside any programmable region of the target.
    #[error("address {0:08x} is outside the device flash")]
    AddressOutOfRange(u32),

    /// The hex file could not be loaded.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Result type for this crate.
pub type Result<T> = ::std::result::Result<T, PicprogError>;

macro_rules! cmd_ids {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value,)*
        }
        impl TryFrom<u8> for $name {
            type Error = ();

            fn try_from(x: u8) -> ::std::result::Result<Self, Self::Error> {
                match x {
                    $(x if x == Self::$variant as u8 => Ok(Self::$variant),)*
                    _ => Err(()),
                }
            }
        }
    };
}

cmd_ids! {
    /// Command IDs understood by the PIC16F firmware.
    Pic16CmdId {
        ReadBytes = 0x20,
        ProgramBytes = 0x21,
        ProgramConfigWord = 0x22,
        Erase = 0x23,
        VddOn = 0x24,
        VppOn = 0x25,
        VppVddOff = 0x26,
    }
}

cmd_ids! {
    /// Command IDs understood by the PIC18F firmware.
    Pic18CmdId {
        ReadBytes = 0x00,
        ProgramBytes = 0x01,
        ProgramConfigByte = 0x02,
        Erase = 0x03,
        VddOn = 0x04,
        VppOn = 0x05,
        VppVddOff = 0x06,
    }
}

cmd_ids! {
    /// Command IDs understood by the PIC32MX firmware. 0x00 - 0x0f belong to
    /// the PIC18F firmware and are not reused.
    Pic32CmdId {
        CheckDevice = 0x10,
        Erase = 0x11,
        EnterSerialExecutionMode = 0x12,
        ExitProgrammingMode = 0x13,
        ReadWords = 0x15,
        SendWords = 0x16,
        ProgramWords = 0x17,
    }
}

/// Number of bytes staged by one PIC32 SEND_WORDS command.
pub const SEND_WORDS_CHUNK: usize = 32;

#[derive(Debug, Clone, Copy)]
enum ByteOrder {
    Little,
    Big,
}

#[derive(Serialize)]
struct Pic16ReadCmd {
    cmd_id: u8,
    addr: u16,
    len: u8,
}

#[derive(Serialize)]
struct Pic16ProgramCmd {
    cmd_id: u8,
    addr: u16,
}

#[derive(Serialize)]
struct Pic18ReadCmd {
    cmd_id: u8,
    addr: [u8; 3],
    len: u8,
}

#[derive(Serialize)]
struct Pic18ProgramCmd {
    cmd_id: u8,
    addr: [u8; 3],
}

#[derive(Serialize)]
struct Pic32ReadWordsCmd {
    cmd_id: u8,
    addr: u32,
    count: u8,
}

#[derive(Serialize)]
struct Pic32SendWordsCmd {
    cmd_id: u8,
    offset: u8,
    data: [u8; SEND_WORDS_CHUNK],
}

#[derive(Serialize)]
struct Pic32ProgramWordsCmd {
    cmd_id: u8,
    addr: u32,
}

/// 24 bit big-endian address as sent to the PIC18F firmware.
fn addr24(addr: u32) -> [u8; 3] {
    let [_, hi, mid, lo] = addr.to_be_bytes();
    [hi, mid, lo]
}

/// A command as sent over the bulk OUT endpoint: the command ID followed by
/// its payload.
///
/// The constructors encode the payload layout of each family but do not
/// check that the arguments make sense for the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    bytes: Vec<u8>,
}
impl CommandFrame {
    /// Creates a command without payload
    pub fn bare(cmd_id: u8) -> Self {
        CommandFrame {
            bytes: vec![cmd_id],
        }
    }

    fn encode<S: Serialize>(cmd: &S, order: ByteOrder) -> Result<Self> {
        let opts = bincode::DefaultOptions::new().with_fixint_encoding();
        let bytes = match order {
            ByteOrder::Little => opts.with_little_endian().serialize(cmd),
            ByteOrder::Big => opts.with_big_endian().serialize(cmd),
        }
        .map_err(PicprogError::CmdSerializeFailure)?;
        Ok(CommandFrame { bytes })
    }

    fn with_data(mut self, data: &[u8]) -> Self {
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Creates a PIC16F READ_BYTES command, `addr` in words
    pub fn pic16_read_bytes(addr: u16, len: u8) -> Result<Self> {
        let cmd = Pic16ReadCmd {
            cmd_id: Pic16CmdId::ReadBytes as u8,
            addr,
            len,
        };
        Self::encode(&cmd, ByteOrder::Big)
    }

    /// Creates a PIC16F PROGRAM_BYTES command, `addr` in words
    pub fn pic16_program_bytes(addr: u16, data: &[u8]) -> Result<Self> {
        let cmd = Pic16ProgramCmd {
            cmd_id: Pic16CmdId::ProgramBytes as u8,
            addr,
        };
        Ok(Self::encode(&cmd, ByteOrder::Big)?.with_data(data))
    }

    /// Creates a PIC16F PROGRAM_CONFIG_WORD command
    pub fn pic16_program_config_word(word: u16) -> Self {
        Self::bare(Pic16CmdId::ProgramConfigWord as u8).with_data(&word.to_le_bytes())
    }

    /// Creates a PIC18F READ_BYTES command
    pub fn pic18_read_bytes(addr: u32, len: u8) -> Result<Self> {
        let cmd = Pic18ReadCmd {
            cmd_id: Pic18CmdId::ReadBytes as u8,
            addr: addr24(addr),
            len,
        };
        Self::encode(&cmd, ByteOrder::Big)
    }

    /// Creates a PIC18F PROGRAM_BYTES command
    pub fn pic18_program_bytes(addr: u32, data: &[u8]) -> Result<Self> {
        let cmd = Pic18ProgramCmd {
            cmd_id: Pic18CmdId::ProgramBytes as u8,
            addr: addr24(addr),
        };
        Ok(Self::encode(&cmd, ByteOrder::Big)?.with_data(data))
    }

    /// Creates a PIC18F PROGRAM_CONFIG_BYTE command. Only the low address
    /// byte is sent, the firmware adds 0x300000.
    pub fn pic18_program_config_byte(addr: u32, byte: u8) -> Self {
        Self::bare(Pic18CmdId::ProgramConfigByte as u8).with_data(&[(addr & 0xff) as u8, byte])
    }

    /// Creates a PIC32MX READ_WORDS command
    pub fn pic32_read_words(addr: u32, count: u8) -> Result<Self> {
        let cmd = Pic32ReadWordsCmd {
            cmd_id: Pic32CmdId::ReadWords as u8,
            addr,
            count,
        };
        Self::encode(&cmd, ByteOrder::Little)
    }

    /// Creates a PIC32MX SEND_WORDS command staging 32 bytes at `offset` in
    /// the target's SRAM row buffer
    pub fn pic32_send_words(offset: u8, data: [u8; SEND_WORDS_CHUNK]) -> Result<Self> {
        let cmd = Pic32SendWordsCmd {
            cmd_id: Pic32CmdId::SendWords as u8,
            offset,
            data,
        };
        Self::encode(&cmd, ByteOrder::Little)
    }

    /// Creates a PIC32MX PROGRAM_WORDS command committing the staged row
    pub fn pic32_program_words(addr: u32) -> Result<Self> {
        let cmd = Pic32ProgramWordsCmd {
            cmd_id: Pic32CmdId::ProgramWords as u8,
            addr,
        };
        Self::encode(&cmd, ByteOrder::Little)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pic16_addresses_are_big_endian() {
        let frame = CommandFrame::pic16_read_bytes(0x2000, 16).unwrap();
        assert_eq!(frame.as_bytes(), &[0x20, 0x20, 0x00, 16]);

        let frame = CommandFrame::pic16_program_bytes(0x0123, &[0xaa, 0xbb]).unwrap();
        assert_eq!(frame.as_bytes(), &[0x21, 0x01, 0x23, 0xaa, 0xbb]);
    }

    #[test]
    fn pic16_config_word_is_little_endian() {
        let frame = CommandFrame::pic16_program_config_word(0x3f18);
        assert_eq!(frame.as_bytes(), &[0x22, 0x18, 0x3f]);
    }

    #[test]
    fn pic18_uses_three_address_bytes() {
        let frame = CommandFrame::pic18_read_bytes(0x3ffffe, 2).unwrap();
        assert_eq!(frame.as_bytes(), &[0x00, 0x3f, 0xff, 0xfe, 2]);

        let frame = CommandFrame::pic18_program_bytes(0x001234, &[1]).unwrap();
        assert_eq!(frame.as_bytes(), &[0x01, 0x00, 0x12, 0x34, 1]);

        let frame = CommandFrame::pic18_program_config_byte(0x300005, 0x81);
        assert_eq!(frame.as_bytes(), &[0x02, 0x05, 0x81]);
    }

    #[test]
    fn pic32_addresses_are_little_endian() {
        let frame = CommandFrame::pic32_read_words(0xbf80f220, 1).unwrap();
        assert_eq!(frame.as_bytes(), &[0x15, 0x20, 0xf2, 0x80, 0xbf, 1]);

        let frame = CommandFrame::pic32_program_words(0x1d000080).unwrap();
        assert_eq!(frame.as_bytes(), &[0x17, 0x80, 0x00, 0x00, 0x1d]);
    }

    #[test]
    fn pic32_send_words_has_no_length_prefix() {
        let mut data = [0u8; SEND_WORDS_CHUNK];
        data[0] = 0x11;
        data[31] = 0x22;
        let frame = CommandFrame::pic32_send_words(0x60, data).unwrap();
        let bytes = frame.as_bytes();
        assert_eq!(bytes.len(), 2 + SEND_WORDS_CHUNK);
        assert_eq!(&bytes[..3], &[0x16, 0x60, 0x11]);
        assert_eq!(bytes[33], 0x22);
    }

    #[test]
    fn cmd_ids_round_trip_through_u8() {
        assert_eq!(Pic32CmdId::try_from(0x17), Ok(Pic32CmdId::ProgramWords));
        assert_eq!(Pic18CmdId::try_from(0x02), Ok(Pic18CmdId::ProgramConfigByte));
        assert_eq!(Pic16CmdId::try_from(0x07), Err(()));
    }
}

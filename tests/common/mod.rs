//! A simulated programmer: answers each family's commands from an in-memory
//! target the way the firmware does.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::time::Duration;

use picprog_rs::cmd::Result;
use picprog_rs::{Config, DeviceFamily, HexImage, Transport};

const PIC32_ROW_SIZE: usize = 128;
const PIC32_DEVCFG0_TOP: u32 = 0x1fc00bff;

#[derive(Debug)]
pub struct Simulator {
    pub family: DeviceFamily,
    /// Target memory by (file) byte address. Missing bytes are erased.
    pub memory: BTreeMap<u32, u8>,
    /// Every command received, in order.
    pub sent: Vec<Vec<u8>>,
    /// PIC32 MCHP_STATUS.
    pub status: u8,
    /// PIC32 erase leaves NVMERR set.
    pub erase_fails: bool,
    pub powered: bool,
    pub programming_mode: bool,
    /// Precede every PIC32 response with an empty read and diagnostics.
    pub noisy: bool,
    /// Command ID answered with a failure instead of its response.
    pub reject: Option<u8>,
    /// A byte that always reads back as the given value.
    pub stuck: Option<(u32, u8)>,
    /// Survives erase.
    protected: Range<u32>,
    row: [u8; PIC32_ROW_SIZE],
    responses: VecDeque<Vec<u8>>,
}

impl Simulator {
    fn new(family: DeviceFamily, protected: Range<u32>, id: &[u8]) -> Self {
        let mut sim = Simulator {
            family,
            memory: BTreeMap::new(),
            sent: vec![],
            status: 0x08,
            erase_fails: false,
            powered: false,
            programming_mode: false,
            noisy: false,
            reject: None,
            stuck: None,
            protected: protected.clone(),
            row: [0xff; PIC32_ROW_SIZE],
            responses: VecDeque::new(),
        };
        for (addr, &byte) in protected.zip(id) {
            sim.memory.insert(addr, byte);
        }
        sim
    }

    /// A 16F628A rev 6. The device ID is the word at 0x2006.
    pub fn pic16() -> Self {
        Self::new(DeviceFamily::Pic16, 0x400c..0x400e, &[0x66, 0x10])
    }

    /// An 18F45K50 rev 7.
    pub fn pic18() -> Self {
        Self::new(DeviceFamily::Pic18, 0x3ffffe..0x400000, &[0x07, 0x5c])
    }

    /// A PIC32MX220F032B rev 1.
    pub fn pic32() -> Self {
        Self::new(
            DeviceFamily::Pic32,
            0xbf80f220..0xbf80f224,
            &0x14a00053u32.to_le_bytes(),
        )
    }

    /// Command IDs received, in order.
    pub fn cmd_ids(&self) -> Vec<u8> {
        self.sent.iter().map(|c| c[0]).collect()
    }

    pub fn count(&self, cmd_id: u8) -> usize {
        self.sent.iter().filter(|c| c[0] == cmd_id).count()
    }

    pub fn last_cmd_id(&self) -> Option<u8> {
        self.sent.last().map(|c| c[0])
    }

    pub fn read(&self, addr: u32) -> u8 {
        if let Some((stuck, value)) = self.stuck {
            if stuck == addr {
                return value;
            }
        }
        // CONFIG3L and CONFIG4H are unimplemented.
        if self.family == DeviceFamily::Pic18 && (addr == 0x300004 || addr == 0x300007) {
            return 0;
        }
        match self.memory.get(&addr) {
            Some(&byte) => byte,
            None if self.family == DeviceFamily::Pic16 && addr % 2 == 1 => 0x3f,
            None => 0xff,
        }
    }

    fn write(&mut self, addr: u32, byte: u8) {
        let byte = match self.family {
            DeviceFamily::Pic16 if addr % 2 == 1 => byte & 0x3f,
            DeviceFamily::Pic32 if addr == PIC32_DEVCFG0_TOP => byte & 0x7f,
            _ => byte,
        };
        self.memory.insert(addr, byte);
    }

    fn erase(&mut self) {
        let protected = self.protected.clone();
        self.memory.retain(|addr, _| protected.contains(addr));
    }

    fn respond(&mut self, frame: &[u8]) {
        if self.noisy {
            self.responses.push_back(vec![]);
            self.responses.push_back(b"DEBU\xef\xbe\xad\xde".to_vec());
            self.responses.push_back(b"TEXTworking".to_vec());
        }
        self.responses.push_back(frame.to_vec());
    }

    fn ok(&mut self) {
        self.respond(b"OK");
    }

    fn handle_pic16(&mut self, cmd: &[u8]) {
        match cmd[0] {
            0x20 => {
                let addr = u16::from_be_bytes([cmd[1], cmd[2]]) as u32 * 2;
                let data: Vec<u8> = (addr..addr + cmd[3] as u32).map(|a| self.read(a)).collect();
                self.respond(&data);
            }
            0x21 => {
                let addr = u16::from_be_bytes([cmd[1], cmd[2]]) as u32 * 2;
                for (a, &byte) in (addr..).zip(&cmd[3..]) {
                    self.write(a, byte);
                }
                self.ok();
            }
            0x22 => {
                self.write(0x2007 * 2, cmd[1]);
                self.write(0x2007 * 2 + 1, cmd[2]);
                self.ok();
            }
            0x23 => {
                self.erase();
                self.ok();
            }
            0x24 | 0x25 => {
                self.powered = true;
                self.ok();
            }
            0x26 => {
                self.powered = false;
                self.ok();
            }
            _ => self.respond(b"??"),
        }
    }

    fn handle_pic18(&mut self, cmd: &[u8]) {
        let addr = |cmd: &[u8]| u32::from_be_bytes([0, cmd[1], cmd[2], cmd[3]]);
        match cmd[0] {
            0x00 => {
                let addr = addr(cmd);
                let data: Vec<u8> = (addr..addr + cmd[4] as u32).map(|a| self.read(a)).collect();
                self.respond(&data);
            }
            0x01 => {
                let addr = addr(cmd);
                for (a, &byte) in (addr..).zip(&cmd[4..]) {
                    self.write(a, byte);
                }
                self.ok();
            }
            0x02 => {
                self.write(0x300000 + cmd[1] as u32, cmd[2]);
                self.ok();
            }
            0x03 => {
                self.erase();
                self.ok();
            }
            0x04 | 0x05 => {
                self.powered = true;
                self.ok();
            }
            0x06 => {
                self.powered = false;
                self.ok();
            }
            _ => self.respond(b"??"),
        }
    }

    fn handle_pic32(&mut self, cmd: &[u8]) {
        let addr = |cmd: &[u8]| u32::from_le_bytes([cmd[1], cmd[2], cmd[3], cmd[4]]);
        match cmd[0] {
            0x10 => {
                let status = self.status;
                self.respond(&[status]);
            }
            0x11 => {
                self.erase();
                if self.erase_fails {
                    self.status |= 0x20;
                }
                let status = self.status;
                self.respond(&[status]);
            }
            0x12 => {
                self.programming_mode = true;
                self.ok();
            }
            0x13 => {
                self.programming_mode = false;
                self.ok();
            }
            0x15 => {
                let addr = addr(cmd);
                let len = cmd[5] as u32 * 4;
                let data: Vec<u8> = (addr..addr + len).map(|a| self.read(a)).collect();
                self.respond(&data);
            }
            0x16 => {
                let offset = cmd[1] as usize;
                self.row[offset..offset + 32].copy_from_slice(&cmd[2..34]);
                self.ok();
            }
            0x17 => {
                let addr = addr(cmd);
                let row = std::mem::replace(&mut self.row, [0xff; PIC32_ROW_SIZE]);
                for (a, byte) in (addr..).zip(row) {
                    self.write(a, byte);
                }
                self.ok();
            }
            _ => self.respond(b"????"),
        }
    }
}

impl Transport for Simulator {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.sent.push(data.to_vec());
        if self.reject == Some(data[0]) {
            match self.family {
                DeviceFamily::Pic32 => self.respond(b"FAIL"),
                _ => self.respond(b"NG"),
            }
            return Ok(());
        }
        match self.family {
            DeviceFamily::Pic16 => self.handle_pic16(data),
            DeviceFamily::Pic18 => self.handle_pic18(data),
            DeviceFamily::Pic32 => self.handle_pic32(data),
        }
        Ok(())
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut frame = self.responses.pop_front().unwrap_or_default();
        frame.truncate(max_len);
        Ok(frame)
    }
}

/// No settle delay, and a bounded wait so a missing response fails the test
/// instead of hanging it.
pub fn config() -> Config {
    Config {
        settle_delay: Duration::ZERO,
        idle_limit: Some(4),
        ..Config::default()
    }
}

/// A data record.
pub fn data(address: u16, bytes: &[u8]) -> String {
    record(address, 0x00, bytes)
}

/// An extended linear address record.
pub fn extended(upper: u16) -> String {
    record(0, 0x04, &upper.to_be_bytes())
}

fn record(address: u16, record_type: u8, bytes: &[u8]) -> String {
    let [hi, lo] = address.to_be_bytes();
    let mut sum = (bytes.len() as u8)
        .wrapping_add(hi)
        .wrapping_add(lo)
        .wrapping_add(record_type);
    let mut line = format!(":{:02X}{:04X}{:02X}", bytes.len(), address, record_type);
    for &byte in bytes {
        line.push_str(&format!("{:02X}", byte));
        sum = sum.wrapping_add(byte);
    }
    line.push_str(&format!("{:02X}", sum.wrapping_neg()));
    line
}

pub fn image(records: &[String]) -> HexImage {
    let mut text = records.join("\n");
    text.push_str("\n:00000001FF\n");
    HexImage::parse(&text).unwrap()
}

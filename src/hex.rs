//! Loading of Intel HEX style memory images.
//!
//! Each data record becomes at most two [`Segment`]s of up to 16 bytes. No
//! segment crosses a 32 byte boundary since the PIC parts cannot program a
//! range of bytes that straddles one.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Maximum number of bytes held by one segment.
pub const MAX_SEGMENT_LENGTH: usize = 16;
/// Maximum number of segments in one image, 64kB in total.
pub const MAX_SEGMENTS: usize = 65536 / MAX_SEGMENT_LENGTH;

/// Segments are split so that they never straddle a boundary of this size.
const BOUNDARY_SHIFT: u32 = 5;

const RECORD_DATA: u8 = 0x00;
const RECORD_END_OF_FILE: u8 = 0x01;
const RECORD_EXTENDED_LINEAR_ADDRESS: u8 = 0x04;

/// Error type for loading a hex file.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The file could not be opened or read.
    #[error("cannot open file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A line that is not valid hexadecimal or is too short.
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },
    /// A data record that does not fit in one segment.
    #[error("line {line}: {length} data bytes, at most {} are supported", MAX_SEGMENT_LENGTH)]
    RecordTooLong { line: usize, length: usize },
    /// A record type other than data, end-of-file or extended linear address.
    #[error("line {line}: unrecognised record type {record_type:02x} in \"{text}\"")]
    UnsupportedRecord {
        line: usize,
        record_type: u8,
        text: String,
    },
    /// The image holds more than [`MAX_SEGMENTS`] segments.
    #[error("image has more than {max} segments")]
    Capacity { max: usize },
    /// A data record that runs past the end of the 32 bit address space.
    #[error("line {line}: data at {address:08x} runs past the end of the address space")]
    AddressOverflow { line: usize, address: u32 },
}

/// A contiguous run of target memory content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Address in the target where this data shall be programmed.
    pub address: u32,
    length: u16,
    bytes: [u8; MAX_SEGMENT_LENGTH],
}
impl Segment {
    /// Creates a segment from at most [`MAX_SEGMENT_LENGTH`] bytes.
    pub fn new(address: u32, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_SEGMENT_LENGTH {
            return None;
        }
        let mut bytes = [0xff; MAX_SEGMENT_LENGTH];
        bytes[..data.len()].copy_from_slice(data);
        Some(Segment {
            address,
            length: data.len() as u16,
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    /// Address one past the last byte.
    pub fn end(&self) -> u32 {
        self.address + self.length as u32
    }

    /// Splits off the bytes beyond the first 32 byte boundary the segment
    /// crosses, if any.
    fn split_at_boundary(&mut self) -> Option<Segment> {
        let start_region = self.address >> BOUNDARY_SHIFT;
        let end_region = (self.end() - 1) >> BOUNDARY_SHIFT;
        if start_region == end_region {
            return None;
        }

        let boundary_address = end_region << BOUNDARY_SHIFT;
        let boundary_offset = (boundary_address - self.address) as usize;
        let tail = Segment::new(boundary_address, &self.data()[boundary_offset..]);
        self.length = boundary_offset as u16;
        tail
    }
}

/// An ordered sequence of segments in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    segments: Vec<Segment>,
}
impl HexImage {
    /// Loads the hex file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ParseError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let image = Self::parse(&text)?;
        log::info!(
            "Loaded {} segments ({} bytes) from {}",
            image.segments.len(),
            image.total_bytes(),
            path.display()
        );
        Ok(image)
    }

    /// Parses hex text. Parsing stops at the first end-of-file record.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut parser = Parser::default();
        for (index, line) in text.lines().enumerate() {
            if parser.line(index + 1, line)? == Flow::Stop {
                break;
            }
        }
        Ok(parser.image)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sum of all segment lengths.
    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    fn push(&mut self, segment: Segment) -> Result<(), ParseError> {
        if self.segments.len() >= MAX_SEGMENTS {
            return Err(ParseError::Capacity { max: MAX_SEGMENTS });
        }
        self.segments.push(segment);
        Ok(())
    }
}

impl<'a> IntoIterator for &'a HexImage {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

impl fmt::Display for HexImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{:06x} ({:3} bytes) : ", segment.address, segment.len())?;
            for byte in segment.data() {
                write!(f, "{:02x} ", byte)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Default)]
struct Parser {
    image: HexImage,
    /// Set by extended linear address records, added to the address of
    /// subsequent data records.
    base_address: u32,
}
impl Parser {
    fn line(&mut self, line: usize, text: &str) -> Result<Flow, ParseError> {
        let record = text.trim();
        let record = record.strip_prefix(':').unwrap_or(record);
        if record.is_empty() {
            return Ok(Flow::Continue);
        }

        let length = hex_field(record, 0, 2, line)? as usize;
        let address = hex_field(record, 2, 4, line)?;
        let record_type = hex_field(record, 6, 2, line)? as u8;

        match record_type {
            RECORD_DATA => {
                self.data(line, record, length, address)?;
                Ok(Flow::Continue)
            }
            RECORD_END_OF_FILE => Ok(Flow::Stop),
            RECORD_EXTENDED_LINEAR_ADDRESS => {
                self.base_address = hex_field(record, 8, 4, line)? << 16;
                log::debug!("Base address now {:08x}", self.base_address);
                Ok(Flow::Continue)
            }
            _ => Err(ParseError::UnsupportedRecord {
                line,
                record_type,
                text: text.trim_end().to_string(),
            }),
        }
    }

    fn data(
        &mut self,
        line: usize,
        record: &str,
        length: usize,
        address: u32,
    ) -> Result<(), ParseError> {
        if length > MAX_SEGMENT_LENGTH {
            return Err(ParseError::RecordTooLong { line, length });
        }
        if length == 0 {
            return Ok(());
        }

        let mut data = Vec::with_capacity(MAX_SEGMENT_LENGTH);
        for i in 0..length {
            data.push(hex_field(record, 8 + i * 2, 2, line)? as u8);
        }

        // Programmers won't take an odd number of bytes. Single bytes are
        // likely config words and are left alone.
        if length > 2 && length % 2 == 1 {
            log::debug!(
                "Padded bytes starting at {:08x} with an extra byte at offset {:02x}",
                address,
                length
            );
            data.push(0xff);
        }

        let address = self
            .base_address
            .checked_add(address)
            .filter(|a| a.checked_add(data.len() as u32).is_some())
            .ok_or(ParseError::AddressOverflow {
                line,
                address: self.base_address.wrapping_add(address),
            })?;
        let mut segment =
            Segment::new(address, &data).ok_or(ParseError::RecordTooLong { line, length })?;
        let tail = segment.split_at_boundary();
        self.image.push(segment)?;
        if let Some(tail) = tail {
            self.image.push(tail)?;
        }
        Ok(())
    }
}

fn hex_field(record: &str, start: usize, digits: usize, line: usize) -> Result<u32, ParseError> {
    let field = record
        .get(start..start + digits)
        .ok_or(ParseError::Malformed {
            line,
            reason: "line too short",
        })?;
    let invalid = ParseError::Malformed {
        line,
        reason: "invalid hexadecimal digits",
    };
    if !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid);
    }
    u32::from_str_radix(field, 16).map_err(|_| invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(length: u8, address: u16, record_type: u8, data: &[u8]) -> String {
        let mut line = format!(":{:02X}{:04X}{:02X}", length, address, record_type);
        for byte in data {
            line.push_str(&format!("{:02X}", byte));
        }
        // checksum is never looked at
        line.push_str("00");
        line
    }

    fn assert_invariants(image: &HexImage) {
        for segment in image {
            assert!(segment.len() <= MAX_SEGMENT_LENGTH);
            assert_eq!(segment.address >> 5, (segment.end() - 1) >> 5);
        }
    }

    #[test]
    fn odd_length_records_are_padded() {
        let image = HexImage::parse(&record(3, 0x0100, 0, &[1, 2, 3])).unwrap();
        assert_eq!(image.len(), 1);
        assert_eq!(image.segments()[0].data(), &[1, 2, 3, 0xff]);
    }

    #[test]
    fn single_bytes_are_not_padded() {
        let image = HexImage::parse(&record(1, 0x400e, 0, &[0x3f])).unwrap();
        assert_eq!(image.segments()[0].data(), &[0x3f]);
    }

    #[test]
    fn segments_split_at_32_byte_boundaries() {
        let data: Vec<u8> = (0..16).collect();
        let image = HexImage::parse(&record(16, 0x001a, 0, &data)).unwrap();

        assert_eq!(image.len(), 2);
        let (head, tail) = (image.segments()[0], image.segments()[1]);
        assert_eq!((head.address, head.len()), (0x1a, 6));
        assert_eq!((tail.address, tail.len()), (0x20, 10));
        assert_eq!(head.data(), &data[..6]);
        assert_eq!(tail.data(), &data[6..]);
        assert_invariants(&image);
    }

    #[test]
    fn extended_address_applies_to_following_records() {
        let text = [
            record(2, 0x0000, 0, &[0xaa, 0xbb]),
            record(2, 0x0000, 4, &[0x10, 0x00]),
            record(2, 0x0010, 0, &[0xcc, 0xdd]),
        ]
        .join("\n");
        let image = HexImage::parse(&text).unwrap();
        assert_eq!(image.segments()[0].address, 0x0000_0000);
        assert_eq!(image.segments()[1].address, 0x1000_0010);
    }

    #[test]
    fn end_of_file_stops_parsing() {
        let text = [
            record(2, 0x0000, 0, &[1, 2]),
            record(0, 0x0000, 1, &[]),
            "garbage that is never read".to_string(),
        ]
        .join("\n");
        let image = HexImage::parse(&text).unwrap();
        assert_eq!(image.len(), 1);
    }

    #[test]
    fn unknown_record_types_fail() {
        let text = [record(2, 0, 0, &[1, 2]), record(2, 0, 2, &[0x10, 0x00])].join("\n");
        match HexImage::parse(&text) {
            Err(ParseError::UnsupportedRecord {
                line, record_type, ..
            }) => {
                assert_eq!(line, 2);
                assert_eq!(record_type, 2);
            }
            other => panic!("expected an unsupported record error, got {:?}", other),
        }
    }

    #[test]
    fn byte_count_is_preserved() {
        let mut lines = Vec::new();
        let mut expected = 0;
        for (i, length) in [16u8, 3, 1, 2, 15, 16, 7].iter().enumerate() {
            let data: Vec<u8> = (0..*length).collect();
            lines.push(record(*length, (i as u16) * 0x17, 0, &data));
            expected += if *length > 2 && length % 2 == 1 {
                *length as usize + 1
            } else {
                *length as usize
            };
        }
        let image = HexImage::parse(&lines.join("\n")).unwrap();
        assert_eq!(image.total_bytes(), expected);
        assert_invariants(&image);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut text = String::new();
        for i in 0..=MAX_SEGMENTS {
            let address = (i * 16) as u32;
            if address & 0xffff == 0 {
                text.push_str(&record(2, 0, 4, &[(address >> 24) as u8, (address >> 16) as u8]));
                text.push('\n');
            }
            text.push_str(&record(16, address as u16, 0, &[0x55; 16]));
            text.push('\n');
        }
        assert!(matches!(
            HexImage::parse(&text),
            Err(ParseError::Capacity { max: MAX_SEGMENTS })
        ));
    }

    #[test]
    fn malformed_lines_are_reported() {
        assert!(matches!(
            HexImage::parse(":0200"),
            Err(ParseError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            HexImage::parse(":02000000ZZ11"),
            Err(ParseError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            HexImage::parse(&record(17, 0, 0, &[0; 17])),
            Err(ParseError::RecordTooLong { length: 17, .. })
        ));
    }

    #[test]
    fn signs_are_not_hex_digits() {
        assert!(matches!(
            HexImage::parse(":+2000000AABB"),
            Err(ParseError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            HexImage::parse(":0200000011+2"),
            Err(ParseError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn data_past_the_top_of_memory_is_rejected() {
        let text = format!(
            "{}\n{}\n",
            record(2, 0, 4, &[0xff, 0xff]),
            record(16, 0xfff0, 0, &[0x55; 16])
        );
        assert!(matches!(
            HexImage::parse(&text),
            Err(ParseError::AddressOverflow {
                line: 2,
                address: 0xfffffff0
            })
        ));

        // The last byte of the address space itself is fine.
        let text = format!(
            "{}\n{}\n",
            record(2, 0, 4, &[0xff, 0xff]),
            record(1, 0xfffe, 0, &[0xaa])
        );
        let image = HexImage::parse(&text).unwrap();
        assert_eq!(image.segments()[0].address, 0xfffffffe);
    }

    #[test]
    fn missing_file_fails_to_load() {
        assert!(matches!(
            HexImage::load("/nonexistent/firmware.hex"),
            Err(ParseError::Open { .. })
        ));
    }

    #[test]
    fn display_lists_segments() {
        let image = HexImage::parse(&record(2, 0x0010, 0, &[0xab, 0xcd])).unwrap();
        assert_eq!(image.to_string(), "000010 (  2 bytes) : ab cd \n");
    }
}

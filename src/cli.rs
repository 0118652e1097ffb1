//! CLI argument parsing

use clap::Parser;
use picprog_rs::DeviceFamily;
use std::path::PathBuf;

/// Parse a `VID:PID` pair of hex numbers
fn parse_vid_pid(s: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| format!("Expected VID:PID, got \"{}\"", s))?;
    let parse = |x: &str| {
        let x = x.trim_start_matches("0x").trim_start_matches("0X");
        u16::from_str_radix(x, 16).map_err(|e| format!("Invalid hex value \"{}\": {}", x, e))
    };
    Ok((parse(vid)?, parse(pid)?))
}

#[derive(Parser, Debug)]
#[command(name = "picprog")]
#[command(author, version, about = "USB programmer for PIC16F, PIC18F and PIC32MX", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Target family [pic16, pic18, pic32]
    #[arg(short, long)]
    pub family: Option<DeviceFamily>,

    /// Bulk erase the target
    #[arg(short, long)]
    pub erase: bool,

    /// Program and verify a hex file
    #[arg(short, long, value_name = "FILE")]
    pub program: Option<PathBuf>,

    /// Read and decode the device ID
    #[arg(short, long)]
    pub id: bool,

    /// Dump the interesting parts of target memory
    #[arg(short, long)]
    pub dump: bool,

    /// Load a hex file and print its segments
    #[arg(long, value_name = "FILE")]
    pub print_hex: Option<PathBuf>,

    /// Log every frame sent to and received from the programmer
    #[arg(long)]
    pub rxtx: bool,

    /// USB device to open instead of searching for the programmer
    #[arg(long, value_name = "VID:PID", value_parser = parse_vid_pid)]
    pub device: Option<(u16, u16)>,

    /// Wait after applying programming voltages (PIC16F/PIC18F)
    #[arg(long, value_name = "MS", default_value_t = 100)]
    pub settle_ms: u64,

    /// Give up after this many empty reads while waiting for the PIC32MX
    #[arg(long, value_name = "COUNT")]
    pub idle_limit: Option<u32>,
}

impl Cli {
    /// Whether anything needs the programmer.
    pub fn wants_device(&self) -> bool {
        self.erase || self.program.is_some() || self.id || self.dump
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vid_pid_parses_as_hex() {
        assert_eq!(parse_vid_pid("04d8:000b"), Ok((0x04d8, 0x000b)));
        assert_eq!(parse_vid_pid("0x04D8:0x0033"), Ok((0x04d8, 0x0033)));
        assert!(parse_vid_pid("04d8").is_err());
        assert!(parse_vid_pid("04d8:xyz").is_err());
    }

    #[test]
    fn operations_and_family_parse() {
        let cli = Cli::parse_from(["picprog", "-f", "pic32", "--erase", "-p", "a.hex", "-vv"]);
        assert_eq!(cli.family, Some(DeviceFamily::Pic32));
        assert!(cli.erase);
        assert_eq!(cli.program, Some(PathBuf::from("a.hex")));
        assert_eq!(cli.verbose, 2);
        assert!(cli.wants_device());

        let cli = Cli::parse_from(["picprog", "--print-hex", "a.hex"]);
        assert!(!cli.wants_device());
        assert_eq!(cli.settle_ms, 100);
    }
}

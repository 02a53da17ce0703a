//! Command-line front end.
//!
//! Argument parsing is explicitly out of scope for the flashing engine
//! itself — the destination segment, image path, and size override arrive
//! here as plain values and the rest of the crate never sees a `structopt`
//! type.

use std::path::PathBuf;

use structopt::StructOpt;
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum CliError {
    #[error("segment {0:?} is not 1-4 hex digits")]
    InvalidSegment(String),
    #[error("segment {0:#06x} is outside the legal range 0xA000..=0xF800")]
    SegmentOutOfRange(u16),
    #[error("segment {0:#06x} must be a multiple of 0x100")]
    SegmentMisaligned(u16),
    #[error("size override must be an even number of KiB in 2..=256")]
    InvalidSizeOverride(u16),
    #[error("aborted: user declined the confirmation prompt")]
    UserAborted,
}

/// Parses and validates a destination segment from a hex string such as
/// `"C800"` or `"0xC800"`.
fn parse_segment(src: &str) -> Result<u16, CliError> {
    let digits = src.trim_start_matches("0x").trim_start_matches("0X");
    let value =
        u16::from_str_radix(digits, 16).map_err(|_| CliError::InvalidSegment(src.to_string()))?;

    if !(0xA000..=0xF800).contains(&value) {
        return Err(CliError::SegmentOutOfRange(value));
    }
    if value % 0x100 != 0 {
        return Err(CliError::SegmentMisaligned(value));
    }

    Ok(value)
}

/// Validates a `-size <K>` override in KiB.
pub fn validate_size_override(kib: u16) -> Result<u16, CliError> {
    if kib < 2 || kib > 256 || kib % 2 != 0 {
        return Err(CliError::InvalidSizeOverride(kib));
    }
    Ok(kib)
}

/// Parses and validates the `-size <K>` override from its decimal string form.
fn parse_size_override(src: &str) -> Result<u16, CliError> {
    let kib: u16 = src.parse().map_err(|_| CliError::InvalidSizeOverride(0))?;
    validate_size_override(kib)
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "sstflash",
    about = "Programs an SST39SF0x0 option ROM through its memory-mapped command window."
)]
pub struct Opts {
    /// Destination segment, hex, e.g. C800 (must be 0xA000..=0xF800, a multiple of 0x100)
    #[structopt(parse(try_from_str = parse_segment))]
    pub segment: u16,

    /// Path to the binary image to program
    pub image: PathBuf,

    /// Override the written length in KiB (even, 2..=256)
    #[structopt(long = "size", parse(try_from_str = parse_size_override))]
    pub size_override: Option<u16>,
}

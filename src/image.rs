//! ROM image loader.
//!
//! Reads a file into a vector of 4 KiB blocks, validating its size and
//! padding the tail with 0x00 to a block multiple. Programming proceeds in
//! 4 KiB units because that is the SST39SF0x0 sector-erase granularity.

use std::io::{self, Read};

use log::info;
use thiserror::Error;

/// The SST39SF0x0 sector-erase granularity, and therefore the unit this
/// loader produces blocks in.
pub const BLOCK_SIZE: usize = 4096;

/// 256 KiB cap, i.e. the largest SST39SF0x0 in the family (SST39SF040).
pub const MAX_BLOCKS: usize = 64;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image file is empty")]
    Empty,
    #[error("image length {0} is not a multiple of 2048 bytes")]
    NotAligned(usize),
    #[error("image exceeds the {0}-byte cap for this device family")]
    TooLarge(usize),
    #[error("I/O error reading image: {0}")]
    Io(#[from] io::Error),
}

/// One 4 KiB block of the ROM image, zero-padded if the source file ran out
/// before filling it.
#[derive(Clone)]
pub struct Block(pub [u8; BLOCK_SIZE]);

impl Block {
    fn zeroed() -> Block {
        Block([0u8; BLOCK_SIZE])
    }
}

/// An ordered sequence of fixed-size 4 KiB blocks loaded from a file,
/// together with the original file length.
pub struct RomImage {
    blocks: Vec<Block>,
    orig_size: usize,
}

impl RomImage {
    /// Loads an image from `reader`, optionally overriding the written
    /// length in KiB. `size_override_kib` is assumed already validated (see
    /// `cli::validate_size_override`) — this loader trusts it and just turns
    /// it into a byte cap.
    pub fn load<R: Read>(mut reader: R, size_override_kib: Option<u16>) -> Result<RomImage, ImageError> {
        let limit = match size_override_kib {
            Some(kib) => kib as usize * 1024,
            None => MAX_BLOCKS * BLOCK_SIZE,
        };

        let mut blocks = Vec::new();
        let mut orig_size = 0usize;

        loop {
            let remaining = limit - orig_size;
            if remaining == 0 {
                break;
            }

            let want = remaining.min(BLOCK_SIZE);
            let mut block = Block::zeroed();
            let mut got = 0usize;

            while got < want {
                let n = reader.read(&mut block.0[got..want])?;
                if n == 0 {
                    break;
                }
                got += n;
            }

            orig_size += got;
            blocks.push(block);

            if got < want {
                break;
            }
        }

        // `limit` reached without hitting EOF: if that limit came from the
        // hardware cap rather than a user-chosen `-size` override, the file
        // genuinely doesn't fit this device family and we reject it rather
        // than silently truncate it. A `-size` override, by contrast, is the
        // user explicitly asking for only the first `limit` bytes.
        if orig_size == limit && size_override_kib.is_none() {
            let mut probe = [0u8; 1];
            if reader.read(&mut probe)? > 0 {
                return Err(ImageError::TooLarge(limit));
            }
        }

        if size_override_kib.is_some() {
            while blocks.len() * BLOCK_SIZE < limit {
                blocks.push(Block::zeroed());
            }
        }

        if orig_size == 0 {
            return Err(ImageError::Empty);
        }
        if orig_size % 2048 != 0 {
            return Err(ImageError::NotAligned(orig_size));
        }
        debug_assert!(blocks.len() <= MAX_BLOCKS);

        if orig_size % BLOCK_SIZE != 0 {
            info!(
                "image length {} is not a multiple of {} bytes, zero-padding the tail block",
                orig_size, BLOCK_SIZE
            );
        }

        Ok(RomImage { blocks, orig_size })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The original file length in bytes, before block padding.
    pub fn orig_size(&self) -> usize {
        self.orig_size
    }

    /// `blocks().len() * BLOCK_SIZE`, the length that will actually be
    /// written to the device.
    pub fn programmed_len(&self) -> usize {
        self.blocks.len() * BLOCK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_empty_file() {
        let err = RomImage::load(Cursor::new(Vec::<u8>::new()), None).unwrap_err();
        assert!(matches!(err, ImageError::Empty));
    }

    #[test]
    fn rejects_length_not_multiple_of_2kib() {
        let data = vec![0xAAu8; 2049];
        let err = RomImage::load(Cursor::new(data), None).unwrap_err();
        assert!(matches!(err, ImageError::NotAligned(2049)));
    }

    #[test]
    fn pads_tail_block_with_zero() {
        // 6 KiB file -> 2 blocks; block 0 full, block 1 = 2 KiB data + 2 KiB zero.
        let data = vec![0x5Au8; 6 * 1024];
        let image = RomImage::load(Cursor::new(data.clone()), None).unwrap();

        assert_eq!(image.orig_size(), 6144);
        assert_eq!(image.programmed_len(), 8192);
        assert_eq!(image.blocks().len(), 2);
        assert!(image.blocks()[0].0.iter().all(|&b| b == 0x5A));
        assert!(image.blocks()[1].0[..2048].iter().all(|&b| b == 0x5A));
        assert!(image.blocks()[1].0[2048..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn size_override_pads_with_full_zero_blocks() {
        // -size 32 with a 10 KiB file -> 8 blocks totaling 32 KiB.
        let data = vec![0x11u8; 10 * 1024];
        let image = RomImage::load(Cursor::new(data), Some(32)).unwrap();

        assert_eq!(image.orig_size(), 10 * 1024);
        assert_eq!(image.programmed_len(), 32 * 1024);
        assert_eq!(image.blocks().len(), 8);
        assert!(image.blocks()[2].0[2048..].iter().all(|&b| b == 0x00));
        assert!(image.blocks()[3..].iter().all(|b| b.0.iter().all(|&x| x == 0x00)));
    }

    #[test]
    fn rejects_file_exceeding_256kib_cap_without_override() {
        let data = vec![0u8; 257 * 1024];
        let err = RomImage::load(Cursor::new(data), None).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge(262_144)));
    }

    #[test]
    fn size_override_truncates_a_larger_file_instead_of_rejecting_it() {
        let data = vec![0x7Eu8; 40 * 1024];
        let image = RomImage::load(Cursor::new(data), Some(32)).unwrap();

        assert_eq!(image.programmed_len(), 32 * 1024);
        assert_eq!(image.orig_size(), 32 * 1024);
    }
}

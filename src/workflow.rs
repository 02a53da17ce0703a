//! Flash / verify workflow.
//!
//! Block-compares the image against the live device, erases and programs
//! only the blocks that differ, and — on a successful write — re-verifies
//! every block in a separate pass so a transient glitch during the write
//! loop can't mask itself.

use log::{debug, info};
use thiserror::Error;

use crate::image::{RomImage, BLOCK_SIZE};
use crate::planner::WindowPlan;
use crate::protocol::{self, CriticalSection, ProtocolError};
use crate::timer::CalibratedTimeout;
use crate::window::Device;

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("device protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("verification failed at block {block}, offset {offset:#x}")]
    VerifyFailed { block: usize, offset: usize },
}

/// Result of a flashing pass: either the device already matched the image,
/// or `n` blocks were erased and reprogrammed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashOutcome {
    AlreadyUpToDate,
    Flashed(usize),
}

fn block_matches(device: &dyn Device, dest_segment: u16, block: &crate::image::Block) -> bool {
    (0..BLOCK_SIZE).all(|i| device.read(dest_segment, i) == block.0[i])
}

fn first_mismatch(device: &dyn Device, dest_segment: u16, block: &crate::image::Block) -> usize {
    (0..BLOCK_SIZE)
        .find(|&i| device.read(dest_segment, i) != block.0[i])
        .unwrap_or(0)
}

pub(crate) fn dest_segment_for_block(plan: &WindowPlan, block_index: usize) -> u16 {
    plan.destination + (block_index as u16) * 0x100
}

/// Flashes every dirty block of `image` at the destination described by
/// `plan`, skipping blocks that already match (idempotence, and it avoids
/// wearing the flash). Held under a single critical section for the whole
/// dirty-block loop, released once the loop ends — this is the "every
/// disable is paired with an enable on all exit paths" invariant applied at
/// the granularity of the whole flashing pass rather than per command.
pub fn flash(
    device: &dyn Device,
    image: &RomImage,
    plan: &WindowPlan,
    timeout: &CalibratedTimeout,
    cs: &dyn CriticalSection,
) -> Result<FlashOutcome, WorkflowError> {
    let _guard = protocol::enter(cs);
    let mut flashed = 0usize;

    for (index, block) in image.blocks().iter().enumerate() {
        let dest_segment = dest_segment_for_block(plan, index);

        if block_matches(device, dest_segment, block) {
            continue;
        }

        debug!("block {} differs, erasing sector at segment {:04X}", index, dest_segment);
        protocol::erase_sector(device, plan.command_window, dest_segment, timeout)?;

        for (offset, &byte) in block.0.iter().enumerate() {
            protocol::program_byte(device, plan.command_window, dest_segment, offset, byte, timeout)?;
        }

        flashed += 1;
    }

    if flashed == 0 {
        info!("device already matches the image");
        Ok(FlashOutcome::AlreadyUpToDate)
    } else {
        info!("flashed {} block(s)", flashed);
        Ok(FlashOutcome::Flashed(flashed))
    }
}

/// Re-reads every block of `image` from the device described by `plan` and
/// compares it byte-for-byte. A separate pass from [`flash`], so a
/// transient glitch during the write loop can't self-mask.
pub fn verify(device: &dyn Device, image: &RomImage, plan: &WindowPlan) -> Result<(), WorkflowError> {
    for (index, block) in image.blocks().iter().enumerate() {
        let dest_segment = dest_segment_for_block(plan, index);

        if !block_matches(device, dest_segment, block) {
            return Err(WorkflowError::VerifyFailed {
                block: index,
                offset: first_mismatch(device, dest_segment, block),
            });
        }
    }

    Ok(())
}

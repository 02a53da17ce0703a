//! Process controller.
//!
//! Ties the rest of the crate together into the top-level run described by
//! the CLI: calibrate the polling timeout, plan the command window, detect
//! the device, warn on possible overlap, confirm with the user, flash, and
//! branch on the outcome. On real hardware a successful (or unsuccessful)
//! write is followed by a perpetual halt, since the running firmware has
//! just been overwritten — [`halt_forever`] is kept separate from [`run`]
//! so the decision logic stays unit-testable.

use log::{info, warn};

use crate::image::RomImage;
use crate::planner::{self, WindowPlan};
use crate::protocol::{self, CriticalSection, ProtocolError};
use crate::timer::{calibrate, CalibratedTimeout, TickSource};
use crate::window::Device;
use crate::workflow::{self, FlashOutcome, WorkflowError};

/// The "Continue Y/N?" prompt, an opaque external collaborator like the
/// memory map, tick source, and critical section.
pub trait Confirm {
    /// Returns `true` if the user answered yes (case-insensitive).
    fn confirm(&self, prompt: &str) -> bool;
}

/// Terminal result of a full programming run.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    /// The user declined the confirmation prompt; nothing was touched.
    Aborted,
    /// The software-ID bytes didn't match a known SST39SF0x0 part; nothing
    /// was touched.
    DeviceNotRecognized { vendor: u8, device: u8 },
    /// The device already matched the image; nothing was written.
    AlreadyUpToDate,
    /// `n` blocks were erased, reprogrammed, and verified.
    Flashed(usize),
    /// A command sequence timed out partway through programming; the
    /// device's contents are now indeterminate.
    DeviceCorrupt(ProtocolError),
    /// Programming completed but the post-write verify pass found a
    /// mismatch; the device's contents are now indeterminate.
    VerifyFailed { block: usize, offset: usize },
}

impl Outcome {
    /// Whether the CPU should halt forever after this outcome, because the
    /// firmware living at the destination has just been overwritten (or an
    /// attempt was made and failed partway through).
    pub fn should_halt(&self) -> bool {
        matches!(
            self,
            Outcome::Flashed(_) | Outcome::DeviceCorrupt(_) | Outcome::VerifyFailed { .. }
        )
    }
}

/// Runs calibration, planning, detection, confirmation, and flashing, and
/// returns the terminal [`Outcome`] without ever halting — that decision is
/// left to the caller via [`Outcome::should_halt`] and [`halt_forever`].
pub fn run(
    device: &dyn Device,
    tick: &dyn TickSource,
    cs: &dyn CriticalSection,
    confirm: &dyn Confirm,
    image: &RomImage,
    destination: u16,
) -> Outcome {
    let plan = planner::plan(destination, image.programmed_len());
    let timeout = calibrate(tick, device, plan.destination);

    let device_id = match protocol::detect_device(device, plan.command_window, plan.destination, cs) {
        Ok(id) => id,
        Err(ProtocolError::DeviceNotRecognized { vendor, device }) => {
            return Outcome::DeviceNotRecognized { vendor, device };
        }
        Err(other) => return Outcome::DeviceCorrupt(other),
    };

    info!(
        "detected {} at segment {:04X}, command window {:04X}",
        device_id.name(),
        plan.destination,
        plan.command_window
    );

    if planner::detect_overlap(device, &plan) {
        warn!(
            "command window {:04X} may overlap another option ROM",
            plan.command_window
        );
    }

    info!(
        "about to program {} byte(s) at segment {:04X} via command window {:04X}",
        plan.programmed_len, plan.destination, plan.command_window
    );

    if !confirm.confirm("Continue Y/N?") {
        return Outcome::Aborted;
    }

    program(device, image, &plan, &timeout, cs)
}

fn program(
    device: &dyn Device,
    image: &RomImage,
    plan: &WindowPlan,
    timeout: &CalibratedTimeout,
    cs: &dyn CriticalSection,
) -> Outcome {
    match workflow::flash(device, image, plan, timeout, cs) {
        Ok(FlashOutcome::AlreadyUpToDate) => Outcome::AlreadyUpToDate,
        Ok(FlashOutcome::Flashed(n)) => match workflow::verify(device, image, plan) {
            Ok(()) => Outcome::Flashed(n),
            Err(WorkflowError::VerifyFailed { block, offset }) => Outcome::VerifyFailed { block, offset },
            Err(WorkflowError::Protocol(e)) => Outcome::DeviceCorrupt(e),
        },
        Err(WorkflowError::Protocol(e)) => Outcome::DeviceCorrupt(e),
        Err(WorkflowError::VerifyFailed { block, offset }) => Outcome::VerifyFailed { block, offset },
    }
}

/// Halts the CPU forever. On real hardware the just-written ROM has
/// replaced the running firmware, so there is no safe way to return
/// control; this is the only correct terminal action after a write attempt.
pub fn halt_forever() -> ! {
    loop {
        std::hint::spin_loop();
    }
}

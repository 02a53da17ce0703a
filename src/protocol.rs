//! Device protocol.
//!
//! Issues SST39SF0x0 software command sequences — software ID, sector
//! erase, byte program — against a command window produced by
//! [`crate::planner`], with bounded polling built on the calibrated
//! timeout from [`crate::timer`].

use log::debug;
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

use crate::timer::{poll_until, CalibratedTimeout, ERASE_OUTER_ITERATIONS};
use crate::window::Device;

/// Unlock-cycle offset inside the 32 KiB command window.
const UNLOCK_ADDR_1: usize = 0x5555;
/// Unlock-cycle offset inside the 32 KiB command window.
const UNLOCK_ADDR_2: usize = 0x2AAA;

/// Recognized vendor/device pairs, packed as `(vendor << 8) | device`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
pub enum DeviceId {
    #[num_enum(default)]
    Unknown = 0xFFFF,
    Sst39Sf512 = 0xBFB4,
    Sst39Sf010 = 0xBFB5,
    Sst39Sf020 = 0xBFB6,
    Sst39Sf040 = 0xBFB7,
}

impl DeviceId {
    pub fn from_pair(vendor: u8, device: u8) -> DeviceId {
        DeviceId::from(((vendor as u16) << 8) | device as u16)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceId::Sst39Sf512 => "SST39SF512",
            DeviceId::Sst39Sf010 => "SST39SF010",
            DeviceId::Sst39Sf020 => "SST39SF020",
            DeviceId::Sst39Sf040 => "SST39SF040",
            DeviceId::Unknown => "unrecognized",
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, DeviceId::Unknown)
    }
}

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolError {
    #[error("device not recognized (vendor {vendor:#04x}, device {device:#04x})")]
    DeviceNotRecognized { vendor: u8, device: u8 },
    #[error("sector erase timed out")]
    EraseTimeout,
    #[error("byte program timed out at offset {offset:#x}")]
    ProgramTimeout { offset: usize },
}

/// An opaque scoped operation that suppresses maskable host interrupts for
/// the duration it is held.
///
/// Every command sequence in this module must run with interrupts disabled,
/// because an unrelated interrupt handler touching the same flash chip
/// mid-sequence would leave the device in an undefined state. Implemented
/// as a trait so the real disable/enable primitives stay an external
/// collaborator; [`enter`] returns an RAII guard so `enable` always runs on
/// every exit path, including early returns via `?`.
pub trait CriticalSection {
    fn disable(&self);
    fn enable(&self);
}

#[must_use]
pub struct CriticalSectionGuard<'a> {
    cs: &'a dyn CriticalSection,
}

impl<'a> Drop for CriticalSectionGuard<'a> {
    fn drop(&mut self) {
        self.cs.enable();
    }
}

pub fn enter<'a>(cs: &'a dyn CriticalSection) -> CriticalSectionGuard<'a> {
    cs.disable();
    CriticalSectionGuard { cs }
}

/// A critical section fixture that does nothing; adequate for tests that
/// don't assert on interrupt masking.
pub struct NullCriticalSection;

impl CriticalSection for NullCriticalSection {
    fn disable(&self) {}
    fn enable(&self) {}
}

/// Reads the software ID from the device at `dest_segment` through the
/// command window at `window_segment`, re-reading the vendor/device bytes
/// three times to let the bus settle before trusting the result.
///
/// The exact re-read count is empirical (the reference implementation this
/// protocol is derived from does it three times); don't drop it to one read,
/// devices have been observed to return stale data on the first read.
pub fn software_id(device: &dyn Device, window_segment: u16, dest_segment: u16) -> (u8, u8) {
    device.write(window_segment, UNLOCK_ADDR_1, 0xAA);
    device.write(window_segment, UNLOCK_ADDR_2, 0x55);
    device.write(window_segment, UNLOCK_ADDR_1, 0x90);

    let (mut vendor, mut device_byte) = (0u8, 0u8);
    for _ in 0..3 {
        vendor = device.read(dest_segment, 0);
        device_byte = device.read(dest_segment, 1);
    }

    device.write(window_segment, UNLOCK_ADDR_1, 0xF0);

    debug!("software id: vendor {:#04x} device {:#04x}", vendor, device_byte);
    (vendor, device_byte)
}

/// Runs the software-ID sequence and classifies the result, under its own
/// critical section since it's a single, standalone command sequence.
/// Returns the classified [`DeviceId`] on success; an unrecognized
/// vendor/device pair is reported as [`ProtocolError::DeviceNotRecognized`]
/// carrying the raw bytes, since the caller still needs them to report to
/// the user.
pub fn detect_device(
    device: &dyn Device,
    window_segment: u16,
    dest_segment: u16,
    cs: &dyn CriticalSection,
) -> Result<DeviceId, ProtocolError> {
    let _guard = enter(cs);
    let (vendor, device_byte) = software_id(device, window_segment, dest_segment);
    let id = DeviceId::from_pair(vendor, device_byte);

    if id.is_recognized() {
        Ok(id)
    } else {
        Err(ProtocolError::DeviceNotRecognized {
            vendor,
            device: device_byte,
        })
    }
}

/// Erases the 4 KiB sector at `dest_segment`, bounded by `timeout`'s erase
/// budget (1163 outer rounds of the calibrated ~215 us poll, ~250 ms total).
///
/// Does not manage its own critical section — callers that erase several
/// sectors in a row (see [`crate::workflow::flash`]) hold one critical
/// section across the whole dirty-block loop rather than re-entering it per
/// sector.
pub fn erase_sector(
    device: &dyn Device,
    window_segment: u16,
    dest_segment: u16,
    timeout: &CalibratedTimeout,
) -> Result<(), ProtocolError> {
    device.write(window_segment, UNLOCK_ADDR_1, 0xAA);
    device.write(window_segment, UNLOCK_ADDR_2, 0x55);
    device.write(window_segment, UNLOCK_ADDR_1, 0x80);
    device.write(window_segment, UNLOCK_ADDR_1, 0xAA);
    device.write(window_segment, UNLOCK_ADDR_2, 0x55);
    device.write(dest_segment, 0, 0x30);

    for _ in 0..ERASE_OUTER_ITERATIONS {
        if poll_until(device, dest_segment, 0, 0xFF, timeout.units()) {
            return Ok(());
        }
    }

    Err(ProtocolError::EraseTimeout)
}

/// Programs a single byte at `offset` within the block at `dest_segment`,
/// bounded by `timeout`'s program budget (one calibrated unit, ~215 us).
///
/// See [`erase_sector`] for why this doesn't manage its own critical
/// section.
pub fn program_byte(
    device: &dyn Device,
    window_segment: u16,
    dest_segment: u16,
    offset: usize,
    value: u8,
    timeout: &CalibratedTimeout,
) -> Result<(), ProtocolError> {
    device.write(window_segment, UNLOCK_ADDR_1, 0xAA);
    device.write(window_segment, UNLOCK_ADDR_2, 0x55);
    device.write(window_segment, UNLOCK_ADDR_1, 0xA0);
    device.write(dest_segment, offset, value);

    if poll_until(device, dest_segment, offset, value, timeout.units()) {
        Ok(())
    } else {
        Err(ProtocolError::ProgramTimeout { offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;

    use crate::timer::ScriptedTicks;
    use crate::window::{DeviceModel, ScratchMemoryMap};

    fn calibrated(device: &dyn Device, dest_segment: u16) -> CalibratedTimeout {
        crate::timer::calibrate(&ScriptedTicks::new(3), device, dest_segment)
    }

    #[test]
    fn device_id_maps_known_pairs() {
        assert_eq!(DeviceId::from_pair(0xBF, 0xB4), DeviceId::Sst39Sf512);
        assert_eq!(DeviceId::from_pair(0xBF, 0xB6), DeviceId::Sst39Sf020);
        assert_eq!(DeviceId::from_pair(0xBF, 0xB7), DeviceId::Sst39Sf040);
        assert_eq!(DeviceId::Sst39Sf020.name(), "SST39SF020");
    }

    #[test]
    fn device_id_rejects_unrecognized_pairs() {
        let id = DeviceId::from_pair(0xBF, 0x00);
        assert!(!id.is_recognized());
        assert_eq!(id.name(), "unrecognized");
    }

    #[test]
    fn software_id_reads_vendor_and_device_through_the_model() {
        let model = DeviceModel::new(0xBF, 0xB6);

        let (vendor, device) = software_id(&model, 0xC000, 0xC800);
        assert_eq_hex!(vendor, 0xBF);
        assert_eq_hex!(device, 0xB6);
    }

    #[test]
    fn detect_device_classifies_a_recognized_part() {
        let model = DeviceModel::new(0xBF, 0xB7);
        let cs = NullCriticalSection;

        let id = detect_device(&model, 0xC000, 0xC800, &cs).unwrap();
        assert_eq!(id, DeviceId::Sst39Sf040);
    }

    #[test]
    fn detect_device_reports_an_unrecognized_pair_as_a_protocol_error() {
        let model = DeviceModel::new(0xBF, 0x00);
        let cs = NullCriticalSection;

        let err = detect_device(&model, 0xC000, 0xC800, &cs).unwrap_err();
        match err {
            ProtocolError::DeviceNotRecognized { vendor, device } => {
                assert_eq_hex!(vendor, 0xBF);
                assert_eq_hex!(device, 0x00);
            }
            other => panic!("expected DeviceNotRecognized, got {:?}", other),
        }
    }

    #[test]
    fn erase_sector_succeeds_against_the_device_model() {
        let model = DeviceModel::new(0xBF, 0xB7);
        model.seed(0xC800, 0, 0x11);

        let timeout = calibrated(&model, 0xC800);
        assert!(erase_sector(&model, 0xC000, 0xC800, &timeout).is_ok());
        assert_eq!(model.read_raw(0xC800, 0), 0xFF);
    }

    #[test]
    fn erase_sector_times_out_when_byte_never_reads_0xff() {
        let mut scratch = ScratchMemoryMap::new();
        let map = scratch.memory_window();
        map.write(0xC800, 0, 0x00);

        // A zero-unit calibrated timeout makes every poll_until return
        // false immediately, so this exercises the bound without spinning
        // the full 1163 rounds. A plain scratch window never reflects the
        // erase's effect anyway, since it has no protocol state machine.
        let timeout = CalibratedTimeout::from_units(0);
        let err = erase_sector(&map, 0xC000, 0xC800, &timeout).unwrap_err();
        assert!(matches!(err, ProtocolError::EraseTimeout));
    }

    #[test]
    fn program_byte_succeeds_against_the_device_model() {
        let model = DeviceModel::new(0xBF, 0xB7);

        let timeout = calibrated(&model, 0xC800);
        assert!(program_byte(&model, 0xC000, 0xC800, 5, 0x42, &timeout).is_ok());
        assert_eq!(model.read_raw(0xC800, 5), 0x42);
    }

    #[test]
    fn program_byte_times_out_on_stuck_bit() {
        let mut scratch = ScratchMemoryMap::new();
        let map = scratch.memory_window();

        // A zero-unit timeout makes the poll fail regardless of what the
        // scratch window ends up holding, exercising the timeout path
        // without needing a device model that can actually get "stuck".
        let timeout = CalibratedTimeout::from_units(0);
        let err = program_byte(&map, 0xC000, 0xC800, 5, 0x42, &timeout).unwrap_err();
        assert!(matches!(err, ProtocolError::ProgramTimeout { offset: 5 }));
    }

    #[test]
    fn critical_section_guard_always_reenables_on_early_return() {
        use std::cell::Cell;

        struct CountingCs {
            disabled: Cell<u32>,
            enabled: Cell<u32>,
        }
        impl CriticalSection for CountingCs {
            fn disable(&self) {
                self.disabled.set(self.disabled.get() + 1);
            }
            fn enable(&self) {
                self.enabled.set(self.enabled.get() + 1);
            }
        }

        fn does_work(cs: &dyn CriticalSection, fail: bool) -> Result<(), ()> {
            let _guard = enter(cs);
            if fail {
                return Err(());
            }
            Ok(())
        }

        let cs = CountingCs {
            disabled: Cell::new(0),
            enabled: Cell::new(0),
        };

        let _ = does_work(&cs, true);
        let _ = does_work(&cs, false);

        assert_eq!(cs.disabled.get(), 2);
        assert_eq!(cs.enabled.get(), 2);
    }
}

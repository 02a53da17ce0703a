//! Tick timer / loop calibrator.
//!
//! The target host has no reliable short-interval timer, only the BIOS tick
//! byte advancing at ~18.2 Hz. [`calibrate`] measures how many iterations of
//! a flash-polling inner loop fit into one tick and returns that count as a
//! [`CalibratedTimeout`], scaled so that one unit is approximately 215 us.

use log::debug;

use crate::window::Device;

/// Source of the BIOS tick's least-significant byte.
///
/// Real hardware reads this from the BIOS data area; the test harness
/// supplies a fixture that advances deterministically.
pub trait TickSource {
    fn tick(&self) -> u8;
}

/// A 16-bit loop count equivalent to ~215 us of busy polling against the
/// destination flash device, derived once per run and never mutated
/// thereafter.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CalibratedTimeout(u16);

/// Number of outer iterations of a calibrated-unit poll that make up the
/// sector-erase timeout: 1163 * ~215 us ~= 250 ms, about 10x the datasheet's
/// 25 ms worst case.
pub const ERASE_OUTER_ITERATIONS: u32 = 1163;

impl CalibratedTimeout {
    /// Constructs a timeout directly from a precomputed unit count, for
    /// tests that don't want to race a [`TickSource`].
    pub fn from_units(units: u16) -> Self {
        CalibratedTimeout(units)
    }

    /// The raw calibrated unit count (~215 us per unit).
    pub fn units(&self) -> u16 {
        self.0
    }
}

/// Busy-polls `device.read(segment, offset)` up to `iterations` times,
/// returning `true` as soon as it reads `expected`, or `false` once
/// `iterations` is exhausted. This is the bounded polling primitive every
/// device-protocol timeout is built from; it always returns within
/// `iterations` spins regardless of device behavior.
pub fn poll_until(device: &dyn Device, segment: u16, offset: usize, expected: u8, iterations: u16) -> bool {
    for _ in 0..iterations {
        if device.read(segment, offset) == expected {
            return true;
        }
    }
    false
}

/// Measures the loop calibration against `dest_segment`, the destination
/// device's first byte, using `tick` as the BIOS tick source.
///
/// 1. Read the current tick LSB `t0`.
/// 2. Busy-wait until the tick advances past `t0`; call the new value `t1`.
/// 3. While the tick still reads `t1`, repeatedly poll the device (256 tries
///    per round, matching a value it will never actually produce) and count
///    the rounds.
/// 4. Return the round count, saturating at `0xFFFF`.
///
/// The polling loop deliberately reads the real destination device rather
/// than arbitrary memory, so its per-iteration latency reflects the slow
/// flash bus. If the tick never advances this loops forever, which is
/// acceptable on real hardware (the tick always runs) and is why the test
/// harness uses a [`TickSource`] fixture that advances quickly.
pub fn calibrate(tick: &dyn TickSource, device: &dyn Device, dest_segment: u16) -> CalibratedTimeout {
    let t0 = tick.tick();
    while tick.tick() == t0 {}
    let t1 = tick.tick();

    // A value the device is never expected to produce, so every poll_until
    // call below is a guaranteed miss and burns exactly 256 real-bus reads.
    let never_matches = device.read(dest_segment, 0).wrapping_add(1);

    let mut rounds: u32 = 0;
    while tick.tick() == t1 {
        let _ = poll_until(device, dest_segment, 0, never_matches, 256);
        rounds = rounds.saturating_add(1);
    }

    let units = rounds.min(0xFFFF) as u16;
    debug!("calibrated {} loop iterations per ~215us unit", units);
    CalibratedTimeout(units)
}

/// Test-harness tick source: advances by one on a fixed schedule instead of
/// racing a real 18.2 Hz counter, so [`calibrate`] terminates immediately.
pub struct ScriptedTicks {
    /// How many `tick()` calls to return the same value before advancing.
    dwell: u8,
    calls: std::cell::Cell<u32>,
}

impl ScriptedTicks {
    /// `dwell` calls to `tick()` return the same value before it advances by
    /// one; pick a small `dwell` (e.g. 4) to keep both busy-wait loops in
    /// [`calibrate`] short while still exercising more than one round.
    pub fn new(dwell: u8) -> Self {
        assert!(dwell > 0, "dwell must be nonzero or calibrate never advances");
        ScriptedTicks {
            dwell,
            calls: std::cell::Cell::new(0),
        }
    }
}

impl TickSource for ScriptedTicks {
    fn tick(&self) -> u8 {
        let n = self.calls.get();
        self.calls.set(n + 1);
        (n / self.dwell as u32) as u8
    }
}

// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! Register I/O (C1) and the device's fixed register map.
//!
//! These are the only legal ways to mutate device state outside of bulk streaming: a single
//! vendor control transfer per register, each with a 300ms timeout. See [`crate::usb::RawHandle`]
//! for the actual transfer plumbing; this module is the address book plus a couple of
//! conveniences (read-modify-write, polling) built on top of it.

use std::time::Duration;

use crate::error::Result;
use crate::usb::RawHandle;

/// PLL / clock control register, decoded per [`crate::pll`].
pub const REG_PLL: u16 = 0x8000;
/// Mode / DAC enable register. Bits 25-26 select palette lookup (single-channel mode).
pub const REG_DAC_CTRL: u16 = 0x8004;
/// I2C command register (C8).
pub const REG_I2C_CMD: u16 = 0x8020;
/// I2C read-data register (C8).
pub const REG_I2C_DATA_READ: u16 = 0x8024;
/// I2C write-data register (C8).
pub const REG_I2C_DATA_WRITE: u16 = 0x8028;
/// Palette RAM data register: write `(rgb24 << 8) | index`.
pub const REG_PALETTE_DATA: u16 = 0x805c;
/// Palette RAM read-pointer register; has a fixed off-by-one quirk versus the index it reads.
pub const REG_PALETTE_ADDR: u16 = 0x8060;

/// Bits 25/26 of [`REG_DAC_CTRL`] that enable palette lookup (single-channel mode).
pub const DAC_CTRL_PALETTE_ENABLE: u32 = (1 << 25) | (1 << 26);

/// The verbatim register initialization sequence applied on open: enables the DACs, disables
/// hsync/vsync emission, and parks the PLL at a safe low frequency. Values are device constants,
/// not computed, per the design notes ("kept as data, not code").
pub const INIT_SEQUENCE: &[(u16, u32)] = &[
    // Disable streaming while we configure the device.
    (REG_DAC_CTRL, 0x0000_0000),
    // Park the PLL at a safe, low, known-good frequency before anything else touches it.
    (REG_PLL, 0x0033_3e02),
    // Enable all three DACs, suppress hsync/vsync generation (blanking-free streaming mode).
    (REG_DAC_CTRL, 0x0700_0001),
];

/// Register I/O timeout for every control transfer (read and write).
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(300);

/// Reads a 32-bit device register (C1).
pub fn read(handle: &RawHandle, reg: u16) -> Result<u32> {
    handle.read_register(reg)
}

/// Writes a 32-bit device register (C1).
pub fn write(handle: &RawHandle, reg: u16, value: u32) -> Result<()> {
    handle.write_register(reg, value)
}

/// Applies the verbatim power-on register sequence.
pub(crate) fn apply_init_sequence(handle: &RawHandle) -> Result<()> {
    for &(reg, value) in INIT_SEQUENCE {
        write(handle, reg, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sequence_is_nonempty_and_sets_dac_enable_last() {
        assert!(!INIT_SEQUENCE.is_empty());
        let (reg, _) = *INIT_SEQUENCE.last().unwrap();
        assert_eq!(reg, REG_DAC_CTRL);
    }
}

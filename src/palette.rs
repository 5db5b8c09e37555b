// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! Palette and mode control (C4).
//!
//! The palette RAM holds 256 24-bit entries, between an 8-bit index byte and the three DAC
//! outputs. It backs single-channel mode (one sample stream driven through the lookup table) and
//! is otherwise used only to zero disabled DACs. Streaming-state guards for mode switches live in
//! [`crate::device`]; this module only programs registers.

use crate::error::Result;
use crate::registers::{self, REG_DAC_CTRL, REG_PALETTE_ADDR, REG_PALETTE_DATA};
use crate::usb::RawHandle;

/// Number of palette entries.
pub const PALETTE_SIZE: usize = 256;

/// Which of the three DACs a given operation applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Channels(u8);

impl Channels {
    /// The red DAC channel.
    pub const R: Channels = Channels(1 << 0);
    /// The green DAC channel.
    pub const G: Channels = Channels(1 << 1);
    /// The blue DAC channel.
    pub const B: Channels = Channels(1 << 2);
    /// No channels.
    pub const NONE: Channels = Channels(0);
    /// All three channels.
    pub const ALL: Channels = Channels(0b111);

    /// Returns whether `self` includes every channel set in `other`.
    pub const fn contains(self, other: Channels) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the channel mask containing every channel in either `self` or `other`.
    pub const fn union(self, other: Channels) -> Channels {
        Channels(self.0 | other.0)
    }
}

impl std::ops::BitOr for Channels {
    type Output = Channels;
    fn bitor(self, rhs: Channels) -> Channels {
        self.union(rhs)
    }
}

/// Streaming mode: whether R/G/B are three independent sample streams, or a single stream
/// mapped through the palette.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// A single sample stream driven through the 256-entry palette.
    SingleChan,
    /// Three independent sample streams, one per DAC.
    MultiChan,
}

fn pack_entry(rgb24: u32, index: u8) -> u32 {
    (rgb24 << 8) | index as u32
}

/// Writes all 256 palette entries and verifies each by reading it back through the
/// read-pointer register's +1 offset quirk. Mismatches are logged but not fatal.
pub fn load(handle: &RawHandle, table: &[u32; PALETTE_SIZE]) -> Result<()> {
    for (i, &rgb24) in table.iter().enumerate() {
        registers::write(handle, REG_PALETTE_DATA, pack_entry(rgb24, i as u8))?;
    }
    for (i, &rgb24) in table.iter().enumerate() {
        registers::write(handle, REG_PALETTE_ADDR, ((i as u32 + 1) & 0xff))?;
        let readback = registers::read(handle, REG_PALETTE_DATA)?;
        if (readback & 0x00ff_ffff) != (rgb24 & 0x00ff_ffff) {
            log::warn!(
                "palette verify mismatch at index {}: wrote {:#08x}, read {:#08x}",
                i, rgb24, readback
            );
        }
    }
    Ok(())
}

/// Builds a palette whose entries emit an 8-bit ramp on the enabled channels and zero on the
/// rest.
pub fn ramp_for_channels(channels: Channels) -> [u32; PALETTE_SIZE] {
    let mut table = [0u32; PALETTE_SIZE];
    for (i, entry) in table.iter_mut().enumerate() {
        let v = i as u32;
        let r = if channels.contains(Channels::R) { v } else { 0 };
        let g = if channels.contains(Channels::G) { v } else { 0 };
        let b = if channels.contains(Channels::B) { v } else { 0 };
        *entry = (r << 16) | (g << 8) | b;
    }
    table
}

/// Switches the device into single-channel (palette) mode: sets the palette-lookup bits and
/// programs the default red-channel ramp.
pub fn enable_singlechan(handle: &RawHandle) -> Result<()> {
    let current = registers::read(handle, REG_DAC_CTRL)?;
    registers::write(handle, REG_DAC_CTRL, current | registers::DAC_CTRL_PALETTE_ENABLE)?;
    load(handle, &ramp_for_channels(Channels::R))
}

/// Switches the device into multi-channel (direct DAC) mode: clears the palette-lookup bits.
pub fn enable_multichan(handle: &RawHandle) -> Result<()> {
    let current = registers::read(handle, REG_DAC_CTRL)?;
    registers::write(handle, REG_DAC_CTRL, current & !registers::DAC_CTRL_PALETTE_ENABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_zeroes_disabled_channels() {
        let table = ramp_for_channels(Channels::R);
        for (i, &entry) in table.iter().enumerate() {
            assert_eq!((entry >> 16) & 0xff, i as u32);
            assert_eq!((entry >> 8) & 0xff, 0);
            assert_eq!(entry & 0xff, 0);
        }
    }

    #[test]
    fn channels_union_and_contains() {
        let rg = Channels::R | Channels::G;
        assert!(rg.contains(Channels::R));
        assert!(rg.contains(Channels::G));
        assert!(!rg.contains(Channels::B));
        assert!(Channels::ALL.contains(rg));
    }
}

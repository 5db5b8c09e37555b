// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! The I2C bridge (C8): read/write a byte through the adapter's I2C master via a
//! register-mediated protocol.

use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::registers::{self, REG_I2C_CMD, REG_I2C_DATA_READ, REG_I2C_DATA_WRITE};
use crate::usb::RawHandle;

const GO_BIT: u32 = 1 << 28;
const READ_BIT: u32 = 1 << 7;
const DONE_BIT: u32 = 1 << 31;
const STATUS_MASK: u32 = 0x0f00_0000;
const PRESERVED_MASK: u32 = 0x3ffc_0000; // bits 18-29
const POLL_ATTEMPTS: u32 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn pack_command(current: u32, reg: u8, addr7: u8, read: bool) -> u32 {
    let preserved = current & PRESERVED_MASK;
    let mut word = preserved | GO_BIT | ((reg as u32) << 8) | (addr7 as u32 & 0x7f);
    if read {
        word |= READ_BIT;
    }
    word
}

fn poll_done(handle: &RawHandle) -> Result<u32> {
    for _ in 0..POLL_ATTEMPTS {
        let status = registers::read(handle, REG_I2C_CMD)?;
        if status & DONE_BIT != 0 {
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }
    Err(Error::Timeout)
}

fn check_slave_present(status: u32) -> Result<()> {
    if status & STATUS_MASK != 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

/// Reads 4 data bytes from I2C register `reg` on slave `addr7`.
pub fn read(handle: &RawHandle, addr7: u8, reg: u8) -> Result<[u8; 4]> {
    let current = registers::read(handle, REG_I2C_CMD)?;
    let cmd = pack_command(current, reg, addr7, true);
    registers::write(handle, REG_I2C_CMD, cmd)?;

    let status = poll_done(handle)?;
    check_slave_present(status)?;

    let word = registers::read(handle, REG_I2C_DATA_READ)?;
    Ok(word.to_le_bytes())
}

/// Writes 4 data bytes to I2C register `reg` on slave `addr7`.
pub fn write(handle: &RawHandle, addr7: u8, reg: u8, data: [u8; 4]) -> Result<()> {
    registers::write(handle, REG_I2C_DATA_WRITE, u32::from_le_bytes(data))?;

    let current = registers::read(handle, REG_I2C_CMD)?;
    let cmd = pack_command(current, reg, addr7, false);
    registers::write(handle, REG_I2C_CMD, cmd)?;

    let status = poll_done(handle)?;
    check_slave_present(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_command_sets_go_and_read_bits() {
        let word = pack_command(0, 0x12, 0x50, true);
        assert_ne!(word & GO_BIT, 0);
        assert_ne!(word & READ_BIT, 0);
        assert_eq!((word >> 8) & 0xff, 0x12);
        assert_eq!(word & 0x7f, 0x50);
    }

    #[test]
    fn pack_command_write_clears_read_bit() {
        let word = pack_command(0, 0x12, 0x50, false);
        assert_eq!(word & READ_BIT, 0);
    }

    #[test]
    fn check_slave_present_detects_nack() {
        assert!(check_slave_present(0).is_ok());
        assert_eq!(check_slave_present(0x0100_0000), Err(Error::NotFound));
    }
}

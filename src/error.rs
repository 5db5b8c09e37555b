// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! Error management.
//!
//! Control-plane calls (register I/O, mode switches, I2C, lifecycle) return a [`Result`]
//! synchronously. Data-plane failures (a stalled producer, a lost device) do not flow through
//! this type at all: they are absorbed by the streaming engine as counters and flags, per the
//! recovery policy described on [`crate::stream`].

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy for this crate.
///
/// Every variant maps to a control-plane failure mode named by the hardware's own protocol
/// quirks (I2C NACK, register short-read) or by the underlying USB stack. `Other` is the catch-all
/// for USB failures this crate does not otherwise classify; its payload is the raw `libusb`
/// return code, rendered via `libusb_strerror` where available.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A null pointer or an out-of-range argument was supplied (e.g. an adapter index with no
    /// matching device, a sample rate outside what the PLL can approach).
    InvalidParam,
    /// An allocation failed (transfer pool, kernel zero-copy buffer, ...).
    NoMem,
    /// The requested operation is illegal in the handle's current state, e.g. `start_tx` while
    /// already `RUNNING`, or `stop_tx` while `INACTIVE`.
    Busy,
    /// An I2C poll exhausted its retry budget without the done bit becoming set.
    Timeout,
    /// An I2C transaction completed but the target slave did not respond (NACK).
    NotFound,
    /// An unclassified USB failure; carries the raw `libusb` error code.
    Other(i32),
}

impl Error {
    /// Wraps a raw `libusb` return code (always negative per `libusb` convention) as an
    /// [`Error`], classifying the few codes this crate treats specially.
    pub(crate) fn from_libusb(code: i32) -> Self {
        match code {
            libusb1_sys::constants::LIBUSB_ERROR_INVALID_PARAM => Error::InvalidParam,
            libusb1_sys::constants::LIBUSB_ERROR_NO_MEM => Error::NoMem,
            libusb1_sys::constants::LIBUSB_ERROR_BUSY => Error::Busy,
            libusb1_sys::constants::LIBUSB_ERROR_TIMEOUT => Error::Timeout,
            libusb1_sys::constants::LIBUSB_ERROR_NOT_FOUND => Error::NotFound,
            other => Error::Other(other),
        }
    }

    /// Returns a human readable string for a raw `libusb` code, if the linked library exposes
    /// one, mirroring the pattern of looking up a C library's own error-to-string function
    /// rather than hand-maintaining a duplicate table.
    fn libusb_strerror(code: i32) -> Option<String> {
        let ptr = unsafe { libusb1_sys::libusb_strerror(code as libusb1_sys::constants::libusb_error) };
        if ptr.is_null() {
            return None;
        }
        let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
        Some(cstr.to_string_lossy().into_owned())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParam => write!(f, "invalid parameter"),
            Error::NoMem => write!(f, "allocation failed"),
            Error::Busy => write!(f, "operation invalid in current state"),
            Error::Timeout => write!(f, "i2c poll timed out"),
            Error::NotFound => write!(f, "i2c slave did not respond"),
            Error::Other(code) => match Error::libusb_strerror(*code) {
                Some(msg) => write!(f, "usb error {}: {}", code, msg),
                None => write!(f, "usb error {}", code),
            },
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_libusb_codes() {
        assert_eq!(Error::from_libusb(libusb1_sys::constants::LIBUSB_ERROR_TIMEOUT), Error::Timeout);
        assert_eq!(Error::from_libusb(libusb1_sys::constants::LIBUSB_ERROR_NOT_FOUND), Error::NotFound);
        assert_eq!(Error::from_libusb(libusb1_sys::constants::LIBUSB_ERROR_BUSY), Error::Busy);
    }

    #[test]
    fn unclassified_code_becomes_other() {
        match Error::from_libusb(libusb1_sys::constants::LIBUSB_ERROR_PIPE) {
            Error::Other(code) => assert_eq!(code, libusb1_sys::constants::LIBUSB_ERROR_PIPE),
            other => panic!("expected Other, got {:?}", other),
        }
    }
}

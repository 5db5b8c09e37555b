// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

#![warn(missing_docs)]

//! A host-side driver for the FL2000 USB-to-VGA bridge, repurposed as an 8-bit sample-rate DAC.
//!
//! The chip is a display adapter; this crate drives it with hsync/vsync generation suppressed and
//! the pixel clock reprogrammed to an arbitrary rate, turning its three 8-bit DAC channels (and, in
//! single-channel mode, its 256-entry palette) into a cheap streaming digital-to-analogue output.
//!
//! # Layout
//!
//! - [`usb`] and [`registers`] are the two layers beneath everything else: raw `libusb` calls, and
//!   the fixed register map built on top of them.
//! - [`pll`] solves for the clock divider nearest a requested sample rate.
//! - [`palette`] covers mode switching and the 256-entry palette RAM.
//! - [`format`] is the wire-layout byte permutation the streaming engine applies to every buffer.
//! - [`transfer`] is the bulk-transfer slot pool the streaming engine submits against.
//! - [`stream`] is the two-thread streaming engine itself: [`Producer`](stream::Producer) is the
//!   public hook applications implement.
//! - [`i2c`] is the I2C bridge exposed for driving downstream components (e.g. an external ADC or
//!   reference) through the same adapter.
//! - [`device`] ties all of the above into [`Device`], the crate's single public handle type.
//!
//! # Example
//!
//! ```no_run
//! use fl2000::{Device, Mode};
//!
//! let dev = Device::open(0)?;
//! dev.set_sample_rate(48_000.0)?;
//! dev.set_mode(Mode::MultiChan)?;
//! dev.start_tx(
//!     |frame: &mut fl2000::ProducerFrame<'_>| {
//!         frame.r.iter_mut().for_each(|b| *b = 0);
//!         frame.g.iter_mut().for_each(|b| *b = 0);
//!         frame.b.iter_mut().for_each(|b| *b = 0);
//!     },
//!     fl2000::DEFAULT_INFLIGHT,
//! )?;
//! # Ok::<(), fl2000::Error>(())
//! ```

mod device;
mod error;
mod format;
mod i2c;
mod palette;
mod pll;
mod registers;
mod stream;
mod transfer;
mod usb;

pub use device::{enumerate, name_of, AsyncStatus, Device, Stats};
pub use error::{Error, Result};
pub use palette::{Channels, Mode, PALETTE_SIZE};
pub use stream::{Producer, ProducerFrame};
pub use transfer::DEFAULT_INFLIGHT;

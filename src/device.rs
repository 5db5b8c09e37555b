// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! Device lifecycle (C3) and the crate's public entry points.
//!
//! A [`Device`] owns the USB context, the opened handle, the transfer pool (while streaming),
//! both worker threads, and the handful of cross-thread fields the streaming engine touches:
//! status, underflow counter, and the lost flag. Everything else is set before streaming begins
//! and not mutated while it runs (§3).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::palette::{self, Channels, Mode};
use crate::pll;
use crate::registers;
use crate::stream::{self, Producer, StreamThreads};
use crate::usb::{Context, RawHandle};

/// The three-valued streaming status (§3): only `Running` permits new work; `Canceling` is a
/// terminal-in-progress drain; `Inactive` is both the pre-start and post-drain rest state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AsyncStatus {
    /// No streaming in progress; `start_tx` may be called.
    Inactive,
    /// Streaming is active.
    Running,
    /// `stop_tx` has been requested; the engine is draining in-flight transfers.
    Canceling,
}

impl AsyncStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AsyncStatus::Inactive,
            1 => AsyncStatus::Running,
            _ => AsyncStatus::Canceling,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            AsyncStatus::Inactive => 0,
            AsyncStatus::Running => 1,
            AsyncStatus::Canceling => 2,
        }
    }
}

/// A read-only snapshot of streaming diagnostics, queryable without taking any lock that the
/// producer or pump thread holds.
#[derive(Debug, Copy, Clone)]
pub struct Stats {
    /// The streaming engine's current state.
    pub status: AsyncStatus,
    /// Cumulative count of producer underruns (resubmitted buffers the producer didn't refill
    /// in time).
    pub underflow_count: u64,
    /// Set once the device is observed gone (a fatal, non-cancellation transfer error).
    pub device_lost: bool,
    /// The currently programmed sample rate, in Hz.
    pub sample_rate_hz: f64,
    /// The currently configured mode.
    pub mode: Mode,
}

/// State shared between the `Device` handle and both streaming worker threads. Only the fields
/// documented as cross-thread (status, underflow counter, lost flag) are mutated once streaming
/// starts; everything else is set up before `start_tx` and read thereafter.
pub(crate) struct Shared {
    pub(crate) context: Context,
    pub(crate) handle: RawHandle,
    pub(crate) status: AtomicU8,
    pub(crate) underflow: AtomicU64,
    pub(crate) lost: AtomicBool,
    pub(crate) rate_hz: Mutex<f64>,
    pub(crate) mode: Mutex<Mode>,
    pub(crate) channels: Mutex<Channels>,
}

impl Shared {
    pub(crate) fn status(&self) -> AsyncStatus {
        AsyncStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, s: AsyncStatus) {
        self.status.store(s.as_u8(), Ordering::Release);
    }

    /// Atomically transitions the status from `old` to `new`; returns whether it succeeded.
    pub(crate) fn status_cas(&self, old: AsyncStatus, new: AsyncStatus) -> bool {
        self.status
            .compare_exchange(old.as_u8(), new.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// An opened FL2000 adapter, ready for register I/O, palette programming, and streaming.
pub struct Device {
    shared: Arc<Shared>,
    threads: Mutex<Option<StreamThreads>>,
}

/// Counts connected adapters matching the built-in vendor/product table.
pub fn enumerate() -> Result<usize> {
    Context::new()?.enumerate()
}

/// Returns a descriptive name for the `index`-th connected adapter.
pub fn name_of(index: usize) -> Result<String> {
    Context::new()?.name_of(index)
}

impl Device {
    /// Opens the `index`-th connected adapter (0-indexed), claims its bulk interface, and
    /// applies the power-on register sequence (§4.3).
    pub fn open(index: usize) -> Result<Device> {
        let context = Context::new()?;
        let handle = context.open(index)?;
        handle.claim_bulk_interface()?;
        registers::apply_init_sequence(&handle)?;

        let shared = Arc::new(Shared {
            context,
            handle,
            status: AtomicU8::new(AsyncStatus::Inactive.as_u8()),
            underflow: AtomicU64::new(0),
            lost: AtomicBool::new(false),
            rate_hz: Mutex::new(0.0),
            mode: Mutex::new(Mode::MultiChan),
            channels: Mutex::new(Channels::ALL),
        });

        Ok(Device { shared, threads: Mutex::new(None) })
    }

    /// Solves for and programs the PLL register closest to `hz`, storing the decoded rate as
    /// the device's effective sample rate (C2).
    pub fn set_sample_rate(&self, hz: f64) -> Result<()> {
        if hz <= 0.0 {
            return Err(Error::InvalidParam);
        }
        let (cfg, decoded) = pll::solve(hz);
        registers::write(&self.shared.handle, registers::REG_PLL, cfg.encode())?;
        *self.shared.rate_hz.lock().unwrap() = decoded;
        Ok(())
    }

    /// Returns the device's current effective sample rate.
    pub fn sample_rate(&self) -> f64 {
        *self.shared.rate_hz.lock().unwrap()
    }

    /// Switches between single-channel (palette) and multi-channel (direct DAC) modes.
    /// Rejected while streaming; idempotent otherwise.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        if self.shared.status() != AsyncStatus::Inactive {
            return Err(Error::Busy);
        }
        let mut current = self.shared.mode.lock().unwrap();
        if *current == mode {
            return Ok(());
        }
        match mode {
            Mode::SingleChan => palette::enable_singlechan(&self.shared.handle)?,
            Mode::MultiChan => palette::enable_multichan(&self.shared.handle)?,
        }
        *current = mode;
        Ok(())
    }

    /// Returns the device's current mode.
    pub fn mode(&self) -> Mode {
        *self.shared.mode.lock().unwrap()
    }

    /// Programs a palette whose entries emit ramps only on the enabled channels, zeroing the
    /// rest. Not guarded against concurrent streaming: palette writes during streaming are
    /// explicitly undefined behavior on the wire (§9), so this only logs a warning rather than
    /// rejecting the call outright.
    pub fn set_enabled_channels(&self, mask: Channels) -> Result<()> {
        if self.shared.status() != AsyncStatus::Inactive {
            log::warn!("set_enabled_channels called while streaming; palette contents during streaming are undefined");
        }
        palette::load(&self.shared.handle, &palette::ramp_for_channels(mask))?;
        *self.shared.channels.lock().unwrap() = mask;
        Ok(())
    }

    /// Returns the channel mask most recently programmed by `set_enabled_channels`.
    pub fn enabled_channels(&self) -> Channels {
        *self.shared.channels.lock().unwrap()
    }

    /// Loads a caller-supplied 256-entry palette verbatim.
    pub fn load_custom_palette(&self, table: &[u32; palette::PALETTE_SIZE]) -> Result<()> {
        palette::load(&self.shared.handle, table)
    }

    /// Starts the two-thread streaming engine (C7): a sample-producer thread driving `producer`,
    /// and a USB event-pump thread submitting/resubmitting transfers. `n_inflight` is the number
    /// of transfers kept on the wire at once (the pool itself holds `n_inflight + 2` slots).
    pub fn start_tx<P>(&self, producer: P, n_inflight: usize) -> Result<()>
    where
        P: Producer + 'static,
    {
        let mut threads = self.threads.lock().unwrap();
        if self.shared.status() != AsyncStatus::Inactive {
            return Err(Error::Busy);
        }
        let handles = stream::start(Arc::clone(&self.shared), producer, n_inflight)?;
        *threads = Some(handles);
        Ok(())
    }

    /// Requests the streaming engine stop. Idempotent and non-blocking: returns immediately once
    /// the state transition is recorded; the engine drains asynchronously (§5).
    pub fn stop_tx(&self) -> Result<()> {
        stream::request_stop(&self.shared)
    }

    /// A snapshot of streaming diagnostics.
    pub fn stats(&self) -> Stats {
        Stats {
            status: self.shared.status(),
            underflow_count: self.shared.underflow.load(Ordering::Relaxed),
            device_lost: self.shared.lost.load(Ordering::Relaxed),
            sample_rate_hz: self.sample_rate(),
            mode: self.mode(),
        }
    }

    /// Reads 4 data bytes from I2C register `reg` on slave `addr7` (C8).
    pub fn i2c_read(&self, addr7: u8, reg: u8) -> Result<[u8; 4]> {
        crate::i2c::read(&self.shared.handle, addr7, reg)
    }

    /// Writes 4 data bytes to I2C register `reg` on slave `addr7` (C8).
    pub fn i2c_write(&self, addr7: u8, reg: u8, data: [u8; 4]) -> Result<()> {
        crate::i2c::write(&self.shared.handle, addr7, reg, data)
    }

    /// Drains any in-flight streaming work, applies the (currently no-op) deinit sequence, and
    /// releases the interface. Spins with a bounded timeout rather than indefinitely, so a
    /// caller that drops a `Device` without calling `stop_tx` first cannot deadlock the process
    /// (§9 open question); a timeout is logged as an error since it means transfers may still be
    /// in flight when the handle is torn down.
    fn shutdown(&self) {
        if self.shared.status() != AsyncStatus::Inactive {
            let _ = stream::request_stop(&self.shared);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.shared.status() != AsyncStatus::Inactive && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.shared.status() != AsyncStatus::Inactive {
            log::error!("device closed with streaming still draining after 5s timeout");
        }
        if let Some(handles) = self.threads.lock().unwrap().take() {
            handles.join();
        }
        // The deinit sequence is currently a no-op placeholder, kept as an explicit step so a
        // future firmware revision that needs one has somewhere to put it.
    }

    /// Explicit close, equivalent to dropping the `Device` but returning once teardown has
    /// happened rather than relying on a tail-call drop.
    pub fn close(self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

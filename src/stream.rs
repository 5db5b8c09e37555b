// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! The streaming engine (C7): two long-lived threads — a sample-producer thread and a USB
//! event-pump thread — coordinating through the [`crate::transfer::TransferPool`] state machine.
//!
//! The producer thread never touches USB; the USB thread never touches producer state except
//! through the shared transfer pool guarded by its own mutex/condition pair (§2, §5).

use std::os::raw::c_void;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::{AsyncStatus, Shared};
use crate::error::{Error, Result};
use crate::format;
use crate::palette::{Channels, Mode};
use crate::transfer::{TransferPool, TRANSFER_LEN};

/// The per-call producer buffer length, constant across both modes (§4.7, §6): the slot buffer
/// is divided into three equal, 8-sample-group-aligned spans. `TRANSFER_LEN` (1,310,720) is not
/// itself a multiple of 3, so a small tail of each slot buffer (`TRANSFER_LEN - 3*PER_CALL_LEN`,
/// currently 8 bytes) is left zeroed padding rather than carrying sample data.
pub const PER_CALL_LEN: usize = (TRANSFER_LEN / 3) & !7;
const PAYLOAD_LEN: usize = PER_CALL_LEN * 3;

/// One invocation's worth of state handed to the producer callback (§6).
///
/// In multi-channel mode all three of `r`, `g`, `b` are live, `len` bytes each. In single-channel
/// mode only `r` is live; `g` and `b` are empty, and the engine calls the producer three times
/// per output transfer so each call still sees the same `len`.
pub struct ProducerFrame<'a> {
    /// Per-call buffer length, constant across a streaming session.
    pub len: usize,
    /// The cumulative underflow count as of this call.
    pub underflow_count: u64,
    /// Set by the engine on the one synthesized final call after device loss; never set on a
    /// normal call.
    pub device_error: bool,
    /// Set by the producer: `true` if its samples are two's-complement and need the +128 bias.
    pub signed: bool,
    pub r: &'a mut [u8],
    pub g: &'a mut [u8],
    pub b: &'a mut [u8],
}

/// A producer: supplies sample data synchronously when called. Implemented for any
/// `FnMut(&mut ProducerFrame) + Send` closure, so a C-style callback can be driven by an ordinary
/// boxed Rust closure.
pub trait Producer: Send {
    fn produce(&mut self, frame: &mut ProducerFrame<'_>);
}

impl<F> Producer for F
where
    F: FnMut(&mut ProducerFrame<'_>) + Send,
{
    fn produce(&mut self, frame: &mut ProducerFrame<'_>) {
        self(frame)
    }
}

/// Handle to the running engine's threads, owned by [`crate::device::Device`] while streaming.
pub(crate) struct StreamThreads {
    pump: JoinHandle<()>,
}

impl StreamThreads {
    pub(crate) fn join(self) {
        let _ = self.pump.join();
    }
}

/// Per-transfer data passed to the `libusb` completion callback as `user_data`. One is leaked
/// (via `Box::into_raw`) per slot at start and reclaimed by the pump thread once the pool is
/// fully drained.
struct CallbackCtx {
    shared: Arc<Shared>,
    pool: Arc<TransferPool>,
    slot: usize,
}

extern "C" fn completion_trampoline(transfer: *mut libusb1_sys::libusb_transfer) {
    let ctx = unsafe { &*((*transfer).user_data as *const CallbackCtx) };
    on_complete(&ctx.shared, &ctx.pool, ctx.slot);
}

/// Runs on the event-pump thread, inside `libusb_handle_events`. Never suspends (§5).
fn on_complete(shared: &Shared, pool: &TransferPool, slot: usize) {
    let status = pool.transfer_status(slot);
    let completed = status == libusb1_sys::constants::LIBUSB_TRANSFER_COMPLETED;
    let cancelled = status == libusb1_sys::constants::LIBUSB_TRANSFER_CANCELLED;
    let mut fatal = !completed && !cancelled;

    if completed && shared.status() == AsyncStatus::Running {
        if let Some(next) = pool.lowest_filled() {
            pool.mark_submitted(next);
            if pool.submit(next).is_err() {
                log::error!("submitting next filled buffer failed");
            }
            pool.mark_empty_and_signal(slot);
        } else {
            let count = shared.underflow.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("producer underrun (count={}), resubmitting buffer unchanged", count);
            if let Err(Error::Other(code)) = pool.submit(slot) {
                if code == libusb1_sys::constants::LIBUSB_ERROR_NO_DEVICE {
                    fatal = true;
                }
            }
        }
    }

    if fatal {
        shared.lost.store(true, Ordering::Release);
        let _ = request_stop(shared);
    }
    pool.signal();
}

/// Implements the `start_tx`/`stop_tx` state machine (§4.7): `Inactive -> Running` on start,
/// `Running -> Canceling` on stop (returning immediately), `Canceling -> Inactive` (forced) if
/// `stop_tx` is called again to snap out of a stuck drain, `Busy` from `Inactive`.
pub(crate) fn request_stop(shared: &Shared) -> Result<()> {
    loop {
        match shared.status() {
            AsyncStatus::Running => {
                if shared.status_cas(AsyncStatus::Running, AsyncStatus::Canceling) {
                    return Ok(());
                }
                // Lost the race with a concurrent transition; re-read and retry.
            }
            AsyncStatus::Canceling => {
                shared.set_status(AsyncStatus::Inactive);
                return Ok(());
            }
            AsyncStatus::Inactive => return Err(Error::Busy),
        }
    }
}

/// Starts the producer and pump threads. Only called from `Device::start_tx`, which has already
/// verified the engine is `Inactive`.
pub(crate) fn start<P>(shared: Arc<Shared>, producer: P, n_inflight: usize) -> Result<StreamThreads>
where
    P: Producer + 'static,
{
    let pool = Arc::new(TransferPool::alloc(&shared.handle, n_inflight)?);

    // Addresses, not raw pointers, cross the thread boundary below: a bare `*mut CallbackCtx` is
    // not `Send`, even though the pump thread is the sole owner of each one until it reclaims it.
    let mut ctxs = Vec::with_capacity(pool.len());
    for slot in 0..pool.len() {
        let ctx = Box::into_raw(Box::new(CallbackCtx {
            shared: Arc::clone(&shared),
            pool: Arc::clone(&pool),
            slot,
        }));
        pool.set_callback(slot, completion_trampoline, ctx as *mut c_void);
        ctxs.push(ctx as usize);
    }

    shared.set_status(AsyncStatus::Running);

    let producer_shared = Arc::clone(&shared);
    let producer_pool = Arc::clone(&pool);
    let mode = *shared.mode.lock().unwrap();
    let channels = *shared.channels.lock().unwrap();
    let producer_handle = std::thread::Builder::new()
        .name("fl2000-producer".into())
        .spawn(move || producer_thread(producer_shared, producer_pool, producer, mode, channels))
        .map_err(|_| Error::NoMem)?;

    let pump_shared = Arc::clone(&shared);
    let pump_handle = std::thread::Builder::new()
        .name("fl2000-usb-pump".into())
        .spawn(move || pump_thread(pump_shared, pool, producer_handle, n_inflight, ctxs))
        .map_err(|_| Error::NoMem)?;

    Ok(StreamThreads { pump: pump_handle })
}

fn zero_disabled_channels(buf: &mut [u8], channel: Channels, channels: Channels) {
    if !channels.contains(channel) {
        buf.iter_mut().for_each(|b| *b = 0);
    }
}

fn producer_thread<P>(shared: Arc<Shared>, pool: Arc<TransferPool>, mut producer: P, mode: Mode, channels: Channels)
where
    P: Producer,
{
    let mut r = vec![0u8; PER_CALL_LEN];
    let mut g = vec![0u8; PER_CALL_LEN];
    let mut b = vec![0u8; PER_CALL_LEN];
    let mut last_underflow = shared.underflow.load(Ordering::Relaxed);

    while shared.status() == AsyncStatus::Running {
        let signed = match mode {
            Mode::MultiChan => {
                let mut frame = ProducerFrame {
                    len: PER_CALL_LEN,
                    underflow_count: last_underflow,
                    device_error: false,
                    signed: false,
                    r: &mut r,
                    g: &mut g,
                    b: &mut b,
                };
                producer.produce(&mut frame);
                frame.signed
            }
            Mode::SingleChan => {
                let mut signed = false;
                for third in 0..3 {
                    let dest = match third {
                        0 => &mut r,
                        1 => &mut g,
                        _ => &mut b,
                    };
                    let mut frame = ProducerFrame {
                        len: PER_CALL_LEN,
                        underflow_count: last_underflow,
                        device_error: false,
                        signed: false,
                        r: dest,
                        g: &mut [],
                        b: &mut [],
                    };
                    producer.produce(&mut frame);
                    signed = frame.signed;
                }
                signed
            }
        };

        let current_underflow = shared.underflow.load(Ordering::Relaxed);
        if current_underflow != last_underflow {
            log::warn!("underflow count increased to {}", current_underflow);
        }
        last_underflow = current_underflow;

        let slot = match pool.acquire_empty() {
            Some(s) => s,
            None => {
                log::warn!("no empty transfer slot, dropping this callback's data");
                continue;
            }
        };

        if mode == Mode::MultiChan {
            zero_disabled_channels(&mut r, Channels::R, channels);
            zero_disabled_channels(&mut g, Channels::G, channels);
            zero_disabled_channels(&mut b, Channels::B, channels);
        }

        {
            let dest = pool.buffer_mut(slot);
            match mode {
                Mode::MultiChan => {
                    format::permute_multichan(&r, &g, &b, &mut dest[..PAYLOAD_LEN], signed);
                }
                Mode::SingleChan => {
                    format::permute_singlechan(&r, &mut dest[0..PER_CALL_LEN], signed);
                    format::permute_singlechan(&g, &mut dest[PER_CALL_LEN..2 * PER_CALL_LEN], signed);
                    format::permute_singlechan(&b, &mut dest[2 * PER_CALL_LEN..PAYLOAD_LEN], signed);
                }
            }
            for byte in &mut dest[PAYLOAD_LEN..] {
                *byte = 0;
            }
        }

        pool.mark_filled(slot);
    }

    if shared.lost.load(Ordering::Acquire) {
        let mut frame = ProducerFrame {
            len: PER_CALL_LEN,
            underflow_count: shared.underflow.load(Ordering::Relaxed),
            device_error: true,
            signed: false,
            r: &mut r,
            g: &mut g,
            b: &mut b,
        };
        producer.produce(&mut frame);
    }
}

fn pump_thread(
    shared: Arc<Shared>,
    pool: Arc<TransferPool>,
    producer_handle: JoinHandle<()>,
    n_inflight: usize,
    ctxs: Vec<usize>,
) {
    for slot in 0..n_inflight {
        if let Err(e) = pool.submit(slot) {
            log::error!("initial submit of slot {} failed: {}", slot, e);
        }
    }

    let ctx_ptr = shared.context.as_ptr();

    while shared.status() == AsyncStatus::Running {
        let mut tv = libc::timeval { tv_sec: 1, tv_usec: 0 };
        let rc = unsafe {
            libusb1_sys::libusb_handle_events_timeout_completed(ctx_ptr, &mut tv, std::ptr::null_mut())
        };
        if rc != 0 {
            log::error!("libusb_handle_events_timeout_completed failed: {}", crate::usb::strerror(rc));
        }
    }

    // Drain: request cancellation of every outstanding transfer and pump zero-timeout events
    // until each cancellation's completion has been delivered, or the device is known lost.
    loop {
        let mut all_done = true;
        for slot in 0..pool.len() {
            let status = pool.transfer_status(slot);
            if pool.tag_of(slot) == crate::transfer::SlotTag::Submitted
                && status != libusb1_sys::constants::LIBUSB_TRANSFER_CANCELLED
            {
                all_done = false;
                let _ = pool.cancel(slot);
            }
        }
        if all_done || shared.lost.load(Ordering::Acquire) {
            break;
        }
        let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
        unsafe {
            libusb1_sys::libusb_handle_events_timeout_completed(ctx_ptr, &mut tv, std::ptr::null_mut());
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    pool.signal();
    let _ = producer_handle.join();

    for addr in ctxs {
        unsafe {
            drop(Box::from_raw(addr as *mut CallbackCtx));
        }
    }
    drop(pool);

    shared.set_status(AsyncStatus::Inactive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_call_len_is_group_aligned_and_fits_transfer() {
        assert_eq!(PER_CALL_LEN % 8, 0);
        assert!(PAYLOAD_LEN <= TRANSFER_LEN);
        assert!(TRANSFER_LEN - PAYLOAD_LEN < 24);
    }
}

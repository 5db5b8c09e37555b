// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! The transfer pool (C5): N+2 bulk-transfer slots shared between the producer thread and the
//! USB event-pump thread.
//!
//! A slot is a (bulk transfer descriptor, sample buffer, metadata) triple. The pool is the only
//! shared mutable structure in this crate (§5): the slot-state field is the coordination
//! primitive, the producer only ever writes `Empty -> Filled`, and only the completion callback
//! (running on the pump thread, see [`crate::stream`]) writes `Filled -> Submitted` and
//! `Submitted -> Empty`.

use std::cell::UnsafeCell;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::usb::RawHandle;

/// Fixed transfer-buffer length: 256 Ki-samples x 5 bytes/sample-group, tuned so each transfer
/// spans a coherent DAC frame.
pub const TRANSFER_LEN: usize = 1_310_720;

/// Default number of in-flight submissions the caller may request.
pub const DEFAULT_INFLIGHT: usize = 4;

/// A slot's place in the producer/pump handoff.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SlotTag {
    Empty,
    Filled,
    Submitted,
}

enum SlotBuffer {
    /// Kernel-mmap'ed zero-copy buffer (Linux only); freed via `libusb_dev_mem_free`.
    Kernel { ptr: *mut u8, len: usize },
    /// Ordinary heap allocation, used on non-Linux platforms or when zero-copy is unavailable
    /// or found to be buggy.
    Heap(Box<[u8]>),
}

impl SlotBuffer {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            SlotBuffer::Kernel { ptr, .. } => *ptr,
            SlotBuffer::Heap(b) => b.as_mut_ptr(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            SlotBuffer::Kernel { ptr, len } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
            SlotBuffer::Heap(b) => b,
        }
    }
}

struct Slot {
    transfer: *mut libusb1_sys::libusb_transfer,
    // `UnsafeCell` because the producer thread and the pump thread's completion callback both
    // need mutable access to a slot's buffer through a shared `Arc<TransferPool>`. Safety rests
    // entirely on the slot-tag protocol in `PoolState`: a slot is only ever written to by the one
    // thread that currently owns it (`Empty` -> producer may fill, `Filled`/`Submitted` ->
    // producer must not touch it again until it observes `Empty`).
    buffer: UnsafeCell<SlotBuffer>,
}

/// N+2 transfer slots plus the synchronization state the producer and pump threads coordinate
/// through. Not constructed directly; see [`TransferPool::alloc`].
pub(crate) struct TransferPool {
    slots: Vec<Slot>,
    state: Mutex<PoolState>,
    cvar: Condvar,
    device_handle_ptr: *mut libusb1_sys::libusb_device_handle,
}

struct PoolState {
    tags: Vec<SlotTag>,
    seqs: Vec<u64>,
    next_seq: u64,
}

// Slot ownership is mediated entirely by `PoolState::tags` under the mutex (or, for the
// completion callback, by the pump thread owning exactly the one slot libusb just handed back);
// the raw pointers inside `Slot` are never touched without that discipline holding.
unsafe impl Send for TransferPool {}
unsafe impl Sync for TransferPool {}

extern "C" fn noop_callback(_transfer: *mut libusb1_sys::libusb_transfer) {}

impl TransferPool {
    /// Allocates `n_inflight + 2` slots: descriptors, buffers (kernel zero-copy where available
    /// and not known-buggy, heap otherwise), and metadata, then binds each transfer to the bulk
    /// endpoint. The two surplus slots let the producer fill ahead while `n_inflight` are on the
    /// wire.
    pub(crate) fn alloc(handle: &RawHandle, n_inflight: usize) -> Result<Self> {
        let total = n_inflight + 2;
        let mut buffers = Self::alloc_buffers(handle, total);

        let mut slots = Vec::with_capacity(total);
        for mut buffer in buffers.drain(..) {
            let transfer = unsafe { libusb1_sys::libusb_alloc_transfer(0) };
            if transfer.is_null() {
                return Err(Error::NoMem);
            }
            let ptr = buffer.as_mut_ptr();
            unsafe {
                libusb1_sys::libusb_fill_bulk_transfer(
                    transfer,
                    handle.as_ptr(),
                    RawHandle::endpoint(),
                    ptr,
                    TRANSFER_LEN as c_int,
                    noop_callback,
                    ptr::null_mut(),
                    0,
                );
            }
            slots.push(Slot { transfer, buffer: UnsafeCell::new(buffer) });
        }

        let tags = vec![SlotTag::Empty; total];
        let seqs = vec![0u64; total];

        Ok(TransferPool {
            slots,
            state: Mutex::new(PoolState { tags, seqs, next_seq: 0 }),
            cvar: Condvar::new(),
            device_handle_ptr: handle.as_ptr(),
        })
    }

    fn alloc_buffers(handle: &RawHandle, total: usize) -> Vec<SlotBuffer> {
        if let Some(buffers) = Self::try_alloc_kernel_buffers(handle, total) {
            return buffers;
        }
        (0..total).map(|_| SlotBuffer::Heap(vec![0u8; TRANSFER_LEN].into_boxed_slice())).collect()
    }

    #[cfg(target_os = "linux")]
    fn try_alloc_kernel_buffers(handle: &RawHandle, total: usize) -> Option<Vec<SlotBuffer>> {
        let mut buffers = Vec::with_capacity(total);
        for _ in 0..total {
            let ptr = unsafe { libusb1_sys::libusb_dev_mem_alloc(handle.as_ptr(), TRANSFER_LEN) };
            if ptr.is_null() {
                Self::free_kernel_buffers(handle, &mut buffers);
                return None;
            }
            buffers.push(SlotBuffer::Kernel { ptr, len: TRANSFER_LEN });
        }

        // Detect a known kernel bug where mmap'ed pages are not zero-initialized: read the first
        // byte of each buffer and compare the rest to it. Any non-zero or non-uniform buffer
        // means we must not trust zero-copy on this kernel.
        for buf in &mut buffers {
            let slice = buf.as_mut_slice();
            let first = slice[0];
            if first != 0 || !slice.iter().all(|&b| b == first) {
                log::warn!("kernel zero-copy buffers are not zero-initialized, falling back to heap buffers");
                Self::free_kernel_buffers(handle, &mut buffers);
                return None;
            }
        }

        Some(buffers)
    }

    #[cfg(not(target_os = "linux"))]
    fn try_alloc_kernel_buffers(_handle: &RawHandle, _total: usize) -> Option<Vec<SlotBuffer>> {
        None
    }

    #[cfg(target_os = "linux")]
    fn free_kernel_buffers(handle: &RawHandle, buffers: &mut Vec<SlotBuffer>) {
        for buf in buffers.drain(..) {
            if let SlotBuffer::Kernel { ptr, len } = buf {
                unsafe {
                    libusb1_sys::libusb_dev_mem_free(handle.as_ptr(), ptr, len);
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Acquires a mutable view of slot `slot`'s buffer for in-place permutation, avoiding an
    /// extra copy through an intermediate `Vec`. Safe to call concurrently with the pump thread
    /// only because the caller (the producer thread) holds a slot it alone owns per the
    /// `Empty`-acquired protocol documented on `Slot`.
    pub(crate) fn buffer_mut(&self, slot: usize) -> &mut [u8] {
        unsafe { (*self.slots[slot].buffer.get()).as_mut_slice() }
    }

    /// Scans for an `Empty` slot. If none is found, waits on the condition variable once, then
    /// rescans; if still none, returns `None` (the caller logs and drops this callback's data,
    /// per the backpressure-as-drop policy).
    pub(crate) fn acquire_empty(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = Self::find_tag(&state.tags, SlotTag::Empty) {
            return Some(slot);
        }
        let (guard, timeout) = self
            .cvar
            .wait_timeout(state, Duration::from_millis(1000))
            .unwrap();
        state = guard;
        if timeout.timed_out() {
            log::debug!("timed out waiting for an empty transfer slot");
        }
        Self::find_tag(&state.tags, SlotTag::Empty)
    }

    fn find_tag(tags: &[SlotTag], tag: SlotTag) -> Option<usize> {
        tags.iter().position(|&t| t == tag)
    }

    /// Marks `slot` `Filled` and assigns it the next monotonic sequence number. Only ever
    /// called from the producer thread.
    pub(crate) fn mark_filled(&self, slot: usize) -> u64 {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tags[slot] = SlotTag::Filled;
        state.seqs[slot] = seq;
        seq
    }

    /// Returns the `Filled` slot with the smallest sequence number, if any (FIFO playback
    /// order). Only ever called from the pump thread.
    pub(crate) fn lowest_filled(&self) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state
            .tags
            .iter()
            .enumerate()
            .filter(|&(_, &t)| t == SlotTag::Filled)
            .min_by_key(|&(i, _)| state.seqs[i])
            .map(|(i, _)| i)
    }

    pub(crate) fn mark_submitted(&self, slot: usize) {
        let mut state = self.state.lock().unwrap();
        state.tags[slot] = SlotTag::Submitted;
    }

    /// Marks `slot` `Empty` and wakes any producer waiting for one.
    pub(crate) fn mark_empty_and_signal(&self, slot: usize) {
        {
            let mut state = self.state.lock().unwrap();
            state.tags[slot] = SlotTag::Empty;
        }
        self.cvar.notify_one();
    }

    pub(crate) fn signal(&self) {
        self.cvar.notify_one();
    }

    pub(crate) fn tag_of(&self, slot: usize) -> SlotTag {
        self.state.lock().unwrap().tags[slot]
    }

    /// Submits slot `slot`'s transfer to the endpoint. Used both for the initial `n_inflight`
    /// submissions at start and for every resubmission the completion callback performs.
    pub(crate) fn submit(&self, slot: usize) -> Result<()> {
        let rc = unsafe { libusb1_sys::libusb_submit_transfer(self.slots[slot].transfer) };
        if rc != 0 {
            return Err(Error::from_libusb(rc));
        }
        Ok(())
    }

    /// Requests cancellation of slot `slot`'s transfer. A no-op (returns `Ok`) if the transfer
    /// has already completed or been cancelled; `libusb` reports that as `LIBUSB_ERROR_NOT_FOUND`.
    pub(crate) fn cancel(&self, slot: usize) -> Result<()> {
        let rc = unsafe { libusb1_sys::libusb_cancel_transfer(self.slots[slot].transfer) };
        if rc != 0 && rc != libusb1_sys::constants::LIBUSB_ERROR_NOT_FOUND {
            return Err(Error::from_libusb(rc));
        }
        Ok(())
    }

    pub(crate) fn transfer_status(&self, slot: usize) -> i32 {
        unsafe { (*self.slots[slot].transfer).status }
    }

    /// Rebinds slot `slot`'s completion callback and `user_data`, replacing the placeholder bound
    /// at [`TransferPool::alloc`] time. Called once per slot, before the first submission.
    pub(crate) fn set_callback(
        &self,
        slot: usize,
        callback: libusb1_sys::libusb_transfer_cb_fn,
        user_data: *mut c_void,
    ) {
        unsafe {
            (*self.slots[slot].transfer).callback = callback;
            (*self.slots[slot].transfer).user_data = user_data;
        }
    }
}

impl Drop for TransferPool {
    /// Only safe to drop after both worker threads have exited: frees every transfer descriptor
    /// and releases each buffer through the route it came from.
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let SlotBuffer::Kernel { ptr, len } = slot.buffer.get_mut() {
                unsafe {
                    libusb1_sys::libusb_dev_mem_free(self.device_handle_ptr, *ptr, *len);
                }
            }
            unsafe {
                libusb1_sys::libusb_free_transfer(slot.transfer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state(n: usize) -> PoolState {
        PoolState { tags: vec![SlotTag::Empty; n], seqs: vec![0; n], next_seq: 0 }
    }

    #[test]
    fn fifo_ordering_by_sequence() {
        let mut st = fresh_state(4);
        st.tags[0] = SlotTag::Filled;
        st.seqs[0] = 5;
        st.tags[1] = SlotTag::Filled;
        st.seqs[1] = 2;
        st.tags[2] = SlotTag::Submitted;
        let lowest = st
            .tags
            .iter()
            .enumerate()
            .filter(|&(_, &t)| t == SlotTag::Filled)
            .min_by_key(|&(i, _)| st.seqs[i])
            .map(|(i, _)| i);
        assert_eq!(lowest, Some(1));
    }

    proptest::proptest! {
        #[test]
        fn at_most_n_slots_submitted(ops in proptest::collection::vec(0usize..3, 1..200)) {
            // ops: 0 = try fill an empty slot, 1 = submit lowest filled, 2 = complete a submitted slot
            const N: usize = 4;
            const TOTAL: usize = N + 2;
            let mut tags = vec![SlotTag::Empty; TOTAL];
            let mut seqs = vec![0u64; TOTAL];
            let mut next_seq = 0u64;

            for op in ops {
                match op {
                    0 => {
                        if let Some(i) = tags.iter().position(|&t| t == SlotTag::Empty) {
                            tags[i] = SlotTag::Filled;
                            seqs[i] = next_seq;
                            next_seq += 1;
                        }
                    }
                    1 => {
                        let submitted = tags.iter().filter(|&&t| t == SlotTag::Submitted).count();
                        if submitted < N {
                            if let Some(i) = tags
                                .iter()
                                .enumerate()
                                .filter(|&(_, &t)| t == SlotTag::Filled)
                                .min_by_key(|&(i, _)| seqs[i])
                                .map(|(i, _)| i)
                            {
                                tags[i] = SlotTag::Submitted;
                            }
                        }
                    }
                    _ => {
                        if let Some(i) = tags.iter().position(|&t| t == SlotTag::Submitted) {
                            tags[i] = SlotTag::Empty;
                        }
                    }
                }

                let submitted = tags.iter().filter(|&&t| t == SlotTag::Submitted).count();
                proptest::prop_assert!(submitted <= N);
                for &t in &tags {
                    proptest::prop_assert!(t == SlotTag::Empty || t == SlotTag::Filled || t == SlotTag::Submitted);
                }
            }
        }
    }
}

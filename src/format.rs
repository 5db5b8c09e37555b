// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! Format permutation (C6): remaps producer linear sample buffers into the FL2000's on-wire
//! byte order.
//!
//! The device packs samples in groups that do not correspond to a simple interleave; these
//! permutations are empirically determined from the hardware and must be reproduced
//! byte-for-byte. See spec §4.6 / §8 for the bijection and involution properties these satisfy.

/// Output offsets, within each 24-byte group, that the red channel's 8 input samples land on,
/// in input order.
pub const RED_OFFSETS: [usize; 8] = [6, 1, 12, 15, 10, 21, 16, 19];
/// Output offsets for the green channel.
pub const GREEN_OFFSETS: [usize; 8] = [5, 0, 3, 14, 9, 20, 23, 18];
/// Output offsets for the blue channel.
pub const BLUE_OFFSETS: [usize; 8] = [4, 7, 2, 13, 8, 11, 22, 17];

const GROUP_SAMPLES: usize = 8;
const GROUP_BYTES: usize = 24;

#[inline]
fn biased(sample: u8, signed: bool) -> u8 {
    if signed {
        sample.wrapping_add(128)
    } else {
        sample
    }
}

/// Permutes three linear per-channel sample buffers into the multi-channel on-wire layout.
///
/// `r`, `g`, `b` must all have the same length, a multiple of 8. `out` must be exactly
/// `3 * r.len()` bytes. `signed` applies the +128 bias used to map two's-complement producer
/// samples into the DAC's unsigned byte space.
pub fn permute_multichan(r: &[u8], g: &[u8], b: &[u8], out: &mut [u8], signed: bool) {
    debug_assert_eq!(r.len(), g.len());
    debug_assert_eq!(r.len(), b.len());
    debug_assert_eq!(r.len() % GROUP_SAMPLES, 0);
    debug_assert_eq!(out.len(), r.len() * 3);

    let groups = r.len() / GROUP_SAMPLES;
    for group in 0..groups {
        let in_base = group * GROUP_SAMPLES;
        let out_base = group * GROUP_BYTES;
        for j in 0..GROUP_SAMPLES {
            out[out_base + RED_OFFSETS[j]] = biased(r[in_base + j], signed);
            out[out_base + GREEN_OFFSETS[j]] = biased(g[in_base + j], signed);
            out[out_base + BLUE_OFFSETS[j]] = biased(b[in_base + j], signed);
        }
    }
}

/// Permutes a single linear sample buffer into the single-channel (palette-driven) on-wire
/// layout: every 8-byte group has its two 32-bit words swapped, plus the optional sign bias.
///
/// `input` and `out` must be the same length, a multiple of 8.
pub fn permute_singlechan(input: &[u8], out: &mut [u8], signed: bool) {
    debug_assert_eq!(input.len(), out.len());
    debug_assert_eq!(input.len() % 8, 0);

    for chunk_start in (0..input.len()).step_by(8) {
        let chunk = &input[chunk_start..chunk_start + 8];
        for i in 0..4 {
            out[chunk_start + i] = biased(chunk[4 + i], signed);
            out[chunk_start + 4 + i] = biased(chunk[i], signed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multichan_offsets_partition_the_group() {
        let mut seen = [false; GROUP_BYTES];
        for &off in RED_OFFSETS.iter().chain(GREEN_OFFSETS.iter()).chain(BLUE_OFFSETS.iter()) {
            assert!(!seen[off], "offset {} claimed by more than one channel", off);
            seen[off] = true;
        }
        assert!(seen.iter().all(|&s| s), "not every output offset is covered");
    }

    #[test]
    fn scenario_6_matches_spec_example() {
        let r: Vec<u8> = (0..8).collect();
        let g: Vec<u8> = (8..16).collect();
        let b: Vec<u8> = (16..24).collect();
        let mut out = [0u8; 24];
        permute_multichan(&r, &g, &b, &mut out, false);

        for (j, &off) in RED_OFFSETS.iter().enumerate() {
            assert_eq!(out[off], r[j]);
        }
        for (j, &off) in GREEN_OFFSETS.iter().enumerate() {
            assert_eq!(out[off], g[j]);
        }
        for (j, &off) in BLUE_OFFSETS.iter().enumerate() {
            assert_eq!(out[off], b[j]);
        }
    }

    #[test]
    fn singlechan_is_involution_with_zero_bias() {
        let input: Vec<u8> = (0..64u8).collect();
        let mut once = vec![0u8; input.len()];
        permute_singlechan(&input, &mut once, false);
        let mut twice = vec![0u8; input.len()];
        permute_singlechan(&once, &mut twice, false);
        assert_eq!(twice, input);
    }

    #[test]
    fn signed_bias_shifts_every_byte_by_128() {
        let input: Vec<u8> = (0..64u8).collect();
        let mut unsigned = vec![0u8; input.len()];
        let mut signed = vec![0u8; input.len()];
        permute_singlechan(&input, &mut unsigned, false);
        permute_singlechan(&input, &mut signed, true);
        for (u, s) in unsigned.iter().zip(signed.iter()) {
            assert_eq!(*s, u.wrapping_add(128));
        }
    }

    proptest::proptest! {
        #[test]
        fn multichan_signed_bias_is_always_plus_128(
            r in proptest::collection::vec(proptest::prelude::any::<u8>(), 8),
            g in proptest::collection::vec(proptest::prelude::any::<u8>(), 8),
            b in proptest::collection::vec(proptest::prelude::any::<u8>(), 8),
        ) {
            let mut unsigned = [0u8; 24];
            let mut signed = [0u8; 24];
            permute_multichan(&r, &g, &b, &mut unsigned, false);
            permute_multichan(&r, &g, &b, &mut signed, true);
            for (u, s) in unsigned.iter().zip(signed.iter()) {
                proptest::prop_assert_eq!(*s, u.wrapping_add(128));
            }
        }
    }
}

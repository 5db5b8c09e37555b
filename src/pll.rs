// Copyright 2026 The fl2000 Authors
//
// This file is part of the fl2000 streaming runtime.
//
// Licensed under the MIT license or the Apache license (version 2.0), at your option. You may not
// copy, modify, or distribute this file except in compliance with said license. You can find copies
// of these licenses either in the LICENSE-MIT and LICENSE-APACHE files, or alternatively at
// <http://opensource.org/licenses/MIT> and <http://www.apache.org/licenses/LICENSE-2.0>
// respectively.

//! The PLL solver (C2): maps a requested sample rate onto the FL2000's clock-divider register.
//!
//! The device clocks its DACs from a single PLL fed by a fixed 160MHz reference. There is no
//! closed-form inverse from a target rate to the divider/multiplier fields, so this searches the
//! (small) reachable space exhaustively and keeps the closest match.

use std::cmp::Ordering;

/// Reference clock feeding the PLL, in Hz.
pub const REFERENCE_CLOCK_HZ: f64 = 160_000_000.0;

const MULT_CANDIDATES: [u32; 4] = [6, 5, 4, 3];
const DIV_MIN: u32 = 2;
const DIV_MAX: u32 = 63;
const FRAC_MIN: u32 = 1;
const FRAC_MAX: u32 = 15;
/// Higher output dividers are disallowed: they inject phase noise, so the search fixes this at 1.
const OUT_DIV: u32 = 1;

/// A decoded PLL configuration word.
///
/// Bit layout: bits 0-5 `div` (2..=63), bits 8-11 `out_div` (1..=15, always 1 here), bits 16-19
/// `frac` (1..=15), bits 20-23 `mult` (3..=6, one of `{6,5,4,3}`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PllConfig {
    pub div: u32,
    pub out_div: u32,
    pub frac: u32,
    pub mult: u32,
}

impl PllConfig {
    /// Packs this configuration into the 32-bit register word the device expects.
    pub fn encode(&self) -> u32 {
        (self.div & 0x3f)
            | ((self.out_div & 0xf) << 8)
            | ((self.frac & 0xf) << 16)
            | ((self.mult & 0xf) << 20)
    }

    /// Unpacks a register word into its constituent fields.
    pub fn decode(word: u32) -> Self {
        PllConfig {
            div: word & 0x3f,
            out_div: (word >> 8) & 0xf,
            frac: (word >> 16) & 0xf,
            mult: (word >> 20) & 0xf,
        }
    }

    /// Computes the sample rate this configuration actually produces, in Hz.
    ///
    /// `base` is the integer-multiplied, divided reference clock. `offset` is a fractional step
    /// spaced at roughly half the pixel clock, scaled to Hz; `frac` selects how many such steps
    /// to add before the final output division.
    pub fn decoded_rate(&self) -> f64 {
        let base = (REFERENCE_CLOCK_HZ * self.mult as f64) / self.div as f64;
        let offset = (base / (REFERENCE_CLOCK_HZ * self.mult as f64 / 5.0)) * 1.0e6;
        (base + offset * self.frac as f64) / self.out_div as f64
    }
}

/// Searches the reachable PLL configuration space for the one whose decoded rate is closest to
/// `target_hz`, returning the configuration and its actual decoded rate.
///
/// Search order is `mult` descending over `{6,5,4,3}` (6 first, for spectral purity), `div`
/// descending over `[63,2]`, `frac` ascending over `[1,15]`, with `out_div` fixed at 1. The first
/// exact or near-minimum match wins: ties are broken by keeping whichever candidate was found
/// first in this iteration order.
pub fn solve(target_hz: f64) -> (PllConfig, f64) {
    let mut best = PllConfig { div: DIV_MIN, out_div: OUT_DIV, frac: FRAC_MIN, mult: MULT_CANDIDATES[0] };
    let mut best_rate = best.decoded_rate();
    let mut best_err = (best_rate - target_hz).abs();

    for &mult in &MULT_CANDIDATES {
        for div in (DIV_MIN..=DIV_MAX).rev() {
            for frac in FRAC_MIN..=FRAC_MAX {
                let cfg = PllConfig { div, out_div: OUT_DIV, frac, mult };
                let rate = cfg.decoded_rate();
                let err = (rate - target_hz).abs();
                if err.partial_cmp(&best_err) == Some(Ordering::Less) {
                    best = cfg;
                    best_rate = rate;
                    best_err = err;
                }
            }
        }
    }

    if best_err > 1.0 {
        log::warn!(
            "PLL solver could not hit {} Hz exactly; using {} Hz (error {:.3} Hz)",
            target_hz, best_rate, best_err
        );
    }

    (best, best_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_100mhz_is_within_one_hz() {
        let (_, rate) = solve(100_000_000.0);
        assert!((rate - 100_000_000.0).abs() <= 1.0, "rate = {}", rate);
    }

    #[test]
    fn solve_prefers_mult_six_on_exact_ties() {
        // At div=16, mult=6 alone produces an exact multiple of the reference step; confirm the
        // solver doesn't need a higher mult to land close for a friendly target.
        let (cfg, rate) = solve(60_000_000.0);
        assert!((rate - 60_000_000.0).abs() < 50.0);
        assert!(MULT_CANDIDATES.contains(&cfg.mult));
    }

    #[test]
    fn decode_is_left_inverse_of_encode() {
        let cfg = PllConfig { div: 37, out_div: 1, frac: 9, mult: 5 };
        let word = cfg.encode();
        assert_eq!(PllConfig::decode(word), cfg);
    }

    proptest::proptest! {
        #[test]
        fn decoder_is_left_inverse_of_solver(target in 1_000_000.0f64..200_000_000.0) {
            let (cfg, rate) = solve(target);
            // Decoding the solver's own encoded word must reproduce the same rate it reported.
            let roundtrip = PllConfig::decode(cfg.encode()).decoded_rate();
            proptest::prop_assert!((roundtrip - rate).abs() < 1e-6);

            // No other reachable register should beat the solver's choice.
            let mut best_other_err = f64::INFINITY;
            for &mult in &MULT_CANDIDATES {
                for div in DIV_MIN..=DIV_MAX {
                    for frac in FRAC_MIN..=FRAC_MAX {
                        let other = PllConfig { div, out_div: OUT_DIV, frac, mult };
                        let err = (other.decoded_rate() - target).abs();
                        if err < best_other_err {
                            best_other_err = err;
                        }
                    }
                }
            }
            let chosen_err = (rate - target).abs();
            proptest::prop_assert!(chosen_err <= best_other_err + 1e-9);
        }
    }
}

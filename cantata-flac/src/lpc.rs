// Cantata
// Copyright (c) 2024 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Linear predictive coding: windowing, autocorrelation, the Levinson-Durbin recursion,
//! coefficient quantisation, and residual computation/restoration.

use smallvec::SmallVec;

use crate::format::{MAX_LPC_ORDER, MAX_QLP_COEFF_SHIFT};

/// Quantized linear predictor coefficients. The coefficient at index 0 multiplies the sample one
/// position in the past, matching the order coefficients appear in the bitstream.
pub type QlpCoeffs = SmallVec<[i32; MAX_LPC_ORDER as usize]>;

const MAX_ORDER: usize = MAX_LPC_ORDER as usize;

/// Applies a Welch window to the signal, producing the floating point analysis signal.
pub fn window_welch(signal: &[i32], windowed: &mut Vec<f64>) {
    windowed.clear();

    let n = signal.len();

    if n < 2 {
        windowed.extend(signal.iter().map(|&s| f64::from(s)));
        return;
    }

    let half = (n - 1) as f64 / 2.0;

    for (i, s) in signal.iter().enumerate() {
        let t = (i as f64 - half) / half;
        windowed.push(f64::from(*s) * (1.0 - t * t));
    }
}

/// Computes the autocorrelation of the analysis signal for lags `0..=max_lag`.
pub fn compute_autocorrelation(data: &[f64], max_lag: usize, autoc: &mut [f64]) {
    debug_assert!(max_lag < data.len());
    debug_assert!(autoc.len() > max_lag);

    for (lag, out) in autoc.iter_mut().enumerate().take(max_lag + 1) {
        let mut sum = 0.0;

        for i in lag..data.len() {
            sum += data[i] * data[i - lag];
        }

        *out = sum;
    }
}

/// Runs the Levinson-Durbin recursion over the autocorrelation, producing direct-form predictor
/// coefficients *for every order* `1..=autoc.len() - 1` along with the prediction error of each
/// order. Returns the highest usable order, which may be less than requested when the signal
/// becomes perfectly predicted.
///
/// `lp_coeff[order - 1][0..order]` holds the coefficients for that order; the coefficient at
/// index 0 multiplies the most recent past sample.
pub fn compute_lp_coefficients(
    autoc: &[f64],
    lp_coeff: &mut [[f64; MAX_ORDER]; MAX_ORDER],
    error: &mut [f64; MAX_ORDER],
) -> usize {
    let max_order = autoc.len() - 1;

    debug_assert!(max_order >= 1 && max_order <= MAX_ORDER);

    let mut err = autoc[0];

    // A zero autocorrelation at lag 0 means the (windowed) signal is all zeros. No predictor is
    // usable.
    if err <= 0.0 {
        return 0;
    }

    // FIR filter coefficients of the current order.
    let mut lpc = [0.0f64; MAX_ORDER];

    for i in 0..max_order {
        // The reflection coefficient of this order.
        let mut r = -autoc[i + 1];

        for j in 0..i {
            r -= lpc[j] * autoc[i - j];
        }

        r /= err;

        // Fold the reflection coefficient into the filter.
        lpc[i] = r;

        let half = i >> 1;

        for j in 0..half {
            let tmp = lpc[j];
            lpc[j] += r * lpc[i - 1 - j];
            lpc[i - 1 - j] += r * tmp;
        }

        if i & 1 == 1 {
            lpc[half] += lpc[half] * r;
        }

        err *= 1.0 - r * r;

        // Save this order, negating the FIR coefficients to obtain predictor coefficients.
        for j in 0..=i {
            lp_coeff[i][j] = -lpc[j];
        }

        error[i] = err;

        // Perfectly predicted. Higher orders would be numerically meaningless.
        if err <= 0.0 {
            return i + 1;
        }
    }

    max_order
}

/// Computes the expected number of bits per residual sample from the Levinson-Durbin prediction
/// error of an order.
pub fn expected_bits_per_residual_sample(lpc_error: f64, total_samples: usize) -> f64 {
    if lpc_error > 0.0 && total_samples > 0 {
        let error_scale =
            0.5 * std::f64::consts::LN_2 * std::f64::consts::LN_2 / total_samples as f64;

        (0.5 * (error_scale * lpc_error).log2()).max(0.0)
    }
    else {
        0.0
    }
}

/// Estimates the order minimizing the total coded size: the expected residual bits plus the
/// warm-up overhead of the order. Returns an order in `1..=max_order`.
pub fn best_order_estimate(
    error: &[f64; MAX_ORDER],
    max_order: usize,
    total_samples: usize,
    bits_per_sample: u32,
) -> usize {
    debug_assert!(max_order >= 1);

    let mut best_order = 1;
    let mut best_bits = f64::MAX;

    for order in 1..=max_order {
        let bits = expected_bits_per_residual_sample(error[order - 1], total_samples)
            * (total_samples - order) as f64
            + (order as f64) * f64::from(bits_per_sample);

        if bits < best_bits {
            best_bits = bits;
            best_order = order;
        }
    }

    best_order
}

/// Quantizes floating point predictor coefficients to signed `precision`-bit integers with a
/// shared right-shift. Returns `None` when no usable quantisation exists at this precision (all
/// coefficients quantize to zero, or the required shift is out of range), in which case the
/// caller falls back to its next candidate.
pub fn quantize_coefficients(lp_coeff: &[f64], precision: u32) -> Option<(QlpCoeffs, i32)> {
    let cmax = lp_coeff.iter().fold(0.0f64, |m, c| m.max(c.abs()));

    if cmax <= 0.0 {
        return None;
    }

    // The exponent e such that cmax lies in [2^(e-1), 2^e).
    let e = cmax.log2().floor() as i32 + 1;

    let mut shift = precision as i32 - e - 1;

    if shift > MAX_QLP_COEFF_SHIFT {
        shift = MAX_QLP_COEFF_SHIFT;
    }

    // A negative shift would scale coefficients up. Decodable, but this encoder does not emit it.
    if shift < 0 {
        return None;
    }

    let qmax = f64::from((1i32 << (precision - 1)) - 1);
    let qmin = f64::from(-(1i32 << (precision - 1)));
    let scale = f64::powi(2.0, shift);

    let mut coeffs = QlpCoeffs::new();
    let mut carry = 0.0f64;
    let mut any_non_zero = false;

    // Round with error feedback so quantisation error does not accumulate along the filter.
    for c in lp_coeff {
        let ideal = c * scale + carry;
        let q = ideal.round().clamp(qmin, qmax);

        carry = ideal - q;
        any_non_zero |= q != 0.0;

        coeffs.push(q as i32);
    }

    if !any_non_zero {
        return None;
    }

    Some((coeffs, shift))
}

/// Computes the residual of `signal` under the quantized predictor. The residual of the samples
/// past the warm-up range is appended to `residual`.
///
/// The inner product is accumulated at 64 bits, and the final subtraction wraps modulo 2^32 to
/// mirror restoration.
pub fn compute_residual(
    signal: &[i32],
    coeffs: &[i32],
    shift: i32,
    residual: &mut Vec<i32>,
) {
    debug_assert!(shift >= 0);

    residual.clear();

    let order = coeffs.len();

    for i in order..signal.len() {
        let mut predicted = 0i64;

        for (j, c) in coeffs.iter().enumerate() {
            predicted += i64::from(*c) * i64::from(signal[i - 1 - j]);
        }

        predicted >>= shift;

        residual.push(i64::from(signal[i]).wrapping_sub(predicted) as i32);
    }
}

/// Restores a signal in-place from its predictor residual. On entry, the first `coeffs.len()`
/// samples of `buf` are the warm-up samples and the remainder is the residual.
///
/// Negative quantisation levels scale the prediction up rather than down.
pub fn restore_signal(coeffs: &[i32], shift: i32, buf: &mut [i32]) {
    let order = coeffs.len();

    for i in order..buf.len() {
        let mut predicted = 0i64;

        for (j, c) in coeffs.iter().enumerate() {
            predicted += i64::from(*c) * i64::from(buf[i - 1 - j]);
        }

        predicted = if shift >= 0 { predicted >> shift } else { predicted << -shift };

        buf[i] = buf[i].wrapping_add(predicted as i32);
    }
}

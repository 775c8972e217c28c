//! # Wad Fixed-Point Arithmetic
//!
//! Every price, rate, and balance in OBOL is a wad: an integer scaled by
//! 1e18. All arithmetic here is checked and `Result`-returning — an overflow
//! in the accounting core is a protocol bug, never something to saturate
//! through silently.
//!
//! Products of two wads can exceed `u128`, so `mul_div` computes through a
//! full 256-bit intermediate: a two-limb schoolbook multiply followed by a
//! bitwise 256-by-128 long division. The quotient is guaranteed to fit in
//! `u128` whenever the high limb of the product is smaller than the divisor;
//! anything else is reported as [`MathError::Overflow`].
//!
//! Rounding direction is always explicit at the call site: `wmul`/`wdiv`
//! floor, `wmul_up`/`wdiv_up` ceil. The vault's conversion layer builds its
//! "never under-collect" policy on top of these primitives.

use thiserror::Error;

use crate::config::WAD;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from fixed-point arithmetic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MathError {
    /// The true result does not fit in 128 bits.
    #[error("arithmetic overflow")]
    Overflow,

    /// Division by zero.
    #[error("division by zero")]
    DivisionByZero,
}

// ---------------------------------------------------------------------------
// 256-bit intermediate
// ---------------------------------------------------------------------------

/// Full 256-bit product of two `u128` values as `(hi, lo)` limbs.
fn mul_wide(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = (1u128 << 64) - 1;

    let (a_hi, a_lo) = (a >> 64, a & MASK);
    let (b_hi, b_lo) = (b >> 64, b & MASK);

    let ll = a_lo * b_lo;
    let lh = a_lo * b_hi;
    let hl = a_hi * b_lo;
    let hh = a_hi * b_hi;

    let (mid, mid_carry) = lh.overflowing_add(hl);
    let (lo, lo_carry) = ll.overflowing_add(mid << 64);
    let hi = hh + (mid >> 64) + ((mid_carry as u128) << 64) + (lo_carry as u128);

    (hi, lo)
}

/// Divides the 256-bit value `(hi, lo)` by `d`, returning `(quotient, remainder)`.
///
/// Requires `hi < d` so the quotient fits in 128 bits.
fn div_wide(hi: u128, lo: u128, d: u128) -> Result<(u128, u128), MathError> {
    if d == 0 {
        return Err(MathError::DivisionByZero);
    }
    if hi == 0 {
        return Ok((lo / d, lo % d));
    }
    if hi >= d {
        return Err(MathError::Overflow);
    }

    // Bitwise long division. The running remainder stays below `d`, so after
    // the shift the true value is below `2d` and a single conditional
    // subtraction restores the bound. When the shift carries out of 128 bits
    // the subtraction is mandatory and wrapping arithmetic lands on the
    // correct residue.
    let mut rem: u128 = 0;
    let mut quo: u128 = 0;
    for i in (0..256).rev() {
        let bit = if i >= 128 {
            (hi >> (i - 128)) & 1
        } else {
            (lo >> i) & 1
        };
        let carried = rem >> 127 == 1;
        rem = (rem << 1) | bit;
        let mut q_bit = false;
        if carried || rem >= d {
            rem = rem.wrapping_sub(d);
            q_bit = true;
        }
        quo = (quo << 1) | (q_bit as u128);
    }

    Ok((quo, rem))
}

// ---------------------------------------------------------------------------
// mul_div
// ---------------------------------------------------------------------------

/// `floor(a * b / denom)` with a 256-bit intermediate.
pub fn mul_div(a: u128, b: u128, denom: u128) -> Result<u128, MathError> {
    let (hi, lo) = mul_wide(a, b);
    let (quo, _) = div_wide(hi, lo, denom)?;
    Ok(quo)
}

/// `ceil(a * b / denom)` with a 256-bit intermediate.
pub fn mul_div_up(a: u128, b: u128, denom: u128) -> Result<u128, MathError> {
    let (hi, lo) = mul_wide(a, b);
    let (quo, rem) = div_wide(hi, lo, denom)?;
    if rem == 0 {
        Ok(quo)
    } else {
        quo.checked_add(1).ok_or(MathError::Overflow)
    }
}

// ---------------------------------------------------------------------------
// Wad operations
// ---------------------------------------------------------------------------

/// Wad multiplication, rounding down: `floor(a * b / 1e18)`.
pub fn wmul(a: u128, b: u128) -> Result<u128, MathError> {
    mul_div(a, b, WAD)
}

/// Wad multiplication, rounding up: `ceil(a * b / 1e18)`.
pub fn wmul_up(a: u128, b: u128) -> Result<u128, MathError> {
    mul_div_up(a, b, WAD)
}

/// Wad division, rounding down: `floor(a * 1e18 / b)`.
pub fn wdiv(a: u128, b: u128) -> Result<u128, MathError> {
    mul_div(a, WAD, b)
}

/// Wad division, rounding up: `ceil(a * 1e18 / b)`.
pub fn wdiv_up(a: u128, b: u128) -> Result<u128, MathError> {
    mul_div_up(a, WAD, b)
}

/// Wad exponentiation by repeated squaring: `base^exp` in wad space.
///
/// Each squaring step floors, so for `base >= WAD` the result is always
/// `>= WAD`; for realistic per-second rates the per-step growth dominates
/// the flooring error and the result is monotone in `exp` — the property
/// the rate accumulator's invariant rests on. Never a linear approximation.
pub fn wpow(base: u128, mut exp: u64) -> Result<u128, MathError> {
    let mut result = WAD;
    let mut b = base;
    while exp > 0 {
        if exp & 1 == 1 {
            result = wmul(result, b)?;
        }
        exp >>= 1;
        if exp > 0 {
            b = wmul(b, b)?;
        }
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Packed exponential emitters.
//!
//! Two flavours: a Schraudolph bit-trick approximation (a `mulps` +
//! `cvtps2dq` + `paddd` triple, mean absolute error ≈ 0.02 on activation
//! inputs) and a Cephes-style polynomial accurate to ~1e-7 relative, used
//! whenever the approximation is not enabled.

use iced_x86::code_asm::*;

use crate::codegen::constants::{ConstId, ConstantPool};
use crate::error::Result;

/// `2^23 / ln 2`
pub const SCHRAUDOLPH_FACTOR: f32 = 12102203.0;
/// `127 * 2^23 - 60801 * 2^3`: the paper's larger bias, rescaled from the
/// double mantissa position to the f32 one so the error stays centred.
pub const SCHRAUDOLPH_OFFSET: u32 = (127u32 << 23) - (60801 << 3);

/// Defines a Schraudolph constant block computing `exp(scale * x)`.
///
/// Layout: broadcast factor at +0, broadcast integer offset at +16.
pub fn define_exp_approx(pool: &mut ConstantPool, scale: f32) -> ConstId {
    let mut bytes = Vec::with_capacity(32);
    for _ in 0..4 {
        bytes.extend_from_slice(&(SCHRAUDOLPH_FACTOR * scale).to_le_bytes());
    }
    for _ in 0..4 {
        bytes.extend_from_slice(&SCHRAUDOLPH_OFFSET.to_le_bytes());
    }
    pool.add_bytes(bytes)
}

/// As [`define_exp_approx`], with a broadcast `1.0` quad at +32 for the
/// rational activations built on top of the approximated exp.
pub fn define_exp_approx_with_one(pool: &mut ConstantPool, scale: f32) -> ConstId {
    let mut bytes = Vec::with_capacity(48);
    for _ in 0..4 {
        bytes.extend_from_slice(&(SCHRAUDOLPH_FACTOR * scale).to_le_bytes());
    }
    for _ in 0..4 {
        bytes.extend_from_slice(&SCHRAUDOLPH_OFFSET.to_le_bytes());
    }
    for _ in 0..4 {
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
    }
    pool.add_bytes(bytes)
}

/// `value = exp_approx(scale * value)` for each value register.
///
/// `base` must hold the address of the matching [`define_exp_approx`] block.
pub fn emit_exp_approx(
    a: &mut CodeAssembler,
    values: &[AsmRegisterXmm],
    base: AsmRegister64,
) -> Result<()> {
    for &v in values {
        a.mulps(v, xmmword_ptr(base))?;
    }
    for &v in values {
        a.cvtps2dq(v, v)?;
    }
    for &v in values {
        a.paddd(v, xmmword_ptr(base + 16))?;
    }
    Ok(())
}

// Broadcast-quad offsets into the polynomial constant block.
const EXP_HI: usize = 0;
const EXP_LO: usize = 16;
const LOG2E: usize = 32;
const HALF: usize = 48;
const LN2_HI: usize = 64;
const LN2_LO: usize = 80;
const P0: usize = 96;
const P1: usize = 112;
const P2: usize = 128;
const P3: usize = 144;
const P4: usize = 160;
const P5: usize = 176;
const ONE: usize = 192;
const BIAS: usize = 208;

/// Defines the shared constant block for the polynomial exp.
pub fn define_exp_poly(pool: &mut ConstantPool) -> ConstId {
    let floats: [f32; 13] = [
        88.376_26,      // clamp hi
        -88.376_26,     // clamp lo
        1.442_695_04,   // log2(e)
        0.5,
        0.693_359_375,  // ln2 high part
        -2.121_944_4e-4, // ln2 low part
        1.987_569_2e-4,
        1.398_199_9e-3,
        8.333_452e-3,
        4.166_579_6e-2,
        1.666_666_5e-1,
        5.000_000_2e-1,
        1.0,
    ];
    let mut bytes = Vec::with_capacity(14 * 16);
    for f in floats {
        for _ in 0..4 {
            bytes.extend_from_slice(&f.to_le_bytes());
        }
    }
    for _ in 0..4 {
        bytes.extend_from_slice(&127u32.to_le_bytes());
    }
    pool.add_bytes(bytes)
}

/// `value = exp(value)`, elementwise, via range reduction and a degree-5
/// polynomial. Needs three scratch registers and `base` holding the
/// [`define_exp_poly`] block address. SSE2 only: floor is emulated with a
/// truncate-and-adjust pair.
pub fn emit_exp_poly(
    a: &mut CodeAssembler,
    value: AsmRegisterXmm,
    scratch: [AsmRegisterXmm; 3],
    base: AsmRegister64,
) -> Result<()> {
    let [t0, t1, t2] = scratch;
    let c = |off: usize| xmmword_ptr(base + off as i32);

    a.minps(value, c(EXP_HI))?;
    a.maxps(value, c(EXP_LO))?;

    // fx = floor(x * log2(e) + 0.5)
    a.movaps(t0, value)?;
    a.mulps(t0, c(LOG2E))?;
    a.addps(t0, c(HALF))?;
    a.cvttps2dq(t1, t0)?;
    a.cvtdq2ps(t1, t1)?;
    a.movaps(t2, t1)?;
    a.cmpps(t2, t0, 6u32)?; // truncation overshot (negative non-integers)
    a.andps(t2, c(ONE))?;
    a.subps(t1, t2)?;

    // x -= fx * ln2 (split into high and low parts)
    a.movaps(t2, t1)?;
    a.mulps(t2, c(LN2_HI))?;
    a.subps(value, t2)?;
    a.movaps(t2, t1)?;
    a.mulps(t2, c(LN2_LO))?;
    a.subps(value, t2)?;

    // y = poly(x) * x^2 + x + 1
    a.movaps(t2, c(P0))?;
    a.mulps(t2, value)?;
    a.addps(t2, c(P1))?;
    a.mulps(t2, value)?;
    a.addps(t2, c(P2))?;
    a.mulps(t2, value)?;
    a.addps(t2, c(P3))?;
    a.mulps(t2, value)?;
    a.addps(t2, c(P4))?;
    a.mulps(t2, value)?;
    a.addps(t2, c(P5))?;
    a.movaps(t0, value)?;
    a.mulps(t0, value)?;
    a.mulps(t2, t0)?;
    a.addps(t2, value)?;
    a.addps(t2, c(ONE))?;

    // scale by 2^fx through the exponent field
    a.cvtps2dq(t1, t1)?;
    a.paddd(t1, c(BIAS))?;
    a.pslld(t1, 23u32)?;
    a.mulps(t2, t1)?;
    a.movaps(value, t2)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schraudolph_constants() {
        assert_eq!(SCHRAUDOLPH_OFFSET, 1_064_866_808);
        // Scalar model of the emitted triple.
        let approx = |x: f32| f32::from_bits(
            ((SCHRAUDOLPH_FACTOR * x) as i32 + SCHRAUDOLPH_OFFSET as i32) as u32,
        );
        for x in [-2.0f32, -0.5, 0.0, 0.5, 1.0, 2.0] {
            let rel = (approx(x) - x.exp()).abs() / x.exp();
            assert!(rel < 0.05, "x={x}: rel={rel}");
        }
    }
}

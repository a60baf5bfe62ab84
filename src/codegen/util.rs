//! Shared emission micro-kernels.
//!
//! The packed copy and zero-fill loops use a step-size descent: the widest
//! whole-XMM-register group that still fits is emitted first (as a counted
//! loop when it runs at least twice), then progressively narrower groups,
//! then a sub-quad tail. Callers own the GP pointer registers; both kernels
//! advance them past the processed data.

use iced_x86::code_asm::*;

use crate::error::{Error, Result};

/// XMM register by index.
pub fn xmm(i: usize) -> AsmRegisterXmm {
    const REGS: [AsmRegisterXmm; 16] = [
        xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
        xmm14, xmm15,
    ];
    REGS[i]
}

/// Checked displacement conversion for memory operands.
pub fn disp(offset: usize) -> Result<i32> {
    i32::try_from(offset).map_err(|_| Error::Compile("address displacement overflow".into()))
}

const F: usize = 4; // bytes per float

/// Copies `count` floats from `[src]` to `[dst]`, advancing both registers.
///
/// Clobbers `rcx` and `xmm0..xmmN` where `N < xmm_regs`. A 2- or 3-float
/// tail is moved as one whole quad; the planner's quad rounding licenses the
/// overshoot.
pub fn emit_packed_copy(
    a: &mut CodeAssembler,
    xmm_regs: usize,
    count: usize,
    src: AsmRegister64,
    dst: AsmRegister64,
    src_aligned: bool,
    dst_aligned: bool,
) -> Result<()> {
    let mut remaining = count;
    for step in (1..=xmm_regs).rev() {
        let per_step = step * 4;
        if remaining < per_step {
            continue;
        }

        let mut loop_label = a.create_label();
        let looped = remaining >= 2 * per_step;
        if looped {
            a.mov(rcx, (remaining / per_step) as u64)?;
            a.set_label(&mut loop_label)?;
        }

        for i in 0..step {
            if src_aligned {
                a.movaps(xmm(i), xmmword_ptr(src + disp(i * 4 * F)?))?;
            } else {
                a.movups(xmm(i), xmmword_ptr(src + disp(i * 4 * F)?))?;
            }
        }
        for i in 0..step {
            if dst_aligned {
                a.movaps(xmmword_ptr(dst + disp(i * 4 * F)?), xmm(i))?;
            } else {
                a.movups(xmmword_ptr(dst + disp(i * 4 * F)?), xmm(i))?;
            }
        }
        a.add(src, disp(step * 4 * F)?)?;
        a.add(dst, disp(step * 4 * F)?)?;

        if looped {
            a.dec(rcx)?;
            a.jnz(loop_label)?;
        }

        remaining %= per_step;
    }

    if remaining == 1 {
        a.movss(xmm0, dword_ptr(src))?;
        a.movss(dword_ptr(dst), xmm0)?;
    } else if remaining > 1 {
        a.movups(xmm0, xmmword_ptr(src))?;
        a.movups(xmmword_ptr(dst), xmm0)?;
    }
    if remaining > 0 {
        a.add(src, disp(remaining * F)?)?;
        a.add(dst, disp(remaining * F)?)?;
    }
    Ok(())
}

/// Writes `count` zero floats at `[dst]`, advancing the register.
///
/// `cleared` tracks how many of `xmm0..` already hold zero so repeated fills
/// reuse them; clobbers `rcx`.
pub fn emit_zero_fill(
    a: &mut CodeAssembler,
    xmm_regs: usize,
    count: usize,
    dst: AsmRegister64,
    dst_aligned: bool,
    cleared: &mut usize,
) -> Result<()> {
    let mut remaining = count;
    for step in (1..=xmm_regs).rev() {
        let per_step = step * 4;
        if remaining < per_step {
            continue;
        }

        if *cleared < step {
            for i in *cleared..step {
                a.xorps(xmm(i), xmm(i))?;
            }
            *cleared = step;
        }

        let mut loop_label = a.create_label();
        let looped = remaining >= 2 * per_step;
        if looped {
            a.mov(rcx, (remaining / per_step) as u64)?;
            a.set_label(&mut loop_label)?;
        }

        for i in 0..step {
            if dst_aligned {
                a.movaps(xmmword_ptr(dst + disp(i * 4 * F)?), xmm(i))?;
            } else {
                a.movups(xmmword_ptr(dst + disp(i * 4 * F)?), xmm(i))?;
            }
        }
        a.add(dst, disp(step * 4 * F)?)?;

        if looped {
            a.dec(rcx)?;
            a.jnz(loop_label)?;
        }

        remaining %= per_step;
    }

    if remaining > 0 {
        if *cleared == 0 {
            a.xorps(xmm0, xmm0)?;
            *cleared = 1;
        }
        for i in 0..remaining {
            a.movss(dword_ptr(dst + disp(i * F)?), xmm(i % *cleared))?;
        }
        a.add(dst, disp(remaining * F)?)?;
    }
    Ok(())
}

/// Stores the `n` (1..=4) lowest lanes of `reg` to `[base + offset]`.
///
/// Rotates `reg` for the 3-lane case; the register is clobbered.
pub fn emit_store_lanes(
    a: &mut CodeAssembler,
    reg: AsmRegisterXmm,
    base: AsmRegister64,
    offset: usize,
    n: usize,
    aligned: bool,
) -> Result<()> {
    match n {
        1 => a.movss(dword_ptr(base + disp(offset)?), reg)?,
        2 => a.movlps(qword_ptr(base + disp(offset)?), reg)?,
        3 => {
            a.movlps(qword_ptr(base + disp(offset)?), reg)?;
            a.shufps(reg, reg, 0x02u32)?;
            a.movss(dword_ptr(base + disp(offset + 8)?), reg)?;
        }
        4 => {
            if aligned {
                a.movaps(xmmword_ptr(base + disp(offset)?), reg)?;
            } else {
                a.movups(xmmword_ptr(base + disp(offset)?), reg)?;
            }
        }
        _ => return Err(Error::Compile(format!("cannot store {n} lanes"))),
    }
    Ok(())
}

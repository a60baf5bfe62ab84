//! Im2col gather emitter.
//!
//! Materialises each convolution receptive field as one row of
//! `(outputH * outputW, rowFloats)` in a scratch buffer, zero-filling
//! `same`-padding borders and the quad-padding lanes at the end of each row.
//! Rows and columns with whole kernels are emitted as counted loops when
//! they run more than twice; border rows/columns are unrolled with their
//! exact clip amounts.
//!
//! When the whole kernel body fits into the register file it is gathered
//! with one load per contiguous run and stored interleaved with the zero
//! regions; otherwise each run goes through the shared copy/zero kernels.

use iced_x86::code_asm::*;

use crate::codegen::util::{self, disp, xmm};
use crate::error::Result;
use crate::model::PaddingType;

#[derive(Debug, Clone)]
pub struct Im2ColParams {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub dilation: [usize; 2],
    pub padding: PaddingType,
    /// Input dimensions `[h, w, c]`.
    pub input: [usize; 3],
    /// Output spatial dimensions `[oh, ow]`.
    pub output_hw: [usize; 2],
    /// Quad-padded row length in floats.
    pub row_floats: usize,
    pub xmm_regs: usize,
}

/// `[top, bottom, left, right]` padding in input pixels.
pub fn padding_partition(p: &Im2ColParams) -> [usize; 4] {
    if p.padding == PaddingType::Valid {
        return [0; 4];
    }
    let vertical = ((p.output_hw[0] - 1) * p.strides[0]
        + p.kernel[0]
        + (p.kernel[0] - 1) * (p.dilation[0] - 1))
        .saturating_sub(p.input[0]);
    let horizontal = ((p.output_hw[1] - 1) * p.strides[1]
        + p.kernel[1]
        + (p.kernel[1] - 1) * (p.dilation[1] - 1))
        .saturating_sub(p.input[1]);
    [
        vertical / 2,
        vertical - vertical / 2,
        horizontal / 2,
        horizontal - horizontal / 2,
    ]
}

const F: i64 = 4;

pub fn emit_im2col(
    a: &mut CodeAssembler,
    p: &Im2ColParams,
    input_addr: u64,
    scratch_addr: u64,
) -> Result<()> {
    let padding = padding_partition(p);
    let [h, w, c] = p.input;
    let [sh, _] = p.strides;
    let [dil_h, _] = p.dilation;
    let kh = p.kernel[0];

    a.mov(rsi, input_addr)?;
    a.mov(rdi, scratch_addr)?;

    // Top padding rows: rsi stays at the first input row.
    let mut input_y = -(padding[0] as i64);
    while input_y < 0 {
        emit_row(a, p, [(-input_y) as usize, 0], &padding)?;
        input_y += sh as i64;
    }
    if input_y > 0 {
        a.add(rsi, disp((input_y as usize) * w * c * 4)?)?;
    }

    // Whole rows.
    let mut input_y_end = input_y as usize + (kh - 1) * dil_h;
    let mut n_rows = 0usize;
    while input_y_end < h {
        n_rows += 1;
        input_y_end += sh;
    }
    if n_rows <= 2 {
        for _ in 0..n_rows {
            emit_row(a, p, [0, 0], &padding)?;
        }
    } else {
        let mut row_loop = a.create_label();
        a.mov(rax, n_rows as u64)?;
        a.set_label(&mut row_loop)?;
        emit_row(a, p, [0, 0], &padding)?;
        a.dec(rax)?;
        a.jnz(row_loop)?;
    }

    // Bottom padding rows.
    while input_y_end < h + padding[1] {
        emit_row(a, p, [0, input_y_end + 1 - h], &padding)?;
        input_y_end += sh;
    }

    Ok(())
}

/// Emits every kernel instance of one output row and leaves `rsi` at the
/// base of the next input row (or back at the row start for top-padded
/// rows, which all read from input row zero).
fn emit_row(
    a: &mut CodeAssembler,
    p: &Im2ColParams,
    row_padding: [usize; 2],
    padding: &[usize; 4],
) -> Result<()> {
    let [_, w, c] = p.input;
    let [sh, sw] = p.strides;
    let [_, dw] = p.dilation;
    let kw = p.kernel[1];

    let mut input_x = -(padding[2] as i64);
    while input_x < 0 {
        emit_kernel(
            a,
            p,
            [row_padding[0], row_padding[1], (-input_x) as usize, 0],
            0,
        )?;
        input_x += sw as i64;
    }
    if input_x > 0 {
        a.add(rsi, disp((input_x as usize) * c * 4)?)?;
    }

    let mut input_offset = 0i64;
    let mut input_x_end = input_x as usize + (kw - 1) * dw;
    let mut n_cols = 0usize;
    while input_x_end < w {
        n_cols += 1;
        input_x_end += sw;
    }
    if n_cols <= 2 {
        for _ in 0..n_cols {
            emit_kernel(a, p, [row_padding[0], row_padding[1], 0, 0], input_offset)?;
            input_offset += (sw * c) as i64;
        }
    } else {
        // The loop advances rsi directly, so the epilogue below nets the
        // looped columns out against the final input_x_end.
        let mut col_loop = a.create_label();
        a.mov(rdx, n_cols as u64)?;
        a.set_label(&mut col_loop)?;
        emit_kernel(a, p, [row_padding[0], row_padding[1], 0, 0], 0)?;
        a.add(rsi, disp(sw * c * 4)?)?;
        a.dec(rdx)?;
        a.jnz(col_loop)?;
    }

    while input_x_end < w + padding[3] {
        emit_kernel(
            a,
            p,
            [row_padding[0], row_padding[1], 0, input_x_end + 1 - w],
            input_offset,
        )?;
        input_offset += (sw * c) as i64;
        input_x_end += sw;
    }

    // Columns already advanced through rsi do not appear in input_offset,
    // so this nets out to "back to row start" or "on to the next row".
    let advanced = (input_x_end - (kw - 1) * dw) as i64;
    if row_padding[0] > 0 {
        input_offset -= advanced * c as i64;
    } else {
        input_offset += (sh * w) as i64 * c as i64 - advanced * c as i64;
    }
    if n_cols > 2 {
        input_offset += (n_cols * sw * c) as i64; // consumed by the loop's adds
        input_offset -= (n_cols * sw * c) as i64;
    }
    if input_offset != 0 {
        if input_offset > 0 {
            a.add(rsi, disp(input_offset as usize * 4)?)?;
        } else {
            a.sub(rsi, disp((-input_offset) as usize * 4)?)?;
        }
    }
    Ok(())
}

/// A contiguous run within one materialised row: either real input data at
/// a byte offset from the kernel base pointer, or zero fill.
enum Run {
    Copy { src: i64, floats: usize },
    Zero { floats: usize },
}

fn emit_kernel(
    a: &mut CodeAssembler,
    p: &Im2ColParams,
    clip: [usize; 4],
    input_offset: i64,
) -> Result<()> {
    let [_, w, c] = p.input;
    let [dil_h, dw] = p.dilation;
    let [kh, kw] = p.kernel;

    // Split the kernel into zero-fill prologue, real-read body and
    // zero-fill epilogue, per axis.
    let t_cells = (clip[0] + dil_h - 1) / dil_h;
    let v_cells = ((kh - t_cells) * dil_h - clip[1]) / dil_h;
    let b_cells = kh - t_cells - v_cells;
    let l_cells = (clip[2] + dw - 1) / dw;
    let h_cells = ((kw - l_cells) * dw - clip[3]) / dw;
    let r_cells = kw - l_cells - h_cells;
    let k = kh * kw * c;

    // Base of the first real cell, relative to rsi.
    let base = ((t_cells * dil_h - clip[0]) as i64 * w as i64
        + (l_cells * dw - clip[2]) as i64)
        * c as i64
        + input_offset;
    a.lea(rbx, qword_ptr(rsi + i32::try_from(base * F).map_err(|_| {
        crate::error::Error::Compile("im2col base displacement overflow".into())
    })?))?;

    // Flatten the kernel instance into an ordered run list.
    let mut runs: Vec<Run> = Vec::new();
    if t_cells > 0 {
        runs.push(Run::Zero {
            floats: t_cells * kw * c,
        });
    }
    for vy in 0..v_cells {
        if l_cells > 0 {
            runs.push(Run::Zero {
                floats: l_cells * c,
            });
        }
        let row_src = (vy * dil_h * w * c) as i64;
        if dw == 1 {
            runs.push(Run::Copy {
                src: row_src,
                floats: h_cells * c,
            });
        } else {
            for hx in 0..h_cells {
                runs.push(Run::Copy {
                    src: row_src + (hx * dw * c) as i64,
                    floats: c,
                });
            }
        }
        if r_cells > 0 {
            runs.push(Run::Zero {
                floats: r_cells * c,
            });
        }
    }
    if b_cells > 0 {
        runs.push(Run::Zero {
            floats: b_cells * kw * c,
        });
    }
    if p.row_floats > k {
        runs.push(Run::Zero {
            floats: p.row_floats - k,
        });
    }

    let aligned = c % 4 == 0;
    let body_regs: usize = runs
        .iter()
        .map(|r| match r {
            Run::Copy { floats, .. } => floats.div_ceil(4),
            Run::Zero { .. } => 0,
        })
        .sum();
    let has_zero = runs.iter().any(|r| matches!(r, Run::Zero { .. }));
    let zero_reg = p.xmm_regs - 1;
    let available = if has_zero { p.xmm_regs - 1 } else { p.xmm_regs };

    if body_regs <= available {
        // Whole kernel in registers: gather all runs, then store them
        // interleaved with the zero regions in ascending output order.
        if has_zero {
            a.xorps(xmm(zero_reg), xmm(zero_reg))?;
        }
        let mut reg = 0usize;
        for run in &runs {
            if let Run::Copy { src, floats } = run {
                for q in 0..floats.div_ceil(4) {
                    let off = disp((src * F) as usize + q * 16)?;
                    if aligned {
                        a.movaps(xmm(reg), xmmword_ptr(rbx + off))?;
                    } else {
                        a.movups(xmm(reg), xmmword_ptr(rbx + off))?;
                    }
                    reg += 1;
                }
            }
        }
        let mut reg = 0usize;
        let mut out = 0usize; // floats
        for run in &runs {
            match run {
                Run::Copy { floats, .. } => {
                    for q in 0..floats.div_ceil(4) {
                        let off = disp(out * 4 + q * 16)?;
                        // Quad tails overshoot into the next region, which
                        // is written afterwards in ascending order.
                        if aligned && out % 4 == 0 {
                            a.movaps(xmmword_ptr(rdi + off), xmm(reg))?;
                        } else {
                            a.movups(xmmword_ptr(rdi + off), xmm(reg))?;
                        }
                        reg += 1;
                    }
                    out += floats;
                }
                Run::Zero { floats } => {
                    let mut i = 0usize;
                    while i + 4 <= floats + 3 {
                        let off = disp((out + i) * 4)?;
                        if floats - i == 1 {
                            a.movss(dword_ptr(rdi + off), xmm(zero_reg))?;
                        } else {
                            a.movups(xmmword_ptr(rdi + off), xmm(zero_reg))?;
                        }
                        i += 4;
                    }
                    out += floats;
                }
            }
        }
    } else {
        // Fallback: one cell run at a time through the shared kernels.
        let mut out = 0usize;
        let mut cleared = 0usize;
        for run in &runs {
            match run {
                Run::Copy { src, floats } => {
                    a.lea(r8, qword_ptr(rbx + disp((src * F) as usize)?))?;
                    a.lea(r9, qword_ptr(rdi + disp(out * 4)?))?;
                    util::emit_packed_copy(a, available, *floats, r8, r9, aligned, aligned)?;
                    cleared = 0;
                    out += floats;
                }
                Run::Zero { floats } => {
                    a.lea(r9, qword_ptr(rdi + disp(out * 4)?))?;
                    util::emit_zero_fill(a, available, *floats, r9, aligned, &mut cleared)?;
                    out += floats;
                }
            }
        }
    }

    a.add(rdi, disp(p.row_floats * 4)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kernel: [usize; 2], strides: [usize; 2], input: [usize; 3], output: [usize; 2]) -> Im2ColParams {
        Im2ColParams {
            kernel,
            strides,
            dilation: [1, 1],
            padding: PaddingType::Same,
            input,
            output_hw: output,
            row_floats: (kernel[0] * kernel[1] * input[2]).div_ceil(4) * 4,
            xmm_regs: 16,
        }
    }

    #[test]
    fn same_padding_is_symmetric_with_extra_at_end() {
        // 3x3 kernel on 5x5, stride 1: one pixel of padding on every side.
        let p = params([3, 3], [1, 1], [5, 5, 1], [5, 5]);
        assert_eq!(padding_partition(&p), [1, 1, 1, 1]);
        // 2x2 kernel on 5x5, stride 1: odd total, extra goes bottom/right.
        let p = params([2, 2], [1, 1], [5, 5, 1], [5, 5]);
        assert_eq!(padding_partition(&p), [0, 1, 0, 1]);
    }

    #[test]
    fn valid_padding_is_zero() {
        let mut p = params([3, 3], [1, 1], [5, 5, 1], [3, 3]);
        p.padding = PaddingType::Valid;
        assert_eq!(padding_partition(&p), [0; 4]);
    }

    #[test]
    fn strided_same_padding_can_vanish() {
        // 1-wide effective coverage: (ceil(4/2)-1)*2+1-4 < 0 saturates to 0.
        let p = params([1, 1], [2, 2], [4, 4, 1], [2, 2]);
        assert_eq!(padding_partition(&p), [0; 4]);
    }
}

//! Spatial upsampling.
//!
//! `nearest` replicates each input cell horizontally, then recopies the
//! finished row for the remaining vertical repeats. `bilinear` emits fully
//! unrolled four-tap weighted averages: every output pixel's tap addresses
//! and weights are compile-time constants (weights broadcast per pixel in a
//! table), so the emitted stream is straight-line loads and multiply-adds.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{self, disp, emit_store_lanes};
use crate::error::Result;
use crate::model::InterpolationMethod;

pub struct UpSampling2DCompiler {
    xmm_regs: usize,
    size: [usize; 2],
    interpolation: InterpolationMethod,
    input_dims: [usize; 3],
    weight_block: Option<ConstId>,
}

impl UpSampling2DCompiler {
    pub fn new(
        settings: &CompilationSettings,
        size: [usize; 2],
        interpolation: InterpolationMethod,
        input_dims: [usize; 3],
    ) -> Self {
        UpSampling2DCompiler {
            xmm_regs: settings.xmm_regs,
            size,
            interpolation,
            input_dims,
            weight_block: None,
        }
    }

    /// `(y0, y1, fraction)` of an output coordinate under the legacy
    /// `src = out * in / out_size` mapping.
    fn taps(src: usize, scale: usize, limit: usize) -> (usize, usize, f32) {
        let pos = src as f32 / scale as f32;
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(limit - 1);
        (lo, hi, pos - lo as f32)
    }

    fn emit_nearest(&self, a: &mut CodeAssembler, input: &TensorPtr, output: &TensorPtr) -> Result<()> {
        let [h, w, c] = self.input_dims;
        let [sy, sx] = self.size;
        let out_row = w * sx * c;

        a.mov(rsi, input.addr)?;
        a.mov(rdi, output.addr)?;

        let mut row_loop = a.create_label();
        if h > 1 {
            a.mov(rax, h as u64)?;
            a.set_label(&mut row_loop)?;
        }

        // Build the first output row of this band.
        let mut pixel_loop = a.create_label();
        if w > 1 {
            a.mov(rdx, w as u64)?;
            a.set_label(&mut pixel_loop)?;
        }
        for _ in 0..sx {
            a.mov(r8, rsi)?;
            util::emit_packed_copy(a, self.xmm_regs, c, r8, rdi, true, false)?;
        }
        a.add(rsi, disp(c * 4)?)?;
        if w > 1 {
            a.dec(rdx)?;
            a.jnz(pixel_loop)?;
        }

        // Recopy the finished row for the remaining vertical repeats.
        if sy > 1 {
            a.mov(r9, rdi)?;
            a.sub(r9, disp(out_row * 4)?)?;
            for _ in 0..sy - 1 {
                util::emit_packed_copy(a, self.xmm_regs, out_row, r9, rdi, false, false)?;
            }
        }

        if h > 1 {
            a.dec(rax)?;
            a.jnz(row_loop)?;
        }
        Ok(())
    }

    fn emit_bilinear(
        &self,
        a: &mut CodeAssembler,
        pool: &ConstantPool,
        input: &TensorPtr,
        output: &TensorPtr,
    ) -> Result<()> {
        let [h, w, c] = self.input_dims;
        let [sy, sx] = self.size;
        let (oh, ow) = (h * sy, w * sx);
        let c4 = c.div_ceil(4);
        let block = self.weight_block.expect("initialised");

        a.mov(rsi, input.addr)?;
        a.mov(rdi, output.addr)?;
        a.mov(r11, pool.address(block))?;

        let t = util::xmm(0);
        let u = util::xmm(1);
        for oy in 0..oh {
            let (y0, y1, fy) = Self::taps(oy, sy, h);
            for ox in 0..ow {
                let (x0, x1, fx) = Self::taps(ox, sx, w);
                let pix = oy * ow + ox;
                let weights = [
                    (1.0 - fy) * (1.0 - fx),
                    (1.0 - fy) * fx,
                    fy * (1.0 - fx),
                    fy * fx,
                ];
                let srcs = [(y0, x0), (y0, x1), (y1, x0), (y1, x1)];
                for q in 0..c4 {
                    let mut have_acc = false;
                    for (tap, &(ty, tx)) in srcs.iter().enumerate() {
                        if weights[tap] == 0.0 {
                            continue;
                        }
                        let src = disp(((ty * w + tx) * c + q * 4) * 4)?;
                        let reg = if have_acc { u } else { t };
                        a.movups(reg, xmmword_ptr(rsi + src))?;
                        if weights[tap] != 1.0 {
                            a.mulps(reg, xmmword_ptr(r11 + disp(pix * 64 + tap * 16)?))?;
                        }
                        if have_acc {
                            a.addps(t, reg)?;
                        }
                        have_acc = true;
                    }
                    let lanes = (c - q * 4).min(4);
                    emit_store_lanes(a, t, rdi, ((oy * ow + ox) * c + q * 4) * 4, lanes, false)?;
                }
            }
        }
        Ok(())
    }
}

impl OperationCompiler for UpSampling2DCompiler {
    fn can_be_inplace(&self) -> bool {
        false
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        _act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        if self.interpolation != InterpolationMethod::Bilinear {
            return Ok(());
        }
        let [h, w, _] = self.input_dims;
        let [sy, sx] = self.size;
        let (oh, ow) = (h * sy, w * sx);
        let mut data = Vec::with_capacity(oh * ow * 16);
        for oy in 0..oh {
            let (_, _, fy) = Self::taps(oy, sy, h);
            for ox in 0..ow {
                let (_, _, fx) = Self::taps(ox, sx, w);
                for weight in [
                    (1.0 - fy) * (1.0 - fx),
                    (1.0 - fy) * fx,
                    fy * (1.0 - fx),
                    fy * fx,
                ] {
                    data.extend_from_slice(&[weight; 4]);
                }
            }
        }
        self.weight_block = Some(pool.add_f32(&data));
        Ok(())
    }

    fn compile(
        &self,
        a: &mut CodeAssembler,
        pool: &ConstantPool,
        _act: &ActivationFunctionHandler,
        inputs: &[TensorPtr],
        outputs: &[TensorPtr],
        _scratch: Option<&TensorPtr>,
    ) -> Result<()> {
        match self.interpolation {
            InterpolationMethod::Nearest => self.emit_nearest(a, &inputs[0], &outputs[0]),
            InterpolationMethod::Bilinear => self.emit_bilinear(a, pool, &inputs[0], &outputs[0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_taps_clamp_at_the_border() {
        // 2x upsampling of a length-2 axis: last output sample sits past the
        // final input sample and clamps.
        assert_eq!(UpSampling2DCompiler::taps(0, 2, 2), (0, 1, 0.0));
        assert_eq!(UpSampling2DCompiler::taps(1, 2, 2), (0, 1, 0.5));
        assert_eq!(UpSampling2DCompiler::taps(2, 2, 2), (1, 1, 0.0));
        assert_eq!(UpSampling2DCompiler::taps(3, 2, 2), (1, 1, 0.5));
    }
}

//! Convolution and dense GEMM emitter.
//!
//! The output channel dimension is tiled into batches of
//! `4 * (xmm_regs - max(2, activation spares))` channels whose accumulators
//! live in XMM registers. For each batch the spatial output is walked in
//! raster order; every output pixel accumulates packed dot products by
//! streaming pre-reordered weight blocks against one input quad at a time,
//! rotated across lanes with `shufps` so one quad feeds four output lanes in
//! four steps. 1x1 kernels address the input directly; all others gather
//! receptive fields with im2col first. Dense layers compile through the same
//! emitter as a 1x1 convolution over a single pixel.

use iced_x86::code_asm::*;

use crate::codegen::activation::{ActivationFunctionHandler, CompiledActivation};
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::ops::im2col::{emit_im2col, Im2ColParams};
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{disp, emit_store_lanes, xmm};
use crate::error::{Error, Result};
use crate::model::PaddingType;

pub struct Conv2DCompiler<'m> {
    xmm_regs: usize,
    use_fma3: bool,
    kernel: [usize; 2],
    strides: [usize; 2],
    padding: PaddingType,
    /// Flattened `[kh*kw*ci, co]` weight matrix.
    weights: &'m [f32],
    ci: usize,
    co: usize,
    biases: Option<&'m [f32]>,
    batch_norm: Option<(&'m [f32], &'m [f32])>,
    activation: CompiledActivation,
    input_dims: [usize; 3],
    output_dims: [usize; 3],
    batch_channels: usize,
    row_floats: usize,
    weights_block: Option<ConstId>,
    bias_block: Option<ConstId>,
}

impl<'m> Conv2DCompiler<'m> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &CompilationSettings,
        kernel: [usize; 2],
        strides: [usize; 2],
        padding: PaddingType,
        weights: &'m [f32],
        ci: usize,
        co: usize,
        biases: Option<&'m [f32]>,
        batch_norm: Option<(&'m [f32], &'m [f32])>,
        activation: CompiledActivation,
        input_dims: [usize; 3],
        output_dims: [usize; 3],
    ) -> Result<Self> {
        if weights.len() != kernel[0] * kernel[1] * ci * co {
            return Err(Error::Compile("convolution weight count mismatch".into()));
        }
        Ok(Conv2DCompiler {
            xmm_regs: settings.xmm_regs,
            use_fma3: settings.use_fma3,
            kernel,
            strides,
            padding,
            weights,
            ci,
            co,
            biases,
            batch_norm,
            activation,
            input_dims,
            output_dims,
            batch_channels: 0,
            row_floats: 0,
            weights_block: None,
            bias_block: None,
        })
    }

    /// A dense layer is a 1x1 convolution over one pixel.
    #[allow(clippy::too_many_arguments)]
    pub fn for_dense(
        settings: &CompilationSettings,
        weights: &'m [f32],
        inputs: usize,
        units: usize,
        biases: Option<&'m [f32]>,
        batch_norm: Option<(&'m [f32], &'m [f32])>,
        activation: CompiledActivation,
    ) -> Result<Self> {
        Conv2DCompiler::new(
            settings,
            [1, 1],
            [1, 1],
            PaddingType::Valid,
            weights,
            inputs,
            units,
            biases,
            batch_norm,
            activation,
            [1, 1, inputs],
            [1, 1, units],
        )
    }

    fn k(&self) -> usize {
        self.kernel[0] * self.kernel[1] * self.ci
    }

    fn direct_1x1(&self) -> bool {
        self.kernel == [1, 1]
    }

    /// `(start, end, weight offset in floats)` per output-channel batch.
    fn batches(&self) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        let mut start = 0usize;
        while start < self.co {
            let end = (start + self.batch_channels).min(self.co);
            out.push((start, end, offset));
            offset += self.row_floats * (end - start).div_ceil(4) * 4;
            start = end;
        }
        out
    }

    /// One output pixel: accumulate, activate, store.
    fn emit_pixel(
        &self,
        a: &mut CodeAssembler,
        pool: &ConstantPool,
        act: &ActivationFunctionHandler,
        n_accs: usize,
        batch: (usize, usize, usize),
        src_aligned: bool,
        out_aligned: bool,
    ) -> Result<()> {
        let (start, end, _) = batch;
        let xin = xmm(n_accs);
        let wt = xmm(n_accs + 1);

        for q in 0..n_accs {
            if self.bias_block.is_some() {
                a.movaps(xmm(q), xmmword_ptr(rdx + disp((start + q * 4) * 4)?))?;
            } else {
                a.xorps(xmm(q), xmm(q))?;
            }
        }

        for iq in 0..self.row_floats / 4 {
            if src_aligned {
                a.movaps(xin, xmmword_ptr(rsi + disp(iq * 16)?))?;
            } else {
                a.movups(xin, xmmword_ptr(rsi + disp(iq * 16)?))?;
            }
            for rot in 0..4 {
                for q in 0..n_accs {
                    let off = disp(((iq * 4 + rot) * n_accs + q) * 16)?;
                    if self.use_fma3 {
                        a.vfmadd231ps(xmm(q), xin, xmmword_ptr(rbx + off))?;
                    } else {
                        a.movaps(wt, xmmword_ptr(rbx + off))?;
                        a.mulps(wt, xin)?;
                        a.addps(xmm(q), wt)?;
                    }
                }
                if rot < 3 {
                    a.shufps(xin, xin, 0x39u32)?;
                }
            }
        }

        let values: Vec<_> = (0..n_accs).map(xmm).collect();
        let spares: Vec<_> = (n_accs..self.xmm_regs).map(xmm).collect();
        act.apply(a, pool, &self.activation, &spares, &values)?;

        let channels = end - start;
        for q in 0..n_accs {
            let lanes = (channels - q * 4).min(4);
            emit_store_lanes(a, xmm(q), rdi, q * 16, lanes, out_aligned)?;
        }
        Ok(())
    }
}

impl<'m> OperationCompiler for Conv2DCompiler<'m> {
    fn can_be_inplace(&self) -> bool {
        false
    }

    fn scratch_floats(&self) -> usize {
        if self.direct_1x1() {
            0
        } else {
            self.output_dims[0] * self.output_dims[1] * self.k().div_ceil(4) * 4
        }
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        let spares = act.needed_spares(&self.activation);
        let reserve = spares.max(2);
        if self.xmm_regs <= reserve {
            return Err(Error::Compile(format!(
                "no accumulator registers left: {} available, {} reserved",
                self.xmm_regs, reserve
            )));
        }
        self.batch_channels = 4 * (self.xmm_regs - reserve);
        let k = self.k();
        self.row_floats = k.div_ceil(4) * 4;

        // Reorder weights so the inner loop reads one packed block per
        // rotation step: [batch][input quad][rotation][output quad].
        // Lanes past the real kernel footprint or channel count are zero.
        let mut data = Vec::new();
        let mut start = 0usize;
        while start < self.co {
            let end = (start + self.batch_channels).min(self.co);
            for iq in 0..self.row_floats / 4 {
                for rot in 0..4 {
                    let mut oq = start;
                    while oq < end {
                        for lane in 0..4 {
                            let out_ch = oq + lane;
                            let in_idx = iq * 4 + (rot + lane) % 4;
                            let value = if in_idx < k && out_ch < self.co {
                                let w = self.weights[in_idx * self.co + out_ch];
                                match self.batch_norm {
                                    Some((factor, _)) => w * factor[out_ch],
                                    None => w,
                                }
                            } else {
                                0.0
                            };
                            data.push(value);
                        }
                        oq += 4;
                    }
                }
            }
            start = end;
        }
        self.weights_block = Some(pool.add_f32(&data));

        if self.biases.is_some() || self.batch_norm.is_some() {
            let mut biases = vec![0.0f32; self.co.div_ceil(4) * 4];
            if let Some(b) = self.biases {
                biases[..self.co].copy_from_slice(b);
            }
            if let Some((factor, offset)) = self.batch_norm {
                for c in 0..self.co {
                    biases[c] = biases[c] * factor[c] + offset[c];
                }
            }
            self.bias_block = Some(pool.add_f32(&biases));
        }

        act.register(&self.activation, pool);
        Ok(())
    }

    fn compile(
        &self,
        a: &mut CodeAssembler,
        pool: &ConstantPool,
        act: &ActivationFunctionHandler,
        inputs: &[TensorPtr],
        outputs: &[TensorPtr],
        scratch: Option<&TensorPtr>,
    ) -> Result<()> {
        let input = &inputs[0];
        let output = &outputs[0];
        let [oh, ow, _] = self.output_dims;
        let weights_addr = pool.address(
            self.weights_block
                .ok_or_else(|| Error::Compile("convolution was not initialised".into()))?,
        );
        let out_aligned = self.co % 4 == 0;

        // Gather receptive fields unless 1x1 addressing is direct.
        let (src_addr, src_aligned) = if self.direct_1x1() {
            (input.addr, self.ci % 4 == 0)
        } else {
            let scratch = scratch
                .ok_or_else(|| Error::Compile("convolution scratch buffer missing".into()))?;
            let params = Im2ColParams {
                kernel: self.kernel,
                strides: self.strides,
                dilation: [1, 1],
                padding: self.padding,
                input: self.input_dims,
                output_hw: [oh, ow],
                row_floats: self.row_floats,
                xmm_regs: self.xmm_regs,
            };
            emit_im2col(a, &params, input.addr, scratch.addr)?;
            (scratch.addr, true)
        };

        for batch in self.batches() {
            let (start, end, weight_offset) = batch;
            let n_accs = (end - start).div_ceil(4);
            a.mov(rsi, src_addr)?;
            a.mov(rdi, output.addr + (start * 4) as u64)?;
            a.mov(rbx, weights_addr + (weight_offset * 4) as u64)?;
            if let Some(id) = self.bias_block {
                a.mov(rdx, pool.address(id))?;
            }

            if self.direct_1x1() && self.strides != [1, 1] {
                // Strided 1x1: walk the output grid, skipping input pixels.
                let [_, w, _] = self.input_dims;
                let row_skip = (self.strides[0] * w - ow * self.strides[1]) * self.ci * 4;
                let mut row_loop = a.create_label();
                if oh > 1 {
                    a.mov(rax, oh as u64)?;
                    a.set_label(&mut row_loop)?;
                }
                let mut col_loop = a.create_label();
                if ow > 1 {
                    a.mov(rcx, ow as u64)?;
                    a.set_label(&mut col_loop)?;
                }
                self.emit_pixel(a, pool, act, n_accs, batch, src_aligned, out_aligned)?;
                a.add(rsi, disp(self.strides[1] * self.ci * 4)?)?;
                a.add(rdi, disp(self.co * 4)?)?;
                if ow > 1 {
                    a.dec(rcx)?;
                    a.jnz(col_loop)?;
                }
                if row_skip > 0 {
                    a.add(rsi, disp(row_skip)?)?;
                }
                if oh > 1 {
                    a.dec(rax)?;
                    a.jnz(row_loop)?;
                }
            } else {
                let pixels = oh * ow;
                let row_stride = if self.direct_1x1() {
                    self.ci
                } else {
                    self.row_floats
                };
                let mut pixel_loop = a.create_label();
                if pixels > 1 {
                    a.mov(rax, pixels as u64)?;
                    a.set_label(&mut pixel_loop)?;
                }
                self.emit_pixel(a, pool, act, n_accs, batch, src_aligned, out_aligned)?;
                if pixels > 1 {
                    a.add(rsi, disp(row_stride * 4)?)?;
                    a.add(rdi, disp(self.co * 4)?)?;
                    a.dec(rax)?;
                    a.jnz(pixel_loop)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::activation::ActivationFunctionHandler;

    fn compiler<'m>(weights: &'m [f32], ci: usize, co: usize) -> Conv2DCompiler<'m> {
        let settings = CompilationSettings::default();
        Conv2DCompiler::for_dense(
            &settings,
            weights,
            ci,
            co,
            None,
            None,
            CompiledActivation::Linear,
        )
        .unwrap()
    }

    #[test]
    fn weight_reorder_rotation_layout() {
        // 4 inputs, 4 outputs: one quad, one batch.
        let mut w = vec![0.0f32; 16];
        for i in 0..4 {
            for o in 0..4 {
                w[i * 4 + o] = (i * 4 + o) as f32;
            }
        }
        let mut c = compiler(&w, 4, 4);
        let mut pool = ConstantPool::new();
        let settings = CompilationSettings::default();
        let mut act = ActivationFunctionHandler::new(&settings);
        c.initialize(&mut pool, &mut act).unwrap();
        let buffer = pool.finalize();
        let data = &buffer.as_slice()[..16];
        // Block (rot, lane) holds weight[input (rot+lane)%4][output lane].
        for rot in 0..4 {
            for lane in 0..4 {
                let expected = w[((rot + lane) % 4) * 4 + lane];
                assert_eq!(data[rot * 4 + lane], expected, "rot {rot} lane {lane}");
            }
        }
    }

    #[test]
    fn tail_channels_are_zero_padded() {
        // 2 inputs, 3 outputs: lanes past both tails must be zero.
        let w = vec![1.0f32; 6];
        let mut c = compiler(&w, 2, 3);
        let mut pool = ConstantPool::new();
        let settings = CompilationSettings::default();
        let mut act = ActivationFunctionHandler::new(&settings);
        c.initialize(&mut pool, &mut act).unwrap();
        let buffer = pool.finalize();
        let data = &buffer.as_slice()[..16];
        for rot in 0..4 {
            for lane in 0..4 {
                let in_idx = (rot + lane) % 4;
                let expected = if in_idx < 2 && lane < 3 { 1.0 } else { 0.0 };
                assert_eq!(data[rot * 4 + lane], expected);
            }
        }
    }

    #[test]
    fn scratch_only_for_real_kernels() {
        let w = vec![0.0f32; 3 * 3 * 4 * 8];
        let settings = CompilationSettings::default();
        let c = Conv2DCompiler::new(
            &settings,
            [3, 3],
            [1, 1],
            PaddingType::Same,
            &w,
            4,
            8,
            None,
            None,
            CompiledActivation::Linear,
            [6, 6, 4],
            [6, 6, 8],
        )
        .unwrap();
        assert_eq!(c.scratch_floats(), 6 * 6 * 36);
        let d = compiler(&w[..32], 4, 8);
        assert_eq!(d.scratch_floats(), 0);
    }
}

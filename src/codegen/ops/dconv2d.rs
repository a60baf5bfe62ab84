//! Depthwise and separable convolution.
//!
//! Depthwise convolution accumulates per channel quad with no cross-channel
//! reduction; `same` padding simply drops the clipped taps, which is exactly
//! zero padding for a convolution sum. Separable convolution emits the
//! depthwise stage into a scratch buffer and a 1x1 pointwise convolution on
//! top of it.

use iced_x86::code_asm::*;

use crate::codegen::activation::{ActivationFunctionHandler, CompiledActivation};
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::ops::conv2d::Conv2DCompiler;
use crate::codegen::ops::spatial::{emit_spatial_walk, padding_partition, SpatialWalk};
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{disp, emit_store_lanes, xmm};
use crate::error::{Error, Result};
use crate::model::PaddingType;

pub struct DConv2DCompiler<'m> {
    xmm_regs: usize,
    kernel: [usize; 2],
    strides: [usize; 2],
    padding: PaddingType,
    /// Flattened `[kh, kw, c]` weights (depth multiplier 1).
    weights: &'m [f32],
    c: usize,
    biases: Option<&'m [f32]>,
    batch_norm: Option<(&'m [f32], &'m [f32])>,
    activation: CompiledActivation,
    input_dims: [usize; 3],
    output_dims: [usize; 3],
    reserve: usize,
    weights_block: Option<ConstId>,
    bias_block: Option<ConstId>,
}

impl<'m> DConv2DCompiler<'m> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &CompilationSettings,
        kernel: [usize; 2],
        strides: [usize; 2],
        padding: PaddingType,
        weights: &'m [f32],
        depth_multiplier: usize,
        biases: Option<&'m [f32]>,
        batch_norm: Option<(&'m [f32], &'m [f32])>,
        activation: CompiledActivation,
        input_dims: [usize; 3],
        output_dims: [usize; 3],
    ) -> Result<Self> {
        if depth_multiplier != 1 {
            return Err(Error::Compile(format!(
                "depthwise convolution with depth multiplier {depth_multiplier} is not compiled"
            )));
        }
        let c = input_dims[2];
        if weights.len() != kernel[0] * kernel[1] * c {
            return Err(Error::Compile("depthwise weight count mismatch".into()));
        }
        Ok(DConv2DCompiler {
            xmm_regs: settings.xmm_regs,
            kernel,
            strides,
            padding,
            weights,
            c,
            biases,
            batch_norm,
            activation,
            input_dims,
            output_dims,
            reserve: 2,
            weights_block: None,
            bias_block: None,
        })
    }

    fn walk(&self) -> SpatialWalk {
        let [h, w, _] = self.input_dims;
        let [oh, ow, _] = self.output_dims;
        SpatialWalk {
            input: self.input_dims,
            kernel: self.kernel,
            strides: self.strides,
            output: [oh, ow],
            padding: padding_partition(self.padding, [h, w], self.kernel, self.strides, [oh, ow]),
            out_cell_floats: self.c,
        }
    }
}

impl<'m> OperationCompiler for DConv2DCompiler<'m> {
    fn can_be_inplace(&self) -> bool {
        self.strides[0] >= self.kernel[0] && self.strides[1] >= self.kernel[1]
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        self.reserve = act.needed_spares(&self.activation).max(2);
        if self.xmm_regs <= self.reserve {
            return Err(Error::Compile("no accumulator registers left".into()));
        }

        let c4 = self.c.div_ceil(4);
        let [kh, kw] = self.kernel;
        let mut data = vec![0.0f32; kh * kw * c4 * 4];
        for ky in 0..kh {
            for kx in 0..kw {
                for chan in 0..self.c {
                    let w = self.weights[(ky * kw + kx) * self.c + chan];
                    let w = match self.batch_norm {
                        Some((factor, _)) => w * factor[chan],
                        None => w,
                    };
                    data[((ky * kw + kx) * c4) * 4 + chan] = w;
                }
            }
        }
        self.weights_block = Some(pool.add_f32(&data));

        if self.biases.is_some() || self.batch_norm.is_some() {
            let mut biases = vec![0.0f32; c4 * 4];
            if let Some(b) = self.biases {
                biases[..self.c].copy_from_slice(b);
            }
            if let Some((factor, offset)) = self.batch_norm {
                for chan in 0..self.c {
                    biases[chan] = biases[chan] * factor[chan] + offset[chan];
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
        _scratch: Option<&TensorPtr>,
    ) -> Result<()> {
        let input = &inputs[0];
        let output = &outputs[0];
        let [_, w, c] = self.input_dims;
        let c4 = c.div_ceil(4);
        let aligned = c % 4 == 0;
        let kw = self.kernel[1];
        let walk = self.walk();
        let weights_addr = pool.address(
            self.weights_block
                .ok_or_else(|| Error::Compile("depthwise convolution was not initialised".into()))?,
        );

        let block_quads = self.xmm_regs - self.reserve;
        let mut start_q = 0usize;
        while start_q < c4 {
            let n_accs = (c4 - start_q).min(block_quads);
            let tmp = xmm(n_accs);
            a.mov(rdi, output.addr + (start_q * 16) as u64)?;
            a.mov(rbx, weights_addr)?;
            if let Some(id) = self.bias_block {
                a.mov(rdx, pool.address(id))?;
            }

            emit_spatial_walk(a, &walk, input.addr, &mut |a, cell| {
                for q in 0..n_accs {
                    if self.bias_block.is_some() {
                        a.movaps(xmm(q), xmmword_ptr(rdx + disp((start_q + q) * 16)?))?;
                    } else {
                        a.xorps(xmm(q), xmm(q))?;
                    }
                }

                for ky in cell.ky.0..cell.ky.1 {
                    for kx in cell.kx.0..cell.kx.1 {
                        let tap = (ky * kw + kx) * c4;
                        for q in 0..n_accs {
                            let off =
                                disp((cell.pixel_floats(w, c, ky, kx) + (start_q + q) * 4) * 4)?;
                            if aligned {
                                a.movaps(tmp, xmmword_ptr(cell.cursor + off))?;
                            } else {
                                a.movups(tmp, xmmword_ptr(cell.cursor + off))?;
                            }
                            a.mulps(tmp, xmmword_ptr(rbx + disp((tap + start_q + q) * 16)?))?;
                            a.addps(xmm(q), tmp)?;
                        }
                    }
                }

                let values: Vec<_> = (0..n_accs).map(xmm).collect();
                let spares: Vec<_> = (n_accs..self.xmm_regs).map(xmm).collect();
                act.apply(a, pool, &self.activation, &spares, &values)?;

                let channels = c - start_q * 4;
                for q in 0..n_accs {
                    let lanes = (channels - q * 4).min(4);
                    emit_store_lanes(a, xmm(q), rdi, q * 16, lanes, aligned)?;
                }
                Ok(())
            })?;
            start_q += n_accs;
        }
        Ok(())
    }
}

/// Depthwise stage into scratch, then a pointwise 1x1 convolution.
pub struct SeparableConv2DCompiler<'m> {
    depthwise: DConv2DCompiler<'m>,
    pointwise: Conv2DCompiler<'m>,
    inner_dims: [usize; 3],
}

impl<'m> SeparableConv2DCompiler<'m> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &CompilationSettings,
        kernel: [usize; 2],
        strides: [usize; 2],
        padding: PaddingType,
        depthwise_weights: &'m [f32],
        depth_multiplier: usize,
        pointwise_weights: &'m [f32],
        co: usize,
        biases: Option<&'m [f32]>,
        batch_norm: Option<(&'m [f32], &'m [f32])>,
        activation: CompiledActivation,
        input_dims: [usize; 3],
        output_dims: [usize; 3],
    ) -> Result<Self> {
        let inner_dims = [output_dims[0], output_dims[1], input_dims[2]];
        let depthwise = DConv2DCompiler::new(
            settings,
            kernel,
            strides,
            padding,
            depthwise_weights,
            depth_multiplier,
            None,
            None,
            CompiledActivation::Linear,
            input_dims,
            inner_dims,
        )?;
        let pointwise = Conv2DCompiler::new(
            settings,
            [1, 1],
            [1, 1],
            PaddingType::Valid,
            pointwise_weights,
            inner_dims[2],
            co,
            biases,
            batch_norm,
            activation,
            inner_dims,
            output_dims,
        )?;
        Ok(SeparableConv2DCompiler {
            depthwise,
            pointwise,
            inner_dims,
        })
    }
}

impl<'m> OperationCompiler for SeparableConv2DCompiler<'m> {
    fn can_be_inplace(&self) -> bool {
        false
    }

    fn scratch_floats(&self) -> usize {
        let [h, w, c] = self.inner_dims;
        (h * w * c).div_ceil(4) * 4
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        self.depthwise.initialize(pool, act)?;
        self.pointwise.initialize(pool, act)
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
        let scratch = scratch
            .ok_or_else(|| Error::Compile("separable convolution scratch missing".into()))?;
        let inner = TensorPtr::new(scratch.addr, self.inner_dims.to_vec());
        self.depthwise
            .compile(a, pool, act, inputs, &[inner.clone()], None)?;
        self.pointwise
            .compile(a, pool, act, &[inner], outputs, None)
    }
}

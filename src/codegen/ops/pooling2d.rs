//! Max and average pooling.
//!
//! Accumulators are seeded with the first footprint cell, then reduced with
//! `maxps`/`addps` across the remaining cells. Average pooling multiplies by
//! a per-footprint `1/N` constant at the end, where `N` counts the valid
//! cells of clipped footprints. Max pooling folds a zeroed register into
//! clipped footprints, making the border behave like zero padding.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::ops::spatial::{emit_spatial_walk, padding_partition, SpatialWalk};
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{disp, emit_store_lanes, xmm};
use crate::error::{Error, Result};
use crate::model::{PaddingType, PoolingMethod};

pub struct Pooling2DCompiler {
    xmm_regs: usize,
    method: PoolingMethod,
    padding: PaddingType,
    kernel: [usize; 2],
    strides: [usize; 2],
    input_dims: [usize; 3],
    output_dims: [usize; 3],
    /// Sorted distinct valid-cell counts; `1/count` quads in the block.
    counts: Vec<usize>,
    factor_block: Option<ConstId>,
}

impl Pooling2DCompiler {
    pub fn new(
        settings: &CompilationSettings,
        method: PoolingMethod,
        padding: PaddingType,
        kernel: [usize; 2],
        strides: [usize; 2],
        input_dims: [usize; 3],
        output_dims: [usize; 3],
    ) -> Self {
        Pooling2DCompiler {
            xmm_regs: settings.xmm_regs,
            method,
            padding,
            kernel,
            strides,
            input_dims,
            output_dims,
            counts: Vec::new(),
            factor_block: None,
        }
    }

    fn walk(&self) -> SpatialWalk {
        let [h, w, c] = self.input_dims;
        let [oh, ow, _] = self.output_dims;
        SpatialWalk {
            input: self.input_dims,
            kernel: self.kernel,
            strides: self.strides,
            output: [oh, ow],
            padding: padding_partition(self.padding, [h, w], self.kernel, self.strides, [oh, ow]),
            out_cell_floats: c,
        }
    }

    fn factor_offset(&self, count: usize) -> Result<usize> {
        self.counts
            .iter()
            .position(|&c| c == count)
            .map(|i| i * 16)
            .ok_or_else(|| Error::Compile(format!("no averaging factor for footprint {count}")))
    }
}

impl OperationCompiler for Pooling2DCompiler {
    fn can_be_inplace(&self) -> bool {
        // Raster order writes never overtake reads once each output row
        // consumes at least a full stride of input rows.
        self.strides[0] >= self.kernel[0] && self.strides[1] >= self.kernel[1]
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        _act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        if self.method != PoolingMethod::Average {
            return Ok(());
        }
        let walk = self.walk();
        let mut counts: Vec<usize> = Vec::new();
        for oy in 0..walk.output[0] {
            for ox in 0..walk.output[1] {
                let (ky0, ky1) = super::spatial::row_clip(&walk, oy);
                let (kx0, kx1) = super::spatial::col_clip(&walk, ox);
                let count = (ky1 - ky0) * (kx1 - kx0);
                if !counts.contains(&count) {
                    counts.push(count);
                }
            }
        }
        counts.sort_unstable();
        let mut data = Vec::with_capacity(counts.len() * 4);
        for &count in &counts {
            data.extend_from_slice(&[1.0 / count as f32; 4]);
        }
        self.counts = counts;
        self.factor_block = Some(pool.add_f32(&data));
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
        let input = &inputs[0];
        let output = &outputs[0];
        let [_, w, c] = self.input_dims;
        let c4 = c.div_ceil(4);
        let aligned = c % 4 == 0;
        let walk = self.walk();

        let block_quads = self.xmm_regs - 1; // one temporary register
        let mut start_q = 0usize;
        while start_q < c4 {
            let n_accs = (c4 - start_q).min(block_quads);
            let tmp = xmm(n_accs);
            a.mov(rdi, output.addr + (start_q * 16) as u64)?;
            if let Some(id) = self.factor_block {
                a.mov(r11, pool.address(id))?;
            }

            emit_spatial_walk(a, &walk, input.addr, &mut |a, cell| {
                let mut first = true;
                for ky in cell.ky.0..cell.ky.1 {
                    for kx in cell.kx.0..cell.kx.1 {
                        for q in 0..n_accs {
                            let off =
                                disp((cell.pixel_floats(w, c, ky, kx) + (start_q + q) * 4) * 4)?;
                            if first {
                                if aligned {
                                    a.movaps(xmm(q), xmmword_ptr(cell.cursor + off))?;
                                } else {
                                    a.movups(xmm(q), xmmword_ptr(cell.cursor + off))?;
                                }
                            } else {
                                if aligned {
                                    a.movaps(tmp, xmmword_ptr(cell.cursor + off))?;
                                } else {
                                    a.movups(tmp, xmmword_ptr(cell.cursor + off))?;
                                }
                                match self.method {
                                    PoolingMethod::Max => a.maxps(xmm(q), tmp)?,
                                    PoolingMethod::Average => a.addps(xmm(q), tmp)?,
                                }
                            }
                        }
                        first = false;
                    }
                }

                match self.method {
                    PoolingMethod::Max => {
                        if cell.clipped(self.kernel) {
                            a.xorps(tmp, tmp)?;
                            for q in 0..n_accs {
                                a.maxps(xmm(q), tmp)?;
                            }
                        }
                    }
                    PoolingMethod::Average => {
                        let count =
                            (cell.ky.1 - cell.ky.0) * (cell.kx.1 - cell.kx.0);
                        if count > 1 {
                            let off = disp(self.factor_offset(count)?)?;
                            for q in 0..n_accs {
                                a.mulps(xmm(q), xmmword_ptr(r11 + off))?;
                            }
                        }
                    }
                }

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

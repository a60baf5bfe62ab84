//! Standalone batch normalization: `y = x * factor[c] + offset[c]`.
//!
//! Most batchnorm nodes are folded into the preceding convolution during
//! initialisation; this emitter handles the ones that survive (e.g. directly
//! after an input or a merge).

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::util::{disp, emit_store_lanes};
use crate::error::Result;

pub struct BatchNormalizationCompiler<'m> {
    factor: &'m [f32],
    offset: &'m [f32],
    /// Total elements divided by the channel count.
    outer: usize,
    channels: usize,
    factor_block: Option<ConstId>,
    offset_block: Option<ConstId>,
}

impl<'m> BatchNormalizationCompiler<'m> {
    pub fn new(factor: &'m [f32], offset: &'m [f32], input_dims: &[usize]) -> Self {
        let channels = factor.len();
        let outer = input_dims.iter().product::<usize>() / channels;
        BatchNormalizationCompiler {
            factor,
            offset,
            outer,
            channels,
            factor_block: None,
            offset_block: None,
        }
    }
}

impl<'m> OperationCompiler for BatchNormalizationCompiler<'m> {
    fn can_be_inplace(&self) -> bool {
        true
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        _act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        let padded = self.channels.div_ceil(4) * 4;
        let mut factor = vec![0.0f32; padded];
        factor[..self.channels].copy_from_slice(self.factor);
        let mut offset = vec![0.0f32; padded];
        offset[..self.channels].copy_from_slice(self.offset);
        self.factor_block = Some(pool.add_f32(&factor));
        self.offset_block = Some(pool.add_f32(&offset));
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
        let c = self.channels;
        let c4 = c.div_ceil(4);
        let aligned = c % 4 == 0;

        a.mov(rsi, input.addr)?;
        a.mov(rdi, output.addr)?;
        a.mov(rbx, pool.address(self.factor_block.expect("initialised")))?;
        a.mov(rdx, pool.address(self.offset_block.expect("initialised")))?;

        let mut row_loop = a.create_label();
        if self.outer > 1 {
            a.mov(rax, self.outer as u64)?;
            a.set_label(&mut row_loop)?;
        }
        for q in 0..c4 {
            let off = disp(q * 16)?;
            if aligned {
                a.movaps(xmm0, xmmword_ptr(rsi + off))?;
            } else {
                a.movups(xmm0, xmmword_ptr(rsi + off))?;
            }
            a.mulps(xmm0, xmmword_ptr(rbx + off))?;
            a.addps(xmm0, xmmword_ptr(rdx + off))?;
            let lanes = (c - q * 4).min(4);
            emit_store_lanes(a, xmm0, rdi, q * 16, lanes, aligned)?;
        }
        if self.outer > 1 {
            a.add(rsi, disp(c * 4)?)?;
            a.add(rdi, disp(c * 4)?)?;
            a.dec(rax)?;
            a.jnz(row_loop)?;
        }
        Ok(())
    }
}

//! Global spatial pooling.
//!
//! A single accumulator sweep over all HW positions per channel quad; the
//! average variant multiplies by `1/(H*W)` at the end. Channel quads that do
//! not all fit in the register file are processed in blocks, each with its
//! own sweep.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{disp, emit_store_lanes, xmm};
use crate::error::Result;
use crate::model::PoolingMethod;

pub struct GlobalPooling2DCompiler {
    xmm_regs: usize,
    method: PoolingMethod,
    input_dims: [usize; 3],
    factor_block: Option<ConstId>,
}

impl GlobalPooling2DCompiler {
    pub fn new(
        settings: &CompilationSettings,
        method: PoolingMethod,
        input_dims: [usize; 3],
    ) -> Self {
        GlobalPooling2DCompiler {
            xmm_regs: settings.xmm_regs,
            method,
            input_dims,
            factor_block: None,
        }
    }
}

impl OperationCompiler for GlobalPooling2DCompiler {
    fn can_be_inplace(&self) -> bool {
        true
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        _act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        if self.method == PoolingMethod::Average {
            let [h, w, _] = self.input_dims;
            self.factor_block = Some(pool.add_broadcast_f32(1.0 / (h * w) as f32));
        }
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
        let [h, w, c] = self.input_dims;
        let pixels = h * w;
        let c4 = c.div_ceil(4);
        let aligned = c % 4 == 0;

        if let Some(id) = self.factor_block {
            a.mov(r11, pool.address(id))?;
        }

        let block_quads = self.xmm_regs - 1;
        let mut start_q = 0usize;
        while start_q < c4 {
            let n_accs = (c4 - start_q).min(block_quads);
            let tmp = xmm(n_accs);

            a.mov(rsi, input.addr + (start_q * 16) as u64)?;
            // Seed with the first position, then sweep the rest.
            for q in 0..n_accs {
                if aligned {
                    a.movaps(xmm(q), xmmword_ptr(rsi + disp(q * 16)?))?;
                } else {
                    a.movups(xmm(q), xmmword_ptr(rsi + disp(q * 16)?))?;
                }
            }
            if pixels > 1 {
                a.add(rsi, disp(c * 4)?)?;
                let mut sweep = a.create_label();
                a.mov(rax, (pixels - 1) as u64)?;
                a.set_label(&mut sweep)?;
                for q in 0..n_accs {
                    if aligned {
                        a.movaps(tmp, xmmword_ptr(rsi + disp(q * 16)?))?;
                    } else {
                        a.movups(tmp, xmmword_ptr(rsi + disp(q * 16)?))?;
                    }
                    match self.method {
                        PoolingMethod::Max => a.maxps(xmm(q), tmp)?,
                        PoolingMethod::Average => a.addps(xmm(q), tmp)?,
                    }
                }
                a.add(rsi, disp(c * 4)?)?;
                a.dec(rax)?;
                a.jnz(sweep)?;
            }

            if self.method == PoolingMethod::Average && pixels > 1 {
                for q in 0..n_accs {
                    a.mulps(xmm(q), xmmword_ptr(r11))?;
                }
            }

            a.mov(rdi, output.addr + (start_q * 16) as u64)?;
            let channels = c - start_q * 4;
            for q in 0..n_accs {
                let lanes = (channels - q * 4).min(4);
                emit_store_lanes(a, xmm(q), rdi, q * 16, lanes, true)?;
            }
            start_q += n_accs;
        }
        Ok(())
    }
}

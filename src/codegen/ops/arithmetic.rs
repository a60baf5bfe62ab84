//! Elementwise merge layers: add, subtract, multiply, average, minimum,
//! maximum.
//!
//! One fused streaming pass reads up to three inputs and writes the output;
//! additional inputs fold into the output in follow-up passes. Average
//! multiplies by `1/N` at the end.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{disp, emit_store_lanes, xmm};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Average,
    Minimum,
    Maximum,
}

impl ArithmeticOp {
    fn emit(
        &self,
        a: &mut CodeAssembler,
        dst: AsmRegisterXmm,
        src: AsmRegisterXmm,
    ) -> Result<()> {
        match self {
            ArithmeticOp::Add | ArithmeticOp::Average => a.addps(dst, src)?,
            ArithmeticOp::Subtract => a.subps(dst, src)?,
            ArithmeticOp::Multiply => a.mulps(dst, src)?,
            ArithmeticOp::Minimum => a.minps(dst, src)?,
            ArithmeticOp::Maximum => a.maxps(dst, src)?,
        }
        Ok(())
    }
}

pub struct ArithmeticCompiler {
    xmm_regs: usize,
    op: ArithmeticOp,
    input_count: usize,
    factor_block: Option<ConstId>,
}

impl ArithmeticCompiler {
    pub fn new(settings: &CompilationSettings, op: ArithmeticOp, input_count: usize) -> Self {
        ArithmeticCompiler {
            xmm_regs: settings.xmm_regs,
            op,
            input_count,
            factor_block: None,
        }
    }

    /// One streaming pass: `dst op= sources`, where the first source seeds
    /// the accumulator on the first pass.
    fn emit_pass(
        &self,
        a: &mut CodeAssembler,
        floats: usize,
        sources: &[AsmRegister64],
        seed_from_first: bool,
        scale: Option<u64>,
    ) -> Result<()> {
        let step_regs = (self.xmm_regs - 1).min(8);
        if let Some(addr) = scale {
            a.mov(r11, addr)?;
        }

        let mut remaining = floats;
        let mut whole = true;
        while remaining > 0 {
            let quads = remaining.div_ceil(4).min(step_regs);
            let chunk = (quads * 4).min(remaining);
            let looped = whole && remaining >= 2 * quads * 4;
            let mut loop_label = a.create_label();
            if looped {
                a.mov(rcx, (remaining / (quads * 4)) as u64)?;
                a.set_label(&mut loop_label)?;
            }

            for q in 0..quads {
                if seed_from_first {
                    a.movaps(xmm(q), xmmword_ptr(sources[0] + disp(q * 16)?))?;
                } else {
                    a.movaps(xmm(q), xmmword_ptr(rdi + disp(q * 16)?))?;
                }
            }
            let tmp = xmm(quads.min(self.xmm_regs - 1));
            let first_src = if seed_from_first { 1 } else { 0 };
            for src in &sources[first_src..] {
                for q in 0..quads {
                    a.movaps(tmp, xmmword_ptr(*src + disp(q * 16)?))?;
                    self.op.emit(a, xmm(q), tmp)?;
                }
            }
            if scale.is_some() {
                for q in 0..quads {
                    a.mulps(xmm(q), xmmword_ptr(r11))?;
                }
            }
            for q in 0..quads {
                let lanes = (chunk - q * 4).min(4);
                emit_store_lanes(a, xmm(q), rdi, q * 16, lanes, true)?;
            }

            for src in sources {
                a.add(*src, disp(quads * 16)?)?;
            }
            a.add(rdi, disp(quads * 16)?)?;

            if looped {
                a.dec(rcx)?;
                a.jnz(loop_label)?;
                remaining %= quads * 4;
            } else {
                remaining -= chunk;
            }
            whole = false;
        }
        Ok(())
    }
}

impl OperationCompiler for ArithmeticCompiler {
    fn can_be_inplace(&self) -> bool {
        true
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        _act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        if self.op == ArithmeticOp::Average {
            self.factor_block = Some(pool.add_broadcast_f32(1.0 / self.input_count as f32));
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
        let output = &outputs[0];
        let floats = output.size();
        let regs = [rsi, rbx, rdx];
        let scale = self.factor_block.map(|id| pool.address(id));

        for (pass, group) in inputs.chunks(regs.len()).enumerate() {
            for (j, input) in group.iter().enumerate() {
                a.mov(regs[j], input.addr)?;
            }
            a.mov(rdi, output.addr)?;
            let last = (pass + 1) * regs.len() >= inputs.len();
            self.emit_pass(
                a,
                floats,
                &regs[..group.len()],
                pass == 0,
                if last { scale } else { None },
            )?;
        }
        Ok(())
    }
}

//! Standalone activation layers (Activation, ReLU, LeakyReLU, ELU,
//! ThresholdedReLU) as a streaming in-place-capable pass over the tensor.

use iced_x86::code_asm::*;

use crate::codegen::activation::{ActivationFunctionHandler, CompiledActivation};
use crate::codegen::constants::ConstantPool;
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{disp, emit_store_lanes, xmm};
use crate::error::{Error, Result};

pub struct ActivationCompiler {
    xmm_regs: usize,
    activation: CompiledActivation,
}

impl ActivationCompiler {
    pub fn new(settings: &CompilationSettings, activation: CompiledActivation) -> Self {
        ActivationCompiler {
            xmm_regs: settings.xmm_regs,
            activation,
        }
    }
}

impl OperationCompiler for ActivationCompiler {
    fn can_be_inplace(&self) -> bool {
        true
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
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
        let floats = output.size();
        let spares = act.needed_spares(&self.activation);
        if self.xmm_regs <= spares {
            return Err(Error::Compile("no value registers left".into()));
        }
        let group = (self.xmm_regs - spares).min(4);
        let spare_regs: Vec<_> = (group..self.xmm_regs).map(xmm).collect();

        a.mov(rsi, input.addr)?;
        a.mov(rdi, output.addr)?;

        let mut remaining = floats;
        let mut whole = true;
        while remaining > 0 {
            let quads = remaining.div_ceil(4).min(group);
            let chunk = (quads * 4).min(remaining);
            let looped = whole && remaining >= 2 * quads * 4;
            let mut loop_label = a.create_label();
            if looped {
                a.mov(rcx, (remaining / (quads * 4)) as u64)?;
                a.set_label(&mut loop_label)?;
            }

            for q in 0..quads {
                a.movaps(xmm(q), xmmword_ptr(rsi + disp(q * 16)?))?;
            }
            let values: Vec<_> = (0..quads).map(xmm).collect();
            act.apply(a, pool, &self.activation, &spare_regs, &values)?;
            for q in 0..quads {
                let lanes = (chunk - q * 4).min(4);
                emit_store_lanes(a, xmm(q), rdi, q * 16, lanes, true)?;
            }
            a.add(rsi, disp(quads * 16)?)?;
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

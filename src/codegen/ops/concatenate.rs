//! Concatenation: pure data movement, no arithmetic.
//!
//! When the concatenation axis is outermost (outer size 1) each input is one
//! contiguous copy into its byte range of the output. Otherwise the emitted
//! code loops over the outer product of the leading dimensions, copying each
//! input's inner chunk per tick, with up to three input pointers resident in
//! GP registers per pass.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::ConstantPool;
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{self, disp};
use crate::error::{Error, Result};

pub struct ConcatenateCompiler {
    xmm_regs: usize,
    /// Normalised concatenation axis.
    axis: usize,
}

impl ConcatenateCompiler {
    pub fn new(settings: &CompilationSettings, axis: usize) -> Self {
        ConcatenateCompiler {
            xmm_regs: settings.xmm_regs,
            axis,
        }
    }
}

impl OperationCompiler for ConcatenateCompiler {
    fn can_be_inplace(&self) -> bool {
        // The first input may already occupy the head of the output.
        true
    }

    fn compile(
        &self,
        a: &mut CodeAssembler,
        _pool: &ConstantPool,
        _act: &ActivationFunctionHandler,
        inputs: &[TensorPtr],
        outputs: &[TensorPtr],
        _scratch: Option<&TensorPtr>,
    ) -> Result<()> {
        let output = &outputs[0];
        let outer: usize = output.dims[..self.axis].iter().product();
        let inner: usize = output.dims[self.axis + 1..].iter().product();

        if outer == 1 {
            let in_place = inputs[0].addr == output.addr;
            let mut offset = if in_place {
                inner * inputs[0].dim(self.axis)
            } else {
                0
            };
            a.mov(rdi, output.addr + (offset * 4) as u64)?;
            for input in inputs.iter().skip(if in_place { 1 } else { 0 }) {
                let floats = inner * input.dim(self.axis);
                a.mov(rsi, input.addr)?;
                util::emit_packed_copy(
                    a,
                    self.xmm_regs,
                    floats,
                    rsi,
                    rdi,
                    true,
                    offset % 4 == 0,
                )?;
                offset += floats;
            }
            return Ok(());
        }

        // Outer loop strategy: chunks must stay quad-aligned so every tick
        // starts on a 16-byte boundary.
        let chunks: Vec<usize> = inputs
            .iter()
            .map(|i| inner * i.dim(self.axis))
            .collect();
        if chunks.iter().any(|c| c % 4 != 0) {
            return Err(Error::Compile(
                "concatenation below the outermost axis requires quad-aligned chunks".into(),
            ));
        }
        let total: usize = chunks.iter().sum();
        let regs = [rsi, rbx, rdx];

        let mut group_offset = 0usize;
        for (group_index, group) in inputs.chunks(regs.len()).enumerate() {
            let first = group_index * regs.len();
            a.mov(rdi, output.addr + (group_offset * 4) as u64)?;
            for (j, input) in group.iter().enumerate() {
                a.mov(regs[j], input.addr)?;
            }
            let group_total: usize = chunks[first..first + group.len()].iter().sum();
            let skip = total - group_total;

            let mut outer_loop = a.create_label();
            a.mov(rax, outer as u64)?;
            a.set_label(&mut outer_loop)?;
            for (j, _) in group.iter().enumerate() {
                util::emit_packed_copy(
                    a,
                    self.xmm_regs,
                    chunks[first + j],
                    regs[j],
                    rdi,
                    true,
                    true,
                )?;
            }
            if skip > 0 {
                a.add(rdi, disp(skip * 4)?)?;
            }
            a.dec(rax)?;
            a.jnz(outer_loop)?;

            group_offset += group_total;
        }
        Ok(())
    }
}

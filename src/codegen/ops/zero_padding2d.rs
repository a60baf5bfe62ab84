//! Zero padding.
//!
//! Two phases: copy the input into the interior of the output (skipped when
//! operating in place), then zero the borders. Both phases run on the shared
//! step-descent copy/zero kernels; the left/right borders are narrow and are
//! filled with inline stores per row instead.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::ConstantPool;
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{self, disp};
use crate::error::Result;
use crate::model::{BOTTOM, LEFT, RIGHT, TOP};

pub struct ZeroPadding2DCompiler {
    xmm_regs: usize,
    /// `[top, bottom, left, right]` in pixels.
    padding: [usize; 4],
    input_dims: [usize; 3],
    output_dims: [usize; 3],
}

impl ZeroPadding2DCompiler {
    pub fn new(
        settings: &CompilationSettings,
        padding: [usize; 4],
        input_dims: [usize; 3],
        output_dims: [usize; 3],
    ) -> Self {
        ZeroPadding2DCompiler {
            xmm_regs: settings.xmm_regs,
            padding,
            input_dims,
            output_dims,
        }
    }
}

impl OperationCompiler for ZeroPadding2DCompiler {
    fn can_be_inplace(&self) -> bool {
        // Only bottom padding leaves every copied element in place.
        self.padding[TOP] == 0 && self.padding[LEFT] == 0 && self.padding[RIGHT] == 0
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
        let input = &inputs[0];
        let output = &outputs[0];
        let [h, w, c] = self.input_dims;
        let [_, ow, _] = self.output_dims;
        let p = self.padding;
        let in_place = input.addr == output.addr;

        // Phase 1: copy the image into the interior.
        if !in_place {
            a.mov(rsi, input.addr)?;
            a.mov(
                rdi,
                output.addr + (((ow * p[TOP] + p[LEFT]) * c) * 4) as u64,
            )?;
            let row = w * c;
            let aligned = row % 4 == 0;
            let mut copy_loop = a.create_label();
            if h > 1 {
                a.mov(rax, h as u64)?;
                a.set_label(&mut copy_loop)?;
            }
            util::emit_packed_copy(a, self.xmm_regs, row, rsi, rdi, aligned, false)?;
            if h > 1 {
                if p[LEFT] + p[RIGHT] > 0 {
                    a.add(rdi, disp((p[LEFT] + p[RIGHT]) * c * 4)?)?;
                }
                a.dec(rax)?;
                a.jnz(copy_loop)?;
            }
        }

        let mut cleared = 0usize;

        // Phase 2: top border.
        if p[TOP] > 0 {
            a.mov(rdi, output.addr)?;
            util::emit_zero_fill(a, self.xmm_regs, p[TOP] * ow * c, rdi, true, &mut cleared)?;
        }

        // Bottom border.
        if p[BOTTOM] > 0 {
            let start = (p[TOP] + h) * ow * c;
            a.mov(rdi, output.addr + (start * 4) as u64)?;
            util::emit_zero_fill(
                a,
                self.xmm_regs,
                p[BOTTOM] * ow * c,
                rdi,
                start % 4 == 0,
                &mut cleared,
            )?;
        }

        // Left and right borders, row by row.
        if p[LEFT] + p[RIGHT] > 0 {
            a.mov(rdi, output.addr + ((p[TOP] * ow * c) * 4) as u64)?;
            if cleared == 0 {
                a.xorps(xmm0, xmm0)?;
            }
            let mut border_loop = a.create_label();
            if h > 1 {
                a.mov(rax, h as u64)?;
                a.set_label(&mut border_loop)?;
            }
            let emit_run = |a: &mut CodeAssembler, base: usize, floats: usize| -> Result<()> {
                let mut offset = base;
                let mut remaining = floats;
                while remaining >= 4 {
                    a.movups(xmmword_ptr(rdi + disp(offset * 4)?), xmm0)?;
                    offset += 4;
                    remaining -= 4;
                }
                while remaining > 0 {
                    a.movss(dword_ptr(rdi + disp(offset * 4)?), xmm0)?;
                    offset += 1;
                    remaining -= 1;
                }
                Ok(())
            };
            emit_run(a, 0, p[LEFT] * c)?;
            emit_run(a, (p[LEFT] + w) * c, p[RIGHT] * c)?;
            if h > 1 {
                a.add(rdi, disp(ow * c * 4)?)?;
                a.dec(rax)?;
                a.jnz(border_loop)?;
            }
        }
        Ok(())
    }
}

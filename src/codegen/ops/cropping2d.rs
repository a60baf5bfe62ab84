//! Spatial cropping: a strided interior copy, no zero fill.
//!
//! Rows are copied with whole-quad groups; a sub-quad row tail overshoots
//! into the next row and is compensated by stepping both cursors back,
//! rewriting those elements correctly on the next iteration.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::ConstantPool;
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::{disp, xmm};
use crate::error::Result;
use crate::model::{LEFT, RIGHT, TOP};

pub struct Cropping2DCompiler {
    xmm_regs: usize,
    /// `[top, bottom, left, right]` in pixels.
    cropping: [usize; 4],
    input_dims: [usize; 3],
    output_dims: [usize; 3],
}

impl Cropping2DCompiler {
    pub fn new(
        settings: &CompilationSettings,
        cropping: [usize; 4],
        input_dims: [usize; 3],
        output_dims: [usize; 3],
    ) -> Self {
        Cropping2DCompiler {
            xmm_regs: settings.xmm_regs,
            cropping,
            input_dims,
            output_dims,
        }
    }
}

impl OperationCompiler for Cropping2DCompiler {
    fn can_be_inplace(&self) -> bool {
        false
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
        let [_, w, c] = self.input_dims;
        let [oh, ow, _] = self.output_dims;
        let p = self.cropping;

        let input_aligned = p[LEFT] * c % 4 == 0 && w * c % 4 == 0;
        let output_aligned = ow * c % 4 == 0;
        let row = ow * c;

        a.mov(
            rsi,
            input.addr + (((p[TOP] * w + p[LEFT]) * c) * 4) as u64,
        )?;
        a.mov(rdi, output.addr)?;

        let mut copy_loop = a.create_label();
        if oh > 1 {
            a.mov(rax, oh as u64)?;
            a.set_label(&mut copy_loop)?;
        }

        let mut steps_remaining = row.div_ceil(4);
        for step in (1..=self.xmm_regs).rev() {
            if steps_remaining < step {
                continue;
            }
            let mut row_loop = a.create_label();
            let looped = steps_remaining >= 2 * step;
            if looped {
                a.mov(rcx, (steps_remaining / step) as u64)?;
                a.set_label(&mut row_loop)?;
            }
            for i in 0..step {
                if input_aligned {
                    a.movaps(xmm(i), xmmword_ptr(rsi + disp(i * 16)?))?;
                } else {
                    a.movups(xmm(i), xmmword_ptr(rsi + disp(i * 16)?))?;
                }
            }
            for i in 0..step {
                if output_aligned {
                    a.movaps(xmmword_ptr(rdi + disp(i * 16)?), xmm(i))?;
                } else {
                    a.movups(xmmword_ptr(rdi + disp(i * 16)?), xmm(i))?;
                }
            }
            a.add(rsi, disp(step * 16)?)?;
            a.add(rdi, disp(step * 16)?)?;
            if looped {
                a.dec(rcx)?;
                a.jnz(row_loop)?;
            }
            steps_remaining %= step;
        }

        // Undo the quad overshoot and skip the cropped columns.
        let overshoot = if row % 4 == 0 { 0 } else { 4 - row % 4 };
        let skip = (p[LEFT] + p[RIGHT]) * c;
        if skip >= overshoot {
            if skip > overshoot {
                a.add(rsi, disp((skip - overshoot) * 4)?)?;
            }
        } else {
            a.sub(rsi, disp((overshoot - skip) * 4)?)?;
        }
        if overshoot > 0 {
            a.sub(rdi, disp(overshoot * 4)?)?;
        }

        if oh > 1 {
            a.dec(rax)?;
            a.jnz(copy_loop)?;
        }
        Ok(())
    }
}

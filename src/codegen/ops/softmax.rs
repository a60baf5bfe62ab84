//! Softmax along the innermost axis.
//!
//! Four passes per row: find the maximum, subtract-and-exponentiate into the
//! output, sum the exponentials, multiply by the broadcast reciprocal.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::math;
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::util::{disp, emit_store_lanes, xmm};
use crate::error::{Error, Result};

pub struct SoftmaxCompiler {
    /// Innermost-axis length.
    channels: usize,
    /// Rows (product of all outer dimensions).
    rows: usize,
    exp_block: Option<ConstId>,
    misc_block: Option<ConstId>,
}

impl SoftmaxCompiler {
    pub fn new(dims: &[usize], axis: usize) -> Result<Self> {
        if axis + 1 != dims.len() {
            return Err(Error::Compile(
                "softmax is only compiled along the innermost axis".into(),
            ));
        }
        let channels = dims[axis];
        Ok(SoftmaxCompiler {
            channels,
            rows: dims.iter().product::<usize>() / channels,
            exp_block: None,
            misc_block: None,
        })
    }
}

impl OperationCompiler for SoftmaxCompiler {
    fn can_be_inplace(&self) -> bool {
        true
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        _act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        self.exp_block = Some(math::define_exp_poly(pool));
        let mut data = Vec::new();
        data.extend_from_slice(&[f32::NEG_INFINITY; 4]);
        data.extend_from_slice(&[1.0f32; 4]);
        self.misc_block = Some(pool.add_f32(&data));
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
        let quads = c / 4;
        let tail = c % 4;
        let exp_addr = pool.address(self.exp_block.expect("initialised"));
        let misc_addr = pool.address(self.misc_block.expect("initialised"));

        let acc = xmm(0);
        let t = xmm(1);
        let v = xmm(2);
        let scratch = [xmm(3), xmm(4), xmm(5)];

        a.mov(rsi, input.addr)?;
        a.mov(rdi, output.addr)?;
        a.mov(r10, exp_addr)?;
        a.mov(r11, misc_addr)?;

        let mut row_loop = a.create_label();
        if self.rows > 1 {
            a.mov(rax, self.rows as u64)?;
            a.set_label(&mut row_loop)?;
        }

        // Pass 1: maximum, broadcast into all lanes of acc.
        a.movaps(acc, xmmword_ptr(r11))?;
        for q in 0..quads {
            a.movups(t, xmmword_ptr(rsi + disp(q * 16)?))?;
            a.maxps(acc, t)?;
        }
        a.movaps(t, acc)?;
        a.shufps(t, t, 0x4eu32)?;
        a.maxps(acc, t)?;
        a.movaps(t, acc)?;
        a.shufps(t, t, 0xb1u32)?;
        a.maxps(acc, t)?;
        for i in 0..tail {
            a.movss(t, dword_ptr(rsi + disp((quads * 4 + i) * 4)?))?;
            a.maxss(acc, t)?;
        }
        if tail > 0 {
            a.shufps(acc, acc, 0x00u32)?;
        }

        // Pass 2: exp(x - max) into the output.
        for q in 0..quads {
            a.movups(v, xmmword_ptr(rsi + disp(q * 16)?))?;
            a.subps(v, acc)?;
            math::emit_exp_poly(a, v, scratch, r10)?;
            a.movups(xmmword_ptr(rdi + disp(q * 16)?), v)?;
        }
        if tail > 0 {
            a.movups(v, xmmword_ptr(rsi + disp(quads * 16)?))?;
            a.subps(v, acc)?;
            math::emit_exp_poly(a, v, scratch, r10)?;
            emit_store_lanes(a, v, rdi, quads * 16, tail, false)?;
        }

        // Pass 3: sum of exponentials, broadcast into all lanes.
        a.xorps(acc, acc)?;
        for q in 0..quads {
            a.movups(t, xmmword_ptr(rdi + disp(q * 16)?))?;
            a.addps(acc, t)?;
        }
        a.haddps(acc, acc)?;
        a.haddps(acc, acc)?;
        for i in 0..tail {
            a.movss(t, dword_ptr(rdi + disp((quads * 4 + i) * 4)?))?;
            a.addss(acc, t)?;
        }
        if tail > 0 {
            a.shufps(acc, acc, 0x00u32)?;
        }

        // Pass 4: multiply by the reciprocal of the sum.
        a.movaps(t, xmmword_ptr(r11 + 16))?;
        a.divps(t, acc)?;
        for q in 0..quads {
            a.movups(v, xmmword_ptr(rdi + disp(q * 16)?))?;
            a.mulps(v, t)?;
            a.movups(xmmword_ptr(rdi + disp(q * 16)?), v)?;
        }
        if tail > 0 {
            a.movups(v, xmmword_ptr(rdi + disp(quads * 16)?))?;
            a.mulps(v, t)?;
            emit_store_lanes(a, v, rdi, quads * 16, tail, false)?;
        }

        if self.rows > 1 {
            a.add(rsi, disp(c * 4)?)?;
            a.add(rdi, disp(c * 4)?)?;
            a.dec(rax)?;
            a.jnz(row_loop)?;
        }
        Ok(())
    }
}

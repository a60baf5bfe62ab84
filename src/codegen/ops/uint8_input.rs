//! uint8 input conversion: widens the externally written byte buffer into
//! the float tensor the rest of the network consumes.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::ConstantPool;
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::util::disp;
use crate::error::Result;

pub struct UInt8InputCompiler {
    elements: usize,
}

impl UInt8InputCompiler {
    pub fn new(elements: usize) -> Self {
        UInt8InputCompiler { elements }
    }
}

impl OperationCompiler for UInt8InputCompiler {
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
        let groups = self.elements / 16;
        let tail = self.elements % 16;

        a.mov(rsi, input.addr)?;
        a.mov(rdi, output.addr)?;
        a.pxor(xmm7, xmm7)?;

        let mut group_loop = a.create_label();
        if groups > 0 {
            if groups > 1 {
                a.mov(rax, groups as u64)?;
                a.set_label(&mut group_loop)?;
            }
            // 16 bytes -> 4 quads of f32 via widening unpacks.
            a.movdqu(xmm0, xmmword_ptr(rsi))?;
            a.movdqa(xmm1, xmm0)?;
            a.punpcklbw(xmm0, xmm7)?;
            a.punpckhbw(xmm1, xmm7)?;
            a.movdqa(xmm2, xmm0)?;
            a.movdqa(xmm3, xmm1)?;
            a.punpcklwd(xmm0, xmm7)?;
            a.punpckhwd(xmm2, xmm7)?;
            a.punpcklwd(xmm1, xmm7)?;
            a.punpckhwd(xmm3, xmm7)?;
            a.cvtdq2ps(xmm0, xmm0)?;
            a.cvtdq2ps(xmm2, xmm2)?;
            a.cvtdq2ps(xmm1, xmm1)?;
            a.cvtdq2ps(xmm3, xmm3)?;
            a.movups(xmmword_ptr(rdi), xmm0)?;
            a.movups(xmmword_ptr(rdi + 16), xmm2)?;
            a.movups(xmmword_ptr(rdi + 32), xmm1)?;
            a.movups(xmmword_ptr(rdi + 48), xmm3)?;
            a.add(rsi, 16i32)?;
            a.add(rdi, 64i32)?;
            if groups > 1 {
                a.dec(rax)?;
                a.jnz(group_loop)?;
            }
        }

        for i in 0..tail {
            a.movzx(ecx, byte_ptr(rsi + disp(i)?))?;
            a.cvtsi2ss(xmm0, ecx)?;
            a.movss(dword_ptr(rdi + disp(i * 4)?), xmm0)?;
        }
        Ok(())
    }
}

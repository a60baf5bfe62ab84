//! Quantized fast path: 4x4 kernel, stride 4, uint8 input, fused ReLU.
//!
//! Multiplies 8-bit pixels against 8-bit quantized weights with
//! `pmaddubsw`, accumulates with signed saturation, shifts by the
//! quantization scale, saturation-adds the biases and clamps through
//! `packuswb` (which is ReLU-and-saturate in one step). The result is either
//! stored as uint8 or widened to f32.
//!
//! Preconditions: single input channel, eight filters, `input_width % 16 ==
//! 0`, more than 14 XMM registers available.

use iced_x86::code_asm::*;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::ops::{OperationCompiler, TensorPtr};
use crate::codegen::settings::CompilationSettings;
use crate::codegen::util::disp;
use crate::error::{Error, Result};

pub struct QuantizedInputConvCompiler<'m> {
    /// `[4, 4, 1, 8]` float weights.
    weights: &'m [f32],
    biases: &'m [f32],
    /// Power-of-two quantization scale.
    scale: u32,
    output_as_float: bool,
    input_dims: [usize; 3],
    weights_block: Option<ConstId>,
    bias_block: Option<ConstId>,
}

impl<'m> QuantizedInputConvCompiler<'m> {
    pub fn new(
        settings: &CompilationSettings,
        weights: &'m [f32],
        biases: &'m [f32],
        scale: u32,
        output_as_float: bool,
        input_dims: [usize; 3],
    ) -> Result<Self> {
        if input_dims[1] % 16 != 0 {
            return Err(Error::Compile(
                "quantized convolution requires the input width to be a multiple of 16".into(),
            ));
        }
        if settings.xmm_regs <= 14 {
            return Err(Error::Compile(
                "quantized convolution needs more than 14 XMM registers".into(),
            ));
        }
        if weights.len() != 4 * 4 * 8 || biases.len() != 8 {
            return Err(Error::Compile("quantized convolution expects 4x4x1x8 weights".into()));
        }
        Ok(QuantizedInputConvCompiler {
            weights,
            biases,
            scale,
            output_as_float,
            input_dims,
            weights_block: None,
            bias_block: None,
        })
    }

    fn convolution_for_pixel(&self, a: &mut CodeAssembler, pixel: u32) -> Result<()> {
        a.movdqa(xmm0, xmm8)?;
        a.movdqa(xmm2, xmm9)?;
        a.movdqa(xmm4, xmm10)?;
        a.movdqa(xmm6, xmm11)?;

        let shuffle = pixel | (pixel << 2) | (pixel << 4) | (pixel << 6);
        a.shufps(xmm0, xmm0, shuffle)?;
        a.shufps(xmm2, xmm2, shuffle)?;
        a.shufps(xmm4, xmm4, shuffle)?;
        a.shufps(xmm6, xmm6, shuffle)?;

        a.movdqa(xmm1, xmm0)?;
        a.movdqa(xmm3, xmm2)?;
        a.movdqa(xmm5, xmm4)?;
        a.movdqa(xmm7, xmm6)?;

        a.pmaddubsw(xmm0, xmmword_ptr(rbx))?;
        a.pmaddubsw(xmm1, xmmword_ptr(rbx + 0x10))?;
        a.pmaddubsw(xmm2, xmmword_ptr(rbx + 0x20))?;
        a.pmaddubsw(xmm3, xmmword_ptr(rbx + 0x30))?;
        a.pmaddubsw(xmm4, xmmword_ptr(rbx + 0x40))?;
        a.pmaddubsw(xmm5, xmmword_ptr(rbx + 0x50))?;
        a.pmaddubsw(xmm6, xmmword_ptr(rbx + 0x60))?;
        a.pmaddubsw(xmm7, xmmword_ptr(rbx + 0x70))?;

        a.paddsw(xmm0, xmm2)?;
        a.paddsw(xmm1, xmm3)?;
        a.paddsw(xmm4, xmm6)?;
        a.paddsw(xmm5, xmm7)?;
        a.paddsw(xmm0, xmm4)?;
        a.paddsw(xmm1, xmm5)?;
        a.phaddsw(xmm0, xmm1)?;

        a.psraw(xmm0, self.scale)?;
        a.paddsw(xmm0, xmm12)?;
        Ok(())
    }

    fn emit_float_output(&self, a: &mut CodeAssembler, dest_offset: usize) -> Result<()> {
        a.movdqa(xmm2, xmm13)?;
        a.punpcklbw(xmm13, xmm14)?;
        a.punpckhbw(xmm2, xmm14)?;
        a.movdqa(xmm1, xmm13)?;
        a.movdqa(xmm3, xmm2)?;
        a.punpcklwd(xmm13, xmm14)?;
        a.punpckhwd(xmm1, xmm14)?;
        a.punpcklwd(xmm2, xmm14)?;
        a.punpckhwd(xmm3, xmm14)?;
        a.cvtdq2ps(xmm13, xmm13)?;
        a.cvtdq2ps(xmm1, xmm1)?;
        a.cvtdq2ps(xmm2, xmm2)?;
        a.cvtdq2ps(xmm3, xmm3)?;
        a.movaps(xmmword_ptr(rdi + disp(dest_offset)?), xmm13)?;
        a.movaps(xmmword_ptr(rdi + disp(dest_offset + 16)?), xmm1)?;
        a.movaps(xmmword_ptr(rdi + disp(dest_offset + 32)?), xmm2)?;
        a.movaps(xmmword_ptr(rdi + disp(dest_offset + 48)?), xmm3)?;
        Ok(())
    }
}

impl<'m> OperationCompiler for QuantizedInputConvCompiler<'m> {
    fn can_be_inplace(&self) -> bool {
        false
    }

    fn initialize(
        &mut self,
        pool: &mut ConstantPool,
        _act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        // Weights as int8 in [y][channel][x] order so each pmaddubsw block
        // covers two output channels across one kernel row.
        let mut quantized = Vec::with_capacity(128);
        for y in 0..4 {
            for c in 0..8 {
                for x in 0..4 {
                    let w = self.weights[(y * 4 + x) * 8 + c];
                    quantized.push((w * (1 << self.scale) as f32) as i8 as u8);
                }
            }
        }
        self.weights_block = Some(pool.add_bytes(quantized));

        let biases: Vec<i16> = self.biases.iter().map(|&b| b as i16).collect();
        self.bias_block = Some(pool.add_i16(&biases));
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
        let [h, w, _] = self.input_dims;

        if self.output_as_float {
            a.pxor(xmm14, xmm14)?;
        }

        a.mov(rsi, input.addr)?;
        a.mov(rdi, output.addr)?;
        a.mov(rbx, pool.address(self.weights_block.expect("initialised")))?;
        a.mov(r11, pool.address(self.bias_block.expect("initialised")))?;
        a.movdqa(xmm12, xmmword_ptr(r11))?;

        let mut row_loop = a.create_label();
        if h > 4 {
            a.mov(rax, (h / 4) as u64)?;
            a.set_label(&mut row_loop)?;
        }
        let mut col_loop = a.create_label();
        if w > 16 {
            a.mov(rcx, (w / 16) as u64)?;
            a.set_label(&mut col_loop)?;
        }

        // 16 pixels from four consecutive rows: four output pixels.
        a.movdqa(xmm8, xmmword_ptr(rsi))?;
        a.movdqa(xmm9, xmmword_ptr(rsi + disp(w)?))?;
        a.movdqa(xmm10, xmmword_ptr(rsi + disp(2 * w)?))?;
        a.movdqa(xmm11, xmmword_ptr(rsi + disp(3 * w)?))?;

        self.convolution_for_pixel(a, 0)?;
        a.movdqa(xmm13, xmm0)?;
        self.convolution_for_pixel(a, 1)?;
        a.packuswb(xmm13, xmm0)?;
        if self.output_as_float {
            self.emit_float_output(a, 0)?;
        } else {
            a.movdqa(xmmword_ptr(rdi), xmm13)?;
        }

        self.convolution_for_pixel(a, 2)?;
        a.movdqa(xmm13, xmm0)?;
        self.convolution_for_pixel(a, 3)?;
        a.packuswb(xmm13, xmm0)?;
        if self.output_as_float {
            self.emit_float_output(a, 0x40)?;
        } else {
            a.movdqa(xmmword_ptr(rdi + 0x10), xmm13)?;
        }

        a.add(rdi, if self.output_as_float { 0x80i32 } else { 0x20i32 })?;

        if w > 16 {
            a.add(rsi, 0x10i32)?;
            a.dec(rcx)?;
            a.jnz(col_loop)?;
        }
        if h > 4 {
            a.add(rsi, disp(w * 3)?)?;
            a.dec(rax)?;
            a.jnz(row_loop)?;
        }
        Ok(())
    }
}

//! Per-layer operation compilers.
//!
//! Each compiler is constructed for one node with its concrete shapes,
//! declares constant tables in `initialize`, and emits its instruction
//! stream in `compile` against preassigned buffer addresses. Emitters may
//! clobber every caller-save GP register and all XMMs up to
//! `settings.xmm_regs`; the driver's prologue/epilogue handles the rest.

mod activation;
mod arithmetic;
mod batch_normalization;
mod concatenate;
mod conv2d;
mod cropping2d;
mod dconv2d;
mod global_pooling2d;
mod im2col;
mod pooling2d;
mod quantized_conv;
mod softmax;
mod spatial;
mod uint8_input;
mod upsampling2d;
mod zero_padding2d;

pub use activation::ActivationCompiler;
pub use arithmetic::{ArithmeticCompiler, ArithmeticOp};
pub use batch_normalization::BatchNormalizationCompiler;
pub use concatenate::ConcatenateCompiler;
pub use conv2d::Conv2DCompiler;
pub use cropping2d::Cropping2DCompiler;
pub use dconv2d::{DConv2DCompiler, SeparableConv2DCompiler};
pub use global_pooling2d::GlobalPooling2DCompiler;
pub use pooling2d::Pooling2DCompiler;
pub use quantized_conv::QuantizedInputConvCompiler;
pub use softmax::SoftmaxCompiler;
pub use uint8_input::UInt8InputCompiler;
pub use upsampling2d::UpSampling2DCompiler;
pub use zero_padding2d::ZeroPadding2DCompiler;

use iced_x86::code_asm::CodeAssembler;

use crate::codegen::activation::ActivationFunctionHandler;
use crate::codegen::constants::ConstantPool;
use crate::codegen::util;
use crate::error::{Error, Result};
use crate::model::ActivationId;

/// A tensor buffer resolved to its final address.
#[derive(Debug, Clone)]
pub struct TensorPtr {
    pub addr: u64,
    pub dims: Vec<usize>,
}

impl TensorPtr {
    pub fn new(addr: u64, dims: Vec<usize>) -> Self {
        TensorPtr { addr, dims }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }
}

pub trait OperationCompiler {
    /// Whether the emitted code tolerates input and output aliasing.
    fn can_be_inplace(&self) -> bool {
        false
    }

    /// Scratch floats this node needs during execution.
    fn scratch_floats(&self) -> usize {
        0
    }

    /// Declares constant tables. Runs once, before buffer planning is
    /// finalised and before any emission.
    fn initialize(
        &mut self,
        _pool: &mut ConstantPool,
        _act: &mut ActivationFunctionHandler,
    ) -> Result<()> {
        Ok(())
    }

    /// Emits the instruction stream for this node.
    fn compile(
        &self,
        a: &mut CodeAssembler,
        pool: &ConstantPool,
        act: &ActivationFunctionHandler,
        inputs: &[TensorPtr],
        outputs: &[TensorPtr],
        scratch: Option<&TensorPtr>,
    ) -> Result<()>;
}

/// Maps a layer's activation id onto a compiled descriptor.
///
/// Softmax is not representable as a register-level activation; the driver
/// splits it into a separate node before compilers are built.
pub fn map_activation(
    id: ActivationId,
) -> Result<crate::codegen::activation::CompiledActivation> {
    use crate::codegen::activation::CompiledActivation;
    Ok(match id {
        ActivationId::Linear => CompiledActivation::Linear,
        ActivationId::Relu => CompiledActivation::Relu {
            max_value: f32::MAX,
            negative_slope: 0.0,
            threshold: 0.0,
        },
        ActivationId::Sigmoid => CompiledActivation::Sigmoid,
        ActivationId::TanH => CompiledActivation::TanH,
        ActivationId::HardSigmoid => CompiledActivation::HardSigmoid,
        ActivationId::Elu => CompiledActivation::Elu { alpha: 1.0 },
        ActivationId::Selu => CompiledActivation::Selu,
        ActivationId::Exponential => CompiledActivation::Exponential,
        ActivationId::Softsign => CompiledActivation::Softsign,
        ActivationId::Softmax => {
            return Err(Error::Compile(
                "softmax must be compiled as a separate node".into(),
            ))
        }
    })
}

/// Identity data movement for reshape/flatten/dropout nodes whose output
/// could not share storage with their input.
pub struct CopyCompiler {
    xmm_regs: usize,
}

impl CopyCompiler {
    pub fn new(xmm_regs: usize) -> Self {
        CopyCompiler { xmm_regs }
    }
}

impl OperationCompiler for CopyCompiler {
    fn can_be_inplace(&self) -> bool {
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
        use iced_x86::code_asm::{rdi, rsi};
        let input = &inputs[0];
        let output = &outputs[0];
        if input.addr == output.addr {
            return Ok(());
        }
        debug_assert_eq!(input.size(), output.size());
        a.mov(rsi, input.addr)?;
        a.mov(rdi, output.addr)?;
        util::emit_packed_copy(a, self.xmm_regs, input.size(), rsi, rdi, true, true)
    }
}

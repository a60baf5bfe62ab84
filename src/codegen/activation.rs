//! Activation-function handler.
//!
//! Tracks the distinct `(activation, parameters)` descriptors used by a
//! compilation, shares one constant block per distinct descriptor, reports
//! the scratch-register budget each activation needs, and emits the in-place
//! transformation over a set of XMM value registers.
//!
//! Constant blocks are memory-resident and addressed through `r10`/`r11`, so
//! there is no separate per-loop initialisation pass; `apply` is
//! self-contained and may be emitted inside accumulation loops.

use iced_x86::code_asm::*;

use crate::codegen::constants::{ConstId, ConstantPool};
use crate::codegen::math;
use crate::codegen::settings::CompilationSettings;
use crate::error::{Error, Result};

const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701;

/// An activation with its resolved parameters, as compiled into a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompiledActivation {
    Linear,
    Relu {
        max_value: f32,
        negative_slope: f32,
        threshold: f32,
    },
    Sigmoid,
    TanH,
    HardSigmoid,
    Elu {
        alpha: f32,
    },
    Selu,
    Exponential,
    Softsign,
}

impl CompiledActivation {
    /// Bit-exact identity used for constant-block sharing.
    fn key(&self) -> (u8, u32, u32, u32) {
        match *self {
            CompiledActivation::Linear => (0, 0, 0, 0),
            CompiledActivation::Relu {
                max_value,
                negative_slope,
                threshold,
            } => (1, max_value.to_bits(), negative_slope.to_bits(), threshold.to_bits()),
            CompiledActivation::Sigmoid => (2, 0, 0, 0),
            CompiledActivation::TanH => (3, 0, 0, 0),
            CompiledActivation::HardSigmoid => (4, 0, 0, 0),
            CompiledActivation::Elu { alpha } => (5, alpha.to_bits(), 0, 0),
            CompiledActivation::Selu => (6, 0, 0, 0),
            CompiledActivation::Exponential => (7, 0, 0, 0),
            CompiledActivation::Softsign => (8, 0, 0, 0),
        }
    }
}

pub struct ActivationFunctionHandler {
    approx_sigmoid: bool,
    approx_tanh: bool,
    entries: Vec<((u8, u32, u32, u32), Option<ConstId>)>,
    poly_block: Option<ConstId>,
}

impl ActivationFunctionHandler {
    pub fn new(settings: &CompilationSettings) -> Self {
        ActivationFunctionHandler {
            approx_sigmoid: settings.use_exp_approx_in_sigmoid,
            approx_tanh: settings.use_exp_approx_in_tanh,
            entries: Vec::new(),
            poly_block: None,
        }
    }

    /// Number of spare XMM registers `apply` needs for this activation.
    /// Accumulator tiles must subtract these from the register budget.
    pub fn needed_spares(&self, desc: &CompiledActivation) -> usize {
        match desc {
            CompiledActivation::Linear | CompiledActivation::HardSigmoid => 0,
            CompiledActivation::Relu { negative_slope, .. } => {
                if *negative_slope != 0.0 {
                    2
                } else {
                    1
                }
            }
            CompiledActivation::Softsign => 1,
            CompiledActivation::Sigmoid => {
                if self.approx_sigmoid {
                    1
                } else {
                    3
                }
            }
            CompiledActivation::TanH => {
                if self.approx_tanh {
                    1
                } else {
                    3
                }
            }
            CompiledActivation::Exponential => 3,
            CompiledActivation::Elu { .. } | CompiledActivation::Selu => 4,
        }
    }

    fn poly(&mut self, pool: &mut ConstantPool) -> ConstId {
        *self
            .poly_block
            .get_or_insert_with(|| math::define_exp_poly(pool))
    }

    /// Declares the constant data for `desc`. Descriptors with identical
    /// parameters share a single block.
    pub fn register(&mut self, desc: &CompiledActivation, pool: &mut ConstantPool) {
        let key = desc.key();
        if self.entries.iter().any(|(k, _)| *k == key) {
            return;
        }
        let block = match desc {
            CompiledActivation::Linear => None,
            CompiledActivation::Relu {
                max_value,
                negative_slope,
                threshold,
            } => {
                if *max_value == f32::MAX && *negative_slope == 0.0 && *threshold == 0.0 {
                    None
                } else {
                    let mut data = Vec::new();
                    data.extend_from_slice(&[*threshold; 4]);
                    data.extend_from_slice(&[*negative_slope; 4]);
                    data.extend_from_slice(&[*max_value; 4]);
                    Some(pool.add_f32(&data))
                }
            }
            CompiledActivation::Sigmoid => {
                if self.approx_sigmoid {
                    let id = math::define_exp_approx_with_one(pool, -1.0);
                    Some(id)
                } else {
                    self.poly(pool);
                    let mut bytes = Vec::new();
                    for _ in 0..4 {
                        bytes.extend_from_slice(&0x8000_0000u32.to_le_bytes());
                    }
                    for _ in 0..4 {
                        bytes.extend_from_slice(&1.0f32.to_le_bytes());
                    }
                    Some(pool.add_bytes(bytes))
                }
            }
            CompiledActivation::TanH => {
                if self.approx_tanh {
                    let id = math::define_exp_approx_with_one(pool, 2.0);
                    Some(id)
                } else {
                    self.poly(pool);
                    let mut data = Vec::new();
                    data.extend_from_slice(&[2.0f32; 4]);
                    data.extend_from_slice(&[1.0f32; 4]);
                    Some(pool.add_f32(&data))
                }
            }
            CompiledActivation::HardSigmoid => {
                let mut data = Vec::new();
                data.extend_from_slice(&[0.2f32; 4]);
                data.extend_from_slice(&[0.5f32; 4]);
                data.extend_from_slice(&[1.0f32; 4]);
                data.extend_from_slice(&[0.0f32; 4]);
                Some(pool.add_f32(&data))
            }
            CompiledActivation::Softsign => {
                let mut bytes = Vec::new();
                for _ in 0..4 {
                    bytes.extend_from_slice(&0x7fff_ffffu32.to_le_bytes());
                }
                for _ in 0..4 {
                    bytes.extend_from_slice(&1.0f32.to_le_bytes());
                }
                Some(pool.add_bytes(bytes))
            }
            CompiledActivation::Exponential => {
                self.poly(pool);
                None
            }
            CompiledActivation::Elu { alpha } => {
                self.poly(pool);
                let mut data = Vec::new();
                data.extend_from_slice(&[*alpha; 4]);
                data.extend_from_slice(&[1.0f32; 4]);
                data.extend_from_slice(&[0.0f32; 4]);
                Some(pool.add_f32(&data))
            }
            CompiledActivation::Selu => {
                self.poly(pool);
                let mut data = Vec::new();
                data.extend_from_slice(&[SELU_ALPHA; 4]);
                data.extend_from_slice(&[1.0f32; 4]);
                data.extend_from_slice(&[0.0f32; 4]);
                data.extend_from_slice(&[SELU_SCALE; 4]);
                Some(pool.add_f32(&data))
            }
        };
        self.entries.push((key, block));
    }

    fn block(&self, desc: &CompiledActivation) -> Result<Option<ConstId>> {
        let key = desc.key();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, block)| *block)
            .ok_or_else(|| Error::Compile(format!("activation {desc:?} was not registered")))
    }

    /// Transforms every register in `values` in place.
    ///
    /// `spares` must contain at least `needed_spares(desc)` registers that
    /// may be clobbered. `r10` and `r11` are clobbered when the activation
    /// reads constant tables.
    pub fn apply(
        &self,
        a: &mut CodeAssembler,
        pool: &ConstantPool,
        desc: &CompiledActivation,
        spares: &[AsmRegisterXmm],
        values: &[AsmRegisterXmm],
    ) -> Result<()> {
        if spares.len() < self.needed_spares(desc) {
            return Err(Error::Compile(format!(
                "activation {desc:?} needs {} spare registers, got {}",
                self.needed_spares(desc),
                spares.len()
            )));
        }
        let block = self.block(desc)?;
        if let Some(id) = block {
            a.mov(r11, pool.address(id))?;
        }
        let needs_poly = matches!(
            desc,
            CompiledActivation::Exponential | CompiledActivation::Elu { .. } | CompiledActivation::Selu
        ) || (matches!(desc, CompiledActivation::Sigmoid) && !self.approx_sigmoid)
            || (matches!(desc, CompiledActivation::TanH) && !self.approx_tanh);
        if needs_poly {
            let id = self
                .poly_block
                .ok_or_else(|| Error::Compile("polynomial exp block missing".into()))?;
            a.mov(r10, pool.address(id))?;
        }
        let c = |off: usize| xmmword_ptr(r11 + off as i32);

        match desc {
            CompiledActivation::Linear => {}

            CompiledActivation::Relu {
                max_value,
                negative_slope,
                threshold,
            } => {
                let clamp = *max_value != f32::MAX;
                if *negative_slope == 0.0 && *threshold == 0.0 {
                    a.xorps(spares[0], spares[0])?;
                    for &v in values {
                        a.maxps(v, spares[0])?;
                    }
                } else if *negative_slope == 0.0 {
                    for &v in values {
                        a.movaps(spares[0], v)?;
                        a.cmpps(spares[0], c(0), 6u32)?; // value > threshold
                        a.andps(v, spares[0])?;
                    }
                } else {
                    for &v in values {
                        a.movaps(spares[0], v)?;
                        a.subps(spares[0], c(0))?;
                        a.mulps(spares[0], c(16))?; // slope * (x - threshold)
                        a.movaps(spares[1], v)?;
                        a.cmpps(spares[1], c(0), 6u32)?;
                        a.andps(v, spares[1])?;
                        a.andnps(spares[1], spares[0])?;
                        a.orps(v, spares[1])?;
                    }
                }
                if clamp {
                    for &v in values {
                        a.minps(v, c(32))?;
                    }
                }
            }

            CompiledActivation::Sigmoid => {
                if self.approx_sigmoid {
                    // 1 / (1 + exp(-x)) with the approximated exp
                    math::emit_exp_approx(a, values, r11)?;
                    for &v in values {
                        a.addps(v, c(32))?;
                        a.movaps(spares[0], c(32))?;
                        a.divps(spares[0], v)?;
                        a.movaps(v, spares[0])?;
                    }
                } else {
                    for &v in values {
                        a.xorps(v, c(0))?; // negate
                        math::emit_exp_poly(a, v, [spares[0], spares[1], spares[2]], r10)?;
                        a.addps(v, c(16))?;
                        a.movaps(spares[0], c(16))?;
                        a.divps(spares[0], v)?;
                        a.movaps(v, spares[0])?;
                    }
                }
            }

            CompiledActivation::TanH => {
                // (e^{2x} - 1) / (e^{2x} + 1)
                if self.approx_tanh {
                    math::emit_exp_approx(a, values, r11)?;
                    for &v in values {
                        a.movaps(spares[0], v)?;
                        a.addps(spares[0], c(32))?;
                        a.subps(v, c(32))?;
                        a.divps(v, spares[0])?;
                    }
                } else {
                    for &v in values {
                        a.mulps(v, c(0))?;
                        math::emit_exp_poly(a, v, [spares[0], spares[1], spares[2]], r10)?;
                        a.movaps(spares[0], v)?;
                        a.addps(spares[0], c(16))?;
                        a.subps(v, c(16))?;
                        a.divps(v, spares[0])?;
                    }
                }
            }

            CompiledActivation::HardSigmoid => {
                for &v in values {
                    a.mulps(v, c(0))?;
                    a.addps(v, c(16))?;
                    a.maxps(v, c(48))?;
                    a.minps(v, c(32))?;
                }
            }

            CompiledActivation::Softsign => {
                for &v in values {
                    a.movaps(spares[0], v)?;
                    a.andps(spares[0], c(0))?;
                    a.addps(spares[0], c(16))?;
                    a.divps(v, spares[0])?;
                }
            }

            CompiledActivation::Exponential => {
                for &v in values {
                    math::emit_exp_poly(a, v, [spares[0], spares[1], spares[2]], r10)?;
                }
            }

            CompiledActivation::Elu { .. } | CompiledActivation::Selu => {
                for &v in values {
                    a.movaps(spares[0], v)?;
                    math::emit_exp_poly(a, v, [spares[1], spares[2], spares[3]], r10)?;
                    a.subps(v, c(16))?;
                    a.mulps(v, c(0))?;
                    a.movaps(spares[1], spares[0])?;
                    a.cmpps(spares[1], c(32), 1u32)?; // original < 0
                    a.andps(v, spares[1])?;
                    a.andnps(spares[1], spares[0])?;
                    a.orps(v, spares[1])?;
                    if matches!(desc, CompiledActivation::Selu) {
                        a.mulps(v, c(48))?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_with_equal_parameters_share_blocks() {
        let settings = CompilationSettings::default();
        let mut handler = ActivationFunctionHandler::new(&settings);
        let mut pool = ConstantPool::new();
        let a = CompiledActivation::Elu { alpha: 0.5 };
        let b = CompiledActivation::Elu { alpha: 0.5 };
        let c = CompiledActivation::Elu { alpha: 1.0 };
        handler.register(&a, &mut pool);
        handler.register(&b, &mut pool);
        handler.register(&c, &mut pool);
        assert_eq!(handler.entries.len(), 2);
    }

    #[test]
    fn spare_budget_shrinks_with_approximation() {
        let mut settings = CompilationSettings::default();
        settings.use_exp_approx_in_sigmoid = true;
        let handler = ActivationFunctionHandler::new(&settings);
        assert_eq!(handler.needed_spares(&CompiledActivation::Sigmoid), 1);
        settings.use_exp_approx_in_sigmoid = false;
        let handler = ActivationFunctionHandler::new(&settings);
        assert_eq!(handler.needed_spares(&CompiledActivation::Sigmoid), 3);
        assert_eq!(handler.needed_spares(&CompiledActivation::Linear), 0);
    }
}

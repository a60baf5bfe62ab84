//! JIT compiler for small feed-forward neural networks.
//!
//! Loads a trained model (Keras HDF5, optionally ONNX), specialises every
//! layer for its concrete tensor shapes and emits x86-64 SSE machine code
//! that evaluates the network over a fixed set of preallocated buffers:
//!
//! ```no_run
//! use compiled_nn::{CompilationSettings, CompiledNN, Model};
//!
//! # fn main() -> compiled_nn::Result<()> {
//! let model = Model::load("model.h5")?;
//! let mut nn = CompiledNN::compile(&model, &CompilationSettings::default())?;
//! nn.input(0).data_mut().fill(0.0);
//! nn.apply();
//! let prediction = nn.output(0).data().to_vec();
//! # Ok(())
//! # }
//! ```
//!
//! The [`interp`] module holds a straightforward interpreter over the same
//! graph, used as the oracle in tests and the `nn-check` harness.

pub mod codegen;
pub mod error;
pub mod interp;
pub mod model;
pub mod parse;
pub mod tensor;

pub use codegen::{CompilationSettings, CompiledNN};
pub use error::{Error, Result};
pub use model::Model;
pub use tensor::Tensor;

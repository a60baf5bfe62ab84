//! Model file readers. Both populate the in-memory graph of [`crate::model`].

#[cfg(feature = "keras-hdf5")]
pub mod keras;
#[cfg(feature = "onnx")]
pub mod onnx;

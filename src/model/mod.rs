//! In-memory network model: layers, nodes and shape propagation.

mod graph;
mod layers;

pub use graph::{LayerId, Model, Node, NodeRef, TensorLocation};
pub use layers::{
    normalize_axis, ActivationId, InterpolationMethod, Layer, LayerKind, PaddingType,
    PoolingMethod, BOTTOM, LEFT, RIGHT, TOP,
};

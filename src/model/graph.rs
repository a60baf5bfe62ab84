//! Model graph: layers own nodes, nodes reference tensors by location.
//!
//! The graph uses arena indices rather than pointers: a [`TensorLocation`] is
//! a `(layer, node, output)` index triple that is looked up in the owning
//! [`Model`]. This keeps the graph `Send` and lets compilation hold locations
//! without borrowing the model mutably.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::layers::{Layer, LayerKind};

pub type LayerId = usize;

/// Identifies one output tensor in the graph. Lookup only, never ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorLocation {
    pub layer: LayerId,
    pub node_index: usize,
    pub tensor_index: usize,
}

impl TensorLocation {
    pub fn new(layer: LayerId, node_index: usize, tensor_index: usize) -> Self {
        TensorLocation {
            layer,
            node_index,
            tensor_index,
        }
    }
}

/// Identifies one node (a layer instance) in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub layer: LayerId,
    pub node_index: usize,
}

/// A layer instance with resolved input/output shapes.
///
/// Nodes are mutated only while a reader builds the graph; afterwards they
/// are immutable until the model is dropped.
#[derive(Debug)]
pub struct Node {
    pub inputs: Vec<TensorLocation>,
    pub input_dimensions: Vec<Vec<usize>>,
    pub output_dimensions: Vec<Vec<usize>>,
}

/// A neural network model: layer list plus designated inputs and outputs.
#[derive(Debug, Default)]
pub struct Model {
    pub layers: Vec<Layer>,
    pub inputs: Vec<TensorLocation>,
    pub outputs: Vec<TensorLocation>,
    uint8_inputs: Vec<bool>,
}

impl Model {
    pub fn new() -> Self {
        Model::default()
    }

    /// Loads a model from a file, dispatching on the extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Model> {
        let path = path.as_ref();
        let name = path.to_string_lossy();
        #[cfg(feature = "keras-hdf5")]
        if name.ends_with(".h5") || name.ends_with(".hdf5") {
            return crate::parse::keras::read(path);
        }
        #[cfg(feature = "onnx")]
        if name.ends_with(".onnx") {
            return crate::parse::onnx::read(path);
        }
        Err(Error::ModelLoad(format!("unsupported model format: {name}")))
    }

    pub fn clear(&mut self) {
        self.layers.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.uint8_inputs.clear();
    }

    /// Marks the model input at `index` as a uint8 tensor.
    pub fn set_input_uint8(&mut self, index: usize) {
        assert!(index < self.inputs.len());
        if self.uint8_inputs.len() <= index {
            self.uint8_inputs.resize(index + 1, false);
        }
        self.uint8_inputs[index] = true;
    }

    pub fn is_input_uint8(&self, index: usize) -> bool {
        self.uint8_inputs.get(index).copied().unwrap_or(false)
    }

    pub fn add_layer(&mut self, kind: LayerKind) -> LayerId {
        self.layers.push(Layer {
            kind,
            nodes: Vec::new(),
        });
        self.layers.len() - 1
    }

    /// Creates a node on `layer` wired to `inputs` and propagates shapes.
    ///
    /// Input locations must reference nodes that already exist; this forces
    /// construction in a producer-before-consumer order.
    pub fn add_node(&mut self, layer: LayerId, inputs: &[TensorLocation]) -> Result<NodeRef> {
        let mut input_dimensions = Vec::with_capacity(inputs.len());
        for loc in inputs {
            input_dimensions.push(self.output_dimensions(*loc)?.to_vec());
        }
        let kind = &self.layers[layer].kind;
        let output_dimensions = kind.calc_output_dimensions(&input_dimensions)?;
        let nodes = &mut self.layers[layer].nodes;
        nodes.push(Node {
            inputs: inputs.to_vec(),
            input_dimensions,
            output_dimensions,
        });
        Ok(NodeRef {
            layer,
            node_index: nodes.len() - 1,
        })
    }

    pub fn node(&self, node: NodeRef) -> &Node {
        &self.layers[node.layer].nodes[node.node_index]
    }

    /// Dimensions of the tensor at `location`, validating that it exists.
    pub fn output_dimensions(&self, location: TensorLocation) -> Result<&[usize]> {
        self.layers
            .get(location.layer)
            .and_then(|l| l.nodes.get(location.node_index))
            .and_then(|n| n.output_dimensions.get(location.tensor_index))
            .map(|d| d.as_slice())
            .ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "tensor location ({}, {}, {}) does not exist",
                    location.layer, location.node_index, location.tensor_index
                ))
            })
    }

    /// All nodes of the graph in declaration order.
    pub fn node_refs(&self) -> Vec<NodeRef> {
        let mut refs = Vec::new();
        for (layer, l) in self.layers.iter().enumerate() {
            for node_index in 0..l.nodes.len() {
                refs.push(NodeRef { layer, node_index });
            }
        }
        refs
    }

    /// Orders all nodes so that every producer precedes its consumers.
    ///
    /// Fails with `InvalidGraph` on dangling references or cycles.
    pub fn topological_order(&self) -> Result<Vec<NodeRef>> {
        let all = self.node_refs();
        let mut indegree: HashMap<NodeRef, usize> = all.iter().map(|&n| (n, 0)).collect();
        let mut consumers: HashMap<NodeRef, Vec<NodeRef>> = HashMap::new();

        for &node in &all {
            for loc in &self.node(node).inputs {
                // Validates the reference and the tensor index.
                self.output_dimensions(*loc)?;
                let producer = NodeRef {
                    layer: loc.layer,
                    node_index: loc.node_index,
                };
                *indegree.get_mut(&node).unwrap() += 1;
                consumers.entry(producer).or_default().push(node);
            }
        }

        let mut ready: Vec<NodeRef> = all
            .iter()
            .copied()
            .filter(|n| indegree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(all.len());
        while let Some(node) = ready.pop() {
            order.push(node);
            if let Some(next) = consumers.get(&node) {
                for &consumer in next {
                    let d = indegree.get_mut(&consumer).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        ready.push(consumer);
                    }
                }
            }
        }

        if order.len() != all.len() {
            return Err(Error::InvalidGraph("cycle in graph".into()));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::layers::ActivationId;
    use crate::tensor::Tensor;

    fn input_model(dims: Vec<usize>) -> (Model, TensorLocation) {
        let mut model = Model::new();
        let input = model.add_layer(LayerKind::Input { dimensions: dims });
        let node = model.add_node(input, &[]).unwrap();
        let loc = TensorLocation::new(node.layer, node.node_index, 0);
        model.inputs.push(loc);
        (model, loc)
    }

    #[test]
    fn add_node_propagates_shapes() {
        let (mut model, input) = input_model(vec![4]);
        let dense = model.add_layer(LayerKind::Dense {
            weights: Tensor::new(vec![4, 3]),
            biases: vec![0.0; 3],
            has_biases: true,
            activation: ActivationId::Linear,
        });
        let node = model.add_node(dense, &[input]).unwrap();
        assert_eq!(model.node(node).output_dimensions, vec![vec![3]]);
    }

    #[test]
    fn dangling_location_rejected() {
        let (mut model, _) = input_model(vec![4]);
        let relu = model.add_layer(LayerKind::Relu {
            max_value: f32::MAX,
            negative_slope: 0.0,
            threshold: 0.0,
        });
        let bad = TensorLocation::new(7, 0, 0);
        assert!(model.add_node(relu, &[bad]).is_err());
    }

    #[test]
    fn topological_order_respects_edges() {
        let (mut model, input) = input_model(vec![8]);
        let relu = model.add_layer(LayerKind::Relu {
            max_value: f32::MAX,
            negative_slope: 0.0,
            threshold: 0.0,
        });
        let relu_node = model.add_node(relu, &[input]).unwrap();
        let relu_out = TensorLocation::new(relu_node.layer, 0, 0);
        let add = model.add_layer(LayerKind::Add);
        let add_node = model.add_node(add, &[input, relu_out]).unwrap();

        let order = model.topological_order().unwrap();
        let pos = |n: NodeRef| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(relu_node) < pos(add_node));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn cycle_is_detected() {
        // Build two merge nodes referencing each other by fabricating the
        // second node's location before it exists, then wiring manually.
        let (mut model, input) = input_model(vec![4]);
        let add = model.add_layer(LayerKind::Add);
        let a = model.add_node(add, &[input, input]).unwrap();
        let a_out = TensorLocation::new(a.layer, 0, 0);
        let b = model.add_node(add, &[input, a_out]).unwrap();
        // Rewire a's second input to b's output, closing a cycle.
        let b_out = TensorLocation::new(b.layer, b.node_index, 0);
        model.layers[a.layer].nodes[a.node_index].inputs[1] = b_out;
        assert!(matches!(
            model.topological_order(),
            Err(Error::InvalidGraph(_))
        ));
    }
}

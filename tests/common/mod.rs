//! Shared helpers for the compiled-vs-interpreter test matrix.
#![allow(dead_code)] // not every test binary uses every helper

use compiled_nn::codegen::{CompilationSettings, CompiledNN};
use compiled_nn::model::{LayerKind, Model, NodeRef, TensorLocation};
use compiled_nn::{interp, Tensor};
use rand::{Rng, SeedableRng};

/// Builds a model holding a single node of `kind` wired to fresh inputs.
pub fn single_node(kind: LayerKind, input_dims: &[Vec<usize>]) -> (Model, NodeRef) {
    let mut model = Model::new();
    let mut locations = Vec::with_capacity(input_dims.len());
    for dims in input_dims {
        let input = model.add_layer(LayerKind::Input {
            dimensions: dims.clone(),
        });
        let node = model.add_node(input, &[]).expect("input node");
        locations.push(TensorLocation::new(node.layer, node.node_index, 0));
    }
    let layer = model.add_layer(kind);
    let node = model.add_node(layer, &locations).expect("node under test");
    (model, node)
}

pub fn oracle_settings() -> CompilationSettings {
    CompilationSettings {
        use_exp_approx_in_sigmoid: false,
        use_exp_approx_in_tanh: false,
        debug: true,
        ..CompilationSettings::default()
    }
}

pub fn random_tensor(rng: &mut impl Rng, dims: &[usize], lo: f32, hi: f32) -> Tensor {
    let mut tensor = Tensor::new(dims.to_vec());
    for v in tensor.data_mut() {
        *v = rng.gen_range(lo..=hi);
    }
    tensor
}

pub fn rng() -> rand::rngs::StdRng {
    rand::rngs::StdRng::seed_from_u64(0x5eed)
}

/// Compiles the node alone, runs it on `inputs`, and checks every output
/// against the interpreter within `tolerance` relative error.
pub fn check_node(
    model: &Model,
    node: NodeRef,
    settings: &CompilationSettings,
    inputs: &[Tensor],
    tolerance: f32,
) -> Vec<Tensor> {
    let mut nn = CompiledNN::compile_node(model, node, settings).expect("compilation");
    assert_eq!(nn.num_of_inputs(), inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        nn.input(i).copy_from(input);
    }
    nn.apply();

    let refs: Vec<&Tensor> = inputs.iter().collect();
    let n = model.node(node);
    let expected = interp::apply_node(
        &model.layers[node.layer].kind,
        &refs,
        &n.output_dimensions,
    )
    .expect("interpreter");
    assert_eq!(nn.num_of_outputs(), expected.len());
    let mut outputs = Vec::with_capacity(expected.len());
    for (i, tensor) in expected.iter().enumerate() {
        let rel = tensor.max_rel_error(nn.output(i).data());
        assert!(
            rel <= tolerance,
            "output {i}: relative error {rel} exceeds {tolerance}"
        );
        outputs.push(nn.output(i).to_tensor());
    }
    outputs
}

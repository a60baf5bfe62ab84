//! Whole-network compilation: multi-layer graphs, branches, batchnorm
//! fusion and uint8 inputs, all checked against the interpreter.

#![cfg(target_arch = "x86_64")]

mod common;

use common::{oracle_settings, random_tensor, rng};
use compiled_nn::codegen::CompiledNN;
use compiled_nn::model::{
    ActivationId, LayerKind, Model, PaddingType, PoolingMethod, TensorLocation,
};
use compiled_nn::{interp, Tensor};
use rand::Rng;

fn location(model: &mut Model, kind: LayerKind, inputs: &[TensorLocation]) -> TensorLocation {
    let layer = model.add_layer(kind);
    let node = model.add_node(layer, inputs).expect("node");
    TensorLocation::new(node.layer, node.node_index, 0)
}

fn run_and_compare(model: &Model, inputs: &[Tensor], tolerance: f32) {
    let expected = interp::apply(model, inputs).expect("interpreter");
    let mut nn = CompiledNN::compile(model, &oracle_settings()).expect("compilation");
    assert_eq!(nn.num_of_inputs(), inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        nn.input(i).copy_from(input);
    }
    nn.apply();
    assert_eq!(nn.num_of_outputs(), expected.len());
    for (i, tensor) in expected.iter().enumerate() {
        let rel = tensor.max_rel_error(nn.output(i).data());
        assert!(rel <= tolerance, "output {i}: relative error {rel}");
    }
}

#[test]
fn small_convnet_end_to_end() {
    let mut rng = rng();
    let mut model = Model::new();
    let input = location(&mut model, LayerKind::Input {
        dimensions: vec![8, 8, 3],
    }, &[]);
    model.inputs.push(input);

    let conv1 = location(&mut model, LayerKind::Conv2D {
        strides: [1, 1],
        weights: random_tensor(&mut rng, &[3, 3, 3, 8], -0.5, 0.5),
        biases: random_tensor(&mut rng, &[8], -0.1, 0.1).data().to_vec(),
        has_biases: true,
        activation: ActivationId::Relu,
        padding: PaddingType::Same,
    }, &[input]);

    let pool = location(&mut model, LayerKind::Pooling2D {
        method: PoolingMethod::Max,
        padding: PaddingType::Valid,
        kernel_size: [2, 2],
        strides: [2, 2],
    }, &[conv1]);

    let conv2 = location(&mut model, LayerKind::Conv2D {
        strides: [1, 1],
        weights: random_tensor(&mut rng, &[3, 3, 8, 6], -0.5, 0.5),
        biases: random_tensor(&mut rng, &[6], -0.1, 0.1).data().to_vec(),
        has_biases: true,
        activation: ActivationId::TanH,
        padding: PaddingType::Valid,
    }, &[pool]);

    let flat = location(&mut model, LayerKind::Flatten, &[conv2]);

    let dense = location(&mut model, LayerKind::Dense {
        weights: random_tensor(&mut rng, &[24, 10], -0.5, 0.5),
        biases: random_tensor(&mut rng, &[10], -0.1, 0.1).data().to_vec(),
        has_biases: true,
        activation: ActivationId::Softmax,
    }, &[flat]);
    model.outputs.push(dense);

    let input_data = random_tensor(&mut rng, &[8, 8, 3], -1.0, 1.0);
    run_and_compare(&model, &[input_data], 1e-4);
}

#[test]
fn branching_graph_with_concat_and_add() {
    let mut rng = rng();
    let mut model = Model::new();
    let input = location(&mut model, LayerKind::Input {
        dimensions: vec![4, 4, 4],
    }, &[]);
    model.inputs.push(input);

    let a = location(&mut model, LayerKind::Relu {
        max_value: f32::MAX,
        negative_slope: 0.0,
        threshold: 0.0,
    }, &[input]);
    let b = location(&mut model, LayerKind::Activation {
        activation: ActivationId::TanH,
    }, &[input]);
    let sum = location(&mut model, LayerKind::Add, &[a, b]);
    let cat = location(&mut model, LayerKind::Concatenate { axis: -1 }, &[sum, input]);
    model.outputs.push(cat);

    let input_data = random_tensor(&mut rng, &[4, 4, 4], -1.0, 1.0);
    run_and_compare(&model, &[input_data], 1e-5);
}

#[test]
fn batchnorm_fuses_into_the_preceding_convolution() {
    let mut rng = rng();
    let factor: Vec<f32> = (0..8).map(|_| rng.gen_range(0.5..2.0)).collect();
    let offset: Vec<f32> = (0..8).map(|_| rng.gen_range(-0.5..0.5)).collect();

    let mut model = Model::new();
    let input = location(&mut model, LayerKind::Input {
        dimensions: vec![6, 6, 3],
    }, &[]);
    model.inputs.push(input);
    let conv = location(&mut model, LayerKind::Conv2D {
        strides: [1, 1],
        weights: random_tensor(&mut rng, &[3, 3, 3, 8], -0.5, 0.5),
        biases: random_tensor(&mut rng, &[8], -0.1, 0.1).data().to_vec(),
        has_biases: true,
        activation: ActivationId::Linear,
        padding: PaddingType::Same,
    }, &[input]);
    let bn = location(&mut model, LayerKind::BatchNormalization {
        axis: -1,
        factor,
        offset,
    }, &[conv]);
    model.outputs.push(bn);

    // Running them separately (the interpreter) must match the fused code.
    let input_data = random_tensor(&mut rng, &[6, 6, 3], -1.0, 1.0);
    run_and_compare(&model, &[input_data], 1e-4);
}

#[test]
fn uint8_input_is_widened_before_dense() {
    let mut rng = rng();
    let mut model = Model::new();
    let input = location(&mut model, LayerKind::Input {
        dimensions: vec![12],
    }, &[]);
    model.inputs.push(input);
    model.set_input_uint8(0);
    let dense = location(&mut model, LayerKind::Dense {
        weights: random_tensor(&mut rng, &[12, 4], -0.5, 0.5),
        biases: vec![0.0; 4],
        has_biases: true,
        activation: ActivationId::Linear,
    }, &[input]);
    model.outputs.push(dense);

    let bytes: Vec<u8> = (0..12).map(|_| rng.gen_range(0..=255u8)).collect();
    let as_floats = Tensor::from_vec(vec![12], bytes.iter().map(|&b| b as f32).collect());
    let expected = interp::apply(&model, &[as_floats]).unwrap();

    let mut nn = CompiledNN::compile(&model, &oracle_settings()).unwrap();
    assert!(nn.is_input_uint8(0));
    nn.input_u8(0).copy_from_slice(&bytes);
    nn.apply();
    let rel = expected[0].max_rel_error(nn.output(0).data());
    assert!(rel <= 1e-5, "relative error {rel}");
}

#[test]
fn quantized_uint8_convolution_fast_path() {
    // Weights of 1/16 and inputs of 16 make the fixed-point path exact:
    // every product is 64 after quantization by 2^6.
    let mut model = Model::new();
    let input = location(&mut model, LayerKind::Input {
        dimensions: vec![4, 16, 1],
    }, &[]);
    model.inputs.push(input);
    model.set_input_uint8(0);

    let mut weights = Tensor::new(vec![4, 4, 1, 8]);
    for v in weights.data_mut() {
        *v = 1.0 / 16.0;
    }
    let biases: Vec<f32> = (0..8).map(|c| c as f32).collect();
    let conv = location(&mut model, LayerKind::Conv2D {
        strides: [4, 4],
        weights,
        biases,
        has_biases: true,
        activation: ActivationId::Relu,
        padding: PaddingType::Valid,
    }, &[input]);
    model.outputs.push(conv);

    let mut nn = CompiledNN::compile(&model, &oracle_settings()).unwrap();
    assert!(nn.is_input_uint8(0));
    nn.input_u8(0).fill(16);
    nn.apply();
    // 16 taps of 16 * 1/16 = 16, plus the per-channel bias.
    let out = nn.output(0).to_tensor();
    assert_eq!(out.dims(), &[1, 4, 8]);
    for pixel in out.data().chunks(8) {
        for (c, &v) in pixel.iter().enumerate() {
            assert_eq!(v, 16.0 + c as f32);
        }
    }
}

#[test]
fn ping_pong_chain_reuses_buffers() {
    let mut rng = rng();
    let mut model = Model::new();
    let input = location(&mut model, LayerKind::Input {
        dimensions: vec![6, 6, 4],
    }, &[]);
    model.inputs.push(input);
    let mut last = input;
    for _ in 0..6 {
        last = location(&mut model, LayerKind::Conv2D {
            strides: [1, 1],
            weights: random_tensor(&mut rng, &[3, 3, 4, 4], -0.4, 0.4),
            biases: random_tensor(&mut rng, &[4], -0.1, 0.1).data().to_vec(),
            has_biases: true,
            activation: ActivationId::Relu,
            padding: PaddingType::Same,
        }, &[last]);
    }
    model.outputs.push(last);

    let input_data = random_tensor(&mut rng, &[6, 6, 4], -1.0, 1.0);
    run_and_compare(&model, &[input_data], 1e-4);
}

//! Per-layer round-trip checks: the compiled code must agree with the
//! interpreter on random inputs for every layer kind and a matrix of
//! admissible shapes.

#![cfg(target_arch = "x86_64")]

mod common;

use common::{check_node, oracle_settings, random_tensor, rng, single_node};
use compiled_nn::codegen::{CompilationSettings, CompiledNN};
use compiled_nn::model::{
    ActivationId, InterpolationMethod, LayerKind, PaddingType, PoolingMethod,
};
use compiled_nn::Tensor;
use rand::Rng;

fn conv2d_kind(
    rng: &mut impl Rng,
    kernel: [usize; 2],
    ci: usize,
    co: usize,
    strides: [usize; 2],
    padding: PaddingType,
    activation: ActivationId,
) -> LayerKind {
    let weights = random_tensor(rng, &[kernel[0], kernel[1], ci, co], -1.0, 1.0);
    let biases = random_tensor(rng, &[co], -0.5, 0.5).data().to_vec();
    LayerKind::Conv2D {
        strides,
        weights,
        biases,
        has_biases: true,
        activation,
        padding,
    }
}

#[test]
fn dense_identity_is_exact() {
    let mut weights = Tensor::new(vec![4, 4]);
    for i in 0..4 {
        weights.set(&[i, i], 1.0);
    }
    let kind = LayerKind::Dense {
        weights,
        biases: vec![0.0; 4],
        has_biases: true,
        activation: ActivationId::Linear,
    };
    let (model, node) = single_node(kind, &[vec![4]]);
    let input = Tensor::from_vec(vec![4], vec![1.0, 2.0, 3.0, 4.0]);
    let mut nn = CompiledNN::compile_node(&model, node, &oracle_settings()).unwrap();
    nn.input(0).copy_from(&input);
    nn.apply();
    assert_eq!(nn.output(0).data(), &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn relu_basic() {
    let kind = LayerKind::Relu {
        max_value: f32::MAX,
        negative_slope: 0.0,
        threshold: 0.0,
    };
    let (model, node) = single_node(kind, &[vec![4]]);
    let input = Tensor::from_vec(vec![4], vec![-1.5, 0.0, 2.0, -0.25]);
    let mut nn = CompiledNN::compile_node(&model, node, &oracle_settings()).unwrap();
    nn.input(0).copy_from(&input);
    nn.apply();
    assert_eq!(nn.output(0).data(), &[0.0, 0.0, 2.0, 0.0]);
}

#[test]
fn same_padding_conv_on_single_pixel() {
    let kind = LayerKind::Conv2D {
        strides: [1, 1],
        weights: Tensor::from_vec(vec![3, 3, 1, 1], vec![1.0; 9]),
        biases: vec![0.0],
        has_biases: true,
        activation: ActivationId::Linear,
        padding: PaddingType::Same,
    };
    let (model, node) = single_node(kind, &[vec![1, 1, 1]]);
    let input = Tensor::from_vec(vec![1, 1, 1], vec![5.0]);
    let mut nn = CompiledNN::compile_node(&model, node, &oracle_settings()).unwrap();
    nn.input(0).copy_from(&input);
    nn.apply();
    assert_eq!(nn.output(0).data(), &[5.0]);
}

#[test]
fn concatenate_on_last_axis() {
    let (model, node) = single_node(
        LayerKind::Concatenate { axis: -1 },
        &[vec![1, 2], vec![1, 3]],
    );
    let a = Tensor::from_vec(vec![1, 2], vec![1.0, 2.0]);
    let b = Tensor::from_vec(vec![1, 3], vec![3.0, 4.0, 5.0]);
    let mut nn = CompiledNN::compile_node(&model, node, &oracle_settings()).unwrap();
    nn.input(0).copy_from(&a);
    nn.input(1).copy_from(&b);
    nn.apply();
    assert_eq!(nn.output(0).data(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn average_pool_2x2_stride_2() {
    let kind = LayerKind::Pooling2D {
        method: PoolingMethod::Average,
        padding: PaddingType::Valid,
        kernel_size: [2, 2],
        strides: [2, 2],
    };
    let (model, node) = single_node(kind, &[vec![2, 2, 1]]);
    let input = Tensor::from_vec(vec![2, 2, 1], vec![1.0, 2.0, 3.0, 4.0]);
    let mut nn = CompiledNN::compile_node(&model, node, &oracle_settings()).unwrap();
    nn.input(0).copy_from(&input);
    nn.apply();
    assert_eq!(nn.output(0).data(), &[2.5]);
}

#[test]
fn softmax_sums_to_one_with_exp_ratios() {
    let (model, node) = single_node(LayerKind::Softmax { axis: -1 }, &[vec![3]]);
    let input = Tensor::from_vec(vec![3], vec![1.0, 2.0, 3.0]);
    let mut nn = CompiledNN::compile_node(&model, node, &oracle_settings()).unwrap();
    nn.input(0).copy_from(&input);
    nn.apply();
    let out = nn.output(0).data().to_vec();
    let sum: f32 = out.iter().sum();
    assert!((sum - 1.0).abs() < 1e-6);
    assert!((out[1] / out[0] - 1.0f32.exp()).abs() < 1e-4);
    assert!((out[2] / out[1] - 1.0f32.exp()).abs() < 1e-4);
}

#[test]
fn conv2d_matches_interpreter_across_shapes() {
    let mut rng = rng();
    let cases: Vec<(Vec<usize>, [usize; 2], usize, [usize; 2], PaddingType)> = vec![
        (vec![8, 8, 3], [3, 3], 16, [1, 1], PaddingType::Valid),
        (vec![7, 7, 4], [3, 3], 8, [2, 2], PaddingType::Same),
        (vec![5, 6, 5], [2, 2], 3, [1, 1], PaddingType::Same),
        (vec![6, 6, 8], [1, 1], 12, [1, 1], PaddingType::Valid),
        (vec![8, 8, 4], [1, 1], 6, [2, 2], PaddingType::Valid),
        (vec![9, 9, 1], [5, 5], 4, [2, 2], PaddingType::Same),
    ];
    for (dims, kernel, co, strides, padding) in cases {
        let ci = dims[2];
        let kind = conv2d_kind(&mut rng, kernel, ci, co, strides, padding, ActivationId::Relu);
        let (model, node) = single_node(kind, &[dims.clone()]);
        let input = random_tensor(&mut rng, &dims, -1.0, 1.0);
        check_node(&model, node, &oracle_settings(), &[input], 1e-5);
    }
}

#[test]
fn conv2d_activations_match_interpreter() {
    let mut rng = rng();
    for activation in [
        ActivationId::Linear,
        ActivationId::Sigmoid,
        ActivationId::TanH,
        ActivationId::HardSigmoid,
        ActivationId::Elu,
        ActivationId::Selu,
        ActivationId::Softsign,
        ActivationId::Exponential,
        ActivationId::Softmax,
    ] {
        let kind = conv2d_kind(
            &mut rng,
            [3, 3],
            3,
            8,
            [1, 1],
            PaddingType::Same,
            activation,
        );
        let (model, node) = single_node(kind, &[vec![6, 6, 3]]);
        let input = random_tensor(&mut rng, &[6, 6, 3], -1.0, 1.0);
        check_node(&model, node, &oracle_settings(), &[input], 1e-5);
    }
}

#[test]
fn exp_approximation_stays_within_the_schraudolph_bound() {
    let mut rng = rng();
    let settings = CompilationSettings {
        use_exp_approx_in_sigmoid: true,
        use_exp_approx_in_tanh: true,
        debug: true,
        ..CompilationSettings::default()
    };
    for activation in [ActivationId::Sigmoid, ActivationId::TanH] {
        let kind = LayerKind::Activation { activation };
        let (model, node) = single_node(kind, &[vec![64]]);
        let input = random_tensor(&mut rng, &[64], -2.0, 2.0);
        check_node(&model, node, &settings, &[input], 5e-2);
    }
}

#[test]
fn dense_matches_interpreter() {
    let mut rng = rng();
    for (inputs, units) in [(4, 4), (17, 5), (32, 10), (3, 9)] {
        let weights = random_tensor(&mut rng, &[inputs, units], -1.0, 1.0);
        let biases = random_tensor(&mut rng, &[units], -0.5, 0.5).data().to_vec();
        let kind = LayerKind::Dense {
            weights,
            biases,
            has_biases: true,
            activation: ActivationId::TanH,
        };
        let (model, node) = single_node(kind, &[vec![inputs]]);
        let input = random_tensor(&mut rng, &[inputs], -1.0, 1.0);
        check_node(&model, node, &oracle_settings(), &[input], 1e-5);
    }
}

#[test]
fn conv1d_and_pooling1d_match_interpreter() {
    let mut rng = rng();
    let weights = random_tensor(&mut rng, &[3, 4, 6], -1.0, 1.0);
    let kind = LayerKind::Conv1D {
        stride: 2,
        weights,
        biases: random_tensor(&mut rng, &[6], -0.5, 0.5).data().to_vec(),
        has_biases: true,
        activation: ActivationId::Relu,
        padding: PaddingType::Same,
    };
    let (model, node) = single_node(kind, &[vec![10, 4]]);
    let input = random_tensor(&mut rng, &[10, 4], -1.0, 1.0);
    check_node(&model, node, &oracle_settings(), &[input], 1e-5);

    for method in [PoolingMethod::Max, PoolingMethod::Average] {
        let kind = LayerKind::Pooling1D {
            method,
            padding: PaddingType::Valid,
            kernel_size: 3,
            stride: 2,
        };
        let (model, node) = single_node(kind, &[vec![9, 5]]);
        let input = random_tensor(&mut rng, &[9, 5], -1.0, 1.0);
        check_node(&model, node, &oracle_settings(), &[input], 1e-6);
    }
}

#[test]
fn depthwise_and_separable_match_interpreter() {
    let mut rng = rng();
    let weights = random_tensor(&mut rng, &[3, 3, 6, 1], -1.0, 1.0);
    let kind = LayerKind::DepthwiseConv2D {
        strides: [1, 1],
        weights,
        biases: random_tensor(&mut rng, &[6], -0.5, 0.5).data().to_vec(),
        has_biases: true,
        activation: ActivationId::Relu,
        padding: PaddingType::Same,
    };
    let (model, node) = single_node(kind, &[vec![7, 7, 6]]);
    let input = random_tensor(&mut rng, &[7, 7, 6], -1.0, 1.0);
    check_node(&model, node, &oracle_settings(), &[input], 1e-5);

    let depthwise = random_tensor(&mut rng, &[3, 3, 4, 1], -1.0, 1.0);
    let pointwise = random_tensor(&mut rng, &[1, 1, 4, 10], -1.0, 1.0);
    let kind = LayerKind::SeparableConv2D {
        strides: [2, 2],
        depthwise_weights: depthwise,
        pointwise_weights: pointwise,
        biases: random_tensor(&mut rng, &[10], -0.5, 0.5).data().to_vec(),
        has_biases: true,
        activation: ActivationId::Linear,
        padding: PaddingType::Valid,
    };
    let (model, node) = single_node(kind, &[vec![9, 9, 4]]);
    let input = random_tensor(&mut rng, &[9, 9, 4], -1.0, 1.0);
    check_node(&model, node, &oracle_settings(), &[input], 1e-5);
}

#[test]
fn pooling_matrix_matches_interpreter() {
    let mut rng = rng();
    let cases = [
        ([2, 2], [2, 2], PaddingType::Valid, vec![8, 8, 4]),
        ([3, 3], [1, 1], PaddingType::Same, vec![6, 6, 3]),
        ([3, 3], [2, 2], PaddingType::Same, vec![7, 7, 5]),
        ([2, 3], [2, 3], PaddingType::Valid, vec![6, 9, 7]),
    ];
    for method in [PoolingMethod::Max, PoolingMethod::Average] {
        for (kernel, strides, padding, dims) in cases.clone() {
            let kind = LayerKind::Pooling2D {
                method,
                padding,
                kernel_size: kernel,
                strides,
            };
            let (model, node) = single_node(kind, &[dims.clone()]);
            let input = random_tensor(&mut rng, &dims, -1.0, 1.0);
            check_node(&model, node, &oracle_settings(), &[input], 1e-6);
        }
    }
}

#[test]
fn global_pooling_matches_interpreter() {
    let mut rng = rng();
    for method in [PoolingMethod::Max, PoolingMethod::Average] {
        let kind = LayerKind::GlobalPooling2D { method };
        let (model, node) = single_node(kind, &[vec![6, 7, 12]]);
        let input = random_tensor(&mut rng, &[6, 7, 12], -1.0, 1.0);
        check_node(&model, node, &oracle_settings(), &[input], 1e-6);
    }
}

#[test]
fn merge_layers_match_interpreter() {
    let mut rng = rng();
    let kinds = [
        LayerKind::Add,
        LayerKind::Multiply,
        LayerKind::Average,
        LayerKind::Maximum,
        LayerKind::Minimum,
    ];
    for kind in kinds {
        let dims = vec![3, 5, 2];
        let (model, node) = single_node(kind, &[dims.clone(), dims.clone(), dims.clone()]);
        let inputs: Vec<Tensor> = (0..3)
            .map(|_| random_tensor(&mut rng, &dims, -1.0, 1.0))
            .collect();
        check_node(&model, node, &oracle_settings(), &inputs, 1e-6);
    }

    let dims = vec![4, 6];
    let (model, node) = single_node(LayerKind::Subtract, &[dims.clone(), dims.clone()]);
    let inputs = vec![
        random_tensor(&mut rng, &dims, -1.0, 1.0),
        random_tensor(&mut rng, &dims, -1.0, 1.0),
    ];
    check_node(&model, node, &oracle_settings(), &inputs, 1e-6);
}

#[test]
fn four_way_merge_uses_a_second_pass() {
    let mut rng = rng();
    let dims = vec![5, 3];
    let (model, node) = single_node(
        LayerKind::Average,
        &[dims.clone(), dims.clone(), dims.clone(), dims.clone(), dims.clone()],
    );
    let inputs: Vec<Tensor> = (0..5)
        .map(|_| random_tensor(&mut rng, &dims, -1.0, 1.0))
        .collect();
    check_node(&model, node, &oracle_settings(), &inputs, 1e-6);
}

#[test]
fn concatenate_below_the_outer_axis() {
    let mut rng = rng();
    // Inner chunks stay quad-aligned: 3*4 and 3*8 floats.
    let (model, node) = single_node(
        LayerKind::Concatenate { axis: 1 },
        &[vec![2, 4, 3], vec![2, 8, 3]],
    );
    let inputs = vec![
        random_tensor(&mut rng, &[2, 4, 3], -1.0, 1.0),
        random_tensor(&mut rng, &[2, 8, 3], -1.0, 1.0),
    ];
    // 3 floats of inner size times 4 and 8: chunks are 12 and 24 floats.
    check_node(&model, node, &oracle_settings(), &inputs, 0.0);
}

#[test]
fn zero_padding_is_identity_for_zero_pads() {
    let mut rng = rng();
    let (model, node) = single_node(
        LayerKind::ZeroPadding2D { padding: [0; 4] },
        &[vec![4, 5, 3]],
    );
    let input = random_tensor(&mut rng, &[4, 5, 3], -1.0, 1.0);
    let out = check_node(&model, node, &oracle_settings(), &[input.clone()], 0.0);
    assert_eq!(out[0].data(), input.data());
}

#[test]
fn zero_padding_borders_are_zero() {
    let mut rng = rng();
    for padding in [[1, 2, 3, 1], [0, 1, 0, 0], [2, 0, 1, 0]] {
        let (model, node) = single_node(
            LayerKind::ZeroPadding2D { padding },
            &[vec![3, 4, 5]],
        );
        let input = random_tensor(&mut rng, &[3, 4, 5], -1.0, 1.0);
        check_node(&model, node, &oracle_settings(), &[input], 0.0);
    }
    // 1-D variant.
    let (model, node) = single_node(
        LayerKind::ZeroPadding1D { padding: [2, 1] },
        &[vec![5, 3]],
    );
    let input = random_tensor(&mut rng, &[5, 3], -1.0, 1.0);
    check_node(&model, node, &oracle_settings(), &[input], 0.0);
}

#[test]
fn cropping_is_identity_for_zero_crops() {
    let mut rng = rng();
    let (model, node) = single_node(
        LayerKind::Cropping2D { cropping: [0; 4] },
        &[vec![4, 4, 3]],
    );
    let input = random_tensor(&mut rng, &[4, 4, 3], -1.0, 1.0);
    let out = check_node(&model, node, &oracle_settings(), &[input.clone()], 0.0);
    assert_eq!(out[0].data(), input.data());

    let (model, node) = single_node(
        LayerKind::Cropping2D {
            cropping: [1, 1, 2, 0],
        },
        &[vec![5, 6, 3]],
    );
    let input = random_tensor(&mut rng, &[5, 6, 3], -1.0, 1.0);
    check_node(&model, node, &oracle_settings(), &[input], 0.0);
}

#[test]
fn upsampling_identity_and_replication() {
    let mut rng = rng();
    let (model, node) = single_node(
        LayerKind::UpSampling2D {
            size: [1, 1],
            interpolation: InterpolationMethod::Nearest,
        },
        &[vec![3, 3, 4]],
    );
    let input = random_tensor(&mut rng, &[3, 3, 4], -1.0, 1.0);
    let out = check_node(&model, node, &oracle_settings(), &[input.clone()], 0.0);
    assert_eq!(out[0].data(), input.data());

    for dims in [vec![2, 3, 5], vec![4, 4, 8]] {
        let (model, node) = single_node(
            LayerKind::UpSampling2D {
                size: [2, 2],
                interpolation: InterpolationMethod::Nearest,
            },
            &[dims.clone()],
        );
        let input = random_tensor(&mut rng, &dims, -1.0, 1.0);
        check_node(&model, node, &oracle_settings(), &[input], 0.0);
    }
}

#[test]
fn bilinear_upsampling_matches_interpreter() {
    let mut rng = rng();
    let (model, node) = single_node(
        LayerKind::UpSampling2D {
            size: [2, 2],
            interpolation: InterpolationMethod::Bilinear,
        },
        &[vec![3, 3, 4]],
    );
    let input = random_tensor(&mut rng, &[3, 3, 4], -1.0, 1.0);
    check_node(&model, node, &oracle_settings(), &[input], 1e-6);
}

#[test]
fn standalone_activation_layers_match_interpreter() {
    let mut rng = rng();
    let kinds = [
        LayerKind::Relu {
            max_value: 4.0,
            negative_slope: 0.0,
            threshold: 0.0,
        },
        LayerKind::Relu {
            max_value: f32::MAX,
            negative_slope: 0.25,
            threshold: 0.5,
        },
        LayerKind::LeakyRelu { alpha: 0.1 },
        LayerKind::Elu { alpha: 0.7 },
        LayerKind::ThresholdedRelu { theta: 0.3 },
        LayerKind::Activation {
            activation: ActivationId::Softsign,
        },
        LayerKind::Activation {
            activation: ActivationId::HardSigmoid,
        },
        LayerKind::Activation {
            activation: ActivationId::Selu,
        },
    ];
    for kind in kinds {
        let (model, node) = single_node(kind, &[vec![5, 7]]);
        let input = random_tensor(&mut rng, &[5, 7], -3.0, 3.0);
        check_node(&model, node, &oracle_settings(), &[input], 1e-5);
    }
}

#[test]
fn batchnorm_with_unit_factor_is_identity() {
    let mut rng = rng();
    let kind = LayerKind::BatchNormalization {
        axis: -1,
        factor: vec![1.0; 6],
        offset: vec![0.0; 6],
    };
    let (model, node) = single_node(kind, &[vec![4, 4, 6]]);
    let input = random_tensor(&mut rng, &[4, 4, 6], -1.0, 1.0);
    let out = check_node(&model, node, &oracle_settings(), &[input.clone()], 1e-6);
    assert!(out[0].max_abs_error(input.data()) <= 1e-6);
}

#[test]
fn batchnorm_matches_interpreter() {
    let mut rng = rng();
    let factor = random_tensor(&mut rng, &[5], 0.5, 2.0).data().to_vec();
    let offset = random_tensor(&mut rng, &[5], -1.0, 1.0).data().to_vec();
    let kind = LayerKind::BatchNormalization {
        axis: -1,
        factor,
        offset,
    };
    let (model, node) = single_node(kind, &[vec![3, 3, 5]]);
    let input = random_tensor(&mut rng, &[3, 3, 5], -1.0, 1.0);
    check_node(&model, node, &oracle_settings(), &[input], 1e-6);
}

#[test]
fn zero_weights_and_zero_input_give_zero_output() {
    for activation in [ActivationId::Relu, ActivationId::TanH, ActivationId::Linear] {
        let kind = LayerKind::Conv2D {
            strides: [1, 1],
            weights: Tensor::new(vec![3, 3, 2, 4]),
            biases: vec![0.0; 4],
            has_biases: true,
            activation,
            padding: PaddingType::Same,
        };
        let (model, node) = single_node(kind, &[vec![5, 5, 2]]);
        let input = Tensor::new(vec![5, 5, 2]);
        let mut nn = CompiledNN::compile_node(&model, node, &oracle_settings()).unwrap();
        nn.input(0).copy_from(&input);
        nn.apply();
        assert!(nn.output(0).data().iter().all(|&v| v == 0.0));
    }
}

#[test]
fn inplace_capable_nodes_alias_and_stay_correct() {
    let mut rng = rng();
    let kind = LayerKind::Relu {
        max_value: f32::MAX,
        negative_slope: 0.0,
        threshold: 0.0,
    };
    let (model, node) = single_node(kind, &[vec![16]]);
    let input = random_tensor(&mut rng, &[16], -1.0, 1.0);
    let mut nn = CompiledNN::compile_node(&model, node, &oracle_settings()).unwrap();
    nn.input(0).copy_from(&input);
    // The planner aliases the sole input with the output.
    let input_ptr = nn.input(0).data().as_ptr();
    assert_eq!(input_ptr, nn.output(0).data().as_ptr());
    nn.apply();
    let expected: Vec<f32> = input.data().iter().map(|v| v.max(0.0)).collect();
    assert_eq!(nn.output(0).data(), expected.as_slice());
}

#[test]
fn flatten_and_reshape_preserve_data() {
    let mut rng = rng();
    let (model, node) = single_node(LayerKind::Flatten, &[vec![3, 4, 2]]);
    let input = random_tensor(&mut rng, &[3, 4, 2], -1.0, 1.0);
    let out = check_node(&model, node, &oracle_settings(), &[input.clone()], 0.0);
    assert_eq!(out[0].dims(), &[24]);
    assert_eq!(out[0].size(), input.size());

    let (model, node) = single_node(
        LayerKind::Reshape {
            dimensions: vec![4, 6],
        },
        &[vec![3, 4, 2]],
    );
    let input = random_tensor(&mut rng, &[3, 4, 2], -1.0, 1.0);
    let out = check_node(&model, node, &oracle_settings(), &[input.clone()], 0.0);
    assert_eq!(out[0].dims(), &[4, 6]);
    assert_eq!(out[0].data(), input.data());
}

#[test]
fn softmax_over_rows() {
    let mut rng = rng();
    let (model, node) = single_node(LayerKind::Softmax { axis: -1 }, &[vec![4, 7]]);
    let input = random_tensor(&mut rng, &[4, 7], -2.0, 2.0);
    let out = check_node(&model, node, &oracle_settings(), &[input], 1e-5);
    for row in out[0].data().chunks(7) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}

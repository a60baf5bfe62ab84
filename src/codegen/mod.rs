//! Compilation driver.
//!
//! Turns a resolved graph into executable machine code: constricts the
//! settings against the host CPU, orders the nodes, lowers each node onto an
//! operation compiler (folding batchnorm into the preceding convolution and
//! splitting softmax activations into their own nodes), plans the tensor
//! arena, runs every compiler's `initialize`, emits the instruction stream
//! and finalises it into a callable entry point over fixed buffers.

pub mod activation;
pub mod constants;
pub mod math;
pub mod memory;
pub mod ops;
pub mod plan;
pub mod settings;
pub mod util;

use std::collections::{HashMap, HashSet};

use iced_x86::code_asm::{rbx, CodeAssembler};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ActivationId, LayerKind, Model, NodeRef, PaddingType, TensorLocation};
use crate::tensor::{TensorView, TensorViewMut};

use activation::{ActivationFunctionHandler, CompiledActivation};
use constants::ConstantPool;
use memory::{AlignedBuffer, CodeBuffer};
use ops::{map_activation, OperationCompiler, TensorPtr};
pub use settings::CompilationSettings;

type KeyDims = HashMap<TensorLocation, Vec<usize>>;

/// One lowered unit of work: an optional operation compiler plus its tensor
/// keys. External jobs only reserve pinned buffers (model inputs).
struct Job<'m> {
    compiler: Option<Box<dyn OperationCompiler + 'm>>,
    inputs: Vec<TensorLocation>,
    outputs: Vec<(TensorLocation, Vec<usize>)>,
    /// Overrides the first output's float count (uint8 staging buffers).
    floats_override: Option<usize>,
    external: bool,
}

struct Binding {
    offset: usize,
    dims: Vec<usize>,
    uint8: bool,
}

/// A network compiled to native code over fixed input/output buffers.
///
/// The instance is `Send` but deliberately not `Sync`: its buffers are
/// mutable shared state. `apply` runs the compiled function to completion.
pub struct CompiledNN {
    code: CodeBuffer,
    arena: AlignedBuffer,
    #[allow(dead_code)] // addresses are baked into the code
    constants: AlignedBuffer,
    entry: extern "C" fn(),
    inputs: Vec<Binding>,
    outputs: Vec<Binding>,
}

impl CompiledNN {
    /// Compiles a whole model.
    pub fn compile(model: &Model, settings: &CompilationSettings) -> Result<CompiledNN> {
        let mut settings = settings.clone();
        settings.constrict();
        if !settings.use_x64 {
            return Err(Error::RuntimeFeatureMissing(
                "64-bit x86 code generation".into(),
            ));
        }

        let order = model.topological_order()?;

        let mut consumers: HashMap<TensorLocation, usize> = HashMap::new();
        for &node in &order {
            for &loc in &model.node(node).inputs {
                *consumers.entry(loc).or_insert(0) += 1;
            }
        }

        let quantized = find_quantized_convolutions(model, &settings, &consumers);
        let (fused, skipped) = find_batchnorm_fusions(model, &order, &consumers, &quantized);

        let mut jobs: Vec<Job<'_>> = Vec::new();
        let mut key_dims: KeyDims = HashMap::new();
        let mut fresh_counter = 0usize;
        let synthetic_base = model.layers.len();
        let mut fresh = move || {
            fresh_counter += 1;
            TensorLocation::new(synthetic_base + fresh_counter, 0, 0)
        };
        let mut input_bindings: Vec<(TensorLocation, Vec<usize>, bool)> =
            Vec::with_capacity(model.inputs.len());

        for &node in &order {
            if skipped.contains(&node) {
                continue;
            }
            let n = model.node(node);
            let kind = &model.layers[node.layer].kind;

            if let LayerKind::Input { .. } = kind {
                let loc = TensorLocation::new(node.layer, node.node_index, 0);
                let dims = n.output_dimensions[0].clone();
                let size: usize = dims.iter().product();
                let input_index = model.inputs.iter().position(|&l| l == loc);
                let is_u8 = input_index.map_or(false, |i| model.is_input_uint8(i));

                key_dims.insert(loc, dims.clone());
                if !is_u8 {
                    jobs.push(Job {
                        compiler: None,
                        inputs: vec![],
                        outputs: vec![(loc, dims.clone())],
                        floats_override: None,
                        external: true,
                    });
                    if input_index.is_some() {
                        input_bindings.push((loc, dims, false));
                    }
                } else if quantized.values().any(|&input| input == node) {
                    // The matching convolution consumes the raw bytes.
                    jobs.push(Job {
                        compiler: None,
                        inputs: vec![],
                        outputs: vec![(loc, dims.clone())],
                        floats_override: Some(size.div_ceil(4)),
                        external: true,
                    });
                    input_bindings.push((loc, dims, true));
                } else {
                    let staging = fresh();
                    key_dims.insert(staging, dims.clone());
                    jobs.push(Job {
                        compiler: None,
                        inputs: vec![],
                        outputs: vec![(staging, dims.clone())],
                        floats_override: Some(size.div_ceil(4)),
                        external: true,
                    });
                    jobs.push(Job {
                        compiler: Some(Box::new(ops::UInt8InputCompiler::new(size))),
                        inputs: vec![staging],
                        outputs: vec![(loc, dims.clone())],
                        floats_override: None,
                        external: false,
                    });
                    input_bindings.push((staging, dims, true));
                }
                continue;
            }

            let own_keys: Vec<TensorLocation> = (0..n.output_dimensions.len())
                .map(|t| TensorLocation::new(node.layer, node.node_index, t))
                .collect();

            if quantized.contains_key(&node) {
                let (weights, biases) = match kind {
                    LayerKind::Conv2D {
                        weights, biases, ..
                    } => (weights, biases.as_slice()),
                    _ => unreachable!("quantized selection checks the kind"),
                };
                let compiler = ops::QuantizedInputConvCompiler::new(
                    &settings,
                    weights.data(),
                    biases,
                    6,
                    true,
                    as3(&n.input_dimensions[0])?,
                )?;
                push_job(
                    &mut jobs,
                    &mut key_dims,
                    Box::new(compiler),
                    n.inputs.clone(),
                    vec![(own_keys[0], n.output_dimensions[0].clone())],
                );
                continue;
            }

            let (batch_norm, output_keys) = match fused.get(&node) {
                Some(&(target, factor, offset)) => (Some((factor, offset)), vec![target]),
                None => (None, own_keys),
            };
            lower_layer(
                kind,
                &n.input_dimensions,
                &n.output_dimensions,
                &n.inputs,
                &output_keys,
                batch_norm,
                &settings,
                &mut jobs,
                &mut key_dims,
                &mut fresh,
            )?;
        }

        finish(
            jobs,
            key_dims,
            model.outputs.clone(),
            input_bindings,
            &settings,
        )
    }

    /// Compiles a single node, with every node input exposed as an external
    /// input buffer. Used by the per-layer check harness and tests.
    pub fn compile_node(
        model: &Model,
        node: NodeRef,
        settings: &CompilationSettings,
    ) -> Result<CompiledNN> {
        let mut settings = settings.clone();
        settings.constrict();
        if !settings.use_x64 {
            return Err(Error::RuntimeFeatureMissing(
                "64-bit x86 code generation".into(),
            ));
        }

        let n = model.node(node);
        let kind = &model.layers[node.layer].kind;
        let mut jobs: Vec<Job<'_>> = Vec::new();
        let mut key_dims: KeyDims = HashMap::new();
        let mut fresh_counter = 0usize;
        let synthetic_base = model.layers.len();
        let mut fresh = move || {
            fresh_counter += 1;
            TensorLocation::new(synthetic_base + fresh_counter, 0, 0)
        };

        let mut input_keys = Vec::with_capacity(n.inputs.len());
        let mut input_bindings = Vec::with_capacity(n.inputs.len());
        for dims in &n.input_dimensions {
            let key = fresh();
            key_dims.insert(key, dims.clone());
            jobs.push(Job {
                compiler: None,
                inputs: vec![],
                outputs: vec![(key, dims.clone())],
                floats_override: None,
                external: true,
            });
            input_bindings.push((key, dims.clone(), false));
            input_keys.push(key);
        }

        let output_keys: Vec<TensorLocation> = (0..n.output_dimensions.len())
            .map(|t| TensorLocation::new(node.layer, node.node_index, t))
            .collect();
        lower_layer(
            kind,
            &n.input_dimensions,
            &n.output_dimensions,
            &input_keys,
            &output_keys,
            None,
            &settings,
            &mut jobs,
            &mut key_dims,
            &mut fresh,
        )?;

        finish(jobs, key_dims, output_keys, input_bindings, &settings)
    }

    pub fn num_of_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_of_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_input_uint8(&self, index: usize) -> bool {
        self.inputs[index].uint8
    }

    /// Mutable float view over input buffer `index`.
    pub fn input(&mut self, index: usize) -> TensorViewMut<'_> {
        let binding = &self.inputs[index];
        assert!(!binding.uint8, "input {index} is uint8");
        let size: usize = binding.dims.iter().product();
        let data = &mut self.arena.as_mut_slice()[binding.offset..binding.offset + size];
        TensorViewMut::new(&binding.dims, data)
    }

    /// Mutable byte view over a uint8 input buffer.
    pub fn input_u8(&mut self, index: usize) -> &mut [u8] {
        let binding = &self.inputs[index];
        assert!(binding.uint8, "input {index} is float");
        let size: usize = binding.dims.iter().product();
        unsafe {
            std::slice::from_raw_parts_mut(
                (self.arena.as_mut_ptr() as *mut u8).add(binding.offset * 4),
                size,
            )
        }
    }

    /// Float view over output buffer `index`.
    pub fn output(&self, index: usize) -> TensorView<'_> {
        let binding = &self.outputs[index];
        let size: usize = binding.dims.iter().product();
        let data = &self.arena.as_slice()[binding.offset..binding.offset + size];
        TensorView::new(&binding.dims, data)
    }

    /// Runs the compiled network once. Never fails: all checks happened at
    /// compile time.
    pub fn apply(&mut self) {
        (self.entry)();
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }
}

type Fusion<'m> = (TensorLocation, &'m [f32], &'m [f32]);

/// Finds `convolution -> batchNormalization` pairs whose batchnorm folds
/// into the convolution's weights and biases at initialisation time. The
/// batchnorm node is skipped and the convolution writes its output buffer.
fn find_batchnorm_fusions<'m>(
    model: &'m Model,
    order: &[NodeRef],
    consumers: &HashMap<TensorLocation, usize>,
    quantized: &HashMap<NodeRef, NodeRef>,
) -> (HashMap<NodeRef, Fusion<'m>>, HashSet<NodeRef>) {
    let mut fused: HashMap<NodeRef, Fusion<'m>> = HashMap::new();
    let mut skipped = HashSet::new();

    for &node in order {
        let n = model.node(node);
        let LayerKind::BatchNormalization {
            axis,
            factor,
            offset,
        } = &model.layers[node.layer].kind
        else {
            continue;
        };
        if n.inputs.len() != 1 {
            continue;
        }
        let input = n.inputs[0];
        let rank = n.input_dimensions[0].len();
        if !matches!(crate::model::normalize_axis(*axis, rank), Ok(a) if a == rank - 1) {
            continue;
        }
        if input.tensor_index != 0
            || consumers.get(&input) != Some(&1)
            || model.outputs.contains(&input)
        {
            continue;
        }
        let producer = NodeRef {
            layer: input.layer,
            node_index: input.node_index,
        };
        if quantized.contains_key(&producer) || fused.contains_key(&producer) {
            continue;
        }
        let linear = match &model.layers[input.layer].kind {
            LayerKind::Conv1D { activation, .. }
            | LayerKind::Conv2D { activation, .. }
            | LayerKind::SeparableConv2D { activation, .. }
            | LayerKind::DepthwiseConv2D { activation, .. }
            | LayerKind::Dense { activation, .. } => *activation == ActivationId::Linear,
            _ => false,
        };
        if !linear {
            continue;
        }
        let target = TensorLocation::new(node.layer, node.node_index, 0);
        fused.insert(producer, (target, factor.as_slice(), offset.as_slice()));
        skipped.insert(node);
    }
    (fused, skipped)
}

/// Maps convolution nodes onto the uint8 fast path: a uint8 model input
/// whose sole consumer is a 4x4/stride-4 valid-padding ReLU convolution with
/// one input channel and eight filters.
fn find_quantized_convolutions(
    model: &Model,
    settings: &CompilationSettings,
    consumers: &HashMap<TensorLocation, usize>,
) -> HashMap<NodeRef, NodeRef> {
    let mut result = HashMap::new();
    if settings.xmm_regs <= 14 {
        return result;
    }
    for (i, &loc) in model.inputs.iter().enumerate() {
        if !model.is_input_uint8(i) || consumers.get(&loc) != Some(&1) {
            continue;
        }
        let Ok(dims) = model.output_dimensions(loc) else {
            continue;
        };
        if dims.len() != 3 || dims[2] != 1 || dims[0] % 4 != 0 || dims[1] % 16 != 0 {
            continue;
        }
        for (layer_id, layer) in model.layers.iter().enumerate() {
            for (node_index, n) in layer.nodes.iter().enumerate() {
                if n.inputs != [loc] {
                    continue;
                }
                if let LayerKind::Conv2D {
                    strides,
                    weights,
                    has_biases,
                    activation,
                    padding,
                    ..
                } = &layer.kind
                {
                    if *strides == [4, 4]
                        && weights.dims() == [4, 4, 1, 8].as_slice()
                        && *has_biases
                        && *activation == ActivationId::Relu
                        && *padding == PaddingType::Valid
                    {
                        result.insert(
                            NodeRef {
                                layer: layer_id,
                                node_index,
                            },
                            NodeRef {
                                layer: loc.layer,
                                node_index: loc.node_index,
                            },
                        );
                    }
                }
            }
        }
    }
    result
}

fn as3(dims: &[usize]) -> Result<[usize; 3]> {
    match dims {
        &[a, b, c] => Ok([a, b, c]),
        _ => Err(Error::Compile(format!(
            "expected a rank-3 tensor, got rank {}",
            dims.len()
        ))),
    }
}

/// Inserts a unit height axis so 1-D operators run on the 2-D emitters.
fn lift1d(dims: &[usize]) -> Result<[usize; 3]> {
    match dims {
        &[w, c] => Ok([1, w, c]),
        _ => Err(Error::Compile(format!(
            "expected a rank-2 tensor, got rank {}",
            dims.len()
        ))),
    }
}

fn biases_of(has_biases: bool, biases: &[f32]) -> Option<&[f32]> {
    if has_biases {
        Some(biases)
    } else {
        None
    }
}

fn push_job<'m>(
    jobs: &mut Vec<Job<'m>>,
    key_dims: &mut KeyDims,
    compiler: Box<dyn OperationCompiler + 'm>,
    inputs: Vec<TensorLocation>,
    outputs: Vec<(TensorLocation, Vec<usize>)>,
) {
    for (key, dims) in &outputs {
        key_dims.insert(*key, dims.clone());
    }
    jobs.push(Job {
        compiler: Some(compiler),
        inputs,
        outputs,
        floats_override: None,
        external: false,
    });
}

/// Pushes a convolution-family job; a softmax post-activation becomes a
/// separate node behind the linear convolution.
#[allow(clippy::too_many_arguments)]
fn push_conv_family<'m>(
    jobs: &mut Vec<Job<'m>>,
    key_dims: &mut KeyDims,
    fresh: &mut dyn FnMut() -> TensorLocation,
    input_keys: &[TensorLocation],
    output_key: TensorLocation,
    out_dims: Vec<usize>,
    activation: ActivationId,
    build: &mut dyn FnMut(CompiledActivation) -> Result<Box<dyn OperationCompiler + 'm>>,
) -> Result<()> {
    if activation == ActivationId::Softmax {
        let mid = fresh();
        let conv = build(CompiledActivation::Linear)?;
        push_job(
            jobs,
            key_dims,
            conv,
            input_keys.to_vec(),
            vec![(mid, out_dims.clone())],
        );
        let softmax = ops::SoftmaxCompiler::new(&out_dims, out_dims.len() - 1)?;
        push_job(
            jobs,
            key_dims,
            Box::new(softmax),
            vec![mid],
            vec![(output_key, out_dims)],
        );
    } else {
        let conv = build(map_activation(activation)?)?;
        push_job(
            jobs,
            key_dims,
            conv,
            input_keys.to_vec(),
            vec![(output_key, out_dims)],
        );
    }
    Ok(())
}

/// Lowers one node onto its operation compiler(s).
#[allow(clippy::too_many_arguments)]
fn lower_layer<'m>(
    kind: &'m LayerKind,
    input_dims: &[Vec<usize>],
    output_dims: &[Vec<usize>],
    input_keys: &[TensorLocation],
    output_keys: &[TensorLocation],
    batch_norm: Option<(&'m [f32], &'m [f32])>,
    settings: &CompilationSettings,
    jobs: &mut Vec<Job<'m>>,
    key_dims: &mut KeyDims,
    fresh: &mut dyn FnMut() -> TensorLocation,
) -> Result<()> {
    let out0 = (output_keys[0], output_dims[0].clone());

    match kind {
        LayerKind::Input { .. } => {
            key_dims.insert(out0.0, out0.1.clone());
            jobs.push(Job {
                compiler: None,
                inputs: vec![],
                outputs: vec![out0],
                floats_override: None,
                external: true,
            });
        }

        LayerKind::Dense {
            weights,
            biases,
            has_biases,
            activation,
        } => {
            push_conv_family(
                jobs,
                key_dims,
                fresh,
                input_keys,
                out0.0,
                out0.1,
                *activation,
                &mut |act| {
                    Ok(Box::new(ops::Conv2DCompiler::for_dense(
                        settings,
                        weights.data(),
                        weights.dim(0),
                        weights.dim(1),
                        biases_of(*has_biases, biases),
                        batch_norm,
                        act,
                    )?))
                },
            )?;
        }

        LayerKind::Conv1D {
            stride,
            weights,
            biases,
            has_biases,
            activation,
            padding,
        } => {
            let input3 = lift1d(&input_dims[0])?;
            let output3 = lift1d(&output_dims[0])?;
            push_conv_family(
                jobs,
                key_dims,
                fresh,
                input_keys,
                out0.0,
                out0.1,
                *activation,
                &mut |act| {
                    Ok(Box::new(ops::Conv2DCompiler::new(
                        settings,
                        [1, weights.dim(0)],
                        [1, *stride],
                        *padding,
                        weights.data(),
                        weights.dim(1),
                        weights.dim(2),
                        biases_of(*has_biases, biases),
                        batch_norm,
                        act,
                        input3,
                        output3,
                    )?))
                },
            )?;
        }

        LayerKind::Conv2D {
            strides,
            weights,
            biases,
            has_biases,
            activation,
            padding,
        } => {
            let input3 = as3(&input_dims[0])?;
            let output3 = as3(&output_dims[0])?;
            push_conv_family(
                jobs,
                key_dims,
                fresh,
                input_keys,
                out0.0,
                out0.1,
                *activation,
                &mut |act| {
                    Ok(Box::new(ops::Conv2DCompiler::new(
                        settings,
                        [weights.dim(0), weights.dim(1)],
                        *strides,
                        *padding,
                        weights.data(),
                        weights.dim(2),
                        weights.dim(3),
                        biases_of(*has_biases, biases),
                        batch_norm,
                        act,
                        input3,
                        output3,
                    )?))
                },
            )?;
        }

        LayerKind::SeparableConv2D {
            strides,
            depthwise_weights,
            pointwise_weights,
            biases,
            has_biases,
            activation,
            padding,
        } => {
            let input3 = as3(&input_dims[0])?;
            let output3 = as3(&output_dims[0])?;
            push_conv_family(
                jobs,
                key_dims,
                fresh,
                input_keys,
                out0.0,
                out0.1,
                *activation,
                &mut |act| {
                    Ok(Box::new(ops::SeparableConv2DCompiler::new(
                        settings,
                        [depthwise_weights.dim(0), depthwise_weights.dim(1)],
                        *strides,
                        *padding,
                        depthwise_weights.data(),
                        depthwise_weights.dim(3),
                        pointwise_weights.data(),
                        pointwise_weights.dim(3),
                        biases_of(*has_biases, biases),
                        batch_norm,
                        act,
                        input3,
                        output3,
                    )?))
                },
            )?;
        }

        LayerKind::DepthwiseConv2D {
            strides,
            weights,
            biases,
            has_biases,
            activation,
            padding,
        } => {
            let input3 = as3(&input_dims[0])?;
            let output3 = as3(&output_dims[0])?;
            push_conv_family(
                jobs,
                key_dims,
                fresh,
                input_keys,
                out0.0,
                out0.1,
                *activation,
                &mut |act| {
                    Ok(Box::new(ops::DConv2DCompiler::new(
                        settings,
                        [weights.dim(0), weights.dim(1)],
                        *strides,
                        *padding,
                        weights.data(),
                        weights.dim(3),
                        biases_of(*has_biases, biases),
                        batch_norm,
                        act,
                        input3,
                        output3,
                    )?))
                },
            )?;
        }

        LayerKind::Activation { activation } => {
            let compiler: Box<dyn OperationCompiler> = if *activation == ActivationId::Softmax {
                Box::new(ops::SoftmaxCompiler::new(
                    &output_dims[0],
                    output_dims[0].len() - 1,
                )?)
            } else {
                Box::new(ops::ActivationCompiler::new(
                    settings,
                    map_activation(*activation)?,
                ))
            };
            push_job(jobs, key_dims, compiler, input_keys.to_vec(), vec![out0]);
        }

        LayerKind::Relu {
            max_value,
            negative_slope,
            threshold,
        } => {
            let desc = CompiledActivation::Relu {
                max_value: *max_value,
                negative_slope: *negative_slope,
                threshold: *threshold,
            };
            push_job(
                jobs,
                key_dims,
                Box::new(ops::ActivationCompiler::new(settings, desc)),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::LeakyRelu { alpha } => {
            let desc = CompiledActivation::Relu {
                max_value: f32::MAX,
                negative_slope: *alpha,
                threshold: 0.0,
            };
            push_job(
                jobs,
                key_dims,
                Box::new(ops::ActivationCompiler::new(settings, desc)),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::ThresholdedRelu { theta } => {
            let desc = CompiledActivation::Relu {
                max_value: f32::MAX,
                negative_slope: 0.0,
                threshold: *theta,
            };
            push_job(
                jobs,
                key_dims,
                Box::new(ops::ActivationCompiler::new(settings, desc)),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::Elu { alpha } => {
            let desc = CompiledActivation::Elu { alpha: *alpha };
            push_job(
                jobs,
                key_dims,
                Box::new(ops::ActivationCompiler::new(settings, desc)),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::Softmax { axis } => {
            let rank = output_dims[0].len();
            let axis = crate::model::normalize_axis(*axis, rank)?;
            push_job(
                jobs,
                key_dims,
                Box::new(ops::SoftmaxCompiler::new(&output_dims[0], axis)?),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::BatchNormalization {
            axis,
            factor,
            offset,
        } => {
            let rank = input_dims[0].len();
            if crate::model::normalize_axis(*axis, rank)? != rank - 1 {
                return Err(Error::Compile(
                    "batch normalization is only compiled along the innermost axis".into(),
                ));
            }
            push_job(
                jobs,
                key_dims,
                Box::new(ops::BatchNormalizationCompiler::new(
                    factor,
                    offset,
                    &input_dims[0],
                )),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::Dropout | LayerKind::Flatten | LayerKind::Reshape { .. } => {
            push_job(
                jobs,
                key_dims,
                Box::new(ops::CopyCompiler::new(settings.xmm_regs)),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::Pooling1D {
            method,
            padding,
            kernel_size,
            stride,
        } => {
            push_job(
                jobs,
                key_dims,
                Box::new(ops::Pooling2DCompiler::new(
                    settings,
                    *method,
                    *padding,
                    [1, *kernel_size],
                    [1, *stride],
                    lift1d(&input_dims[0])?,
                    lift1d(&output_dims[0])?,
                )),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::Pooling2D {
            method,
            padding,
            kernel_size,
            strides,
        } => {
            push_job(
                jobs,
                key_dims,
                Box::new(ops::Pooling2DCompiler::new(
                    settings,
                    *method,
                    *padding,
                    *kernel_size,
                    *strides,
                    as3(&input_dims[0])?,
                    as3(&output_dims[0])?,
                )),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::GlobalPooling2D { method } => {
            push_job(
                jobs,
                key_dims,
                Box::new(ops::GlobalPooling2DCompiler::new(
                    settings,
                    *method,
                    as3(&input_dims[0])?,
                )),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::Cropping2D { cropping } => {
            push_job(
                jobs,
                key_dims,
                Box::new(ops::Cropping2DCompiler::new(
                    settings,
                    *cropping,
                    as3(&input_dims[0])?,
                    as3(&output_dims[0])?,
                )),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::UpSampling2D {
            size,
            interpolation,
        } => {
            push_job(
                jobs,
                key_dims,
                Box::new(ops::UpSampling2DCompiler::new(
                    settings,
                    *size,
                    *interpolation,
                    as3(&input_dims[0])?,
                )),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::ZeroPadding1D { padding } => {
            push_job(
                jobs,
                key_dims,
                Box::new(ops::ZeroPadding2DCompiler::new(
                    settings,
                    [0, 0, padding[0], padding[1]],
                    lift1d(&input_dims[0])?,
                    lift1d(&output_dims[0])?,
                )),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::ZeroPadding2D { padding } => {
            push_job(
                jobs,
                key_dims,
                Box::new(ops::ZeroPadding2DCompiler::new(
                    settings,
                    *padding,
                    as3(&input_dims[0])?,
                    as3(&output_dims[0])?,
                )),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::Concatenate { axis } => {
            let rank = output_dims[0].len();
            let axis = crate::model::normalize_axis(*axis, rank)?;
            push_job(
                jobs,
                key_dims,
                Box::new(ops::ConcatenateCompiler::new(settings, axis)),
                input_keys.to_vec(),
                vec![out0],
            );
        }

        LayerKind::Add
        | LayerKind::Subtract
        | LayerKind::Multiply
        | LayerKind::Average
        | LayerKind::Maximum
        | LayerKind::Minimum => {
            let op = match kind {
                LayerKind::Add => ops::ArithmeticOp::Add,
                LayerKind::Subtract => ops::ArithmeticOp::Subtract,
                LayerKind::Multiply => ops::ArithmeticOp::Multiply,
                LayerKind::Average => ops::ArithmeticOp::Average,
                LayerKind::Maximum => ops::ArithmeticOp::Maximum,
                _ => ops::ArithmeticOp::Minimum,
            };
            push_job(
                jobs,
                key_dims,
                Box::new(ops::ArithmeticCompiler::new(settings, op, input_keys.len())),
                input_keys.to_vec(),
                vec![out0],
            );
        }
    }
    Ok(())
}

/// Initialisation, planning, emission and finalisation.
fn finish(
    mut jobs: Vec<Job<'_>>,
    key_dims: KeyDims,
    outputs: Vec<TensorLocation>,
    input_bindings: Vec<(TensorLocation, Vec<usize>, bool)>,
    settings: &CompilationSettings,
) -> Result<CompiledNN> {
    let mut pool = ConstantPool::new();
    let mut act = ActivationFunctionHandler::new(settings);
    for job in &mut jobs {
        if let Some(compiler) = &mut job.compiler {
            compiler.initialize(&mut pool, &mut act)?;
        }
    }

    let plan_nodes: Vec<plan::PlanNode> = jobs
        .iter()
        .map(|job| plan::PlanNode {
            inputs: job.inputs.clone(),
            outputs: job
                .outputs
                .iter()
                .enumerate()
                .map(|(i, (key, dims))| {
                    let floats = if i == 0 {
                        job.floats_override
                            .unwrap_or_else(|| dims.iter().product())
                    } else {
                        dims.iter().product()
                    };
                    (*key, floats)
                })
                .collect(),
            scratch_floats: job.compiler.as_ref().map_or(0, |c| c.scratch_floats()),
            inplace: job.compiler.as_ref().map_or(false, |c| c.can_be_inplace()),
            external: job.external,
        })
        .collect();
    let plan = plan::plan(&plan_nodes, &outputs)?;

    let arena = AlignedBuffer::zeroed(plan.total_floats);
    let constants = pool.finalize();

    if settings.debug {
        for node in &plan_nodes {
            for (key, floats) in &node.outputs {
                let slot = plan.slots[key];
                assert!(slot.floats >= *floats, "slot too small for tensor");
                assert!(slot.offset + slot.floats <= plan.total_floats);
            }
        }
    }

    let mut a = CodeAssembler::new(64)?;
    a.push(rbx)?;
    for (index, job) in jobs.iter().enumerate() {
        let Some(compiler) = &job.compiler else {
            continue;
        };
        let resolve = |key: &TensorLocation| -> Result<TensorPtr> {
            let slot = plan
                .slots
                .get(key)
                .ok_or_else(|| Error::Compile("tensor without a planned slot".into()))?;
            let dims = key_dims
                .get(key)
                .ok_or_else(|| Error::Compile("tensor without dimensions".into()))?;
            Ok(TensorPtr::new(arena.address(slot.offset), dims.clone()))
        };
        let inputs = job.inputs.iter().map(&resolve).collect::<Result<Vec<_>>>()?;
        let outs = job
            .outputs
            .iter()
            .map(|(key, _)| resolve(key))
            .collect::<Result<Vec<_>>>()?;
        let scratch = plan.scratch[index]
            .map(|slot| TensorPtr::new(arena.address(slot.offset), vec![slot.floats]));
        compiler.compile(&mut a, &pool, &act, &inputs, &outs, scratch.as_ref())?;
    }
    a.pop(rbx)?;
    a.ret()?;

    let bytes = a.assemble(0)?;
    debug!(
        code_bytes = bytes.len(),
        arena_floats = plan.total_floats,
        jobs = jobs.len(),
        "compilation finished"
    );
    let code = CodeBuffer::new(&bytes)?;
    let entry = unsafe { code.entry() };

    let inputs = input_bindings
        .into_iter()
        .map(|(key, dims, uint8)| {
            let slot = plan.slots[&key];
            Binding {
                offset: slot.offset,
                dims,
                uint8,
            }
        })
        .collect();
    let outputs = outputs
        .iter()
        .map(|key| {
            let slot = plan.slots[key];
            Binding {
                offset: slot.offset,
                dims: key_dims[key].clone(),
                uint8: false,
            }
        })
        .collect();

    Ok(CompiledNN {
        code,
        arena,
        constants,
        entry,
        inputs,
        outputs,
    })
}

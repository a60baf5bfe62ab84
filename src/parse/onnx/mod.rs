//! ONNX model reader (feature `onnx`).
//!
//! Decodes a `ModelProto` and imports the operator subset that maps onto the
//! layer kinds of this compiler. ONNX stores spatial tensors channels-first;
//! the importer transposes convolution/pooling shapes and kernels to the
//! channels-last convention used here. Initializers must be `FLOAT` or
//! `INT64` with `raw_data` storage; sparse or segmented initializers,
//! training info and functions are rejected.

mod proto;

use std::collections::HashMap;
use std::path::Path;

use prost::Message;

use crate::error::{Error, Result};
use crate::model::{ActivationId, LayerKind, Model, PaddingType, PoolingMethod, TensorLocation};
use crate::tensor::Tensor;

use proto::*;

fn attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn attr_ints(node: &NodeProto, name: &str) -> Option<Vec<i64>> {
    attr(node, name).map(|a| a.ints.clone())
}

fn attr_int(node: &NodeProto, name: &str, default: i64) -> i64 {
    attr(node, name).map_or(default, |a| a.i)
}

fn attr_f32(node: &NodeProto, name: &str, default: f32) -> f32 {
    attr(node, name).map_or(default, |a| a.f)
}

fn attr_str(node: &NodeProto, name: &str) -> Option<String> {
    attr(node, name).map(|a| String::from_utf8_lossy(&a.s).into_owned())
}

fn tensor_f32(init: &TensorProto) -> Result<Tensor> {
    let dims: Vec<usize> = init.dims.iter().map(|&d| d as usize).collect();
    let count: usize = dims.iter().product();
    if init.raw_data.len() != count * 4 {
        return Err(Error::UnsupportedOption(format!(
            "initializer \"{}\" does not use raw_data storage",
            init.name
        )));
    }
    let values = init
        .raw_data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok(Tensor::from_vec(dims, values))
}

/// `[top, bottom, left, right]` from ONNX `pads` (begin-x1, begin-x2,
/// end-x1, end-x2) or an `auto_pad` mode, reduced to the valid/same policy.
fn conv_padding(
    node: &NodeProto,
    input_hw: [usize; 2],
    kernel: [usize; 2],
    strides: [usize; 2],
) -> Result<PaddingType> {
    if let Some(mode) = attr_str(node, "auto_pad") {
        return match mode.as_str() {
            "" | "NOTSET" => explicit_padding(node, input_hw, kernel, strides),
            "VALID" => Ok(PaddingType::Valid),
            "SAME_UPPER" => Ok(PaddingType::Same),
            other => Err(Error::UnsupportedOption(format!(
                "auto_pad mode \"{other}\""
            ))),
        };
    }
    explicit_padding(node, input_hw, kernel, strides)
}

fn explicit_padding(
    node: &NodeProto,
    input_hw: [usize; 2],
    kernel: [usize; 2],
    strides: [usize; 2],
) -> Result<PaddingType> {
    let pads = attr_ints(node, "pads").unwrap_or_else(|| vec![0; 4]);
    if pads.iter().all(|&p| p == 0) {
        return Ok(PaddingType::Valid);
    }
    // Accept explicit pads only when they reproduce the same-padding split.
    let same = |axis: usize| {
        let out = (input_hw[axis] + strides[axis] - 1) / strides[axis];
        let total = ((out - 1) * strides[axis] + kernel[axis]).saturating_sub(input_hw[axis]);
        (total / 2, total - total / 2)
    };
    let (top, bottom) = same(0);
    let (left, right) = same(1);
    if pads == [top as i64, left as i64, bottom as i64, right as i64] {
        Ok(PaddingType::Same)
    } else {
        Err(Error::UnsupportedOption(format!(
            "explicit convolution pads {pads:?}"
        )))
    }
}

/// ONNX kernels are `[out, in, kh, kw]`; ours are `[kh, kw, in, out]`.
fn transpose_conv_kernel(weights: &Tensor) -> Tensor {
    let (o, i, kh, kw) = (
        weights.dim(0),
        weights.dim(1),
        weights.dim(2),
        weights.dim(3),
    );
    let mut out = Tensor::new(vec![kh, kw, i, o]);
    for oc in 0..o {
        for ic in 0..i {
            for y in 0..kh {
                for x in 0..kw {
                    out.set(&[y, x, ic, oc], weights.at(&[oc, ic, y, x]));
                }
            }
        }
    }
    out
}

/// Channels-first value dims (after the batch axis) to channels-last.
fn to_channels_last(dims: &[usize]) -> Result<Vec<usize>> {
    match dims {
        [n] => Ok(vec![*n]),
        [c, h, w] => Ok(vec![*h, *w, *c]),
        other => Err(Error::UnsupportedOption(format!(
            "tensors of rank {}",
            other.len()
        ))),
    }
}

pub fn read(path: &Path) -> Result<Model> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::ModelLoad(format!("{}: {e}", path.display())))?;
    let model_proto = ModelProto::decode(bytes.as_slice())
        .map_err(|e| Error::ModelLoad(format!("malformed ONNX file: {e}")))?;
    import(&model_proto)
}

/// Imports a decoded `ModelProto`. Exposed for tests that assemble models
/// in memory.
pub fn import(model_proto: &ModelProto) -> Result<Model> {
    if model_proto.ir_version < IR_VERSION_2019_1_22 {
        return Err(Error::UnsupportedOption(format!(
            "ONNX IR version {}",
            model_proto.ir_version
        )));
    }
    if !model_proto.training_info.is_empty() {
        return Err(Error::UnsupportedOption("ONNX training info".into()));
    }
    if !model_proto.functions.is_empty() {
        return Err(Error::UnsupportedOption("ONNX functions".into()));
    }
    if !model_proto
        .opset_import
        .iter()
        .any(|o| o.domain.is_empty())
    {
        return Err(Error::ModelLoad(
            "no version defined for the default operator set".into(),
        ));
    }
    let graph = model_proto
        .graph
        .as_ref()
        .ok_or_else(|| Error::ModelLoad("model has no graph".into()))?;
    if !graph.sparse_initializer.is_empty() {
        return Err(Error::UnsupportedOption("sparse initializers".into()));
    }

    let mut weights: HashMap<&str, Tensor> = HashMap::new();
    for init in &graph.initializer {
        if init.name.is_empty() {
            return Err(Error::ModelLoad("initializer without a name".into()));
        }
        if init.segment.is_some() {
            return Err(Error::UnsupportedOption("segmented initializers".into()));
        }
        if init.data_location != DATA_LOCATION_DEFAULT {
            return Err(Error::UnsupportedOption("external initializer data".into()));
        }
        match init.data_type {
            DATA_TYPE_FLOAT => {
                weights.insert(&init.name, tensor_f32(init)?);
            }
            DATA_TYPE_INT64 => {
                // Shape tensors; accepted but no supported operator reads one.
                let count: usize = init.dims.iter().map(|&d| d as usize).product();
                if init.raw_data.len() != count * 8 {
                    return Err(Error::UnsupportedOption(
                        "INT64 initializers without raw_data".into(),
                    ));
                }
            }
            other => {
                return Err(Error::UnsupportedOption(format!(
                    "initializer data type {other}"
                )))
            }
        }
    }
    let mut model = Model::new();
    let mut variables: HashMap<String, TensorLocation> = HashMap::new();

    for input in &graph.input {
        if weights.contains_key(input.name.as_str()) {
            continue;
        }
        let tensor_type = input
            .r#type
            .as_ref()
            .and_then(|t| t.tensor_type.as_ref())
            .ok_or_else(|| Error::UnsupportedOption("non-tensor model inputs".into()))?;
        if tensor_type.elem_type != DATA_TYPE_FLOAT {
            return Err(Error::UnsupportedOption("non-float model inputs".into()));
        }
        let shape = tensor_type
            .shape
            .as_ref()
            .ok_or_else(|| Error::UnsupportedOption("inputs without a shape".into()))?;
        if shape.dim.len() < 2 {
            return Err(Error::UnsupportedOption(
                "inputs without a batch axis and a data axis".into(),
            ));
        }
        match &shape.dim[0].value {
            Some(dimension::Value::DimParam(_)) | None => {}
            Some(dimension::Value::DimValue(1)) => {}
            Some(dimension::Value::DimValue(other)) => {
                return Err(Error::UnsupportedOption(format!(
                    "batch dimension {other}"
                )))
            }
        }
        let mut dims = Vec::with_capacity(shape.dim.len() - 1);
        for d in &shape.dim[1..] {
            match &d.value {
                Some(dimension::Value::DimValue(v)) if *v > 0 => dims.push(*v as usize),
                _ => {
                    return Err(Error::UnsupportedOption(
                        "variable data dimensions".into(),
                    ))
                }
            }
        }
        let dims = to_channels_last(&dims)?;
        let layer = model.add_layer(LayerKind::Input { dimensions: dims });
        let node = model.add_node(layer, &[])?;
        let loc = TensorLocation::new(node.layer, node.node_index, 0);
        model.inputs.push(loc);
        variables.insert(input.name.clone(), loc);
    }

    // ONNX guarantees topological node order.
    for node in &graph.node {
        if !node.domain.is_empty() {
            return Err(Error::UnsupportedOption(format!(
                "operator domain \"{}\"",
                node.domain
            )));
        }
        let input_loc = |i: usize| -> Result<TensorLocation> {
            let name = node.input.get(i).ok_or_else(|| {
                Error::ModelLoad(format!("{} is missing input {i}", node.op_type))
            })?;
            variables.get(name.as_str()).copied().ok_or_else(|| {
                Error::UnsupportedOption(format!(
                    "{} consumes \"{name}\", which is not a value",
                    node.op_type
                ))
            })
        };
        let weight = |i: usize| -> Result<&Tensor> {
            let name = node.input.get(i).ok_or_else(|| {
                Error::ModelLoad(format!("{} is missing input {i}", node.op_type))
            })?;
            weights.get(name.as_str()).ok_or_else(|| {
                Error::UnsupportedOption(format!(
                    "{} expects \"{name}\" to be an initializer",
                    node.op_type
                ))
            })
        };

        let kind = match node.op_type.as_str() {
            "Relu" => LayerKind::Relu {
                max_value: f32::MAX,
                negative_slope: 0.0,
                threshold: 0.0,
            },
            "LeakyRelu" => LayerKind::LeakyRelu {
                alpha: attr_f32(node, "alpha", 0.01),
            },
            "Elu" => LayerKind::Elu {
                alpha: attr_f32(node, "alpha", 1.0),
            },
            "Sigmoid" => LayerKind::Activation {
                activation: ActivationId::Sigmoid,
            },
            "Tanh" => LayerKind::Activation {
                activation: ActivationId::TanH,
            },
            "Softsign" => LayerKind::Activation {
                activation: ActivationId::Softsign,
            },
            "Identity" | "Dropout" => LayerKind::Dropout,

            "Softmax" => {
                let axis = attr_int(node, "axis", -1);
                if axis == 0 {
                    return Err(Error::UnsupportedOption(
                        "softmax over the batch axis".into(),
                    ));
                }
                LayerKind::Softmax {
                    axis: if axis > 0 { axis as i32 - 1 } else { axis as i32 },
                }
            }

            "Add" => LayerKind::Add,
            "Sub" => LayerKind::Subtract,
            "Mul" => LayerKind::Multiply,
            "Max" => LayerKind::Maximum,
            "Min" => LayerKind::Minimum,
            "Mean" => LayerKind::Average,

            "Concat" => {
                let axis = attr_int(node, "axis", 1);
                if axis == 0 {
                    return Err(Error::UnsupportedOption(
                        "concatenation along the batch axis".into(),
                    ));
                }
                // Rank-2 values only; spatial concat would need an axis
                // permutation on top of the layout change.
                let first = input_loc(0)?;
                if model.output_dimensions(first)?.len() != 1 {
                    return Err(Error::UnsupportedOption(
                        "concatenation of spatial tensors".into(),
                    ));
                }
                LayerKind::Concatenate {
                    axis: if axis > 0 { axis as i32 - 1 } else { axis as i32 },
                }
            }

            "Flatten" => {
                let first = input_loc(0)?;
                if model.output_dimensions(first)?.len() != 1 {
                    // Flattening reorders elements differently between the
                    // two layout conventions.
                    return Err(Error::UnsupportedOption(
                        "flattening spatial tensors".into(),
                    ));
                }
                LayerKind::Flatten
            }

            "Gemm" => {
                if attr_f32(node, "alpha", 1.0) != 1.0
                    || attr_f32(node, "beta", 1.0) != 1.0
                    || attr_int(node, "transA", 0) != 0
                {
                    return Err(Error::UnsupportedOption(
                        "general Gemm parameters".into(),
                    ));
                }
                let w = weight(1)?;
                let weights = if attr_int(node, "transB", 0) == 1 {
                    let (o, i) = (w.dim(0), w.dim(1));
                    let mut t = Tensor::new(vec![i, o]);
                    for oc in 0..o {
                        for ic in 0..i {
                            t.set(&[ic, oc], w.at(&[oc, ic]));
                        }
                    }
                    t
                } else {
                    w.clone()
                };
                let units = weights.dim(1);
                let (biases, has_biases) = if node.input.len() > 2 {
                    (weight(2)?.data().to_vec(), true)
                } else {
                    (vec![0.0; units], false)
                };
                LayerKind::Dense {
                    weights,
                    biases,
                    has_biases,
                    activation: ActivationId::Linear,
                }
            }

            "Conv" => {
                if attr_int(node, "group", 1) != 1 {
                    return Err(Error::UnsupportedOption("grouped convolutions".into()));
                }
                if attr_ints(node, "dilations")
                    .map_or(false, |d| d.iter().any(|&x| x != 1))
                {
                    return Err(Error::UnsupportedOption(
                        "dilation rates other than 1".into(),
                    ));
                }
                let input = input_loc(0)?;
                let in_dims = model.output_dimensions(input)?.to_vec();
                if in_dims.len() != 3 {
                    return Err(Error::UnsupportedOption(
                        "convolutions over non-spatial tensors".into(),
                    ));
                }
                let [h, w] = [in_dims[0], in_dims[1]];
                let kernel = weight(1)?;
                if kernel.rank() != 4 {
                    return Err(Error::UnsupportedOption(
                        "convolution kernels that are not 2-D".into(),
                    ));
                }
                let (kh, kw) = (kernel.dim(2), kernel.dim(3));
                let strides = attr_ints(node, "strides").unwrap_or_else(|| vec![1, 1]);
                let strides = [strides[0] as usize, strides[1] as usize];
                let padding = conv_padding(node, [h, w], [kh, kw], strides)?;
                let weights = transpose_conv_kernel(kernel);
                let filters = weights.dim(3);
                let (biases, has_biases) = if node.input.len() > 2 {
                    (weight(2)?.data().to_vec(), true)
                } else {
                    (vec![0.0; filters], false)
                };
                LayerKind::Conv2D {
                    strides,
                    weights,
                    biases,
                    has_biases,
                    activation: ActivationId::Linear,
                    padding,
                }
            }

            "MaxPool" | "AveragePool" => {
                if node.op_type == "AveragePool"
                    && attr_int(node, "count_include_pad", 0) != 0
                {
                    return Err(Error::UnsupportedOption(
                        "average pooling that counts padding".into(),
                    ));
                }
                let input = input_loc(0)?;
                let in_dims = model.output_dimensions(input)?.to_vec();
                let kernel = attr_ints(node, "kernel_shape")
                    .ok_or_else(|| Error::ModelLoad("pooling without kernel_shape".into()))?;
                let kernel = [kernel[0] as usize, kernel[1] as usize];
                let strides = attr_ints(node, "strides").unwrap_or_else(|| vec![1, 1]);
                let strides = [strides[0] as usize, strides[1] as usize];
                let padding =
                    conv_padding(node, [in_dims[0], in_dims[1]], kernel, strides)?;
                LayerKind::Pooling2D {
                    method: if node.op_type == "MaxPool" {
                        PoolingMethod::Max
                    } else {
                        PoolingMethod::Average
                    },
                    padding,
                    kernel_size: kernel,
                    strides,
                }
            }

            "GlobalMaxPool" | "GlobalAveragePool" => LayerKind::GlobalPooling2D {
                method: if node.op_type == "GlobalMaxPool" {
                    PoolingMethod::Max
                } else {
                    PoolingMethod::Average
                },
            },

            "BatchNormalization" => {
                let scale = weight(1)?.data().to_vec();
                let bias = weight(2)?.data().to_vec();
                let mean = weight(3)?.data().to_vec();
                let variance = weight(4)?.data().to_vec();
                let epsilon = attr_f32(node, "epsilon", 1e-5);
                let factor: Vec<f32> = variance
                    .iter()
                    .zip(&scale)
                    .map(|(v, s)| s / (v + epsilon).sqrt())
                    .collect();
                let offset: Vec<f32> = mean
                    .iter()
                    .zip(&factor)
                    .zip(&bias)
                    .map(|((m, f), b)| b - m * f)
                    .collect();
                LayerKind::BatchNormalization {
                    axis: -1,
                    factor,
                    offset,
                }
            }

            other => {
                return Err(Error::UnsupportedOption(format!(
                    "ONNX operator \"{other}\""
                )))
            }
        };

        // Wire value inputs (initializer inputs were consumed above).
        let value_inputs: Vec<TensorLocation> = node
            .input
            .iter()
            .filter(|name| !weights.contains_key(name.as_str()))
            .map(|name| {
                variables.get(name.as_str()).copied().ok_or_else(|| {
                    Error::UnsupportedOption(format!(
                        "{} consumes \"{name}\", which is not a value",
                        node.op_type
                    ))
                })
            })
            .collect::<Result<_>>()?;

        let layer = model.add_layer(kind);
        let node_ref = model.add_node(layer, &value_inputs)?;
        for (t, output) in node.output.iter().enumerate() {
            variables.insert(
                output.clone(),
                TensorLocation::new(node_ref.layer, node_ref.node_index, t),
            );
        }
    }

    for output in &graph.output {
        let loc = variables.get(output.name.as_str()).copied().ok_or_else(|| {
            Error::ModelLoad(format!("model output \"{}\" was never produced", output.name))
        })?;
        model.outputs.push(loc);
    }

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_input(name: &str, dims: &[i64]) -> ValueInfoProto {
        ValueInfoProto {
            name: name.into(),
            r#type: Some(TypeProto {
                tensor_type: Some(TensorTypeProto {
                    elem_type: DATA_TYPE_FLOAT,
                    shape: Some(TensorShapeProto {
                        dim: std::iter::once(Dimension {
                            value: Some(dimension::Value::DimParam("N".into())),
                        })
                        .chain(dims.iter().map(|&d| Dimension {
                            value: Some(dimension::Value::DimValue(d)),
                        }))
                        .collect(),
                    }),
                }),
            }),
        }
    }

    fn initializer(name: &str, dims: &[i64], values: &[f32]) -> TensorProto {
        TensorProto {
            dims: dims.to_vec(),
            data_type: DATA_TYPE_FLOAT,
            segment: None,
            name: name.into(),
            raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            data_location: DATA_LOCATION_DEFAULT,
        }
    }

    fn gemm_model(ir_version: i64) -> ModelProto {
        ModelProto {
            ir_version,
            producer_name: String::new(),
            producer_version: String::new(),
            graph: Some(GraphProto {
                node: vec![NodeProto {
                    input: vec!["x".into(), "w".into(), "b".into()],
                    output: vec!["y".into()],
                    name: "gemm".into(),
                    op_type: "Gemm".into(),
                    attribute: vec![],
                    domain: String::new(),
                }],
                name: "g".into(),
                initializer: vec![
                    initializer("w", &[2, 3], &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
                    initializer("b", &[3], &[0.0, 0.0, 0.0]),
                ],
                input: vec![float_input("x", &[2])],
                output: vec![float_input("y", &[3])],
                sparse_initializer: vec![],
            }),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            training_info: vec![],
            functions: vec![],
        }
    }

    #[test]
    fn imports_a_gemm_graph() {
        let model = import(&gemm_model(IR_VERSION_2019_1_22)).unwrap();
        assert_eq!(model.inputs.len(), 1);
        assert_eq!(model.outputs.len(), 1);
        let dims = model.output_dimensions(model.outputs[0]).unwrap();
        assert_eq!(dims, &[3]);
    }

    #[test]
    fn rejects_old_ir_versions() {
        assert!(matches!(
            import(&gemm_model(2)),
            Err(Error::UnsupportedOption(_))
        ));
    }

    #[test]
    fn round_trips_through_encoded_bytes() {
        let bytes = gemm_model(IR_VERSION_2019_1_22).encode_to_vec();
        let decoded = ModelProto::decode(bytes.as_slice()).unwrap();
        assert!(import(&decoded).is_ok());
    }

    #[test]
    fn rejects_unknown_operators() {
        let mut proto = gemm_model(IR_VERSION_2019_1_22);
        proto.graph.as_mut().unwrap().node[0].op_type = "LSTM".into();
        assert!(matches!(
            import(&proto),
            Err(Error::UnsupportedOption(_))
        ));
    }
}

//! Keras HDF5 model reader.
//!
//! Reads the `model_config` JSON attribute and the `model_weights` group of
//! a Keras 2 `.h5` file into the graph model. The convention throughout:
//! structural problems (missing keys, wrong types) are `ModelLoad` errors —
//! the file was not exported correctly; valid files using features this
//! compiler refuses are `UnsupportedOption`.

mod hdf5;

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{
    ActivationId, InterpolationMethod, LayerKind, Model, PaddingType, PoolingMethod,
    TensorLocation,
};
use crate::tensor::Tensor;

/// `(major << 24) | (minor << 16) | (patch << 8)`
fn make_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 24) | (minor << 16) | (patch << 8)
}

fn parse_keras_version(text: &str) -> Result<u32> {
    let mut parts = text
        .split(|c: char| c == '.' || c == '-')
        .map(|p| p.parse::<u32>());
    let mut next = || -> Result<u32> {
        parts
            .next()
            .and_then(|p| p.ok())
            .ok_or_else(|| Error::ModelLoad(format!("malformed keras_version \"{text}\"")))
    };
    let major = next()?;
    let minor = next()?;
    let patch = next()?;
    Ok(make_version(major, minor, patch))
}

// ─── JSON access helpers ────────────────────────────────────────

fn get<'a>(map: &'a Value, key: &str) -> Result<&'a Value> {
    map.get(key)
        .ok_or_else(|| Error::ModelLoad(format!("missing \"{key}\" in layer config")))
}

fn get_str<'a>(map: &'a Value, key: &str) -> Result<&'a str> {
    get(map, key)?
        .as_str()
        .ok_or_else(|| Error::ModelLoad(format!("\"{key}\" is not a string")))
}

fn get_bool(map: &Value, key: &str) -> Result<bool> {
    get(map, key)?
        .as_bool()
        .ok_or_else(|| Error::ModelLoad(format!("\"{key}\" is not a boolean")))
}

fn get_i64(map: &Value, key: &str) -> Result<i64> {
    get(map, key)?
        .as_i64()
        .ok_or_else(|| Error::ModelLoad(format!("\"{key}\" is not an integer")))
}

fn get_f32(map: &Value, key: &str) -> Result<f32> {
    get(map, key)?
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| Error::ModelLoad(format!("\"{key}\" is not a number")))
}

fn get_array<'a>(map: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    get(map, key)?
        .as_array()
        .ok_or_else(|| Error::ModelLoad(format!("\"{key}\" is not an array")))
}

fn usize_array(map: &Value, key: &str, expected: usize) -> Result<Vec<usize>> {
    let array = get_array(map, key)?;
    if array.len() != expected {
        return Err(Error::ModelLoad(format!(
            "\"{key}\" has {} entries, expected {expected}",
            array.len()
        )));
    }
    array
        .iter()
        .map(|v| {
            v.as_u64()
                .map(|x| x as usize)
                .ok_or_else(|| Error::ModelLoad(format!("\"{key}\" entry is not an integer")))
        })
        .collect()
}

fn check_channels_last(config: &Value) -> Result<()> {
    if get_str(config, "data_format")? != "channels_last" {
        return Err(Error::UnsupportedOption(
            "data formats other than channels_last".into(),
        ));
    }
    Ok(())
}

fn check_unit_dilation(config: &Value) -> Result<()> {
    let dilation = get_array(config, "dilation_rate")?;
    if dilation.iter().any(|v| v.as_u64() != Some(1)) {
        return Err(Error::UnsupportedOption(
            "dilation rates other than 1".into(),
        ));
    }
    Ok(())
}

fn parse_activation(name: &str) -> Result<ActivationId> {
    Ok(match name {
        "linear" => ActivationId::Linear,
        "relu" => ActivationId::Relu,
        "sigmoid" => ActivationId::Sigmoid,
        "tanh" => ActivationId::TanH,
        "hard_sigmoid" => ActivationId::HardSigmoid,
        "softmax" => ActivationId::Softmax,
        "elu" => ActivationId::Elu,
        "selu" => ActivationId::Selu,
        "exponential" => ActivationId::Exponential,
        "softsign" => ActivationId::Softsign,
        other => {
            return Err(Error::UnsupportedOption(format!(
                "activation function \"{other}\""
            )))
        }
    })
}

fn parse_padding(name: &str) -> Result<PaddingType> {
    Ok(match name {
        "valid" => PaddingType::Valid,
        "same" => PaddingType::Same,
        other => {
            return Err(Error::UnsupportedOption(format!(
                "padding type \"{other}\""
            )))
        }
    })
}

fn parse_interpolation(name: &str) -> Result<InterpolationMethod> {
    Ok(match name {
        "nearest" => InterpolationMethod::Nearest,
        "bilinear" => InterpolationMethod::Bilinear,
        other => {
            return Err(Error::UnsupportedOption(format!(
                "interpolation method \"{other}\""
            )))
        }
    })
}

/// Fetches `(values, shape)` for one named weight of one layer.
type GetWeights<'a> = dyn Fn(&str, &str) -> Result<(Vec<f32>, Vec<usize>)> + 'a;

fn input_dims_from_batch_shape(config: &Value) -> Result<Vec<usize>> {
    let shape = get_array(config, "batch_input_shape")?;
    if shape.len() < 2 {
        return Err(Error::UnsupportedOption(
            "model inputs must have at least one dimension beside the batch axis".into(),
        ));
    }
    if !shape[0].is_null() {
        return Err(Error::UnsupportedOption("a non-null batch axis".into()));
    }
    let dims: Vec<usize> = shape[1..]
        .iter()
        .map(|v| {
            v.as_u64()
                .map(|x| x as usize)
                .ok_or_else(|| Error::ModelLoad("batch_input_shape entry is not an integer".into()))
        })
        .collect::<Result<_>>()?;
    if dims.iter().any(|&d| d == 0) {
        return Err(Error::InvalidGraph("input dimension of zero".into()));
    }
    if let Some(dtype) = config.get("dtype").and_then(|d| d.as_str()) {
        if dtype != "float32" {
            return Err(Error::UnsupportedOption(format!(
                "model input dtype \"{dtype}\""
            )));
        }
    }
    Ok(dims)
}

/// Parses one layer's parameter record into a [`LayerKind`].
fn parse_layer(
    class_name: &str,
    config: &Value,
    gw: &GetWeights<'_>,
    keras_version: u32,
) -> Result<LayerKind> {
    let fetch = |weight: &str, rank: usize| -> Result<Tensor> {
        let (values, dims) = gw(weight, "")?;
        if dims.len() != rank {
            return Err(Error::ModelLoad(format!(
                "weight \"{weight}\" has rank {}, expected {rank}",
                dims.len()
            )));
        }
        Ok(Tensor::from_vec(dims, values))
    };
    let fetch_vec = |weight: &str| -> Result<Vec<f32>> {
        let (values, dims) = gw(weight, "")?;
        if dims.len() != 1 {
            return Err(Error::ModelLoad(format!(
                "weight \"{weight}\" is not a vector"
            )));
        }
        Ok(values)
    };

    Ok(match class_name {
        "InputLayer" => {
            if get_bool(config, "sparse").unwrap_or(false) {
                return Err(Error::UnsupportedOption("sparse inputs".into()));
            }
            LayerKind::Input {
                dimensions: input_dims_from_batch_shape(config)?,
            }
        }

        "Dense" => {
            let use_bias = get_bool(config, "use_bias")?;
            let weights = fetch("kernel", 2)?;
            let units = weights.dim(1);
            let biases = if use_bias {
                fetch_vec("bias")?
            } else {
                vec![0.0; units]
            };
            LayerKind::Dense {
                weights,
                biases,
                has_biases: use_bias,
                activation: parse_activation(get_str(config, "activation")?)?,
            }
        }

        "Activation" => LayerKind::Activation {
            activation: parse_activation(get_str(config, "activation")?)?,
        },

        "Dropout" | "SpatialDropout2D" => LayerKind::Dropout,

        "Flatten" => {
            if keras_version >= make_version(2, 1, 6) {
                check_channels_last(config)?;
            }
            LayerKind::Flatten
        }

        "Reshape" => {
            let shape = get_array(config, "target_shape")?;
            let mut dimensions = Vec::with_capacity(shape.len());
            for v in shape {
                let dim = v
                    .as_i64()
                    .ok_or_else(|| Error::ModelLoad("target_shape entry is not an integer".into()))?;
                if dim == -1 {
                    return Err(Error::UnsupportedOption(
                        "shape inference in reshape layers".into(),
                    ));
                }
                if dim <= 0 {
                    return Err(Error::InvalidGraph("non-positive reshape dimension".into()));
                }
                dimensions.push(dim as usize);
            }
            LayerKind::Reshape { dimensions }
        }

        "Conv1D" => {
            check_channels_last(config)?;
            check_unit_dilation(config)?;
            let strides = usize_array(config, "strides", 1)?;
            let use_bias = get_bool(config, "use_bias")?;
            let weights = fetch("kernel", 3)?;
            let filters = weights.dim(2);
            let biases = if use_bias {
                fetch_vec("bias")?
            } else {
                vec![0.0; filters]
            };
            LayerKind::Conv1D {
                stride: strides[0],
                weights,
                biases,
                has_biases: use_bias,
                activation: parse_activation(get_str(config, "activation")?)?,
                padding: parse_padding(get_str(config, "padding")?)?,
            }
        }

        "Conv2D" => {
            check_channels_last(config)?;
            check_unit_dilation(config)?;
            let strides = usize_array(config, "strides", 2)?;
            let use_bias = get_bool(config, "use_bias")?;
            let weights = fetch("kernel", 4)?;
            let filters = weights.dim(3);
            let biases = if use_bias {
                fetch_vec("bias")?
            } else {
                vec![0.0; filters]
            };
            LayerKind::Conv2D {
                strides: [strides[0], strides[1]],
                weights,
                biases,
                has_biases: use_bias,
                activation: parse_activation(get_str(config, "activation")?)?,
                padding: parse_padding(get_str(config, "padding")?)?,
            }
        }

        "SeparableConv2D" => {
            check_channels_last(config)?;
            check_unit_dilation(config)?;
            let strides = usize_array(config, "strides", 2)?;
            let use_bias = get_bool(config, "use_bias")?;
            let depthwise = fetch("depthwise_kernel", 4)?;
            let pointwise = fetch("pointwise_kernel", 4)?;
            let filters = pointwise.dim(3);
            if pointwise.dim(0) != 1 || pointwise.dim(1) != 1 {
                return Err(Error::ModelLoad("pointwise kernel is not 1x1".into()));
            }
            let biases = if use_bias {
                fetch_vec("bias")?
            } else {
                vec![0.0; filters]
            };
            LayerKind::SeparableConv2D {
                strides: [strides[0], strides[1]],
                depthwise_weights: depthwise,
                pointwise_weights: pointwise,
                biases,
                has_biases: use_bias,
                activation: parse_activation(get_str(config, "activation")?)?,
                padding: parse_padding(get_str(config, "padding")?)?,
            }
        }

        "DepthwiseConv2D" => {
            if keras_version < make_version(2, 1, 5) {
                return Err(Error::UnsupportedOption(
                    "DepthwiseConv2D before Keras 2.1.5".into(),
                ));
            }
            check_channels_last(config)?;
            check_unit_dilation(config)?;
            let strides = usize_array(config, "strides", 2)?;
            let use_bias = get_bool(config, "use_bias")?;
            let weights = fetch("depthwise_kernel", 4)?;
            let channels = weights.dim(2) * weights.dim(3);
            let biases = if use_bias {
                fetch_vec("bias")?
            } else {
                vec![0.0; channels]
            };
            LayerKind::DepthwiseConv2D {
                strides: [strides[0], strides[1]],
                weights,
                biases,
                has_biases: use_bias,
                activation: parse_activation(get_str(config, "activation")?)?,
                padding: parse_padding(get_str(config, "padding")?)?,
            }
        }

        "Cropping2D" => {
            check_channels_last(config)?;
            let cropping = get_array(config, "cropping")?;
            if cropping.len() != 2 {
                return Err(Error::ModelLoad("cropping is not a pair of pairs".into()));
            }
            let parse_pair = |v: &Value| -> Result<[usize; 2]> {
                let array = v
                    .as_array()
                    .ok_or_else(|| Error::ModelLoad("cropping entry is not a pair".into()))?;
                if array.len() != 2 {
                    return Err(Error::ModelLoad("cropping entry is not a pair".into()));
                }
                Ok([
                    array[0].as_u64().unwrap_or(0) as usize,
                    array[1].as_u64().unwrap_or(0) as usize,
                ])
            };
            let height = parse_pair(&cropping[0])?;
            let width = parse_pair(&cropping[1])?;
            LayerKind::Cropping2D {
                cropping: [height[0], height[1], width[0], width[1]],
            }
        }

        "UpSampling2D" => {
            check_channels_last(config)?;
            let size = usize_array(config, "size", 2)?;
            let interpolation = if keras_version >= make_version(2, 3, 0) {
                parse_interpolation(get_str(config, "interpolation")?)?
            } else {
                InterpolationMethod::Nearest
            };
            LayerKind::UpSampling2D {
                size: [size[0], size[1]],
                interpolation,
            }
        }

        "ZeroPadding1D" => {
            let padding = get_array(config, "padding")?;
            let pair = match padding.len() {
                2 => [
                    padding[0].as_u64().unwrap_or(0) as usize,
                    padding[1].as_u64().unwrap_or(0) as usize,
                ],
                _ => return Err(Error::ModelLoad("padding is not a pair".into())),
            };
            LayerKind::ZeroPadding1D { padding: pair }
        }

        "ZeroPadding2D" => {
            check_channels_last(config)?;
            let padding = get_array(config, "padding")?;
            if padding.len() != 2 {
                return Err(Error::ModelLoad("padding is not a pair of pairs".into()));
            }
            let parse_pair = |v: &Value| -> Result<[usize; 2]> {
                let array = v
                    .as_array()
                    .ok_or_else(|| Error::ModelLoad("padding entry is not a pair".into()))?;
                if array.len() != 2 {
                    return Err(Error::ModelLoad("padding entry is not a pair".into()));
                }
                Ok([
                    array[0].as_u64().unwrap_or(0) as usize,
                    array[1].as_u64().unwrap_or(0) as usize,
                ])
            };
            let height = parse_pair(&padding[0])?;
            let width = parse_pair(&padding[1])?;
            LayerKind::ZeroPadding2D {
                padding: [height[0], height[1], width[0], width[1]],
            }
        }

        "MaxPooling1D" | "AveragePooling1D" => {
            let pool = usize_array(config, "pool_size", 1)?;
            let strides = usize_array(config, "strides", 1)?;
            LayerKind::Pooling1D {
                method: if class_name == "MaxPooling1D" {
                    PoolingMethod::Max
                } else {
                    PoolingMethod::Average
                },
                padding: parse_padding(get_str(config, "padding")?)?,
                kernel_size: pool[0],
                stride: strides[0],
            }
        }

        "MaxPooling2D" | "AveragePooling2D" => {
            check_channels_last(config)?;
            let pool = usize_array(config, "pool_size", 2)?;
            let strides = usize_array(config, "strides", 2)?;
            LayerKind::Pooling2D {
                method: if class_name == "MaxPooling2D" {
                    PoolingMethod::Max
                } else {
                    PoolingMethod::Average
                },
                padding: parse_padding(get_str(config, "padding")?)?,
                kernel_size: [pool[0], pool[1]],
                strides: [strides[0], strides[1]],
            }
        }

        "GlobalMaxPooling2D" | "GlobalAveragePooling2D" => {
            check_channels_last(config)?;
            LayerKind::GlobalPooling2D {
                method: if class_name == "GlobalMaxPooling2D" {
                    PoolingMethod::Max
                } else {
                    PoolingMethod::Average
                },
            }
        }

        "Add" => LayerKind::Add,
        "Subtract" => {
            if keras_version < make_version(2, 0, 7) {
                return Err(Error::UnsupportedOption("Subtract before Keras 2.0.7".into()));
            }
            LayerKind::Subtract
        }
        "Multiply" => LayerKind::Multiply,
        "Average" => LayerKind::Average,
        "Maximum" => LayerKind::Maximum,
        "Minimum" => {
            if keras_version < make_version(2, 0, 9) {
                return Err(Error::UnsupportedOption("Minimum before Keras 2.0.9".into()));
            }
            LayerKind::Minimum
        }

        "Concatenate" => {
            let axis = get_i64(config, "axis")? as i32;
            if axis == 0 {
                return Err(Error::UnsupportedOption(
                    "concatenation along the batch axis".into(),
                ));
            }
            LayerKind::Concatenate {
                axis: if axis > 0 { axis - 1 } else { axis },
            }
        }

        "LeakyReLU" => {
            let alpha = get_f32(config, "alpha")?;
            if alpha < 0.0 {
                return Err(Error::InvalidGraph("negative LeakyReLU alpha".into()));
            }
            LayerKind::LeakyRelu { alpha }
        }

        "ELU" => LayerKind::Elu {
            alpha: get_f32(config, "alpha")?,
        },

        "ThresholdedReLU" => {
            let theta = get_f32(config, "theta")?;
            if theta < 0.0 {
                return Err(Error::InvalidGraph("negative ThresholdedReLU theta".into()));
            }
            LayerKind::ThresholdedRelu { theta }
        }

        "Softmax" => {
            if keras_version < make_version(2, 1, 3) {
                return Err(Error::UnsupportedOption(
                    "Softmax layers before Keras 2.1.3".into(),
                ));
            }
            let axis = get_i64(config, "axis")? as i32;
            if axis == 0 {
                return Err(Error::UnsupportedOption("softmax over the batch axis".into()));
            }
            LayerKind::Softmax {
                axis: if axis > 0 { axis - 1 } else { axis },
            }
        }

        "ReLU" => {
            if keras_version < make_version(2, 2, 0) {
                return Err(Error::UnsupportedOption(
                    "ReLU layers before Keras 2.2.0".into(),
                ));
            }
            let max_value = match get(config, "max_value")? {
                Value::Null => f32::MAX,
                v => v
                    .as_f64()
                    .map(|x| x as f32)
                    .ok_or_else(|| Error::ModelLoad("max_value is not a number".into()))?,
            };
            let (negative_slope, threshold) = if keras_version >= make_version(2, 2, 3) {
                (
                    get_f32(config, "negative_slope")?,
                    get_f32(config, "threshold")?,
                )
            } else {
                (0.0, 0.0)
            };
            LayerKind::Relu {
                max_value,
                negative_slope,
                threshold,
            }
        }

        "BatchNormalization" | "BatchNormalizationV1" => {
            // The axis may be wrapped in a single-element array.
            let axis_value = get(config, "axis")?;
            let axis = match axis_value {
                Value::Array(a) => a
                    .first()
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| Error::ModelLoad("malformed batchnorm axis".into()))?,
                v => v
                    .as_i64()
                    .ok_or_else(|| Error::ModelLoad("malformed batchnorm axis".into()))?,
            } as i32;
            if axis == 0 {
                return Err(Error::UnsupportedOption(
                    "batch normalization over the batch axis".into(),
                ));
            }
            let epsilon = get_f32(config, "epsilon")?;
            let center = get_bool(config, "center")?;
            let scale = get_bool(config, "scale")?;

            let variance = fetch_vec("moving_variance")?;
            let mut factor: Vec<f32> = variance
                .iter()
                .map(|v| 1.0 / (v + epsilon).sqrt())
                .collect();
            if scale {
                let gamma = fetch_vec("gamma")?;
                if gamma.len() != factor.len() {
                    return Err(Error::ModelLoad("gamma length mismatch".into()));
                }
                for (f, g) in factor.iter_mut().zip(&gamma) {
                    *f *= g;
                }
            }
            let mean = fetch_vec("moving_mean")?;
            if mean.len() != factor.len() {
                return Err(Error::ModelLoad("moving_mean length mismatch".into()));
            }
            let mut offset: Vec<f32> = mean.iter().zip(&factor).map(|(m, f)| -m * f).collect();
            if center {
                let beta = fetch_vec("beta")?;
                if beta.len() != offset.len() {
                    return Err(Error::ModelLoad("beta length mismatch".into()));
                }
                for (o, b) in offset.iter_mut().zip(&beta) {
                    *o += b;
                }
            }
            LayerKind::BatchNormalization {
                axis: if axis > 0 { axis - 1 } else { axis },
                factor,
                offset,
            }
        }

        other => {
            return Err(Error::UnsupportedOption(format!(
                "layer type \"{other}\""
            )))
        }
    })
}

/// Builds the graph from the parsed `model_config` tree.
pub(crate) fn parse_json_model(
    root: &Value,
    get_weights: &dyn Fn(&str, &str, &str) -> Result<(Vec<f32>, Vec<usize>)>,
    keras_version: u32,
) -> Result<Model> {
    let class_name = get_str(root, "class_name")?;
    let mut model = Model::new();

    if class_name == "Sequential" {
        let layers: &Vec<Value> = if keras_version < make_version(2, 2, 3) {
            get_array(root, "config")?
        } else {
            get_array(get(root, "config")?, "layers")?
        };
        if layers.is_empty() {
            return Err(Error::ModelLoad("sequential model without layers".into()));
        }

        let mut previous: Option<TensorLocation> = None;
        for layer in layers {
            let layer_type = get_str(layer, "class_name")?;
            let config = get(layer, "config")?;
            let name = get_str(config, "name")?.to_string();
            let gw = |weight: &str, _: &str| get_weights(&name, weight, "");
            let kind = parse_layer(layer_type, config, &gw, keras_version)?;

            if previous.is_none() && !matches!(kind, LayerKind::Input { .. }) {
                // Implicit input layer from the first layer's input shape.
                let dims = input_dims_from_batch_shape(config)?;
                let input = model.add_layer(LayerKind::Input { dimensions: dims });
                let node = model.add_node(input, &[])?;
                previous = Some(TensorLocation::new(node.layer, node.node_index, 0));
            }

            let is_input = matches!(kind, LayerKind::Input { .. });
            if is_input && previous.is_some() {
                return Err(Error::ModelLoad(
                    "input layer in the middle of a sequential model".into(),
                ));
            }
            let id = model.add_layer(kind);
            let node = match previous {
                Some(loc) => model.add_node(id, &[loc])?,
                None => model.add_node(id, &[])?,
            };
            previous = Some(TensorLocation::new(node.layer, node.node_index, 0));
        }

        model.inputs.push(TensorLocation::new(0, 0, 0));
        model.outputs.push(previous.expect("at least one layer"));
        return Ok(model);
    }

    if class_name != "Model" && class_name != "Functional" {
        return Err(Error::UnsupportedOption(format!(
            "model class \"{class_name}\""
        )));
    }

    let config = get(root, "config")?;
    let layers = get_array(config, "layers")?;
    let input_layers = get_array(config, "input_layers")?;
    let output_layers = get_array(config, "output_layers")?;

    // First instantiate all layers; their nodes are created once every
    // producer node exists, in the order the file lists them.
    let mut ids: HashMap<String, usize> = HashMap::new();
    let mut unprocessed: Vec<(String, Vec<Value>)> = Vec::new();
    for layer in layers {
        let name = get_str(layer, "name")?.to_string();
        let layer_type = get_str(layer, "class_name")?;
        let layer_config = get(layer, "config")?;
        let gw = |weight: &str, _: &str| get_weights(&name, weight, "");
        let kind = parse_layer(layer_type, layer_config, &gw, keras_version)?;
        let is_input = matches!(kind, LayerKind::Input { .. });
        let inbound = get_array(layer, "inbound_nodes")?.clone();
        if is_input && !inbound.is_empty() {
            return Err(Error::UnsupportedOption(
                "input layers with explicit inbound nodes".into(),
            ));
        }
        let id = model.add_layer(kind);
        if is_input {
            model.add_node(id, &[])?;
        }
        ids.insert(name.clone(), id);
        if !inbound.is_empty() {
            unprocessed.push((name, inbound));
        }
    }

    // Link nodes with their predecessors; a node can only be created after
    // all of its inputs exist.
    while !unprocessed.is_empty() {
        let mut progressed = false;
        for entry in &mut unprocessed {
            let (name, nodes) = entry;
            let layer_id = ids[name.as_str()];
            let mut done = 0usize;
            for node in nodes.iter() {
                let inbound = node
                    .as_array()
                    .ok_or_else(|| Error::ModelLoad("malformed inbound node".into()))?;
                let mut inputs = Vec::with_capacity(inbound.len());
                let mut ready = true;
                for input in inbound {
                    let parts = input
                        .as_array()
                        .ok_or_else(|| Error::ModelLoad("malformed inbound input".into()))?;
                    if parts.len() != 3 && parts.len() != 4 {
                        return Err(Error::ModelLoad("malformed inbound input".into()));
                    }
                    if parts.len() == 4
                        && parts[3].as_object().map_or(false, |kw| !kw.is_empty())
                    {
                        return Err(Error::UnsupportedOption(
                            "keyword arguments of inbound nodes".into(),
                        ));
                    }
                    let producer_name = parts[0]
                        .as_str()
                        .ok_or_else(|| Error::ModelLoad("inbound layer name".into()))?;
                    let node_index = parts[1].as_u64().unwrap_or(0) as usize;
                    let tensor_index = parts[2].as_u64().unwrap_or(0) as usize;
                    let producer = *ids
                        .get(producer_name)
                        .ok_or_else(|| Error::ModelLoad(format!(
                            "inbound layer \"{producer_name}\" does not exist"
                        )))?;
                    if model.layers[producer].nodes.len() <= node_index {
                        ready = false;
                        break;
                    }
                    inputs.push(TensorLocation::new(producer, node_index, tensor_index));
                }
                if !ready {
                    break;
                }
                model.add_node(layer_id, &inputs)?;
                done += 1;
                progressed = true;
            }
            nodes.drain(..done);
        }
        unprocessed.retain(|(_, nodes)| !nodes.is_empty());
        if !progressed && !unprocessed.is_empty() {
            return Err(Error::InvalidGraph(
                "unresolvable node dependencies in functional model".into(),
            ));
        }
    }

    let parse_boundary = |value: &Value| -> Result<TensorLocation> {
        let triple = value
            .as_array()
            .ok_or_else(|| Error::ModelLoad("malformed model boundary".into()))?;
        if triple.len() != 3 {
            return Err(Error::ModelLoad("malformed model boundary".into()));
        }
        let name = triple[0]
            .as_str()
            .ok_or_else(|| Error::ModelLoad("boundary layer name".into()))?;
        let layer = *ids
            .get(name)
            .ok_or_else(|| Error::ModelLoad(format!("boundary layer \"{name}\" missing")))?;
        Ok(TensorLocation::new(
            layer,
            triple[1].as_u64().unwrap_or(0) as usize,
            triple[2].as_u64().unwrap_or(0) as usize,
        ))
    };

    for input in input_layers {
        let loc = parse_boundary(input)?;
        if !matches!(model.layers[loc.layer].kind, LayerKind::Input { .. }) {
            return Err(Error::UnsupportedOption(
                "model inputs that are not Input layers".into(),
            ));
        }
        model.output_dimensions(loc)?;
        model.inputs.push(loc);
    }
    for output in output_layers {
        let loc = parse_boundary(output)?;
        model.output_dimensions(loc)?;
        model.outputs.push(loc);
    }

    Ok(model)
}

/// Reads a Keras HDF5 model file.
pub fn read(path: &Path) -> Result<Model> {
    let file = hdf5::Hdf5File::open(path)?;
    let root = file.root();

    let keras_version = parse_keras_version(&root.attr_str("keras_version")?)?;
    if keras_version < make_version(2, 0, 0) || keras_version >= make_version(3, 0, 0) {
        return Err(Error::UnsupportedOption(
            "only Keras 2 models are supported".into(),
        ));
    }

    let config_text = root.attr_str("model_config")?;
    let config: Value = serde_json::from_str(&config_text)
        .map_err(|e| Error::ModelLoad(format!("model_config is not valid JSON: {e}")))?;
    let weights = root.group("model_weights")?;

    let get_weights = |layer: &str, weight: &str, _: &str| -> Result<(Vec<f32>, Vec<usize>)> {
        let layer_group = weights.group(layer)?;
        // The stored layer prefix can be mangled; recover it from the
        // weight_names attribute.
        let mut mangled = layer.to_string();
        if let Ok(names) = layer_group.attr_str_array("weight_names") {
            for full in &names {
                let Some(slash) = full.find('/') else { continue };
                let rest = &full[slash + 1..];
                let stem = rest.split(':').next().unwrap_or(rest);
                if stem == weight {
                    mangled = full[..slash].to_string();
                    break;
                }
            }
        }
        let weights_group = layer_group.group(&mangled)?;
        weights_group.dataset_f32(&format!("{weight}:0"))
    };

    parse_json_model(&config, &get_weights, keras_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LayerKind;

    fn no_weights(_: &str, _: &str, _: &str) -> Result<(Vec<f32>, Vec<usize>)> {
        Err(Error::ModelLoad("no weights in this test".into()))
    }

    fn dense_weights(layer: &str, weight: &str, _: &str) -> Result<(Vec<f32>, Vec<usize>)> {
        let _ = layer;
        match weight {
            "kernel" => Ok((vec![1.0, 0.0, 0.0, 1.0], vec![2, 2])),
            "bias" => Ok((vec![0.5, -0.5], vec![2])),
            other => Err(Error::ModelLoad(format!("unexpected weight {other}"))),
        }
    }

    #[test]
    fn sequential_model_with_implicit_input() {
        let config: Value = serde_json::from_str(
            r#"{
                "class_name": "Sequential",
                "config": {"layers": [
                    {"class_name": "Dense", "config": {
                        "name": "dense_1",
                        "batch_input_shape": [null, 2],
                        "dtype": "float32",
                        "units": 2,
                        "activation": "relu",
                        "use_bias": true
                    }}
                ]}
            }"#,
        )
        .unwrap();
        let model =
            parse_json_model(&config, &dense_weights, make_version(2, 2, 4)).unwrap();
        assert_eq!(model.layers.len(), 2);
        assert!(matches!(model.layers[0].kind, LayerKind::Input { .. }));
        assert!(matches!(model.layers[1].kind, LayerKind::Dense { .. }));
        assert_eq!(model.inputs.len(), 1);
        assert_eq!(
            model.node(crate::model::NodeRef { layer: 1, node_index: 0 }).output_dimensions,
            vec![vec![2]]
        );
    }

    #[test]
    fn functional_model_with_merge() {
        let config: Value = serde_json::from_str(
            r#"{
                "class_name": "Model",
                "config": {
                    "layers": [
                        {"name": "in", "class_name": "InputLayer", "config": {
                            "name": "in", "batch_input_shape": [null, 4],
                            "dtype": "float32", "sparse": false
                        }, "inbound_nodes": []},
                        {"name": "relu", "class_name": "ReLU", "config": {
                            "name": "relu", "max_value": null,
                            "negative_slope": 0.0, "threshold": 0.0
                        }, "inbound_nodes": [[["in", 0, 0]]]},
                        {"name": "add", "class_name": "Add", "config": {"name": "add"},
                         "inbound_nodes": [[["in", 0, 0], ["relu", 0, 0]]]}
                    ],
                    "input_layers": [["in", 0, 0]],
                    "output_layers": [["add", 0, 0]]
                }
            }"#,
        )
        .unwrap();
        let model = parse_json_model(&config, &no_weights, make_version(2, 2, 4)).unwrap();
        assert_eq!(model.inputs.len(), 1);
        assert_eq!(model.outputs.len(), 1);
        let order = model.topological_order().unwrap();
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn unknown_layer_type_is_unsupported() {
        let config: Value = serde_json::from_str(
            r#"{
                "class_name": "Sequential",
                "config": {"layers": [
                    {"class_name": "LocallyConnected2D", "config": {
                        "name": "lc", "batch_input_shape": [null, 4, 4, 1],
                        "dtype": "float32"
                    }}
                ]}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            parse_json_model(&config, &no_weights, make_version(2, 2, 4)),
            Err(Error::UnsupportedOption(_))
        ));
    }

    #[test]
    fn channels_first_is_rejected() {
        let config: Value = serde_json::from_str(
            r#"{
                "class_name": "Sequential",
                "config": {"layers": [
                    {"class_name": "MaxPooling2D", "config": {
                        "name": "pool", "batch_input_shape": [null, 4, 4, 1],
                        "dtype": "float32", "pool_size": [2, 2], "strides": [2, 2],
                        "padding": "valid", "data_format": "channels_first"
                    }}
                ]}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            parse_json_model(&config, &no_weights, make_version(2, 2, 4)),
            Err(Error::UnsupportedOption(_))
        ));
    }

    #[test]
    fn version_gates() {
        assert!(parse_keras_version("2.2.4-tf").unwrap() >= make_version(2, 2, 3));
        assert!(parse_keras_version("2.0.6").unwrap() < make_version(2, 0, 7));
        // ReLU layers did not exist before 2.2.0.
        let config: Value = serde_json::from_str(
            r#"{"class_name": "Sequential", "config": {"layers": [
                {"class_name": "ReLU", "config": {
                    "name": "relu", "batch_input_shape": [null, 4], "dtype": "float32",
                    "max_value": null
                }}
            ]}}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_json_model(&config, &no_weights, make_version(2, 1, 0)),
            Err(Error::UnsupportedOption(_))
        ));
    }
}

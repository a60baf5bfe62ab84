//! Layer variants and their output-shape contracts.
//!
//! Each layer kind carries its own parameter record and knows how to derive
//! its output dimensions from the input dimensions of a node. Violated
//! invariants surface as [`Error::InvalidGraph`]; features the compiler
//! refuses surface as [`Error::UnsupportedOption`]. All spatial data is
//! channels-last.

use crate::error::{Error, Result};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationId {
    Linear,
    Relu,
    Sigmoid,
    TanH,
    HardSigmoid,
    Softmax,
    Elu,
    Selu,
    Exponential,
    Softsign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingType {
    Valid,
    Same,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMethod {
    Nearest,
    Bilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingMethod {
    Average,
    Max,
}

/// Indices into the four-element padding/cropping arrays.
pub const TOP: usize = 0;
pub const BOTTOM: usize = 1;
pub const LEFT: usize = 2;
pub const RIGHT: usize = 3;

/// A layer instance inside a model, owning its parameters and its nodes.
#[derive(Debug)]
pub struct Layer {
    pub kind: LayerKind,
    pub nodes: Vec<super::Node>,
}

#[derive(Debug)]
pub enum LayerKind {
    Input {
        dimensions: Vec<usize>,
    },
    /// `weights` has dimensions `[inputs, units]`.
    Dense {
        weights: Tensor,
        biases: Vec<f32>,
        has_biases: bool,
        activation: ActivationId,
    },
    Activation {
        activation: ActivationId,
    },
    /// `weights` has dimensions `[kernel, in channels, filters]`.
    Conv1D {
        stride: usize,
        weights: Tensor,
        biases: Vec<f32>,
        has_biases: bool,
        activation: ActivationId,
        padding: PaddingType,
    },
    /// `weights` has dimensions `[kh, kw, in channels, filters]`.
    Conv2D {
        strides: [usize; 2],
        weights: Tensor,
        biases: Vec<f32>,
        has_biases: bool,
        activation: ActivationId,
        padding: PaddingType,
    },
    /// Depthwise weights `[kh, kw, in channels, multiplier]`, pointwise
    /// weights `[1, 1, in channels * multiplier, filters]`.
    SeparableConv2D {
        strides: [usize; 2],
        depthwise_weights: Tensor,
        pointwise_weights: Tensor,
        biases: Vec<f32>,
        has_biases: bool,
        activation: ActivationId,
        padding: PaddingType,
    },
    /// `weights` has dimensions `[kh, kw, in channels, multiplier]`.
    DepthwiseConv2D {
        strides: [usize; 2],
        weights: Tensor,
        biases: Vec<f32>,
        has_biases: bool,
        activation: ActivationId,
        padding: PaddingType,
    },
    Pooling1D {
        method: PoolingMethod,
        padding: PaddingType,
        kernel_size: usize,
        stride: usize,
    },
    Pooling2D {
        method: PoolingMethod,
        padding: PaddingType,
        kernel_size: [usize; 2],
        strides: [usize; 2],
    },
    GlobalPooling2D {
        method: PoolingMethod,
    },
    /// `factor`/`offset` are the load-time folded affine parameters:
    /// `y = x * factor[c] + offset[c]`.
    BatchNormalization {
        axis: i32,
        factor: Vec<f32>,
        offset: Vec<f32>,
    },
    Dropout,
    Reshape {
        dimensions: Vec<usize>,
    },
    Flatten,
    /// `[top, bottom, left, right]`
    Cropping2D {
        cropping: [usize; 4],
    },
    UpSampling2D {
        size: [usize; 2],
        interpolation: InterpolationMethod,
    },
    /// `[left, right]`
    ZeroPadding1D {
        padding: [usize; 2],
    },
    /// `[top, bottom, left, right]`
    ZeroPadding2D {
        padding: [usize; 4],
    },
    Concatenate {
        axis: i32,
    },
    Average,
    Maximum,
    Minimum,
    Add,
    Subtract,
    Multiply,
    Relu {
        max_value: f32,
        negative_slope: f32,
        threshold: f32,
    },
    Softmax {
        axis: i32,
    },
    LeakyRelu {
        alpha: f32,
    },
    Elu {
        alpha: f32,
    },
    ThresholdedRelu {
        theta: f32,
    },
}

/// Resolves a possibly negative axis against a rank.
pub fn normalize_axis(axis: i32, rank: usize) -> Result<usize> {
    let resolved = if axis >= 0 {
        axis as usize
    } else {
        let back = (-axis) as usize;
        if back > rank {
            return Err(Error::InvalidGraph(format!(
                "axis {axis} out of range for rank {rank}"
            )));
        }
        rank - back
    };
    if resolved >= rank {
        return Err(Error::InvalidGraph(format!(
            "axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(resolved)
}

fn require_rank(kind: &str, dims: &[usize], rank: usize) -> Result<()> {
    if dims.len() != rank {
        return Err(Error::InvalidGraph(format!(
            "{kind} expects rank-{rank} input, got rank {}",
            dims.len()
        )));
    }
    Ok(())
}

fn single_input<'a>(kind: &str, inputs: &'a [Vec<usize>]) -> Result<&'a Vec<usize>> {
    if inputs.len() != 1 {
        return Err(Error::InvalidGraph(format!(
            "{kind} expects exactly one input tensor, got {}",
            inputs.len()
        )));
    }
    Ok(&inputs[0])
}

fn merge_inputs(kind: &str, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
    if inputs.len() < 2 {
        return Err(Error::InvalidGraph(format!(
            "{kind} expects at least two input tensors, got {}",
            inputs.len()
        )));
    }
    for dims in &inputs[1..] {
        if dims != &inputs[0] {
            return Err(Error::InvalidGraph(format!(
                "{kind} inputs must have equal shapes, got {:?} vs {:?}",
                inputs[0], dims
            )));
        }
    }
    Ok(vec![inputs[0].clone()])
}

/// `(in - (valid ? k - 1 : 0) + s - 1) / s`
fn conv_output_extent(input: usize, kernel: usize, stride: usize, padding: PaddingType) -> usize {
    let reduced = match padding {
        PaddingType::Valid => input - (kernel - 1),
        PaddingType::Same => input,
    };
    (reduced + stride - 1) / stride
}

fn check_spatial(kind: &str, input: &[usize], kernel: [usize; 2], padding: PaddingType) -> Result<()> {
    if padding == PaddingType::Valid && (input[0] < kernel[0] || input[1] < kernel[1]) {
        return Err(Error::InvalidGraph(format!(
            "{kind} kernel {kernel:?} does not fit input {:?} with valid padding",
            &input[..2]
        )));
    }
    if input.iter().any(|&d| d == 0) {
        return Err(Error::InvalidGraph(format!("{kind} input has a zero dimension")));
    }
    Ok(())
}

impl LayerKind {
    /// Human-readable layer name used in error messages and harness output.
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "Input",
            LayerKind::Dense { .. } => "Dense",
            LayerKind::Activation { .. } => "Activation",
            LayerKind::Conv1D { .. } => "Conv1D",
            LayerKind::Conv2D { .. } => "Conv2D",
            LayerKind::SeparableConv2D { .. } => "SeparableConv2D",
            LayerKind::DepthwiseConv2D { .. } => "DepthwiseConv2D",
            LayerKind::Pooling1D {
                method: PoolingMethod::Max,
                ..
            } => "MaxPooling1D",
            LayerKind::Pooling1D { .. } => "AveragePooling1D",
            LayerKind::Pooling2D {
                method: PoolingMethod::Max,
                ..
            } => "MaxPooling2D",
            LayerKind::Pooling2D { .. } => "AveragePooling2D",
            LayerKind::GlobalPooling2D {
                method: PoolingMethod::Max,
            } => "GlobalMaxPooling2D",
            LayerKind::GlobalPooling2D { .. } => "GlobalAveragePooling2D",
            LayerKind::BatchNormalization { .. } => "BatchNormalization",
            LayerKind::Dropout => "Dropout",
            LayerKind::Reshape { .. } => "Reshape",
            LayerKind::Flatten => "Flatten",
            LayerKind::Cropping2D { .. } => "Cropping2D",
            LayerKind::UpSampling2D { .. } => "UpSampling2D",
            LayerKind::ZeroPadding1D { .. } => "ZeroPadding1D",
            LayerKind::ZeroPadding2D { .. } => "ZeroPadding2D",
            LayerKind::Concatenate { .. } => "Concatenate",
            LayerKind::Average => "Average",
            LayerKind::Maximum => "Maximum",
            LayerKind::Minimum => "Minimum",
            LayerKind::Add => "Add",
            LayerKind::Subtract => "Subtract",
            LayerKind::Multiply => "Multiply",
            LayerKind::Relu { .. } => "ReLU",
            LayerKind::Softmax { .. } => "Softmax",
            LayerKind::LeakyRelu { .. } => "LeakyReLU",
            LayerKind::Elu { .. } => "ELU",
            LayerKind::ThresholdedRelu { .. } => "ThresholdedReLU",
        }
    }

    /// Derives the output dimensions of a node from its input dimensions.
    pub fn calc_output_dimensions(&self, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        match self {
            LayerKind::Input { dimensions } => {
                if !inputs.is_empty() {
                    return Err(Error::InvalidGraph(
                        "input layer node must not have inputs".into(),
                    ));
                }
                if dimensions.is_empty() || dimensions.iter().any(|&d| d == 0) {
                    return Err(Error::InvalidGraph(format!(
                        "input dimensions {dimensions:?} must be non-empty and non-zero"
                    )));
                }
                Ok(vec![dimensions.clone()])
            }

            LayerKind::Dense { weights, .. } => {
                let input = single_input("Dense", inputs)?;
                if input.len() != 1 {
                    return Err(Error::UnsupportedOption(
                        "dense layers can only be applied to flat tensors; use a 1x1 convolution"
                            .into(),
                    ));
                }
                if input[0] != weights.dim(0) {
                    return Err(Error::InvalidGraph(format!(
                        "dense input size {} does not match weights {}",
                        input[0],
                        weights.dim(0)
                    )));
                }
                Ok(vec![vec![weights.dim(1)]])
            }

            LayerKind::Activation { .. }
            | LayerKind::Dropout
            | LayerKind::Relu { .. }
            | LayerKind::LeakyRelu { .. }
            | LayerKind::Elu { .. }
            | LayerKind::ThresholdedRelu { .. } => {
                let input = single_input(self.name(), inputs)?;
                Ok(vec![input.clone()])
            }

            LayerKind::Softmax { axis } => {
                let input = single_input("Softmax", inputs)?;
                normalize_axis(*axis, input.len())?;
                Ok(vec![input.clone()])
            }

            LayerKind::BatchNormalization { axis, factor, .. } => {
                let input = single_input("BatchNormalization", inputs)?;
                let axis = normalize_axis(*axis, input.len())?;
                if input[axis] != factor.len() {
                    return Err(Error::InvalidGraph(format!(
                        "batch normalization over axis of size {} with {} parameters",
                        input[axis],
                        factor.len()
                    )));
                }
                Ok(vec![input.clone()])
            }

            LayerKind::Flatten => {
                let input = single_input("Flatten", inputs)?;
                Ok(vec![vec![input.iter().product()]])
            }

            LayerKind::Reshape { dimensions } => {
                let input = single_input("Reshape", inputs)?;
                let in_size: usize = input.iter().product();
                let out_size: usize = dimensions.iter().product();
                if in_size != out_size {
                    return Err(Error::InvalidGraph(format!(
                        "reshape from {input:?} ({in_size}) to {dimensions:?} ({out_size})"
                    )));
                }
                Ok(vec![dimensions.clone()])
            }

            LayerKind::Conv1D {
                stride,
                weights,
                padding,
                ..
            } => {
                let input = single_input("Conv1D", inputs)?;
                require_rank("Conv1D", input, 2)?;
                if input[1] != weights.dim(1) {
                    return Err(Error::InvalidGraph(format!(
                        "Conv1D input channels {} do not match weights {}",
                        input[1],
                        weights.dim(1)
                    )));
                }
                check_spatial("Conv1D", &[input[0], 1], [weights.dim(0), 1], *padding)?;
                Ok(vec![vec![
                    conv_output_extent(input[0], weights.dim(0), *stride, *padding),
                    weights.dim(2),
                ]])
            }

            LayerKind::Conv2D {
                strides,
                weights,
                padding,
                ..
            } => {
                let input = single_input("Conv2D", inputs)?;
                require_rank("Conv2D", input, 3)?;
                if input[2] != weights.dim(2) {
                    return Err(Error::InvalidGraph(format!(
                        "Conv2D input channels {} do not match weights {}",
                        input[2],
                        weights.dim(2)
                    )));
                }
                check_spatial("Conv2D", input, [weights.dim(0), weights.dim(1)], *padding)?;
                Ok(vec![vec![
                    conv_output_extent(input[0], weights.dim(0), strides[0], *padding),
                    conv_output_extent(input[1], weights.dim(1), strides[1], *padding),
                    weights.dim(3),
                ]])
            }

            LayerKind::SeparableConv2D {
                strides,
                depthwise_weights,
                pointwise_weights,
                padding,
                ..
            } => {
                let input = single_input("SeparableConv2D", inputs)?;
                require_rank("SeparableConv2D", input, 3)?;
                if input[2] != depthwise_weights.dim(2) {
                    return Err(Error::InvalidGraph(format!(
                        "SeparableConv2D input channels {} do not match depthwise weights {}",
                        input[2],
                        depthwise_weights.dim(2)
                    )));
                }
                if input[2] * depthwise_weights.dim(3) != pointwise_weights.dim(2) {
                    return Err(Error::InvalidGraph(
                        "SeparableConv2D pointwise weights do not match depthwise output".into(),
                    ));
                }
                check_spatial(
                    "SeparableConv2D",
                    input,
                    [depthwise_weights.dim(0), depthwise_weights.dim(1)],
                    *padding,
                )?;
                Ok(vec![vec![
                    conv_output_extent(input[0], depthwise_weights.dim(0), strides[0], *padding),
                    conv_output_extent(input[1], depthwise_weights.dim(1), strides[1], *padding),
                    pointwise_weights.dim(3),
                ]])
            }

            LayerKind::DepthwiseConv2D {
                strides,
                weights,
                padding,
                ..
            } => {
                let input = single_input("DepthwiseConv2D", inputs)?;
                require_rank("DepthwiseConv2D", input, 3)?;
                if input[2] != weights.dim(2) {
                    return Err(Error::InvalidGraph(format!(
                        "DepthwiseConv2D input channels {} do not match weights {}",
                        input[2],
                        weights.dim(2)
                    )));
                }
                check_spatial("DepthwiseConv2D", input, [weights.dim(0), weights.dim(1)], *padding)?;
                Ok(vec![vec![
                    conv_output_extent(input[0], weights.dim(0), strides[0], *padding),
                    conv_output_extent(input[1], weights.dim(1), strides[1], *padding),
                    input[2] * weights.dim(3),
                ]])
            }

            LayerKind::Pooling1D {
                padding,
                kernel_size,
                stride,
                ..
            } => {
                let input = single_input(self.name(), inputs)?;
                require_rank(self.name(), input, 2)?;
                check_spatial(self.name(), &[input[0], 1], [*kernel_size, 1], *padding)?;
                Ok(vec![vec![
                    conv_output_extent(input[0], *kernel_size, *stride, *padding),
                    input[1],
                ]])
            }

            LayerKind::Pooling2D {
                padding,
                kernel_size,
                strides,
                ..
            } => {
                let input = single_input(self.name(), inputs)?;
                require_rank(self.name(), input, 3)?;
                check_spatial(self.name(), input, *kernel_size, *padding)?;
                Ok(vec![vec![
                    conv_output_extent(input[0], kernel_size[0], strides[0], *padding),
                    conv_output_extent(input[1], kernel_size[1], strides[1], *padding),
                    input[2],
                ]])
            }

            LayerKind::GlobalPooling2D { .. } => {
                let input = single_input(self.name(), inputs)?;
                require_rank(self.name(), input, 3)?;
                Ok(vec![vec![input[2]]])
            }

            LayerKind::Cropping2D { cropping } => {
                let input = single_input("Cropping2D", inputs)?;
                require_rank("Cropping2D", input, 3)?;
                if cropping[TOP] + cropping[BOTTOM] >= input[0]
                    || cropping[LEFT] + cropping[RIGHT] >= input[1]
                {
                    return Err(Error::InvalidGraph(format!(
                        "cropping {cropping:?} leaves no data of input {input:?}"
                    )));
                }
                Ok(vec![vec![
                    input[0] - cropping[TOP] - cropping[BOTTOM],
                    input[1] - cropping[LEFT] - cropping[RIGHT],
                    input[2],
                ]])
            }

            LayerKind::UpSampling2D { size, .. } => {
                let input = single_input("UpSampling2D", inputs)?;
                require_rank("UpSampling2D", input, 3)?;
                if size[0] == 0 || size[1] == 0 {
                    return Err(Error::InvalidGraph("upsampling size must be non-zero".into()));
                }
                Ok(vec![vec![input[0] * size[0], input[1] * size[1], input[2]]])
            }

            LayerKind::ZeroPadding1D { padding } => {
                let input = single_input("ZeroPadding1D", inputs)?;
                require_rank("ZeroPadding1D", input, 2)?;
                Ok(vec![vec![input[0] + padding[0] + padding[1], input[1]]])
            }

            LayerKind::ZeroPadding2D { padding } => {
                let input = single_input("ZeroPadding2D", inputs)?;
                require_rank("ZeroPadding2D", input, 3)?;
                Ok(vec![vec![
                    input[0] + padding[TOP] + padding[BOTTOM],
                    input[1] + padding[LEFT] + padding[RIGHT],
                    input[2],
                ]])
            }

            LayerKind::Concatenate { axis } => {
                if inputs.len() < 2 {
                    return Err(Error::InvalidGraph(format!(
                        "Concatenate expects at least two input tensors, got {}",
                        inputs.len()
                    )));
                }
                let mut dims = inputs[0].clone();
                let axis = normalize_axis(*axis, dims.len())?;
                for other in &inputs[1..] {
                    if other.len() != dims.len() {
                        return Err(Error::InvalidGraph(format!(
                            "Concatenate inputs must have equal rank, got {:?} vs {:?}",
                            inputs[0], other
                        )));
                    }
                    for (j, (&d, &o)) in dims.iter().zip(other.iter()).enumerate() {
                        if j != axis && d != o {
                            return Err(Error::InvalidGraph(format!(
                                "Concatenate inputs differ on non-concatenated axis {j}: {d} vs {o}"
                            )));
                        }
                    }
                    dims[axis] += other[axis];
                }
                Ok(vec![dims])
            }

            LayerKind::Subtract => {
                if inputs.len() != 2 {
                    return Err(Error::InvalidGraph(format!(
                        "Subtract expects exactly two input tensors, got {}",
                        inputs.len()
                    )));
                }
                merge_inputs("Subtract", inputs)
            }

            LayerKind::Add | LayerKind::Multiply | LayerKind::Average | LayerKind::Maximum
            | LayerKind::Minimum => merge_inputs(self.name(), inputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv2d(kh: usize, kw: usize, ci: usize, co: usize, strides: [usize; 2], padding: PaddingType) -> LayerKind {
        LayerKind::Conv2D {
            strides,
            weights: Tensor::new(vec![kh, kw, ci, co]),
            biases: vec![0.0; co],
            has_biases: true,
            activation: ActivationId::Linear,
            padding,
        }
    }

    #[test]
    fn conv2d_valid_shape() {
        // 8x8x3 through a 3x3x3x16 kernel, stride 1: 6x6x16
        let kind = conv2d(3, 3, 3, 16, [1, 1], PaddingType::Valid);
        let out = kind.calc_output_dimensions(&[vec![8, 8, 3]]).unwrap();
        assert_eq!(out, vec![vec![6, 6, 16]]);
    }

    #[test]
    fn conv2d_same_shape_with_stride() {
        // ceil(7/2) = 4
        let kind = conv2d(3, 3, 3, 8, [2, 2], PaddingType::Same);
        let out = kind.calc_output_dimensions(&[vec![7, 7, 3]]).unwrap();
        assert_eq!(out, vec![vec![4, 4, 8]]);
    }

    #[test]
    fn conv2d_channel_mismatch_rejected() {
        let kind = conv2d(3, 3, 4, 8, [1, 1], PaddingType::Valid);
        assert!(matches!(
            kind.calc_output_dimensions(&[vec![8, 8, 3]]),
            Err(Error::InvalidGraph(_))
        ));
    }

    #[test]
    fn conv2d_kernel_larger_than_valid_input_rejected() {
        let kind = conv2d(5, 5, 1, 1, [1, 1], PaddingType::Valid);
        assert!(kind.calc_output_dimensions(&[vec![3, 3, 1]]).is_err());
    }

    #[test]
    fn depthwise_multiplies_channels() {
        let kind = LayerKind::DepthwiseConv2D {
            strides: [1, 1],
            weights: Tensor::new(vec![3, 3, 4, 2]),
            biases: vec![],
            has_biases: false,
            activation: ActivationId::Linear,
            padding: PaddingType::Same,
        };
        let out = kind.calc_output_dimensions(&[vec![8, 8, 4]]).unwrap();
        assert_eq!(out, vec![vec![8, 8, 8]]);
    }

    #[test]
    fn concatenate_sums_on_negative_axis() {
        let kind = LayerKind::Concatenate { axis: -1 };
        let out = kind
            .calc_output_dimensions(&[vec![2, 3], vec![2, 5]])
            .unwrap();
        assert_eq!(out, vec![vec![2, 8]]);
    }

    #[test]
    fn concatenate_rejects_mismatched_outer_axis() {
        let kind = LayerKind::Concatenate { axis: -1 };
        assert!(kind
            .calc_output_dimensions(&[vec![2, 3], vec![3, 5]])
            .is_err());
    }

    #[test]
    fn flatten_preserves_size() {
        let kind = LayerKind::Flatten;
        let out = kind.calc_output_dimensions(&[vec![4, 5, 6]]).unwrap();
        assert_eq!(out, vec![vec![120]]);
    }

    #[test]
    fn reshape_rejects_size_change() {
        let kind = LayerKind::Reshape {
            dimensions: vec![3, 5],
        };
        assert!(kind.calc_output_dimensions(&[vec![4, 4]]).is_err());
    }

    #[test]
    fn global_pooling_is_rank_one() {
        let kind = LayerKind::GlobalPooling2D {
            method: PoolingMethod::Average,
        };
        let out = kind.calc_output_dimensions(&[vec![6, 7, 12]]).unwrap();
        assert_eq!(out, vec![vec![12]]);
    }

    #[test]
    fn dense_on_non_flat_is_unsupported() {
        let kind = LayerKind::Dense {
            weights: Tensor::new(vec![12, 4]),
            biases: vec![0.0; 4],
            has_biases: true,
            activation: ActivationId::Linear,
        };
        assert!(matches!(
            kind.calc_output_dimensions(&[vec![3, 4]]),
            Err(Error::UnsupportedOption(_))
        ));
    }

    #[test]
    fn merge_rejects_shape_mismatch() {
        let kind = LayerKind::Add;
        assert!(kind
            .calc_output_dimensions(&[vec![2, 2], vec![2, 3]])
            .is_err());
    }

    #[test]
    fn pooling_shape_laws() {
        let kind = LayerKind::Pooling2D {
            method: PoolingMethod::Max,
            padding: PaddingType::Valid,
            kernel_size: [2, 2],
            strides: [2, 2],
        };
        let out = kind.calc_output_dimensions(&[vec![8, 8, 3]]).unwrap();
        assert_eq!(out, vec![vec![4, 4, 3]]);

        let kind = LayerKind::Pooling2D {
            method: PoolingMethod::Average,
            padding: PaddingType::Same,
            kernel_size: [3, 3],
            strides: [2, 2],
        };
        let out = kind.calc_output_dimensions(&[vec![7, 7, 3]]).unwrap();
        assert_eq!(out, vec![vec![4, 4, 3]]);
    }
}

//! Reference interpreter.
//!
//! A straightforward scalar walk over the same graph the compiler consumes,
//! used as the oracle in tests and the check harness. Slow and correct; the
//! semantics here (padding partition, pooling border behaviour, activation
//! constants) are the contract the emitted code is tested against.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::{
    normalize_axis, ActivationId, InterpolationMethod, LayerKind, Model, NodeRef, PaddingType,
    PoolingMethod, TensorLocation, LEFT, TOP,
};
use crate::tensor::Tensor;

const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701;

fn apply_activation(id: ActivationId, x: f32) -> f32 {
    match id {
        ActivationId::Linear => x,
        ActivationId::Relu => x.max(0.0),
        ActivationId::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        ActivationId::TanH => x.tanh(),
        ActivationId::HardSigmoid => (0.2 * x + 0.5).clamp(0.0, 1.0),
        ActivationId::Elu => {
            if x < 0.0 {
                x.exp() - 1.0
            } else {
                x
            }
        }
        ActivationId::Selu => {
            if x < 0.0 {
                SELU_SCALE * SELU_ALPHA * (x.exp() - 1.0)
            } else {
                SELU_SCALE * x
            }
        }
        ActivationId::Exponential => x.exp(),
        ActivationId::Softsign => x / (1.0 + x.abs()),
        ActivationId::Softmax => unreachable!("softmax is applied per axis"),
    }
}

fn apply_activation_tensor(id: ActivationId, dims: &[usize], data: &mut [f32]) {
    if id == ActivationId::Softmax {
        softmax_axis(dims, data, dims.len() - 1);
    } else {
        for v in data.iter_mut() {
            *v = apply_activation(id, *v);
        }
    }
}

fn softmax_axis(dims: &[usize], data: &mut [f32], axis: usize) {
    let axis_len = dims[axis];
    let inner: usize = dims[axis + 1..].iter().product();
    let outer: usize = dims[..axis].iter().product();
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| (o * axis_len + j) * inner + i;
            let mut max = f32::NEG_INFINITY;
            for j in 0..axis_len {
                max = max.max(data[at(j)]);
            }
            let mut sum = 0.0;
            for j in 0..axis_len {
                let e = (data[at(j)] - max).exp();
                data[at(j)] = e;
                sum += e;
            }
            for j in 0..axis_len {
                data[at(j)] /= sum;
            }
        }
    }
}

/// Symmetric padding split with the odd element at the far edge.
fn split_padding(total: usize) -> (usize, usize) {
    (total / 2, total - total / 2)
}

fn conv_padding(
    padding: PaddingType,
    input: usize,
    kernel: usize,
    stride: usize,
    output: usize,
) -> (usize, usize) {
    match padding {
        PaddingType::Valid => (0, 0),
        PaddingType::Same => split_padding(((output - 1) * stride + kernel).saturating_sub(input)),
    }
}

fn conv2d(
    input: &Tensor,
    weights: &Tensor, // [kh, kw, ci, co]
    biases: Option<&[f32]>,
    strides: [usize; 2],
    padding: PaddingType,
    out_dims: &[usize],
) -> Tensor {
    let (h, w, ci) = (input.dim(0), input.dim(1), input.dim(2));
    let (kh, kw, co) = (weights.dim(0), weights.dim(1), weights.dim(3));
    let (oh, ow) = (out_dims[0], out_dims[1]);
    let (pt, _) = conv_padding(padding, h, kh, strides[0], oh);
    let (pl, _) = conv_padding(padding, w, kw, strides[1], ow);

    let mut out = Tensor::new(out_dims.to_vec());
    for oy in 0..oh {
        for ox in 0..ow {
            for oc in 0..co {
                let mut sum = biases.map_or(0.0, |b| b[oc]);
                for ky in 0..kh {
                    for kx in 0..kw {
                        let iy = (oy * strides[0] + ky) as isize - pt as isize;
                        let ix = (ox * strides[1] + kx) as isize - pl as isize;
                        if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= w {
                            continue;
                        }
                        for ic in 0..ci {
                            sum += input.at(&[iy as usize, ix as usize, ic])
                                * weights.at(&[ky, kx, ic, oc]);
                        }
                    }
                }
                out.set(&[oy, ox, oc], sum);
            }
        }
    }
    out
}

fn depthwise_conv2d(
    input: &Tensor,
    weights: &Tensor, // [kh, kw, ci, multiplier]
    biases: Option<&[f32]>,
    strides: [usize; 2],
    padding: PaddingType,
    out_dims: &[usize],
) -> Tensor {
    let (h, w, ci) = (input.dim(0), input.dim(1), input.dim(2));
    let (kh, kw, dm) = (weights.dim(0), weights.dim(1), weights.dim(3));
    let (oh, ow) = (out_dims[0], out_dims[1]);
    let (pt, _) = conv_padding(padding, h, kh, strides[0], oh);
    let (pl, _) = conv_padding(padding, w, kw, strides[1], ow);

    let mut out = Tensor::new(out_dims.to_vec());
    for oy in 0..oh {
        for ox in 0..ow {
            for ic in 0..ci {
                for m in 0..dm {
                    let oc = ic * dm + m;
                    let mut sum = biases.map_or(0.0, |b| b[oc]);
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = (oy * strides[0] + ky) as isize - pt as isize;
                            let ix = (ox * strides[1] + kx) as isize - pl as isize;
                            if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= w {
                                continue;
                            }
                            sum += input.at(&[iy as usize, ix as usize, ic])
                                * weights.at(&[ky, kx, ic, m]);
                        }
                    }
                    out.set(&[oy, ox, oc], sum);
                }
            }
        }
    }
    out
}

fn pooling2d(
    input: &Tensor,
    method: PoolingMethod,
    padding: PaddingType,
    kernel: [usize; 2],
    strides: [usize; 2],
    out_dims: &[usize],
) -> Tensor {
    let (h, w, c) = (input.dim(0), input.dim(1), input.dim(2));
    let (oh, ow) = (out_dims[0], out_dims[1]);
    let (pt, _) = conv_padding(padding, h, kernel[0], strides[0], oh);
    let (pl, _) = conv_padding(padding, w, kernel[1], strides[1], ow);

    let mut out = Tensor::new(out_dims.to_vec());
    for oy in 0..oh {
        for ox in 0..ow {
            for ch in 0..c {
                let mut acc: Option<f32> = None;
                let mut count = 0usize;
                let mut clipped = false;
                for ky in 0..kernel[0] {
                    for kx in 0..kernel[1] {
                        let iy = (oy * strides[0] + ky) as isize - pt as isize;
                        let ix = (ox * strides[1] + kx) as isize - pl as isize;
                        if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= w {
                            clipped = true;
                            continue;
                        }
                        let v = input.at(&[iy as usize, ix as usize, ch]);
                        count += 1;
                        acc = Some(match (acc, method) {
                            (None, _) => v,
                            (Some(a), PoolingMethod::Max) => a.max(v),
                            (Some(a), PoolingMethod::Average) => a + v,
                        });
                    }
                }
                let value = match method {
                    // Clipped footprints behave like zero padding.
                    PoolingMethod::Max => {
                        let a = acc.unwrap_or(0.0);
                        if clipped {
                            a.max(0.0)
                        } else {
                            a
                        }
                    }
                    PoolingMethod::Average => acc.unwrap_or(0.0) / count.max(1) as f32,
                };
                out.set(&[oy, ox, ch], value);
            }
        }
    }
    out
}

fn upsampling_taps(src: usize, scale: usize, limit: usize) -> (usize, usize, f32) {
    let pos = src as f32 / scale as f32;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(limit - 1);
    (lo, hi, pos - lo as f32)
}

/// Evaluates a single node given its input tensors.
pub fn apply_node(kind: &LayerKind, inputs: &[&Tensor], out_dims: &[Vec<usize>]) -> Result<Vec<Tensor>> {
    let result = match kind {
        LayerKind::Input { .. } => vec![inputs
            .first()
            .map(|t| (*t).clone())
            .unwrap_or_else(|| Tensor::new(out_dims[0].clone()))],

        LayerKind::Dense {
            weights,
            biases,
            has_biases,
            activation,
        } => {
            let x = inputs[0];
            let (n, units) = (weights.dim(0), weights.dim(1));
            let mut out = Tensor::new(vec![units]);
            for o in 0..units {
                let mut sum = if *has_biases { biases[o] } else { 0.0 };
                for i in 0..n {
                    sum += x.data()[i] * weights.at(&[i, o]);
                }
                out.data_mut()[o] = sum;
            }
            apply_activation_tensor(*activation, &[units], out.data_mut());
            vec![out]
        }

        LayerKind::Activation { activation } => {
            let mut out = inputs[0].clone();
            let dims = out.dims().to_vec();
            apply_activation_tensor(*activation, &dims, out.data_mut());
            vec![out]
        }

        LayerKind::Dropout => vec![inputs[0].clone()],

        LayerKind::Flatten => {
            let mut out = inputs[0].clone();
            out.reshape(vec![inputs[0].size()]);
            vec![out]
        }

        LayerKind::Reshape { dimensions } => {
            let mut out = inputs[0].clone();
            out.reshape(dimensions.clone());
            vec![out]
        }

        LayerKind::Conv1D {
            stride,
            weights,
            biases,
            has_biases,
            activation,
            padding,
        } => {
            // Lift to 2-D with a unit height axis.
            let x = inputs[0];
            let mut lifted = x.clone();
            lifted.reshape(vec![1, x.dim(0), x.dim(1)]);
            let mut w2 = weights.clone();
            w2.reshape(vec![1, weights.dim(0), weights.dim(1), weights.dim(2)]);
            let out3 = vec![1, out_dims[0][0], out_dims[0][1]];
            let mut out = conv2d(
                &lifted,
                &w2,
                if *has_biases { Some(biases) } else { None },
                [1, *stride],
                *padding,
                &out3,
            );
            out.reshape(out_dims[0].clone());
            apply_activation_tensor(*activation, &out_dims[0], out.data_mut());
            vec![out]
        }

        LayerKind::Conv2D {
            strides,
            weights,
            biases,
            has_biases,
            activation,
            padding,
        } => {
            let mut out = conv2d(
                inputs[0],
                weights,
                if *has_biases { Some(biases) } else { None },
                *strides,
                *padding,
                &out_dims[0],
            );
            apply_activation_tensor(*activation, &out_dims[0], out.data_mut());
            vec![out]
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
            let inner_dims = vec![
                out_dims[0][0],
                out_dims[0][1],
                inputs[0].dim(2) * depthwise_weights.dim(3),
            ];
            let inner = depthwise_conv2d(
                inputs[0],
                depthwise_weights,
                None,
                *strides,
                *padding,
                &inner_dims,
            );
            let mut out = conv2d(
                &inner,
                pointwise_weights,
                if *has_biases { Some(biases) } else { None },
                [1, 1],
                PaddingType::Valid,
                &out_dims[0],
            );
            apply_activation_tensor(*activation, &out_dims[0], out.data_mut());
            vec![out]
        }

        LayerKind::DepthwiseConv2D {
            strides,
            weights,
            biases,
            has_biases,
            activation,
            padding,
        } => {
            let mut out = depthwise_conv2d(
                inputs[0],
                weights,
                if *has_biases { Some(biases) } else { None },
                *strides,
                *padding,
                &out_dims[0],
            );
            apply_activation_tensor(*activation, &out_dims[0], out.data_mut());
            vec![out]
        }

        LayerKind::Pooling1D {
            method,
            padding,
            kernel_size,
            stride,
        } => {
            let x = inputs[0];
            let mut lifted = x.clone();
            lifted.reshape(vec![1, x.dim(0), x.dim(1)]);
            let out3 = vec![1, out_dims[0][0], out_dims[0][1]];
            let mut out = pooling2d(
                &lifted,
                *method,
                *padding,
                [1, *kernel_size],
                [1, *stride],
                &out3,
            );
            out.reshape(out_dims[0].clone());
            vec![out]
        }

        LayerKind::Pooling2D {
            method,
            padding,
            kernel_size,
            strides,
        } => vec![pooling2d(
            inputs[0],
            *method,
            *padding,
            *kernel_size,
            *strides,
            &out_dims[0],
        )],

        LayerKind::GlobalPooling2D { method } => {
            let x = inputs[0];
            let (h, w, c) = (x.dim(0), x.dim(1), x.dim(2));
            let mut out = Tensor::new(vec![c]);
            for ch in 0..c {
                let mut acc: Option<f32> = None;
                for y in 0..h {
                    for xx in 0..w {
                        let v = x.at(&[y, xx, ch]);
                        acc = Some(match (acc, method) {
                            (None, _) => v,
                            (Some(a), PoolingMethod::Max) => a.max(v),
                            (Some(a), PoolingMethod::Average) => a + v,
                        });
                    }
                }
                let value = match method {
                    PoolingMethod::Max => acc.unwrap_or(0.0),
                    PoolingMethod::Average => acc.unwrap_or(0.0) / (h * w) as f32,
                };
                out.data_mut()[ch] = value;
            }
            vec![out]
        }

        LayerKind::BatchNormalization {
            axis,
            factor,
            offset,
        } => {
            let mut out = inputs[0].clone();
            let dims = out.dims().to_vec();
            let axis = normalize_axis(*axis, dims.len())?;
            let inner: usize = dims[axis + 1..].iter().product();
            let axis_len = dims[axis];
            for (i, v) in out.data_mut().iter_mut().enumerate() {
                let ch = (i / inner) % axis_len;
                *v = *v * factor[ch] + offset[ch];
            }
            vec![out]
        }

        LayerKind::Cropping2D { cropping } => {
            let x = inputs[0];
            let mut out = Tensor::new(out_dims[0].clone());
            let (oh, ow, c) = (out.dim(0), out.dim(1), out.dim(2));
            for y in 0..oh {
                for xx in 0..ow {
                    for ch in 0..c {
                        out.set(
                            &[y, xx, ch],
                            x.at(&[y + cropping[TOP], xx + cropping[LEFT], ch]),
                        );
                    }
                }
            }
            vec![out]
        }

        LayerKind::UpSampling2D {
            size,
            interpolation,
        } => {
            let x = inputs[0];
            let (h, w, c) = (x.dim(0), x.dim(1), x.dim(2));
            let mut out = Tensor::new(out_dims[0].clone());
            let (oh, ow) = (out.dim(0), out.dim(1));
            for oy in 0..oh {
                for ox in 0..ow {
                    for ch in 0..c {
                        let value = match interpolation {
                            InterpolationMethod::Nearest => {
                                x.at(&[oy / size[0], ox / size[1], ch])
                            }
                            InterpolationMethod::Bilinear => {
                                let (y0, y1, fy) = upsampling_taps(oy, size[0], h);
                                let (x0, x1, fx) = upsampling_taps(ox, size[1], w);
                                x.at(&[y0, x0, ch]) * (1.0 - fy) * (1.0 - fx)
                                    + x.at(&[y0, x1, ch]) * (1.0 - fy) * fx
                                    + x.at(&[y1, x0, ch]) * fy * (1.0 - fx)
                                    + x.at(&[y1, x1, ch]) * fy * fx
                            }
                        };
                        out.set(&[oy, ox, ch], value);
                    }
                }
            }
            vec![out]
        }

        LayerKind::ZeroPadding1D { padding } => {
            let x = inputs[0];
            let (w, c) = (x.dim(0), x.dim(1));
            let mut out = Tensor::new(out_dims[0].clone());
            for xx in 0..w {
                for ch in 0..c {
                    out.set(&[xx + padding[0], ch], x.at(&[xx, ch]));
                }
            }
            vec![out]
        }

        LayerKind::ZeroPadding2D { padding } => {
            let x = inputs[0];
            let (h, w, c) = (x.dim(0), x.dim(1), x.dim(2));
            let mut out = Tensor::new(out_dims[0].clone());
            for y in 0..h {
                for xx in 0..w {
                    for ch in 0..c {
                        out.set(&[y + padding[TOP], xx + padding[LEFT], ch], x.at(&[y, xx, ch]));
                    }
                }
            }
            vec![out]
        }

        LayerKind::Concatenate { axis } => {
            let dims = out_dims[0].clone();
            let axis = normalize_axis(*axis, dims.len())?;
            let inner: usize = dims[axis + 1..].iter().product();
            let outer: usize = dims[..axis].iter().product();
            let mut out = Tensor::new(dims.clone());
            for o in 0..outer {
                let mut base = 0usize;
                for x in inputs {
                    let chunk = x.dim(axis) * inner;
                    let src = &x.data()[o * chunk..(o + 1) * chunk];
                    let dst_start = (o * dims[axis] + base) * inner;
                    out.data_mut()[dst_start..dst_start + chunk].copy_from_slice(src);
                    base += x.dim(axis);
                }
            }
            vec![out]
        }

        LayerKind::Add
        | LayerKind::Subtract
        | LayerKind::Multiply
        | LayerKind::Average
        | LayerKind::Maximum
        | LayerKind::Minimum => {
            let mut out = inputs[0].clone();
            for x in &inputs[1..] {
                for (o, v) in out.data_mut().iter_mut().zip(x.data()) {
                    *o = match kind {
                        LayerKind::Add | LayerKind::Average => *o + v,
                        LayerKind::Subtract => *o - v,
                        LayerKind::Multiply => *o * v,
                        LayerKind::Maximum => o.max(*v),
                        LayerKind::Minimum => o.min(*v),
                        _ => unreachable!(),
                    };
                }
            }
            if matches!(kind, LayerKind::Average) {
                let n = inputs.len() as f32;
                for v in out.data_mut().iter_mut() {
                    *v /= n;
                }
            }
            vec![out]
        }

        LayerKind::Relu {
            max_value,
            negative_slope,
            threshold,
        } => {
            let mut out = inputs[0].clone();
            for v in out.data_mut().iter_mut() {
                let x = *v;
                *v = if x > *threshold {
                    x.min(*max_value)
                } else {
                    negative_slope * (x - threshold)
                };
            }
            vec![out]
        }

        LayerKind::LeakyRelu { alpha } => {
            let mut out = inputs[0].clone();
            for v in out.data_mut().iter_mut() {
                if *v < 0.0 {
                    *v *= alpha;
                }
            }
            vec![out]
        }

        LayerKind::Elu { alpha } => {
            let mut out = inputs[0].clone();
            for v in out.data_mut().iter_mut() {
                if *v < 0.0 {
                    *v = alpha * (v.exp() - 1.0);
                }
            }
            vec![out]
        }

        LayerKind::ThresholdedRelu { theta } => {
            let mut out = inputs[0].clone();
            for v in out.data_mut().iter_mut() {
                if *v <= *theta {
                    *v = 0.0;
                }
            }
            vec![out]
        }

        LayerKind::Softmax { axis } => {
            let mut out = inputs[0].clone();
            let dims = out.dims().to_vec();
            let axis = normalize_axis(*axis, dims.len())?;
            softmax_axis(&dims, out.data_mut(), axis);
            vec![out]
        }
    };
    Ok(result)
}

/// Runs the whole model, optionally reporting every evaluated node.
pub fn apply_with_callback(
    model: &Model,
    inputs: &[Tensor],
    mut callback: Option<&mut dyn FnMut(NodeRef, &[&Tensor], &[Tensor])>,
) -> Result<Vec<Tensor>> {
    if inputs.len() != model.inputs.len() {
        return Err(Error::InvalidGraph(format!(
            "expected {} inputs, got {}",
            model.inputs.len(),
            inputs.len()
        )));
    }
    let order = model.topological_order()?;
    let mut values: HashMap<TensorLocation, Tensor> = HashMap::new();

    for &node in &order {
        let n = model.node(node);
        let kind = &model.layers[node.layer].kind;

        if let LayerKind::Input { .. } = kind {
            let loc = TensorLocation::new(node.layer, node.node_index, 0);
            let index = model
                .inputs
                .iter()
                .position(|&l| l == loc)
                .ok_or_else(|| Error::InvalidGraph("input node is not a model input".into()))?;
            values.insert(loc, inputs[index].clone());
            continue;
        }

        let node_inputs: Vec<&Tensor> = n
            .inputs
            .iter()
            .map(|loc| {
                values
                    .get(loc)
                    .ok_or_else(|| Error::InvalidGraph("input evaluated out of order".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = apply_node(kind, &node_inputs, &n.output_dimensions)?;
        if let Some(cb) = callback.as_deref_mut() {
            cb(node, &node_inputs, &outputs);
        }
        for (t, tensor) in outputs.into_iter().enumerate() {
            values.insert(TensorLocation::new(node.layer, node.node_index, t), tensor);
        }
    }

    model
        .outputs
        .iter()
        .map(|loc| {
            values
                .get(loc)
                .cloned()
                .ok_or_else(|| Error::InvalidGraph("model output was never produced".into()))
        })
        .collect()
}

/// Runs the whole model on the given inputs.
pub fn apply(model: &Model, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
    apply_with_callback(model, inputs, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn dense_identity() {
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
        let input = Tensor::from_vec(vec![4], vec![1.0, 2.0, 3.0, 4.0]);
        let out = apply_node(&kind, &[&input], &[vec![4]]).unwrap();
        assert_eq!(out[0].data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn same_padding_conv_top_left_tap() {
        // A 1x1 input through an all-ones 3x3 kernel touches one tap.
        let kind = LayerKind::Conv2D {
            strides: [1, 1],
            weights: Tensor::from_vec(vec![3, 3, 1, 1], vec![1.0; 9]),
            biases: vec![0.0],
            has_biases: true,
            activation: ActivationId::Linear,
            padding: PaddingType::Same,
        };
        let input = Tensor::from_vec(vec![1, 1, 1], vec![5.0]);
        let out = apply_node(&kind, &[&input], &[vec![1, 1, 1]]).unwrap();
        assert_eq!(out[0].data(), &[5.0]);
    }

    #[test]
    fn average_pool_2x2() {
        let kind = LayerKind::Pooling2D {
            method: PoolingMethod::Average,
            padding: PaddingType::Valid,
            kernel_size: [2, 2],
            strides: [2, 2],
        };
        let input = Tensor::from_vec(vec![2, 2, 1], vec![1.0, 2.0, 3.0, 4.0]);
        let out = apply_node(&kind, &[&input], &[vec![1, 1, 1]]).unwrap();
        assert_eq!(out[0].data(), &[2.5]);
    }

    #[test]
    fn softmax_sums_to_one_with_exp_ratios() {
        let kind = LayerKind::Softmax { axis: -1 };
        let input = Tensor::from_vec(vec![3], vec![1.0, 2.0, 3.0]);
        let out = apply_node(&kind, &[&input], &[vec![3]]).unwrap();
        let sum: f32 = out[0].data().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        let ratio = out[0].data()[1] / out[0].data()[0];
        assert!((ratio - 1.0f32.exp()).abs() < 1e-5);
    }

    #[test]
    fn concatenate_on_last_axis() {
        let kind = LayerKind::Concatenate { axis: -1 };
        let a = Tensor::from_vec(vec![1, 2], vec![1.0, 2.0]);
        let b = Tensor::from_vec(vec![1, 3], vec![3.0, 4.0, 5.0]);
        let out = apply_node(&kind, &[&a, &b], &[vec![1, 5]]).unwrap();
        assert_eq!(out[0].data(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn max_pool_clipped_border_folds_zero() {
        // 2x2 same pooling over a 1x1 negative input: the padded cells
        // behave like zeros.
        let kind = LayerKind::Pooling2D {
            method: PoolingMethod::Max,
            padding: PaddingType::Same,
            kernel_size: [2, 2],
            strides: [1, 1],
        };
        let input = Tensor::from_vec(vec![1, 1, 1], vec![-3.0]);
        let out = apply_node(&kind, &[&input], &[vec![1, 1, 1]]).unwrap();
        assert_eq!(out[0].data(), &[0.0]);
    }
}

//! Candle network built from a [`NetworkTopology`]
//!
//! Layers run in order on a channels-first tensor. Outputs that a later
//! `Add` reads are kept aside; everything else is dropped as soon as the
//! next layer has consumed it.

use crate::topology::{
    conv_padding, ActivationKind, FeatureShape, Interpolation, LayerSpec, NetworkTopology,
    Padding, SpatialPadding,
};
use candle_core::{Device, Tensor};
use candle_nn::{
    BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, Module, ModuleT, VarBuilder,
};
use leafscan_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

enum Layer {
    Identity,
    Rescale { scale: f64, offset: f64 },
    Resize { rows: AxisResize, cols: AxisResize },
    Pad(SpatialPadding),
    Conv {
        conv: Conv2d,
        /// Set when "same" padding is uneven and cannot go through the kernel
        pad: Option<SpatialPadding>,
        activation: ActivationKind,
    },
    BatchNorm(BatchNorm),
    Relu { max_value: Option<f64> },
    Activation(ActivationKind),
    MaxPool { pool: usize, stride: usize },
    GlobalAveragePool,
    Flatten,
    Dense { linear: Linear, activation: ActivationKind },
    Add { sources: Vec<usize> },
}

/// Source rows (or columns) and blend weights for resizing one axis
struct AxisResize {
    dim: usize,
    lower: Tensor,
    upper: Tensor,
    /// Weight of `upper`, shaped to broadcast along `dim`; absent for nearest
    lerp: Option<Tensor>,
}

impl AxisResize {
    /// Half-pixel sampling positions, as TensorFlow's resize computes them
    fn new(
        input: usize,
        output: usize,
        dim: usize,
        interpolation: Interpolation,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let scale = input as f64 / output as f64;
        let last = input - 1;
        let mut lower = Vec::with_capacity(output);
        let mut upper = Vec::with_capacity(output);
        let mut lerp = Vec::with_capacity(output);

        for out in 0..output {
            let center = (out as f64 + 0.5) * scale;
            match interpolation {
                Interpolation::Nearest => {
                    let index = (center.floor() as usize).min(last);
                    lower.push(index as u32);
                }
                Interpolation::Bilinear => {
                    let source = center - 0.5;
                    let floor = source.floor();
                    lower.push((floor.max(0.0) as usize).min(last) as u32);
                    upper.push(((floor + 1.0).max(0.0) as usize).min(last) as u32);
                    lerp.push((source - floor) as f32);
                }
            }
        }

        let mut shape = vec![1usize; 4];
        shape[dim] = output;
        let lerp = match interpolation {
            Interpolation::Nearest => None,
            Interpolation::Bilinear => Some(Tensor::from_vec(lerp, shape, device)?),
        };
        let upper = if upper.is_empty() {
            lower.clone()
        } else {
            upper
        };

        Ok(Self {
            dim,
            lower: Tensor::new(lower.as_slice(), device)?,
            upper: Tensor::new(upper.as_slice(), device)?,
            lerp,
        })
    }

    fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let lower = x.index_select(&self.lower, self.dim)?;
        let Some(lerp) = &self.lerp else {
            return Ok(lower);
        };
        let upper = x.index_select(&self.upper, self.dim)?;
        lower.add(&(upper - &lower)?.broadcast_mul(lerp)?)
    }
}

/// An image classifier ready for inference.
///
/// Input is NHWC, as produced by the preprocessor; the network permutes to
/// channels-first internally.
pub struct Network {
    name: String,
    layers: Vec<Layer>,
    /// Positions whose outputs a later `Add` reads
    kept_outputs: HashSet<usize>,
    input_shape: (usize, usize, usize),
    num_outputs: usize,
    softmax_output: bool,
    device: Device,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("layers", &self.layers.len())
            .field("input_shape", &self.input_shape)
            .field("num_outputs", &self.num_outputs)
            .finish()
    }
}

fn build_error(layer: &str, e: candle_core::Error) -> Error {
    Error::model(format!("Failed to load weights for layer '{}': {}", layer, e))
}

/// Kernel padding for a convolution, or the explicit padding to apply first
fn conv_config(
    layer: &str,
    padding: Padding,
    kernel: usize,
    stride: usize,
    input: FeatureShape,
) -> Result<(Conv2dConfig, Option<SpatialPadding>)> {
    let (_, height, width) = input.spatial(layer)?;
    let pad = conv_padding(padding, kernel, stride, height, width);
    let cfg = Conv2dConfig {
        padding: pad.uniform().unwrap_or(0),
        stride,
        ..Default::default()
    };
    Ok((cfg, pad.uniform().is_none().then_some(pad)))
}

fn zero_pad(x: &Tensor, pad: &SpatialPadding) -> candle_core::Result<Tensor> {
    x.pad_with_zeros(2, pad.top, pad.bottom)?
        .pad_with_zeros(3, pad.left, pad.right)
}

impl Network {
    /// Build a network, pulling every parameter tensor from `vb`
    pub fn build(topology: &NetworkTopology, vb: VarBuilder) -> Result<Self> {
        let plans = topology.plan()?;
        let input_shape = topology.input_shape()?;
        let num_outputs = topology.output_units()?;
        let device = vb.device().clone();

        let mut layers = Vec::with_capacity(plans.len());
        let mut kept_outputs = HashSet::new();
        for (position, plan) in plans.iter().enumerate() {
            let name = plan.name.as_str();
            let lvb = vb.pp(name);

            let layer = match plan.spec {
                LayerSpec::InputLayer(_) | LayerSpec::Dropout(_) => Layer::Identity,
                LayerSpec::Rescaling(c) => Layer::Rescale {
                    scale: c.scale,
                    offset: c.offset,
                },
                LayerSpec::Resizing(c) => {
                    let (_, height, width) = plan.input.spatial(name)?;
                    let axis = |input, output, dim| {
                        AxisResize::new(input, output, dim, c.interpolation, &device)
                            .map_err(|e| build_error(name, e))
                    };
                    Layer::Resize {
                        rows: axis(height, c.height, 2)?,
                        cols: axis(width, c.width, 3)?,
                    }
                }
                LayerSpec::ZeroPadding2D(c) => {
                    let [[top, bottom], [left, right]] = c.padding;
                    Layer::Pad(SpatialPadding {
                        top,
                        bottom,
                        left,
                        right,
                    })
                }
                LayerSpec::Conv2D(c) => {
                    let kernel = c.kernel_size[0];
                    let (cfg, pad) =
                        conv_config(name, c.padding, kernel, c.strides[0], plan.input)?;
                    let in_channels = plan.input.features();
                    let conv = if c.use_bias {
                        candle_nn::conv2d(in_channels, c.filters, kernel, cfg, lvb)
                    } else {
                        candle_nn::conv2d_no_bias(in_channels, c.filters, kernel, cfg, lvb)
                    }
                    .map_err(|e| build_error(name, e))?;
                    Layer::Conv {
                        conv,
                        pad,
                        activation: c.activation,
                    }
                }
                LayerSpec::DepthwiseConv2D(c) => {
                    let kernel = c.kernel_size[0];
                    let in_channels = plan.input.features();
                    let (cfg, pad) =
                        conv_config(name, c.padding, kernel, c.strides[0], plan.input)?;
                    let cfg = Conv2dConfig {
                        groups: in_channels,
                        ..cfg
                    };
                    let out_channels = plan.output.features();
                    let conv = if c.use_bias {
                        candle_nn::conv2d(in_channels, out_channels, kernel, cfg, lvb)
                    } else {
                        candle_nn::conv2d_no_bias(in_channels, out_channels, kernel, cfg, lvb)
                    }
                    .map_err(|e| build_error(name, e))?;
                    Layer::Conv {
                        conv,
                        pad,
                        activation: c.activation,
                    }
                }
                LayerSpec::BatchNormalization(c) => {
                    let cfg = BatchNormConfig {
                        eps: c.epsilon,
                        ..Default::default()
                    };
                    let bn = candle_nn::batch_norm(plan.input.features(), cfg, lvb)
                        .map_err(|e| build_error(name, e))?;
                    Layer::BatchNorm(bn)
                }
                LayerSpec::ReLU(c) => Layer::Relu {
                    max_value: c.max_value,
                },
                LayerSpec::Activation(c) => Layer::Activation(c.activation),
                LayerSpec::MaxPooling2D(c) => Layer::MaxPool {
                    pool: c.pool_size[0],
                    stride: c.strides.unwrap_or(c.pool_size)[0],
                },
                LayerSpec::GlobalAveragePooling2D(_) => Layer::GlobalAveragePool,
                LayerSpec::Flatten(_) => Layer::Flatten,
                LayerSpec::Dense(c) => {
                    let in_features = plan.input.features();
                    let linear = if c.use_bias {
                        candle_nn::linear(in_features, c.units, lvb)
                    } else {
                        candle_nn::linear_no_bias(in_features, c.units, lvb)
                    }
                    .map_err(|e| build_error(name, e))?;
                    Layer::Dense {
                        linear,
                        activation: c.activation,
                    }
                }
                LayerSpec::Add(_) => {
                    kept_outputs.extend(
                        plan.sources
                            .iter()
                            .copied()
                            .filter(|&source| source + 1 != position),
                    );
                    Layer::Add {
                        sources: plan.sources.clone(),
                    }
                }
            };
            layers.push(layer);
        }

        debug!(
            network = %topology.name,
            layers = layers.len(),
            kept_outputs = kept_outputs.len(),
            outputs = num_outputs,
            "Built network"
        );

        Ok(Self {
            name: topology.name.clone(),
            layers,
            kept_outputs,
            input_shape,
            num_outputs,
            softmax_output: topology.ends_with_softmax(),
            device,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `(height, width, channels)` the network accepts
    pub fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Whether the output is already a probability distribution
    pub fn ends_with_softmax(&self) -> bool {
        self.softmax_output
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run a forward pass on an NHWC batch, returning `(batch, num_outputs)`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (height, width, channels) = self.input_shape;
        match input.dims() {
            [_, h, w, c] if (*h, *w, *c) == (height, width, channels) => {}
            dims => {
                return Err(Error::inference(format!(
                    "input shape {:?} does not match network input ({}, {}, {})",
                    dims, height, width, channels
                )))
            }
        }

        self.forward_inner(input)
            .map_err(|e| Error::inference(format!("Forward pass failed: {}", e)))
    }

    fn forward_inner(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = input
            .to_device(&self.device)?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let mut kept: HashMap<usize, Tensor> = HashMap::with_capacity(self.kept_outputs.len());

        for (position, layer) in self.layers.iter().enumerate() {
            x = match layer {
                Layer::Identity => x,
                Layer::Rescale { scale, offset } => x.affine(*scale, *offset)?,
                Layer::Resize { rows, cols } => cols.apply(&rows.apply(&x)?)?,
                Layer::Pad(pad) => zero_pad(&x, pad)?,
                Layer::Conv {
                    conv,
                    pad,
                    activation,
                } => {
                    let conv_out = match pad {
                        Some(pad) => conv.forward(&zero_pad(&x, pad)?)?,
                        None => conv.forward(&x)?,
                    };
                    activate(&conv_out, *activation)?
                }
                Layer::BatchNorm(bn) => bn.forward_t(&x, false)?,
                Layer::Relu { max_value } => match max_value {
                    Some(max) => x.relu()?.clamp(0f32, *max as f32)?,
                    None => x.relu()?,
                },
                Layer::Activation(kind) => activate(&x, *kind)?,
                Layer::MaxPool { pool, stride } => {
                    x.max_pool2d_with_stride((*pool, *pool), (*stride, *stride))?
                }
                Layer::GlobalAveragePool => x.mean((2, 3))?,
                Layer::Flatten => x.flatten_from(1)?,
                Layer::Dense { linear, activation } => {
                    activate(&linear.forward(&x)?, *activation)?
                }
                Layer::Add { sources } => {
                    let mut sum: Option<Tensor> = None;
                    for &source in sources {
                        let term = if source + 1 == position {
                            &x
                        } else {
                            kept.get(&source).ok_or_else(|| {
                                candle_core::Error::Msg(format!(
                                    "output of layer {} was not kept",
                                    source
                                ))
                            })?
                        };
                        sum = Some(match sum {
                            Some(total) => total.add(term)?,
                            None => term.clone(),
                        });
                    }
                    sum.unwrap_or(x)
                }
            };

            if self.kept_outputs.contains(&position) {
                kept.insert(position, x.clone());
            }
        }

        Ok(x)
    }
}

/// Apply an activation; softmax runs over the feature axis (dim 1)
fn activate(x: &Tensor, kind: ActivationKind) -> candle_core::Result<Tensor> {
    match kind {
        ActivationKind::Linear => Ok(x.clone()),
        ActivationKind::Relu => x.relu(),
        ActivationKind::Relu6 => x.relu()?.clamp(0f32, 6f32),
        ActivationKind::Sigmoid => candle_nn::ops::sigmoid(x),
        ActivationKind::Softmax => candle_nn::ops::softmax(x, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use serde_json::json;
    use std::collections::HashMap;

    fn tiny_topology() -> NetworkTopology {
        serde_json::from_value(json!({
            "layers": [
                {"class_name": "InputLayer", "config": {"batch_shape": [null, 4, 4, 3]}},
                {"class_name": "Rescaling", "config": {"scale": 0.5}},
                {"class_name": "Conv2D", "config": {
                    "name": "conv", "filters": 2, "kernel_size": [1, 1], "use_bias": false
                }},
                {"class_name": "GlobalAveragePooling2D", "config": {}},
                {"class_name": "Dense", "config": {"name": "head", "units": 2, "activation": "softmax"}}
            ]
        }))
        .unwrap()
    }

    fn tiny_weights() -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let mut map = HashMap::new();
        // conv: channel 0 copies red, channel 1 copies green
        let conv = Tensor::new(&[[1f32, 0., 0.], [0., 1., 0.]], &dev)
            .unwrap()
            .reshape((2, 3, 1, 1))
            .unwrap();
        map.insert("conv.weight".to_string(), conv);
        map.insert(
            "head.weight".to_string(),
            Tensor::new(&[[1f32, 0.], [0., 1.]], &dev).unwrap(),
        );
        map.insert("head.bias".to_string(), Tensor::zeros(2, DType::F32, &dev).unwrap());
        map
    }

    #[test]
    fn test_forward_produces_distribution() {
        let vb = VarBuilder::from_tensors(tiny_weights(), DType::F32, &Device::Cpu);
        let network = Network::build(&tiny_topology(), vb).unwrap();

        assert_eq!(network.num_outputs(), 2);
        assert!(network.ends_with_softmax());

        // red pixels dominate, so class 0 should win
        let pixels: Vec<f32> = (0..16).flat_map(|_| [8f32, 2., 0.]).collect();
        let input = Tensor::from_vec(pixels, (1, 4, 4, 3), &Device::Cpu).unwrap();
        let probs: Vec<f32> = network
            .forward(&input)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec1()
            .unwrap();

        assert_eq!(probs.len(), 2);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(probs[0] > probs[1]);
        // logits are 4 and 1 after rescaling
        let expected = 1.0 / (1.0 + (-3f32).exp());
        assert!((probs[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_missing_weight_fails_build() {
        let mut weights = tiny_weights();
        weights.remove("head.weight");
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);

        assert!(matches!(
            Network::build(&tiny_topology(), vb),
            Err(Error::Model(_))
        ));
    }

    #[test]
    fn test_wrong_weight_shape_fails_build() {
        let mut weights = tiny_weights();
        weights.insert(
            "head.weight".to_string(),
            Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);

        assert!(Network::build(&tiny_topology(), vb).is_err());
    }

    #[test]
    fn test_input_shape_checked() {
        let vb = VarBuilder::from_tensors(tiny_weights(), DType::F32, &Device::Cpu);
        let network = Network::build(&tiny_topology(), vb).unwrap();

        let wrong = Tensor::zeros((1, 5, 5, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(network.forward(&wrong), Err(Error::Inference(_))));
    }

    fn run(topology: serde_json::Value, weights: HashMap<String, Tensor>, input: Tensor) -> Vec<f32> {
        let topology: NetworkTopology = serde_json::from_value(topology).unwrap();
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
        let network = Network::build(&topology, vb).unwrap();
        network
            .forward(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    fn ramp(h: usize, w: usize) -> Tensor {
        let values: Vec<f32> = (0..h * w).map(|v| v as f32).collect();
        Tensor::from_vec(values, (1, h, w, 1), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_strided_same_padding_pads_bottom_right() {
        let topology = json!({
            "layers": [
                {"class_name": "InputLayer", "config": {"batch_shape": [null, 4, 4, 1]}},
                {"class_name": "Conv2D", "config": {
                    "name": "conv", "filters": 1, "kernel_size": [3, 3], "strides": [2, 2],
                    "padding": "same", "use_bias": false
                }},
                {"class_name": "Flatten", "config": {}}
            ]
        });
        let weights = HashMap::from([(
            "conv.weight".to_string(),
            Tensor::ones((1, 1, 3, 3), DType::F32, &Device::Cpu).unwrap(),
        )]);

        // windows start at rows/cols 0 and 2; the zero row and column go after
        let out = run(topology, weights, ramp(4, 4));
        assert_eq!(out, vec![45.0, 39.0, 66.0, 50.0]);
    }

    #[test]
    fn test_bilinear_resize_uses_half_pixel_centers() {
        let topology = json!({
            "layers": [
                {"class_name": "InputLayer", "config": {"batch_shape": [null, 2, 2, 1]}},
                {"class_name": "Resizing", "config": {"height": 4, "width": 4, "interpolation": "bilinear"}},
                {"class_name": "Flatten", "config": {}}
            ]
        });

        let out = run(topology, HashMap::new(), ramp(2, 2));
        let expected = [
            0.0, 0.25, 0.75, 1.0, //
            0.5, 0.75, 1.25, 1.5, //
            1.5, 1.75, 2.25, 2.5, //
            2.0, 2.25, 2.75, 3.0,
        ];
        assert_eq!(out.len(), 16);
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{:?}", out);
        }
    }

    #[test]
    fn test_nearest_resize() {
        let topology = json!({
            "layers": [
                {"class_name": "InputLayer", "config": {"batch_shape": [null, 2, 2, 1]}},
                {"class_name": "Resizing", "config": {"height": 4, "width": 4, "interpolation": "nearest"}},
                {"class_name": "Flatten", "config": {}}
            ]
        });

        let out = run(topology, HashMap::new(), ramp(2, 2));
        assert_eq!(
            out,
            vec![0., 0., 1., 1., 0., 0., 1., 1., 2., 2., 3., 3., 2., 2., 3., 3.]
        );
    }

    #[test]
    fn test_zero_padding_then_valid_conv() {
        let topology = json!({
            "layers": [
                {"class_name": "InputLayer", "config": {"batch_shape": [null, 4, 4, 1]}},
                {"class_name": "ZeroPadding2D", "config": {"name": "pad", "padding": [[0, 1], [0, 1]]}},
                {"class_name": "DepthwiseConv2D", "config": {
                    "name": "dw", "kernel_size": [3, 3], "strides": [2, 2], "use_bias": false
                }},
                {"class_name": "Flatten", "config": {}}
            ]
        });
        let weights = HashMap::from([(
            "dw.weight".to_string(),
            Tensor::ones((1, 1, 3, 3), DType::F32, &Device::Cpu).unwrap(),
        )]);

        let out = run(topology, weights, ramp(4, 4));
        assert_eq!(out, vec![45.0, 39.0, 66.0, 50.0]);
    }

    #[test]
    fn test_add_sums_skip_connection() {
        let topology = json!({
            "layers": [
                {"class_name": "InputLayer", "config": {"name": "input", "batch_shape": [null, 2, 2, 1]}},
                {"class_name": "Conv2D", "config": {
                    "name": "double", "filters": 1, "kernel_size": [1, 1], "use_bias": false
                }},
                {"class_name": "ReLU", "config": {"name": "relu"}},
                {"class_name": "Add", "config": {"name": "add", "inputs": ["input", "relu"]}},
                {"class_name": "Flatten", "config": {}}
            ]
        });
        let weights = HashMap::from([(
            "double.weight".to_string(),
            Tensor::full(2f32, (1, 1, 1, 1), &Device::Cpu).unwrap(),
        )]);

        let out = run(topology, weights, ramp(2, 2));
        assert_eq!(out, vec![0.0, 3.0, 6.0, 9.0]);
    }
}

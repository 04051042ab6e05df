//! Network topology descriptions
//!
//! A topology is the JSON description of an image classifier that travels
//! with the model weights, either embedded in the safetensors header metadata
//! or as a sidecar `.json` file. Layers use the Keras vocabulary (`class_name`
//! plus a `config` object) so descriptions exported by the training tooling
//! can be read directly.
//!
//! Layers run in list order, each consuming the previous layer's output.
//! `Add` is the one exception: it names the earlier layers it sums, which is
//! enough for residual networks such as MobileNetV2.
//!
//! Parsing is strict: unknown layer types or config keys are rejected. Keras
//! exports and older schemas go through [`patch_schema`] first.

use leafscan_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Schema version written by current exports
pub const TOPOLOGY_FORMAT_VERSION: u32 = 3;

/// Safetensors header metadata key holding the topology JSON
pub const TOPOLOGY_METADATA_KEY: &str = "topology";

/// Description of a layer-by-layer classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkTopology {
    #[serde(default = "current_format_version")]
    pub format_version: u32,

    #[serde(default = "default_network_name")]
    pub name: String,

    pub layers: Vec<LayerSpec>,
}

/// One layer of the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config", deny_unknown_fields)]
pub enum LayerSpec {
    InputLayer(InputConfig),
    Rescaling(RescalingConfig),
    Resizing(ResizingConfig),
    ZeroPadding2D(ZeroPaddingConfig),
    Conv2D(Conv2dConfig),
    DepthwiseConv2D(DepthwiseConv2dConfig),
    BatchNormalization(BatchNormConfig),
    ReLU(ReluConfig),
    Activation(ActivationConfig),
    MaxPooling2D(PoolConfig),
    GlobalAveragePooling2D(NamedConfig),
    Flatten(NamedConfig),
    Dropout(DropoutConfig),
    Dense(DenseConfig),
    Add(AddConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    #[serde(default)]
    pub name: String,
    /// `[batch, height, width, channels]`, batch usually null
    pub batch_shape: Vec<Option<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RescalingConfig {
    #[serde(default)]
    pub name: String,
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResizingConfig {
    #[serde(default)]
    pub name: String,
    pub height: usize,
    pub width: usize,
    #[serde(default)]
    pub interpolation: Interpolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZeroPaddingConfig {
    #[serde(default)]
    pub name: String,
    /// `[[top, bottom], [left, right]]`
    pub padding: [[usize; 2]; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conv2dConfig {
    #[serde(default)]
    pub name: String,
    pub filters: usize,
    pub kernel_size: [usize; 2],
    #[serde(default = "unit_pair")]
    pub strides: [usize; 2],
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub activation: ActivationKind,
    #[serde(default = "default_true")]
    pub use_bias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepthwiseConv2dConfig {
    #[serde(default)]
    pub name: String,
    pub kernel_size: [usize; 2],
    #[serde(default = "unit_pair")]
    pub strides: [usize; 2],
    #[serde(default)]
    pub padding: Padding,
    #[serde(default = "default_depth_multiplier")]
    pub depth_multiplier: usize,
    #[serde(default)]
    pub activation: ActivationKind,
    #[serde(default = "default_true")]
    pub use_bias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchNormConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReluConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub max_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivationConfig {
    #[serde(default)]
    pub name: String,
    pub activation: ActivationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: [usize; 2],
    /// Defaults to `pool_size`
    #[serde(default)]
    pub strides: Option<[usize; 2]>,
    #[serde(default)]
    pub padding: Padding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NamedConfig {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropoutConfig {
    #[serde(default)]
    pub name: String,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenseConfig {
    #[serde(default)]
    pub name: String,
    pub units: usize,
    #[serde(default)]
    pub activation: ActivationKind,
    #[serde(default = "default_true")]
    pub use_bias: bool,
}

/// Element-wise sum of earlier layer outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddConfig {
    #[serde(default)]
    pub name: String,
    /// Names of the layers whose outputs are summed
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    Same,
    #[default]
    Valid,
}

/// Resampling used by `Resizing`, with half-pixel centers as in TensorFlow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Bilinear,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    #[default]
    Linear,
    Relu,
    Relu6,
    Sigmoid,
    Softmax,
}

fn current_format_version() -> u32 {
    TOPOLOGY_FORMAT_VERSION
}

fn default_network_name() -> String {
    "sequential".to_string()
}

fn unit_pair() -> [usize; 2] {
    [1, 1]
}

fn default_pool_size() -> [usize; 2] {
    [2, 2]
}

fn default_true() -> bool {
    true
}

fn default_depth_multiplier() -> usize {
    1
}

fn default_epsilon() -> f64 {
    1e-3
}

/// Shape of the activations flowing between layers (batch dimension omitted)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureShape {
    /// Channels-first feature map
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    /// Feature vector
    Flat(usize),
}

impl FeatureShape {
    /// Channel count for spatial maps, length for vectors
    pub fn features(&self) -> usize {
        match *self {
            Self::Spatial { channels, .. } => channels,
            Self::Flat(n) => n,
        }
    }

    pub(crate) fn spatial(&self, layer: &str) -> Result<(usize, usize, usize)> {
        match *self {
            Self::Spatial {
                channels,
                height,
                width,
            } => Ok((channels, height, width)),
            Self::Flat(_) => Err(Error::model(format!(
                "layer '{}' expects a spatial feature map, got a flat vector",
                layer
            ))),
        }
    }
}

/// A layer with its resolved name and input/output shapes
#[derive(Debug, Clone)]
pub struct LayerPlan<'a> {
    pub name: String,
    pub spec: &'a LayerSpec,
    pub input: FeatureShape,
    pub output: FeatureShape,
    /// Positions of the layers feeding this one
    pub sources: Vec<usize>,
}

/// Zero rows and columns added around a feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpatialPadding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl SpatialPadding {
    /// The per-side amount when all four sides agree
    pub fn uniform(&self) -> Option<usize> {
        let Self {
            top,
            bottom,
            left,
            right,
        } = *self;
        (top == bottom && top == left && top == right).then_some(top)
    }
}

/// Memory layout of a parameter tensor, used to translate foreign layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLayout {
    /// `(out, in, kh, kw)`
    Conv,
    /// `(in * multiplier, 1, kh, kw)`
    Depthwise { multiplier: usize },
    /// `(out, in)`
    Dense,
    /// 1-D per-feature vector
    Vector,
}

/// One parameter tensor the network expects, in topology order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    /// Layer name
    pub layer: String,
    /// Canonical parameter name (`weight`, `bias`, `running_mean`, `running_var`)
    pub param: &'static str,
    pub shape: Vec<usize>,
    pub layout: ParamLayout,
}

impl ParamSlot {
    /// Key under which the tensor is stored (`<layer>.<param>`)
    pub fn key(&self) -> String {
        format!("{}.{}", self.layer, self.param)
    }
}

impl LayerSpec {
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::InputLayer(_) => "InputLayer",
            Self::Rescaling(_) => "Rescaling",
            Self::Resizing(_) => "Resizing",
            Self::ZeroPadding2D(_) => "ZeroPadding2D",
            Self::Conv2D(_) => "Conv2D",
            Self::DepthwiseConv2D(_) => "DepthwiseConv2D",
            Self::BatchNormalization(_) => "BatchNormalization",
            Self::ReLU(_) => "ReLU",
            Self::Activation(_) => "Activation",
            Self::MaxPooling2D(_) => "MaxPooling2D",
            Self::GlobalAveragePooling2D(_) => "GlobalAveragePooling2D",
            Self::Flatten(_) => "Flatten",
            Self::Dropout(_) => "Dropout",
            Self::Dense(_) => "Dense",
            Self::Add(_) => "Add",
        }
    }

    fn configured_name(&self) -> &str {
        match self {
            Self::InputLayer(c) => &c.name,
            Self::Rescaling(c) => &c.name,
            Self::Resizing(c) => &c.name,
            Self::ZeroPadding2D(c) => &c.name,
            Self::Conv2D(c) => &c.name,
            Self::DepthwiseConv2D(c) => &c.name,
            Self::BatchNormalization(c) => &c.name,
            Self::ReLU(c) => &c.name,
            Self::Activation(c) => &c.name,
            Self::MaxPooling2D(c) => &c.name,
            Self::GlobalAveragePooling2D(c) => &c.name,
            Self::Flatten(c) => &c.name,
            Self::Dropout(c) => &c.name,
            Self::Dense(c) => &c.name,
            Self::Add(c) => &c.name,
        }
    }

    /// Configured name, or `<class_name>_<position>` when unnamed
    pub fn name_at(&self, position: usize) -> String {
        let name = self.configured_name();
        if name.is_empty() {
            format!("{}_{}", self.class_name().to_lowercase(), position)
        } else {
            name.to_string()
        }
    }
}

impl NetworkTopology {
    /// Parse a topology in the current schema
    pub fn from_json(json: &str) -> Result<Self> {
        let topology: Self = serde_json::from_str(json)
            .map_err(|e| Error::model(format!("Failed to parse topology: {}", e)))?;
        topology.check_version()?;
        Ok(topology)
    }

    /// Parse a topology written with an older schema, translating renamed
    /// types and keys first
    pub fn from_json_patched(json: &str) -> Result<(Self, PatchReport)> {
        let mut value: Value = serde_json::from_str(json)
            .map_err(|e| Error::model(format!("Topology is not valid JSON: {}", e)))?;
        let report = patch_schema(&mut value);

        let topology: Self = serde_json::from_value(value)
            .map_err(|e| Error::model(format!("Patched topology still invalid: {}", e)))?;
        Ok((topology, report))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn check_version(&self) -> Result<()> {
        if self.format_version != TOPOLOGY_FORMAT_VERSION {
            return Err(Error::model(format!(
                "unsupported topology format version {} (expected {})",
                self.format_version, TOPOLOGY_FORMAT_VERSION
            )));
        }
        Ok(())
    }

    /// Input `(height, width, channels)` declared by the leading `InputLayer`
    pub fn input_shape(&self) -> Result<(usize, usize, usize)> {
        let Some(LayerSpec::InputLayer(input)) = self.layers.first() else {
            return Err(Error::model("topology must start with an InputLayer"));
        };

        match input.batch_shape.as_slice() {
            [_, Some(h), Some(w), Some(c)] if *h > 0 && *w > 0 && *c > 0 => Ok((*h, *w, *c)),
            other => Err(Error::model(format!(
                "InputLayer batch_shape must be [batch, height, width, channels], got {:?}",
                other
            ))),
        }
    }

    /// Walk the layers, resolving names and propagating shapes.
    ///
    /// This is where unsupported configurations are rejected, so a topology
    /// that plans successfully can always be built.
    pub fn plan(&self) -> Result<Vec<LayerPlan<'_>>> {
        let (height, width, channels) = self.input_shape()?;
        let mut shape = FeatureShape::Spatial {
            channels,
            height,
            width,
        };

        let mut plans: Vec<LayerPlan<'_>> = Vec::with_capacity(self.layers.len());
        for (position, spec) in self.layers.iter().enumerate() {
            let name = spec.name_at(position);
            let (output, sources) = match spec {
                LayerSpec::Add(c) => merge_sources(c, &name, &plans)?,
                _ => (
                    next_shape(spec, &name, shape, position)?,
                    position.checked_sub(1).into_iter().collect(),
                ),
            };
            plans.push(LayerPlan {
                name,
                spec,
                input: shape,
                output,
                sources,
            });
            shape = output;
        }

        Ok(plans)
    }

    /// Length of the output vector
    pub fn output_units(&self) -> Result<usize> {
        let plans = self.plan()?;
        match plans.last().map(|p| p.output) {
            Some(FeatureShape::Flat(n)) => Ok(n),
            other => Err(Error::model(format!(
                "network must end in a flat output vector, got {:?}",
                other
            ))),
        }
    }

    /// Whether the final layer already produces probabilities
    pub fn ends_with_softmax(&self) -> bool {
        match self.layers.last() {
            Some(LayerSpec::Dense(c)) => c.activation == ActivationKind::Softmax,
            Some(LayerSpec::Activation(c)) => c.activation == ActivationKind::Softmax,
            _ => false,
        }
    }

    /// Parameter tensors the network expects, in layer order
    pub fn parameter_slots(&self) -> Result<Vec<ParamSlot>> {
        let mut slots = Vec::new();

        for plan in self.plan()? {
            let slot = |param: &'static str, shape: Vec<usize>, layout: ParamLayout| ParamSlot {
                layer: plan.name.clone(),
                param,
                shape,
                layout,
            };

            match plan.spec {
                LayerSpec::Conv2D(c) => {
                    let in_channels = plan.input.features();
                    slots.push(slot(
                        "weight",
                        vec![c.filters, in_channels, c.kernel_size[0], c.kernel_size[1]],
                        ParamLayout::Conv,
                    ));
                    if c.use_bias {
                        slots.push(slot("bias", vec![c.filters], ParamLayout::Vector));
                    }
                }
                LayerSpec::DepthwiseConv2D(c) => {
                    let out_channels = plan.output.features();
                    slots.push(slot(
                        "weight",
                        vec![out_channels, 1, c.kernel_size[0], c.kernel_size[1]],
                        ParamLayout::Depthwise {
                            multiplier: c.depth_multiplier,
                        },
                    ));
                    if c.use_bias {
                        slots.push(slot("bias", vec![out_channels], ParamLayout::Vector));
                    }
                }
                LayerSpec::BatchNormalization(_) => {
                    let n = plan.input.features();
                    for param in ["weight", "bias", "running_mean", "running_var"] {
                        slots.push(slot(param, vec![n], ParamLayout::Vector));
                    }
                }
                LayerSpec::Dense(c) => {
                    slots.push(slot(
                        "weight",
                        vec![c.units, plan.input.features()],
                        ParamLayout::Dense,
                    ));
                    if c.use_bias {
                        slots.push(slot("bias", vec![c.units], ParamLayout::Vector));
                    }
                }
                _ => {}
            }
        }

        Ok(slots)
    }

    /// Architecture the production classifier is trained with: 128x128
    /// RGB input resized to 224x224, scaled to `[-1, 1]`, a MobileNetV2
    /// backbone (width 1.0, no top), average pooling, dropout and a softmax
    /// head. Layer names follow the Keras application so weights exported
    /// from the trained model match by name.
    ///
    /// Used when an artifact's own topology cannot be read at all: only the
    /// numeric weights are taken from the artifact.
    pub fn reference(num_classes: usize) -> Self {
        let mut layers = vec![
            LayerSpec::InputLayer(InputConfig {
                name: "input_layer".to_string(),
                batch_shape: vec![None, Some(128), Some(128), Some(3)],
            }),
            LayerSpec::Resizing(ResizingConfig {
                name: "resizing".to_string(),
                height: 224,
                width: 224,
                interpolation: Interpolation::Bilinear,
            }),
            LayerSpec::Rescaling(RescalingConfig {
                name: "rescaling".to_string(),
                scale: 1.0 / 127.5,
                offset: -1.0,
            }),
        ];

        layers.extend(mobilenet_v2(224));

        layers.extend([
            LayerSpec::GlobalAveragePooling2D(NamedConfig {
                name: "global_average_pooling2d".to_string(),
            }),
            LayerSpec::Dropout(DropoutConfig {
                name: "dropout".to_string(),
                rate: 0.2,
            }),
            LayerSpec::Dense(DenseConfig {
                name: "dense".to_string(),
                units: num_classes,
                activation: ActivationKind::Softmax,
                use_bias: true,
            }),
        ]);

        Self {
            format_version: TOPOLOGY_FORMAT_VERSION,
            name: "leafscan_reference".to_string(),
            layers,
        }
    }
}

/// MobileNetV2 inverted residual blocks: expansion, output channels, stride
const MOBILENET_V2_BLOCKS: [(usize, usize, usize); 17] = [
    (1, 16, 1),
    (6, 24, 2),
    (6, 24, 1),
    (6, 32, 2),
    (6, 32, 1),
    (6, 32, 1),
    (6, 64, 2),
    (6, 64, 1),
    (6, 64, 1),
    (6, 64, 1),
    (6, 96, 1),
    (6, 96, 1),
    (6, 96, 1),
    (6, 160, 2),
    (6, 160, 1),
    (6, 160, 1),
    (6, 320, 1),
];

/// MobileNetV2 feature extractor for a square `input_size` RGB image
fn mobilenet_v2(input_size: usize) -> Vec<LayerSpec> {
    let mut layers = vec![
        conv("Conv1", 32, 3, 2, Padding::Same),
        batch_norm("bn_Conv1"),
        relu6("Conv1_relu"),
    ];
    let mut size = input_size.div_ceil(2);
    let mut channels = 32;
    let mut block_input = "Conv1_relu".to_string();

    for (id, (expansion, filters, stride)) in MOBILENET_V2_BLOCKS.into_iter().enumerate() {
        let prefix = if id == 0 {
            "expanded_conv_".to_string()
        } else {
            format!("block_{}_", id)
        };

        if id > 0 {
            layers.extend([
                conv(&format!("{prefix}expand"), expansion * channels, 1, 1, Padding::Same),
                batch_norm(&format!("{prefix}expand_BN")),
                relu6(&format!("{prefix}expand_relu")),
            ]);
        }

        let depthwise_padding = if stride == 2 {
            // one extra row and column before the window when the size is odd
            let before = size % 2;
            layers.push(LayerSpec::ZeroPadding2D(ZeroPaddingConfig {
                name: format!("{prefix}pad"),
                padding: [[before, 1], [before, 1]],
            }));
            size = (size + before + 1 - 3) / 2 + 1;
            Padding::Valid
        } else {
            Padding::Same
        };

        layers.extend([
            LayerSpec::DepthwiseConv2D(DepthwiseConv2dConfig {
                name: format!("{prefix}depthwise"),
                kernel_size: [3, 3],
                strides: [stride, stride],
                padding: depthwise_padding,
                depth_multiplier: 1,
                activation: ActivationKind::Linear,
                use_bias: false,
            }),
            batch_norm(&format!("{prefix}depthwise_BN")),
            relu6(&format!("{prefix}depthwise_relu")),
            conv(&format!("{prefix}project"), filters, 1, 1, Padding::Same),
            batch_norm(&format!("{prefix}project_BN")),
        ]);

        let mut output = format!("{prefix}project_BN");
        if channels == filters && stride == 1 {
            let add = format!("{prefix}add");
            layers.push(LayerSpec::Add(AddConfig {
                name: add.clone(),
                inputs: vec![block_input, output],
            }));
            output = add;
        }

        channels = filters;
        block_input = output;
    }

    layers.extend([
        conv("Conv_1", 1280, 1, 1, Padding::Valid),
        batch_norm("Conv_1_bn"),
        relu6("out_relu"),
    ]);
    layers
}

fn conv(name: &str, filters: usize, kernel: usize, stride: usize, padding: Padding) -> LayerSpec {
    LayerSpec::Conv2D(Conv2dConfig {
        name: name.to_string(),
        filters,
        kernel_size: [kernel, kernel],
        strides: [stride, stride],
        padding,
        activation: ActivationKind::Linear,
        use_bias: false,
    })
}

fn batch_norm(name: &str) -> LayerSpec {
    LayerSpec::BatchNormalization(BatchNormConfig {
        name: name.to_string(),
        epsilon: 1e-3,
    })
}

fn relu6(name: &str) -> LayerSpec {
    LayerSpec::ReLU(ReluConfig {
        name: name.to_string(),
        max_value: Some(6.0),
    })
}

/// TensorFlow "same" padding along one axis: the output is
/// `ceil(size / stride)` and an odd remainder goes after the input
fn same_padding(size: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let output = size.div_ceil(stride);
    let total = ((output.max(1) - 1) * stride + kernel).saturating_sub(size);
    (total / 2, total - total / 2)
}

/// Explicit zero padding a convolution applies to a `height` x `width` input
pub fn conv_padding(
    padding: Padding,
    kernel: usize,
    stride: usize,
    height: usize,
    width: usize,
) -> SpatialPadding {
    match padding {
        Padding::Valid => SpatialPadding::default(),
        Padding::Same => {
            let (top, bottom) = same_padding(height, kernel, stride);
            let (left, right) = same_padding(width, kernel, stride);
            SpatialPadding {
                top,
                bottom,
                left,
                right,
            }
        }
    }
}

fn window_output(size: usize, kernel: usize, stride: usize) -> Option<usize> {
    size.checked_sub(kernel).map(|span| span / stride + 1)
}

fn square(pair: [usize; 2], what: &str, layer: &str) -> Result<usize> {
    if pair[0] != pair[1] || pair[0] == 0 {
        return Err(Error::model(format!(
            "layer '{}': only square non-zero {} are supported, got {:?}",
            layer, what, pair
        )));
    }
    Ok(pair[0])
}

fn conv_geometry(
    layer: &str,
    kernel_size: [usize; 2],
    strides: [usize; 2],
    padding: Padding,
    height: usize,
    width: usize,
) -> Result<(usize, usize)> {
    let kernel = square(kernel_size, "kernels", layer)?;
    let stride = square(strides, "strides", layer)?;
    let pad = conv_padding(padding, kernel, stride, height, width);

    match (
        window_output(height + pad.top + pad.bottom, kernel, stride),
        window_output(width + pad.left + pad.right, kernel, stride),
    ) {
        (Some(h), Some(w)) => Ok((h, w)),
        _ => Err(Error::model(format!(
            "layer '{}': kernel {} does not fit a {}x{} input",
            layer, kernel, height, width
        ))),
    }
}

/// Resolve an `Add` layer's inputs to earlier positions and check that
/// their shapes agree
fn merge_sources(
    config: &AddConfig,
    name: &str,
    plans: &[LayerPlan<'_>],
) -> Result<(FeatureShape, Vec<usize>)> {
    if config.inputs.len() < 2 {
        return Err(Error::model(format!(
            "layer '{}': Add needs at least two inputs",
            name
        )));
    }

    let mut sources = Vec::with_capacity(config.inputs.len());
    let mut shape = None;
    for input in &config.inputs {
        let position = plans
            .iter()
            .rposition(|plan| &plan.name == input)
            .ok_or_else(|| {
                Error::model(format!(
                    "layer '{}': input '{}' is not an earlier layer",
                    name, input
                ))
            })?;

        let output = plans[position].output;
        match shape {
            Some(expected) if expected != output => {
                return Err(Error::model(format!(
                    "layer '{}': input '{}' has shape {:?}, expected {:?}",
                    name, input, output, expected
                )))
            }
            _ => shape = Some(output),
        }
        sources.push(position);
    }

    Ok((shape.unwrap_or(FeatureShape::Flat(0)), sources))
}

fn next_shape(
    spec: &LayerSpec,
    name: &str,
    input: FeatureShape,
    position: usize,
) -> Result<FeatureShape> {
    let shape = match spec {
        LayerSpec::InputLayer(_) if position == 0 => input,
        LayerSpec::InputLayer(_) => {
            return Err(Error::model(format!(
                "InputLayer '{}' may only appear first",
                name
            )))
        }
        LayerSpec::Rescaling(_)
        | LayerSpec::BatchNormalization(_)
        | LayerSpec::ReLU(_)
        | LayerSpec::Activation(_)
        | LayerSpec::Dropout(_) => input,
        LayerSpec::Resizing(c) => {
            let (channels, _, _) = input.spatial(name)?;
            if c.height == 0 || c.width == 0 {
                return Err(Error::model(format!("layer '{}': empty target size", name)));
            }
            FeatureShape::Spatial {
                channels,
                height: c.height,
                width: c.width,
            }
        }
        LayerSpec::ZeroPadding2D(c) => {
            let (channels, height, width) = input.spatial(name)?;
            let [[top, bottom], [left, right]] = c.padding;
            FeatureShape::Spatial {
                channels,
                height: height + top + bottom,
                width: width + left + right,
            }
        }
        LayerSpec::Conv2D(c) => {
            let (_, height, width) = input.spatial(name)?;
            let (height, width) =
                conv_geometry(name, c.kernel_size, c.strides, c.padding, height, width)?;
            FeatureShape::Spatial {
                channels: c.filters,
                height,
                width,
            }
        }
        LayerSpec::DepthwiseConv2D(c) => {
            let (channels, height, width) = input.spatial(name)?;
            if c.depth_multiplier == 0 {
                return Err(Error::model(format!("layer '{}': zero depth multiplier", name)));
            }
            let (height, width) =
                conv_geometry(name, c.kernel_size, c.strides, c.padding, height, width)?;
            FeatureShape::Spatial {
                channels: channels * c.depth_multiplier,
                height,
                width,
            }
        }
        LayerSpec::MaxPooling2D(c) => {
            let (channels, height, width) = input.spatial(name)?;
            if c.padding != Padding::Valid {
                return Err(Error::model(format!(
                    "layer '{}': pooling supports only 'valid' padding",
                    name
                )));
            }
            let pool = square(c.pool_size, "pool sizes", name)?;
            let stride = square(c.strides.unwrap_or(c.pool_size), "strides", name)?;
            match (
                window_output(height, pool, stride),
                window_output(width, pool, stride),
            ) {
                (Some(height), Some(width)) => FeatureShape::Spatial {
                    channels,
                    height,
                    width,
                },
                _ => {
                    return Err(Error::model(format!(
                        "layer '{}': pool {} does not fit a {}x{} input",
                        name, pool, height, width
                    )))
                }
            }
        }
        LayerSpec::GlobalAveragePooling2D(_) => {
            let (channels, _, _) = input.spatial(name)?;
            FeatureShape::Flat(channels)
        }
        LayerSpec::Flatten(_) => match input {
            FeatureShape::Spatial {
                channels,
                height,
                width,
            } => FeatureShape::Flat(channels * height * width),
            flat => flat,
        },
        LayerSpec::Dense(c) => match input {
            FeatureShape::Flat(_) if c.units > 0 => FeatureShape::Flat(c.units),
            FeatureShape::Flat(_) => {
                return Err(Error::model(format!("layer '{}': zero units", name)))
            }
            FeatureShape::Spatial { .. } => {
                return Err(Error::model(format!(
                    "layer '{}': Dense needs a flat input, add Flatten or GlobalAveragePooling2D",
                    name
                )))
            }
        },
        LayerSpec::Add(_) => {
            return Err(Error::model(format!(
                "layer '{}': Add is resolved against earlier layers",
                name
            )))
        }
    };

    Ok(shape)
}

/// Summary of the rewrites applied by [`patch_schema`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub renamed_types: usize,
    pub renamed_keys: usize,
    pub dropped_keys: usize,
    /// Layers with no effect at inference time (augmentation, nested inputs)
    pub dropped_layers: usize,
    /// Nested models whose layers were spliced into the outer list
    pub flattened_models: usize,
}

impl PatchReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Layer type names used by older exports
const TYPE_ALIASES: &[(&str, &str)] = &[
    ("Convolution2D", "Conv2D"),
    ("Conv2d", "Conv2D"),
    ("DepthwiseConvolution2D", "DepthwiseConv2D"),
    ("MaxPool2D", "MaxPooling2D"),
    ("GlobalAvgPool2D", "GlobalAveragePooling2D"),
    ("GlobalAveragePool2D", "GlobalAveragePooling2D"),
    ("BatchNorm", "BatchNormalization"),
    ("Relu", "ReLU"),
    ("Rescale", "Rescaling"),
];

/// Layers that pass their input through unchanged at inference time
const INFERENCE_IDENTITY_TYPES: &[&str] = &[
    "RandomFlip",
    "RandomRotation",
    "RandomZoom",
    "RandomTranslation",
    "RandomContrast",
    "RandomBrightness",
    "GaussianNoise",
    "GaussianDropout",
    "ActivityRegularization",
];

/// Config keys renamed across schema versions
const KEY_ALIASES: &[(&str, &str)] = &[
    ("batch_input_shape", "batch_shape"),
    ("nb_filter", "filters"),
    ("output_dim", "units"),
    ("subsample", "strides"),
    ("border_mode", "padding"),
    ("pool_length", "pool_size"),
    ("eps", "epsilon"),
    ("p", "rate"),
];

/// Bookkeeping keys that carry no inference-time meaning
const DROPPED_KEYS: &[&str] = &[
    "trainable",
    "dtype",
    "sparse",
    "ragged",
    "data_format",
    "activity_regularizer",
    "noise_shape",
    "seed",
    "axis",
    "momentum",
    "synchronized",
    "crop_to_aspect_ratio",
    "pad_to_aspect_ratio",
    "fill_mode",
    "fill_value",
    "antialias",
    "keepdims",
    "lora_alpha",
];

/// Keys dropped only when they hold their neutral value
const NEUTRAL_KEYS: &[(&str, fn(&Value) -> bool)] = &[
    ("dilation_rate", is_all_ones),
    ("groups", is_one),
    ("negative_slope", is_zero),
    ("threshold", is_zero),
    ("center", is_true),
    ("scale", is_true),
    ("lora_rank", is_zero),
];

fn is_all_ones(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(is_one),
        other => is_one(other),
    }
}

fn is_one(value: &Value) -> bool {
    value.as_f64() == Some(1.0)
}

fn is_zero(value: &Value) -> bool {
    value.is_null() || value.as_f64() == Some(0.0)
}

fn is_true(value: &Value) -> bool {
    value.as_bool() == Some(true)
}

/// Rewrite an older topology description into the current vocabulary.
///
/// Handles whole-model wrappers (`model_config`, `Sequential`/`Functional`
/// envelopes), nested sub-models, fully qualified or renamed layer types,
/// renamed config keys, scalar kernel/stride sizes, upper-case padding names
/// and bookkeeping keys the current schema does not carry.
///
/// Nested models (a `Functional` backbone, a `Sequential` augmentation stack)
/// are spliced into the outer layer list. Their inner `InputLayer`s and
/// augmentation layers are dropped. `Add` inputs come from the layer's
/// `inbound_nodes`, in either the Keras 2 or the Keras 3 format.
pub fn patch_schema(value: &mut Value) -> PatchReport {
    let mut report = PatchReport::default();

    if let Some(inner) = value.get_mut("model_config").map(Value::take) {
        *value = inner;
        report.dropped_keys += 1;
    }

    // Keras model envelope: {"class_name": "Sequential", "config": {"name", "layers"}}
    if value.get("layers").is_none() {
        if let Some(config) = value.get_mut("config").map(Value::take) {
            *value = config;
            report.renamed_types += 1;
        }
    }

    let Some(object) = value.as_object_mut() else {
        return report;
    };

    let before = object.len();
    object.retain(|key, _| matches!(key.as_str(), "format_version" | "name" | "layers"));
    report.dropped_keys += before - object.len();
    object.insert(
        "format_version".to_string(),
        Value::from(TOPOLOGY_FORMAT_VERSION),
    );

    if let Some(Value::Array(layers)) = object.get_mut("layers").map(Value::take) {
        let mut flat = Vec::with_capacity(layers.len());
        let mut aliases = HashMap::new();
        flatten_layers(layers, &mut flat, &mut aliases, &mut report);
        object.insert("layers".to_string(), Value::Array(flat));
    }

    report
}

fn flatten_layers(
    layers: Vec<Value>,
    flat: &mut Vec<Value>,
    aliases: &mut HashMap<String, String>,
    report: &mut PatchReport,
) {
    for mut layer in layers {
        let name = layer
            .pointer("/config/name")
            .or_else(|| layer.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let nested = layer
            .get_mut("config")
            .and_then(|config| config.get_mut("layers"))
            .map(Value::take);
        if let Some(Value::Array(inner)) = nested {
            flatten_layers(inner, flat, aliases, report);
            report.flattened_models += 1;
            alias_to_last(name, flat, aliases);
            continue;
        }

        let class_name = layer
            .get("class_name")
            .and_then(Value::as_str)
            .map(canonical_type)
            .unwrap_or_default();
        let passthrough = INFERENCE_IDENTITY_TYPES.contains(&class_name.as_str())
            || (class_name == "InputLayer" && !flat.is_empty());
        if passthrough {
            report.dropped_layers += 1;
            alias_to_last(name, flat, aliases);
            continue;
        }

        patch_layer(&mut layer, aliases, report);
        flat.push(layer);
    }
}

/// Make `name` refer to the most recently kept layer
fn alias_to_last(name: Option<String>, flat: &[Value], aliases: &mut HashMap<String, String>) {
    let last = flat
        .last()
        .and_then(|layer| layer.pointer("/config/name"))
        .and_then(Value::as_str);
    if let (Some(name), Some(last)) = (name, last) {
        aliases.insert(name, last.to_string());
    }
}

/// Names of the layers feeding the first call of a layer
fn inbound_layer_names(nodes: &Value) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(first) = nodes.as_array().and_then(|nodes| nodes.first()) {
        collect_inbound(first, &mut names);
    }
    names
}

fn collect_inbound(value: &Value, names: &mut Vec<String>) {
    match value {
        // Keras 3: {"keras_history": [layer, node, tensor]}
        Value::Object(map) => match map.get("keras_history").and_then(|h| h.get(0)) {
            Some(Value::String(name)) => names.push(name.clone()),
            _ => map.values().for_each(|v| collect_inbound(v, names)),
        },
        // Keras 2: [layer, node, tensor, kwargs]
        Value::Array(items) => match items.as_slice() {
            [Value::String(name), Value::Number(_), ..] => names.push(name.clone()),
            _ => items.iter().for_each(|v| collect_inbound(v, names)),
        },
        _ => {}
    }
}

fn patch_layer(layer: &mut Value, aliases: &HashMap<String, String>, report: &mut PatchReport) {
    let Some(object) = layer.as_object_mut() else {
        return;
    };

    let outer_name = object.get("name").cloned();
    let inbound = object
        .get("inbound_nodes")
        .map(inbound_layer_names)
        .unwrap_or_default();
    let before = object.len();
    object.retain(|key, _| matches!(key.as_str(), "class_name" | "config"));
    report.dropped_keys += before - object.len();

    let class_name = match object.get("class_name").and_then(Value::as_str) {
        Some(raw) => {
            let canonical = canonical_type(raw);
            if canonical != raw {
                report.renamed_types += 1;
            }
            canonical
        }
        None => return,
    };
    object.insert("class_name".to_string(), Value::from(class_name.clone()));

    let config = object
        .entry("config")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(config) = config.as_object_mut() else {
        return;
    };

    if !config.contains_key("name") {
        if let Some(name) = outer_name {
            config.insert("name".to_string(), name);
        }
    }

    if class_name == "Add" && !config.contains_key("inputs") && !inbound.is_empty() {
        let inputs = inbound
            .into_iter()
            .map(|name| Value::from(aliases.get(&name).cloned().unwrap_or(name)))
            .collect();
        config.insert("inputs".to_string(), Value::Array(inputs));
        report.renamed_keys += 1;
    }

    patch_config(&class_name, config, report);
}

fn canonical_type(raw: &str) -> String {
    let short = raw.rsplit('.').next().unwrap_or(raw);
    TYPE_ALIASES
        .iter()
        .find(|(old, _)| *old == short)
        .map(|(_, new)| new.to_string())
        .unwrap_or_else(|| short.to_string())
}

fn patch_config(class_name: &str, config: &mut Map<String, Value>, report: &mut PatchReport) {
    for (old, new) in KEY_ALIASES {
        if let Some(value) = config.remove(*old) {
            config.entry(new.to_string()).or_insert(value);
            report.renamed_keys += 1;
        }
    }

    if let (Some(rows), Some(cols)) = (config.remove("nb_row"), config.remove("nb_col")) {
        config.insert("kernel_size".to_string(), Value::Array(vec![rows, cols]));
        report.renamed_keys += 1;
    }

    let before = config.len();
    config.retain(|key, value| {
        if DROPPED_KEYS.contains(&key.as_str())
            || key.ends_with("_initializer")
            || key.ends_with("_regularizer")
            || key.ends_with("_constraint")
            || key.starts_with("renorm")
        {
            return false;
        }
        // Rescaling has a numeric `scale`; only the BatchNormalization flag is neutral
        if key == "scale" && class_name != "BatchNormalization" {
            return true;
        }
        !NEUTRAL_KEYS
            .iter()
            .any(|(neutral, is_neutral)| key == neutral && is_neutral(value))
    });
    report.dropped_keys += before - config.len();

    for key in ["kernel_size", "strides", "pool_size"] {
        if let Some(value) = config.get_mut(key) {
            if let Some(n) = value.as_u64() {
                *value = Value::Array(vec![Value::from(n), Value::from(n)]);
            }
        }
    }

    match config.get_mut("padding") {
        Some(Value::String(padding)) => *padding = padding.to_lowercase(),
        Some(padding) if class_name == "ZeroPadding2D" => {
            if let Some(pairs) = zero_padding_pairs(padding) {
                *padding = pairs;
            }
        }
        _ => {}
    }

    if class_name == "InputLayer" {
        if let Some(Value::Array(shape)) = config.remove("shape") {
            if !config.contains_key("batch_shape") {
                let mut batch_shape = vec![Value::Null];
                batch_shape.extend(shape);
                config.insert("batch_shape".to_string(), Value::Array(batch_shape));
                report.renamed_keys += 1;
            }
        }
    }
}

/// Expand `n` or `[rows, cols]` into `[[top, bottom], [left, right]]`
fn zero_padding_pairs(padding: &Value) -> Option<Value> {
    let pair = |n: &Value| Value::Array(vec![n.clone(), n.clone()]);
    match padding {
        Value::Number(_) => Some(Value::Array(vec![pair(padding), pair(padding)])),
        Value::Array(items) => match items.as_slice() {
            [rows @ Value::Number(_), cols @ Value::Number(_)] => {
                Some(Value::Array(vec![pair(rows), pair(cols)]))
            }
            _ => None,
        },
        _ => None,
    }
}

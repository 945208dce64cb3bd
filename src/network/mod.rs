//! Network factory
//!
//! Builds a trainable convolutional classifier from a parsed [`NetworkSpec`]
//! over candle-nn. The factory tracks the spatial size of the activations
//! while stacking layers so the first fully-connected layer is sized without
//! a dry-run forward pass.

pub mod spec;

pub use spec::{Block, NetworkSpec};

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};
use tracing::debug;

use crate::error::{Error, Result};

/// Activation applied after a conv or connected layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Rectified linear unit
    Relu,
    /// Identity (raw logits)
    Linear,
}

impl Activation {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "relu" => Ok(Self::Relu),
            "linear" => Ok(Self::Linear),
            other => Err(Error::config(format!("unsupported activation `{other}`"))),
        }
    }

    fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Linear => Ok(x.clone()),
        }
    }
}

enum Layer {
    Conv {
        conv: Conv2d,
        activation: Activation,
    },
    MaxPool {
        size: usize,
        stride: usize,
    },
    Connected {
        linear: Linear,
        activation: Activation,
    },
}

/// A convolutional classifier assembled from a model config
pub struct Net {
    layers: Vec<Layer>,
    num_classes: usize,
}

impl Net {
    /// Build the network described by `spec` on the device behind `vb`.
    ///
    /// `output=feature` and `output=classes` in `[connected]` blocks resolve
    /// to `feature_size` and `num_classes`; a numeric output on the final
    /// layer that contradicts the dataset's class count is rejected.
    pub fn from_spec(
        spec: &NetworkSpec,
        img_size: usize,
        num_classes: usize,
        feature_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::new();
        let mut channels = spec.in_channels()?;
        let mut height = img_size;
        let mut width = img_size;
        // Set once the stack switches to fully-connected layers.
        let mut features: Option<usize> = None;

        for (index, block) in spec.layer_blocks().enumerate() {
            match block.kind.as_str() {
                "convolutional" => {
                    if features.is_some() {
                        return Err(Error::config(
                            "[convolutional] cannot follow a [connected] layer",
                        ));
                    }
                    let filters = block.usize_param("filters")?;
                    let size = block.usize_param("size")?;
                    let stride = block.usize_param_or("stride", 1)?;
                    let activation = Activation::parse(block.param("activation")?)?;
                    let cfg = Conv2dConfig {
                        padding: size / 2,
                        stride,
                        ..Default::default()
                    };
                    let conv =
                        conv2d(channels, filters, size, cfg, vb.pp(format!("conv{index}")))?;

                    height = (height + 2 * cfg.padding - size) / stride + 1;
                    width = (width + 2 * cfg.padding - size) / stride + 1;
                    channels = filters;
                    layers.push(Layer::Conv { conv, activation });
                }
                "maxpool" => {
                    if features.is_some() {
                        return Err(Error::config("[maxpool] cannot follow a [connected] layer"));
                    }
                    let size = block.usize_param("size")?;
                    let stride = block.usize_param_or("stride", size)?;
                    if size == 0 || stride == 0 {
                        return Err(Error::config("[maxpool] size and stride must be positive"));
                    }
                    if height < size || width < size {
                        return Err(Error::config(format!(
                            "[maxpool] window {size} exceeds activation size {height}x{width}"
                        )));
                    }
                    height = (height - size) / stride + 1;
                    width = (width - size) / stride + 1;
                    layers.push(Layer::MaxPool { size, stride });
                }
                "connected" => {
                    let in_features = *features.get_or_insert(channels * height * width);
                    let out_features = match block.param("output")? {
                        "feature" => feature_size,
                        "classes" => num_classes,
                        raw => raw.parse().map_err(|_| {
                            Error::config(format!("[connected] output is not valid: {raw}"))
                        })?,
                    };
                    if out_features == 0 {
                        return Err(Error::config("[connected] output must be positive"));
                    }
                    let activation = Activation::parse(block.param("activation")?)?;
                    let linear =
                        linear(in_features, out_features, vb.pp(format!("fc{index}")))?;
                    features = Some(out_features);
                    layers.push(Layer::Connected { linear, activation });
                }
                other => {
                    return Err(Error::config(format!("unsupported layer [{other}]")));
                }
            }
        }

        let head = match features {
            Some(f) => f,
            None => {
                return Err(Error::config("model config ends without a [connected] head"))
            }
        };
        if head != num_classes {
            return Err(Error::config(format!(
                "final layer outputs {head} values but the dataset has {num_classes} classes"
            )));
        }

        debug!(layers = layers.len(), num_classes, "network assembled");
        Ok(Self { layers, num_classes })
    }

    /// Forward pass: `[B, C, H, W]` images to `[B, num_classes]` logits.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let mut x = images.clone();
        for layer in &self.layers {
            x = match layer {
                Layer::Conv { conv, activation } => activation.apply(&conv.forward(&x)?)?,
                Layer::MaxPool { size, stride } => {
                    x.max_pool2d_with_stride(*size, *stride)?
                }
                Layer::Connected { linear, activation } => {
                    let flat = if x.dims().len() > 2 { x.flatten_from(1)? } else { x };
                    activation.apply(&linear.forward(&flat)?)?
                }
            };
        }
        Ok(x)
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    const CFG: &str = "\
[net]
channels=3
[convolutional]
filters=4
size=3
stride=1
activation=relu
[maxpool]
size=2
stride=2
[connected]
output=feature
activation=relu
[connected]
output=classes
activation=linear
";

    fn build(img_size: usize, num_classes: usize) -> Result<(Net, VarMap)> {
        let spec = NetworkSpec::from_str(CFG)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = Net::from_spec(&spec, img_size, num_classes, 16, vb)?;
        Ok((net, varmap))
    }

    #[test]
    fn test_forward_shape() {
        let (net, _varmap) = build(8, 5).unwrap();
        let images = Tensor::zeros((2, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let logits = net.forward(&images).unwrap();
        assert_eq!(logits.dims(), &[2, 5]);
    }

    #[test]
    fn test_parameters_are_registered() {
        let (_net, varmap) = build(8, 5).unwrap();
        let count: usize = varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum();
        assert!(count > 0);
    }

    #[test]
    fn test_class_count_mismatch_rejected() {
        let spec = NetworkSpec::from_str("[connected]\noutput=7\nactivation=linear\n").unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = Net::from_spec(&spec, 8, 5, 16, vb).err().unwrap();
        assert!(err.to_string().contains("7"));
    }

    #[test]
    fn test_conv_after_connected_rejected() {
        let cfg = "\
[connected]
output=classes
activation=linear
[convolutional]
filters=4
size=3
activation=relu
";
        let spec = NetworkSpec::from_str(cfg).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Net::from_spec(&spec, 8, 2, 16, vb).is_err());
    }

    #[test]
    fn test_missing_head_rejected() {
        let cfg = "[convolutional]\nfilters=4\nsize=3\nactivation=relu\n";
        let spec = NetworkSpec::from_str(cfg).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Net::from_spec(&spec, 8, 2, 16, vb).is_err());
    }
}

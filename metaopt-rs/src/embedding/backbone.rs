//! Convolutional feature extractors.
//!
//! Each backbone maps a batch of inputs `[n, ...]` to flat features `[n, d]`.
//! Batch norm layers use batch statistics in [`Mode::Training`] and their
//! running statistics in [`Mode::Evaluation`].

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, Dropout, VarBuilder,
};

use super::Mode;
use crate::config::{EmbeddingSettings, Network};
use crate::error::{MetaOptError, Result};

const BN_EPS: f64 = 1e-5;
const LEAKY_SLOPE: f64 = 0.1;

fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vb)
}

fn leaky(x: &Tensor) -> candle_core::Result<Tensor> {
    candle_nn::ops::leaky_relu(x, LEAKY_SLOPE)
}

fn expect_image_batch(x: &Tensor) -> Result<()> {
    if x.rank() != 4 {
        return Err(MetaOptError::shape_mismatch(
            "[n, channels, height, width]",
            format!("{:?}", x.dims()),
        ));
    }
    Ok(())
}

/// conv 3x3 → batch norm → ReLU → max-pool 2.
struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            conv: conv3x3(in_c, out_c, vb.pp("conv"))?,
            bn: batch_norm(out_c, BN_EPS, vb.pp("bn"))?,
        })
    }

    fn forward(&self, x: &Tensor, mode: Mode) -> candle_core::Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.bn.forward_t(&x, mode.is_train())?;
        x.relu()?.max_pool2d(2)
    }
}

/// Four-block convolutional embedding with 64 hidden channels.
pub struct ProtoNetBackbone {
    blocks: Vec<ConvBlock>,
    normalize: bool,
}

impl ProtoNetBackbone {
    /// Hidden and output channel width.
    pub const WIDTH: usize = 64;

    /// Build the backbone for `in_channels`-channel inputs.
    pub fn new(in_channels: usize, normalize: bool, vb: VarBuilder) -> Result<Self> {
        let mut blocks = Vec::with_capacity(4);
        let mut in_c = in_channels;
        for i in 0..4 {
            blocks.push(ConvBlock::new(in_c, Self::WIDTH, vb.pp(format!("block{i}")))?);
            in_c = Self::WIDTH;
        }
        Ok(Self { blocks, normalize })
    }

    fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        expect_image_batch(x)?;
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h, mode)?;
        }
        let h = h.flatten_from(1)?;
        if self.normalize {
            let norm = h.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-12)?;
            return Ok(h.broadcast_div(&norm)?);
        }
        Ok(h)
    }
}

/// conv 3x3 → batch norm → max-pool 2 → leaky ReLU, with optional dropout.
struct R2d2Block {
    conv: Conv2d,
    bn: BatchNorm,
    dropout: Option<Dropout>,
}

impl R2d2Block {
    fn new(in_c: usize, out_c: usize, drop_rate: Option<f32>, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            conv: conv3x3(in_c, out_c, vb.pp("conv"))?,
            bn: batch_norm(out_c, BN_EPS, vb.pp("bn"))?,
            dropout: drop_rate.map(Dropout::new),
        })
    }

    fn forward(&self, x: &Tensor, mode: Mode) -> candle_core::Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.bn.forward_t(&x, mode.is_train())?;
        let x = leaky(&x.max_pool2d(2)?)?;
        match &self.dropout {
            Some(dropout) => dropout.forward_t(&x, mode.is_train()),
            None => Ok(x),
        }
    }
}

/// R2D2 embedding: widths 96/192/384/512; output concatenates the flattened
/// third and fourth block activations.
pub struct R2d2Backbone {
    blocks: [R2d2Block; 4],
}

impl R2d2Backbone {
    /// Block widths.
    pub const WIDTHS: [usize; 4] = [96, 192, 384, 512];

    /// Build the backbone for `in_channels`-channel inputs.
    pub fn new(in_channels: usize, drop_rate: f32, vb: VarBuilder) -> Result<Self> {
        let [w0, w1, w2, w3] = Self::WIDTHS;
        Ok(Self {
            blocks: [
                R2d2Block::new(in_channels, w0, None, vb.pp("block0"))?,
                R2d2Block::new(w0, w1, None, vb.pp("block1"))?,
                R2d2Block::new(w1, w2, Some(drop_rate), vb.pp("block2"))?,
                R2d2Block::new(w2, w3, Some(drop_rate), vb.pp("block3"))?,
            ],
        })
    }

    fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        expect_image_batch(x)?;
        let b1 = self.blocks[1].forward(&self.blocks[0].forward(x, mode)?, mode)?;
        let b3 = self.blocks[2].forward(&b1, mode)?;
        let b4 = self.blocks[3].forward(&b3, mode)?;
        Ok(Tensor::cat(&[b3.flatten_from(1)?, b4.flatten_from(1)?], 1)?)
    }
}

/// Residual stage: three 3x3 conv + BN layers with a 1x1 shortcut, then
/// leaky ReLU, max-pool 2 and dropout.
struct ResidualStage {
    convs: [Conv2d; 3],
    bns: [BatchNorm; 3],
    shortcut: Conv2d,
    shortcut_bn: BatchNorm,
    dropout: Dropout,
}

impl ResidualStage {
    fn new(in_c: usize, planes: usize, drop_rate: f32, vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            convs: [
                conv2d_no_bias(in_c, planes, 3, cfg, vb.pp("conv1"))?,
                conv2d_no_bias(planes, planes, 3, cfg, vb.pp("conv2"))?,
                conv2d_no_bias(planes, planes, 3, cfg, vb.pp("conv3"))?,
            ],
            bns: [
                batch_norm(planes, BN_EPS, vb.pp("bn1"))?,
                batch_norm(planes, BN_EPS, vb.pp("bn2"))?,
                batch_norm(planes, BN_EPS, vb.pp("bn3"))?,
            ],
            shortcut: conv2d_no_bias(in_c, planes, 1, Conv2dConfig::default(), vb.pp("shortcut"))?,
            shortcut_bn: batch_norm(planes, BN_EPS, vb.pp("shortcut_bn"))?,
            dropout: Dropout::new(drop_rate),
        })
    }

    fn forward(&self, x: &Tensor, mode: Mode) -> candle_core::Result<Tensor> {
        let train = mode.is_train();
        let mut h = x.clone();
        for (i, (conv, bn)) in self.convs.iter().zip(&self.bns).enumerate() {
            h = bn.forward_t(&conv.forward(&h)?, train)?;
            if i < 2 {
                h = leaky(&h)?;
            }
        }
        let residual = self.shortcut_bn.forward_t(&self.shortcut.forward(x)?, train)?;
        let out = leaky(&(h + residual)?)?.max_pool2d(2)?;
        self.dropout.forward_t(&out, train)
    }
}

/// ResNet-12 with stage widths 64/160/320/640.
pub struct ResNet12Backbone {
    stages: Vec<ResidualStage>,
}

impl ResNet12Backbone {
    /// Stage widths.
    pub const WIDTHS: [usize; 4] = [64, 160, 320, 640];

    /// Build the backbone for `in_channels`-channel inputs.
    pub fn new(in_channels: usize, drop_rate: f32, vb: VarBuilder) -> Result<Self> {
        let mut stages = Vec::with_capacity(4);
        let mut in_c = in_channels;
        for (i, planes) in Self::WIDTHS.into_iter().enumerate() {
            stages.push(ResidualStage::new(in_c, planes, drop_rate, vb.pp(format!("layer{i}")))?);
            in_c = planes;
        }
        Ok(Self { stages })
    }

    fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        expect_image_batch(x)?;
        let mut h = x.clone();
        for stage in &self.stages {
            h = stage.forward(&h, mode)?;
        }
        Ok(h.flatten_from(1)?)
    }
}

/// Backbone variant selected once from configuration.
pub enum Backbone {
    /// Four-block conv net.
    ProtoNet(ProtoNetBackbone),
    /// R2D2 conv net.
    R2d2(R2d2Backbone),
    /// ResNet-12.
    ResNet12(ResNet12Backbone),
    /// Flattens each input.
    Identity,
}

impl Backbone {
    /// Build the configured backbone. `in_channels` is the channel dimension
    /// of image inputs and is ignored by [`Backbone::Identity`].
    ///
    /// # Errors
    ///
    /// Returns an error if parameter creation fails.
    pub fn build(
        network: Network,
        settings: &EmbeddingSettings,
        in_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(match network {
            Network::ProtoNet => {
                Self::ProtoNet(ProtoNetBackbone::new(in_channels, settings.normalize, vb)?)
            }
            Network::R2d2 => Self::R2d2(R2d2Backbone::new(in_channels, settings.drop_rate, vb)?),
            Network::ResNet => {
                Self::ResNet12(ResNet12Backbone::new(in_channels, settings.drop_rate, vb)?)
            }
            Network::Identity => Self::Identity,
        })
    }

    /// Features `[n, d]` for inputs `[n, ...]`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::ShapeMismatch`] when a convolutional backbone
    /// receives non-image inputs.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        match self {
            Self::ProtoNet(net) => net.forward(x, mode),
            Self::R2d2(net) => net.forward(x, mode),
            Self::ResNet12(net) => net.forward(x, mode),
            Self::Identity => Ok(x.flatten_from(1)?),
        }
    }
}

//! Parameterised layers with the run-wide initialisation policy.
//!
//! Weights of dense and conv layers start from N(0, 0.02), biases from 0.
//! BatchNorm scales start from N(1, 0.02), shifts from 0, running stats 0/1.

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, Linear, ModuleT, VarBuilder};

/// Small Gaussian init shared by every weight matrix and filter bank.
pub const WEIGHT_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};

const BIAS_INIT: Init = Init::Const(0.);

pub const BN_SCALE_INIT: Init = Init::Randn {
    mean: 1.,
    stdev: 0.02,
};

const BN_EPS: f64 = 1e-5;

/// Fully connected layer `out = x @ W^T + b`.
pub fn dense(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", WEIGHT_INIT)?;
    let bs = vb.get_with_hints(out_dim, "bias", BIAS_INIT)?;
    Ok(Linear::new(ws, Some(bs)))
}

/// 3×3 convolution, stride 1, "same" padding.
pub fn conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let ws = vb.get_with_hints((out_channels, in_channels, 3, 3), "weight", WEIGHT_INIT)?;
    let bs = vb.get_with_hints(out_channels, "bias", BIAS_INIT)?;
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(Conv2d::new(ws, Some(bs), cfg))
}

/// Per-channel BatchNorm over `[batch, channels, h, w]`. The running
/// statistics are `Var`s of the same `VarMap`, so they are saved, loaded and
/// snapshotted with the rest of the parameters.
pub fn batch_norm2d(num_features: usize, vb: VarBuilder) -> Result<BatchNorm> {
    let running_mean = vb.get_with_hints(num_features, "running_mean", Init::Const(0.))?;
    let running_var = vb.get_with_hints(num_features, "running_var", Init::Const(1.))?;
    let weight = vb.get_with_hints(num_features, "weight", BN_SCALE_INIT)?;
    let bias = vb.get_with_hints(num_features, "bias", BIAS_INIT)?;
    BatchNorm::new(num_features, running_mean, running_var, weight, bias, BN_EPS)
}

// ── ConvBlock ───────────────────────────────────────────────────────────────

/// conv3x3 → BatchNorm → ReLU → 2×2 max-pool.
///
/// BatchNorm normalises with batch statistics (and updates its running
/// averages) in training mode, and with the running averages in evaluation
/// mode.
pub struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv = conv3x3(in_channels, out_channels, vb.pp("conv"))?;
        let bn = batch_norm2d(out_channels, vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.apply(&self.conv)?;
        let x = self.bn.forward_t(&x, train)?;
        x.relu()?.max_pool2d(2)
    }
}

//! Image classifiers and the [`Classifier`] handle the training loop drives.
//!
//! A `Classifier` owns its own `VarMap`: two handles never share parameters,
//! even when one was built as a copy of the other. The train/eval mode is an
//! explicit field, read on every forward pass by dropout and BatchNorm.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder, VarMap};

use robust_common::{ModelConfig, ModelKind};

use crate::linear::{dense, ConvBlock};
use crate::noise::Noise;

// ── Mode ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

// ── Architectures ───────────────────────────────────────────────────────────

/// Flattened pixels → class scores.
pub struct LinearNet {
    fc: Linear,
}

impl LinearNet {
    pub fn new(in_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc: dense(in_dim, num_classes, vb.pp("fc"))?,
        })
    }
}

impl ModuleT for LinearNet {
    fn forward_t(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        self.fc.forward(&x.flatten_from(1)?)
    }
}

/// Flatten → dense → ReLU → dropout → dense.
pub struct Mlp {
    fc1: Linear,
    dropout: Dropout,
    fc2: Linear,
}

impl Mlp {
    pub fn new(in_dim: usize, config: &ModelConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: dense(in_dim, config.hidden_size, vb.pp("fc1"))?,
            dropout: Dropout::new(config.dropout),
            fc2: dense(config.hidden_size, num_classes, vb.pp("fc2"))?,
        })
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.fc1.forward(&x.flatten_from(1)?)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        self.fc2.forward(&x)
    }
}

/// VGG-style stack of [`ConvBlock`]s, then dense → ReLU → dropout → dense.
///
/// `noise_inner` is injected in front of every block except the first.
pub struct Cnn {
    blocks: Vec<ConvBlock>,
    noise_inner: Noise,
    fc1: Linear,
    dropout: Dropout,
    fc2: Linear,
}

impl Cnn {
    pub fn new(
        shape: (usize, usize, usize),
        config: &ModelConfig,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (mut c, mut h, mut w) = shape;
        let mut blocks = Vec::with_capacity(config.conv_channels.len());
        for (i, &out) in config.conv_channels.iter().enumerate() {
            blocks.push(ConvBlock::new(c, out, vb.pp(format!("features.{i}")))?);
            c = out;
            h /= 2;
            w /= 2;
        }
        if h == 0 || w == 0 {
            candle_core::bail!(
                "{} pooling stages reduce a {}x{} input to nothing",
                blocks.len(),
                shape.1,
                shape.2
            );
        }
        Ok(Self {
            blocks,
            noise_inner: Noise::new(config.noise_inner),
            fc1: dense(c * h * w, config.hidden_size, vb.pp("classifier.fc1"))?,
            dropout: Dropout::new(config.dropout),
            fc2: dense(config.hidden_size, num_classes, vb.pp("classifier.fc2"))?,
        })
    }
}

impl ModuleT for Cnn {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                x = self.noise_inner.forward(&x)?;
            }
            x = block.forward_t(&x, train)?;
        }
        let x = self.fc1.forward(&x.flatten_from(1)?)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        self.fc2.forward(&x)
    }
}

/// Architecture selected by [`ModelKind`].
pub enum Network {
    Linear(LinearNet),
    Mlp(Mlp),
    Cnn(Cnn),
}

impl Network {
    pub fn new(
        config: &ModelConfig,
        shape: (usize, usize, usize),
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (c, h, w) = shape;
        match config.kind {
            ModelKind::Linear => Ok(Self::Linear(LinearNet::new(c * h * w, num_classes, vb)?)),
            ModelKind::Mlp => Ok(Self::Mlp(Mlp::new(c * h * w, config, num_classes, vb)?)),
            ModelKind::Cnn => Ok(Self::Cnn(Cnn::new(shape, config, num_classes, vb)?)),
        }
    }
}

impl ModuleT for Network {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Linear(m) => m.forward_t(x, train),
            Self::Mlp(m) => m.forward_t(x, train),
            Self::Cnn(m) => m.forward_t(x, train),
        }
    }
}

// ── Classifier ──────────────────────────────────────────────────────────────

/// A network plus the parameters it owns and its current mode.
pub struct Classifier {
    network: Network,
    noise_init: Noise,
    varmap: VarMap,
    mode: Mode,
    config: ModelConfig,
    shape: (usize, usize, usize),
    num_classes: usize,
    device: Device,
}

impl Classifier {
    /// Build a freshly initialised classifier. Starts in training mode.
    pub fn new(
        config: &ModelConfig,
        shape: (usize, usize, usize),
        num_classes: usize,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let network = Network::new(config, shape, num_classes, vb)?;
        tracing::debug!(
            kind = %config.kind,
            params = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "Built classifier"
        );
        Ok(Self {
            network,
            noise_init: Noise::new(config.noise_init),
            varmap,
            mode: Mode::Train,
            config: config.clone(),
            shape,
            num_classes,
            device: device.clone(),
        })
    }

    /// An independent classifier with the same architecture, mode and a
    /// by-value copy of every parameter.
    pub fn duplicate(&self) -> Result<Self> {
        let mut copy = Self::new(&self.config, self.shape, self.num_classes, &self.device)?;
        copy.restore(&self.snapshot()?)?;
        copy.mode = self.mode;
        Ok(copy)
    }

    /// Class scores `[batch, num_classes]` for `x` of shape `[batch, c, h, w]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.noise_init.forward(x)?;
        self.network.forward_t(&x, self.mode == Mode::Train)
    }

    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Every parameter, including BatchNorm running statistics.
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_params(&self) -> usize {
        self.vars().iter().map(|v| v.elem_count()).sum()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Write all parameters to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)
    }

    /// Overwrite all parameters in place from a safetensors file. Existing
    /// `Var` handles stay bound to this classifier.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)
    }

    /// Deep copy of every parameter, keyed by name.
    pub fn snapshot(&self) -> Result<HashMap<String, Tensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;
        data.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite parameters in place from a [`snapshot`](Self::snapshot).
    /// Every parameter must be present with a matching shape.
    pub fn restore(&mut self, snapshot: &HashMap<String, Tensor>) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;
        for (name, var) in data.iter() {
            let src = snapshot
                .get(name)
                .ok_or_else(|| candle_core::Error::Msg(format!("snapshot lacks parameter {name}")))?;
            var.set(&src.to_device(&self.device)?)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn small(kind: ModelKind) -> ModelConfig {
        ModelConfig {
            kind,
            hidden_size: 8,
            dropout: 0.5,
            conv_channels: vec![4, 8],
            noise_init: 0.0,
            noise_inner: 0.0,
        }
    }

    #[test]
    fn every_kind_produces_class_scores() {
        let x = Tensor::randn(0f32, 1f32, (3, 3, 8, 8), &Device::Cpu).unwrap();
        for kind in [ModelKind::Linear, ModelKind::Mlp, ModelKind::Cnn] {
            let mut model = Classifier::new(&small(kind), (3, 8, 8), 10, &Device::Cpu).unwrap();
            assert_eq!(model.forward(&x).unwrap().dims(), &[3, 10]);
            model.eval();
            assert_eq!(model.forward(&x).unwrap().dims(), &[3, 10]);
        }
    }

    #[test]
    fn eval_mode_is_deterministic() {
        let mut model = Classifier::new(&small(ModelKind::Mlp), (1, 4, 4), 3, &Device::Cpu).unwrap();
        assert_eq!(model.mode(), Mode::Train);
        model.eval();
        let x = Tensor::randn(0f32, 1f32, (5, 1, 4, 4), &Device::Cpu).unwrap();
        let a = flat(&model.forward(&x).unwrap());
        let b = flat(&model.forward(&x).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_owns_separate_parameters() {
        let source = Classifier::new(&small(ModelKind::Linear), (1, 2, 2), 2, &Device::Cpu).unwrap();
        let copy = source.duplicate().unwrap();
        let before = source.snapshot().unwrap();
        assert_eq!(flat(&before["fc.weight"]), flat(&copy.snapshot().unwrap()["fc.weight"]));

        let w = copy.vars().into_iter().find(|v| v.dims() == [2, 4]).unwrap();
        w.set(&w.as_tensor().ones_like().unwrap()).unwrap();

        let after = source.snapshot().unwrap();
        assert_eq!(flat(&before["fc.weight"]), flat(&after["fc.weight"]));
        assert_eq!(flat(&copy.snapshot().unwrap()["fc.weight"]), vec![1.0; 8]);
    }

    #[test]
    fn save_load_round_trip_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.safetensors");
        let model = Classifier::new(&small(ModelKind::Cnn), (3, 8, 8), 10, &Device::Cpu).unwrap();
        model.save(&path).unwrap();

        let mut other = Classifier::new(&small(ModelKind::Cnn), (3, 8, 8), 10, &Device::Cpu).unwrap();
        other.load(&path).unwrap();
        let a = model.snapshot().unwrap();
        let b = other.snapshot().unwrap();
        assert_eq!(a.len(), b.len());
        for (name, t) in &a {
            assert_eq!(flat(t), flat(&b[name]), "{name}");
        }
    }

    #[test]
    fn restore_rejects_incomplete_snapshot() {
        let mut model = Classifier::new(&small(ModelKind::Mlp), (1, 2, 2), 2, &Device::Cpu).unwrap();
        let mut snap = model.snapshot().unwrap();
        snap.remove("fc2.bias");
        assert!(model.restore(&snap).is_err());
    }
}

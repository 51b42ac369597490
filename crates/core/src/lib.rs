//! # robust-core: Classifiers
//!
//! Differentiable image classifiers behind a single handle:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`linear`] | init policy, `dense`, `conv3x3`, `ConvBlock` |
//! | [`noise`] | `Noise` (Gaussian input / inner-layer noise) |
//! | [`model`] | `LinearNet`, `Mlp`, `Cnn`, `Network`, `Classifier`, `Mode` |
//!
//! Everything goes through `candle-core`/`candle-nn`; parameters live in a
//! per-classifier `VarMap` and serialise to safetensors.

pub mod linear;
pub mod model;
pub mod noise;

pub use model::{Classifier, Mode, Network};
pub use noise::Noise;

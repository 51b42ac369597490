//! SGD with momentum and L2 weight decay.
//!
//! Update per parameter `w` with gradient `g`:
//!
//! ```text
//! d = g + λ·w
//! v = μ·v + d
//! w = w - lr·v
//! ```
//!
//! The velocity starts at zero, so the first step uses `v = d`.

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 1.0,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

#[derive(Debug)]
struct VarSgd {
    var: Var,
    velocity: Var,
}

/// Momentum SGD over a fixed set of `Var`s. Setting values on the bound
/// `Var`s from elsewhere (e.g. a checkpoint reload) is seen by the next step.
#[derive(Debug)]
pub struct MomentumSgd {
    vars: Vec<VarSgd>,
    params: ParamsSgd,
}

impl MomentumSgd {
    pub fn params(&self) -> &ParamsSgd {
        &self.params
    }
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let velocity = Var::zeros(var.dims(), var.dtype(), var.device())?;
                Ok(VarSgd { var, velocity })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;
        for p in &self.vars {
            // Parameters without a gradient (e.g. BatchNorm running stats) are left alone.
            let Some(g) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let theta = p.var.as_tensor().detach();
            let d = if weight_decay > 0.0 {
                (g + theta.affine(weight_decay, 0.0)?)?
            } else {
                g.clone()
            };
            let v = (p.velocity.as_tensor().affine(momentum, 0.0)? + d)?;
            let next = (theta - v.affine(lr, 0.0)?)?;
            p.var.set(&next)?;
            p.velocity.set(&v)?;
        }
        Ok(())
    }
}

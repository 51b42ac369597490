//! Single-step gradient-sign (FGSM) adversarial examples and the per-batch
//! clean/adversarial mixing policy shared by training and evaluation.

use anyhow::Result;
use candle_core::{Tensor, Var};
use candle_nn::loss;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use robust_core::{Classifier, Mode};

/// `input + epsilon * sign(∂ CE(source(input), labels) / ∂ input)`.
///
/// The source model must be in evaluation mode. Its parameters are not
/// touched: the backward pass only serves to read the input gradient, and
/// the returned tensor is detached from that graph.
pub fn fgsm(input: &Tensor, labels: &Tensor, source: &Classifier, epsilon: f64) -> Result<Tensor> {
    anyhow::ensure!(
        source.mode() == Mode::Eval,
        "adversarial source model must be in evaluation mode"
    );
    let x = Var::from_tensor(&input.detach())?;
    let logits = source.forward(x.as_tensor())?;
    let loss = loss::cross_entropy(&logits, labels)?;
    let grads = loss.backward()?;
    let grad = grads
        .get(x.as_tensor())
        .ok_or_else(|| anyhow::anyhow!("loss has no gradient with respect to the input"))?;
    let step = grad.sign()?.affine(epsilon, 0.0)?;
    Ok(input.detach().add(&step)?.detach())
}

// ── Coin flips ──────────────────────────────────────────────────────────────

/// Source of the per-batch clean/adversarial decision.
pub trait CoinFlip {
    /// `true` selects the adversarial input.
    fn flip(&mut self) -> bool;
}

/// Fair coin over a seedable RNG.
pub struct SeededCoin {
    rng: StdRng,
}

impl SeededCoin {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl CoinFlip for SeededCoin {
    fn flip(&mut self) -> bool {
        self.rng.gen_bool(0.5)
    }
}

/// Always lands the same way; forces one branch.
#[derive(Debug, Clone, Copy)]
pub struct FixedCoin(pub bool);

impl CoinFlip for FixedCoin {
    fn flip(&mut self) -> bool {
        self.0
    }
}

// ── AdversarialMix ──────────────────────────────────────────────────────────

/// Everything needed to replace a clean batch with an FGSM batch: the attack
/// source (a separate handle from the model being trained or evaluated),
/// the budget, and the coin.
pub struct AdversarialMix<'a> {
    pub source: &'a mut Classifier,
    pub epsilon: f64,
    pub coin: &'a mut dyn CoinFlip,
}

impl<'a> AdversarialMix<'a> {
    pub fn new(source: &'a mut Classifier, epsilon: f64, coin: &'a mut dyn CoinFlip) -> Self {
        Self {
            source,
            epsilon,
            coin,
        }
    }

    /// Flip the coin once for this batch. Returns the input to feed forward
    /// and whether it is the perturbed one.
    pub fn mix(&mut self, input: &Tensor, labels: &Tensor) -> Result<(Tensor, bool)> {
        if self.coin.flip() {
            Ok((fgsm(input, labels, &*self.source, self.epsilon)?, true))
        } else {
            Ok((input.clone(), false))
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

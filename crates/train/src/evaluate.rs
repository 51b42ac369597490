//! Held-out evaluation and the hand-off to the best-checkpoint tracker.

use anyhow::Result;

use robust_common::{batch_to_tensors, BatchDataset};
use robust_core::Classifier;

use crate::attack::AdversarialMix;
use crate::checkpoint::BestCheckpoint;
use crate::epoch::count_correct;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalStats {
    pub accuracy: f64,
    pub examples: usize,
    pub adversarial_batches: usize,
}

/// Accuracy of `model` (in evaluation mode) over `data`. With `mix`, each
/// batch is replaced by its FGSM counterpart on a coin flip, exactly as in
/// training. Never updates `model`.
pub fn measure_accuracy(
    data: &dyn BatchDataset,
    model: &mut Classifier,
    mut mix: Option<AdversarialMix<'_>>,
) -> Result<EvalStats> {
    model.eval();
    if let Some(m) = mix.as_mut() {
        m.source.eval();
    }
    let shape = data.image_shape();
    let device = model.device().clone();
    let mut correct = 0usize;
    let mut total = 0usize;
    let mut adversarial_batches = 0usize;

    for batch in data.batches() {
        let (x, y) = batch_to_tensors(&batch, shape, &device)?;
        let x = match mix.as_mut() {
            Some(m) => {
                let (x, perturbed) = m.mix(&x, &y)?;
                adversarial_batches += perturbed as usize;
                x
            }
            None => x,
        };
        let logits = model.forward(&x)?.detach();
        correct += count_correct(&logits, &y)?;
        total += batch.len();
    }

    let expected = data.num_examples();
    if total != expected {
        anyhow::bail!("evaluation pass saw {total} of {expected} examples");
    }
    if total == 0 {
        anyhow::bail!("evaluation set produced no examples");
    }
    Ok(EvalStats {
        accuracy: correct as f64 / total as f64,
        examples: total,
        adversarial_batches,
    })
}

/// Evaluate, then let `tracker` decide whether to persist `model`.
/// Returns `(current accuracy, best accuracy after this call)`.
pub fn evaluate(
    data: &dyn BatchDataset,
    model: &mut Classifier,
    tracker: &mut BestCheckpoint,
    mix: Option<AdversarialMix<'_>>,
) -> Result<(f64, f64)> {
    let stats = measure_accuracy(data, model, mix)?;
    let best = tracker.consider(stats.accuracy, model)?;
    Ok((stats.accuracy, best))
}

// ── Tests ───────────────────────────────────────────────────────────────────

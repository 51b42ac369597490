//! One training pass over a dataset, with optional clean/FGSM mixing.

use std::time::{Duration, Instant};

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::Optimizer;

use robust_common::{batch_to_tensors, BatchDataset};
use robust_core::Classifier;

use crate::attack::AdversarialMix;

/// Loss between class scores `[n, k]` and `u32` labels `[n]`.
pub type LossFn = fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>;

/// Summary of one training pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub elapsed: Duration,
    /// correct / total over the whole pass.
    pub accuracy: f64,
    pub mean_loss: f64,
    pub examples: usize,
    pub adversarial_batches: usize,
}

/// Number of rows whose argmax equals the label.
pub fn count_correct(logits: &Tensor, labels: &Tensor) -> candle_core::Result<usize> {
    let hits = logits
        .argmax(D::Minus1)?
        .eq(labels)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(hits as usize)
}

/// Train `model` for one pass over `data`.
///
/// Per batch: optionally swap in an FGSM batch generated from `mix.source`,
/// forward, loss, backward, one optimiser step. Gradients are recomputed
/// from scratch for each batch. The attack source is put in evaluation mode
/// for the whole pass; `model` in training mode.
pub fn train_epoch<O: Optimizer>(
    data: &dyn BatchDataset,
    model: &mut Classifier,
    loss_fn: LossFn,
    optimizer: &mut O,
    mut mix: Option<AdversarialMix<'_>>,
) -> Result<EpochStats> {
    model.train();
    if let Some(m) = mix.as_mut() {
        m.source.eval();
    }
    let start = Instant::now();
    let shape = data.image_shape();
    let device = model.device().clone();

    let mut correct = 0usize;
    let mut total = 0usize;
    let mut loss_sum = 0.0f64;
    let mut batches = 0usize;
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
        let logits = model.forward(&x)?;
        let loss = loss_fn(&logits, &y)?;
        optimizer.backward_step(&loss)?;

        correct += count_correct(&logits, &y)?;
        total += batch.len();
        loss_sum += loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        batches += 1;
    }

    let expected = data.num_examples();
    if total != expected {
        anyhow::bail!("training pass saw {total} of {expected} examples");
    }
    if total == 0 {
        anyhow::bail!("training set produced no examples");
    }
    let elapsed = start.elapsed();
    let mean_loss = loss_sum / batches as f64;
    tracing::debug!(
        batches,
        adversarial_batches,
        correct,
        total,
        mean_loss = format!("{mean_loss:.5}"),
        elapsed_ms = elapsed.as_millis() as u64,
        "Training pass done"
    );
    Ok(EpochStats {
        elapsed,
        accuracy: correct as f64 / total as f64,
        mean_loss,
        examples: total,
        adversarial_batches,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use candle_core::Device;
    use candle_nn::loss;
    use robust_common::{DataLoader, ImageDataset, ModelConfig, ModelKind};

    use crate::attack::FixedCoin;
    use crate::optim::{MomentumSgd, ParamsSgd};

    fn blobs() -> Arc<ImageDataset> {
        // Two separable clusters in 4-d.
        let mut pixels = Vec::new();
        let mut labels = Vec::new();
        for i in 0..12 {
            let c = (i % 2) as u32;
            let s = if c == 0 { 1.0 } else { -1.0 };
            let j = i as f32 * 0.01;
            pixels.extend_from_slice(&[s + j, s - j, -s + j, -s]);
            labels.push(c);
        }
        Arc::new(ImageDataset::new(pixels, labels, (1, 2, 2)).unwrap())
    }

    fn linear() -> Classifier {
        let config = ModelConfig {
            kind: ModelKind::Linear,
            ..Default::default()
        };
        Classifier::new(&config, (1, 2, 2), 2, &Device::Cpu).unwrap()
    }

    fn sgd(model: &Classifier) -> MomentumSgd {
        MomentumSgd::new(
            model.vars(),
            ParamsSgd {
                lr: 0.5,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn count_correct_uses_argmax() {
        let logits = Tensor::new(&[[0.1f32, 0.9], [2.0, -1.0], [0.0, 3.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[1u32, 1, 1], &Device::Cpu).unwrap();
        assert_eq!(count_correct(&logits, &labels).unwrap(), 2);
    }

    #[test]
    fn training_reaches_full_accuracy_on_separable_data() {
        let loader = DataLoader::new(blobs(), 4);
        let mut model = linear();
        let mut opt = sgd(&model);
        let mut last = None;
        for _ in 0..5 {
            last = Some(train_epoch(&loader, &mut model, loss::cross_entropy, &mut opt, None).unwrap());
        }
        let stats = last.unwrap();
        assert_eq!(stats.examples, 12);
        assert_eq!(stats.accuracy, 1.0);
        assert_eq!(stats.adversarial_batches, 0);
        assert_eq!(model.mode(), robust_core::Mode::Train);
    }

    #[test]
    fn zero_epsilon_mixing_matches_clean_training_exactly() {
        let loader = DataLoader::new(blobs(), 5);
        let mut clean = linear();
        let mut mixed = clean.duplicate().unwrap();
        let mut source = clean.duplicate().unwrap();

        let mut opt_clean = sgd(&clean);
        let mut opt_mixed = sgd(&mixed);
        let mut heads = FixedCoin(true);

        let a = train_epoch(&loader, &mut clean, loss::cross_entropy, &mut opt_clean, None).unwrap();
        let mix = AdversarialMix::new(&mut source, 0.0, &mut heads);
        let b = train_epoch(&loader, &mut mixed, loss::cross_entropy, &mut opt_mixed, Some(mix)).unwrap();

        assert_eq!(a.accuracy, b.accuracy);
        assert_eq!(b.adversarial_batches, 3);
        assert_eq!(source.mode(), robust_core::Mode::Eval);
        let sa = clean.snapshot().unwrap();
        let sb = mixed.snapshot().unwrap();
        for (name, t) in &sa {
            assert_eq!(flat(t), flat(&sb[name]), "{name}");
        }
    }

    #[test]
    fn adversarial_training_leaves_source_untouched() {
        let loader = DataLoader::new(blobs(), 4);
        let mut source = linear();
        let mut defended = source.duplicate().unwrap();
        let before = source.snapshot().unwrap();
        let mut opt = sgd(&defended);
        let mut heads = FixedCoin(true);
        let mix = AdversarialMix::new(&mut source, 0.3, &mut heads);
        train_epoch(&loader, &mut defended, loss::cross_entropy, &mut opt, Some(mix)).unwrap();

        let after = source.snapshot().unwrap();
        for (name, t) in &before {
            assert_eq!(flat(t), flat(&after[name]), "{name}");
        }
        assert_ne!(
            flat(&defended.snapshot().unwrap()["fc.weight"]),
            flat(&before["fc.weight"])
        );
    }

    /// Claims more examples than its batches deliver.
    pub(crate) struct ShortPass(pub DataLoader);

    impl BatchDataset for ShortPass {
        fn num_examples(&self) -> usize {
            self.0.num_examples() + 1
        }

        fn image_shape(&self) -> (usize, usize, usize) {
            self.0.image_shape()
        }

        fn batches(&self) -> Box<dyn Iterator<Item = robust_common::ImageBatch> + '_> {
            self.0.batches()
        }
    }

    #[test]
    fn pass_that_stops_early_is_an_error() {
        let data = ShortPass(DataLoader::new(blobs(), 4));
        let mut model = linear();
        let mut opt = sgd(&model);
        let err = train_epoch(&data, &mut model, loss::cross_entropy, &mut opt, None).unwrap_err();
        assert!(err.to_string().contains("12 of 13"), "{err}");
    }

    #[test]
    fn empty_dataset_is_an_error() {
        let empty = Arc::new(ImageDataset::new(vec![], vec![], (1, 2, 2)).unwrap());
        let loader = DataLoader::new(empty, 4);
        let mut model = linear();
        let mut opt = sgd(&model);
        assert!(train_epoch(&loader, &mut model, loss::cross_entropy, &mut opt, None).is_err());
    }
}

//! Trainer: drives the staged schedule.
//!
//! Each stage builds a fresh optimiser over the trained model's `Var`s, runs
//! train/evaluate cycles for its epoch count, then reloads the best
//! checkpoint before the next stage. With adversarial training the model
//! handed to [`Trainer::new`] becomes the fixed attack source and an
//! independent copy of it is the one trained, evaluated and checkpointed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_nn::{loss, Optimizer};

use robust_common::{BatchDataset, RunConfig};
use robust_core::Classifier;

use crate::attack::{AdversarialMix, CoinFlip, SeededCoin};
use crate::checkpoint::BestCheckpoint;
use crate::epoch::{train_epoch, LossFn};
use crate::evaluate::evaluate;
use crate::optim::{MomentumSgd, ParamsSgd};
use crate::progress::{EpochRecord, ProgressSink, StageStart};
use crate::scheduler::{StageSchedule, StageState};

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub schedule: StageSchedule,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Train a defended copy on mixed clean/FGSM batches.
    pub adversarial: bool,
    pub epsilon: f64,
    /// Best-checkpoint path.
    pub checkpoint: PathBuf,
}

impl TrainerConfig {
    pub fn from_run(run: &RunConfig) -> Self {
        Self {
            schedule: StageSchedule::from_config(&run.schedule),
            momentum: run.schedule.momentum,
            weight_decay: run.schedule.weight_decay,
            adversarial: run.adversarial,
            epsilon: run.epsilon,
            checkpoint: run.model_out.clone(),
        }
    }
}

/// Final state of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub epochs: usize,
    pub best_accuracy: f64,
    pub checkpoint_writes: usize,
    /// Cumulative training time in seconds.
    pub elapsed: f64,
    pub checkpoint: PathBuf,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer {
    /// Attack source when adversarial, otherwise the trained model.
    source: Classifier,
    defended: Option<Classifier>,
    config: TrainerConfig,
    tracker: BestCheckpoint,
    coin: Box<dyn CoinFlip>,
    loss_fn: LossFn,
}

impl Trainer {
    pub fn new(model: Classifier, config: TrainerConfig) -> Result<Self> {
        let mut source = model;
        let defended = if config.adversarial {
            let defended = source.duplicate()?;
            source.eval();
            Some(defended)
        } else {
            None
        };
        tracing::info!(
            params = source.num_params(),
            stages = config.schedule.num_stages(),
            epochs = config.schedule.total_epochs(),
            adversarial = config.adversarial,
            epsilon = config.epsilon,
            checkpoint = %config.checkpoint.display(),
            "Trainer ready"
        );
        Ok(Self {
            source,
            defended,
            tracker: BestCheckpoint::new(config.checkpoint.clone()),
            config,
            coin: Box::new(SeededCoin::from_entropy()),
            loss_fn: loss::cross_entropy,
        })
    }

    /// Replace the clean/adversarial coin.
    pub fn with_coin(mut self, coin: Box<dyn CoinFlip>) -> Self {
        self.coin = coin;
        self
    }

    /// The model being optimised: the defended copy when adversarial.
    pub fn trained_model(&self) -> &Classifier {
        self.defended.as_ref().unwrap_or(&self.source)
    }

    pub fn source_model(&self) -> &Classifier {
        &self.source
    }

    pub fn best_accuracy(&self) -> f64 {
        self.tracker.best()
    }

    pub fn checkpoint_writes(&self) -> usize {
        self.tracker.writes()
    }

    /// Run every stage to completion. On return the trained model holds the
    /// best checkpoint's parameters.
    pub fn run(
        &mut self,
        train: &dyn BatchDataset,
        test: &dyn BatchDataset,
        sink: &mut dyn ProgressSink,
    ) -> Result<RunSummary> {
        let Self {
            source,
            defended,
            config,
            tracker,
            coin,
            loss_fn,
        } = self;
        let (model, mut attack_source) = match defended.as_mut() {
            Some(d) => (d, Some(source)),
            None => (source, None),
        };

        let mut epoch = 0usize;
        let mut elapsed = 0.0f64;
        let mut state = config.schedule.start();
        loop {
            match state {
                StageState::Running(s) => {
                    let stage = config
                        .schedule
                        .stage(s)
                        .with_context(|| format!("stage {} is not scheduled", s + 1))?;
                    let mut optimizer = MomentumSgd::new(
                        model.vars(),
                        ParamsSgd {
                            lr: stage.lr,
                            momentum: config.momentum,
                            weight_decay: config.weight_decay,
                        },
                    )?;
                    tracing::info!(
                        stage = s + 1,
                        epochs = stage.epochs,
                        lr = optimizer.learning_rate(),
                        "Stage start"
                    );
                    sink.stage_start(
                        &StageStart {
                            stage: s,
                            epochs: stage.epochs,
                            lr: stage.lr,
                        },
                        model,
                    )?;

                    let writes_before = tracker.writes();
                    for _ in 0..stage.epochs {
                        let mix = attack_source
                            .as_deref_mut()
                            .map(|src| AdversarialMix::new(src, config.epsilon, coin.as_mut()));
                        let stats = train_epoch(train, model, *loss_fn, &mut optimizer, mix)?;
                        elapsed += stats.elapsed.as_secs_f64();

                        let writes = tracker.writes();
                        let mix = attack_source
                            .as_deref_mut()
                            .map(|src| AdversarialMix::new(src, config.epsilon, coin.as_mut()));
                        let (test_accuracy, best_accuracy) = evaluate(test, model, tracker, mix)?;

                        epoch += 1;
                        let record = EpochRecord {
                            epoch,
                            stage: s,
                            lr: optimizer.learning_rate(),
                            elapsed,
                            train_accuracy: stats.accuracy,
                            test_accuracy,
                            best_accuracy,
                            checkpoint_written: tracker.writes() > writes,
                        };
                        sink.epoch_end(&record)?;
                        sink.after_epoch(&record, model)?;
                    }
                    if tracker.writes() == writes_before {
                        tracing::warn!(
                            stage = s + 1,
                            best = format!("{:.5}", tracker.best()),
                            "Stage ended without improving on the best accuracy"
                        );
                    }
                }
                StageState::Boundary(s) => {
                    tracker
                        .reload_into(model)
                        .with_context(|| format!("stage {} boundary reload", s + 1))?;
                    tracing::info!(
                        stage = s + 1,
                        best = format!("{:.5}", tracker.best()),
                        path = %tracker.path().display(),
                        "Reloaded best checkpoint"
                    );
                }
                StageState::Done => break,
            }
            state = config.schedule.next(state);
        }

        Ok(RunSummary {
            epochs: epoch,
            best_accuracy: tracker.best(),
            checkpoint_writes: tracker.writes(),
            elapsed,
            checkpoint: tracker.path().to_path_buf(),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

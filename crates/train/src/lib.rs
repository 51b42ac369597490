//! # robust-train: The Training Loop
//!
//! Staged training with optional FGSM adversarial mixing:
//!
//! * **[`fgsm`]** / **[`AdversarialMix`]**: single-step gradient-sign
//!   examples and the per-batch clean/adversarial coin.
//! * **[`train_epoch`]** / **[`evaluate`]**: one training pass; one held-out
//!   pass that hands its accuracy to the tracker.
//! * **[`BestCheckpoint`]**: writes the checkpoint only on strict improvement.
//! * **[`StageSchedule`]**: fixed stage lengths, learning rate divided at
//!   each boundary.
//! * **[`Trainer`]**: owns the models, schedule and tracker; reloads the best
//!   checkpoint at every stage boundary.

pub mod attack;
pub mod checkpoint;
pub mod epoch;
pub mod evaluate;
pub mod optim;
pub mod progress;
pub mod scheduler;
pub mod trainer;

pub use attack::{fgsm, AdversarialMix, CoinFlip, FixedCoin, SeededCoin};
pub use checkpoint::{consider_update, BestCheckpoint};
pub use epoch::{count_correct, train_epoch, EpochStats, LossFn};
pub use evaluate::{evaluate, measure_accuracy, EvalStats};
pub use optim::{MomentumSgd, ParamsSgd};
pub use progress::{EpochRecord, LineSink, MetricsCsv, NullSink, ProgressSink, StageStart};
pub use scheduler::{Stage, StageSchedule, StageState};
pub use trainer::{RunSummary, Trainer, TrainerConfig};

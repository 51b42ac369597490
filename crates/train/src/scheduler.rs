//! Stage schedule: piecewise-constant learning rate and the stage state machine.

use robust_common::ScheduleConfig;

// ── Stage schedule ──────────────────────────────────────────────────────────

/// Ordered stage lengths plus the learning-rate rule
/// `lr(s) = initial_lr / decay^s`, applied as repeated division so the
/// sequence matches dividing the running rate by `decay` at each boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSchedule {
    stage_epochs: Vec<usize>,
    lr: f64,
    decay: f64,
}

/// One stage as the trainer sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
    pub index: usize,
    pub epochs: usize,
    pub lr: f64,
}

impl StageSchedule {
    pub fn new(stage_epochs: Vec<usize>, lr: f64, decay: f64) -> Self {
        Self {
            stage_epochs,
            lr,
            decay,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(config.stage_epochs.clone(), config.lr, config.lr_decay)
    }

    pub fn num_stages(&self) -> usize {
        self.stage_epochs.len()
    }

    pub fn total_epochs(&self) -> usize {
        self.stage_epochs.iter().sum()
    }

    /// Learning rate of stage `stage` (0-based).
    pub fn lr(&self, stage: usize) -> f64 {
        let mut lr = self.lr;
        for _ in 0..stage {
            lr /= self.decay;
        }
        lr
    }

    pub fn stage(&self, index: usize) -> Option<Stage> {
        self.stage_epochs.get(index).map(|&epochs| Stage {
            index,
            epochs,
            lr: self.lr(index),
        })
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        (0..self.num_stages()).filter_map(|i| self.stage(i))
    }
}

// ── State machine ───────────────────────────────────────────────────────────

/// `Running(s)` trains stage `s`; `Boundary(s)` reloads the best checkpoint
/// after stage `s` finished; `Done` once every stage has crossed its boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Running(usize),
    Boundary(usize),
    Done,
}

impl StageSchedule {
    pub fn start(&self) -> StageState {
        if self.stage_epochs.is_empty() {
            StageState::Done
        } else {
            StageState::Running(0)
        }
    }

    pub fn next(&self, state: StageState) -> StageState {
        match state {
            StageState::Running(s) => StageState::Boundary(s),
            StageState::Boundary(s) if s + 1 < self.num_stages() => StageState::Running(s + 1),
            StageState::Boundary(_) | StageState::Done => StageState::Done,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

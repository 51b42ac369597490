//! Per-epoch progress records and where they go.
//!
//! The progress stream is not logging: it is one flushed line per epoch that
//! external monitors tail, plus an optional CSV copy.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use robust_core::Classifier;

/// One epoch of a run. `epoch` is 1-based and counts across stages;
/// `elapsed` is cumulative training time in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub stage: usize,
    pub lr: f64,
    pub elapsed: f64,
    pub train_accuracy: f64,
    pub test_accuracy: f64,
    pub best_accuracy: f64,
    pub checkpoint_written: bool,
}

impl fmt::Display for EpochRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Epoch={}] Time:{:.2}, Train: {:.5}, Test: {:.5}, Best: {:.5}",
            self.epoch, self.elapsed, self.train_accuracy, self.test_accuracy, self.best_accuracy
        )
    }
}

/// Emitted once a stage's optimiser is built and its weights are in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageStart {
    pub stage: usize,
    pub epochs: usize,
    pub lr: f64,
}

pub trait ProgressSink {
    /// `model` is the model about to be trained in this stage.
    fn stage_start(&mut self, _stage: &StageStart, _model: &Classifier) -> Result<()> {
        Ok(())
    }

    fn epoch_end(&mut self, record: &EpochRecord) -> Result<()>;

    /// Called after [`epoch_end`](Self::epoch_end) with the model as it
    /// stands once the epoch's evaluation is done.
    fn after_epoch(&mut self, _record: &EpochRecord, _model: &Classifier) -> Result<()> {
        Ok(())
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for Box<S> {
    fn stage_start(&mut self, stage: &StageStart, model: &Classifier) -> Result<()> {
        (**self).stage_start(stage, model)
    }

    fn epoch_end(&mut self, record: &EpochRecord) -> Result<()> {
        (**self).epoch_end(record)
    }

    fn after_epoch(&mut self, record: &EpochRecord, model: &Classifier) -> Result<()> {
        (**self).after_epoch(record, model)
    }
}

/// Fan out to several sinks in order.
impl<S: ProgressSink> ProgressSink for Vec<S> {
    fn stage_start(&mut self, stage: &StageStart, model: &Classifier) -> Result<()> {
        for sink in self.iter_mut() {
            sink.stage_start(stage, model)?;
        }
        Ok(())
    }

    fn epoch_end(&mut self, record: &EpochRecord) -> Result<()> {
        for sink in self.iter_mut() {
            sink.epoch_end(record)?;
        }
        Ok(())
    }

    fn after_epoch(&mut self, record: &EpochRecord, model: &Classifier) -> Result<()> {
        for sink in self.iter_mut() {
            sink.after_epoch(record, model)?;
        }
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn epoch_end(&mut self, _record: &EpochRecord) -> Result<()> {
        Ok(())
    }
}

// ── Line sink ───────────────────────────────────────────────────────────────

/// Writes each record's `Display` form as a line and flushes right away.
pub struct LineSink<W: Write> {
    out: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl LineSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ProgressSink for LineSink<W> {
    fn epoch_end(&mut self, record: &EpochRecord) -> Result<()> {
        writeln!(self.out, "{record}")?;
        self.out.flush()?;
        Ok(())
    }
}

// ── CSV sink ────────────────────────────────────────────────────────────────

pub const CSV_HEADER: &str = "epoch,stage,lr,time,train_acc,test_acc,best_acc";

pub struct MetricsCsv {
    out: BufWriter<File>,
}

impl MetricsCsv {
    /// Create (truncate) `path` and write the header.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file =
            File::create(path).with_context(|| format!("create metrics csv {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{CSV_HEADER}")?;
        out.flush()?;
        Ok(Self { out })
    }
}

impl ProgressSink for MetricsCsv {
    fn epoch_end(&mut self, r: &EpochRecord) -> Result<()> {
        writeln!(
            self.out,
            "{},{},{},{:.4},{:.6},{:.6},{:.6}",
            r.epoch,
            r.stage + 1,
            r.lr,
            r.elapsed,
            r.train_accuracy,
            r.test_accuracy,
            r.best_accuracy
        )?;
        self.out.flush()?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EpochRecord {
        EpochRecord {
            epoch: 3,
            stage: 1,
            lr: 0.1,
            elapsed: 12.3456,
            train_accuracy: 0.5,
            test_accuracy: 0.123456,
            best_accuracy: 0.75,
            checkpoint_written: false,
        }
    }

    #[test]
    fn progress_line_format() {
        assert_eq!(
            record().to_string(),
            "[Epoch=3] Time:12.35, Train: 0.50000, Test: 0.12346, Best: 0.75000"
        );
    }

    #[test]
    fn line_sink_writes_one_line_per_epoch() {
        let mut sink = LineSink::new(Vec::new());
        sink.epoch_end(&record()).unwrap();
        sink.epoch_end(&record()).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|l| l.starts_with("[Epoch=3]")));
    }

    #[test]
    fn csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/metrics.csv");
        let mut csv = MetricsCsv::create(&path).unwrap();
        csv.epoch_end(&record()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "3,2,0.1,12.3456,0.500000,0.123456,0.750000");
    }

    #[test]
    fn vec_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut sinks: Vec<Box<dyn ProgressSink>> = vec![
            Box::new(NullSink),
            Box::new(MetricsCsv::create(&path).unwrap()),
        ];
        sinks.epoch_end(&record()).unwrap();
        sinks.epoch_end(&record()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use robust_common::{load_dataset, Augment, DataLoader, RunConfig};
use robust_core::Classifier;
use robust_train::{
    measure_accuracy, AdversarialMix, LineSink, MetricsCsv, ProgressSink, SeededCoin, Trainer,
    TrainerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "robust", about = "Staged image classifier training with FGSM adversarial mixing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train through every stage, keeping only the best checkpoint.
    Train(RunArgs),
    /// Report test accuracy of a checkpoint (clean, and mixed with --adv).
    Eval(RunArgs),
}

/// Every flag overrides the matching field of `--config` (or the defaults).
#[derive(Args, Debug)]
struct RunArgs {
    /// Base run config (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
    /// cifar10 | stl10
    #[arg(long)]
    dataset: Option<String>,
    /// Directory holding the dataset's binary files.
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// linear | mlp | cnn
    #[arg(long)]
    net: Option<String>,
    /// Epochs per stage, e.g. 80,60,40,20.
    #[arg(long, value_delimiter = ',')]
    stages: Option<Vec<usize>>,
    #[arg(long)]
    lr: Option<f64>,
    /// Divisor applied to the learning rate at each stage boundary.
    #[arg(long)]
    lr_decay: Option<f64>,
    #[arg(long)]
    momentum: Option<f64>,
    #[arg(long)]
    weight_decay: Option<f64>,
    /// Mix FGSM batches into training and evaluation.
    #[arg(long)]
    adv: bool,
    #[arg(long)]
    epsilon: Option<f64>,
    /// Initial weights (train) or the checkpoint to score (eval).
    #[arg(long)]
    model_in: Option<PathBuf>,
    /// Best-checkpoint destination.
    #[arg(long)]
    model_out: Option<PathBuf>,
    #[arg(long)]
    noise_init: Option<f64>,
    #[arg(long)]
    noise_inner: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    /// Also write metrics.csv next to the checkpoint.
    #[arg(long)]
    metrics_csv: bool,
    /// Batches buffered ahead by the loader thread.
    #[arg(long)]
    prefetch: Option<usize>,
}

impl RunArgs {
    fn resolve(&self) -> Result<RunConfig> {
        let mut c = match &self.config {
            Some(path) => RunConfig::load(path)
                .with_context(|| format!("read run config {}", path.display()))?,
            None => RunConfig::default(),
        };
        if let Some(d) = &self.dataset {
            c.dataset = d.parse()?;
        }
        if let Some(n) = &self.net {
            c.model.kind = n.parse()?;
        }
        if let Some(v) = &self.root {
            c.root = v.clone();
        }
        if let Some(v) = self.batch_size {
            c.batch_size = v;
        }
        if let Some(v) = &self.stages {
            c.schedule.stage_epochs = v.clone();
        }
        if let Some(v) = self.lr {
            c.schedule.lr = v;
        }
        if let Some(v) = self.lr_decay {
            c.schedule.lr_decay = v;
        }
        if let Some(v) = self.momentum {
            c.schedule.momentum = v;
        }
        if let Some(v) = self.weight_decay {
            c.schedule.weight_decay = v;
        }
        c.adversarial |= self.adv;
        if let Some(v) = self.epsilon {
            c.epsilon = v;
        }
        if let Some(v) = &self.model_in {
            c.model_in = Some(v.clone());
        }
        if let Some(v) = &self.model_out {
            c.model_out = v.clone();
        }
        if let Some(v) = self.noise_init {
            c.model.noise_init = v;
        }
        if let Some(v) = self.noise_inner {
            c.model.noise_inner = v;
        }
        if self.seed.is_some() {
            c.seed = self.seed;
        }
        c.metrics_csv |= self.metrics_csv;
        if let Some(v) = self.prefetch {
            c.prefetch = v;
        }
        c.validate()?;
        Ok(c)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Eval(args) => cmd_eval(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

/// Independent seeds for the train loader, test loader and coin, drawn from
/// the run seed when there is one.
struct Seeds {
    train: u64,
    test: u64,
    coin: u64,
}

impl Seeds {
    fn new(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            train: rng.gen(),
            test: rng.gen(),
            coin: rng.gen(),
        }
    }
}

fn test_loader(config: &RunConfig, seed: u64) -> Result<DataLoader> {
    let test = load_dataset(config.dataset, &config.root, false)?;
    tracing::info!(examples = test.len(), dataset = %config.dataset, "Loaded test split");
    Ok(DataLoader::new(Arc::new(test), config.batch_size)
        .prefetch(config.prefetch)
        .seed(seed))
}

fn build_model(config: &RunConfig, device: &Device) -> Result<Classifier> {
    let mut model = Classifier::new(
        &config.model,
        config.dataset.image_shape(),
        config.dataset.num_classes(),
        device,
    )?;
    if let Some(path) = &config.model_in {
        model
            .load(path)
            .with_context(|| format!("load initial weights {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded initial weights");
    }
    Ok(model)
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.with_file_name(name)
}

fn cmd_train(args: RunArgs) -> Result<()> {
    let config = args.resolve()?;
    tracing::info!(config = ?config, "Effective run config");
    let seeds = Seeds::new(config.seed);

    let train = load_dataset(config.dataset, &config.root, true)?;
    tracing::info!(examples = train.len(), dataset = %config.dataset, "Loaded train split");
    let train = DataLoader::new(Arc::new(train), config.batch_size)
        .shuffle(true)
        .augment(Some(Augment::default()))
        .prefetch(config.prefetch)
        .seed(seeds.train);
    let test = test_loader(&config, seeds.test)?;

    let device = Device::cuda_if_available(0)?;
    let model = build_model(&config, &device)?;

    if let Some(dir) = config.model_out.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    config.save(&sibling(&config.model_out, "config.json"))?;

    let mut sinks: Vec<Box<dyn ProgressSink>> = vec![Box::new(LineSink::stdout())];
    if config.metrics_csv {
        sinks.push(Box::new(MetricsCsv::create(&sibling(
            &config.model_out,
            "metrics.csv",
        ))?));
    }

    let mut trainer = Trainer::new(model, TrainerConfig::from_run(&config))?
        .with_coin(Box::new(SeededCoin::new(seeds.coin)));
    let summary = trainer.run(&train, &test, &mut sinks)?;
    tracing::info!(
        epochs = summary.epochs,
        best = format!("{:.5}", summary.best_accuracy),
        writes = summary.checkpoint_writes,
        time = format!("{:.2}", summary.elapsed),
        checkpoint = %summary.checkpoint.display(),
        "Training complete"
    );
    Ok(())
}

fn cmd_eval(args: RunArgs) -> Result<()> {
    let config = args.resolve()?;
    if config.model_in.is_none() {
        anyhow::bail!("eval needs --model-in <checkpoint>");
    }
    let seeds = Seeds::new(config.seed);
    let test = test_loader(&config, seeds.test)?;
    let device = Device::cuda_if_available(0)?;
    let mut model = build_model(&config, &device)?;

    let clean = measure_accuracy(&test, &mut model, None)?;
    println!("Clean: {:.5} ({} examples)", clean.accuracy, clean.examples);

    if config.adversarial {
        let mut source = model.duplicate()?;
        let mut coin = SeededCoin::new(seeds.coin);
        let mix = AdversarialMix::new(&mut source, config.epsilon, &mut coin);
        let mixed = measure_accuracy(&test, &mut model, Some(mix))?;
        println!(
            "Mixed (epsilon={}): {:.5} ({} of {} batches perturbed)",
            config.epsilon,
            mixed.accuracy,
            mixed.adversarial_batches,
            mixed.examples.div_ceil(config.batch_size)
        );
    }
    Ok(())
}

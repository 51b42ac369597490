//! Data pipeline: binary image datasets, augmentation, prefetching batches.
//!
//! * **[`ImageDataset`]**: normalised `f32` images (CHW) plus `u32` labels in memory.
//! * **[`load_cifar10`]** / **[`load_stl10`]**: readers for the official binary releases.
//! * **[`DataLoader`]**: shuffles, augments and batches on a producer thread;
//!   the consumer sees a plain blocking iterator via [`BatchDataset`].

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::DatasetKind;

// ── Normalisation ───────────────────────────────────────────────────────────

/// Per-channel `(x / 255 - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

pub const CIFAR10_NORMALIZATION: Normalization = Normalization {
    mean: [0.4914, 0.4822, 0.4465],
    std: [0.2023, 0.1994, 0.2010],
};

pub const STL10_NORMALIZATION: Normalization = Normalization {
    mean: [0.5, 0.5, 0.5],
    std: [0.5, 0.5, 0.5],
};

impl Normalization {
    fn apply(&self, channel: usize, byte: u8) -> f32 {
        (byte as f32 / 255.0 - self.mean[channel]) / self.std[channel]
    }

    /// Value a raw black (0) pixel maps to; used as crop padding.
    fn zero_level(&self) -> Vec<f32> {
        (0..3).map(|c| self.apply(c, 0)).collect()
    }
}

// ── ImageDataset ────────────────────────────────────────────────────────────

/// In-memory labelled images, CHW layout, already normalised.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    pixels: Vec<f32>,
    labels: Vec<u32>,
    shape: (usize, usize, usize),
    /// Per-channel value used when a crop reaches past the image border.
    pad_value: Vec<f32>,
}

impl ImageDataset {
    /// Build from raw buffers. `pixels.len()` must equal `labels.len() * c * h * w`.
    pub fn new(
        pixels: Vec<f32>,
        labels: Vec<u32>,
        shape: (usize, usize, usize),
    ) -> AnyhowResult<Self> {
        let (c, h, w) = shape;
        let per_image = c * h * w;
        if per_image == 0 {
            anyhow::bail!("image shape {shape:?} is empty");
        }
        if pixels.len() != labels.len() * per_image {
            anyhow::bail!(
                "pixel buffer holds {} values, expected {} images x {per_image}",
                pixels.len(),
                labels.len()
            );
        }
        Ok(Self {
            pixels,
            labels,
            shape,
            pad_value: vec![0.0; c],
        })
    }

    fn with_pad_value(mut self, pad_value: Vec<f32>) -> Self {
        self.pad_value = pad_value;
        self
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// CHW pixels of image `i`.
    pub fn image(&self, i: usize) -> &[f32] {
        let (c, h, w) = self.shape;
        let n = c * h * w;
        &self.pixels[i * n..(i + 1) * n]
    }
}

// ── Binary readers ──────────────────────────────────────────────────────────

const CIFAR10_TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const CIFAR10_TEST_FILE: &str = "test_batch.bin";

/// Load CIFAR-10 from the "binary version" release: records of one label
/// byte followed by 3072 CHW pixel bytes.
pub fn load_cifar10(root: &Path, train: bool) -> AnyhowResult<ImageDataset> {
    let (c, h, w) = DatasetKind::Cifar10.image_shape();
    let image_bytes = c * h * w;
    let record = 1 + image_bytes;
    let files: Vec<&str> = if train {
        CIFAR10_TRAIN_FILES.to_vec()
    } else {
        vec![CIFAR10_TEST_FILE]
    };

    let mut pixels = Vec::new();
    let mut labels = Vec::new();
    for name in files {
        let path = root.join(name);
        let bytes = read_all(&path)?;
        if bytes.is_empty() || bytes.len() % record != 0 {
            anyhow::bail!(
                "{}: size {} is not a multiple of the {record}-byte record",
                path.display(),
                bytes.len()
            );
        }
        for rec in bytes.chunks_exact(record) {
            let label = rec[0] as u32;
            if label >= 10 {
                anyhow::bail!("{}: label {label} out of range", path.display());
            }
            labels.push(label);
            for (i, &b) in rec[1..].iter().enumerate() {
                pixels.push(CIFAR10_NORMALIZATION.apply(i / (h * w), b));
            }
        }
    }
    tracing::info!(
        split = if train { "train" } else { "test" },
        images = labels.len(),
        "Loaded CIFAR-10"
    );
    Ok(ImageDataset::new(pixels, labels, (c, h, w))?
        .with_pad_value(CIFAR10_NORMALIZATION.zero_level()))
}

/// Load STL-10 labelled splits (`train_X.bin`/`train_y.bin`,
/// `test_X.bin`/`test_y.bin`). Images are stored column-major per channel;
/// labels are 1-based.
pub fn load_stl10(root: &Path, train: bool) -> AnyhowResult<ImageDataset> {
    let (c, h, w) = DatasetKind::Stl10.image_shape();
    let image_bytes = c * h * w;
    let split = if train { "train" } else { "test" };
    let x_path = root.join(format!("{split}_X.bin"));
    let y_path = root.join(format!("{split}_y.bin"));
    let xs = read_all(&x_path)?;
    let ys = read_all(&y_path)?;
    if xs.len() != ys.len() * image_bytes {
        anyhow::bail!(
            "{}: {} bytes do not match {} labels in {}",
            x_path.display(),
            xs.len(),
            ys.len(),
            y_path.display()
        );
    }

    let mut pixels = Vec::with_capacity(xs.len());
    let mut labels = Vec::with_capacity(ys.len());
    for (img, &y) in xs.chunks_exact(image_bytes).zip(&ys) {
        if !(1..=10).contains(&y) {
            anyhow::bail!("{}: label {y} out of range", y_path.display());
        }
        labels.push(y as u32 - 1);
        for ch in 0..c {
            let plane = &img[ch * h * w..(ch + 1) * h * w];
            for row in 0..h {
                for col in 0..w {
                    pixels.push(STL10_NORMALIZATION.apply(ch, plane[col * h + row]));
                }
            }
        }
    }
    tracing::info!(split, images = labels.len(), "Loaded STL-10");
    Ok(ImageDataset::new(pixels, labels, (c, h, w))?
        .with_pad_value(STL10_NORMALIZATION.zero_level()))
}

/// Load the train or test split of `kind` from `root`.
pub fn load_dataset(kind: DatasetKind, root: &Path, train: bool) -> AnyhowResult<ImageDataset> {
    match kind {
        DatasetKind::Cifar10 => load_cifar10(root, train),
        DatasetKind::Stl10 => load_stl10(root, train),
    }
}

fn read_all(path: &Path) -> AnyhowResult<Vec<u8>> {
    let mut bytes = Vec::new();
    File::open(path)
        .with_context(|| format!("open {}", path.display()))?
        .read_to_end(&mut bytes)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(bytes)
}

// ── Augmentation ────────────────────────────────────────────────────────────

/// Training-time augmentation: random crop after padding, random mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Augment {
    pub crop_padding: usize,
    pub horizontal_flip: bool,
}

impl Default for Augment {
    fn default() -> Self {
        Self {
            crop_padding: 4,
            horizontal_flip: true,
        }
    }
}

impl Augment {
    fn apply(
        &self,
        src: &[f32],
        shape: (usize, usize, usize),
        pad_value: &[f32],
        rng: &mut StdRng,
        out: &mut Vec<f32>,
    ) {
        let (c, h, w) = shape;
        let p = self.crop_padding as isize;
        let (dy, dx) = if p > 0 {
            (rng.gen_range(-p..=p), rng.gen_range(-p..=p))
        } else {
            (0, 0)
        };
        let flip = self.horizontal_flip && rng.gen_bool(0.5);
        for ch in 0..c {
            for y in 0..h {
                for x in 0..w {
                    let col = if flip { w - 1 - x } else { x };
                    let sx = col as isize + dx;
                    let sy = y as isize + dy;
                    let v = if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
                        pad_value[ch]
                    } else {
                        src[ch * h * w + sy as usize * w + sx as usize]
                    };
                    out.push(v);
                }
            }
        }
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// One batch of images (flattened CHW, row per image) and labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    pub pixels: Vec<f32>,
    pub labels: Vec<u32>,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Convert a batch to `(input [n, c, h, w], labels [n])` Candle tensors.
pub fn batch_to_tensors(
    batch: &ImageBatch,
    shape: (usize, usize, usize),
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let (c, h, w) = shape;
    let n = batch.len();
    let input = Tensor::from_slice(&batch.pixels, (n, c, h, w), device)?;
    let labels = Tensor::from_slice(&batch.labels, n, device)?;
    Ok((input, labels))
}

/// A finite, restartable source of batches. Every call to
/// [`batches`](Self::batches) starts a fresh pass over the data.
pub trait BatchDataset {
    fn num_examples(&self) -> usize;
    fn image_shape(&self) -> (usize, usize, usize);
    fn batches(&self) -> Box<dyn Iterator<Item = ImageBatch> + '_>;
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// Default number of batches buffered ahead of the consumer.
pub const PREFETCH_BUFFER: usize = 8;

/// Batching front end over an [`ImageDataset`].
///
/// Each pass draws a fresh seed from the loader's own RNG, so shuffling and
/// augmentation differ between epochs yet are reproducible for a fixed seed.
pub struct DataLoader {
    dataset: Arc<ImageDataset>,
    batch_size: usize,
    shuffle: bool,
    augment: Option<Augment>,
    prefetch: usize,
    rng: Mutex<StdRng>,
}

impl DataLoader {
    pub fn new(dataset: Arc<ImageDataset>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: false,
            augment: None,
            prefetch: PREFETCH_BUFFER,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn augment(mut self, augment: Option<Augment>) -> Self {
        self.augment = augment;
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl BatchDataset for DataLoader {
    fn num_examples(&self) -> usize {
        self.dataset.len()
    }

    fn image_shape(&self) -> (usize, usize, usize) {
        self.dataset.shape()
    }

    fn batches(&self) -> Box<dyn Iterator<Item = ImageBatch> + '_> {
        let pass_seed: u64 = self.rng.lock().gen();
        let mut rng = StdRng::seed_from_u64(pass_seed);
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rng);
        }

        let (tx, rx) = mpsc::sync_channel::<ImageBatch>(self.prefetch);
        let dataset = Arc::clone(&self.dataset);
        let batch_size = self.batch_size;
        let augment = self.augment;
        // Producer thread owns a handle to the dataset and stops as soon as
        // the consumer hangs up.
        let handle = thread::spawn(move || {
            let (c, h, w) = dataset.shape();
            for chunk in order.chunks(batch_size) {
                let mut pixels = Vec::with_capacity(chunk.len() * c * h * w);
                let mut labels = Vec::with_capacity(chunk.len());
                for &i in chunk {
                    match augment {
                        Some(a) => {
                            a.apply(dataset.image(i), (c, h, w), &dataset.pad_value, &mut rng, &mut pixels)
                        }
                        None => pixels.extend_from_slice(dataset.image(i)),
                    }
                    labels.push(dataset.labels()[i]);
                }
                if tx.send(ImageBatch { pixels, labels }).is_err() {
                    return;
                }
            }
        });

        Box::new(Prefetch {
            rx: Some(rx),
            handle: Some(handle),
        })
    }
}

/// Consumer side of the prefetch channel.
struct Prefetch {
    rx: Option<Receiver<ImageBatch>>,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for Prefetch {
    type Item = ImageBatch;

    fn next(&mut self) -> Option<ImageBatch> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        // Hang up first so a blocked producer wakes and exits.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("batch producer thread panicked; the pass ended early");
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(n: usize) -> Arc<ImageDataset> {
        let pixels: Vec<f32> = (0..n * 4).map(|v| v as f32).collect();
        let labels: Vec<u32> = (0..n as u32).map(|i| i % 3).collect();
        Arc::new(ImageDataset::new(pixels, labels, (1, 2, 2)).unwrap())
    }

    #[test]
    fn dataset_rejects_mismatched_buffers() {
        assert!(ImageDataset::new(vec![0.0; 7], vec![0, 1], (1, 2, 2)).is_err());
        assert!(ImageDataset::new(vec![], vec![], (0, 2, 2)).is_err());
    }

    #[test]
    fn loader_covers_every_example_once() {
        let ds = toy(10);
        let loader = DataLoader::new(ds, 4).shuffle(true).seed(3);
        let batches: Vec<_> = loader.batches().collect();
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![4, 4, 2]);

        let mut firsts: Vec<u32> = batches
            .iter()
            .flat_map(|b| b.pixels.chunks(4).map(|img| img[0] as u32 / 4))
            .collect();
        firsts.sort();
        assert_eq!(firsts, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn unshuffled_loader_keeps_order_and_restarts() {
        let ds = toy(5);
        let loader = DataLoader::new(ds, 2);
        for _ in 0..2 {
            let labels: Vec<u32> = loader.batches().flat_map(|b| b.labels).collect();
            assert_eq!(labels, vec![0, 1, 2, 0, 1]);
        }
    }

    #[test]
    fn dropping_a_pass_early_does_not_hang() {
        let ds = toy(64);
        let loader = DataLoader::new(ds, 1).prefetch(1);
        let first = loader.batches().next().unwrap();
        assert_eq!(first.labels, vec![0]);
    }

    #[test]
    fn crop_pads_with_pad_value() {
        let aug = Augment {
            crop_padding: 1,
            horizontal_flip: false,
        };
        let src = [1.0, 2.0, 3.0, 4.0];
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            let mut out = Vec::new();
            aug.apply(&src, (1, 2, 2), &[-9.0], &mut rng, &mut out);
            assert_eq!(out.len(), 4);
            assert!(out.iter().all(|v| src.contains(v) || *v == -9.0));
        }
    }

    #[test]
    fn flip_only_mirrors_rows() {
        let aug = Augment {
            crop_padding: 0,
            horizontal_flip: true,
        };
        let src = [1.0, 2.0, 3.0, 4.0];
        let mut rng = StdRng::seed_from_u64(1);
        let mut seen_flip = false;
        for _ in 0..20 {
            let mut out = Vec::new();
            aug.apply(&src, (1, 2, 2), &[0.0], &mut rng, &mut out);
            if out == vec![2.0, 1.0, 4.0, 3.0] {
                seen_flip = true;
            } else {
                assert_eq!(out, src.to_vec());
            }
        }
        assert!(seen_flip);
    }

    #[test]
    fn cifar10_reader_parses_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = vec![7u8];
        rec.extend(std::iter::repeat(255u8).take(3072));
        std::fs::write(dir.path().join(CIFAR10_TEST_FILE), &rec).unwrap();

        let ds = load_cifar10(dir.path(), false).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.labels(), &[7]);
        let expected = (1.0 - 0.4914) / 0.2023;
        assert!((ds.image(0)[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn cifar10_reader_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CIFAR10_TEST_FILE), [1u8; 100]).unwrap();
        assert!(load_cifar10(dir.path(), false).is_err());
        assert!(load_cifar10(dir.path(), true).is_err());
    }

    #[test]
    fn stl10_reader_transposes_and_rebases_labels() {
        let dir = tempfile::tempdir().unwrap();
        let n = 96 * 96;
        let mut x = vec![0u8; 3 * n];
        // Column-major: byte at col 1, row 0 of channel 0.
        x[96] = 255;
        std::fs::write(dir.path().join("test_X.bin"), &x).unwrap();
        std::fs::write(dir.path().join("test_y.bin"), [10u8]).unwrap();

        let ds = load_stl10(dir.path(), false).unwrap();
        assert_eq!(ds.labels(), &[9]);
        let img = ds.image(0);
        assert!((img[1] - 1.0).abs() < 1e-6);
        assert!((img[96] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn batch_to_tensors_shapes() {
        let batch = ImageBatch {
            pixels: vec![0.5; 2 * 4],
            labels: vec![1, 0],
        };
        let (x, y) = batch_to_tensors(&batch, (1, 2, 2), &Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[2, 1, 2, 2]);
        assert_eq!(y.to_vec1::<u32>().unwrap(), vec![1, 0]);
    }
}

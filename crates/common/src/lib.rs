//! # robust-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`RunConfig`]**: run hyper-parameters (serialised as JSON).
//! * **[`ImageDataset`]** / **[`DataLoader`]**: binary image loading & batching.
//! * **[`batch_to_tensors`]**: raw batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::{DatasetKind, ModelConfig, ModelKind, RunConfig, ScheduleConfig};
pub use data::{
    batch_to_tensors, load_cifar10, load_dataset, load_stl10, Augment, BatchDataset, DataLoader,
    ImageBatch, ImageDataset,
};

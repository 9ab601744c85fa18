//! 🔬欢迎光临🧫
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Shape5d};

pub use crate::dataset::{
    collate, Batch, CachedDataset, ChannelImages, ChannelMap, Crops, DataLoader, Dataset,
    LoaderConfig, MaskTestDataset, Sample, SampleIndex, SlidingWindowDataset, WindowIndex,
};

pub use crate::error::{DataError, DataResult, LoaderError, StoreError, StoreResult};

pub use crate::module::{Architecture, DataModuleConfig, HcsDataModule, Stage};
pub use crate::predict::PredictionWriter;

pub use crate::store::{home_dataset_dir_with, open_positions, NormMeta, Plate, PlateWriter, Position};

pub use crate::transforms::{Compose, MapTransform, TransformSpec};

//! 数据模块: 按阶段构建数据集与加载器.
//!
//! 各阶段使用的变换顺序固定为 "归一化 -> 数据增强 -> 中心裁剪":
//!
//! | 阶段 | 数据集 | 变换 | 加载器 |
//! |---|---|---|---|
//! | fit / validate | 按位点随机划分的训练集与验证集 | 训练集全部, 验证集不含增强 | 训练集打乱并丢弃不完整批次 |
//! | test | 全部位点, 可附带真值掩码 | 仅归一化 | 批大小 1 |
//! | predict | plate 或单个位点, 只读 source | 仅归一化 | 不打乱 |

use std::env;
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::s;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::consts::DISK_CACHE_DIR;
use crate::dataset::{
    Batch, CachedDataset, ChannelMap, DataLoader, Dataset, LoaderConfig, MaskTestDataset,
    SlidingWindowDataset,
};
use crate::error::{ConfigError, DataResult, StoreResult};
use crate::store::{self, Plate, PlateWriter, Position};
use crate::transforms::{CenterSpatialCrop, Compose, MapTransform, Roi};

mod config;
mod split;

pub use config::{Architecture, DataModuleConfig};
pub use split::{random_permutation, split_by_permutation, split_positions};

/// 运行阶段.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// 训练.
    Fit,
    /// 验证.
    Validate,
    /// 测试.
    Test,
    /// 预测.
    Predict,
}

impl Stage {
    /// 阶段名.
    pub fn name(self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::Validate => "validate",
            Self::Test => "test",
            Self::Predict => "predict",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fit" => Ok(Self::Fit),
            "validate" => Ok(Self::Validate),
            "test" => Ok(Self::Test),
            "predict" => Ok(Self::Predict),
            _ => Err(ConfigError::UnsupportedStage(s.to_string())),
        }
    }
}

/// 高内涵筛选 (HCS) plate 的数据模块.
pub struct HcsDataModule {
    config: DataModuleConfig,
    train_patches_per_stack: usize,
    train_z_scale_range: (f32, f32),
    train: Option<Arc<dyn Dataset>>,
    val: Option<Arc<dyn Dataset>>,
    test: Option<Arc<dyn Dataset>>,
    predict: Option<Arc<SlidingWindowDataset>>,
}

impl fmt::Debug for HcsDataModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let len = |d: &Option<Arc<dyn Dataset>>| d.as_ref().map(|d| d.len());
        f.debug_struct("HcsDataModule")
            .field("config", &self.config)
            .field("train_patches_per_stack", &self.train_patches_per_stack)
            .field("train_z_scale_range", &self.train_z_scale_range)
            .field("train", &len(&self.train))
            .field("val", &len(&self.val))
            .field("test", &len(&self.test))
            .field("predict", &self.predict.as_ref().map(|d| d.len()))
            .finish()
    }
}

impl HcsDataModule {
    /// 创建数据模块. 不会访问磁盘.
    pub fn new(config: DataModuleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            train_patches_per_stack: 1,
            train_z_scale_range: (0.0, 0.0),
            train: None,
            val: None,
            test: None,
            predict: None,
        })
    }

    /// 配置.
    #[inline]
    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    /// 训练时每个 stack 采样的 patch 数.
    #[inline]
    pub fn train_patches_per_stack(&self) -> usize {
        self.train_patches_per_stack
    }

    /// 训练增强中仿射变换的 Z 轴缩放区间, 没有仿射变换时为 `(0, 0)`.
    #[inline]
    pub fn train_z_scale_range(&self) -> (f32, f32) {
        self.train_z_scale_range
    }

    /// 训练集读取的 z 窗口大小.
    ///
    /// 仿射变换沿 Z 轴缩小图像时需要读取更厚的 stack: 窗口扩大为
    /// `ceil(z_window_size * (1 + high))` 并向下取偶数, 中心裁剪后恢复为 `z_window_size`.
    pub fn train_z_window_size(&self) -> usize {
        let z = self.config.z_window_size;
        let high = self.train_z_scale_range.1;
        if high <= 0.0 {
            return z;
        }
        let expanded = (z as f64 * (1.0 + high as f64)).ceil() as usize;
        expanded - expanded % 2
    }

    /// 训练集.
    #[inline]
    pub fn train_dataset(&self) -> Option<&Arc<dyn Dataset>> {
        self.train.as_ref()
    }

    /// 验证集.
    #[inline]
    pub fn val_dataset(&self) -> Option<&Arc<dyn Dataset>> {
        self.val.as_ref()
    }

    /// 测试集.
    #[inline]
    pub fn test_dataset(&self) -> Option<&Arc<dyn Dataset>> {
        self.test.as_ref()
    }

    /// 预测集.
    #[inline]
    pub fn predict_dataset(&self) -> Option<&Arc<SlidingWindowDataset>> {
        self.predict.as_ref()
    }

    /// 磁盘缓存路径: `{临时目录}/{$SLURM_JOB_ID 或 hcs_cache}/{plate 名}`.
    pub fn cache_path(&self) -> PathBuf {
        let job = env::var("SLURM_JOB_ID").unwrap_or_else(|_| DISK_CACHE_DIR.to_string());
        let mut path = env::temp_dir();
        path.push(job);
        if let Some(name) = self.config.data_path.file_name() {
            path.push(name);
        }
        path
    }

    /// 若启用了 `caching`, 将 plate 无压缩地复制到 [`HcsDataModule::cache_path`].
    ///
    /// 已存在的位点会被跳过. 返回跳过的位点个数.
    pub fn prepare_data(&self) -> StoreResult<usize> {
        if !self.config.caching {
            return Ok(0);
        }
        let cache = self.cache_path();
        info!("Caching dataset at {}", cache.display());
        let plate = Plate::open(&self.config.data_path)?;
        let mut writer = PlateWriter::create(&cache, false)?;
        let mut skipped = 0;
        for name in plate.position_names() {
            if writer.contains(name) {
                debug!("Position {name} already cached, skipping");
                skipped += 1;
                continue;
            }
            let position = plate.open_position(name, NonZeroUsize::MIN)?;
            writer.copy_position(&position)?;
            debug!("Cached position {name}");
        }
        writer.finish()?;
        if skipped > 0 {
            warn!("Skipped {skipped} positions when caching");
        }
        Ok(skipped)
    }

    /// 构建 `stage` 所需的数据集.
    pub fn setup(&mut self, stage: Stage) -> DataResult<()> {
        match stage {
            Stage::Fit | Stage::Validate => self.setup_fit(),
            Stage::Test => self.setup_test(),
            Stage::Predict => self.setup_predict(),
        }
    }

    fn reader_slots(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.config.reader_slots()).unwrap_or(NonZeroUsize::MIN)
    }

    /// fit / test 阶段读取的 plate: 启用磁盘缓存时为本地副本.
    fn open_plate(&self) -> StoreResult<Vec<Position>> {
        let path = if self.config.caching {
            self.cache_path()
        } else {
            self.config.data_path.clone()
        };
        Plate::open(path)?.positions(self.reader_slots())
    }

    fn channel_map(&self) -> Result<ChannelMap, ConfigError> {
        ChannelMap::new(
            self.config.source_channel.clone(),
            Some(self.config.target_channel.clone()),
        )
    }

    fn normalizations(&self) -> Result<Vec<Box<dyn MapTransform>>, ConfigError> {
        self.config.normalizations.iter().map(|t| t.build()).collect()
    }

    /// 训练与验证最后一步的确定性中心裁剪.
    fn fit_transform(&self) -> Box<dyn MapTransform> {
        let keys = self
            .config
            .source_channel
            .iter()
            .chain(self.config.target_channel.iter())
            .cloned()
            .collect();
        let (y, x) = self.config.yx_patch_size;
        Box::new(CenterSpatialCrop::new(
            keys,
            Roi::new(Some(self.config.z_window_size), Some(y), Some(x)),
        ))
    }

    /// 构建数据增强, 并确定每个 stack 采样的 patch 数与 Z 轴缩放区间.
    fn train_transform(&mut self) -> Result<Vec<Box<dyn MapTransform>>, ConfigError> {
        self.train_patches_per_stack = 1;
        self.train_z_scale_range = (0.0, 0.0);
        let mut affine = false;
        let mut augmentations = Vec::with_capacity(self.config.augmentations.len());
        for spec in self.config.augmentations.iter() {
            let aug = spec.build()?;
            if let Some((low, high)) = aug.z_scale_range() {
                if affine {
                    return Err(ConfigError::InvalidTransform(
                        "only one RandAffine augmentation is allowed".into(),
                    ));
                }
                if low > 0.0 || high < 0.0 {
                    return Err(ConfigError::InvalidTransform(format!(
                        "RandAffine: Z scale range ({low}, {high}) must contain 0"
                    )));
                }
                affine = true;
                self.train_z_scale_range = (low, high);
            }
            if aug.is_multi_sample() {
                let num_samples = aug.num_samples();
                if self.config.batch_size % num_samples != 0 {
                    return Err(ConfigError::BatchSizeNotDivisible {
                        batch_size: self.config.batch_size,
                        num_samples,
                    });
                }
                self.train_patches_per_stack = num_samples;
            }
            augmentations.push(aug);
        }
        debug!(
            "Training augmentations: {:?}",
            augmentations.iter().map(|a| a.name()).collect::<Vec<_>>()
        );
        Ok(augmentations)
    }

    fn setup_fit(&mut self) -> DataResult<()> {
        let mut train_transform = self.normalizations()?;
        train_transform.extend(self.train_transform()?);
        train_transform.push(self.fit_transform());
        let mut val_transform = self.normalizations()?;
        val_transform.push(self.fit_transform());

        let channels = self.channel_map()?;
        let positions = self.open_plate()?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let (train, val) = split_positions(positions, self.config.split_ratio, &mut rng)?;
        info!(
            "Split {} positions into {} for training and {} for validation",
            train.len() + val.len(),
            train.len(),
            val.len()
        );

        let z_window = self.config.z_window_size;
        let train_z_window = self.train_z_window_size();
        if train_z_window != z_window {
            info!("Reading {train_z_window} z slices per training window");
        }
        let (train, val) = if self.config.ram_cache {
            let train = CachedDataset::new(train, channels.clone(), Compose::new(train_transform))?;
            let val = CachedDataset::new(val, channels, Compose::new(val_transform))?;
            (
                Arc::new(train) as Arc<dyn Dataset>,
                Arc::new(val) as Arc<dyn Dataset>,
            )
        } else {
            let train = SlidingWindowDataset::new(
                train,
                channels.clone(),
                train_z_window,
                Compose::new(train_transform),
            )?;
            let val =
                SlidingWindowDataset::new(val, channels, z_window, Compose::new(val_transform))?;
            (
                Arc::new(train) as Arc<dyn Dataset>,
                Arc::new(val) as Arc<dyn Dataset>,
            )
        };
        self.train = Some(train);
        self.val = Some(val);
        Ok(())
    }

    fn setup_test(&mut self) -> DataResult<()> {
        if self.config.batch_size != 1 {
            warn!(
                "Ignoring batch size {} in test stage",
                self.config.batch_size
            );
        }
        let inner = SlidingWindowDataset::new(
            self.open_plate()?,
            self.channel_map()?,
            self.config.z_window_size,
            Compose::new(self.normalizations()?),
        )?;
        self.test = Some(match &self.config.ground_truth_masks {
            Some(dir) => Arc::new(MaskTestDataset::new(inner, dir)?) as Arc<dyn Dataset>,
            None => Arc::new(inner),
        });
        Ok(())
    }

    fn setup_predict(&mut self) -> DataResult<()> {
        if self.config.caching || self.config.ram_cache {
            warn!("Ignoring caching config in 'predict' stage");
        }
        let (plate, positions) =
            store::open_positions(&self.config.data_path, self.reader_slots())?;
        debug!(
            "Predicting on {} positions of plate {}",
            positions.len(),
            plate.name()
        );
        let channels = ChannelMap::source_only(self.config.source_channel.clone())?;
        self.predict = Some(Arc::new(SlidingWindowDataset::new(
            positions,
            channels,
            self.config.z_window_size,
            Compose::new(self.normalizations()?),
        )?));
        Ok(())
    }

    fn loader_config(&self, batch_size: usize, shuffle: bool, drop_last: bool) -> LoaderConfig {
        LoaderConfig {
            batch_size,
            shuffle,
            drop_last,
            num_workers: self.config.num_workers,
            prefetch_factor: self.config.prefetch_factor,
            timeout: self.config.timeout(),
            seed: self.config.seed,
        }
    }

    /// 训练集加载器. 批大小为 `batch_size / train_patches_per_stack`.
    pub fn train_dataloader(&self) -> DataResult<DataLoader> {
        let dataset = self.train.clone().ok_or(ConfigError::StageNotSetUp("fit"))?;
        let batch_size = self.config.batch_size / self.train_patches_per_stack;
        DataLoader::new(dataset, self.loader_config(batch_size, true, true))
    }

    /// 验证集加载器.
    pub fn val_dataloader(&self) -> DataResult<DataLoader> {
        let dataset = self.val.clone().ok_or(ConfigError::StageNotSetUp("validate"))?;
        DataLoader::new(
            dataset,
            self.loader_config(self.config.batch_size, false, false),
        )
    }

    /// 测试集加载器, 批大小固定为 1.
    pub fn test_dataloader(&self) -> DataResult<DataLoader> {
        let dataset = self.test.clone().ok_or(ConfigError::StageNotSetUp("test"))?;
        DataLoader::new(dataset, self.loader_config(1, false, false))
    }

    /// 预测集加载器.
    pub fn predict_dataloader(&self) -> DataResult<DataLoader> {
        let dataset: Arc<dyn Dataset> = self
            .predict
            .clone()
            .ok_or(ConfigError::StageNotSetUp("predict"))?;
        DataLoader::new(
            dataset,
            self.loader_config(self.config.batch_size, false, false),
        )
    }

    /// 批次传入模型前的处理: 2D target 只保留窗口中心的 z 切片.
    /// 预测阶段原样返回.
    pub fn on_before_batch_transfer(&self, mut batch: Batch, stage: Stage) -> Batch {
        if stage == Stage::Predict || !self.config.architecture.target_2d() {
            return batch;
        }
        let z = self.config.z_window_size / 2;
        if let Some(target) = batch.target.as_mut() {
            if z < target.len_of(ndarray::Axis(2)) {
                *target = target.slice(s![.., .., z..z + 1, .., ..]).to_owned();
            }
        }
        batch
    }
}

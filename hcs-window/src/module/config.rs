use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consts::{defaults, MAX_READER_SLOTS};
use crate::dataset::one_or_many;
use crate::error::{ConfigError, StoreError, StoreResult};
use crate::transforms::TransformSpec;

/// 模型结构. 决定 target 是否只保留中心 z 切片.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// 2D 模型.
    #[serde(rename = "2D")]
    TwoD,

    /// 2.5D 模型: 3D 输入, 2D 输出.
    #[default]
    #[serde(rename = "2.5D")]
    TwoPointFiveD,

    /// 3D 模型.
    #[serde(rename = "3D")]
    ThreeD,

    /// UNeXt2.
    UNeXt2,

    /// 全卷积掩码自编码器.
    #[serde(rename = "fcmae")]
    Fcmae,
}

impl Architecture {
    /// target 是否是 2D 的.
    #[inline]
    pub fn target_2d(self) -> bool {
        matches!(self, Self::TwoD | Self::TwoPointFiveD)
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TwoD => "2D",
            Self::TwoPointFiveD => "2.5D",
            Self::ThreeD => "3D",
            Self::UNeXt2 => "UNeXt2",
            Self::Fcmae => "fcmae",
        };
        f.write_str(s)
    }
}

fn default_split_ratio() -> f64 {
    defaults::SPLIT_RATIO
}

fn default_batch_size() -> usize {
    defaults::BATCH_SIZE
}

fn default_num_workers() -> usize {
    defaults::NUM_WORKERS
}

fn default_yx_patch_size() -> (usize, usize) {
    defaults::YX_PATCH_SIZE
}

fn default_z_window_size() -> usize {
    defaults::Z_WINDOW_SIZE
}

fn default_timeout_secs() -> u64 {
    defaults::TIMEOUT_SECS
}

fn default_prefetch_factor() -> usize {
    defaults::PREFETCH_FACTOR
}

/// 数据模块配置, 可从 json 读取.
///
/// `source_channel` / `target_channel` 既可以是字符串, 也可以是字符串列表.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataModuleConfig {
    /// plate 路径. 预测阶段也可以是 plate 内的单个位点.
    pub data_path: PathBuf,

    /// 输入通道.
    #[serde(deserialize_with = "one_or_many")]
    pub source_channel: Vec<String>,

    /// 目标通道.
    #[serde(deserialize_with = "one_or_many")]
    pub target_channel: Vec<String>,

    /// z 窗口大小.
    #[serde(default = "default_z_window_size")]
    pub z_window_size: usize,

    /// 训练集位点占比.
    #[serde(default = "default_split_ratio")]
    pub split_ratio: f64,

    /// 批大小 (多重采样展开后).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 数据加载 worker 个数.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// 模型结构.
    #[serde(default)]
    pub architecture: Architecture,

    /// 训练 / 验证时 `(Y, X)` 方向的裁剪大小.
    #[serde(default = "default_yx_patch_size")]
    pub yx_patch_size: (usize, usize),

    /// 归一化变换, 所有阶段都会使用.
    #[serde(default)]
    pub normalizations: Vec<TransformSpec>,

    /// 数据增强, 仅训练集使用.
    #[serde(default)]
    pub augmentations: Vec<TransformSpec>,

    /// 是否先把 plate 无压缩地复制到本地临时目录.
    #[serde(default)]
    pub caching: bool,

    /// 训练阶段是否使用内存缓存数据集.
    #[serde(default)]
    pub ram_cache: bool,

    /// 测试阶段真值掩码所在目录.
    #[serde(default)]
    pub ground_truth_masks: Option<PathBuf>,

    /// 单个批次的最长等待时间 (秒), 0 表示不限时.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// 每个 worker 预取的批次数.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,

    /// 划分训练 / 验证集与打乱顺序的随机种子.
    #[serde(default)]
    pub seed: u64,
}

impl DataModuleConfig {
    /// 使用默认值创建配置.
    pub fn new(
        data_path: impl Into<PathBuf>,
        source_channel: Vec<String>,
        target_channel: Vec<String>,
        z_window_size: usize,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            source_channel,
            target_channel,
            z_window_size,
            split_ratio: defaults::SPLIT_RATIO,
            batch_size: defaults::BATCH_SIZE,
            num_workers: defaults::NUM_WORKERS,
            architecture: Architecture::default(),
            yx_patch_size: defaults::YX_PATCH_SIZE,
            normalizations: Vec::new(),
            augmentations: Vec::new(),
            caching: false,
            ram_cache: false,
            ground_truth_masks: None,
            timeout_secs: defaults::TIMEOUT_SECS,
            prefetch_factor: defaults::PREFETCH_FACTOR,
            seed: 0,
        }
    }

    /// 读取 json 配置文件.
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> StoreResult<Self> {
        let file = std::fs::File::open(path)?;
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(StoreError::from)
    }

    /// 检查数值参数.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.z_window_size == 0 {
            return Err(ConfigError::ZeroZWindow);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if !(self.split_ratio > 0.0 && self.split_ratio < 1.0) {
            return Err(ConfigError::InvalidSplitRatio(self.split_ratio));
        }
        if self.source_channel.is_empty() {
            return Err(ConfigError::EmptyChannelList("source"));
        }
        if self.target_channel.is_empty() {
            return Err(ConfigError::EmptyChannelList("target"));
        }
        Ok(())
    }

    /// 单批超时.
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// 每个位点的读取通道个数: 每个 worker 一个.
    #[inline]
    pub fn reader_slots(&self) -> usize {
        self.num_workers.clamp(1, MAX_READER_SLOTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let raw = r#"{
            "data_path": "/data/plate",
            "source_channel": "Phase3D",
            "target_channel": ["Nuclei", "Membrane"],
            "z_window_size": 5,
            "architecture": "UNeXt2"
        }"#;
        let cfg: DataModuleConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.source_channel, ["Phase3D"]);
        assert_eq!(cfg.target_channel, ["Nuclei", "Membrane"]);
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.yx_patch_size, (256, 256));
        assert_eq!(cfg.timeout(), Duration::from_secs(600));
        assert!(!cfg.architecture.target_2d());
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg,
            DataModuleConfig {
                architecture: Architecture::UNeXt2,
                ..DataModuleConfig::new(
                    "/data/plate",
                    vec!["Phase3D".into()],
                    vec!["Nuclei".into(), "Membrane".into()],
                    5
                )
            }
        );
    }

    #[test]
    fn test_architecture_names() {
        let a: Architecture = serde_json::from_str(r#""2.5D""#).unwrap();
        assert_eq!(a, Architecture::TwoPointFiveD);
        assert!(a.target_2d());
        assert!(Architecture::TwoD.target_2d());
        assert!(!Architecture::Fcmae.target_2d());
        assert_eq!(Architecture::default().to_string(), "2.5D");
        assert!(serde_json::from_str::<Architecture>(r#""4D""#).is_err());
    }

    #[test]
    fn test_validate() {
        let mut cfg = DataModuleConfig::new("p", vec!["a".into()], vec!["b".into()], 1);
        cfg.split_ratio = 1.0;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidSplitRatio(1.0)));
        cfg.split_ratio = 0.5;
        cfg.z_window_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroZWindow));
        cfg.z_window_size = 1;
        cfg.num_workers = 0;
        assert_eq!(cfg.reader_slots(), 1);
    }
}

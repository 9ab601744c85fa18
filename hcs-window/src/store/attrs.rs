//! plate / 位点元信息与归一化统计量.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::DType;
use crate::error::{StoreError, StoreResult};

/// 归一化统计量所在的层级.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsLevel {
    /// 整个数据集上统计.
    DatasetStatistics,

    /// 单个视野 (位点) 上统计.
    FovStatistics,
}

impl StatsLevel {
    /// 在元信息中的键名.
    #[inline]
    pub const fn key(&self) -> &'static str {
        match self {
            Self::DatasetStatistics => "dataset_statistics",
            Self::FovStatistics => "fov_statistics",
        }
    }
}

/// 单通道在某一层级上的统计量.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// 中位数.
    pub median: f32,

    /// 四分位距.
    pub iqr: f32,

    /// 均值.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f32>,

    /// 标准差.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<f32>,
}

impl Statistics {
    /// 仅包含中位数和四分位距的统计量.
    #[inline]
    pub fn new(median: f32, iqr: f32) -> Self {
        Self {
            median,
            iqr,
            mean: None,
            std: None,
        }
    }
}

/// 单通道的全部统计量.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelNorm {
    /// 数据集层级.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_statistics: Option<Statistics>,

    /// 视野层级.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fov_statistics: Option<Statistics>,
}

impl ChannelNorm {
    /// 获取 `level` 层级的统计量.
    #[inline]
    pub fn level(&self, level: StatsLevel) -> Option<&Statistics> {
        match level {
            StatsLevel::DatasetStatistics => self.dataset_statistics.as_ref(),
            StatsLevel::FovStatistics => self.fov_statistics.as_ref(),
        }
    }
}

/// 归一化元信息: 通道名 -> 各层级统计量.
///
/// 预处理时写入, 读出后不再修改. 数据集以 `Arc` 共享给每个样本.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormMeta(BTreeMap<String, ChannelNorm>);

impl NormMeta {
    /// 空元信息.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置 `channel` 的统计量, 返回旧值.
    pub fn insert(&mut self, channel: impl Into<String>, norm: ChannelNorm) -> Option<ChannelNorm> {
        self.0.insert(channel.into(), norm)
    }

    /// 获取 `channel` 的全部统计量.
    #[inline]
    pub fn channel(&self, channel: &str) -> Option<&ChannelNorm> {
        self.0.get(channel)
    }

    /// 获取 `channel` 在 `level` 层级的统计量.
    #[inline]
    pub fn stats(&self, channel: &str, level: StatsLevel) -> Option<&Statistics> {
        self.channel(channel)?.level(level)
    }

    /// 按通道名升序迭代.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, &ChannelNorm)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// 通道个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 是否不含任何通道.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `plate.json` 的内容.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateAttrs {
    /// 位点的相对路径, 形如 `"A/1/0"`.
    pub positions: Vec<String>,
}

/// 位点 `attrs.json` 的内容.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionAttrs {
    /// 通道名, 顺序即通道索引.
    pub channel_names: Vec<String>,

    /// 数组形状 `[T, C, Z, Y, X]`.
    pub shape: [usize; 5],

    /// numpy 风格的 dtype 名, 见 [`DType::from_name`].
    pub dtype: String,

    /// 归一化元信息.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormMeta>,
}

impl PositionAttrs {
    /// 解析像素类型. `path` 仅用于报错.
    pub fn parse_dtype(&self, path: &Path) -> StoreResult<DType> {
        DType::from_name(&self.dtype).ok_or_else(|| StoreError::UnsupportedDtype {
            path: path.to_owned(),
            dtype: self.dtype.clone(),
        })
    }

    /// 检查元信息是否自洽. `path` 仅用于报错.
    pub fn validate(&self, path: &Path) -> StoreResult<()> {
        self.parse_dtype(path)?;
        let [_, c, z, y, x] = self.shape;
        if c != self.channel_names.len() {
            return Err(StoreError::InvalidAttrs {
                path: path.to_owned(),
                reason: format!(
                    "shape declares {c} channels but {} names are given",
                    self.channel_names.len()
                ),
            });
        }
        if z == 0 || y == 0 || x == 0 {
            return Err(StoreError::InvalidAttrs {
                path: path.to_owned(),
                reason: format!("empty spatial shape {:?}", (z, y, x)),
            });
        }
        Ok(())
    }
}

/// 读取 json 文件.
pub(crate) fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> StoreResult<T> {
    let file = File::open(path.as_ref())?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// 写入 json 文件.
pub(crate) fn write_json<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> StoreResult<()> {
    let file = File::create(path.as_ref())?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norm_meta_json() {
        let raw = r#"{
            "Nuclei": {
                "dataset_statistics": {"median": 5.0, "iqr": 1.0},
                "fov_statistics": {"median": 4.5, "iqr": 2.0, "mean": 4.0, "std": 1.5}
            }
        }"#;
        let meta: NormMeta = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.len(), 1);
        let ds = meta.stats("Nuclei", StatsLevel::DatasetStatistics).unwrap();
        assert_eq!(*ds, Statistics::new(5.0, 1.0));
        let fov = meta.stats("Nuclei", StatsLevel::FovStatistics).unwrap();
        assert_eq!(fov.std, Some(1.5));
        assert!(meta.stats("Phase3D", StatsLevel::FovStatistics).is_none());
    }

    #[test]
    fn test_position_attrs_validate() {
        let mut attrs = PositionAttrs {
            channel_names: vec!["Phase3D".into(), "Nuclei".into()],
            shape: [1, 2, 4, 8, 8],
            dtype: "uint16".into(),
            normalization: None,
        };
        assert!(attrs.validate(Path::new("attrs.json")).is_ok());

        attrs.dtype = "<i2".into();
        assert_eq!(attrs.parse_dtype(Path::new("attrs.json")).unwrap(), DType::I16);

        attrs.shape[1] = 3;
        assert!(matches!(
            attrs.validate(Path::new("attrs.json")),
            Err(StoreError::InvalidAttrs { .. })
        ));

        attrs.shape[1] = 2;
        attrs.dtype = "complex64".into();
        assert!(matches!(
            attrs.validate(Path::new("attrs.json")),
            Err(StoreError::UnsupportedDtype { dtype, .. }) if dtype == "complex64"
        ));
    }
}

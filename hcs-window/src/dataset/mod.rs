//! 滑动窗口数据集、内存缓存数据集与批处理加载.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize};

use crate::consts::keys;
use crate::error::{ConfigError, DataResult};

mod cached;
mod collate;
mod loader;
mod mask;
mod sample;
mod sliding;
mod window;

pub use cached::CachedDataset;
pub use collate::{collate, Batch};
pub use loader::{DataLoader, EpochIter, LoaderConfig};
pub use mask::{MaskIndex, MaskTestDataset};
pub use sample::{ChannelImages, Crops, Sample, SampleIndex};
pub use sliding::SlidingWindowDataset;
pub use window::{Window, WindowIndex};

/// 可按扁平索引随机访问的数据集.
///
/// 实现需要可以在多个 worker 线程间共享.
pub trait Dataset: Send + Sync {
    /// 样本个数.
    fn len(&self) -> usize;

    /// 获取第 `index` 个样本, 随机变换从 `rng` 取随机数.
    fn get_with(&self, index: usize, rng: &mut dyn RngCore) -> DataResult<Sample>;

    /// 获取第 `index` 个样本. 随机变换使用以 `index` 为种子的随机数.
    fn get(&self, index: usize) -> DataResult<Sample> {
        let mut rng = StdRng::seed_from_u64(index as u64);
        self.get_with(index, &mut rng)
    }

    /// 是否为空.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 通道映射: 角色 (`source` / `target`) 到通道名列表.
///
/// json 中每个角色既可以写成字符串, 也可以写成字符串列表.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, OneOrMany>")]
pub struct ChannelMap {
    source: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(v: OneOrMany) -> Self {
        match v {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// 将字符串或字符串列表反序列化为列表.
pub(crate) fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    OneOrMany::deserialize(d).map(Vec::from)
}

impl TryFrom<BTreeMap<String, OneOrMany>> for ChannelMap {
    type Error = ConfigError;

    fn try_from(mut map: BTreeMap<String, OneOrMany>) -> Result<Self, Self::Error> {
        if let Some(k) = map.keys().find(|k| !keys::CHANNEL_ROLES.contains(&k.as_str())) {
            return Err(ConfigError::UnknownChannelRole(k.clone()));
        }
        let source = map
            .remove(keys::SOURCE)
            .ok_or(ConfigError::MissingSourceChannels)?;
        let target = map.remove(keys::TARGET).map(Vec::from);
        Self::new(source.into(), target)
    }
}

impl ChannelMap {
    /// 创建通道映射. 任一角色的通道列表为空时报错.
    pub fn new(source: Vec<String>, target: Option<Vec<String>>) -> Result<Self, ConfigError> {
        if source.is_empty() {
            return Err(ConfigError::EmptyChannelList(keys::SOURCE));
        }
        if target.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::EmptyChannelList(keys::TARGET));
        }
        Ok(Self { source, target })
    }

    /// 仅包含 source 的映射.
    pub fn source_only(source: Vec<String>) -> Result<Self, ConfigError> {
        Self::new(source, None)
    }

    /// 输入通道.
    #[inline]
    pub fn source(&self) -> &[String] {
        &self.source
    }

    /// 目标通道.
    #[inline]
    pub fn target(&self) -> Option<&[String]> {
        self.target.as_deref()
    }

    /// 去掉 target 后的映射.
    pub fn without_target(&self) -> Self {
        Self {
            source: self.source.clone(),
            target: None,
        }
    }

    /// 先 source 后 target 的全部通道名.
    pub fn all_channels(&self) -> impl Iterator<Item = &String> {
        self.source.iter().chain(self.target.iter().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_map_one_or_many() {
        let m: ChannelMap =
            serde_json::from_str(r#"{"source": "Phase3D", "target": ["Nuclei", "Membrane"]}"#)
                .unwrap();
        assert_eq!(m.source(), ["Phase3D"]);
        assert_eq!(m.target().unwrap(), ["Nuclei", "Membrane"]);
        assert_eq!(m.all_channels().count(), 3);

        let json = serde_json::to_string(&m.without_target()).unwrap();
        assert_eq!(json, r#"{"source":["Phase3D"]}"#);
    }

    #[test]
    fn test_channel_map_rejects_bad_keys() {
        let r = serde_json::from_str::<ChannelMap>(r#"{"target": "Nuclei"}"#);
        assert!(r.unwrap_err().to_string().contains("source"));

        let r = serde_json::from_str::<ChannelMap>(r#"{"source": "Phase3D", "weight": "x"}"#);
        assert!(r.unwrap_err().to_string().contains("weight"));

        assert_eq!(
            ChannelMap::new(vec![], None),
            Err(ConfigError::EmptyChannelList("source"))
        );
        assert_eq!(
            ChannelMap::new(vec!["Phase3D".into()], Some(vec![])),
            Err(ConfigError::EmptyChannelList("target"))
        );
    }
}

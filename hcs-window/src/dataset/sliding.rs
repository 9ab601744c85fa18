use log::debug;
use rand::RngCore;

use super::{ChannelImages, ChannelMap, Dataset, Sample, SampleIndex, WindowIndex};
use crate::error::{DataResult, LookupError};
use crate::store::Position;
use crate::transforms::{Compose, MapTransform};

/// 解析位点中 `channels` 所列通道的索引.
pub(crate) fn channel_indices(
    position: &Position,
    channels: &[String],
) -> Result<Vec<usize>, LookupError> {
    channels
        .iter()
        .map(|c| {
            position
                .get_channel_index(c)
                .ok_or_else(|| LookupError::MissingChannel {
                    position: position.name().to_string(),
                    channel: c.clone(),
                })
        })
        .collect()
}

/// 对字典应用变换并按通道映射组装样本.
///
/// 若有 target, 变换期间其第一个通道充当权重图, 变换结束后别名被移除.
pub(crate) fn transform_and_assemble(
    index: SampleIndex,
    mut images: ChannelImages,
    channels: &ChannelMap,
    transform: &Compose,
    rng: &mut dyn RngCore,
) -> DataResult<Sample> {
    let norm_meta = images.norm_meta().cloned();
    if let Some(first) = channels.target().and_then(|t| t.first()) {
        images.set_weight(first)?;
    }
    let crops = transform.apply(images, rng)?.map(|mut im| {
        im.clear_weight();
        im
    });
    Sample::assemble(index, crops, channels, norm_meta)
}

/// 滑动窗口数据集.
///
/// 每个元素是某个位点在某一时间帧上、连续 `z_window` 个 z 切片的窗口,
/// `source` / `target` 形状为 `(C, z_window, Y, X)`.
#[derive(Debug)]
pub struct SlidingWindowDataset {
    positions: Vec<Position>,
    channels: ChannelMap,
    /// 每个位点上, source 与 target 的通道索引.
    source_idx: Vec<Vec<usize>>,
    target_idx: Vec<Vec<usize>>,
    windows: WindowIndex,
    transform: Compose,
}

impl SlidingWindowDataset {
    /// 创建数据集. 所有位点都必须包含通道映射中的全部通道,
    /// 且 z 切片数不少于 `z_window`.
    pub fn new(
        positions: Vec<Position>,
        channels: ChannelMap,
        z_window: usize,
        transform: Compose,
    ) -> DataResult<Self> {
        let windows = WindowIndex::from_positions(&positions, z_window)?;
        let mut source_idx = Vec::with_capacity(positions.len());
        let mut target_idx = Vec::with_capacity(positions.len());
        for p in positions.iter() {
            source_idx.push(channel_indices(p, channels.source())?);
            target_idx.push(channel_indices(p, channels.target().unwrap_or(&[]))?);
        }
        debug!(
            "Sliding window dataset: {} positions, {} windows, z window {z_window}, transforms {:?}",
            positions.len(),
            windows.len(),
            transform.names()
        );
        Ok(Self {
            positions,
            channels,
            source_idx,
            target_idx,
            windows,
            transform,
        })
    }

    /// 通道映射.
    #[inline]
    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// 所有位点.
    #[inline]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// 窗口索引.
    #[inline]
    pub fn windows(&self) -> &WindowIndex {
        &self.windows
    }

    /// z 窗口大小.
    #[inline]
    pub fn z_window(&self) -> usize {
        self.windows.z_window()
    }

    /// 读取第 `index` 个窗口的原始逐通道图像, 不做变换.
    pub fn read_images(&self, index: usize) -> DataResult<(SampleIndex, ChannelImages)> {
        let w = self
            .windows
            .locate(index)
            .ok_or(LookupError::IndexOutOfRange {
                index,
                len: self.len(),
            })?;
        let p = &self.positions[w.position];
        let z = w.z_start..w.z_start + self.z_window();

        let mut images = ChannelImages::new(p.norm_meta().cloned());
        let source = p.read_window(w.time, &self.source_idx[w.position], z.clone())?;
        for (name, im) in self.channels.source().iter().zip(source) {
            images.insert(name.as_str(), im);
        }
        if let Some(names) = self.channels.target() {
            let target = p.read_window(w.time, &self.target_idx[w.position], z)?;
            for (name, im) in names.iter().zip(target) {
                images.insert(name.as_str(), im);
            }
        }
        Ok((SampleIndex::new(p.name(), w.time, w.z_start), images))
    }
}

impl Dataset for SlidingWindowDataset {
    fn len(&self) -> usize {
        self.windows.len()
    }

    fn get_with(&self, index: usize, rng: &mut dyn RngCore) -> DataResult<Sample> {
        let (sample_index, images) = self.read_images(index)?;
        transform_and_assemble(sample_index, images, &self.channels, &self.transform, rng)
    }
}

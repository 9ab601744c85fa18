//! 空间裁剪.

use ndarray::{s, Array4};
use rand::{Rng, RngCore};

use super::MapTransform;
use crate::consts::keys;
use crate::dataset::{ChannelImages, Crops};
use crate::error::{ConfigError, TransformError};
use crate::Idx3d;

/// `(Z, Y, X)` 裁剪大小. `None` 表示该维度保持原大小.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Roi([Option<usize>; 3]);

impl Roi {
    /// 创建裁剪大小. 为 0 的维度视为保持原大小.
    pub fn new(z: Option<usize>, y: Option<usize>, x: Option<usize>) -> Self {
        Self([z, y, x].map(|d| d.filter(|&d| d > 0)))
    }

    /// 从带符号的配置值转换: 负数表示保持原大小, 0 非法.
    pub fn from_signed(v: [i64; 3]) -> Result<Self, ConfigError> {
        let mut out = [None; 3];
        for (o, d) in out.iter_mut().zip(v) {
            match d {
                0 => {
                    return Err(ConfigError::InvalidTransform(format!(
                        "crop size {v:?} contains 0"
                    )))
                }
                d if d < 0 => *o = None,
                d => *o = Some(d as usize),
            }
        }
        Ok(Self(out))
    }

    /// 作用于形状为 `shape` 的图像时的实际裁剪大小. 裁剪大小不超过图像大小.
    pub fn resolve(&self, shape: Idx3d) -> Idx3d {
        let [z, y, x] = self.0;
        let fit = |r: Option<usize>, n: usize| r.map_or(n, |r| r.min(n));
        (fit(z, shape.0), fit(y, shape.1), fit(x, shape.2))
    }
}

fn spatial(a: &Array4<f32>) -> Idx3d {
    let (_, z, y, x) = a.dim();
    (z, y, x)
}

fn crop(a: &Array4<f32>, start: Idx3d, size: Idx3d) -> Array4<f32> {
    a.slice(s![
        ..,
        start.0..start.0 + size.0,
        start.1..start.1 + size.1,
        start.2..start.2 + size.2
    ])
    .to_owned()
}

/// 确定性中心裁剪.
///
/// 每个维度的起点为 `n / 2 - r / 2`. 图像小于裁剪大小的维度保持不变.
#[derive(Clone, Debug)]
pub struct CenterSpatialCrop {
    keys: Vec<String>,
    roi: Roi,
}

impl CenterSpatialCrop {
    /// 对 `keys` 所列通道做中心裁剪.
    pub fn new(keys: Vec<String>, roi: Roi) -> Self {
        Self { keys, roi }
    }

    /// 裁剪大小.
    #[inline]
    pub fn roi(&self) -> Roi {
        self.roi
    }
}

impl MapTransform for CenterSpatialCrop {
    fn name(&self) -> &'static str {
        "CenterSpatialCrop"
    }

    fn apply(
        &self,
        mut images: ChannelImages,
        _rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        for k in self.keys.iter() {
            let a = images.require_mut(k)?;
            let n = spatial(a);
            let r = self.roi.resolve(n);
            let start = (n.0 / 2 - r.0 / 2, n.1 / 2 - r.1 / 2, n.2 / 2 - r.2 / 2);
            if r != n {
                *a = crop(a, start, r);
            }
        }
        Ok(Crops::Single(images))
    }
}

/// 以权重图为概率分布随机选取裁剪中心, 每个样本产出 `num_samples` 个 crop.
///
/// 权重图即 target 第一个通道的别名. 与 MONAI `RandWeightedCropd` 相同,
/// 只在裁剪框能完整落入图像的中心区域 (valid 区域) 内采样:
///
/// - NaN 权重按 0 处理;
/// - 区域内存在负权重时, 整体减去最小值;
/// - 权重和为 0 或不是有限值 (例如含 `inf`) 时均匀采样.
#[derive(Clone, Debug)]
pub struct RandWeightedCrop {
    keys: Vec<String>,
    roi: Roi,
    num_samples: usize,
}

impl RandWeightedCrop {
    /// 对 `keys` 所列通道做加权随机裁剪.
    pub fn new(keys: Vec<String>, roi: Roi, num_samples: usize) -> Result<Self, ConfigError> {
        if num_samples == 0 {
            return Err(ConfigError::InvalidTransform(
                "RandWeightedCrop: num_samples must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            keys,
            roi,
            num_samples,
        })
    }

    /// 在有效中心区域内按权重采样 `num_samples` 个裁剪起点.
    fn sample_starts(&self, weight: &Array4<f32>, rng: &mut dyn RngCore) -> (Vec<Idx3d>, Idx3d) {
        let n = spatial(weight);
        let r = self.roi.resolve(n);
        // 有效起点个数.
        let span = (n.0 - r.0 + 1, n.1 - r.1 + 1, n.2 - r.2 + 1);
        let (hz, hy, hx) = (r.0 / 2, r.1 / 2, r.2 / 2);

        let valid = weight.slice(s![
            0,
            hz..hz + span.0,
            hy..hy + span.1,
            hx..hx + span.2
        ]);
        let values: Vec<f64> = valid
            .iter()
            .map(|&w| if w.is_nan() { 0.0 } else { w as f64 })
            .collect();
        let min = values.iter().copied().fold(0.0f64, f64::min);
        let mut total = 0.0f64;
        let cumsum: Vec<f64> = values
            .iter()
            .map(|&w| {
                total += w - min;
                total
            })
            .collect();

        let count = cumsum.len();
        let weighted = total.is_finite() && total > 0.0;
        let starts = (0..self.num_samples)
            .map(|_| {
                let flat = if weighted {
                    let u = rng.random_range(0.0..total);
                    cumsum.partition_point(|&c| c <= u).min(count - 1)
                } else {
                    rng.random_range(0..count)
                };
                let plane = span.1 * span.2;
                (flat / plane, flat % plane / span.2, flat % span.2)
            })
            .collect();
        (starts, r)
    }
}

impl MapTransform for RandWeightedCrop {
    fn name(&self) -> &'static str {
        "RandWeightedCrop"
    }

    fn apply(
        &self,
        images: ChannelImages,
        rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        let weight = images
            .weight()
            .ok_or_else(|| TransformError::MissingKey(keys::WEIGHT.to_string()))?;
        let n = spatial(weight);
        for k in self.keys.iter() {
            if spatial(images.require(k)?) != n {
                return Err(TransformError::InconsistentShape(k.clone()));
            }
        }
        let (starts, size) = self.sample_starts(weight, rng);

        let mut out = Vec::with_capacity(starts.len());
        for start in starts {
            let mut im = images.clone();
            for k in self.keys.iter() {
                let a = im.require_mut(k)?;
                *a = crop(a, start, size);
            }
            out.push(im);
        }
        Ok(Crops::Multi(out))
    }

    fn num_samples(&self) -> usize {
        self.num_samples
    }

    fn is_multi_sample(&self) -> bool {
        true
    }
}

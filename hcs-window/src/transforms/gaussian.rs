//! 高斯噪声与高斯平滑.

use ndarray::{Array4, ArrayViewMut1, Axis};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;

use super::{check_range, MapTransform};
use crate::dataset::{ChannelImages, Crops};
use crate::error::{ConfigError, TransformError};

/// 以概率 `prob` 叠加高斯噪声 `N(mean, s^2)`, `s` 在 `[0, std)` 内均匀采样.
///
/// 同一样本的所有 `keys` 共用同一份噪声, 因此它们的形状必须相同.
#[derive(Clone, Debug)]
pub struct RandGaussianNoise {
    keys: Vec<String>,
    mean: f32,
    std: f32,
    prob: f32,
}

impl RandGaussianNoise {
    /// 创建变换. `std` 不能为负.
    pub fn new(keys: Vec<String>, mean: f32, std: f32, prob: f32) -> Result<Self, ConfigError> {
        check_range("RandGaussianNoise", (0.0, std), prob)?;
        if !mean.is_finite() {
            return Err(ConfigError::InvalidTransform(format!(
                "RandGaussianNoise: mean {mean} is not finite"
            )));
        }
        Ok(Self {
            keys,
            mean,
            std,
            prob,
        })
    }
}

impl MapTransform for RandGaussianNoise {
    fn name(&self) -> &'static str {
        "RandGaussianNoise"
    }

    fn apply(
        &self,
        mut images: ChannelImages,
        rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        let Some(first) = self.keys.first() else {
            return Ok(Crops::Single(images));
        };
        if rng.random::<f32>() >= self.prob {
            return Ok(Crops::Single(images));
        }
        let dim = images.require(first)?.raw_dim();
        let std = if self.std > 0.0 {
            rng.random_range(0.0..self.std)
        } else {
            0.0
        };
        let noise = Array4::from_shape_simple_fn(dim.clone(), || {
            self.mean + std * rng.sample::<f32, _>(StandardNormal)
        });
        for k in self.keys.iter() {
            let a = images.require_mut(k)?;
            if a.raw_dim() != dim {
                return Err(TransformError::InconsistentShape(k.clone()));
            }
            *a += &noise;
        }
        Ok(Crops::Single(images))
    }
}

/// 以概率 `prob` 做可分离的高斯平滑. 各轴的 sigma 分别在给定区间内均匀采样,
/// 同一样本的所有 `keys` 共用同一组 sigma.
///
/// 卷积核截断在 `4 * sigma`, 归一化后和为 1; 边界外按 0 填充.
#[derive(Clone, Debug)]
pub struct RandGaussianSmooth {
    keys: Vec<String>,
    /// `(Z, Y, X)` 三个轴的 sigma 区间.
    sigma: [(f32, f32); 3],
    prob: f32,
}

impl RandGaussianSmooth {
    const TRUNCATED: f32 = 4.0;

    /// 创建变换. sigma 不能为负.
    pub fn new(
        keys: Vec<String>,
        sigma_z: (f32, f32),
        sigma_y: (f32, f32),
        sigma_x: (f32, f32),
        prob: f32,
    ) -> Result<Self, ConfigError> {
        for s in [sigma_z, sigma_y, sigma_x] {
            check_range("RandGaussianSmooth", s, prob)?;
            if s.0 < 0.0 {
                return Err(ConfigError::InvalidTransform(format!(
                    "RandGaussianSmooth: sigma {s:?} must not be negative"
                )));
            }
        }
        Ok(Self {
            keys,
            sigma: [sigma_z, sigma_y, sigma_x],
            prob,
        })
    }
}

/// 归一化的离散高斯核. `sigma` 为 0 时返回 `[1.0]`.
fn gaussian_kernel(sigma: f32, truncated: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = (sigma * truncated).max(0.5).round() as i64;
    let mut k: Vec<f32> = (-radius..=radius)
        .map(|i| (-0.5 * (i as f32 / sigma).powi(2)).exp())
        .collect();
    let sum: f32 = k.iter().sum();
    k.iter_mut().for_each(|v| *v /= sum);
    k
}

/// 沿一条线做零填充的 "same" 卷积.
fn convolve_lane(mut lane: ArrayViewMut1<f32>, kernel: &[f32], buf: &mut Vec<f32>) {
    let r = (kernel.len() / 2) as i64;
    let n = lane.len() as i64;
    buf.clear();
    buf.extend(lane.iter().copied());
    for (i, out) in lane.iter_mut().enumerate() {
        let i = i as i64;
        *out = kernel
            .iter()
            .enumerate()
            .filter_map(|(j, &w)| {
                let src = i + j as i64 - r;
                (0..n).contains(&src).then(|| w * buf[src as usize])
            })
            .sum();
    }
}

/// 对 `(C, Z, Y, X)` 图像的三个空间轴依次做一维高斯卷积.
fn gaussian_smooth(a: &mut Array4<f32>, sigma: [f32; 3], truncated: f32) {
    let mut buf = Vec::new();
    for (axis, s) in sigma.into_iter().enumerate() {
        let kernel = gaussian_kernel(s, truncated);
        if kernel.len() == 1 {
            continue;
        }
        for lane in a.lanes_mut(Axis(axis + 1)) {
            convolve_lane(lane, &kernel, &mut buf);
        }
    }
}

impl MapTransform for RandGaussianSmooth {
    fn name(&self) -> &'static str {
        "RandGaussianSmooth"
    }

    fn apply(
        &self,
        mut images: ChannelImages,
        rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        if rng.random::<f32>() >= self.prob {
            return Ok(Crops::Single(images));
        }
        let sigma = self.sigma.map(|(lo, hi)| {
            if lo < hi {
                rng.random_range(lo..hi)
            } else {
                lo
            }
        });
        for k in self.keys.iter() {
            gaussian_smooth(images.require_mut(k)?, sigma, Self::TRUNCATED);
        }
        Ok(Crops::Single(images))
    }
}

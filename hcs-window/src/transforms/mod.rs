//! 作用在逐通道图像字典上的变换.
//!
//! 数据模块按 "归一化 -> 数据增强 -> 确定性中心裁剪" 的顺序组合变换.
//! 所有随机性都来自调用方传入的随机数发生器.

use std::fmt::Debug;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::dataset::{ChannelImages, Crops};
use crate::error::{ConfigError, TransformError};
use crate::store::StatsLevel;

mod affine;
mod crop;
mod gaussian;
mod intensity;
mod normalize;

pub use affine::{AxisRange, RandAffine};
pub use crop::{CenterSpatialCrop, RandWeightedCrop, Roi};
pub use gaussian::{RandGaussianNoise, RandGaussianSmooth};
pub use intensity::{RandAdjustContrast, RandScaleIntensity};
pub use normalize::NormalizeSampled;

/// 字典变换.
pub trait MapTransform: Debug + Send + Sync {
    /// 变换名, 用于日志.
    fn name(&self) -> &'static str;

    /// 作用于一个样本. 多重采样变换返回 `Crops::Multi`.
    fn apply(
        &self,
        images: ChannelImages,
        rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError>;

    /// 每个样本产出的 crop 个数. 大于 1 时批大小必须是它的整数倍.
    fn num_samples(&self) -> usize {
        1
    }

    /// 是否为多重采样变换. 即使 `num_samples() == 1`, 多重采样变换的输出也是 `Multi`.
    fn is_multi_sample(&self) -> bool {
        false
    }

    /// 仿射变换在 Z 轴上的缩放区间, 其他变换为 `None`.
    fn z_scale_range(&self) -> Option<(f32, f32)> {
        None
    }
}

/// 按顺序组合若干变换.
#[derive(Debug, Default)]
pub struct Compose {
    transforms: Vec<Box<dyn MapTransform>>,
}

impl Compose {
    /// 组合 `transforms`.
    pub fn new(transforms: Vec<Box<dyn MapTransform>>) -> Self {
        Self { transforms }
    }

    /// 追加一个变换.
    pub fn push(&mut self, t: Box<dyn MapTransform>) {
        self.transforms.push(t);
    }

    /// 变换个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    /// 是否不含任何变换.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// 所含变换名.
    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }
}

impl MapTransform for Compose {
    fn name(&self) -> &'static str {
        "Compose"
    }

    fn apply(
        &self,
        images: ChannelImages,
        rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        let mut out = Crops::Single(images);
        for t in self.transforms.iter() {
            out = match out {
                Crops::Single(im) => t.apply(im, rng)?,
                Crops::Multi(v) => {
                    let mut next = Vec::with_capacity(v.len() * t.num_samples());
                    for im in v {
                        next.extend(t.apply(im, rng)?.into_vec());
                    }
                    Crops::Multi(next)
                }
            };
        }
        Ok(out)
    }

    fn num_samples(&self) -> usize {
        self.transforms.iter().map(|t| t.num_samples()).product()
    }

    fn is_multi_sample(&self) -> bool {
        self.transforms.iter().any(|t| t.is_multi_sample())
    }

    fn z_scale_range(&self) -> Option<(f32, f32)> {
        self.transforms.iter().find_map(|t| t.z_scale_range())
    }
}

fn default_level() -> StatsLevel {
    StatsLevel::DatasetStatistics
}

fn default_prob() -> f32 {
    0.5
}

fn default_noise_std() -> f32 {
    0.1
}

fn default_sigma() -> (f32, f32) {
    (0.25, 1.5)
}

/// 可从 json 配置构建的变换. `roi_size` / `spatial_size` 中的 `-1` 表示该维度保持原大小.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransformSpec {
    /// [`NormalizeSampled`].
    NormalizeSampled {
        /// 通道名.
        keys: Vec<String>,
        /// 统计层级.
        #[serde(default = "default_level")]
        level: StatsLevel,
    },

    /// [`CenterSpatialCrop`].
    CenterSpatialCrop {
        /// 通道名.
        keys: Vec<String>,
        /// `(Z, Y, X)` 裁剪大小.
        roi_size: [i64; 3],
    },

    /// [`RandWeightedCrop`].
    RandWeightedCrop {
        /// 通道名.
        keys: Vec<String>,
        /// `(Z, Y, X)` 裁剪大小.
        spatial_size: [i64; 3],
        /// 每个样本的 crop 个数.
        num_samples: usize,
    },

    /// [`RandScaleIntensity`].
    RandScaleIntensity {
        /// 通道名.
        keys: Vec<String>,
        /// 缩放因子范围, 实际倍率为 `1 + factor`.
        factors: (f32, f32),
        /// 触发概率.
        #[serde(default = "default_prob")]
        prob: f32,
    },

    /// [`RandAdjustContrast`].
    RandAdjustContrast {
        /// 通道名.
        keys: Vec<String>,
        /// gamma 范围.
        gamma: (f32, f32),
        /// 触发概率.
        #[serde(default = "default_prob")]
        prob: f32,
    },

    /// [`RandAffine`]. 各区间按 `(Z, Y, X)` 排列, 缺省为 0.
    RandAffine {
        /// 通道名.
        keys: Vec<String>,
        /// 触发概率.
        #[serde(default = "default_prob")]
        prob: f32,
        /// 旋转角 (弧度).
        #[serde(default)]
        rotate_range: [AxisRange; 3],
        /// 剪切系数.
        #[serde(default)]
        shear_range: [AxisRange; 3],
        /// 缩放, 实际倍率为 `1 + s`.
        #[serde(default)]
        scale_range: [AxisRange; 3],
    },

    /// [`RandGaussianNoise`].
    RandGaussianNoise {
        /// 通道名.
        keys: Vec<String>,
        /// 噪声均值.
        #[serde(default)]
        mean: f32,
        /// 标准差上限.
        #[serde(default = "default_noise_std")]
        std: f32,
        /// 触发概率.
        #[serde(default = "default_prob")]
        prob: f32,
    },

    /// [`RandGaussianSmooth`].
    RandGaussianSmooth {
        /// 通道名.
        keys: Vec<String>,
        /// Z 轴 sigma 区间.
        #[serde(default = "default_sigma")]
        sigma_z: (f32, f32),
        /// Y 轴 sigma 区间.
        #[serde(default = "default_sigma")]
        sigma_y: (f32, f32),
        /// X 轴 sigma 区间.
        #[serde(default = "default_sigma")]
        sigma_x: (f32, f32),
        /// 触发概率.
        #[serde(default = "default_prob")]
        prob: f32,
    },
}

impl TransformSpec {
    /// 构建变换.
    pub fn build(&self) -> Result<Box<dyn MapTransform>, ConfigError> {
        Ok(match self {
            Self::NormalizeSampled { keys, level } => {
                Box::new(NormalizeSampled::new(keys.clone(), *level))
            }
            Self::CenterSpatialCrop { keys, roi_size } => Box::new(CenterSpatialCrop::new(
                keys.clone(),
                Roi::from_signed(*roi_size)?,
            )),
            Self::RandWeightedCrop {
                keys,
                spatial_size,
                num_samples,
            } => Box::new(RandWeightedCrop::new(
                keys.clone(),
                Roi::from_signed(*spatial_size)?,
                *num_samples,
            )?),
            Self::RandScaleIntensity {
                keys,
                factors,
                prob,
            } => Box::new(RandScaleIntensity::new(keys.clone(), *factors, *prob)?),
            Self::RandAdjustContrast { keys, gamma, prob } => {
                Box::new(RandAdjustContrast::new(keys.clone(), *gamma, *prob)?)
            }
            Self::RandAffine {
                keys,
                prob,
                rotate_range,
                shear_range,
                scale_range,
            } => Box::new(RandAffine::new(
                keys.clone(),
                *prob,
                *rotate_range,
                *shear_range,
                *scale_range,
            )?),
            Self::RandGaussianNoise {
                keys,
                mean,
                std,
                prob,
            } => Box::new(RandGaussianNoise::new(keys.clone(), *mean, *std, *prob)?),
            Self::RandGaussianSmooth {
                keys,
                sigma_z,
                sigma_y,
                sigma_x,
                prob,
            } => Box::new(RandGaussianSmooth::new(
                keys.clone(),
                *sigma_z,
                *sigma_y,
                *sigma_x,
                *prob,
            )?),
        })
    }
}

/// 检查概率与区间参数.
pub(crate) fn check_range(name: &str, range: (f32, f32), prob: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&prob) {
        return Err(ConfigError::InvalidTransform(format!(
            "{name}: probability {prob} is not in [0, 1]"
        )));
    }
    if !(range.0.is_finite() && range.1.is_finite()) || range.0 > range.1 {
        return Err(ConfigError::InvalidTransform(format!(
            "{name}: invalid range {range:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn images() -> ChannelImages {
        let mut im = ChannelImages::new(None);
        im.insert(
            "Phase3D",
            Array4::from_shape_fn((1, 3, 8, 8), |(_, z, y, x)| (z * 64 + y * 8 + x) as f32),
        );
        im.insert("Nuclei", Array4::from_elem((1, 3, 8, 8), 1.0));
        im.set_weight("Nuclei").unwrap();
        im
    }

    #[test]
    fn test_compose_propagates_multi() {
        let keys = vec!["Phase3D".to_string(), "Nuclei".to_string()];
        let weighted = RandWeightedCrop::new(keys.clone(), Roi::new(None, Some(4), Some(4)), 2);
        let center = CenterSpatialCrop::new(keys, Roi::new(Some(1), Some(2), Some(2)));
        let compose = Compose::new(vec![
            Box::new(weighted.unwrap()) as Box<dyn MapTransform>,
            Box::new(center),
        ]);
        assert_eq!(compose.num_samples(), 2);
        assert!(compose.is_multi_sample());
        assert_eq!(compose.names(), ["RandWeightedCrop", "CenterSpatialCrop"]);

        let mut rng = StdRng::seed_from_u64(7);
        let out = compose.apply(images(), &mut rng).unwrap();
        assert!(out.is_multi());
        assert_eq!(out.len(), 2);
        for im in out.iter() {
            assert_eq!(im.spatial_shape().unwrap(), Some((1, 2, 2)));
        }
    }

    #[test]
    fn test_empty_compose_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let out = Compose::default().apply(images(), &mut rng).unwrap();
        assert_eq!(out, Crops::Single(images()));
    }

    #[test]
    fn test_spec_from_json() {
        let raw = r#"[
            {"type": "NormalizeSampled", "keys": ["Phase3D"]},
            {"type": "RandWeightedCrop", "keys": ["Phase3D", "Nuclei"],
             "spatial_size": [-1, 4, 4], "num_samples": 4},
            {"type": "RandScaleIntensity", "keys": ["Phase3D"], "factors": [-0.2, 0.2]},
            {"type": "RandAdjustContrast", "keys": ["Phase3D"], "gamma": [0.8, 1.2], "prob": 0.3}
        ]"#;
        let specs: Vec<TransformSpec> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            specs[0],
            TransformSpec::NormalizeSampled {
                keys: vec!["Phase3D".into()],
                level: StatsLevel::DatasetStatistics
            }
        );
        let built = specs
            .iter()
            .map(TransformSpec::build)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(built[1].num_samples(), 4);
        assert_eq!(built[2].num_samples(), 1);
    }

    #[test]
    fn test_augmentation_spec_from_json() {
        let raw = r#"[
            {"type": "RandAffine", "keys": ["Phase3D", "Nuclei"], "prob": 0.8,
             "rotate_range": [0.5, 0, 0], "scale_range": [[-0.2, 0.3], 0.1, 0.1]},
            {"type": "RandGaussianNoise", "keys": ["Phase3D"], "std": 0.05},
            {"type": "RandGaussianSmooth", "keys": ["Phase3D"], "sigma_z": [0.1, 0.5]}
        ]"#;
        let specs: Vec<TransformSpec> = serde_json::from_str(raw).unwrap();
        let TransformSpec::RandAffine { shear_range, .. } = &specs[0] else {
            panic!("{:?}", specs[0]);
        };
        assert_eq!(*shear_range, [AxisRange::Symmetric(0.0); 3]);
        assert_eq!(
            specs[1],
            TransformSpec::RandGaussianNoise {
                keys: vec!["Phase3D".into()],
                mean: 0.0,
                std: 0.05,
                prob: 0.5
            }
        );
        let built = Compose::new(
            specs
                .iter()
                .map(TransformSpec::build)
                .collect::<Result<Vec<_>, _>>()
                .unwrap(),
        );
        assert_eq!(
            built.names(),
            ["RandAffine", "RandGaussianNoise", "RandGaussianSmooth"]
        );
        assert_eq!(built.z_scale_range(), Some((-0.2, 0.3)));
        assert!(!built.is_multi_sample());

        let mut rng = StdRng::seed_from_u64(3);
        let out = built.apply(images(), &mut rng).unwrap();
        assert_eq!(out.len(), 1);
        for im in out.iter() {
            assert_eq!(im.spatial_shape().unwrap(), Some((3, 8, 8)));
        }
    }

    #[test]
    fn test_invalid_spec() {
        let spec = TransformSpec::RandScaleIntensity {
            keys: vec!["Phase3D".into()],
            factors: (0.2, -0.2),
            prob: 0.5,
        };
        assert!(matches!(spec.build(), Err(ConfigError::InvalidTransform(_))));
        let spec = TransformSpec::CenterSpatialCrop {
            keys: vec!["Phase3D".into()],
            roi_size: [0, 4, 4],
        };
        assert!(matches!(spec.build(), Err(ConfigError::InvalidTransform(_))));
    }
}

//! 强度增强.

use rand::{Rng, RngCore};

use super::{check_range, MapTransform};
use crate::dataset::{ChannelImages, Crops};
use crate::error::{ConfigError, TransformError};

/// 以概率 `prob` 将强度乘以 `1 + f`, `f` 在 `factors` 内均匀采样.
///
/// 同一样本的所有 `keys` 共用一个 `f`.
#[derive(Clone, Debug)]
pub struct RandScaleIntensity {
    keys: Vec<String>,
    factors: (f32, f32),
    prob: f32,
}

impl RandScaleIntensity {
    /// 创建变换.
    pub fn new(keys: Vec<String>, factors: (f32, f32), prob: f32) -> Result<Self, ConfigError> {
        check_range("RandScaleIntensity", factors, prob)?;
        Ok(Self {
            keys,
            factors,
            prob,
        })
    }
}

impl MapTransform for RandScaleIntensity {
    fn name(&self) -> &'static str {
        "RandScaleIntensity"
    }

    fn apply(
        &self,
        mut images: ChannelImages,
        rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        if rng.random::<f32>() < self.prob {
            let f = sample(rng, self.factors);
            for k in self.keys.iter() {
                images.require_mut(k)?.mapv_inplace(|v| v * (1.0 + f));
            }
        }
        Ok(Crops::Single(images))
    }
}

/// 以概率 `prob` 做 gamma 对比度调整, gamma 在 `gamma` 内均匀采样.
///
/// `y = ((x - min) / (max - min + eps)) ^ gamma * (max - min) + min`, 逐通道计算.
#[derive(Clone, Debug)]
pub struct RandAdjustContrast {
    keys: Vec<String>,
    gamma: (f32, f32),
    prob: f32,
}

impl RandAdjustContrast {
    const EPS: f32 = 1e-7;

    /// 创建变换. gamma 必须为正.
    pub fn new(keys: Vec<String>, gamma: (f32, f32), prob: f32) -> Result<Self, ConfigError> {
        check_range("RandAdjustContrast", gamma, prob)?;
        if gamma.0 <= 0.0 {
            return Err(ConfigError::InvalidTransform(format!(
                "RandAdjustContrast: gamma {gamma:?} must be positive"
            )));
        }
        Ok(Self { keys, gamma, prob })
    }
}

impl MapTransform for RandAdjustContrast {
    fn name(&self) -> &'static str {
        "RandAdjustContrast"
    }

    fn apply(
        &self,
        mut images: ChannelImages,
        rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        if rng.random::<f32>() < self.prob {
            let g = sample(rng, self.gamma);
            for k in self.keys.iter() {
                let a = images.require_mut(k)?;
                let (lo, hi) = a
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                let range = hi - lo;
                a.mapv_inplace(|v| ((v - lo) / (range + Self::EPS)).powf(g) * range + lo);
            }
        }
        Ok(Crops::Single(images))
    }
}

fn sample(rng: &mut dyn RngCore, (lo, hi): (f32, f32)) -> f32 {
    if lo < hi {
        rng.random_range(lo..hi)
    } else {
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn float_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    fn images() -> ChannelImages {
        let mut im = ChannelImages::new(None);
        im.insert(
            "Phase3D",
            Array4::from_shape_fn((1, 1, 2, 2), |(_, _, y, x)| (y * 2 + x) as f32),
        );
        im.insert("Nuclei", Array4::from_elem((1, 1, 2, 2), 3.0));
        im
    }

    #[test]
    fn test_scale_intensity() {
        let mut rng = StdRng::seed_from_u64(3);
        let t = RandScaleIntensity::new(vec!["Phase3D".into()], (1.0, 1.0), 1.0).unwrap();
        let out = t.apply(images(), &mut rng).unwrap().into_vec();
        let p = out[0].get("Phase3D").unwrap();
        assert!(float_eq(p[(0, 0, 1, 1)], 6.0));
        assert!(float_eq(out[0].get("Nuclei").unwrap()[(0, 0, 0, 0)], 3.0));
    }

    #[test]
    fn test_prob_zero_is_identity() {
        let mut rng = StdRng::seed_from_u64(3);
        let t = RandScaleIntensity::new(vec!["Phase3D".into()], (-0.5, 0.5), 0.0).unwrap();
        assert_eq!(
            t.apply(images(), &mut rng).unwrap(),
            Crops::Single(images())
        );
    }

    #[test]
    fn test_adjust_contrast_keeps_range() {
        let mut rng = StdRng::seed_from_u64(5);
        let t = RandAdjustContrast::new(vec!["Phase3D".into()], (2.0, 2.0), 1.0).unwrap();
        let out = t.apply(images(), &mut rng).unwrap().into_vec();
        let p = out[0].get("Phase3D").unwrap();
        assert!(float_eq(p[(0, 0, 0, 0)], 0.0));
        assert!(float_eq(p[(0, 0, 1, 1)], 3.0));
        // (1 / 3)^2 * 3
        assert!(float_eq(p[(0, 0, 0, 1)], 1.0 / 3.0));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(RandAdjustContrast::new(vec![], (0.0, 1.0), 0.5).is_err());
        assert!(RandScaleIntensity::new(vec![], (0.0, 1.0), 1.5).is_err());
    }
}

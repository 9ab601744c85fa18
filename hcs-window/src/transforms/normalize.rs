use ndarray::{ArrayBase, DataMut, Dimension};
use rand::RngCore;

use super::MapTransform;
use crate::dataset::{ChannelImages, Crops};
use crate::error::TransformError;
use crate::store::{NormMeta, Statistics, StatsLevel};

/// 按样本自带的归一化元信息做 `(x - median) / iqr`.
///
/// 统计量取自 `level` 层级. 该变换可逆, 见 [`NormalizeSampled::inverse`].
#[derive(Clone, Debug)]
pub struct NormalizeSampled {
    keys: Vec<String>,
    level: StatsLevel,
}

impl NormalizeSampled {
    /// 对 `keys` 所列通道做归一化.
    pub fn new(keys: Vec<String>, level: StatsLevel) -> Self {
        Self { keys, level }
    }

    /// 需要归一化的通道.
    #[inline]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    fn stats<'a>(
        &self,
        meta: &'a NormMeta,
        channel: &str,
    ) -> Result<&'a Statistics, TransformError> {
        meta.stats(channel, self.level)
            .ok_or_else(|| TransformError::MissingStatistics {
                channel: channel.to_string(),
                level: self.level.key(),
            })
    }

    /// 归一化单个数组.
    pub fn forward_array<S, D>(
        &self,
        channel: &str,
        a: &mut ArrayBase<S, D>,
        meta: &NormMeta,
    ) -> Result<(), TransformError>
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        let st = self.stats(meta, channel)?;
        let (median, iqr) = (st.median, st.iqr);
        a.mapv_inplace(|v| (v - median) / iqr);
        Ok(())
    }

    /// 逆变换单个数组: `x * iqr + median`.
    pub fn inverse_array<S, D>(
        &self,
        channel: &str,
        a: &mut ArrayBase<S, D>,
        meta: &NormMeta,
    ) -> Result<(), TransformError>
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        let st = self.stats(meta, channel)?;
        let (median, iqr) = (st.median, st.iqr);
        a.mapv_inplace(|v| v * iqr + median);
        Ok(())
    }

    /// 对字典中的 `keys` 做逆变换.
    pub fn inverse(&self, mut images: ChannelImages) -> Result<ChannelImages, TransformError> {
        let meta = images
            .norm_meta()
            .cloned()
            .ok_or(TransformError::MissingNormMeta)?;
        for k in self.keys.iter() {
            self.inverse_array(k, images.require_mut(k)?, &meta)?;
        }
        Ok(images)
    }
}

impl MapTransform for NormalizeSampled {
    fn name(&self) -> &'static str {
        "NormalizeSampled"
    }

    fn apply(
        &self,
        mut images: ChannelImages,
        _rng: &mut dyn RngCore,
    ) -> Result<Crops<ChannelImages>, TransformError> {
        let meta = images
            .norm_meta()
            .cloned()
            .ok_or(TransformError::MissingNormMeta)?;
        for k in self.keys.iter() {
            self.forward_array(k, images.require_mut(k)?, &meta)?;
        }
        Ok(Crops::Single(images))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChannelNorm;
    use ndarray::Array4;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn float_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    fn meta() -> Arc<NormMeta> {
        let mut m = NormMeta::new();
        m.insert(
            "Nuclei",
            ChannelNorm {
                dataset_statistics: Some(Statistics::new(5.0, 1.0)),
                fov_statistics: Some(Statistics::new(4.0, 2.0)),
            },
        );
        Arc::new(m)
    }

    #[test]
    fn test_round_trip() {
        let mut im = ChannelImages::new(Some(meta()));
        im.insert("Nuclei", Array4::from_elem((1, 2, 4, 4), 5.0));
        let t = NormalizeSampled::new(vec!["Nuclei".into()], StatsLevel::DatasetStatistics);

        let mut rng = StdRng::seed_from_u64(0);
        let Crops::Single(normed) = t.apply(im, &mut rng).unwrap() else {
            panic!("normalization must produce a single sample");
        };
        assert!(normed.get("Nuclei").unwrap().iter().all(|&v| float_eq(v, 0.0)));

        let back = t.inverse(normed).unwrap();
        assert!(back.get("Nuclei").unwrap().iter().all(|&v| float_eq(v, 5.0)));
    }

    #[test]
    fn test_fov_level() {
        let t = NormalizeSampled::new(vec!["Nuclei".into()], StatsLevel::FovStatistics);
        let mut a = Array4::from_elem((1, 1, 1, 1), 8.0);
        t.forward_array("Nuclei", &mut a, &meta()).unwrap();
        assert!(float_eq(a[(0, 0, 0, 0)], 2.0));
    }

    #[test]
    fn test_missing_metadata() {
        let t = NormalizeSampled::new(vec!["Phase3D".into()], StatsLevel::DatasetStatistics);
        let mut rng = StdRng::seed_from_u64(0);

        let mut im = ChannelImages::new(None);
        im.insert("Phase3D", Array4::zeros((1, 1, 1, 1)));
        assert_eq!(
            t.apply(im, &mut rng).unwrap_err(),
            TransformError::MissingNormMeta
        );

        let mut im = ChannelImages::new(Some(meta()));
        im.insert("Phase3D", Array4::zeros((1, 1, 1, 1)));
        assert_eq!(
            t.apply(im, &mut rng).unwrap_err(),
            TransformError::MissingStatistics {
                channel: "Phase3D".into(),
                level: "dataset_statistics"
            }
        );
    }
}

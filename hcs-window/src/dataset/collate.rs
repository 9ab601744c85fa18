use std::sync::Arc;

use ndarray::{stack, Array3, Array4, Array5, ArrayView2, ArrayView4, Axis};

use super::{Sample, SampleIndex};
use crate::error::CollateError;
use crate::store::NormMeta;

/// 拼接后的批次.
///
/// 多重采样得到的 crop 会被展开到批维度, `index` 与 `norm_meta`
/// 随之逐 crop 重复, 因此所有字段的第一维长度相同.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// 每个 crop 的样本索引.
    pub index: Vec<SampleIndex>,

    /// `(B, C, Z, Y, X)`.
    pub source: Array5<f32>,

    /// `(B, C, Z, Y, X)`.
    pub target: Option<Array5<f32>>,

    /// 每个 crop 的归一化元信息.
    pub norm_meta: Vec<Option<Arc<NormMeta>>>,

    /// `(B, Y, X)`.
    pub labels: Option<Array3<u16>>,
}

impl Batch {
    /// 批维度长度.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// 是否为空. 由 [`collate`] 得到的批次总是非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// 将若干样本拼接为一个批次.
///
/// 所有样本必须在 `target` 与 `labels` 是否存在上保持一致.
pub fn collate(samples: Vec<Sample>) -> Result<Batch, CollateError> {
    let first = samples.first().ok_or(CollateError::EmptyBatch)?;
    let has_target = first.target.is_some();
    let has_labels = first.labels.is_some();

    let total: usize = samples.iter().map(Sample::num_crops).sum();
    let mut index = Vec::with_capacity(total);
    let mut norm_meta = Vec::with_capacity(total);
    let mut sources: Vec<ArrayView4<f32>> = Vec::with_capacity(total);
    let mut targets: Vec<ArrayView4<f32>> = Vec::with_capacity(total);
    let mut labels: Vec<ArrayView2<u16>> = Vec::with_capacity(total);

    for (i, s) in samples.iter().enumerate() {
        if s.target.is_some() != has_target {
            return Err(CollateError::KeyMismatch {
                key: "target",
                sample: i,
            });
        }
        if s.labels.is_some() != has_labels {
            return Err(CollateError::KeyMismatch {
                key: "labels",
                sample: i,
            });
        }
        if let Some(t) = &s.target {
            if t.len() != s.source.len() {
                return Err(CollateError::CropCountMismatch {
                    sample: i,
                    source: s.source.len(),
                    target: t.len(),
                });
            }
            targets.extend(t.iter().map(Array4::view));
        }
        for src in s.source.iter() {
            sources.push(src.view());
            index.push(s.index.clone());
            norm_meta.push(s.norm_meta.clone());
            if let Some(l) = &s.labels {
                labels.push(l.view());
            }
        }
    }

    Ok(Batch {
        index,
        source: stack(Axis(0), &sources)?,
        target: if has_target {
            Some(stack(Axis(0), &targets)?)
        } else {
            None
        },
        norm_meta,
        labels: if has_labels {
            Some(stack(Axis(0), &labels)?)
        } else {
            None
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Crops;
    use ndarray::Array2;

    fn sample(i: usize, crops: usize, with_target: bool) -> Sample {
        let one = |k: usize| Array4::from_elem((2, 1, 8, 8), (i * 10 + k) as f32);
        let source = if crops == 1 {
            Crops::Single(one(0))
        } else {
            Crops::Multi((0..crops).map(one).collect())
        };
        Sample {
            index: SampleIndex::new("A/1/0", 0, i),
            target: with_target.then(|| source.clone()),
            source,
            norm_meta: None,
            labels: None,
        }
    }

    #[test]
    fn test_collate_single() {
        let batch = collate((0..3).map(|i| sample(i, 1, true)).collect()).unwrap();
        assert_eq!(batch.source.dim(), (3, 2, 1, 8, 8));
        assert_eq!(batch.target.as_ref().map(|t| t.dim()), Some((3, 2, 1, 8, 8)));
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.norm_meta.len(), 3);
        assert_eq!(batch.source[(2, 0, 0, 0, 0)], 20.0);
        assert!(batch.labels.is_none());
    }

    #[test]
    fn test_collate_flattens_multi() {
        let batch = collate((0..3).map(|i| sample(i, 2, true)).collect()).unwrap();
        assert_eq!(batch.source.dim(), (6, 2, 1, 8, 8));
        assert_eq!(batch.target.as_ref().map(|t| t.dim()), Some((6, 2, 1, 8, 8)));
        assert_eq!(batch.index.len(), 6);
        // 样本 1 的第 2 个 crop.
        assert_eq!(batch.source[(3, 0, 0, 0, 0)], 11.0);
        assert_eq!(batch.index[3], SampleIndex::new("A/1/0", 0, 1));
    }

    #[test]
    fn test_collate_errors() {
        assert!(matches!(collate(Vec::new()), Err(CollateError::EmptyBatch)));

        let r = collate(vec![sample(0, 1, true), sample(1, 1, false)]);
        assert!(matches!(
            r,
            Err(CollateError::KeyMismatch {
                key: "target",
                sample: 1
            })
        ));

        let mut s = sample(0, 2, true);
        s.target = Some(Crops::Single(Array4::zeros((2, 1, 8, 8))));
        assert!(matches!(
            collate(vec![s]),
            Err(CollateError::CropCountMismatch {
                sample: 0,
                source: 2,
                target: 1
            })
        ));

        let mut s = sample(1, 1, false);
        s.source = Crops::Single(Array4::zeros((2, 1, 4, 4)));
        assert!(matches!(
            collate(vec![sample(0, 1, false), s]),
            Err(CollateError::Shape(_))
        ));
    }

    #[test]
    fn test_collate_labels() {
        let mut s = sample(0, 1, false);
        s.labels = Some(Array2::from_elem((8, 8), 3));
        let batch = collate(vec![s]).unwrap();
        assert_eq!(batch.labels.map(|l| l.dim()), Some((1, 8, 8)));
    }
}

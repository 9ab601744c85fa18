//! 样本与逐通道图像字典.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{concatenate, Array2, Array4, ArrayView4, Axis};

use super::ChannelMap;
use crate::error::{DataResult, TransformError};
use crate::store::NormMeta;
use crate::Idx3d;

/// 变换的输出: 单个结果, 或多重采样得到的若干结果.
///
/// 一旦某个变换产出 `Multi`, 其后的变换会逐个作用于每个结果,
/// 最终样本与批次都保留 `Multi` 语义.
#[derive(Clone, Debug, PartialEq)]
pub enum Crops<T> {
    /// 单个结果.
    Single(T),

    /// 多个结果.
    Multi(Vec<T>),
}

impl<T> Crops<T> {
    /// 结果个数.
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi(v) => v.len(),
        }
    }

    /// 是否不含任何结果. 只有空的 `Multi` 才会如此.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否为 `Multi`.
    #[inline]
    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi(_))
    }

    /// 按顺序迭代所有结果.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            Self::Single(x) => std::slice::from_ref(x).iter(),
            Self::Multi(v) => v.iter(),
        }
    }

    /// 展开为 `Vec`.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::Single(x) => vec![x],
            Self::Multi(v) => v,
        }
    }

    /// 保持单/多语义, 对每个结果应用 `f`.
    pub fn map<U, F: FnMut(T) -> U>(self, mut f: F) -> Crops<U> {
        match self {
            Self::Single(x) => Crops::Single(f(x)),
            Self::Multi(v) => Crops::Multi(v.into_iter().map(f).collect()),
        }
    }

    /// 保持单/多语义, 对每个结果应用可能失败的 `f`.
    pub fn try_map<U, E, F>(self, mut f: F) -> Result<Crops<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        Ok(match self {
            Self::Single(x) => Crops::Single(f(x)?),
            Self::Multi(v) => Crops::Multi(v.into_iter().map(f).collect::<Result<_, _>>()?),
        })
    }
}

/// 单个样本 (或单个 crop) 在变换期间的逐通道图像字典.
///
/// 每个通道的形状为 `(1, Z, Y, X)`. 若存在 target, 其第一个通道同时充当
/// 重要性采样的权重图; 权重只是对该通道的别名, 不做复制.
#[derive(Clone, Default, PartialEq)]
pub struct ChannelImages {
    images: BTreeMap<String, Array4<f32>>,
    weight: Option<String>,
    norm_meta: Option<Arc<NormMeta>>,
}

impl fmt::Debug for ChannelImages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shapes: BTreeMap<_, _> = self.images.iter().map(|(k, v)| (k, v.dim())).collect();
        f.debug_struct("ChannelImages")
            .field("images", &shapes)
            .field("weight", &self.weight)
            .field("norm_meta", &self.norm_meta.is_some())
            .finish()
    }
}

impl ChannelImages {
    /// 创建空字典.
    pub fn new(norm_meta: Option<Arc<NormMeta>>) -> Self {
        Self {
            images: BTreeMap::new(),
            weight: None,
            norm_meta,
        }
    }

    /// 插入通道图像, 返回旧值.
    pub fn insert(&mut self, channel: impl Into<String>, image: Array4<f32>) -> Option<Array4<f32>> {
        self.images.insert(channel.into(), image)
    }

    /// 获取通道图像.
    #[inline]
    pub fn get(&self, channel: &str) -> Option<&Array4<f32>> {
        self.images.get(channel)
    }

    /// 获取通道图像的可变引用.
    #[inline]
    pub fn get_mut(&mut self, channel: &str) -> Option<&mut Array4<f32>> {
        self.images.get_mut(channel)
    }

    /// 获取通道图像, 不存在时报错.
    pub fn require(&self, channel: &str) -> Result<&Array4<f32>, TransformError> {
        self.get(channel)
            .ok_or_else(|| TransformError::MissingKey(channel.to_string()))
    }

    /// 获取通道图像的可变引用, 不存在时报错.
    pub fn require_mut(&mut self, channel: &str) -> Result<&mut Array4<f32>, TransformError> {
        self.images
            .get_mut(channel)
            .ok_or_else(|| TransformError::MissingKey(channel.to_string()))
    }

    /// 按通道名升序迭代.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array4<f32>)> {
        self.images.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// 按通道名升序可变迭代.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Array4<f32>)> {
        self.images.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// 通道个数 (权重别名不计入).
    #[inline]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// 是否不含任何通道.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// 令 `channel` 充当权重图.
    pub fn set_weight(&mut self, channel: &str) -> Result<(), TransformError> {
        self.require(channel)?;
        self.weight = Some(channel.to_string());
        Ok(())
    }

    /// 移除权重别名. 被别名的通道本身保留.
    #[inline]
    pub fn clear_weight(&mut self) {
        self.weight = None;
    }

    /// 权重图所别名的通道名.
    #[inline]
    pub fn weight_channel(&self) -> Option<&str> {
        self.weight.as_deref()
    }

    /// 权重图.
    #[inline]
    pub fn weight(&self) -> Option<&Array4<f32>> {
        self.images.get(self.weight.as_deref()?)
    }

    /// 归一化元信息.
    #[inline]
    pub fn norm_meta(&self) -> Option<&Arc<NormMeta>> {
        self.norm_meta.as_ref()
    }

    /// 所有通道共同的空间形状 `(Z, Y, X)`. 字典为空时返回 `None`.
    pub fn spatial_shape(&self) -> Result<Option<Idx3d>, TransformError> {
        let mut shape = None;
        for (k, v) in self.images.iter() {
            let (_, z, y, x) = v.dim();
            match shape {
                None => shape = Some((z, y, x)),
                Some(s) if s != (z, y, x) => {
                    return Err(TransformError::InconsistentShape(k.clone()))
                }
                Some(_) => {}
            }
        }
        Ok(shape)
    }

    /// 按 `channels` 的顺序将单通道图像堆叠为 `(C, Z, Y, X)`.
    pub fn stack(&self, channels: &[String]) -> DataResult<Array4<f32>> {
        let views = channels
            .iter()
            .map(|c| self.require(c).map(Array4::view))
            .collect::<Result<Vec<ArrayView4<f32>>, _>>()?;
        Ok(concatenate(Axis(0), &views)?)
    }
}

/// 样本索引: 位点名、时间帧与 z 窗口起点.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SampleIndex {
    /// 位点名.
    pub position: String,

    /// 时间帧.
    pub time: usize,

    /// z 窗口起点.
    pub z: usize,
}

impl SampleIndex {
    /// 创建索引.
    #[inline]
    pub fn new(position: impl Into<String>, time: usize, z: usize) -> Self {
        Self {
            position: position.into(),
            time,
            z,
        }
    }
}

impl fmt::Display for SampleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, t={}, z={})", self.position, self.time, self.z)
    }
}

/// 数据集产出的单个样本.
///
/// `source` / `target` 的每个元素形状为 `(C, Z, Y, X)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// 样本索引.
    pub index: SampleIndex,

    /// 模型输入.
    pub source: Crops<Array4<f32>>,

    /// 模型目标. 仅当通道映射包含 target 时存在.
    pub target: Option<Crops<Array4<f32>>>,

    /// 归一化元信息.
    pub norm_meta: Option<Arc<NormMeta>>,

    /// 测试阶段的真值掩码 `(Y, X)`.
    pub labels: Option<Array2<u16>>,
}

impl Sample {
    /// 该样本展开后的 crop 个数.
    #[inline]
    pub fn num_crops(&self) -> usize {
        self.source.len()
    }

    /// 由变换结果按通道映射堆叠出样本. 权重别名在此之前应已移除.
    pub(crate) fn assemble(
        index: SampleIndex,
        crops: Crops<ChannelImages>,
        channels: &ChannelMap,
        norm_meta: Option<Arc<NormMeta>>,
    ) -> DataResult<Self> {
        let source = match &crops {
            Crops::Single(im) => Crops::Single(im.stack(channels.source())?),
            Crops::Multi(v) => Crops::Multi(
                v.iter()
                    .map(|im| im.stack(channels.source()))
                    .collect::<DataResult<_>>()?,
            ),
        };
        let target = match channels.target() {
            Some(names) => Some(crops.try_map(|im| im.stack(names))?),
            None => None,
        };
        Ok(Self {
            index,
            source,
            target,
            norm_meta,
            labels: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use ndarray::Array4;

    fn images() -> ChannelImages {
        let mut im = ChannelImages::new(None);
        im.insert("Phase3D", Array4::from_elem((1, 2, 3, 3), 1.0));
        im.insert("Nuclei", Array4::from_elem((1, 2, 3, 3), 2.0));
        im
    }

    #[test]
    fn test_weight_alias() {
        let mut im = images();
        assert!(im.weight().is_none());
        im.set_weight("Nuclei").unwrap();
        assert_eq!(im.weight().map(|w| w[(0, 0, 0, 0)]), Some(2.0));
        assert_eq!(im.len(), 2);
        im.clear_weight();
        assert!(im.weight().is_none());
        assert!(im.get("Nuclei").is_some());
        assert!(im.set_weight("DAPI").is_err());
    }

    #[test]
    fn test_stack_order() {
        let im = images();
        let stacked = im
            .stack(&["Nuclei".to_string(), "Phase3D".to_string()])
            .unwrap();
        assert_eq!(stacked.dim(), (2, 2, 3, 3));
        assert_eq!(stacked[(0, 1, 2, 2)], 2.0);
        assert_eq!(stacked[(1, 0, 0, 0)], 1.0);
    }

    #[test]
    fn test_stack_shape_mismatch() {
        let mut im = images();
        im.insert("Membrane", Array4::zeros((1, 1, 3, 3)));
        assert!(matches!(
            im.spatial_shape(),
            Err(TransformError::InconsistentShape(_))
        ));
        let r = im.stack(&["Phase3D".to_string(), "Membrane".to_string()]);
        assert!(matches!(r, Err(DataError::Shape(_))));
    }

    #[test]
    fn test_assemble_multi() {
        let channels = ChannelMap::new(vec!["Phase3D".into()], Some(vec!["Nuclei".into()])).unwrap();
        let crops = Crops::Multi(vec![images(), images()]);
        let s = Sample::assemble(SampleIndex::new("A/1/0", 0, 1), crops, &channels, None).unwrap();
        assert_eq!(s.num_crops(), 2);
        assert!(s.source.is_multi());
        let target = s.target.unwrap();
        assert_eq!(target.len(), 2);
        assert!(target.iter().all(|t| t.dim() == (1, 2, 3, 3)));
    }
}

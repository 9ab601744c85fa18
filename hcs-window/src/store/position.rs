use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array3, Array4, Array5, Axis};

use super::attrs::{read_json, NormMeta, PositionAttrs};
use super::{with_element, ChunkArchive, DType, Element};
use crate::consts::layout;
use crate::error::{StoreError, StoreResult};
use crate::{Idx3d, Shape5d};

/// 位点像素的来源.
enum Storage {
    /// 磁盘上的 level 0 归档.
    Archive(ChunkArchive),

    /// 已经在内存中的 `(T, C, Z, Y, X)` 数组.
    Memory(Array5<f32>),
}

/// 一个视野 (field of view) 的多维图像, 形状为 `(T, C, Z, Y, X)`.
///
/// 对数据集而言该结构只读. 读取通道在结构析构时随之关闭.
pub struct Position {
    name: String,
    attrs: PositionAttrs,
    dtype: DType,
    norm_meta: Option<Arc<NormMeta>>,
    storage: Storage,
}

impl std::fmt::Debug for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Position")
            .field("name", &self.name)
            .field("shape", &self.attrs.shape)
            .field("channels", &self.attrs.channel_names)
            .field("dtype", &self.dtype)
            .field("in_memory", &self.is_in_memory())
            .finish()
    }
}

impl Position {
    /// 打开目录 `dir` 下的位点. `name` 是它在 plate 中的相对路径,
    /// `slots` 为底层归档的读取通道个数.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        name: impl Into<String>,
        slots: NonZeroUsize,
    ) -> StoreResult<Self> {
        let dir = dir.as_ref();
        let attrs_path = dir.join(layout::POSITION_ATTRS);
        let attrs: PositionAttrs = read_json(&attrs_path)?;
        attrs.validate(&attrs_path)?;
        let dtype = attrs.parse_dtype(&attrs_path)?;
        let archive = ChunkArchive::open(slots, dir.join(layout::LEVEL_0))?;
        Ok(Self {
            name: name.into(),
            dtype,
            norm_meta: attrs.normalization.clone().map(Arc::new),
            attrs,
            storage: Storage::Archive(archive),
        })
    }

    /// 用内存中的数组直接创建位点. 像素会先转换为 `f32` 保存,
    /// 但 [`Position::dtype`] 仍报告 `T` 的类型.
    pub fn from_array<T: Element>(
        name: impl Into<String>,
        channel_names: Vec<String>,
        data: Array5<T>,
        normalization: Option<NormMeta>,
    ) -> StoreResult<Self> {
        let name = name.into();
        let (t, c, z, y, x) = data.dim();
        let attrs = PositionAttrs {
            channel_names,
            shape: [t, c, z, y, x],
            dtype: T::DTYPE.name().to_string(),
            normalization,
        };
        attrs.validate(Path::new(&name))?;
        Ok(Self {
            name,
            dtype: T::DTYPE,
            norm_meta: attrs.normalization.clone().map(Arc::new),
            attrs,
            storage: Storage::Memory(data.mapv(Element::to_f32)),
        })
    }

    /// 位点名 (plate 中的相对路径).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 元信息.
    #[inline]
    pub fn attrs(&self) -> &PositionAttrs {
        &self.attrs
    }

    /// 数组形状 `(T, C, Z, Y, X)`.
    #[inline]
    pub fn shape(&self) -> Shape5d {
        let [t, c, z, y, x] = self.attrs.shape;
        (t, c, z, y, x)
    }

    /// 时间帧个数.
    #[inline]
    pub fn frames(&self) -> usize {
        self.attrs.shape[0]
    }

    /// 通道个数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.attrs.shape[1]
    }

    /// z 切片个数.
    #[inline]
    pub fn slices(&self) -> usize {
        self.attrs.shape[2]
    }

    /// 单帧单通道的空间形状 `(Z, Y, X)`.
    #[inline]
    pub fn zyx(&self) -> Idx3d {
        let [_, _, z, y, x] = self.attrs.shape;
        (z, y, x)
    }

    /// 通道名.
    #[inline]
    pub fn channel_names(&self) -> &[String] {
        &self.attrs.channel_names
    }

    /// 通道名对应的通道索引.
    pub fn get_channel_index(&self, channel: &str) -> Option<usize> {
        self.attrs.channel_names.iter().position(|c| c == channel)
    }

    /// 像素类型.
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// 归一化元信息.
    #[inline]
    pub fn norm_meta(&self) -> Option<&Arc<NormMeta>> {
        self.norm_meta.as_ref()
    }

    /// 像素是否已经在内存中.
    #[inline]
    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Memory(_))
    }

    fn check_chunk(&self, t: usize, c: usize) -> StoreResult<()> {
        if t < self.frames() && c < self.channels() {
            Ok(())
        } else {
            Err(StoreError::ChunkOutOfBounds {
                position: self.name.clone(),
                t,
                c,
            })
        }
    }

    fn check_chunk_shape(&self, found: Idx3d) -> StoreResult<()> {
        if found == self.zyx() {
            Ok(())
        } else {
            Err(StoreError::InvalidAttrs {
                path: Path::new(&self.name).join(layout::LEVEL_0),
                reason: format!("chunk shape {found:?} differs from {:?}", self.zyx()),
            })
        }
    }

    /// 以原始元素类型 `T` 读取 `(t, c)` 的 `(Z, Y, X)` 块.
    ///
    /// `T` 与存储的实际类型不一致时, 归档读取会返回错误.
    pub fn read_chunk<T: Element>(&self, t: usize, c: usize) -> StoreResult<Array3<T>> {
        self.check_chunk(t, c)?;
        match &self.storage {
            Storage::Archive(archive) => {
                let chunk = archive.chunk::<T>(t, c)?;
                self.check_chunk_shape(chunk.dim())?;
                Ok(chunk)
            }
            Storage::Memory(data) => Ok(data.slice(s![t, c, .., .., ..]).mapv(T::from_f32)),
        }
    }

    /// 读取 `(t, c)` 的 `(Z, Y, X)` 块并转换为 `f32`.
    pub fn read_chunk_f32(&self, t: usize, c: usize) -> StoreResult<Array3<f32>> {
        self.check_chunk(t, c)?;
        match &self.storage {
            Storage::Archive(_) => {
                with_element!(self.dtype, E => {
                    Ok(self.read_chunk::<E>(t, c)?.mapv(Element::to_f32))
                })
            }
            Storage::Memory(data) => Ok(data.slice(s![t, c, .., .., ..]).to_owned()),
        }
    }

    /// 读取时间 `t`、z 范围 `z` 内的若干通道.
    ///
    /// 返回值与 `channels` 一一对应, 每个元素形状为 `(1, z.len(), Y, X)`.
    pub fn read_window(
        &self,
        t: usize,
        channels: &[usize],
        z: Range<usize>,
    ) -> StoreResult<Vec<Array4<f32>>> {
        if z.start > z.end || z.end > self.slices() {
            return Err(StoreError::ZRangeOutOfBounds {
                position: self.name.clone(),
                end: z.end,
                slices: self.slices(),
            });
        }
        channels
            .iter()
            .map(|&c| {
                let chunk = self.read_chunk_f32(t, c)?;
                Ok(chunk
                    .slice_move(s![z.clone(), .., ..])
                    .insert_axis(Axis(0)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Position;
    use crate::error::StoreError;
    use crate::store::DType;
    use ndarray::Array5;

    fn ramp() -> Position {
        let data = Array5::<u16>::from_shape_fn((2, 3, 4, 2, 2), |(t, c, z, _, _)| {
            (t * 100 + c * 10 + z) as u16
        });
        let names = ["Phase3D", "Nuclei", "Membrane"].map(String::from).to_vec();
        Position::from_array("A/1/0", names, data, None).unwrap()
    }

    #[test]
    fn test_channel_lookup_and_dtype() {
        let p = ramp();
        assert_eq!(p.get_channel_index("Nuclei"), Some(1));
        assert_eq!(p.get_channel_index("DAPI"), None);
        assert_eq!(p.dtype(), DType::U16);
        assert_eq!(p.shape(), (2, 3, 4, 2, 2));
        assert!(p.norm_meta().is_none());
    }

    #[test]
    fn test_read_window() {
        let p = ramp();
        let w = p.read_window(1, &[2, 0], 1..4).unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].dim(), (1, 3, 2, 2));
        assert_eq!(w[0][(0, 0, 0, 0)], 121.0);
        assert_eq!(w[1][(0, 2, 1, 1)], 103.0);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let p = ramp();
        assert!(matches!(
            p.read_window(0, &[0], 2..5),
            Err(StoreError::ZRangeOutOfBounds { end: 5, .. })
        ));
        assert!(matches!(
            p.read_chunk_f32(2, 0),
            Err(StoreError::ChunkOutOfBounds { t: 2, c: 0, .. })
        ));
    }

    #[test]
    fn test_channel_count_mismatch() {
        let data = Array5::<f32>::zeros((1, 2, 1, 2, 2));
        let r = Position::from_array("A/1/1", vec!["Phase3D".into()], data, None);
        assert!(matches!(r, Err(StoreError::InvalidAttrs { .. })));
    }
}

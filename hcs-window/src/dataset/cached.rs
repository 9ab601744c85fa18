use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use log::{debug, info};
use ndarray::{s, Array4, Array6, Axis, Zip};
use rand::RngCore;

use super::sliding::{channel_indices, transform_and_assemble};
use super::{ChannelImages, ChannelMap, Dataset, Sample, SampleIndex};
use crate::error::{ConfigError, DataError, DataResult, LookupError};
use crate::store::{with_element, DType, Element, Position};
use crate::transforms::Compose;
use crate::Idx3d;

/// 缓存缓冲区. 元素类型在运行时由第一个位点决定.
trait SlotBuffer: Send + Sync {
    /// 把 `images` (每个形状 `(1, Z, Y, X)`) 写入第 `i` 个槽位.
    fn store(&self, i: usize, images: &[Array4<f32>]);

    /// 以 `f32` 读出第 `i` 个槽位的第 `c` 个通道, 形状 `(1, Z, Y, X)`.
    fn load(&self, i: usize, c: usize) -> Array4<f32>;

    fn dtype(&self) -> DType;

    fn shape(&self) -> &[usize];
}

/// 形状为 `(N, 1, C, Z, Y, X)` 的预分配缓冲区.
struct Slots<T: Element> {
    data: RwLock<Array6<T>>,
    shape: [usize; 6],
}

impl<T: Element> Slots<T> {
    fn allocate(shape: [usize; 6]) -> DataResult<Self> {
        let len = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        let bytes = len.and_then(|n| n.checked_mul(T::DTYPE.size_of()));
        let (len, bytes) = match (len, bytes) {
            (Some(n), Some(b)) => (n, b),
            _ => return Err(DataError::CacheAllocation { bytes: usize::MAX }),
        };
        let mut v: Vec<T> = Vec::new();
        v.try_reserve_exact(len)
            .map_err(|_| DataError::CacheAllocation { bytes })?;
        v.resize(len, T::default());
        let data = Array6::from_shape_vec(shape, v)?;
        Ok(Self {
            data: RwLock::new(data),
            shape,
        })
    }
}

impl<T: Element> SlotBuffer for Slots<T> {
    fn store(&self, i: usize, images: &[Array4<f32>]) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        for (c, im) in images.iter().enumerate() {
            let dst = data.slice_mut(s![i, 0, c, .., .., ..]);
            let src = im.index_axis(Axis(0), 0);
            Zip::from(dst).and(&src).for_each(|d, &v| *d = T::from_f32(v));
        }
    }

    fn load(&self, i: usize, c: usize) -> Array4<f32> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.slice(s![i, 0, c, .., .., ..])
            .mapv(Element::to_f32)
            .insert_axis(Axis(0))
    }

    fn dtype(&self) -> DType {
        T::DTYPE
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// 内存缓存数据集. 每个位点只产出一个样本: 第 0 帧的完整 z stack.
///
/// 构造时按第一个位点的元素类型一次性预分配 `(N, 1, C, Z, Y, X)` 的缓冲区,
/// `C` 为通道映射中 source 与 target 通道个数之和. 某个位点第一次被访问时,
/// 其通道被解压写入对应槽位, 之后的访问只读缓存.
///
/// 多个 worker 线程共享同一个数据集时也共享同一份缓存, 每个位点恰好解压一次.
pub struct CachedDataset {
    positions: Vec<Position>,
    channels: ChannelMap,
    /// 每个位点上, source 后接 target 的通道索引.
    channel_idx: Vec<Vec<usize>>,
    names: Vec<String>,
    transform: Compose,
    buffer: Box<dyn SlotBuffer>,
    filled: Vec<Mutex<bool>>,
    decodes: AtomicUsize,
}

impl std::fmt::Debug for CachedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDataset")
            .field("positions", &self.positions.len())
            .field("channels", &self.channels)
            .field("dtype", &self.buffer.dtype())
            .field("shape", &self.buffer.shape())
            .field("cached", &self.cached_len())
            .finish()
    }
}

impl CachedDataset {
    /// 创建数据集并预分配缓存. 分配失败时返回 [`DataError::CacheAllocation`].
    pub fn new(
        positions: Vec<Position>,
        channels: ChannelMap,
        transform: Compose,
    ) -> DataResult<Self> {
        let names: Vec<String> = channels.all_channels().cloned().collect();
        let mut channel_idx = Vec::with_capacity(positions.len());
        let mut zyx: Option<Idx3d> = None;
        for p in positions.iter() {
            channel_idx.push(channel_indices(p, &names)?);
            match zyx {
                None => zyx = Some(p.zyx()),
                Some(expected) if expected != p.zyx() => {
                    return Err(ConfigError::CachedShapeMismatch {
                        position: p.name().to_string(),
                        expected,
                        found: p.zyx(),
                    }
                    .into())
                }
                Some(_) => {}
            }
        }

        let (z, y, x) = zyx.unwrap_or((0, 0, 0));
        let shape = [positions.len(), 1, names.len(), z, y, x];
        // 没有位点时缓冲区为空, 类型无关紧要.
        let dtype = positions.first().map_or(DType::F32, Position::dtype);
        let buffer: Box<dyn SlotBuffer> = with_element!(dtype, E => {
            Box::new(Slots::<E>::allocate(shape)?) as Box<dyn SlotBuffer>
        });
        info!("Cache shape: {shape:?}, dtype {}", dtype.name());

        Ok(Self {
            filled: positions.iter().map(|_| Mutex::new(false)).collect(),
            positions,
            channels,
            channel_idx,
            names,
            transform,
            buffer,
            decodes: AtomicUsize::new(0),
        })
    }

    /// 通道映射.
    #[inline]
    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// 缓存元素类型.
    #[inline]
    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    /// 缓存形状 `(N, 1, C, Z, Y, X)`.
    #[inline]
    pub fn cache_shape(&self) -> &[usize] {
        self.buffer.shape()
    }

    /// 第 `index` 个位点是否已缓存.
    pub fn is_cached(&self, index: usize) -> bool {
        self.filled
            .get(index)
            .is_some_and(|f| *f.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// 已缓存的位点个数.
    pub fn cached_len(&self) -> usize {
        (0..self.positions.len())
            .filter(|&i| self.is_cached(i))
            .count()
    }

    /// 累计解压次数. 每个位点至多贡献一次.
    #[inline]
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }

    fn check_index(&self, index: usize) -> Result<(), LookupError> {
        if index < self.positions.len() {
            Ok(())
        } else {
            Err(LookupError::IndexOutOfRange {
                index,
                len: self.positions.len(),
            })
        }
    }

    /// 确保第 `index` 个位点已在缓存中.
    ///
    /// 同一位点的并发首次访问会在该位点的锁上等待, 只有一个线程解压.
    pub fn ensure_cached(&self, index: usize) -> DataResult<()> {
        self.check_index(index)?;
        let mut filled = self.filled[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *filled {
            return Ok(());
        }
        let p = &self.positions[index];
        debug!("Adding {} to cache", p.name());
        let images = p.read_window(0, &self.channel_idx[index], 0..p.slices())?;
        self.buffer.store(index, &images);
        self.decodes.fetch_add(1, Ordering::Relaxed);
        *filled = true;
        Ok(())
    }

    /// 依次缓存全部位点.
    pub fn warm(&self) -> DataResult<()> {
        (0..self.positions.len()).try_for_each(|i| self.ensure_cached(i))
    }

    fn images(&self, index: usize) -> ChannelImages {
        let mut images = ChannelImages::new(self.positions[index].norm_meta().cloned());
        for (c, name) in self.names.iter().enumerate() {
            images.insert(name.as_str(), self.buffer.load(index, c));
        }
        images
    }
}

#[cfg(feature = "rayon")]
impl CachedDataset {
    /// 借助 `rayon`, 并行缓存全部位点.
    pub fn par_warm(&self) -> DataResult<()> {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};

        (0..self.positions.len())
            .into_par_iter()
            .try_for_each(|i| self.ensure_cached(i))
    }
}

impl Dataset for CachedDataset {
    fn len(&self) -> usize {
        self.positions.len()
    }

    fn get_with(&self, index: usize, rng: &mut dyn RngCore) -> DataResult<Sample> {
        self.ensure_cached(index)?;
        let images = self.images(index);
        let sample_index = SampleIndex::new(self.positions[index].name(), 0, 0);
        transform_and_assemble(sample_index, images, &self.channels, &self.transform, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Crops;
    use ndarray::Array5;

    fn position(name: &str, value: u16, zyx: Idx3d) -> Position {
        let (z, y, x) = zyx;
        let data = Array5::<u16>::from_shape_fn((1, 2, z, y, x), |(_, c, z, _, _)| {
            value + (c * 10 + z) as u16
        });
        let names = vec!["Phase3D".to_string(), "Nuclei".to_string()];
        Position::from_array(name, names, data, None).unwrap()
    }

    fn channels() -> ChannelMap {
        ChannelMap::new(vec!["Phase3D".into()], Some(vec!["Nuclei".into()])).unwrap()
    }

    fn dataset() -> CachedDataset {
        CachedDataset::new(
            vec![
                position("A/1/0", 0, (4, 8, 8)),
                position("A/1/1", 100, (4, 8, 8)),
            ],
            channels(),
            Compose::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_cache_hit_does_not_decode_again() {
        let ds = dataset();
        assert_eq!(ds.cache_shape(), [2, 1, 2, 4, 8, 8]);
        assert_eq!(ds.dtype(), DType::U16);
        assert!(!ds.is_cached(0));

        let first = ds.get(0).unwrap();
        assert_eq!(ds.decode_count(), 1);
        assert!(ds.is_cached(0));
        let second = ds.get(0).unwrap();
        assert_eq!(ds.decode_count(), 1);
        assert_eq!(first, second);

        let Crops::Single(source) = &first.source else {
            panic!("no multi-sample transform configured");
        };
        assert_eq!(source.dim(), (1, 4, 8, 8));
        assert_eq!(source[(0, 3, 0, 0)], 3.0);
        assert_eq!(first.index, SampleIndex::new("A/1/0", 0, 0));
        assert_eq!(ds.cached_len(), 1);
    }

    #[test]
    fn test_warm_and_out_of_range() {
        let ds = dataset();
        ds.warm().unwrap();
        assert_eq!(ds.cached_len(), 2);
        assert_eq!(ds.decode_count(), 2);

        let s = ds.get(1).unwrap();
        let Some(Crops::Single(target)) = &s.target else {
            panic!("target channels are configured");
        };
        assert_eq!(target[(0, 2, 7, 7)], 112.0);
        assert_eq!(ds.decode_count(), 2);

        assert!(matches!(
            ds.get(2),
            Err(DataError::Lookup(LookupError::IndexOutOfRange { index: 2, len: 2 }))
        ));
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_par_warm_shared_across_threads() {
        use std::sync::Arc;

        let ds = Arc::new(dataset());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ds = Arc::clone(&ds);
                std::thread::spawn(move || ds.get(1).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ds.decode_count(), 1);
        ds.par_warm().unwrap();
        assert_eq!(ds.decode_count(), 2);
    }

    #[test]
    fn test_shape_mismatch() {
        let r = CachedDataset::new(
            vec![
                position("A/1/0", 0, (4, 8, 8)),
                position("A/1/1", 0, (3, 8, 8)),
            ],
            channels(),
            Compose::default(),
        );
        assert!(matches!(
            r,
            Err(DataError::Config(ConfigError::CachedShapeMismatch { .. }))
        ));
    }

    #[test]
    fn test_signed_store_keeps_dtype() {
        use crate::store::{Plate, PlateWriter};
        use std::num::NonZeroUsize;

        let dir = tempfile::tempdir().unwrap();
        let names = vec!["Phase3D".to_string(), "Nuclei".to_string()];
        let data = Array5::<i16>::from_shape_fn((1, 2, 3, 4, 4), |(_, c, z, _, _)| {
            c as i16 * 100 - z as i16 - 300
        });
        let mut w = PlateWriter::create(dir.path(), true).unwrap();
        w.write_position("A/1/0", &names, data.view(), None).unwrap();
        w.finish().unwrap();

        let positions = Plate::open(dir.path())
            .unwrap()
            .positions(NonZeroUsize::MIN)
            .unwrap();
        assert_eq!(positions[0].dtype(), DType::I16);
        let ds = CachedDataset::new(positions, channels(), Compose::default()).unwrap();
        assert_eq!(ds.dtype(), DType::I16);

        let s = ds.get(0).unwrap();
        let Crops::Single(source) = &s.source else {
            panic!("no multi-sample transform configured");
        };
        assert_eq!(source[(0, 2, 1, 1)], -302.0);
        let Some(Crops::Single(target)) = &s.target else {
            panic!("target missing");
        };
        assert_eq!(target[(0, 0, 3, 3)], -200.0);
    }

    #[test]
    fn test_empty_cache_defaults_to_f32() {
        let ds = CachedDataset::new(Vec::new(), channels(), Compose::default()).unwrap();
        assert_eq!(ds.dtype(), DType::F32);
        assert_eq!(ds.cache_shape(), [0, 1, 2, 0, 0, 0]);
        assert!(ds.is_empty());
    }

    #[test]
    fn test_allocation_overflow() {
        let r = Slots::<f64>::allocate([usize::MAX, 1, 2, 4, 8, 8]);
        assert!(matches!(r, Err(DataError::CacheAllocation { .. })));
    }
}

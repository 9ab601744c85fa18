use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ndarray::{Array3, Ix3, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpzError};

use super::Element;
use crate::consts::{layout, MAX_READER_SLOTS};
use crate::error::{StoreError, StoreResult};

/// 位点像素归档.
///
/// 该结构建模硬盘上单个位点某一分辨率层级的 npz 文件, 每个 `(t, c)`
/// 对应一个 `(Z, Y, X)` 条目, 读取一个条目即解压一个块.
///
/// 系统会将同一文件打开多次, 并为每个打开通道指定一个排他入口点,
/// 多个 worker 可以并行解压不同的块.
pub struct ChunkArchive {
    entries: Vec<Mutex<NpzReader<File>>>,
    turn: AtomicUsize,
}

impl ChunkArchive {
    /// 打开 `p` 处的归档.
    ///
    /// `slots` 指定了底层读取通道的个数, 最大为 [`MAX_READER_SLOTS`].
    pub fn open<P: AsRef<Path>>(slots: NonZeroUsize, p: P) -> StoreResult<Self> {
        let slots = slots.get();
        if slots > MAX_READER_SLOTS {
            return Err(StoreError::TooManySlots(MAX_READER_SLOTS));
        }
        let mut v = Vec::with_capacity(slots);
        for _ in 0..slots {
            let file = OpenOptions::new().read(true).open(p.as_ref())?;
            v.push(Mutex::new(NpzReader::new(file)?));
        }
        Ok(Self {
            entries: v,
            turn: AtomicUsize::new(0),
        })
    }

    /// 解压 `(t, c)` 对应的 `(Z, Y, X)` 块.
    pub fn chunk<T: Element>(&self, t: usize, c: usize) -> Result<Array3<T>, ReadNpzError> {
        let name = layout::chunk_name(t, c);
        self.lock_next()
            .by_name::<OwnedRepr<T>, Ix3>(name.as_str())
    }

    /// 获取归档包含的所有条目名.
    pub fn chunk_names(&self) -> Result<Vec<String>, ReadNpzError> {
        self.lock_next().names()
    }

    /// 读取通道个数.
    #[inline]
    pub fn slot_len(&self) -> usize {
        self.entries.len()
    }

    /// 归档中的条目个数.
    pub fn chunk_len(&self) -> usize {
        self.lock_next().len()
    }

    fn lock_next(&self) -> MutexGuard<'_, NpzReader<File>> {
        let slot = self.turn.fetch_add(1, Ordering::Relaxed) % self.slot_len();
        // 读取器不持有跨调用的可变状态, 中毒的锁可以直接继续使用.
        self.entries[slot]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkArchive;
    use crate::consts::layout;
    use crate::error::StoreError;
    use ndarray::Array3;
    use ndarray_npy::NpzWriter;
    use std::fs::File;
    use std::num::NonZeroUsize;

    fn write_archive(path: &std::path::Path) {
        let mut npz = NpzWriter::new_compressed(File::create(path).unwrap());
        for t in 0..2 {
            for c in 0..3 {
                let arr = Array3::<u16>::from_elem((4, 5, 6), (t * 10 + c) as u16);
                npz.add_array(layout::chunk_name(t, c), &arr).unwrap();
            }
        }
        npz.finish().unwrap();
    }

    #[test]
    fn test_read_chunks_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(layout::LEVEL_0);
        write_archive(&path);

        let archive = ChunkArchive::open(NonZeroUsize::new(3).unwrap(), &path).unwrap();
        assert_eq!(archive.slot_len(), 3);
        assert_eq!(archive.chunk_len(), 6);
        assert_eq!(archive.chunk_names().unwrap().len(), 6);

        for _ in 0..4 {
            let chunk = archive.chunk::<u16>(1, 2).unwrap();
            assert_eq!(chunk.dim(), (4, 5, 6));
            assert!(chunk.iter().all(|&v| v == 12));
        }
        assert!(archive.chunk::<u16>(2, 0).is_err());
    }

    #[test]
    fn test_too_many_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(layout::LEVEL_0);
        write_archive(&path);

        let r = ChunkArchive::open(NonZeroUsize::new(65).unwrap(), &path);
        assert!(matches!(r, Err(StoreError::TooManySlots(64))));
    }
}

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use itertools::iproduct;
use ndarray::{s, ArrayView5};
use ndarray_npy::NpzWriter;

use super::attrs::{read_json, write_json, NormMeta, PlateAttrs, PositionAttrs};
use super::{with_element, Element, Position};
use crate::consts::layout;
use crate::error::StoreResult;

/// plate 写入器.
///
/// 若 `root` 处已有 plate, 写入器以追加方式打开它, 已存在的位点名会被保留.
/// 所有位点写完后需调用 [`PlateWriter::finish`] 落盘 `plate.json`.
#[derive(Debug)]
pub struct PlateWriter {
    root: PathBuf,
    positions: Vec<String>,
    known: HashSet<String>,
    compressed: bool,
}

impl PlateWriter {
    /// 在 `root` 处创建 (或打开) plate. `compressed` 决定新写入的归档是否压缩.
    pub fn create<P: AsRef<Path>>(root: P, compressed: bool) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let plate_path = root.join(layout::PLATE_ATTRS);
        let positions = if plate_path.is_file() {
            read_json::<PlateAttrs, _>(&plate_path)?.positions
        } else {
            Vec::new()
        };
        Ok(Self {
            root,
            known: positions.iter().cloned().collect(),
            positions,
            compressed,
        })
    }

    /// plate 根目录.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 是否已经包含名为 `name` 的位点.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    /// 已登记的位点个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// 是否尚未登记任何位点.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn prepare_position(
        &mut self,
        name: &str,
        attrs: &PositionAttrs,
    ) -> StoreResult<NpzWriter<File>> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)?;
        let attrs_path = dir.join(layout::POSITION_ATTRS);
        attrs.validate(&attrs_path)?;
        write_json(&attrs_path, attrs)?;

        let file = File::create(dir.join(layout::LEVEL_0))?;
        if self.known.insert(name.to_string()) {
            self.positions.push(name.to_string());
        }
        Ok(if self.compressed {
            NpzWriter::new_compressed(file)
        } else {
            NpzWriter::new(file)
        })
    }

    /// 写入一个位点. `data` 形状为 `(T, C, Z, Y, X)`. 同名位点会被覆盖.
    pub fn write_position<T: Element>(
        &mut self,
        name: &str,
        channel_names: &[String],
        data: ArrayView5<T>,
        normalization: Option<&NormMeta>,
    ) -> StoreResult<()> {
        let (t, c, z, y, x) = data.dim();
        let attrs = PositionAttrs {
            channel_names: channel_names.to_vec(),
            shape: [t, c, z, y, x],
            dtype: T::DTYPE.name().to_string(),
            normalization: normalization.cloned(),
        };
        let mut npz = self.prepare_position(name, &attrs)?;
        for (ti, ci) in iproduct!(0..t, 0..c) {
            let chunk = data.slice(s![ti, ci, .., .., ..]);
            npz.add_array(layout::chunk_name(ti, ci), &chunk)?;
        }
        npz.finish()?;
        Ok(())
    }

    /// 逐块复制一个已打开的位点, 保留其元素类型与归一化元信息.
    pub fn copy_position(&mut self, position: &Position) -> StoreResult<()> {
        let mut attrs = position.attrs().clone();
        let dtype = position.dtype();
        attrs.dtype = dtype.name().to_string();

        let mut npz = self.prepare_position(position.name(), &attrs)?;
        for (t, c) in iproduct!(0..position.frames(), 0..position.channels()) {
            with_element!(dtype, E => {
                let chunk = position.read_chunk::<E>(t, c)?;
                npz.add_array(layout::chunk_name(t, c), &chunk)?;
            })
        }
        npz.finish()?;
        Ok(())
    }

    /// 写出 `plate.json`, 返回 plate 根目录.
    pub fn finish(self) -> StoreResult<PathBuf> {
        let attrs = PlateAttrs {
            positions: self.positions,
        };
        write_json(self.root.join(layout::PLATE_ATTRS), &attrs)?;
        Ok(self.root)
    }
}

//! 多位点显微成像存储.
//!
//! 一个 plate 由若干位点 (视野) 组成, 每个位点是一个 `(T, C, Z, Y, X)` 数组.
//! 磁盘布局见 [`crate::consts::layout`].

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

mod archive;
mod attrs;
mod element;
mod position;
mod writer;

pub use archive::ChunkArchive;
pub use attrs::{ChannelNorm, NormMeta, PlateAttrs, PositionAttrs, Statistics, StatsLevel};
pub use element::{DType, Element};
pub(crate) use element::with_element;
pub use position::Position;
pub use writer::PlateWriter;

use crate::consts::layout;
use crate::error::{StoreError, StoreResult};
use attrs::read_json;

/// 已打开的 plate. 仅持有元信息, 位点按需打开.
#[derive(Debug, Clone)]
pub struct Plate {
    root: PathBuf,
    attrs: PlateAttrs,
}

impl Plate {
    /// 打开 `root` 处的 plate.
    pub fn open<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let attrs = read_json(root.join(layout::PLATE_ATTRS))?;
        Ok(Self { root, attrs })
    }

    /// 根目录.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// plate 名, 即根目录的最后一级.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map_or_else(|| "plate".to_string(), |n| n.to_string_lossy().into_owned())
    }

    /// 所有位点名, 保持 `plate.json` 中的顺序.
    #[inline]
    pub fn position_names(&self) -> &[String] {
        &self.attrs.positions
    }

    /// 打开名为 `name` 的位点.
    pub fn open_position(&self, name: &str, slots: NonZeroUsize) -> StoreResult<Position> {
        Position::open(self.root.join(name), name, slots)
    }

    /// 依次打开所有位点.
    pub fn positions(&self, slots: NonZeroUsize) -> StoreResult<Vec<Position>> {
        self.attrs
            .positions
            .iter()
            .map(|name| self.open_position(name, slots))
            .collect()
    }
}

/// `path` 是否是 plate 根目录.
#[inline]
pub fn is_plate<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().join(layout::PLATE_ATTRS).is_file()
}

/// `path` 是否是单个位点目录.
#[inline]
pub fn is_position<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().join(layout::POSITION_ATTRS).is_file()
}

/// 打开 `path` 处的数据. `path` 既可以是 plate, 也可以是 plate 内的单个位点.
///
/// 对单个位点, 会向上查找其所在的 plate, 并只返回该位点.
pub fn open_positions<P: AsRef<Path>>(
    path: P,
    slots: NonZeroUsize,
) -> StoreResult<(Plate, Vec<Position>)> {
    let path = path.as_ref();
    if is_plate(path) {
        let plate = Plate::open(path)?;
        let positions = plate.positions(slots)?;
        return Ok((plate, positions));
    }

    let root = path
        .ancestors()
        .skip(1)
        .find(|p| is_plate(p))
        .ok_or_else(|| StoreError::ParentPlateNotFound(path.to_path_buf()))?;
    let plate = Plate::open(root)?;
    let name = path
        .strip_prefix(root)
        .map_err(|_| StoreError::ParentPlateNotFound(path.to_path_buf()))?
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let position = plate.open_position(&name, slots)?;
    Ok((plate, vec![position]))
}

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}

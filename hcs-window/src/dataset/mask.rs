use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::Array2;
use rand::RngCore;

use super::{Dataset, Sample, SlidingWindowDataset};
use crate::consts::MASK_SUFFIX;
use crate::error::{DataResult, StoreError, StoreResult};

/// 真值掩码的键: `(位点编号, 时间帧, z 切片)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MaskIndex {
    /// 位点编号, 即位点名 (`行/列/视野`) 的最后一级.
    pub position: u32,

    /// 时间帧. 文件名不含时间信息, 恒为 0.
    pub time: usize,

    /// z 切片.
    pub z: usize,
}

impl MaskIndex {
    /// 从形如 `"<channel>_p003_z12_cp_masks.png"` 的文件名解析.
    ///
    /// 位点编号取 `_p` 之后的前 3 位数字, 更长的数字串只看前 3 位.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let position = digits_after(name, "_p", 3)?.parse().ok()?;
        let z = digits_after(name, "_z", 1)?.parse().ok()?;
        Some(Self { position, time: 0, z })
    }
}

/// 返回第一个紧跟在 `tag` 之后, 至少 `min` 位的数字串.
/// `min > 1` 时只截取前 `min` 位, 否则取完整的数字串.
fn digits_after<'a>(s: &'a str, tag: &str, min: usize) -> Option<&'a str> {
    s.match_indices(tag).find_map(|(i, _)| {
        let rest = &s[i + tag.len()..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        match end {
            n if n < min.max(1) => None,
            _ if min > 1 => Some(&rest[..min]),
            n => Some(&rest[..n]),
        }
    })
}

/// 从位点名 (`"A/1/0"`) 取位点编号: 最后一级路径, 即视野编号.
fn position_number(name: &str) -> Option<u32> {
    name.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// 读取 16 位灰度掩码, 形状 `(Y, X)`.
fn read_mask(path: &Path) -> DataResult<Array2<u16>> {
    let img = image::open(path).map_err(StoreError::from)?.into_luma16();
    let (w, h) = img.dimensions();
    Ok(Array2::from_shape_vec((h as usize, w as usize), img.into_raw())?)
}

/// 测试阶段的数据集: 在滑动窗口样本上附加真值分割掩码.
///
/// 窗口 `(位点, t, z)` 对应的掩码键为 `(位点编号, t, z + z_window / 2)`,
/// 即窗口中心切片. 找不到掩码的样本不带 `labels`.
/// 由于掩码并非每个样本都有, 该数据集只能以批大小 1 加载.
#[derive(Debug)]
pub struct MaskTestDataset {
    inner: SlidingWindowDataset,
    masks: HashMap<MaskIndex, PathBuf>,
}

impl MaskTestDataset {
    /// 包装 `inner`. `mask_dir` 下所有 `*cp_masks.png` 文件都会被登记.
    pub fn new<P: AsRef<Path>>(inner: SlidingWindowDataset, mask_dir: P) -> StoreResult<Self> {
        let mut masks = HashMap::new();
        for entry in fs::read_dir(mask_dir.as_ref())? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(MASK_SUFFIX) {
                continue;
            }
            match MaskIndex::from_file_name(name) {
                Some(key) => {
                    masks.insert(key, path);
                }
                None => debug!("Ignoring mask with unrecognized name {name}"),
            }
        }
        info!(
            "Found {} ground truth masks in {}",
            masks.len(),
            mask_dir.as_ref().display()
        );
        Ok(Self { inner, masks })
    }

    /// 登记的掩码个数.
    #[inline]
    pub fn num_masks(&self) -> usize {
        self.masks.len()
    }

    /// 内部的滑动窗口数据集.
    #[inline]
    pub fn inner(&self) -> &SlidingWindowDataset {
        &self.inner
    }
}

impl Dataset for MaskTestDataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get_with(&self, index: usize, rng: &mut dyn RngCore) -> DataResult<Sample> {
        let mut sample = self.inner.get_with(index, rng)?;
        let key = position_number(&sample.index.position).map(|position| MaskIndex {
            position,
            time: sample.index.time,
            z: sample.index.z + self.inner.z_window() / 2,
        });
        if let Some(path) = key.and_then(|k| self.masks.get(&k)) {
            sample.labels = Some(read_mask(path)?);
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ChannelMap;
    use crate::store::Position;
    use crate::transforms::Compose;
    use image::{ImageBuffer, Luma};
    use ndarray::Array5;

    #[test]
    fn test_parse_mask_names() {
        assert_eq!(
            MaskIndex::from_file_name("Nuclei_p012_z7_cp_masks.png"),
            Some(MaskIndex {
                position: 12,
                time: 0,
                z: 7
            })
        );
        assert_eq!(MaskIndex::from_file_name("Nuclei_p12_z7_cp_masks.png"), None);
        assert_eq!(MaskIndex::from_file_name("Nuclei_p012_cp_masks.png"), None);
        assert_eq!(position_number("A/3/0"), Some(0));
        assert_eq!(position_number("B/3/5/"), Some(5));
        assert_eq!(position_number("B/3/fov"), None);
    }

    #[test]
    fn test_parse_long_position_run() {
        // 只取 `_p` 后的前 3 位.
        assert_eq!(
            MaskIndex::from_file_name("Nuclei_p0051_z3_cp_masks.png"),
            Some(MaskIndex {
                position: 5,
                time: 0,
                z: 3
            })
        );
        // 第一个 `_p` 后不足 3 位时, 继续找下一个.
        assert_eq!(
            MaskIndex::from_file_name("exp_p1_Nuclei_p007_z12_cp_masks.png"),
            Some(MaskIndex {
                position: 7,
                time: 0,
                z: 12
            })
        );
    }

    #[test]
    fn test_attach_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mask =
            ImageBuffer::<Luma<u16>, Vec<u16>>::from_fn(6, 4, |x, y| Luma([(y * 10 + x) as u16]));
        mask.save(dir.path().join("Nuclei_p005_z2_cp_masks.png")).unwrap();
        // 列号 3 不是位点编号, 这个掩码不应被附加.
        mask.save(dir.path().join("Nuclei_p003_z1_cp_masks.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a mask").unwrap();

        let data = Array5::<f32>::zeros((1, 1, 4, 4, 6));
        let p = Position::from_array("B/3/5", vec!["Phase3D".into()], data, None).unwrap();
        let inner = SlidingWindowDataset::new(
            vec![p],
            ChannelMap::source_only(vec!["Phase3D".into()]).unwrap(),
            3,
            Compose::default(),
        )
        .unwrap();
        let ds = MaskTestDataset::new(inner, dir.path()).unwrap();
        assert_eq!(ds.num_masks(), 2);
        assert_eq!(ds.len(), 2);

        // 窗口 z = 1 的中心切片为 2.
        assert!(ds.get(0).unwrap().labels.is_none());
        let labels = ds.get(1).unwrap().labels.unwrap();
        assert_eq!(labels.dim(), (4, 6));
        assert_eq!(labels[(3, 5)], 35);
    }
}

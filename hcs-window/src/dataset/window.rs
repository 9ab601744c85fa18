use crate::error::ConfigError;
use crate::store::Position;

/// 一个滑动窗口: 位点序号、时间帧、z 起点.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Window {
    /// 位点在数据集中的序号.
    pub position: usize,

    /// 时间帧.
    pub time: usize,

    /// z 窗口起点. 窗口覆盖 `[z_start, z_start + z_window)`.
    pub z_start: usize,
}

/// 扁平索引到 [`Window`] 的映射.
///
/// 位点 `i` 贡献 `frames_i * (slices_i - z_window + 1)` 个窗口, 其内部先 z 后 t:
/// 余数 `r` 对应 `t = r / zs`, `z = r % zs`, 其中 `zs = slices_i - z_window + 1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowIndex {
    z_window: usize,
    /// 每个位点的 z 起点个数.
    z_steps: Vec<usize>,
    /// 严格递增的累计窗口数, `cumsum[i]` 是位点 `0..=i` 的窗口总数.
    cumsum: Vec<usize>,
}

impl WindowIndex {
    /// 由 `(位点名, 时间帧数, z 切片数)` 序列构建.
    pub fn new<'a, I>(shapes: I, z_window: usize) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, usize, usize)>,
    {
        if z_window == 0 {
            return Err(ConfigError::ZeroZWindow);
        }
        let mut z_steps = Vec::new();
        let mut cumsum = Vec::new();
        let mut total = 0;
        for (name, frames, slices) in shapes {
            if frames == 0 {
                return Err(ConfigError::EmptyPosition(name.to_string()));
            }
            if slices < z_window {
                return Err(ConfigError::ZWindowTooLarge {
                    position: name.to_string(),
                    slices,
                    z_window,
                });
            }
            let zs = slices - z_window + 1;
            total += frames * zs;
            z_steps.push(zs);
            cumsum.push(total);
        }
        Ok(Self {
            z_window,
            z_steps,
            cumsum,
        })
    }

    /// 由已打开的位点构建.
    pub fn from_positions(positions: &[Position], z_window: usize) -> Result<Self, ConfigError> {
        Self::new(
            positions
                .iter()
                .map(|p| (p.name(), p.frames(), p.slices())),
            z_window,
        )
    }

    /// 窗口总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.cumsum.last().copied().unwrap_or(0)
    }

    /// 是否不含任何窗口.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// z 窗口大小.
    #[inline]
    pub fn z_window(&self) -> usize {
        self.z_window
    }

    /// 位点个数.
    #[inline]
    pub fn num_positions(&self) -> usize {
        self.cumsum.len()
    }

    fn offset(&self, position: usize) -> usize {
        match position {
            0 => 0,
            p => self.cumsum[p - 1],
        }
    }

    /// 位点 `position` 贡献的窗口个数.
    pub fn window_count(&self, position: usize) -> Option<usize> {
        let end = *self.cumsum.get(position)?;
        Some(end - self.offset(position))
    }

    /// 查找扁平索引 `flat` 对应的窗口. 越界时返回 `None`.
    pub fn locate(&self, flat: usize) -> Option<Window> {
        let position = self.cumsum.partition_point(|&c| c <= flat);
        if position == self.cumsum.len() {
            return None;
        }
        let r = flat - self.offset(position);
        let zs = self.z_steps[position];
        Some(Window {
            position,
            time: r / zs,
            z_start: r % zs,
        })
    }

    /// [`WindowIndex::locate`] 的逆映射. 窗口不合法时返回 `None`.
    pub fn flat_index(&self, w: &Window) -> Option<usize> {
        let zs = *self.z_steps.get(w.position)?;
        let count = self.window_count(w.position)?;
        if w.z_start >= zs || w.time >= count / zs {
            return None;
        }
        Some(self.offset(w.position) + w.time * zs + w.z_start)
    }
}

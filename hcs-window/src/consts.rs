//! 通用常量.

/// 样本 (及其通道字典) 中的保留键.
pub mod keys {
    /// 模型输入通道的角色名.
    pub const SOURCE: &str = "source";

    /// 模型目标通道的角色名.
    pub const TARGET: &str = "target";

    /// 样本索引 `(位点名, t, z)`.
    pub const INDEX: &str = "index";

    /// 归一化元信息.
    pub const NORM_META: &str = "norm_meta";

    /// 重要性采样用的权重图. 仅在变换期间存在.
    pub const WEIGHT: &str = "weight";

    /// 测试阶段的真值分割掩码.
    pub const LABELS: &str = "labels";

    /// 通道映射中允许出现的全部键.
    pub const CHANNEL_ROLES: [&str; 2] = [SOURCE, TARGET];
}

/// 磁盘存储布局.
///
/// ```text
/// <plate>/
///   plate.json
///   A/1/0/
///     attrs.json
///     0.npz        (每个 (t, c) 一个 "t{t}_c{c}.npy" 条目, 形状 (Z, Y, X))
/// ```
pub mod layout {
    /// plate 元信息文件名.
    pub const PLATE_ATTRS: &str = "plate.json";

    /// 位点元信息文件名.
    pub const POSITION_ATTRS: &str = "attrs.json";

    /// 最高分辨率 (level 0) 像素归档文件名.
    pub const LEVEL_0: &str = "0.npz";

    /// 获取 `(t, c)` 对应的 npz 条目名.
    #[inline]
    pub fn chunk_name(t: usize, c: usize) -> String {
        format!("t{t}_c{c}.npy")
    }
}

/// 数据模块默认配置.
pub mod defaults {
    /// 训练集在全部位点中的占比.
    pub const SPLIT_RATIO: f64 = 0.8;

    /// 批大小.
    pub const BATCH_SIZE: usize = 16;

    /// 数据加载 worker 个数.
    pub const NUM_WORKERS: usize = 8;

    /// (Y, X) 方向的训练 patch 大小.
    pub const YX_PATCH_SIZE: (usize, usize) = (256, 256);

    /// 单个批次的最长等待时间 (秒).
    pub const TIMEOUT_SECS: u64 = 600;

    /// 每个 worker 预取的批次数.
    pub const PREFETCH_FACTOR: usize = 4;

    /// z 窗口大小. 2D 模型为 1.
    pub const Z_WINDOW_SIZE: usize = 1;
}

/// 单个位点最多同时打开的读取通道个数.
pub const MAX_READER_SLOTS: usize = 64;

/// 未设置 `$SLURM_JOB_ID` 时, 磁盘缓存所用的临时子目录名.
pub const DISK_CACHE_DIR: &str = "hcs_cache";

/// 真值掩码 png 文件名后缀.
pub const MASK_SUFFIX: &str = "cp_masks.png";

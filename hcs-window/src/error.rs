//! 运行时错误.
//!
//! 所有错误都会同步地传播给调用方 (一般是训练循环), 本 crate 不做任何重试.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use ndarray::ShapeError;
use ndarray_npy::{ReadNpzError, WriteNpzError};

/// 配置错误. 在构造数据集 / 数据模块时立即返回.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// 不支持的阶段名.
    UnsupportedStage(String),

    /// 通道映射缺少 "source".
    MissingSourceChannels,

    /// 通道映射出现了 "source" / "target" 以外的键.
    UnknownChannelRole(String),

    /// 某个角色的通道列表为空.
    EmptyChannelList(&'static str),

    /// z 窗口大小为 0.
    ZeroZWindow,

    /// z 窗口大于某个位点的 z 切片数.
    ZWindowTooLarge {
        /// 位点名.
        position: String,
        /// 该位点的切片数.
        slices: usize,
        /// 要求的窗口大小.
        z_window: usize,
    },

    /// 位点不含任何时间帧.
    EmptyPosition(String),

    /// 批大小不能被每个 stack 的采样数整除.
    BatchSizeNotDivisible {
        /// 批大小.
        batch_size: usize,
        /// 多重采样变换每个 stack 产出的 patch 数.
        num_samples: usize,
    },

    /// 训练集划分比例不在 (0, 1) 内.
    InvalidSplitRatio(f64),

    /// 划分所用的索引序列不是 `0..len` 的排列.
    InvalidPermutation {
        /// 待划分的元素个数.
        len: usize,
        /// 原因.
        reason: String,
    },

    /// 批大小为 0.
    ZeroBatchSize,

    /// 对应阶段尚未 `setup`.
    StageNotSetUp(&'static str),

    /// 缓存数据集中的位点 (Z, Y, X) 形状与第一个位点不一致.
    CachedShapeMismatch {
        /// 位点名.
        position: String,
        /// 第一个位点的形状.
        expected: (usize, usize, usize),
        /// 该位点的形状.
        found: (usize, usize, usize),
    },

    /// 非法的变换参数.
    InvalidTransform(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedStage(s) => write!(f, "stage `{s}` is not supported"),
            Self::MissingSourceChannels => write!(f, "channel map has no `source` entry"),
            Self::UnknownChannelRole(r) => {
                write!(f, "unknown channel role `{r}`, expected `source` or `target`")
            }
            Self::EmptyChannelList(r) => write!(f, "channel list for `{r}` is empty"),
            Self::ZeroZWindow => write!(f, "z window size must be at least 1"),
            Self::ZWindowTooLarge {
                position,
                slices,
                z_window,
            } => write!(
                f,
                "z window {z_window} is larger than the {slices} slices of position `{position}`"
            ),
            Self::EmptyPosition(p) => write!(f, "position `{p}` has no time points"),
            Self::BatchSizeNotDivisible {
                batch_size,
                num_samples,
            } => write!(
                f,
                "batch size must be divisible by `num_samples` per stack, \
                 got batch size {batch_size} and {num_samples} samples"
            ),
            Self::InvalidSplitRatio(r) => write!(f, "split ratio {r} is not in (0, 1)"),
            Self::InvalidPermutation { len, reason } => {
                write!(f, "not a permutation of 0..{len}: {reason}")
            }
            Self::ZeroBatchSize => write!(f, "batch size must be at least 1"),
            Self::StageNotSetUp(s) => write!(f, "dataset for stage `{s}` is not set up"),
            Self::CachedShapeMismatch {
                position,
                expected,
                found,
            } => write!(
                f,
                "position `{position}` has ZYX shape {found:?}, cached shape is {expected:?}"
            ),
            Self::InvalidTransform(m) => write!(f, "invalid transform: {m}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// 查找错误.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// 位点不包含所需通道.
    MissingChannel {
        /// 位点名.
        position: String,
        /// 通道名.
        channel: String,
    },

    /// 未登记的位点名.
    UnknownPosition(String),

    /// 扁平索引越界.
    IndexOutOfRange {
        /// 请求的索引.
        index: usize,
        /// 数据集长度.
        len: usize,
    },
}

impl Display for LookupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingChannel { position, channel } => {
                write!(f, "channel `{channel}` not found in position `{position}`")
            }
            Self::UnknownPosition(p) => write!(f, "position `{p}` is not registered"),
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for dataset of length {len}")
            }
        }
    }
}

impl std::error::Error for LookupError {}

/// 存储读写错误.
#[derive(Debug)]
pub enum StoreError {
    /// 底层 I/O 错误.
    Io(io::Error),

    /// 读取 npz 归档错误.
    ReadNpz(ReadNpzError),

    /// 写入 npz 归档错误.
    WriteNpz(WriteNpzError),

    /// 元信息 json 解析或序列化错误.
    Json(serde_json::Error),

    /// 元信息内容不自洽.
    InvalidAttrs {
        /// 元信息文件路径.
        path: PathBuf,
        /// 原因.
        reason: String,
    },

    /// 无法识别的像素类型.
    UnsupportedDtype {
        /// 元信息文件路径.
        path: PathBuf,
        /// 元信息中的 dtype 名.
        dtype: String,
    },

    /// `(t, c)` 超出位点数组范围.
    ChunkOutOfBounds {
        /// 位点名.
        position: String,
        /// 时间索引.
        t: usize,
        /// 通道索引.
        c: usize,
    },

    /// z 范围超出位点的切片数.
    ZRangeOutOfBounds {
        /// 位点名.
        position: String,
        /// 请求的 z 上界 (不含).
        end: usize,
        /// 该位点的切片数.
        slices: usize,
    },

    /// 读取通道太多. 参数为支持的最大值.
    TooManySlots(usize),

    /// 单个位点路径之上找不到 plate.
    ParentPlateNotFound(PathBuf),

    /// 掩码图像解码错误.
    Image(image::ImageError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::ReadNpz(e) => write!(f, "failed to read npz archive: {e}"),
            Self::WriteNpz(e) => write!(f, "failed to write npz archive: {e}"),
            Self::Json(e) => write!(f, "invalid metadata: {e}"),
            Self::InvalidAttrs { path, reason } => {
                write!(f, "invalid attributes in {}: {reason}", path.display())
            }
            Self::UnsupportedDtype { path, dtype } => {
                write!(f, "unsupported dtype `{dtype}` in {}", path.display())
            }
            Self::ChunkOutOfBounds { position, t, c } => {
                write!(f, "chunk (t={t}, c={c}) out of bounds in position `{position}`")
            }
            Self::ZRangeOutOfBounds {
                position,
                end,
                slices,
            } => write!(
                f,
                "z range ending at {end} exceeds the {slices} slices of position `{position}`"
            ),
            Self::TooManySlots(max) => write!(f, "at most {max} reader slots are supported"),
            Self::ParentPlateNotFound(p) => {
                write!(f, "parent plate not found for position {}", p.display())
            }
            Self::Image(e) => write!(f, "failed to decode mask: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::ReadNpz(e) => Some(e),
            Self::WriteNpz(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Image(e) => Some(e),
            _ => None,
        }
    }
}

macro_rules! impl_from_for_store {
    ($($src: ty => $variant: ident),+) => {
        $(
            impl From<$src> for StoreError {
                #[inline]
                fn from(e: $src) -> Self {
                    Self::$variant(e)
                }
            }
        )+
    };
}

impl_from_for_store!(
    io::Error => Io,
    ReadNpzError => ReadNpz,
    WriteNpzError => WriteNpz,
    serde_json::Error => Json,
    image::ImageError => Image
);

/// 变换运行时错误.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformError {
    /// 通道字典中没有该键.
    MissingKey(String),

    /// 样本没有归一化元信息.
    MissingNormMeta,

    /// 归一化元信息中没有该通道在该层级上的统计量.
    MissingStatistics {
        /// 通道名.
        channel: String,
        /// 统计层级.
        level: &'static str,
    },

    /// 同一样本中各通道的空间形状不一致.
    InconsistentShape(String),
}

impl Display for TransformError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey(k) => write!(f, "key `{k}` not present in sample"),
            Self::MissingNormMeta => write!(f, "sample carries no normalization metadata"),
            Self::MissingStatistics { channel, level } => {
                write!(f, "no `{level}` statistics for channel `{channel}`")
            }
            Self::InconsistentShape(k) => {
                write!(f, "spatial shape of `{k}` differs from the other channels")
            }
        }
    }
}

impl std::error::Error for TransformError {}

/// 批处理拼接错误.
#[derive(Debug, Clone)]
pub enum CollateError {
    /// 空批次.
    EmptyBatch,

    /// 第 `sample` 个样本的可选字段 `key` 与第一个样本不一致.
    KeyMismatch {
        /// 字段名.
        key: &'static str,
        /// 样本在批次中的序号.
        sample: usize,
    },

    /// 同一样本的 source 与 target 的 crop 个数不同.
    CropCountMismatch {
        /// 样本在批次中的序号.
        sample: usize,
        /// source 的 crop 个数.
        source: usize,
        /// target 的 crop 个数.
        target: usize,
    },

    /// 各样本形状不同, 无法堆叠.
    Shape(ShapeError),
}

impl Display for CollateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBatch => write!(f, "cannot collate an empty batch"),
            Self::KeyMismatch { key, sample } => {
                write!(f, "sample {sample} disagrees with sample 0 on key `{key}`")
            }
            Self::CropCountMismatch {
                sample,
                source,
                target,
            } => write!(
                f,
                "sample {sample} has {source} source crops but {target} target crops"
            ),
            Self::Shape(e) => write!(f, "cannot stack samples: {e}"),
        }
    }
}

impl std::error::Error for CollateError {}

impl From<ShapeError> for CollateError {
    #[inline]
    fn from(e: ShapeError) -> Self {
        Self::Shape(e)
    }
}

/// 数据层的顶层错误.
#[derive(Debug)]
pub enum DataError {
    /// 配置错误.
    Config(ConfigError),

    /// 查找错误.
    Lookup(LookupError),

    /// 存储错误.
    Store(StoreError),

    /// 变换错误.
    Transform(TransformError),

    /// 通道堆叠时形状不一致.
    Shape(ShapeError),

    /// 批处理拼接错误.
    Collate(CollateError),

    /// 内存缓存预分配失败. 参数为请求的字节数.
    CacheAllocation {
        /// 请求的字节数.
        bytes: usize,
    },

    /// 无法创建 worker 线程池.
    WorkerPool(String),
}

impl Display for DataError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Lookup(e) => write!(f, "lookup error: {e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Transform(e) => write!(f, "transform error: {e}"),
            Self::Shape(e) => write!(f, "shape error: {e}"),
            Self::Collate(e) => write!(f, "collate error: {e}"),
            Self::CacheAllocation { bytes } => {
                write!(f, "failed to allocate {bytes} bytes for the RAM cache")
            }
            Self::WorkerPool(m) => write!(f, "failed to build worker pool: {m}"),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Lookup(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Transform(e) => Some(e),
            Self::Shape(e) => Some(e),
            Self::Collate(e) => Some(e),
            _ => None,
        }
    }
}

macro_rules! impl_from_for_data {
    ($($src: ty => $variant: ident),+) => {
        $(
            impl From<$src> for DataError {
                #[inline]
                fn from(e: $src) -> Self {
                    Self::$variant(e)
                }
            }
        )+
    };
}

impl_from_for_data!(
    ConfigError => Config,
    LookupError => Lookup,
    StoreError => Store,
    TransformError => Transform,
    ShapeError => Shape,
    CollateError => Collate
);

/// 数据加载器错误.
#[derive(Debug)]
pub enum LoaderError {
    /// 构建批次时的数据错误.
    Data(DataError),

    /// 第 `batch` 个批次在 `timeout` 内没有就绪. 本轮迭代随即终止.
    Timeout {
        /// 批次序号.
        batch: usize,
        /// 超时设置.
        timeout: Duration,
    },

    /// worker 在交付第 `batch` 个批次前退出.
    WorkerDisconnected {
        /// 批次序号.
        batch: usize,
    },

    /// 构建第 `batch` 个批次时 panic.
    WorkerPanicked {
        /// 批次序号.
        batch: usize,
        /// panic 信息.
        message: String,
    },
}

impl Display for LoaderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(e) => write!(f, "{e}"),
            Self::Timeout { batch, timeout } => {
                write!(f, "batch {batch} not ready after {timeout:?}")
            }
            Self::WorkerDisconnected { batch } => {
                write!(f, "worker exited before delivering batch {batch}")
            }
            Self::WorkerPanicked { batch, message } => {
                write!(f, "worker panicked on batch {batch}: {message}")
            }
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Data(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DataError> for LoaderError {
    #[inline]
    fn from(e: DataError) -> Self {
        Self::Data(e)
    }
}

/// 存储层运行时结果.
pub type StoreResult<T> = Result<T, StoreError>;

/// 数据层运行时结果.
pub type DataResult<T> = Result<T, DataError>;

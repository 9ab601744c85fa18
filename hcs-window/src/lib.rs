#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 为高内涵筛选 (HCS) 多位点显微成像数据提供滑动窗口数据集、
//! 内存缓存与批处理加载, 服务于 "虚拟染色" 等图像到图像的训练流程.
//!
//! 该 crate 只提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 存储格式是自定义的 plate 目录布局 (见 [`consts::layout`]), 每个 `(t, c)`
//!   对应 npz 归档中的一个 `(Z, Y, X)` 数组. 其它格式需要先转换.
//! 2. 所有错误都以 `Result` 同步返回, 库代码不会因用户输入而 panic.
//! 3. 本库不会安装 logger, 由二进制程序或测试自行选择.
//!
//! # 开发计划
//!
//! ### 位点存储读写 ✅
//!
//! 按 `(t, c)` 分块读取, 每个位点持有若干独立加锁的读取通道.
//! 支持写出 (磁盘缓存、预测结果).
//!
//! 实现位于 `hcs-window/src/store`.
//!
//! ### 窗口索引 ✅
//!
//! 扁平索引 <-> `(位点, t, z)`, 基于逐位点窗口数的前缀和与二分查找.
//!
//! 实现位于 `hcs-window/src/dataset/window.rs`.
//!
//! ### 滑动窗口数据集与内存缓存数据集 ✅
//!
//! 1. 通道选择, 归一化元信息传递, 权重图别名. ✅
//! 2. 单个预分配缓冲区, 每个位点只解码一次, 可在 worker 间共享. ✅
//! 3. 测试阶段附带真值掩码. ✅
//!
//! 实现位于 `hcs-window/src/dataset`.
//!
//! ### 字典变换 ✅
//!
//! 归一化 (可逆)、中心裁剪、加权随机裁剪 (多重采样)、强度缩放、对比度调整.
//!
//! 实现位于 `hcs-window/src/transforms`.
//!
//! ### 批处理与加载器 ✅
//!
//! 多重采样结果展开到批维度; worker 线程池、预取与超时.
//!
//! ### 数据模块 ✅
//!
//! 按阶段构建数据集, 位点级随机划分, 磁盘缓存.
//!
//! 实现位于 `hcs-window/src/module`.
//!
//! ### 更多数据增强 ✅
//!
//! 1. 随机仿射变换, 训练集 z 窗口随 Z 轴缩放上限扩展. ✅
//! 2. 高斯噪声与高斯平滑. ✅
//!
//! 实现位于 `hcs-window/src/transforms`.
//!
//! ### 对比学习数据集 ⌛️
//!
//! 按细胞轨迹时间表采样 anchor / positive / negative 三元组.

/// 三维索引 `(Z, Y, X)`.
pub type Idx3d = (usize, usize, usize);

/// 五维形状 `(T, C, Z, Y, X)`.
pub type Shape5d = (usize, usize, usize, usize, usize);

pub mod consts;
pub mod dataset;
pub mod error;
pub mod module;
pub mod predict;
pub mod prelude;
pub mod store;
pub mod transforms;

pub use dataset::{
    collate, Batch, CachedDataset, ChannelMap, DataLoader, Dataset, LoaderConfig, Sample,
    SlidingWindowDataset,
};
pub use module::{DataModuleConfig, HcsDataModule, Stage};
pub use predict::PredictionWriter;
pub use store::{home_dataset_dir_with, Plate, Position};

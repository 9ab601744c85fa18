//! 预测结果写出.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::{s, Array5, ArrayView5, Axis, ErrorKind, ShapeError};

use crate::dataset::{Batch, SlidingWindowDataset};
use crate::error::{DataResult, LookupError, StoreResult};
use crate::store::PlateWriter;
use crate::Idx3d;

/// 预测通道的后缀.
pub const PREDICTION_SUFFIX: &str = "_prediction";

/// 逐位点累积模型输出, 最后写为一个新的 plate.
///
/// 输出位点的形状为 `(T, C_out, Z, Y, X)`, 与输入位点的 T / Z / Y / X 相同.
/// 深度为 `d` 的预测写在窗口中央: 起点为 `z + (z_window - d) / 2`.
#[derive(Debug)]
pub struct PredictionWriter {
    output: PathBuf,
    channel_names: Vec<String>,
    z_window: usize,
    order: Vec<String>,
    shapes: HashMap<String, (usize, Idx3d)>,
    buffers: HashMap<String, Array5<f32>>,
    written: usize,
}

impl PredictionWriter {
    /// 创建写出器. `positions` 给出每个位点的 `(名称, T, (Z, Y, X))`.
    pub fn new<P, I>(output: P, channel_names: Vec<String>, z_window: usize, positions: I) -> Self
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = (String, usize, Idx3d)>,
    {
        let mut order = Vec::new();
        let mut shapes = HashMap::new();
        for (name, frames, zyx) in positions {
            order.push(name.clone());
            shapes.insert(name, (frames, zyx));
        }
        Self {
            output: output.as_ref().to_path_buf(),
            channel_names,
            z_window,
            order,
            shapes,
            buffers: HashMap::new(),
            written: 0,
        }
    }

    /// 为预测数据集创建写出器, 输出通道名为 `"{target}_prediction"`.
    pub fn for_dataset<P: AsRef<Path>>(
        output: P,
        targets: &[String],
        dataset: &SlidingWindowDataset,
    ) -> Self {
        let channel_names = targets
            .iter()
            .map(|t| format!("{t}{PREDICTION_SUFFIX}"))
            .collect();
        let positions = dataset
            .positions()
            .iter()
            .map(|p| (p.name().to_string(), p.frames(), p.zyx()));
        Self::new(output, channel_names, dataset.z_window(), positions)
    }

    /// 输出通道名.
    #[inline]
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// 已写入的 crop 个数.
    #[inline]
    pub fn written(&self) -> usize {
        self.written
    }

    /// 写入一个批次的预测. `prediction` 形状为 `(B, C_out, d, Y, X)`, 与 `batch` 逐行对应.
    pub fn write_batch(&mut self, batch: &Batch, prediction: ArrayView5<f32>) -> DataResult<()> {
        let (b, c, d, y, x) = prediction.dim();
        if b != batch.len() || c != self.channel_names.len() || d == 0 || d > self.z_window {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }
        for (index, pred) in batch.index.iter().zip(prediction.axis_iter(Axis(0))) {
            let &(frames, (slices, py, px)) = self
                .shapes
                .get(&index.position)
                .ok_or_else(|| LookupError::UnknownPosition(index.position.clone()))?;
            let z0 = index.z + (self.z_window - d) / 2;
            if index.time >= frames || z0 + d > slices || (y, x) != (py, px) {
                return Err(ShapeError::from_kind(ErrorKind::OutOfBounds).into());
            }
            let buf = self
                .buffers
                .entry(index.position.clone())
                .or_insert_with(|| Array5::zeros((frames, c, slices, py, px)));
            buf.slice_mut(s![index.time, .., z0..z0 + d, .., ..])
                .assign(&pred);
            self.written += 1;
        }
        Ok(())
    }

    /// 将收到过预测的位点按原顺序写出, 返回输出 plate 的路径.
    pub fn finish(self) -> StoreResult<PathBuf> {
        let mut writer = PlateWriter::create(&self.output, true)?;
        for name in self.order.iter() {
            match self.buffers.get(name) {
                Some(buf) => writer.write_position(name, &self.channel_names, buf.view(), None)?,
                None => debug!("No predictions for position {name}"),
            }
        }
        info!(
            "Wrote {} predictions for {} positions to {}",
            self.written,
            self.buffers.len(),
            self.output.display()
        );
        writer.finish()
    }
}

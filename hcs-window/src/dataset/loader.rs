use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{collate, Batch, Dataset};
use crate::consts::defaults;
use crate::error::{ConfigError, DataResult, LoaderError};

/// 数据加载器配置.
#[derive(Clone, Debug, PartialEq)]
pub struct LoaderConfig {
    /// 每批的样本数 (多重采样展开前).
    pub batch_size: usize,

    /// 每轮是否打乱样本顺序.
    pub shuffle: bool,

    /// 是否丢弃最后一个不完整的批次.
    pub drop_last: bool,

    /// worker 线程数. 为 0 时在调用线程上构建批次.
    pub num_workers: usize,

    /// 每个 worker 预取的批次数.
    pub prefetch_factor: usize,

    /// 单个批次的最长等待时间. `Duration::ZERO` 表示不限时.
    pub timeout: Duration,

    /// 打乱顺序与逐样本随机变换的种子.
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            shuffle: false,
            drop_last: false,
            num_workers: 0,
            prefetch_factor: defaults::PREFETCH_FACTOR,
            timeout: Duration::from_secs(defaults::TIMEOUT_SECS),
            seed: 0,
        }
    }
}

/// 由种子、轮次与样本在本轮计划中的位置导出确定的随机数发生器.
///
/// 因此结果与 worker 调度无关.
#[derive(Copy, Clone, Debug)]
struct SeedPlan {
    seed: u64,
    epoch: u64,
}

impl SeedPlan {
    const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

    fn shuffle_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ self.epoch.wrapping_mul(Self::GOLDEN))
    }

    fn sample_rng(&self, plan_pos: usize) -> StdRng {
        let s = self
            .seed
            .wrapping_add(self.epoch.wrapping_add(1).wrapping_mul(Self::GOLDEN))
            .wrapping_add((plan_pos as u64).rotate_left(32));
        StdRng::seed_from_u64(s)
    }
}

/// 构建一个批次. `first` 是该批第一个样本在本轮计划中的位置.
fn load_batch(
    dataset: &dyn Dataset,
    indices: &[usize],
    first: usize,
    seeds: SeedPlan,
) -> DataResult<Batch> {
    let samples = indices
        .iter()
        .enumerate()
        .map(|(k, &i)| dataset.get_with(i, &mut seeds.sample_rng(first + k)))
        .collect::<DataResult<Vec<_>>>()?;
    Ok(collate(samples)?)
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use std::any::Any;
        use std::collections::BTreeMap;
        use std::panic::{self, AssertUnwindSafe};
        use std::sync::atomic::AtomicBool;
        use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
        use std::time::Instant;

        use log::error;

        use crate::error::DataError;

        type WorkerPool = Arc<rayon::ThreadPool>;
        type Delivery = (usize, Result<Batch, LoaderError>);

        fn build_pool(num_workers: usize) -> DataResult<Option<WorkerPool>> {
            if num_workers == 0 {
                return Ok(None);
            }
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .thread_name(|i| format!("hcs-loader-{i}"))
                .panic_handler(|_| error!("Data loader worker panicked"))
                .build()
                .map_err(|e| DataError::WorkerPool(e.to_string()))?;
            Ok(Some(Arc::new(pool)))
        }

        /// 正在 worker 上构建的批次.
        struct InFlight {
            pool: WorkerPool,
            /// 所有批次提交完毕后置空, 之后 worker 全部退出即意味着断开.
            tx: Option<Sender<Delivery>>,
            rx: Receiver<Delivery>,
            submitted: usize,
            ready: BTreeMap<usize, Result<Batch, LoaderError>>,
            /// 置位后尚未开始的批次不再构建.
            cancel: Arc<AtomicBool>,
        }

        impl Drop for InFlight {
            fn drop(&mut self) {
                self.cancel.store(true, Ordering::Relaxed);
            }
        }

        fn panic_message(payload: &(dyn Any + Send)) -> String {
            payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string())
        }

        /// 在 worker 上构建一个批次, panic 转为 [`LoaderError::WorkerPanicked`].
        fn load_batch_caught(
            dataset: &dyn Dataset,
            indices: &[usize],
            batch: usize,
            first: usize,
            seeds: SeedPlan,
        ) -> Result<Batch, LoaderError> {
            let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
                load_batch(dataset, indices, first, seeds)
            }));
            match loaded {
                Ok(r) => Ok(r?),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Data loader worker panicked on batch {batch}: {message}");
                    Err(LoaderError::WorkerPanicked { batch, message })
                }
            }
        }
    } else {
        use log::warn;

        type WorkerPool = ();

        fn build_pool(num_workers: usize) -> DataResult<Option<WorkerPool>> {
            if num_workers > 0 {
                warn!("Built without `rayon`, loading {num_workers} workers' batches inline");
            }
            Ok(None)
        }
    }
}

/// 批处理数据加载器.
///
/// 每轮 (epoch) 先生成样本顺序, 再按 `batch_size` 切分为批次.
/// 有 worker 时, 每个 worker 同步地构建一整个批次,
/// 至多 `prefetch_factor * num_workers` 个批次同时在构建中;
/// 批次总是按顺序交付. worker 线程池在各轮之间复用.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    config: LoaderConfig,
    #[cfg_attr(not(feature = "rayon"), allow(dead_code))]
    pool: Option<WorkerPool>,
    epoch: AtomicU64,
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("len", &self.dataset.len())
            .field("config", &self.config)
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataLoader {
    /// 创建加载器.
    pub fn new(dataset: Arc<dyn Dataset>, config: LoaderConfig) -> DataResult<Self> {
        if config.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize.into());
        }
        let pool = build_pool(config.num_workers)?;
        Ok(Self {
            dataset,
            config,
            pool,
            epoch: AtomicU64::new(0),
        })
    }

    /// 加载器配置.
    #[inline]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// 数据集.
    #[inline]
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    /// 每轮的批次数.
    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    /// 每轮是否没有任何批次.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 第 `epoch` 轮的样本顺序, 已按批次切分.
    pub fn plan(&self, epoch: u64) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut self.seeds(epoch).shuffle_rng());
        }
        let mut batches: Vec<Vec<usize>> = order
            .chunks(self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let partial = batches
            .last()
            .is_some_and(|b| b.len() < self.config.batch_size);
        if self.config.drop_last && partial {
            batches.pop();
        }
        batches
    }

    /// 迭代下一轮. 轮次从 0 开始自动递增.
    pub fn iter(&self) -> EpochIter<'_> {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        self.epoch_iter(epoch)
    }

    /// 迭代指定的轮次.
    pub fn epoch_iter(&self, epoch: u64) -> EpochIter<'_> {
        let batches = self.plan(epoch);
        debug!(
            "Epoch {epoch}: {} batches of {} from {} samples",
            batches.len(),
            self.config.batch_size,
            self.dataset.len()
        );
        EpochIter::new(self, epoch, batches)
    }

    fn seeds(&self, epoch: u64) -> SeedPlan {
        SeedPlan {
            seed: self.config.seed,
            epoch,
        }
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = Result<Batch, LoaderError>;
    type IntoIter = EpochIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// 一轮迭代. 遇到第一个错误后不再产出.
///
/// 提前丢弃 (或出错终止) 时, 尚未开始构建的预取批次被取消.
pub struct EpochIter<'a> {
    loader: &'a DataLoader,
    epoch: u64,
    batches: Vec<Vec<usize>>,
    next: usize,
    done: bool,
    #[cfg(feature = "rayon")]
    inflight: Option<InFlight>,
}

impl<'a> EpochIter<'a> {
    fn new(loader: &'a DataLoader, epoch: u64, batches: Vec<Vec<usize>>) -> Self {
        let mut it = Self {
            loader,
            epoch,
            batches,
            next: 0,
            done: false,
            #[cfg(feature = "rayon")]
            inflight: None,
        };
        it.start();
        it
    }

    /// 轮次.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 本轮的批次总数.
    #[inline]
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn first_pos(&self, batch: usize) -> usize {
        batch * self.loader.config.batch_size
    }

    fn load_inline(&self, batch: usize) -> Result<Batch, LoaderError> {
        let seeds = self.loader.seeds(self.epoch);
        Ok(load_batch(
            self.loader.dataset.as_ref(),
            &self.batches[batch],
            self.first_pos(batch),
            seeds,
        )?)
    }
}

#[cfg(feature = "rayon")]
impl EpochIter<'_> {
    fn start(&mut self) {
        if let Some(pool) = &self.loader.pool {
            let (tx, rx) = mpsc::channel();
            self.inflight = Some(InFlight {
                pool: Arc::clone(pool),
                tx: Some(tx),
                rx,
                submitted: 0,
                ready: BTreeMap::new(),
                cancel: Arc::new(AtomicBool::new(false)),
            });
            self.fill();
        }
    }

    /// 提交批次, 直到在构建中的批次数达到上限.
    fn fill(&mut self) {
        let depth = self.loader.config.prefetch_factor.max(1) * self.loader.config.num_workers;
        let seeds = self.loader.seeds(self.epoch);
        let batch_size = self.loader.config.batch_size;
        let Some(inflight) = self.inflight.as_mut() else {
            return;
        };
        while inflight.submitted < self.batches.len() && inflight.submitted < self.next + depth {
            let Some(tx) = inflight.tx.clone() else {
                break;
            };
            let b = inflight.submitted;
            let indices = self.batches[b].clone();
            let dataset = Arc::clone(&self.loader.dataset);
            let cancel = Arc::clone(&inflight.cancel);
            inflight.pool.spawn(move || {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                let r = load_batch_caught(dataset.as_ref(), &indices, b, b * batch_size, seeds);
                // 接收端已被丢弃时直接放弃结果.
                let _ = tx.send((b, r));
            });
            inflight.submitted += 1;
        }
        if inflight.submitted == self.batches.len() {
            inflight.tx = None;
        }
    }

    /// 等待第 `self.next` 个批次.
    fn wait_next(&mut self) -> Result<Batch, LoaderError> {
        let batch = self.next;
        let timeout = self.loader.config.timeout;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let Some(inflight) = self.inflight.as_mut() else {
            return self.load_inline(batch);
        };
        loop {
            if let Some(r) = inflight.ready.remove(&batch) {
                return r;
            }
            let received = match deadline {
                Some(d) => inflight
                    .rx
                    .recv_timeout(d.saturating_duration_since(Instant::now())),
                None => inflight.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((b, r)) => {
                    inflight.ready.insert(b, r);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(LoaderError::Timeout { batch, timeout })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LoaderError::WorkerDisconnected { batch })
                }
            }
        }
    }

    /// 取消其余批次.
    fn stop(&mut self) {
        self.inflight = None;
    }
}

#[cfg(not(feature = "rayon"))]
impl EpochIter<'_> {
    fn start(&mut self) {}

    fn fill(&mut self) {}

    fn wait_next(&mut self) -> Result<Batch, LoaderError> {
        self.load_inline(self.next)
    }

    fn stop(&mut self) {}
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Batch, LoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next >= self.batches.len() {
            return None;
        }
        let r = self.wait_next();
        self.next += 1;
        self.done = r.is_err();
        if self.done {
            self.stop();
        } else {
            self.fill();
        }
        Some(r)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = if self.done {
            0
        } else {
            self.batches.len() - self.next
        };
        (0, Some(rest))
    }
}

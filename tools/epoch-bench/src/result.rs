//! 测量结果.

use std::io::{self, Write};
use std::time::Duration;

use hcs_window::Batch;

/// 单个加载器一轮迭代的统计.
#[derive(Debug, Default)]
pub struct LoaderProfile {
    batches: usize,
    crops: usize,
    bytes: usize,
    total: Duration,
    slowest: Option<Duration>,
    source_shape: Option<Vec<usize>>,
    target_shape: Option<Vec<usize>>,
}

impl LoaderProfile {
    /// 记录一个批次及等待它的时间.
    pub fn record(&mut self, batch: &Batch, wait: Duration) {
        self.batches += 1;
        self.crops += batch.len();
        self.bytes += batch.source.len() * std::mem::size_of::<f32>();
        if let Some(t) = &batch.target {
            self.bytes += t.len() * std::mem::size_of::<f32>();
        }
        self.total += wait;
        self.slowest = self.slowest.max(Some(wait));
        if self.source_shape.is_none() {
            self.source_shape = Some(batch.source.shape().to_vec());
        }
        if let (None, Some(t)) = (&self.target_shape, &batch.target) {
            self.target_shape = Some(t.shape().to_vec());
        }
    }

    /// 平均每批等待时间 (us).
    pub fn avg_wait_us(&self) -> Option<f64> {
        (self.batches > 0).then(|| self.total.as_micros() as f64 / self.batches as f64)
    }

    /// 吞吐量 (crop / s).
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.total.as_secs_f64();
        (secs > 0.0).then(|| self.crops as f64 / secs)
    }
}

/// 将 `p` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &LoaderProfile, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn f64_to_display(f: Option<f64>) -> String {
        match f {
            Some(f) => format!("{f:.3}"),
            None => "/".to_string(),
        }
    }

    #[inline]
    fn shape_to_display(s: &Option<Vec<usize>>) -> String {
        match s {
            Some(s) => format!("{s:?}"),
            None => "/".to_string(),
        }
    }

    writeln!(w, "Loader `{name}`:")?;
    writeln!(w, "{S4}Batches: {}", p.batches)?;
    writeln!(w, "{S4}Crops: {}", p.crops)?;
    writeln!(w, "{S4}Source shape: {}", shape_to_display(&p.source_shape))?;
    writeln!(w, "{S4}Target shape: {}", shape_to_display(&p.target_shape))?;
    writeln!(w, "{S4}Payload: {:.2} MiB", p.bytes as f64 / (1024.0 * 1024.0))?;
    writeln!(w, "{S4}Total wait: {} ms", p.total.as_millis())?;
    writeln!(w, "{S4}Average wait: {} us", f64_to_display(p.avg_wait_us()))?;
    writeln!(w, "{S4}Throughput: {} crops/s", f64_to_display(p.throughput()))?;
    let t = p.slowest.map(|d| d.as_micros() as f64);
    write!(w, "{S4}Slowest batch took {} us", f64_to_display(t))?;
    Ok(())
}

/// 最终结果.
pub struct BenchResult {
    data: Vec<(&'static str, LoaderProfile)>,
}

impl FromIterator<(&'static str, LoaderProfile)> for BenchResult {
    fn from_iter<I: IntoIterator<Item = (&'static str, LoaderProfile)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }
}

impl BenchResult {
    /// 打印结果.
    pub fn analyze(&self) -> io::Result<()> {
        let mut out = io::stdout().lock();
        utils::sep_to(&mut out)?;
        for (key, profile) in self.data.iter() {
            describe_into(key, profile, &mut out)?;
            writeln!(out)?;
            utils::sep_to(&mut out)?;
        }
        Ok(())
    }
}

//! 程序运行函数.

use std::error::Error;
use std::path::Path;
use std::time::Instant;

use hcs_window::error::LoaderError;
use hcs_window::{DataLoader, HcsDataModule, Stage};
use log::{info, warn};
use utils::loader;

use crate::result::{BenchResult, LoaderProfile};

/// 迭代一轮 `dl`, 记录每个批次的等待时间.
fn profile(
    dm: &HcsDataModule,
    dl: &DataLoader,
    stage: Stage,
) -> Result<LoaderProfile, LoaderError> {
    let mut p = LoaderProfile::default();
    let mut last = Instant::now();
    for batch in dl.iter() {
        let batch = dm.on_before_batch_transfer(batch?, stage);
        p.record(&batch, last.elapsed());
        last = Instant::now();
    }
    Ok(p)
}

/// 实际运行.
pub fn run(config_path: &Path) -> Result<BenchResult, Box<dyn Error>> {
    let config = loader::load_config(config_path)?;
    info!(
        "Benchmarking {} with {} workers",
        config.data_path.display(),
        config.num_workers
    );
    if config.num_workers > utils::cpus() {
        warn!(
            "{} workers requested on {} cpus",
            config.num_workers,
            utils::cpus()
        );
    }

    let mut dm = HcsDataModule::new(config)?;
    dm.prepare_data()?;
    dm.setup(Stage::Fit)?;

    let train = dm.train_dataloader()?;
    let val = dm.val_dataloader()?;
    println!("Iterating one epoch...");
    let train = profile(&dm, &train, Stage::Fit)?;
    let val = profile(&dm, &val, Stage::Validate)?;
    Ok(BenchResult::from_iter([("train", train), ("val", val)]))
}

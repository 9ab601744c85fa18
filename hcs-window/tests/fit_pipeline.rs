use std::fs;
use std::path::Path;

use hcs_window::prelude::*;
use hcs_window::store::{ChannelNorm, Statistics};
use ndarray::{s, Array5};

const POSITIONS: [&str; 5] = ["A/1/0", "A/1/1", "A/2/0", "B/1/0", "B/1/1"];

fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

/// 在 `root` 写一个 5 位点的 plate, 每个位点形状 `(1, 2, 4, 16, 16)`.
fn write_plate(root: &Path) {
    let mut meta = NormMeta::new();
    meta.insert(
        "Phase3D",
        ChannelNorm {
            dataset_statistics: Some(Statistics::new(100.0, 10.0)),
            fov_statistics: None,
        },
    );
    let channels = vec!["Phase3D".to_string(), "Nuclei".to_string()];
    let mut writer = PlateWriter::create(root, true).unwrap();
    for (i, name) in POSITIONS.iter().enumerate() {
        let data = Array5::<u16>::from_shape_fn((1, 2, 4, 16, 16), |(_, c, z, y, x)| {
            (100 + i * 1000 + c * 100 + z * 10 + (y + x) % 7) as u16
        });
        writer
            .write_position(name, &channels, data.view(), Some(&meta))
            .unwrap();
    }
    writer.finish().unwrap();
}

fn config(root: &Path) -> DataModuleConfig {
    let raw = format!(
        r#"{{
            "data_path": {:?},
            "source_channel": "Phase3D",
            "target_channel": "Nuclei",
            "z_window_size": 3,
            "batch_size": 4,
            "num_workers": 2,
            "yx_patch_size": [8, 8],
            "normalizations": [
                {{"type": "NormalizeSampled", "keys": ["Phase3D"]}}
            ],
            "augmentations": [
                {{"type": "RandWeightedCrop", "keys": ["Phase3D", "Nuclei"],
                  "spatial_size": [-1, 12, 12], "num_samples": 2}},
                {{"type": "RandScaleIntensity", "keys": ["Phase3D"], "factors": [-0.1, 0.1]}}
            ],
            "seed": 7
        }}"#,
        root.display().to_string()
    );
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn fit_one_epoch() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    write_plate(dir.path());

    let mut dm = HcsDataModule::new(config(dir.path())).unwrap();
    dm.setup("fit".parse().unwrap()).unwrap();
    assert_eq!(dm.train_patches_per_stack(), 2);
    // 4 个训练位点, 每个 4 - 3 + 1 = 2 个窗口.
    assert_eq!(dm.train_dataset().unwrap().len(), 8);
    assert_eq!(dm.val_dataset().unwrap().len(), 2);

    let train = dm.train_dataloader().unwrap();
    assert_eq!(train.config().batch_size, 2);
    let mut n = 0;
    for batch in train.iter() {
        let batch = dm.on_before_batch_transfer(batch.unwrap(), Stage::Fit);
        assert_eq!(batch.source.dim(), (4, 1, 3, 8, 8));
        assert_eq!(batch.target.as_ref().unwrap().dim(), (4, 1, 1, 8, 8));
        assert_eq!(batch.norm_meta.len(), 4);
        assert!(batch.norm_meta.iter().all(Option::is_some));
        n += 1;
    }
    assert_eq!(n, 4);

    let val = dm.val_dataloader().unwrap();
    let batches: Vec<Batch> = val.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].source.dim(), (2, 1, 3, 8, 8));
    // 验证集不做增强, 归一化后的值只取决于像素.
    let again: Vec<Batch> = val.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(batches, again);
}

#[test]
fn fit_with_ram_cache() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    write_plate(dir.path());

    let mut cfg = config(dir.path());
    cfg.ram_cache = true;
    let mut dm = HcsDataModule::new(cfg).unwrap();
    dm.setup(Stage::Fit).unwrap();
    assert_eq!(dm.train_dataset().unwrap().len(), 4);

    let train = dm.train_dataloader().unwrap();
    for epoch in 0..2 {
        let batches: Vec<Batch> = train
            .epoch_iter(epoch)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        for b in batches.iter() {
            assert_eq!(b.source.dim(), (4, 1, 3, 8, 8));
            assert!(b.index.iter().all(|i| i.time == 0 && i.z == 0));
        }
    }
}

#[test]
fn prepare_data_copies_once() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    write_plate(dir.path());

    let mut cfg = config(dir.path());
    cfg.caching = true;
    let mut dm = HcsDataModule::new(cfg).unwrap();
    let cache = dm.cache_path();
    assert_eq!(dm.prepare_data().unwrap(), 0);
    assert_eq!(dm.prepare_data().unwrap(), POSITIONS.len());

    let plate = Plate::open(&cache).unwrap();
    assert_eq!(plate.position_names(), POSITIONS);

    dm.setup(Stage::Fit).unwrap();
    assert_eq!(dm.train_dataset().unwrap().len(), 8);
    fs::remove_dir_all(cache).unwrap();
}

#[test]
fn predict_single_position() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let plate = dir.path().join("plate");
    write_plate(&plate);

    let mut cfg = config(&plate.join("A/2/0"));
    cfg.caching = true;
    let mut dm = HcsDataModule::new(cfg).unwrap();
    dm.setup(Stage::Predict).unwrap();
    let dataset = dm.predict_dataset().unwrap();
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.positions()[0].name(), "A/2/0");

    let out = dir.path().join("prediction");
    let mut writer = PredictionWriter::for_dataset(&out, &["Nuclei".to_string()], dataset);
    for batch in dm.predict_dataloader().unwrap().iter() {
        let batch = dm.on_before_batch_transfer(batch.unwrap(), Stage::Predict);
        assert!(batch.target.is_none());
        assert_eq!(batch.source.dim(), (2, 1, 3, 16, 16));
        let pred = batch.source.slice(s![.., .., 1..2, .., ..]);
        writer.write_batch(&batch, pred).unwrap();
    }
    assert_eq!(writer.written(), 2);

    let root = writer.finish().unwrap();
    let (_, positions) = open_positions(&root, std::num::NonZeroUsize::MIN).unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].shape(), (1, 1, 4, 16, 16));
    assert_eq!(positions[0].channel_names(), ["Nuclei_prediction"]);

    // 窗口 z = 0 的中心切片写在 z = 1. 该处原值为 2110, 归一化后为 (2110 - 100) / 10.
    let chunk = positions[0].read_chunk_f32(0, 0).unwrap();
    assert_eq!(chunk[(0, 0, 0)], 0.0);
    assert!((chunk[(1, 0, 0)] - 201.0).abs() < 1e-4);
}

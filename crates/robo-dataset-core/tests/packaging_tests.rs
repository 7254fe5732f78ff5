//! End-to-end packaging tests.
//!
//! Every test packages the two-episode example layout from `common` into a
//! temporary directory, then reads it back through `RODataset`.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::BTreeMap;

use common::{DummyEpisodePackaging, FRAME_PERIOD_NS, TestResult, example_episodes, features};
use robo_dataset_core::{
    dataset::{DatasetError, RODataset},
    features::{FeatureField, FeatureSchema, FeatureType, FeatureValue},
    layout,
    manifest::DatasetManifest,
    meta::{DatabaseDriver, Instruction, Robot, Task},
    packaging::{
        DataFrame, DatasetPackaging, EpisodeMeta, EpisodePackaging, PackagingError, ShardSize,
        SourceError,
    },
    storage::StorageLocation,
};
use tempfile::TempDir;

// ===== Test Helpers =====

const DRIVERS: [DatabaseDriver; 2] = [DatabaseDriver::Sqlite, DatabaseDriver::DuckDb];

fn int(row: &robo_dataset_core::dataset::Row, column: &str) -> Option<i64> {
    row.get(column).and_then(FeatureValue::as_i64)
}

/// Source whose frame stream can fail or emit a bad value at a given frame.
struct FaultySource {
    frames: usize,
    fail_at: usize,
    bad_value: bool,
}

impl EpisodePackaging for FaultySource {
    fn features(&self) -> FeatureSchema {
        features()
    }

    fn generate_episode_meta(&mut self) -> Result<EpisodeMeta, SourceError> {
        Ok(EpisodeMeta::default())
    }

    fn generate_frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<DataFrame, SourceError>> + '_> {
        let (fail_at, bad_value) = (self.fail_at, self.bad_value);
        Box::new((0..self.frames).map(move |i| -> Result<DataFrame, SourceError> {
            if i != fail_at {
                return Ok(DataFrame {
                    features: BTreeMap::from([("data".to_string(), FeatureValue::from("ok"))]),
                    instruction: None,
                    timestamp: Some(i as i64 * FRAME_PERIOD_NS),
                });
            }
            if bad_value {
                Ok(DataFrame {
                    features: BTreeMap::from([("data".to_string(), FeatureValue::Int64(7))]),
                    instruction: None,
                    timestamp: None,
                })
            } else {
                Err("sensor disconnected".into())
            }
        }))
    }
}

// ===== Layout and metadata =====

#[tokio::test]
async fn packages_example_with_both_engines() -> TestResult {
    for driver in DRIVERS {
        let tmp = TempDir::new()?;
        let summary = common::package_example(tmp.path(), driver, None, 16).await?;
        assert_eq!(summary.database_driver, driver);
        assert_eq!(summary.episodes, 2);
        assert_eq!(summary.frames, 8);
        assert_eq!(summary.shards, 1);
        assert_eq!((summary.robots, summary.tasks, summary.instructions), (1, 2, 1));

        assert!(tmp.path().join(layout::manifest_rel_path()).is_file());
        assert!(tmp.path().join(layout::meta_db_rel_path(driver)).is_file());
        assert!(tmp.path().join(layout::shard_rel_path(0)).is_file());

        let dataset = RODataset::open(tmp.path(), false).await?;
        assert_eq!(dataset.len(), 8);
        assert_eq!(dataset.database_driver(), driver);
        let counts = dataset.meta_counts()?;
        assert_eq!(
            (counts.episodes, counts.robots, counts.tasks, counts.instructions),
            (2, 1, 2, 1)
        );
    }
    Ok(())
}

#[tokio::test]
async fn row_count_equals_sum_of_episode_frames() -> TestResult {
    let tmp = TempDir::new()?;
    common::package_example(tmp.path(), DatabaseDriver::Sqlite, None, 16).await?;
    let dataset = RODataset::open(tmp.path(), false).await?;

    let episodes = dataset.episodes()?;
    let total: i64 = episodes.iter().map(|e| e.frame_num).sum();
    assert_eq!(total as usize, dataset.len());
    assert_eq!(dataset.manifest().row_count, 8);
    assert_eq!(dataset.manifest().episode_count, 2);
    Ok(())
}

#[tokio::test]
async fn episodes_cover_contiguous_row_ranges() -> TestResult {
    let tmp = TempDir::new()?;
    common::package_example(tmp.path(), DatabaseDriver::DuckDb, None, 16).await?;
    let dataset = RODataset::open(tmp.path(), false).await?;

    let episodes = dataset.episodes()?;
    assert_eq!(episodes.len(), 2);
    let mut next = 0;
    for (i, episode) in episodes.iter().enumerate() {
        assert_eq!(episode.index, i as i64);
        assert_eq!(episode.dataset_begin_index, next);
        next += episode.frame_num;
    }
    assert_eq!(episodes[0].row_range(), 0..5);
    assert_eq!(episodes[1].row_range(), 5..8);
    Ok(())
}

#[tokio::test]
async fn row_keys_agree_with_episode_metadata() -> TestResult {
    let tmp = TempDir::new()?;
    common::package_example(tmp.path(), DatabaseDriver::Sqlite, None, 16).await?;
    let dataset = RODataset::open(tmp.path(), false).await?;
    let episodes = dataset.episodes()?;

    for i in 0..dataset.len() {
        let row = dataset.get(i)?;
        assert_eq!(int(&row, "index"), Some(i as i64));
        let episode = &episodes[int(&row, "episode_index").unwrap() as usize];
        assert!(episode.row_range().contains(&(i as i64)));
        assert_eq!(int(&row, "robot_index"), episode.robot_index);
        assert_eq!(int(&row, "task_index"), episode.task_index);

        let local = i as i64 - episode.dataset_begin_index;
        assert_eq!(int(&row, "timestamp"), Some(local * FRAME_PERIOD_NS));
    }

    // First episode: robot 0, task 0, instruction 0 on every frame.
    let first = dataset.get(0)?;
    assert_eq!(int(&first, "robot_index"), Some(0));
    assert_eq!(int(&first, "task_index"), Some(0));
    assert_eq!(int(&first, "instruction_index"), Some(0));
    // Second episode: no robot, task 1, no instruction.
    let last = dataset.get(7)?;
    assert_eq!(int(&last, "robot_index"), None);
    assert_eq!(int(&last, "task_index"), Some(1));
    assert_eq!(int(&last, "instruction_index"), None);
    Ok(())
}

#[tokio::test]
async fn identical_metadata_is_stored_once() -> TestResult {
    let tmp = TempDir::new()?;
    let robot = common::robots()[1].clone();
    let task = common::tasks()[0].clone();
    let episodes: Vec<_> = (0..3)
        .map(|seed| {
            DummyEpisodePackaging::new(2, seed)
                .with_robots(std::slice::from_ref(&robot))
                .with_tasks(std::slice::from_ref(&task))
                .with_instructions(&common::instructions())
        })
        .collect();
    DatasetPackaging::new(features(), DatabaseDriver::DuckDb)
        .packaging(episodes, tmp.path(), None)
        .await?;

    let dataset = RODataset::open(tmp.path(), false).await?;
    let robots = dataset.get_meta_many::<Robot>(&[Some(0), Some(1)])?;
    assert_eq!(robots[0].as_ref().map(|r| r.name.as_str()), Some("robot_1"));
    assert!(robots[1].is_none());
    let tasks = dataset.get_meta_many::<Task>(&[Some(0)])?;
    assert_eq!(
        tasks[0].as_ref().and_then(|t| t.description.as_deref()),
        Some("task_0_description")
    );
    let counts = dataset.meta_counts()?;
    assert_eq!((counts.episodes, counts.robots, counts.tasks), (3, 1, 1));
    assert!(counts.instructions <= 2);

    for episode in dataset.episodes()? {
        assert_eq!(episode.robot_index, Some(0));
        assert_eq!(episode.task_index, Some(0));
    }
    let instruction: Option<Instruction> = dataset.get_meta(Some(0))?;
    assert!(instruction.unwrap().json_content.get("instruction").is_some());
    Ok(())
}

// ===== Sharding =====

#[tokio::test]
async fn oversized_frames_get_one_shard_each() -> TestResult {
    let tmp = TempDir::new()?;
    let summary =
        common::package_example(tmp.path(), DatabaseDriver::DuckDb, Some("1MB"), 1024 * 1024)
            .await?;
    assert_eq!(summary.shards, 8);

    let manifest = DatasetManifest::load(&StorageLocation::local(tmp.path())).await?;
    assert_eq!(manifest.max_shard_size, Some(1_000_000));
    assert!(manifest.shards.iter().all(|s| s.row_count == 1));

    let dataset = RODataset::open(tmp.path(), false).await?;
    let row = dataset.get(6)?;
    assert_eq!(row.get("data").and_then(FeatureValue::as_str).map(str::len), Some(1024 * 1024));
    Ok(())
}

#[tokio::test]
async fn sharding_is_invisible_to_readers() -> TestResult {
    let single = TempDir::new()?;
    let sharded = TempDir::new()?;
    common::package_example(single.path(), DatabaseDriver::Sqlite, None, 4096).await?;
    let summary =
        common::package_example(sharded.path(), DatabaseDriver::Sqlite, Some("10KiB"), 4096)
            .await?;
    assert!(summary.shards > 1);

    let a = RODataset::open(single.path(), false).await?;
    let b = RODataset::open(sharded.path(), false).await?;
    assert_eq!(a.manifest().shards.len(), 1);
    assert_eq!(b.manifest().shards.len(), summary.shards);
    assert_eq!(
        b.manifest().shards.iter().map(|s| s.row_count).sum::<u64>(),
        8
    );
    assert_eq!(a.len(), b.len());
    for i in 0..a.len() {
        assert_eq!(a.get(i)?, b.get(i)?, "row {i} differs");
    }
    // Reads spanning shard boundaries, out of order.
    let order = vec![7, 0, 3, 3, 5];
    assert_eq!(a.get_batch(order.clone())?, b.get_batch(order)?);
    Ok(())
}

#[test]
fn shard_sizes_parse_like_the_cli_accepts_them() {
    assert_eq!(ShardSize::parse("1MB").unwrap().bytes(), 1_000_000);
    assert_eq!(ShardSize::parse("10KiB").unwrap().bytes(), 10 * 1024);
    assert!(ShardSize::parse("0").is_err());
}

// ===== Failures =====

#[tokio::test]
async fn rejects_non_empty_target() -> TestResult {
    let tmp = TempDir::new()?;
    std::fs::write(tmp.path().join("keep.txt"), b"x")?;
    let err = DatasetPackaging::new(features(), DatabaseDriver::Sqlite)
        .packaging(example_episodes(16), tmp.path(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PackagingError::Target { .. }), "{err}");
    assert!(!tmp.path().join(layout::manifest_rel_path()).exists());
    Ok(())
}

#[tokio::test]
async fn rejects_episode_with_other_schema() -> TestResult {
    let tmp = TempDir::new()?;
    let mut other = DummyEpisodePackaging::new(2, 9);
    other.features = FeatureSchema::new(vec![FeatureField::new("data", FeatureType::Utf8, true)])?;
    let mut episodes = example_episodes(16);
    episodes.push(other);

    let err = DatasetPackaging::new(features(), DatabaseDriver::DuckDb)
        .packaging(episodes, tmp.path(), None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, PackagingError::SchemaMismatch { episode: 2, .. }),
        "{err}"
    );

    // Nothing readable was published.
    let open = RODataset::open(tmp.path(), false).await.unwrap_err();
    assert!(matches!(open, DatasetError::OpenManifest { .. }), "{open}");
    assert!(open.is_configuration_error());
    Ok(())
}

#[tokio::test]
async fn reports_frame_with_wrong_value_type() -> TestResult {
    let tmp = TempDir::new()?;
    let source = FaultySource {
        frames: 4,
        fail_at: 2,
        bad_value: true,
    };
    let err = DatasetPackaging::new(features(), DatabaseDriver::Sqlite)
        .packaging([source], tmp.path(), None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, PackagingError::InvalidFrame { episode: 0, frame: 2, .. }),
        "{err}"
    );
    Ok(())
}

#[tokio::test]
async fn propagates_source_errors() -> TestResult {
    let tmp = TempDir::new()?;
    let source = FaultySource {
        frames: 4,
        fail_at: 1,
        bad_value: false,
    };
    let err = DatasetPackaging::new(features(), DatabaseDriver::Sqlite)
        .packaging([source], tmp.path(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PackagingError::Source { episode: 0, .. }), "{err}");
    assert!(err.to_string().contains("sensor disconnected"), "{err}");
    Ok(())
}

#[tokio::test]
async fn boxed_sources_can_be_mixed() -> TestResult {
    let tmp = TempDir::new()?;
    let episodes: Vec<Box<dyn EpisodePackaging>> = vec![
        Box::new(DummyEpisodePackaging::new(2, 1)),
        Box::new(FaultySource {
            frames: 3,
            fail_at: usize::MAX,
            bad_value: false,
        }),
    ];
    let summary = DatasetPackaging::new(features(), DatabaseDriver::Sqlite)
        .packaging(episodes, tmp.path(), None)
        .await?;
    assert_eq!((summary.episodes, summary.frames), (2, 5));

    let dataset = RODataset::open(tmp.path(), false).await?;
    let row = dataset.get(4)?;
    assert_eq!(row.get("data"), Some(&FeatureValue::from("ok")));
    // Missing feature columns are stored as null.
    assert_eq!(row.get("joints"), Some(&FeatureValue::Null));
    Ok(())
}

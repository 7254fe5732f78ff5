#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::path::Path;

use robo_dataset_core::{
    features::{FeatureField, FeatureSchema, FeatureType, FeatureValue},
    meta::DatabaseDriver,
    packaging::{
        DataFrame, DatasetPackaging, EpisodeMeta, EpisodePackaging, InstructionData,
        PackagingSummary, RobotData, ShardSize, SourceError, TaskData,
    },
};
use serde_json::json;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Frame period of the dummy sources: 50 ms.
pub const FRAME_PERIOD_NS: i64 = 50_000_000;

/// Small deterministic generator so tests do not need an RNG crate.
#[derive(Debug, Clone)]
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed.wrapping_mul(6364136223846793005).wrapping_add(1))
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    pub fn next_f32(&mut self) -> f32 {
        self.next_u32() as f32 / u32::MAX as f32
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            None
        } else {
            items.get(self.next_u32() as usize % items.len())
        }
    }
}

pub fn features() -> FeatureSchema {
    FeatureSchema::new(vec![
        FeatureField::new("data", FeatureType::Utf8, true),
        FeatureField::new(
            "joints",
            FeatureType::struct_of(vec![FeatureField::new(
                "position",
                FeatureType::list_of(FeatureType::list_of(FeatureType::Float32)),
                true,
            )]),
            true,
        ),
    ])
    .expect("valid test schema")
}

pub fn robots() -> Vec<RobotData> {
    vec![
        RobotData::new("robot_0", Some("robot_0_urdf")),
        RobotData::new("robot_1", Some("robot_1_urdf")),
    ]
}

pub fn tasks() -> Vec<TaskData> {
    vec![
        TaskData::new("task_0", Some("task_0_description")),
        TaskData::new("task_1", Some("task_1_description")),
    ]
}

pub fn instructions() -> Vec<InstructionData> {
    vec![
        InstructionData::new(
            Some("instruction_0"),
            json!({"instruction": "Do task 0 with robot 0", "robot": "robot_0", "task": "task_0"}),
        ),
        InstructionData::new(
            Some("instruction_1"),
            json!({"instruction": "Do task 1 with robot 1", "robot": "robot_1", "task": "task_1"}),
        ),
    ]
}

/// Episode source emitting random strings and 3x5 joint positions, one
/// frame every 50 ms starting at t = 0.
#[derive(Debug, Clone)]
pub struct DummyEpisodePackaging {
    pub frame_num: usize,
    pub data_size: usize,
    pub robots: Vec<RobotData>,
    pub tasks: Vec<TaskData>,
    pub instructions: Vec<InstructionData>,
    pub features: FeatureSchema,
    rng: Lcg,
}

impl DummyEpisodePackaging {
    pub fn new(frame_num: usize, seed: u64) -> Self {
        Self {
            frame_num,
            data_size: 16,
            robots: Vec::new(),
            tasks: Vec::new(),
            instructions: Vec::new(),
            features: features(),
            rng: Lcg::new(seed),
        }
    }

    pub fn with_data_size(mut self, data_size: usize) -> Self {
        self.data_size = data_size;
        self
    }

    pub fn with_robots(mut self, robots: &[RobotData]) -> Self {
        self.robots = robots.to_vec();
        self
    }

    pub fn with_tasks(mut self, tasks: &[TaskData]) -> Self {
        self.tasks = tasks.to_vec();
        self
    }

    pub fn with_instructions(mut self, instructions: &[InstructionData]) -> Self {
        self.instructions = instructions.to_vec();
        self
    }

    fn frame(&mut self, i: usize) -> DataFrame {
        let data: String = (0..self.data_size)
            .map(|_| (b'a' + (self.rng.next_u32() % 26) as u8) as char)
            .collect();
        let position: FeatureValue = (0..3)
            .map(|_| {
                (0..5)
                    .map(|_| FeatureValue::Float32(self.rng.next_f32()))
                    .collect::<FeatureValue>()
            })
            .collect();
        let instruction = self.rng.pick(&self.instructions).cloned();
        DataFrame {
            features: BTreeMap::from([
                ("data".to_string(), FeatureValue::from(data)),
                (
                    "joints".to_string(),
                    FeatureValue::Struct(BTreeMap::from([("position".to_string(), position)])),
                ),
            ]),
            instruction,
            timestamp: Some(i as i64 * FRAME_PERIOD_NS),
        }
    }
}

impl EpisodePackaging for DummyEpisodePackaging {
    fn features(&self) -> FeatureSchema {
        self.features.clone()
    }

    fn generate_episode_meta(&mut self) -> Result<EpisodeMeta, SourceError> {
        Ok(EpisodeMeta {
            robot: self.rng.pick(&self.robots).cloned(),
            task: self.rng.pick(&self.tasks).cloned(),
        })
    }

    fn generate_frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<DataFrame, SourceError>> + '_> {
        let n = self.frame_num;
        Box::new((0..n).map(move |i| -> Result<DataFrame, SourceError> { Ok(self.frame(i)) }))
    }
}

/// The two-episode layout used across tests: 5 frames with robot, task and
/// instruction, then 3 frames with only a task.
pub fn example_episodes(data_size: usize) -> Vec<DummyEpisodePackaging> {
    vec![
        DummyEpisodePackaging::new(5, 1)
            .with_data_size(data_size)
            .with_robots(&robots()[0..1])
            .with_tasks(&tasks()[0..1])
            .with_instructions(&instructions()[0..1]),
        DummyEpisodePackaging::new(3, 2)
            .with_data_size(data_size)
            .with_tasks(&tasks()[1..2]),
    ]
}

pub async fn package_example(
    path: &Path,
    driver: DatabaseDriver,
    max_shard_size: Option<&str>,
    data_size: usize,
) -> Result<PackagingSummary, Box<dyn std::error::Error>> {
    let max = max_shard_size.map(ShardSize::parse).transpose()?;
    let packaging = DatasetPackaging::new(features(), driver);
    Ok(packaging
        .packaging(example_episodes(data_size), path, max)
        .await?)
}

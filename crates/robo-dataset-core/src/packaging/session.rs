//! Counters and dedup tables of one packaging run.

use std::collections::HashMap;

use log::debug;

use super::{InstructionData, RobotData, TaskData};
use crate::meta::{Episode, Instruction, MetaBatch, Robot, Task};

/// Mutable state of a packaging run, passed explicitly through the pipeline.
///
/// Robots, tasks and instructions are interned by content: the first
/// occurrence gets the next dense index, later equal references reuse it.
#[derive(Debug, Default)]
pub struct PackagingSession {
    next_row: i64,
    batch: MetaBatch,
    robot_keys: HashMap<RobotData, i64>,
    task_keys: HashMap<TaskData, i64>,
    instruction_keys: HashMap<(Option<String>, String), i64>,
}

impl PackagingSession {
    /// Fresh session starting at row 0 and episode 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Global index of the next frame row.
    pub fn next_row(&self) -> i64 {
        self.next_row
    }

    /// Key the next episode will receive.
    pub fn next_episode_index(&self) -> i64 {
        self.batch.episodes.len() as i64
    }

    /// Claim the next global row index.
    pub fn claim_row(&mut self) -> i64 {
        let row = self.next_row;
        self.next_row += 1;
        row
    }

    /// Key of `robot`, inserting it on first sight.
    pub fn intern_robot(&mut self, robot: Option<RobotData>) -> Option<i64> {
        let robot = robot?;
        if let Some(&index) = self.robot_keys.get(&robot) {
            debug!("reusing robot {index} ({})", robot.name);
            return Some(index);
        }
        let index = self.batch.robots.len() as i64;
        self.batch.robots.push(Robot {
            index,
            name: robot.name.clone(),
            urdf_content: robot.urdf_content.clone(),
        });
        self.robot_keys.insert(robot, index);
        Some(index)
    }

    /// Key of `task`, inserting it on first sight.
    pub fn intern_task(&mut self, task: Option<TaskData>) -> Option<i64> {
        let task = task?;
        if let Some(&index) = self.task_keys.get(&task) {
            debug!("reusing task {index} ({})", task.name);
            return Some(index);
        }
        let index = self.batch.tasks.len() as i64;
        self.batch.tasks.push(Task {
            index,
            name: task.name.clone(),
            description: task.description.clone(),
        });
        self.task_keys.insert(task, index);
        Some(index)
    }

    /// Key of `instruction`, inserting it on first sight.
    pub fn intern_instruction(&mut self, instruction: Option<InstructionData>) -> Option<i64> {
        let instruction = instruction?;
        // serde_json maps are ordered, so equal content renders identically.
        let key = (instruction.name.clone(), instruction.json_content.to_string());
        if let Some(&index) = self.instruction_keys.get(&key) {
            return Some(index);
        }
        let index = self.batch.instructions.len() as i64;
        self.batch.instructions.push(Instruction {
            index,
            name: instruction.name,
            json_content: instruction.json_content,
        });
        self.instruction_keys.insert(key, index);
        Some(index)
    }

    /// Record a finished episode.
    pub fn push_episode(&mut self, episode: Episode) {
        self.batch.episodes.push(episode);
    }

    /// Consume the session, yielding its metadata.
    pub fn into_batch(self) -> MetaBatch {
        self.batch
    }
}

//! Timing metrics collected while a pipeline runs.

use super::stage::ExecutionMode;

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StageMetrics {
    pub index: usize,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, task_name: &str) -> Option<u128> {
        self.stages
            .iter()
            .flat_map(|s| s.tasks.iter())
            .find(|t| t.name == task_name)
            .map(|t| t.duration_ms)
    }
}

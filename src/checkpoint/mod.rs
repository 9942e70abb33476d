//! 检查点：批处理进度的持久化快照

pub mod integrity;
pub mod manager;
pub mod resume;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    BatchConfig, BatchRun, FailedAttempt, ItemRef, ItemResult, MetricsSnapshot, ResumeMetadata,
};

pub use manager::{CheckpointManager, ResumePlan};
pub use resume::{
    compute_strategy, diff_config, validate_environment, ResumeMode, ResumeOptions, ResumeStrategy,
    RetryPlanEntry,
};

pub const SCHEMA_VERSION: u32 = 1;

/// 存储键前缀，完整键为 `checkpoint:{run_id}:{id}`
pub const KEY_PREFIX: &str = "checkpoint:";

/// 检查点快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "D: Serialize, O: Serialize",
    deserialize = "D: serde::de::DeserializeOwned, O: serde::de::DeserializeOwned"
))]
pub struct Checkpoint<D, O> {
    pub id: String,
    pub run_id: String,
    /// 毫秒时间戳，同一个管理器内严格递增
    pub timestamp: i64,
    pub schema_version: u32,
    pub total_items: usize,
    pub items: Vec<ItemRef>,
    pub completed_results: Vec<ItemResult<D, O>>,
    pub current_index: usize,
    pub failed_attempts: Vec<FailedAttempt>,
    pub configuration: BatchConfig,
    pub metrics_snapshot: MetricsSnapshot,
    pub resume_metadata: ResumeMetadata,
    pub started_at: DateTime<Utc>,
    /// 读取时从校验行填入，不参与序列化
    #[serde(skip)]
    pub integrity_hash: String,
}

impl<D: Clone, O: Clone> Checkpoint<D, O> {
    pub fn from_run(id: impl Into<String>, timestamp: i64, run: &BatchRun<D, O>) -> Self {
        Self {
            id: id.into(),
            run_id: run.run_id.clone(),
            timestamp,
            schema_version: SCHEMA_VERSION,
            total_items: run.total_items(),
            items: run.items.clone(),
            completed_results: run.results.clone(),
            current_index: run.current_index,
            failed_attempts: run.failed_attempts.clone(),
            configuration: run.config.clone(),
            metrics_snapshot: run.metrics.clone(),
            resume_metadata: run.resume.clone(),
            started_at: run.started_at,
            integrity_hash: String::new(),
        }
    }
}

impl<D, O> Checkpoint<D, O> {
    /// 还原为可继续执行的批次状态
    pub fn into_run(self) -> BatchRun<D, O> {
        BatchRun {
            run_id: self.run_id,
            items: self.items,
            current_index: self.current_index,
            results: self.completed_results,
            failed_attempts: self.failed_attempts,
            config: self.configuration,
            metrics: self.metrics_snapshot,
            resume: self.resume_metadata,
            started_at: self.started_at,
        }
    }
}

/// 检查点摘要（只从存储键解析，不读取正文）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointInfo {
    pub id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub key: String,
}

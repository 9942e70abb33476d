use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::{FailedAttempt, ItemRef, ItemResult, Phase};
use crate::metrics::LiveIndicators;

/// 执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 逐条处理：激活 → 抓取 → 分析
    Sequential,
    /// 两阶段：先顺序抓取全部条目，再按块并发分析
    Parallel,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Ok(ExecutionMode::Sequential),
            "parallel" | "two_phase" => Ok(ExecutionMode::Parallel),
            other => Err(format!("未知执行模式: {}", other)),
        }
    }
}

/// 条目失败后的恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// 记录失败后继续下一个条目
    Continue,
    /// 失败条目在本轮结束前重试一次
    RetryAtEnd,
}

/// 批处理配置（随检查点一起持久化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    pub mode: ExecutionMode,
    /// 第二阶段每块的并发数
    pub max_concurrency: usize,
    /// 每成功多少个条目写一次检查点，0 表示不写
    pub checkpoint_interval: usize,
    /// 每个 run 保留的检查点数量
    pub max_checkpoints: usize,
    /// 瞬时错误的最大重试次数
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// 单次外部调用的超时
    pub item_timeout_ms: u64,
    pub recovery_strategy: RecoveryStrategy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            max_concurrency: 3,
            checkpoint_interval: 5,
            max_checkpoints: 5,
            max_retries: 2,
            retry_base_delay_ms: 1_000,
            item_timeout_ms: 120_000,
            recovery_strategy: RecoveryStrategy::Continue,
        }
    }
}

impl BatchConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// 第 `attempt` 次重试前的等待时间：`base * 2^(attempt-1)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.retry_base_delay().saturating_mul(1u32 << exp)
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("maxConcurrency 必须大于 0".to_string());
        }
        if self.max_checkpoints == 0 {
            return Err("maxCheckpoints 必须大于 0".to_string());
        }
        if self.item_timeout_ms == 0 {
            return Err("itemTimeoutMs 必须大于 0".to_string());
        }
        Ok(())
    }

    /// 应用覆盖项，返回新配置
    pub fn apply(&self, overrides: &ConfigOverride) -> BatchConfig {
        let mut next = self.clone();
        if let Some(v) = overrides.mode {
            next.mode = v;
        }
        if let Some(v) = overrides.max_concurrency {
            next.max_concurrency = v;
        }
        if let Some(v) = overrides.checkpoint_interval {
            next.checkpoint_interval = v;
        }
        if let Some(v) = overrides.max_checkpoints {
            next.max_checkpoints = v;
        }
        if let Some(v) = overrides.max_retries {
            next.max_retries = v;
        }
        if let Some(v) = overrides.retry_base_delay_ms {
            next.retry_base_delay_ms = v;
        }
        if let Some(v) = overrides.item_timeout_ms {
            next.item_timeout_ms = v;
        }
        if let Some(v) = overrides.recovery_strategy {
            next.recovery_strategy = v;
        }
        next
    }
}

/// 恢复时对配置的覆盖
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverride {
    pub mode: Option<ExecutionMode>,
    pub max_concurrency: Option<usize>,
    pub checkpoint_interval: Option<usize>,
    pub max_checkpoints: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub item_timeout_ms: Option<u64>,
    pub recovery_strategy: Option<RecoveryStrategy>,
}

/// 外部系统句柄（例如浏览器标签页）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    pub handle_id: String,
    pub last_health_check: DateTime<Utc>,
    /// 恢复时是否必须存在
    #[serde(default)]
    pub required: bool,
}

/// 恢复相关的元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
    /// 本 run 已被恢复的次数
    #[serde(default)]
    pub resume_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    /// 检查点写入原因（interval / cancelled / aborted）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 写入检查点时的指标快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub indicators: LiveIndicators,
    pub operation_count: usize,
    pub error_count: usize,
}

/// 一次批处理执行
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "D: Serialize, O: Serialize",
    deserialize = "D: serde::de::DeserializeOwned, O: serde::de::DeserializeOwned"
))]
pub struct BatchRun<D, O> {
    pub run_id: String,
    pub items: Vec<ItemRef>,
    /// 下一个待处理条目的位置
    pub current_index: usize,
    pub results: Vec<ItemResult<D, O>>,
    pub failed_attempts: Vec<FailedAttempt>,
    pub config: BatchConfig,
    pub metrics: MetricsSnapshot,
    pub resume: ResumeMetadata,
    pub started_at: DateTime<Utc>,
}

impl<D, O> BatchRun<D, O> {
    pub fn new(run_id: impl Into<String>, items: Vec<ItemRef>, config: BatchConfig) -> Self {
        Self {
            run_id: run_id.into(),
            items,
            current_index: 0,
            results: Vec::new(),
            failed_attempts: Vec::new(),
            config,
            metrics: MetricsSnapshot::default(),
            resume: ResumeMetadata::default(),
            started_at: Utc::now(),
        }
    }

    pub fn total_items(&self) -> usize {
        self.items.len()
    }

    /// 写入条目结果
    ///
    /// 已成功的结果不会被覆盖；失败结果会被同一位置的新结果取代。
    /// 返回是否真正写入。
    pub fn record_result(&mut self, result: ItemResult<D, O>) -> bool {
        let index = result.index();
        match self.results.iter().position(|r| r.index() == index) {
            Some(pos) if self.results[pos].success => false,
            Some(pos) => {
                self.results[pos] = result;
                true
            }
            None => {
                self.results.push(result);
                true
            }
        }
    }

    pub fn record_failure(&mut self, item: &ItemRef, phase: Phase, error: impl Into<String>, attempt: u32) {
        self.failed_attempts.push(FailedAttempt {
            index: item.index,
            item_id: item.id.clone(),
            phase,
            error: error.into(),
            attempt,
            at: Utc::now(),
        });
    }

    pub fn result_for(&self, index: usize) -> Option<&ItemResult<D, O>> {
        self.results.iter().find(|r| r.index() == index)
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success && !r.skipped).count()
    }

    /// 最后一个成功条目的位置
    pub fn last_successful_index(&self) -> Option<usize> {
        self.results.iter().filter(|r| r.success).map(|r| r.index()).max()
    }

    /// 当前仍处于失败状态的条目位置（按位置排序）
    pub fn failed_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .results
            .iter()
            .filter(|r| !r.success && !r.skipped)
            .map(|r| r.index())
            .collect();
        indices.sort_unstable();
        indices
    }

    /// 某个条目累计失败次数
    pub fn attempt_count(&self, index: usize) -> u32 {
        self.failed_attempts.iter().filter(|a| a.index == index).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> BatchRun<String, String> {
        let items = (0..3).map(|i| ItemRef::new(format!("item-{i}"), i)).collect();
        BatchRun::new("run-1", items, BatchConfig::default())
    }

    #[test]
    fn test_successful_result_is_never_overwritten() {
        let mut run = run();
        let item = run.items[0].clone();
        assert!(run.record_result(ItemResult::succeeded(item.clone(), "d".into(), "a".into(), 10, 1)));
        assert!(!run.record_result(ItemResult::failed(item, None, "late failure", 5, 2)));
        assert!(run.result_for(0).unwrap().success);
        assert_eq!(run.results.len(), 1);
    }

    #[test]
    fn test_retry_supersedes_failure() {
        let mut run = run();
        let item = run.items[1].clone();
        run.record_result(ItemResult::failed(item.clone(), Some("partial".into()), "timeout", 5, 1));
        assert_eq!(run.failed_indices(), vec![1]);
        run.record_result(ItemResult::succeeded(item, "d".into(), "a".into(), 10, 2));
        assert!(run.failed_indices().is_empty());
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.result_for(1).unwrap().attempt, 2);
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let config = BatchConfig {
            retry_base_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_config_override_applies_only_given_fields() {
        let base = BatchConfig::default();
        let next = base.apply(&ConfigOverride {
            max_retries: Some(7),
            ..Default::default()
        });
        assert_eq!(next.max_retries, 7);
        assert_eq!(next.max_concurrency, base.max_concurrency);
    }
}

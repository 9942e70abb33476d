//! 恢复策略
//!
//! 纯函数：同一个检查点和同一组选项总是得到同样的策略。

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::models::{BatchConfig, BatchRun, ExternalRef};
use crate::services::{EnvironmentProbe, HandleState};

/// 健康检查超过这个时长视为过期
pub const HEALTH_CHECK_STALE_AFTER: Duration = Duration::from_secs(3600);

/// 恢复选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOptions {
    pub skip_failed: bool,
    pub retry_failed: bool,
    pub validate_environment: bool,
    pub allow_config_changes: bool,
    pub resume_from_last_successful: bool,
    /// 重试延迟的单位，第 n 次失败的条目等待 n 个单位
    #[serde(default = "default_retry_delay_unit_ms")]
    pub retry_delay_unit_ms: u64,
}

fn default_retry_delay_unit_ms() -> u64 {
    60_000
}

impl Default for ResumeOptions {
    fn default() -> Self {
        Self {
            skip_failed: false,
            retry_failed: false,
            validate_environment: true,
            allow_config_changes: true,
            resume_from_last_successful: false,
            retry_delay_unit_ms: default_retry_delay_unit_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    Continue,
    RetryFailed,
    SkipFailed,
}

/// 一个待重试的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPlanEntry {
    pub index: usize,
    pub item_id: String,
    pub attempt_count: u32,
    pub delay_ms: u64,
}

impl RetryPlanEntry {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeStrategy {
    pub start_index: usize,
    pub mode: ResumeMode,
    pub skip: BTreeSet<usize>,
    pub retry: Vec<RetryPlanEntry>,
}

impl ResumeStrategy {
    /// 新批次：从头开始，不跳过也不重试
    pub fn fresh() -> Self {
        Self {
            start_index: 0,
            mode: ResumeMode::Continue,
            skip: BTreeSet::new(),
            retry: Vec::new(),
        }
    }
}

/// 根据检查点还原出的批次计算恢复策略
pub fn compute_strategy<D, O>(run: &BatchRun<D, O>, options: &ResumeOptions) -> ResumeStrategy {
    let start_index = if options.resume_from_last_successful {
        let after_last_success = run.last_successful_index().map_or(0, |i| i + 1);
        after_last_success.max(run.current_index)
    } else {
        run.current_index
    };

    let mode = if options.retry_failed {
        ResumeMode::RetryFailed
    } else if options.skip_failed {
        ResumeMode::SkipFailed
    } else {
        ResumeMode::Continue
    };

    let mut skip = BTreeSet::new();
    let mut retry = Vec::new();

    match mode {
        ResumeMode::RetryFailed => {
            for index in run.failed_indices() {
                let item_id = run.result_for(index).map(|r| r.item.id.clone()).unwrap_or_default();
                let attempt_count = run.attempt_count(index).max(1);
                retry.push(RetryPlanEntry {
                    index,
                    item_id,
                    attempt_count,
                    delay_ms: options.retry_delay_unit_ms.saturating_mul(attempt_count as u64),
                });
            }
        }
        ResumeMode::SkipFailed => skip.extend(run.failed_indices()),
        ResumeMode::Continue => {}
    }

    ResumeStrategy {
        start_index: start_index.min(run.total_items()),
        mode,
        skip,
        retry,
    }
}

/// 对比检查点配置和恢复时的配置，只报告关键字段的变化
pub fn diff_config(stored: &BatchConfig, next: &BatchConfig) -> Vec<String> {
    let mut changes = Vec::new();
    if stored.max_retries != next.max_retries {
        changes.push(format!("maxRetries: {} -> {}", stored.max_retries, next.max_retries));
    }
    if stored.item_timeout_ms != next.item_timeout_ms {
        changes.push(format!(
            "itemTimeoutMs: {} -> {}",
            stored.item_timeout_ms, next.item_timeout_ms
        ));
    }
    if stored.retry_base_delay_ms != next.retry_base_delay_ms {
        changes.push(format!(
            "retryBaseDelayMs: {} -> {}",
            stored.retry_base_delay_ms, next.retry_base_delay_ms
        ));
    }
    if stored.recovery_strategy != next.recovery_strategy {
        changes.push(format!(
            "recoveryStrategy: {:?} -> {:?}",
            stored.recovery_strategy, next.recovery_strategy
        ));
    }
    changes
}

/// 检查外部句柄，返回警告列表
///
/// 只有句柄是必需的且外部系统不可达时才返回错误。
pub async fn validate_environment(
    external: Option<&ExternalRef>,
    probe: Option<&dyn EnvironmentProbe>,
    now: DateTime<Utc>,
) -> Result<Vec<String>, CheckpointError> {
    let mut warnings = Vec::new();
    let Some(external) = external else {
        return Ok(warnings);
    };

    let age = now.signed_duration_since(external.last_health_check);
    if age.to_std().map(|a| a > HEALTH_CHECK_STALE_AFTER).unwrap_or(false) {
        warnings.push(format!(
            "外部句柄 {} 的健康检查已过期 ({} 分钟前)",
            external.handle_id,
            age.num_minutes()
        ));
    }

    let Some(probe) = probe else {
        return Ok(warnings);
    };

    match probe.probe(&external.handle_id).await {
        HandleState::Present => {}
        HandleState::Missing => {
            warnings.push(format!("外部句柄 {} 已不存在", external.handle_id));
        }
        HandleState::Unreachable if external.required => {
            return Err(CheckpointError::EnvironmentUnavailable(format!(
                "必需的外部句柄 {} 不可达",
                external.handle_id
            )));
        }
        HandleState::Unreachable => {
            warnings.push(format!("外部句柄 {} 不可达", external.handle_id));
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchRun, ItemRef, ItemResult, Phase, RecoveryStrategy};
    use async_trait::async_trait;

    fn sample_run() -> BatchRun<String, String> {
        let items: Vec<ItemRef> = (0..6).map(|i| ItemRef::new(format!("q{i}"), i)).collect();
        let mut run: BatchRun<String, String> = BatchRun::new("run", items.clone(), BatchConfig::default());
        run.record_result(ItemResult::succeeded(items[0].clone(), "d".into(), "a".into(), 1, 1));
        run.record_result(ItemResult::failed(items[1].clone(), None, "timeout", 1, 2));
        run.record_failure(&items[1], Phase::Extraction, "timeout", 1);
        run.record_failure(&items[1], Phase::Extraction, "timeout", 2);
        run.record_result(ItemResult::succeeded(items[2].clone(), "d".into(), "a".into(), 1, 1));
        run.record_result(ItemResult::failed(items[3].clone(), Some("p".into()), "bad", 1, 1));
        run.record_failure(&items[3], Phase::Analysis, "bad", 1);
        run.current_index = 4;
        run
    }

    #[test]
    fn test_strategy_is_deterministic() {
        let run = sample_run();
        let options = ResumeOptions {
            retry_failed: true,
            ..Default::default()
        };
        assert_eq!(compute_strategy(&run, &options), compute_strategy(&run, &options));
    }

    #[test]
    fn test_continue_mode_starts_at_current_index() {
        let strategy = compute_strategy(&sample_run(), &ResumeOptions::default());
        assert_eq!(strategy.start_index, 4);
        assert_eq!(strategy.mode, ResumeMode::Continue);
        assert!(strategy.skip.is_empty());
        assert!(strategy.retry.is_empty());
    }

    #[test]
    fn test_resume_from_last_successful_never_goes_backwards() {
        let mut run = sample_run();
        run.current_index = 1;
        let options = ResumeOptions {
            resume_from_last_successful: true,
            ..Default::default()
        };
        assert_eq!(compute_strategy(&run, &options).start_index, 3);
    }

    #[test]
    fn test_retry_plan_escalates_by_attempt_count() {
        let options = ResumeOptions {
            retry_failed: true,
            skip_failed: false,
            ..Default::default()
        };
        let strategy = compute_strategy(&sample_run(), &options);
        assert_eq!(strategy.mode, ResumeMode::RetryFailed);
        assert_eq!(
            strategy.retry,
            vec![
                RetryPlanEntry {
                    index: 1,
                    item_id: "q1".into(),
                    attempt_count: 2,
                    delay_ms: 120_000
                },
                RetryPlanEntry {
                    index: 3,
                    item_id: "q3".into(),
                    attempt_count: 1,
                    delay_ms: 60_000
                },
            ]
        );
    }

    #[test]
    fn test_retry_takes_precedence_over_skip() {
        let options = ResumeOptions {
            retry_failed: true,
            skip_failed: true,
            ..Default::default()
        };
        let strategy = compute_strategy(&sample_run(), &options);
        assert_eq!(strategy.mode, ResumeMode::RetryFailed);
        assert!(strategy.skip.is_empty());
        assert_eq!(strategy.retry.len(), 2);
    }

    #[test]
    fn test_skip_failed_builds_skip_set() {
        let options = ResumeOptions {
            skip_failed: true,
            ..Default::default()
        };
        let strategy = compute_strategy(&sample_run(), &options);
        assert_eq!(strategy.mode, ResumeMode::SkipFailed);
        assert_eq!(strategy.skip.into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_diff_reports_only_significant_fields() {
        let stored = BatchConfig::default();
        let mut next = stored.clone();
        next.max_concurrency = 9;
        assert!(diff_config(&stored, &next).is_empty());

        next.max_retries = 5;
        next.recovery_strategy = RecoveryStrategy::RetryAtEnd;
        let changes = diff_config(&stored, &next);
        assert_eq!(changes.len(), 2);
        assert!(changes[0].starts_with("maxRetries"));
    }

    struct FixedProbe(HandleState);

    #[async_trait]
    impl EnvironmentProbe for FixedProbe {
        async fn probe(&self, _handle_id: &str) -> HandleState {
            self.0
        }
    }

    fn external(required: bool, hours_ago: i64) -> ExternalRef {
        ExternalRef {
            handle_id: "page-1".into(),
            last_health_check: Utc::now() - chrono::Duration::hours(hours_ago),
            required,
        }
    }

    #[tokio::test]
    async fn test_environment_validation() {
        let now = Utc::now();

        let ok = validate_environment(Some(&external(true, 0)), Some(&FixedProbe(HandleState::Present)), now)
            .await
            .unwrap();
        assert!(ok.is_empty());

        let stale = validate_environment(Some(&external(false, 2)), None, now).await.unwrap();
        assert_eq!(stale.len(), 1);

        let missing = validate_environment(Some(&external(true, 0)), Some(&FixedProbe(HandleState::Missing)), now)
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);

        let optional = validate_environment(
            Some(&external(false, 0)),
            Some(&FixedProbe(HandleState::Unreachable)),
            now,
        )
        .await
        .unwrap();
        assert_eq!(optional.len(), 1);

        let required = validate_environment(
            Some(&external(true, 0)),
            Some(&FixedProbe(HandleState::Unreachable)),
            now,
        )
        .await;
        assert!(matches!(required, Err(CheckpointError::EnvironmentUnavailable(_))));
    }

    #[test]
    fn test_environment_without_external_handle_is_accepted() {
        let warnings = tokio_test::block_on(validate_environment(None, None, chrono::Utc::now())).unwrap();
        assert!(warnings.is_empty());
    }
}

//! 批处理报告

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::SessionReport;
use crate::models::{AnalysisOutput, BatchRun, Phase};

/// 单个条目的结果摘要（不含数据本身）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub index: usize,
    pub item_id: String,
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempt: u32,
    pub category: Option<String>,
}

/// 一条失败记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub index: usize,
    pub item_id: String,
    pub phase: Phase,
    pub attempt: u32,
    pub message: String,
}

/// 对所有结果的汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub mean_item_ms: f64,
    pub extracted_count: usize,
    pub analyzed_count: usize,
    /// 失败但保留了抓取数据的条目
    pub partial_failures: usize,
    pub categories: BTreeMap<String, usize>,
}

impl SummaryStats {
    pub fn from_run<D, O: AnalysisOutput>(run: &BatchRun<D, O>) -> Self {
        let mut stats = SummaryStats::default();
        let mut total_ms = 0u64;
        let mut timed = 0usize;

        for result in run.results.iter().filter(|r| !r.skipped) {
            total_ms += result.duration_ms;
            timed += 1;
            if result.extracted.is_some() {
                stats.extracted_count += 1;
            }
            if let Some(analysis) = &result.analysis {
                stats.analyzed_count += 1;
                if let Some(category) = analysis.category() {
                    *stats.categories.entry(category).or_insert(0) += 1;
                }
            }
            if !result.success && result.extracted.is_some() {
                stats.partial_failures += 1;
            }
        }

        if timed > 0 {
            stats.mean_item_ms = total_ms as f64 / timed as f64;
        }
        stats
    }
}

/// 批处理报告
///
/// 正常完成时由 `run` 返回；中止时附在错误里。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub run_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub errors: Vec<ItemError>,
    pub outcomes: Vec<ItemOutcome>,
    pub summary: SummaryStats,
    pub duration_ms: u64,
    pub metrics: SessionReport,
    /// 中止时写入的检查点
    pub checkpoint_id: Option<String>,
}

impl Report {
    pub fn build<D, O: AnalysisOutput>(
        run: &BatchRun<D, O>,
        duration_ms: u64,
        metrics: SessionReport,
        cancelled: bool,
    ) -> Self {
        let mut outcomes: Vec<ItemOutcome> = run
            .results
            .iter()
            .map(|r| ItemOutcome {
                index: r.index(),
                item_id: r.item.id.clone(),
                success: r.success,
                skipped: r.skipped,
                error: r.error.clone(),
                duration_ms: r.duration_ms,
                attempt: r.attempt,
                category: r.analysis.as_ref().and_then(|a| a.category()),
            })
            .collect();
        outcomes.sort_by_key(|o| o.index);

        let errors = run
            .failed_attempts
            .iter()
            .map(|a| ItemError {
                index: a.index,
                item_id: a.item_id.clone(),
                phase: a.phase,
                attempt: a.attempt,
                message: a.error.clone(),
            })
            .collect();

        Self {
            run_id: run.run_id.clone(),
            total: run.total_items(),
            succeeded: run.success_count(),
            failed: run.failure_count(),
            skipped: run.results.iter().filter(|r| r.skipped).count(),
            cancelled,
            errors,
            outcomes,
            summary: SummaryStats::from_run(run),
            duration_ms,
            metrics,
            checkpoint_id: None,
        }
    }

    /// 已经到达成功或失败终态的条目数
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Aborted,
}

/// 批处理结束通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub run_id: String,
    pub status: RunStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub checkpoint_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn from_report(report: &Report, status: RunStatus) -> Self {
        Self {
            run_id: report.run_id.clone(),
            status,
            total: report.total,
            succeeded: report.succeeded,
            failed: report.failed,
            duration_ms: report.duration_ms,
            checkpoint_id: report.checkpoint_id.clone(),
            at: Utc::now(),
        }
    }
}

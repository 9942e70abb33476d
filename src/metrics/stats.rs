//! 耗时聚合与健康指标
//!
//! 全部是纯函数，输入为只追加的 `OperationTiming` 日志和资源采样。

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MB: f64 = 1024.0 * 1024.0;

/// 内存泄漏判定窗口（最近 N 个采样）
pub const LEAK_WINDOW: usize = 10;
/// 平均增长超过该值视为疑似泄漏
pub const LEAK_THRESHOLD_BYTES: f64 = MB;
/// 置信度为 1.0 时对应的平均增长
const LEAK_FULL_CONFIDENCE_BYTES: f64 = 10.0 * MB;
/// 关键路径长度
pub const CRITICAL_PATH_LEN: usize = 5;

/// 一次操作的耗时记录，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTiming {
    pub id: String,
    pub kind: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub item_index: Option<usize>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// 按操作类型聚合的统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub kind: String,
    pub count: usize,
    pub total_ms: u64,
    pub mean_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub std_dev_ms: f64,
    pub success_rate: f64,
}

pub fn aggregate_by_kind(timings: &[OperationTiming]) -> Vec<OperationStats> {
    let mut grouped: BTreeMap<&str, Vec<&OperationTiming>> = BTreeMap::new();
    for timing in timings {
        grouped.entry(timing.kind.as_str()).or_default().push(timing);
    }

    grouped
        .into_iter()
        .map(|(kind, group)| {
            let count = group.len();
            let total_ms: u64 = group.iter().map(|t| t.duration_ms).sum();
            let mean_ms = total_ms as f64 / count as f64;
            let variance = group
                .iter()
                .map(|t| {
                    let d = t.duration_ms as f64 - mean_ms;
                    d * d
                })
                .sum::<f64>()
                / count as f64;
            let successes = group.iter().filter(|t| t.success).count();

            OperationStats {
                kind: kind.to_string(),
                count,
                total_ms,
                mean_ms,
                min_ms: group.iter().map(|t| t.duration_ms).min().unwrap_or(0),
                max_ms: group.iter().map(|t| t.duration_ms).max().unwrap_or(0),
                std_dev_ms: variance.sqrt(),
                success_rate: successes as f64 / count as f64,
            }
        })
        .collect()
}

/// 耗时分位数（毫秒）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

/// 已排序样本的分位数：`index = ceil(p/100 * n) - 1`，并夹到合法范围
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[index]
}

pub fn percentiles(timings: &[OperationTiming]) -> Option<Percentiles> {
    if timings.is_empty() {
        return None;
    }
    let mut durations: Vec<u64> = timings.iter().map(|t| t.duration_ms).collect();
    durations.sort_unstable();
    Some(Percentiles {
        p50: percentile(&durations, 50.0),
        p90: percentile(&durations, 90.0),
        p95: percentile(&durations, 95.0),
        p99: percentile(&durations, 99.0),
    })
}

/// 瓶颈等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    pub kind: String,
    pub mean_ms: f64,
    pub severity: Severity,
}

fn classify_mean(mean_ms: f64) -> Option<Severity> {
    if mean_ms > 60_000.0 {
        Some(Severity::Critical)
    } else if mean_ms > 30_000.0 {
        Some(Severity::High)
    } else if mean_ms > 15_000.0 {
        Some(Severity::Medium)
    } else {
        None
    }
}

/// 平均耗时超过阈值的操作类型，按严重程度降序
pub fn bottlenecks(stats: &[OperationStats]) -> Vec<Bottleneck> {
    let mut found: Vec<Bottleneck> = stats
        .iter()
        .filter_map(|s| {
            classify_mean(s.mean_ms).map(|severity| Bottleneck {
                kind: s.kind.clone(),
                mean_ms: s.mean_ms,
                severity,
            })
        })
        .collect();
    found.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(b.mean_ms.total_cmp(&a.mean_ms))
    });
    found
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalPathEntry {
    pub kind: String,
    /// `mean * count`
    pub weight_ms: f64,
}

/// 按 `mean * count` 取前 5 的操作类型
pub fn critical_path(stats: &[OperationStats]) -> Vec<CriticalPathEntry> {
    let mut entries: Vec<CriticalPathEntry> = stats
        .iter()
        .map(|s| CriticalPathEntry {
            kind: s.kind.clone(),
            weight_ms: s.mean_ms * s.count as f64,
        })
        .collect();
    entries.sort_by(|a, b| b.weight_ms.total_cmp(&a.weight_ms));
    entries.truncate(CRITICAL_PATH_LEN);
    entries
}

/// 处理速度档位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedBucket {
    #[default]
    Fast,
    Normal,
    Slow,
    Degraded,
}

pub fn speed_bucket(avg_per_item: Duration) -> SpeedBucket {
    match avg_per_item.as_secs_f64() {
        s if s < 30.0 => SpeedBucket::Fast,
        s if s < 60.0 => SpeedBucket::Normal,
        s if s < 120.0 => SpeedBucket::Slow,
        _ => SpeedBucket::Degraded,
    }
}

/// 资源采样
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub at: DateTime<Utc>,
    pub memory_bytes: u64,
    pub active_operations: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakAssessment {
    pub suspected: bool,
    /// 相邻采样平均增长（字节）
    pub mean_growth_bytes: f64,
    pub confidence: f64,
}

/// 最近 10 个采样的相邻差均值超过 1MB 即疑似泄漏
pub fn detect_leak(samples: &[ResourceSnapshot]) -> LeakAssessment {
    let window = &samples[samples.len().saturating_sub(LEAK_WINDOW)..];
    if window.len() < 2 {
        return LeakAssessment::default();
    }

    let deltas: Vec<f64> = window
        .windows(2)
        .map(|pair| pair[1].memory_bytes as f64 - pair[0].memory_bytes as f64)
        .collect();
    let mean_growth_bytes = deltas.iter().sum::<f64>() / deltas.len() as f64;
    let suspected = mean_growth_bytes > LEAK_THRESHOLD_BYTES;

    LeakAssessment {
        suspected,
        mean_growth_bytes,
        confidence: if suspected {
            (mean_growth_bytes / LEAK_FULL_CONFIDENCE_BYTES).min(1.0)
        } else {
            0.0
        },
    }
}

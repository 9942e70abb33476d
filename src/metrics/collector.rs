//! 指标收集器
//!
//! 记录一次批处理会话内的操作耗时、错误和资源采样，
//! 并实时给出健康指标。同时把耗时同步到 `metrics` 门面，
//! 方便接入 Prometheus 等导出器。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::stats::{
    aggregate_by_kind, bottlenecks, critical_path, detect_leak, percentiles, speed_bucket,
    Bottleneck, CriticalPathEntry, LeakAssessment, OperationStats, OperationTiming, Percentiles,
    ResourceSnapshot, SpeedBucket,
};

/// 整个条目处理的操作类型，用于计算单条平均耗时
pub const ITEM_OPERATION: &str = "item";

/// 保留的资源采样数量
const MAX_SNAPSHOTS: usize = 100;

/// 资源用量探测
pub trait ResourceProbe: Send + Sync {
    /// 当前进程常驻内存（字节）
    fn memory_bytes(&self) -> Option<u64>;
}

/// 读取 `/proc/self/statm` 的探测器，非 Linux 平台返回 `None`
pub struct ProcessProbe;

impl ResourceProbe for ProcessProbe {
    fn memory_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
}

/// 实时健康指标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveIndicators {
    pub avg_time_per_item_ms: f64,
    pub success_rate: f64,
    pub speed_bucket: SpeedBucket,
    pub error_rate: f64,
    /// 最近一次采样的内存（MB）
    pub resource_usage_mb: f64,
}

/// 错误记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// 会话结束时的汇总报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_operations: usize,
    pub operations: Vec<OperationStats>,
    pub percentiles: Option<Percentiles>,
    pub bottlenecks: Vec<Bottleneck>,
    pub critical_path: Vec<CriticalPathEntry>,
    pub errors_by_kind: BTreeMap<String, usize>,
    pub leak: LeakAssessment,
    pub indicators: LiveIndicators,
}

struct Session {
    id: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

struct PendingOperation {
    start: DateTime<Utc>,
    started: Instant,
}

#[derive(Default)]
struct CollectorState {
    session: Option<Session>,
    pending: HashMap<(String, String), PendingOperation>,
    timings: Vec<OperationTiming>,
    errors: Vec<ErrorRecord>,
    snapshots: VecDeque<ResourceSnapshot>,
}

/// 指标收集器
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
    probe: Box<dyn ResourceProbe>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_probe(Box::new(ProcessProbe))
    }

    pub fn with_probe(probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            state: Mutex::new(CollectorState::default()),
            probe,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 开始新会话，清空上一会话的数据
    pub fn start_session(&self, id: &str) {
        let mut state = self.lock();
        if let Some(previous) = &state.session {
            warn!("会话 {} 未结束，被 {} 覆盖", previous.id, id);
        }
        *state = CollectorState {
            session: Some(Session {
                id: id.to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
            }),
            ..Default::default()
        };
        drop(state);
        debug!("指标会话开始: {}", id);
        // 基线采样
        self.take_resource_snapshot();
    }

    /// 结束会话并生成报告
    pub fn end_session(&self) -> SessionReport {
        self.take_resource_snapshot();

        let mut state = self.lock();
        let report = build_report(&state);
        state.session = None;
        state.pending.clear();
        report
    }

    pub fn start_operation(&self, id: &str, kind: &str) {
        let mut state = self.lock();
        state.pending.insert(
            (id.to_string(), kind.to_string()),
            PendingOperation {
                start: Utc::now(),
                started: Instant::now(),
            },
        );
    }

    /// 结束操作并记录耗时
    ///
    /// `meta` 中的 `item_index` 会被解析为条目位置。
    pub fn end_operation(
        &self,
        id: &str,
        kind: &str,
        success: bool,
        meta: BTreeMap<String, String>,
    ) -> OperationTiming {
        let end = Utc::now();
        let mut state = self.lock();
        let pending = state.pending.remove(&(id.to_string(), kind.to_string()));
        let (start, duration) = match pending {
            Some(p) => (p.start, p.started.elapsed()),
            None => {
                warn!("操作 {}/{} 没有对应的开始记录", kind, id);
                (end, Duration::ZERO)
            }
        };

        let timing = OperationTiming {
            id: id.to_string(),
            kind: kind.to_string(),
            start,
            end,
            duration_ms: duration.as_millis() as u64,
            success,
            item_index: meta.get("item_index").and_then(|v| v.parse().ok()),
            metadata: meta,
        };
        state.timings.push(timing.clone());
        drop(state);

        metrics::histogram!("batch_operation_duration_seconds", "kind" => kind.to_string())
            .record(duration.as_secs_f64());
        metrics::counter!(
            "batch_operations_total",
            "kind" => kind.to_string(),
            "success" => success.to_string()
        )
        .increment(1);

        timing
    }

    pub fn record_error(&self, kind: &str, message: &str) {
        self.lock().errors.push(ErrorRecord {
            kind: kind.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
        metrics::counter!("batch_errors_total", "kind" => kind.to_string()).increment(1);
    }

    /// 采样一次资源用量
    pub fn take_resource_snapshot(&self) -> ResourceSnapshot {
        let memory_bytes = self.probe.memory_bytes().unwrap_or(0);
        let mut state = self.lock();
        let snapshot = ResourceSnapshot {
            at: Utc::now(),
            memory_bytes,
            active_operations: state.pending.len(),
        };
        state.snapshots.push_back(snapshot.clone());
        while state.snapshots.len() > MAX_SNAPSHOTS {
            state.snapshots.pop_front();
        }
        metrics::gauge!("batch_memory_bytes").set(memory_bytes as f64);
        snapshot
    }

    pub fn live_indicators(&self) -> LiveIndicators {
        compute_indicators(&self.lock())
    }

    pub fn leak_assessment(&self) -> LeakAssessment {
        let state = self.lock();
        let samples: Vec<ResourceSnapshot> = state.snapshots.iter().cloned().collect();
        detect_leak(&samples)
    }

    /// 当前会话的全部耗时记录
    pub fn timings(&self) -> Vec<OperationTiming> {
        self.lock().timings.clone()
    }

    pub fn operation_count(&self) -> usize {
        self.lock().timings.len()
    }

    pub fn error_count(&self) -> usize {
        self.lock().errors.len()
    }
}

fn compute_indicators(state: &CollectorState) -> LiveIndicators {
    let items: Vec<&OperationTiming> = state
        .timings
        .iter()
        .filter(|t| t.kind == ITEM_OPERATION)
        .collect();

    let avg_time_per_item_ms = if items.is_empty() {
        0.0
    } else {
        items.iter().map(|t| t.duration_ms as f64).sum::<f64>() / items.len() as f64
    };
    let success_rate = if items.is_empty() {
        1.0
    } else {
        items.iter().filter(|t| t.success).count() as f64 / items.len() as f64
    };
    let error_rate = if state.timings.is_empty() {
        0.0
    } else {
        state.errors.len() as f64 / state.timings.len() as f64
    };

    LiveIndicators {
        avg_time_per_item_ms,
        success_rate,
        speed_bucket: speed_bucket(Duration::from_millis(avg_time_per_item_ms as u64)),
        error_rate,
        resource_usage_mb: state
            .snapshots
            .back()
            .map(|s| s.memory_bytes as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0),
    }
}

fn build_report(state: &CollectorState) -> SessionReport {
    let ended_at = Utc::now();
    let (session_id, started_at, duration_ms) = match &state.session {
        Some(s) => (s.id.clone(), s.started_at, s.started.elapsed().as_millis() as u64),
        None => (String::new(), ended_at, 0),
    };

    let operations = aggregate_by_kind(&state.timings);
    let mut errors_by_kind = BTreeMap::new();
    for error in &state.errors {
        *errors_by_kind.entry(error.kind.clone()).or_insert(0) += 1;
    }
    let samples: Vec<ResourceSnapshot> = state.snapshots.iter().cloned().collect();

    SessionReport {
        session_id,
        started_at,
        ended_at,
        duration_ms,
        total_operations: state.timings.len(),
        percentiles: percentiles(&state.timings),
        bottlenecks: bottlenecks(&operations),
        critical_path: critical_path(&operations),
        operations,
        errors_by_kind,
        leak: detect_leak(&samples),
        indicators: compute_indicators(state),
    }
}

//! 进度推送

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::{LiveIndicators, MetricsCollector};
use crate::services::ProgressSink;
use crate::workflow::ItemState;

/// 一次进度更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub run_id: String,
    pub current_index: usize,
    pub total: usize,
    /// 已到终态的条目占比（0-100）
    pub percent_complete: f64,
    /// 本次执行中每个完成条目的平均耗时 × 剩余条目数
    pub estimated_time_remaining_ms: Option<u64>,
    pub item_state: ItemState,
    pub indicators: LiveIndicators,
}

impl Progress {
    pub fn initial(run_id: &str, total: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            current_index: 0,
            total,
            percent_complete: 0.0,
            estimated_time_remaining_ms: None,
            item_state: ItemState::Queued,
            indicators: LiveIndicators::default(),
        }
    }

    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        self.estimated_time_remaining_ms.map(Duration::from_millis)
    }
}

/// 维护进度计算所需的计数，并同步推送给接收方
pub(crate) struct ProgressReporter<'a> {
    run_id: String,
    total: usize,
    done: usize,
    item_durations_ms: Vec<u64>,
    sink: &'a dyn ProgressSink,
    metrics: Arc<MetricsCollector>,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(
        run_id: &str,
        total: usize,
        already_done: usize,
        sink: &'a dyn ProgressSink,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            total,
            done: already_done,
            item_durations_ms: Vec::new(),
            sink,
            metrics,
        }
    }

    /// 某个条目到达终态
    pub(crate) fn item_finished(&mut self, duration_ms: u64, newly_terminal: bool) {
        if newly_terminal {
            self.done = (self.done + 1).min(self.total);
        }
        self.item_durations_ms.push(duration_ms);
    }

    fn estimate_remaining_ms(&self) -> Option<u64> {
        if self.item_durations_ms.is_empty() {
            return None;
        }
        let mean = self.item_durations_ms.iter().sum::<u64>() / self.item_durations_ms.len() as u64;
        Some(mean * self.total.saturating_sub(self.done) as u64)
    }

    pub(crate) fn emit(&self, current_index: usize, item_state: ItemState) {
        let percent_complete = if self.total == 0 {
            100.0
        } else {
            self.done as f64 * 100.0 / self.total as f64
        };
        self.sink.on_progress(&Progress {
            run_id: self.run_id.clone(),
            current_index,
            total: self.total,
            percent_complete,
            estimated_time_remaining_ms: self.estimate_remaining_ms(),
            item_state,
            indicators: self.metrics.live_indicators(),
        });
    }
}

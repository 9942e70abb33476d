//! 优先级任务队列
//!
//! 按优先级出队、限制并发、失败后指数退避重试。
//! 所有共享状态放在同一把 `std::sync::Mutex` 里，锁从不跨越 `.await`。

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobId, JobInfo, JobStatus};
use crate::error::{AppError, QueueError};

/// 用于计算平均耗时的完成记录数
const HISTORY_LIMIT: usize = 50;
/// 完成记录和终态任务的保留时长
const RETENTION: Duration = Duration::from_secs(3600);

/// 队列配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_concurrency: usize,
    pub max_queue_size: usize,
    pub default_max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            max_queue_size: 100,
            default_max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl QueueConfig {
    /// 第 `retry_count` 次重试前的等待时间
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << exponent))
    }
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub awaiting_retry: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub average_duration_ms: Option<f64>,
    pub max_concurrency: usize,
}

struct QueueState<T> {
    queued: VecDeque<Job<T>>,
    active: HashSet<JobId>,
    retrying: HashMap<JobId, Job<T>>,
    records: HashMap<JobId, JobInfo>,
    history: VecDeque<(DateTime<Utc>, Duration)>,
    completed: usize,
    failed: usize,
    cancelled: usize,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            queued: VecDeque::new(),
            active: HashSet::new(),
            retrying: HashMap::new(),
            records: HashMap::new(),
            history: VecDeque::new(),
            completed: 0,
            failed: 0,
            cancelled: 0,
        }
    }
}

impl<T> QueueState<T> {
    /// 插到第一个优先级严格更低的任务之前，同级保持先进先出
    fn insert_by_priority(&mut self, job: Job<T>) {
        let position = self
            .queued
            .iter()
            .position(|queued| queued.priority.is_lower_than(job.priority))
            .unwrap_or(self.queued.len());
        self.queued.insert(position, job);
    }

    fn set_status(&mut self, id: &str, status: JobStatus) -> Option<&mut JobInfo> {
        let record = self.records.get_mut(id)?;
        record.status = status;
        match status {
            JobStatus::Processing => record.started_at = Some(Utc::now()),
            s if s.is_terminal() => record.finished_at = Some(Utc::now()),
            _ => {}
        }
        Some(record)
    }

    fn prune(&mut self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(RETENTION).unwrap_or_default();
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        while matches!(self.history.front(), Some((at, _)) if *at < cutoff) {
            self.history.pop_front();
        }
        self.records.retain(|_, record| {
            !(record.status.is_terminal() && record.finished_at.is_some_and(|at| at < cutoff))
        });
    }
}

struct Inner<T> {
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
    changed: Notify,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 优先级任务队列
///
/// 克隆得到的是同一个队列的句柄。
pub struct PriorityJobQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PriorityJobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> PriorityJobQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        info!(
            "📥 任务队列就绪 (并发: {}, 容量: {})",
            config.max_concurrency, config.max_queue_size
        );
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// 提交任务，必须在 tokio 运行时内调用
    pub fn submit(&self, mut job: Job<T>) -> Result<JobId, QueueError> {
        let id = job.id.clone();
        {
            let mut state = self.inner.lock();
            if state.queued.len() >= self.inner.config.max_queue_size {
                warn!("⚠️ 队列已满，拒绝任务 {}", id);
                return Err(QueueError::QueueFull {
                    max_queue_size: self.inner.config.max_queue_size,
                });
            }

            let max_retries = *job
                .max_retries
                .get_or_insert(self.inner.config.default_max_retries);
            state.records.insert(
                id.clone(),
                JobInfo {
                    id: id.clone(),
                    priority: job.priority,
                    status: JobStatus::Queued,
                    retry_count: 0,
                    max_retries,
                    created_at: job.created_at,
                    started_at: None,
                    finished_at: None,
                    last_error: None,
                },
            );
            debug!("任务入队: {} ({:?})", id, job.priority);
            state.insert_by_priority(job);
        }

        pump(&self.inner);
        Ok(id)
    }

    /// 取消排队中或等待重试的任务，执行中的任务不会被打断
    pub fn cancel(&self, id: &str) -> bool {
        let job = {
            let mut state = self.inner.lock();
            let job = match state.queued.iter().position(|job| job.id == id) {
                Some(position) => state.queued.remove(position),
                None => state.retrying.remove(id),
            };
            if job.is_some() {
                state.set_status(id, JobStatus::Cancelled);
                state.cancelled += 1;
            }
            job
        };

        match job {
            Some(job) => {
                info!("🚫 任务已取消: {}", id);
                job.cancel();
                self.inner.changed.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> Result<JobStatus, QueueError> {
        self.info(id).map(|info| info.status)
    }

    pub fn info(&self, id: &str) -> Result<JobInfo, QueueError> {
        self.inner
            .lock()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    /// 当前排队顺序
    pub fn queued_ids(&self) -> Vec<JobId> {
        self.inner.lock().queued.iter().map(|job| job.id.clone()).collect()
    }

    pub fn stats(&self) -> QueueStats {
        let mut state = self.inner.lock();
        state.prune();
        let average_duration_ms = if state.history.is_empty() {
            None
        } else {
            let total: f64 = state
                .history
                .iter()
                .map(|(_, d)| d.as_secs_f64() * 1000.0)
                .sum();
            Some(total / state.history.len() as f64)
        };
        QueueStats {
            queued: state.queued.len(),
            processing: state.active.len(),
            awaiting_retry: state.retrying.len(),
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            average_duration_ms,
            max_concurrency: self.inner.config.max_concurrency,
        }
    }

    /// 等待任务进入终态
    pub async fn wait(&self, id: &str) -> Result<JobStatus, QueueError> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.status(id)?;
            if status.is_terminal() {
                return Ok(status);
            }
            notified.await;
        }
    }

    /// 等待队列清空（没有排队、执行中或等待重试的任务）
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.lock();
                if state.queued.is_empty() && state.active.is_empty() && state.retrying.is_empty()
                {
                    return;
                }
            }
            notified.await;
        }
    }
}

/// 在并发上限内尽量多地派发排队任务
fn pump<T: Send + 'static>(inner: &Arc<Inner<T>>) {
    let dispatched: Vec<Job<T>> = {
        let mut state = inner.lock();
        let mut batch = Vec::new();
        while state.active.len() < inner.config.max_concurrency {
            let Some(job) = state.queued.pop_front() else {
                break;
            };
            state.active.insert(job.id.clone());
            state.set_status(&job.id, JobStatus::Processing);
            batch.push(job);
        }
        batch
    };

    for job in dispatched {
        debug!("▶️ 开始执行任务 {}", job.id);
        tokio::spawn(execute(inner.clone(), job));
    }
}

async fn execute<T: Send + 'static>(inner: Arc<Inner<T>>, mut job: Job<T>) {
    let started = Instant::now();
    // panic 按一次失败处理，保证槽位释放
    let outcome = match AssertUnwindSafe((job.work)()).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(AppError::Other(format!("任务 panic: {}", panic_message(panic.as_ref())))),
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(value) => {
            {
                let mut state = inner.lock();
                state.active.remove(&job.id);
                state.set_status(&job.id, JobStatus::Completed);
                state.completed += 1;
                state.history.push_back((Utc::now(), elapsed));
                state.prune();
            }
            debug!("✅ 任务完成 {} ({} ms)", job.id, elapsed.as_millis());
            job.complete(value);
        }
        Err(e) => {
            let message = e.to_string();
            let max_retries = job.max_retries.unwrap_or(inner.config.default_max_retries);
            let id = job.id.clone();

            if job.retry_count < max_retries {
                job.retry_count += 1;
                let attempt = job.retry_count;
                let delay = inner.config.retry_delay(attempt);
                {
                    let mut state = inner.lock();
                    state.active.remove(&id);
                    if let Some(record) = state.set_status(&id, JobStatus::Queued) {
                        record.retry_count = attempt;
                        record.last_error = Some(message.clone());
                    }
                    state.retrying.insert(id.clone(), job);
                }
                warn!(
                    "🔄 任务 {} 失败，{} ms 后第 {}/{} 次重试: {}",
                    id,
                    delay.as_millis(),
                    attempt,
                    max_retries,
                    message
                );
                tokio::spawn(requeue_after(inner.clone(), id, delay));
            } else {
                {
                    let mut state = inner.lock();
                    state.active.remove(&id);
                    if let Some(record) = state.set_status(&id, JobStatus::Failed) {
                        record.last_error = Some(message.clone());
                    }
                    state.failed += 1;
                }
                error!("❌ 任务 {} 最终失败: {}", id, message);
                job.fail(QueueError::JobFailed {
                    job_id: id,
                    message,
                });
            }
        }
    }

    inner.changed.notify_waiters();
    pump(&inner);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "未知原因"
    }
}

async fn requeue_after<T: Send + 'static>(inner: Arc<Inner<T>>, id: JobId, delay: Duration) {
    tokio::time::sleep(delay).await;
    let requeued = {
        let mut state = inner.lock();
        match state.retrying.remove(&id) {
            Some(job) => {
                state.insert_by_priority(job);
                true
            }
            // 等待期间被取消
            None => false,
        }
    };
    if requeued {
        pump(&inner);
    }
}

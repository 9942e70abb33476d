//! 队列任务定义

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{AppResult, QueueError};

pub type JobId = String;

/// 任务优先级，数值越小越先出队
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// `self` 是否严格低于 `other`
    pub fn is_lower_than(self, other: Priority) -> bool {
        self > other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// 任务的可观察状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: JobId,
    pub priority: Priority,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type WorkFn<T> = Box<dyn Fn() -> BoxFuture<'static, AppResult<T>> + Send + Sync>;
type CompleteFn<T> = Box<dyn FnOnce(&T) + Send>;
type FailureFn = Box<dyn FnOnce(&str) + Send>;

/// 一个可重复执行的工作单元
///
/// 工作函数每次重试都会重新调用，因此是 `Fn` 而不是 `FnOnce`。
pub struct Job<T> {
    pub(crate) id: JobId,
    pub(crate) priority: Priority,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: Option<u32>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) work: WorkFn<T>,
    pub(crate) on_complete: Option<CompleteFn<T>>,
    pub(crate) on_failure: Option<FailureFn>,
    pub(crate) completion: Option<oneshot::Sender<Result<T, QueueError>>>,
}

impl<T: Send + 'static> Job<T> {
    pub fn new<F, Fut>(priority: Priority, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            priority,
            retry_count: 0,
            max_retries: None,
            created_at: Utc::now(),
            work: Box::new(move || work().boxed()),
            on_complete: None,
            on_failure: None,
            completion: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    /// 不设置时使用队列的默认重试次数
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn on_complete(mut self, callback: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn on_failure(mut self, callback: impl FnOnce(&str) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// 附加一个完成通道，任务终结（成功、最终失败或取消）时收到结果
    pub fn with_completion(mut self) -> (Self, oneshot::Receiver<Result<T, QueueError>>) {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        (self, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl<T> Job<T> {
    pub(crate) fn complete(mut self, value: T) {
        if let Some(callback) = self.on_complete.take() {
            callback(&value);
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Ok(value));
        }
    }

    pub(crate) fn fail(mut self, error: QueueError) {
        if let Some(callback) = self.on_failure.take() {
            callback(&error.to_string());
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(error));
        }
    }

    pub(crate) fn cancel(mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(QueueError::Cancelled(self.id.clone())));
        }
    }
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

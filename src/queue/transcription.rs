//! 转写任务队列
//!
//! 把 `TranscriptionEngine` 调用包装成优先级任务，限制对转写服务的并发请求。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::info;

use super::job::{Job, JobId, Priority};
use super::priority_queue::{PriorityJobQueue, QueueConfig, QueueStats};
use crate::error::{AppError, QueueError};
use crate::services::{AudioBlob, TranscriptionEngine};

pub struct TranscriptionQueue {
    queue: PriorityJobQueue<String>,
    engine: Arc<dyn TranscriptionEngine>,
    timeout: Duration,
}

impl TranscriptionQueue {
    pub fn new(engine: Arc<dyn TranscriptionEngine>, config: QueueConfig, timeout: Duration) -> Self {
        Self {
            queue: PriorityJobQueue::new(config),
            engine,
            timeout,
        }
    }

    /// 提交一段音频，返回任务 id 和结果接收端
    pub fn submit(
        &self,
        audio: AudioBlob,
        priority: Priority,
    ) -> Result<(JobId, oneshot::Receiver<Result<String, QueueError>>), QueueError> {
        let engine = self.engine.clone();
        let timeout = self.timeout;
        let file_name = audio.file_name.clone();
        let audio = Arc::new(audio);

        let (job, rx) = Job::new(priority, move || {
            let engine = engine.clone();
            let audio = audio.clone();
            async move {
                engine
                    .transcribe((*audio).clone(), timeout)
                    .await
                    .map_err(AppError::from)
            }
        })
        .with_completion();

        let id = self.queue.submit(job)?;
        info!("🎙️ 转写任务已提交: {} ({})", file_name, id);
        Ok((id, rx))
    }

    /// 提交并等待转写结果
    pub async fn transcribe(&self, audio: AudioBlob, priority: Priority) -> Result<String, QueueError> {
        let (id, rx) = self.submit(audio, priority)?;
        rx.await.unwrap_or(Err(QueueError::Cancelled(id)))
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.queue.cancel(id)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queue(&self) -> &PriorityJobQueue<String> {
        &self.queue
    }
}

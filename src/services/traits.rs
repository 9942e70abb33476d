//! 外部能力接口
//!
//! 编排层只通过这些 trait 访问外部世界：
//! - `ItemDataSource`：定位并抓取条目数据（只有一个可变的"当前位置"）
//! - `AnalysisEngine`：对抓取结果做远程分析
//! - `TranscriptionEngine`：音频转写（任务队列的转写实例使用）
//! - `PersistentStore`：通用键值持久化
//! - `ProgressSink` / `NotificationSink`：只发不收的观察者
//! - `EnvironmentProbe`：恢复前检查外部句柄是否还在

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{CapabilityError, StoreError};
use crate::models::{AnalysisOutput, ExternalRef, ItemRef, Payload};
use crate::orchestrator::progress::Progress;
use crate::orchestrator::report::CompletionEvent;

/// 条目数据源
///
/// 数据源只暴露一个共享游标，调用方必须保证不会并发调用 `activate` / `extract`。
#[async_trait]
pub trait ItemDataSource: Send + Sync {
    /// 抓取得到的中间数据
    type Data: Payload;

    /// 将游标移动到指定条目
    async fn activate(&self, item: &ItemRef) -> Result<(), CapabilityError>;

    /// 外部系统当前在 `index` 位置的条目标识，用于漂移校验
    async fn item_id_at(&self, index: usize) -> Result<Option<String>, CapabilityError>;

    /// 抓取当前条目的数据
    async fn extract(&self, item: &ItemRef) -> Result<Self::Data, CapabilityError>;

    /// 批处理结束时释放资源
    async fn cleanup(&self) {}

    /// 外部句柄（写入检查点，恢复时校验）
    fn external_ref(&self) -> Option<ExternalRef> {
        None
    }
}

/// 分析引擎
#[async_trait]
pub trait AnalysisEngine<D: Payload>: Send + Sync {
    type Output: AnalysisOutput;

    async fn analyze(&self, data: &D) -> Result<Self::Output, CapabilityError>;
}

/// 待转写的音频
#[derive(Debug, Clone)]
pub struct AudioBlob {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AudioBlob {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: "application/octet-stream".to_string(),
            bytes,
        }
    }
}

/// 音频转写引擎
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    async fn transcribe(&self, audio: AudioBlob, timeout: Duration) -> Result<String, CapabilityError>;
}

/// 通用键值持久化
///
/// 检查点管理器对存储只做 get / set / remove / list 四种假设。
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// 写入必须是原子的：要么完整可见，要么保持旧值
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// 返回键是否存在
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// 进度接收方
///
/// 同步调用，实现方不能阻塞。
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &Progress);
}

/// 丢弃所有进度
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_progress(&self, _progress: &Progress) {}
}

/// 把闭包包装成进度接收方
pub struct FnProgress<F>(pub F);

impl<F> ProgressSink for FnProgress<F>
where
    F: Fn(&Progress) + Send + Sync,
{
    fn on_progress(&self, progress: &Progress) {
        (self.0)(progress)
    }
}

/// 通过无界通道推送进度，发送永远不会阻塞
impl ProgressSink for UnboundedSender<Progress> {
    fn on_progress(&self, progress: &Progress) {
        // 接收端已关闭时直接丢弃
        let _ = self.send(progress.clone());
    }
}

/// 完成通知
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &CompletionEvent);
}

impl NotificationSink for UnboundedSender<CompletionEvent> {
    fn notify(&self, event: &CompletionEvent) {
        let _ = self.send(event.clone());
    }
}

/// 外部句柄状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// 句柄仍然可用
    Present,
    /// 外部系统可达，但句柄已经不存在
    Missing,
    /// 外部系统完全不可达
    Unreachable,
}

/// 外部环境探测
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    async fn probe(&self, handle_id: &str) -> HandleState;
}

#[cfg(test)]
mod tests {
    use super::*;

    // 这些 trait 需要能作为 `dyn Trait` 使用
    #[test]
    fn traits_are_object_safe() {
        fn _assert_store(_: &dyn PersistentStore) {}
        fn _assert_progress(_: &dyn ProgressSink) {}
        fn _assert_notify(_: &dyn NotificationSink) {}
        fn _assert_probe(_: &dyn EnvironmentProbe) {}
        fn _assert_transcribe(_: &dyn TranscriptionEngine) {}
        fn _assert_source(_: &dyn ItemDataSource<Data = String>) {}
        fn _assert_engine(_: &dyn AnalysisEngine<String, Output = String>) {}
    }

    #[test]
    fn test_channel_sink_does_not_block_after_close() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Progress>();
        drop(rx);
        tx.on_progress(&Progress::initial("run", 3));
    }
}

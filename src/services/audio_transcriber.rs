//! 条目音频转写 - 业务能力层
//!
//! 抓取到的字段里带有音频地址时，下载音频并经由转写队列得到文字，
//! 写回 `transcript` 字段，供后续分析使用。

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{CapabilityError, QueueError};
use crate::queue::{Priority, TranscriptionQueue};
use crate::services::traits::AudioBlob;

/// 存放音频地址的字段（页面上 `<audio>` / `<video>` 的 src）
pub const AUDIO_FIELD: &str = "audio";
/// 转写结果写入的字段
pub const TRANSCRIPT_FIELD: &str = "transcript";

pub struct AudioTranscriber {
    http: reqwest::Client,
    queue: Arc<TranscriptionQueue>,
}

impl AudioTranscriber {
    pub fn new(queue: Arc<TranscriptionQueue>) -> Self {
        Self {
            http: reqwest::Client::new(),
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<TranscriptionQueue> {
        &self.queue
    }

    /// 有音频地址且还没有转写结果时补上 `transcript`
    pub async fn enrich(&self, fields: &mut BTreeMap<String, String>) -> Result<(), CapabilityError> {
        if fields.contains_key(TRANSCRIPT_FIELD) {
            return Ok(());
        }
        let Some(src) = fields
            .get(AUDIO_FIELD)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        else {
            return Ok(());
        };

        let audio = self.download(&src).await?;
        debug!("🎙️ 下载音频 {} ({} bytes)", audio.file_name, audio.bytes.len());
        let text = self
            .queue
            .transcribe(audio, Priority::High)
            .await
            .map_err(queue_error)?;
        info!("🎙️ 转写完成: {} 字", text.chars().count());

        fields.insert(TRANSCRIPT_FIELD.to_string(), text);
        Ok(())
    }

    async fn download(&self, src: &str) -> Result<AudioBlob, CapabilityError> {
        let file_name = file_name_of(src);
        if let Some(path) = src.strip_prefix("file://") {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| CapabilityError::NotFound(format!("读取音频 {} 失败: {}", path, e)))?;
            return Ok(AudioBlob::new(file_name, bytes));
        }

        let response = self
            .http
            .get(src)
            .send()
            .await
            .map_err(|e| CapabilityError::Unavailable(format!("下载音频失败: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("下载音频 {} 返回 {}", src, status);
            return Err(if status.is_server_error() {
                CapabilityError::Unavailable(message)
            } else {
                CapabilityError::NotFound(message)
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CapabilityError::Unavailable(format!("读取音频内容失败: {}", e)))?;
        Ok(AudioBlob::new(file_name, bytes.to_vec()))
    }
}

/// 队列已经做过重试，这里只区分取消和失败
fn queue_error(err: QueueError) -> CapabilityError {
    match err {
        QueueError::QueueFull { .. } => CapabilityError::Unavailable(err.to_string()),
        other => CapabilityError::Failed(format!("转写失败: {}", other)),
    }
}

/// 地址最后一段作为文件名，去掉查询参数
fn file_name_of(src: &str) -> String {
    let path = src.split(['?', '#']).next().unwrap_or(src);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("audio")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::services::traits::TranscriptionEngine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TranscriptionEngine for CountingEngine {
        async fn transcribe(&self, audio: AudioBlob, _timeout: Duration) -> Result<String, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} 共 {} 字节", audio.file_name, audio.bytes.len()))
        }
    }

    fn transcriber() -> (AudioTranscriber, Arc<CountingEngine>) {
        let engine = Arc::new(CountingEngine::default());
        let queue = TranscriptionQueue::new(engine.clone(), QueueConfig::default(), Duration::from_secs(5));
        (AudioTranscriber::new(Arc::new(queue)), engine)
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of("https://host/media/dictation-7.wav?token=1"), "dictation-7.wav");
        assert_eq!(file_name_of("file:///tmp/a/b.mp3"), "b.mp3");
        assert_eq!(file_name_of("https://host/"), "host");
    }

    #[tokio::test]
    async fn test_local_audio_is_transcribed_into_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.wav");
        std::fs::write(&path, vec![7u8; 32]).unwrap();

        let (transcriber, engine) = transcriber();
        let mut fields = BTreeMap::from([
            ("title".to_string(), "病例 1".to_string()),
            (AUDIO_FIELD.to_string(), format!("file://{}", path.display())),
        ]);
        transcriber.enrich(&mut fields).await.unwrap();

        assert_eq!(fields.get(TRANSCRIPT_FIELD).map(String::as_str), Some("note.wav 共 32 字节"));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transcriber.queue().stats().completed, 1);
    }

    #[tokio::test]
    async fn test_fields_without_audio_are_left_alone() {
        let (transcriber, engine) = transcriber();
        let mut fields = BTreeMap::from([
            ("title".to_string(), "病例 2".to_string()),
            (AUDIO_FIELD.to_string(), "  ".to_string()),
        ]);
        let before = fields.clone();

        transcriber.enrich(&mut fields).await.unwrap();

        assert_eq!(fields, before);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_local_audio_fails_the_item() {
        let (transcriber, engine) = transcriber();
        let mut fields = BTreeMap::from([(AUDIO_FIELD.to_string(), "file:///no/such/audio.wav".to_string())]);

        let result = transcriber.enrich(&mut fields).await;

        assert!(matches!(result, Err(CapabilityError::NotFound(_))));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }
}

//! Whisper 转写客户端 - 业务能力层
//!
//! 以 multipart 表单上传音频，读取 JSON 回复里的 `text` 字段。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::CapabilityError;
use crate::services::traits::{AudioBlob, TranscriptionEngine};

/// 兼容 Whisper HTTP 接口的转写客户端
pub struct WhisperHttpClient {
    http: reqwest::Client,
    endpoint: String,
    model: Option<String>,
}

impl WhisperHttpClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: None,
        }
    }

    /// OpenAI 风格的接口需要 `model` 字段
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// 429 和 5xx 可以重试，其余非成功状态直接失败
fn classify_status(status: StatusCode, body: &str) -> Result<(), CapabilityError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("转写服务返回 {}: {}", status, body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(CapabilityError::Unavailable(message))
    } else {
        Err(CapabilityError::Failed(message))
    }
}

fn extract_text(body: &str) -> Result<String, CapabilityError> {
    let json: JsonValue =
        serde_json::from_str(body).map_err(|e| CapabilityError::InvalidResponse(format!("转写结果不是 JSON: {}", e)))?;
    json.get("text")
        .and_then(|v| v.as_str())
        .map(|text| text.trim().to_string())
        .ok_or_else(|| CapabilityError::InvalidResponse("转写结果缺少 text 字段".to_string()))
}

#[async_trait]
impl TranscriptionEngine for WhisperHttpClient {
    async fn transcribe(&self, audio: AudioBlob, timeout: Duration) -> Result<String, CapabilityError> {
        let size = audio.bytes.len();
        let part = Part::bytes(audio.bytes)
            .file_name(audio.file_name.clone())
            .mime_str(&audio.mime_type)
            .map_err(|e| CapabilityError::Failed(format!("音频类型无效: {}", e)))?;
        let mut form = Form::new().part("file", part).text("response_format", "json");
        if let Some(model) = &self.model {
            form = form.text("model", model.clone());
        }

        debug!("上传音频 {} ({} 字节) 到 {}", audio.file_name, size, self.endpoint);
        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CapabilityError::timeout("transcribe", timeout)
                } else {
                    CapabilityError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        classify_status(status, &body)?;
        extract_text(&body)
    }
}

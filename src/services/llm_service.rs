//! LLM 分析引擎 - 业务能力层
//!
//! 只负责"把一份抓取结果交给 LLM 分析"，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务

use std::sync::OnceLock;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::CapabilityError;
use crate::models::{AnalysisOutput, Payload};
use crate::services::traits::AnalysisEngine;

const DEFAULT_SYSTEM_PROMPT: &str = "你是一个数据分析助手。你会收到一条 JSON 格式的记录，\
请给出它的分类和简短分析。只返回 JSON：\
{\"category\": \"分类\", \"confidence\": 0到1之间的数字, \"content\": \"分析内容\"}";

/// LLM 的分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmAnalysis {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub content: String,
}

impl AnalysisOutput for LlmAnalysis {
    fn category(&self) -> Option<String> {
        self.category.clone()
    }
}

impl LlmAnalysis {
    /// 解析 LLM 回复
    ///
    /// 优先按 JSON 解析（允许外面包着 markdown 代码块或说明文字），
    /// 实在解析不了就把原文当作分析内容。
    pub fn parse(response: &str) -> Self {
        let trimmed = response.trim();
        let json = serde_json::from_str::<JsonValue>(trimmed).ok().or_else(|| {
            json_object_pattern()
                .and_then(|re| re.find(trimmed))
                .and_then(|m| serde_json::from_str::<JsonValue>(m.as_str()).ok())
        });

        match json {
            Some(JsonValue::Object(map)) => Self {
                category: map.get("category").and_then(|v| v.as_str()).map(str::to_string),
                confidence: map.get("confidence").and_then(|v| v.as_f64()),
                content: map
                    .get("content")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| trimmed.to_string()),
            },
            _ => Self {
                category: None,
                confidence: None,
                content: trimmed.to_string(),
            },
        }
    }
}

/// 回复中第一个 `{` 到最后一个 `}` 之间的内容
fn json_object_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{.*\}").ok()).as_ref()
}

/// LLM 分析引擎
///
/// 职责：
/// - 把任意可序列化的抓取结果发给 LLM
/// - 解析回复为 `LlmAnalysis`
/// - 不出现批次 / 条目位置
pub struct LlmAnalysisEngine {
    client: Client<OpenAIConfig>,
    model_name: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmAnalysisEngine {
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.3,
            max_tokens: 1024,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// 通用的 LLM 调用
    pub async fn send_to_llm(&self, user_message: &str) -> Result<String, CapabilityError> {
        debug!("调用 LLM API，模型: {}, 消息长度: {} 字符", self.model_name, user_message.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(self.system_prompt.as_str())
            .build()
            .map_err(map_openai_error)?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(map_openai_error)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(map_openai_error)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            map_openai_error(e)
        })?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| CapabilityError::InvalidResponse("LLM 返回内容为空".to_string()))
    }
}

/// API 自身拒绝的请求不值得重试，网络层错误按暂时不可用处理
fn map_openai_error(err: OpenAIError) -> CapabilityError {
    match err {
        OpenAIError::ApiError(e) => CapabilityError::Failed(format!("LLM API 拒绝请求: {}", e)),
        OpenAIError::InvalidArgument(msg) => CapabilityError::Failed(msg),
        other => CapabilityError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl<D: Payload> AnalysisEngine<D> for LlmAnalysisEngine {
    type Output = LlmAnalysis;

    async fn analyze(&self, data: &D) -> Result<LlmAnalysis, CapabilityError> {
        let record = serde_json::to_string_pretty(data)
            .map_err(|e| CapabilityError::Failed(format!("记录无法序列化: {}", e)))?;
        let response = self.send_to_llm(&format!("记录：\n{}", record)).await?;
        Ok(LlmAnalysis::parse(&response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let analysis = LlmAnalysis::parse(r#"{"category": "数学", "confidence": 0.9, "content": "二次函数"}"#);
        assert_eq!(analysis.category.as_deref(), Some("数学"));
        assert_eq!(analysis.confidence, Some(0.9));
        assert_eq!(analysis.content, "二次函数");
    }

    #[test]
    fn test_parse_json_inside_code_fence() {
        let response = "好的，结果如下：\n```json\n{\"category\": \"物理\"}\n```";
        let analysis = LlmAnalysis::parse(response);
        assert_eq!(analysis.category.as_deref(), Some("物理"));
        assert_eq!(analysis.confidence, None);
        // 没有 content 字段时保留原文
        assert_eq!(analysis.content, response.trim());
    }

    #[test]
    fn test_parse_falls_back_to_raw_text() {
        let analysis = LlmAnalysis::parse("  无法判断  ");
        assert_eq!(analysis.category, None);
        assert_eq!(analysis.content, "无法判断");
    }

    /// 需要真实的 API 配置：cargo test test_llm_api_connectivity -- --ignored --nocapture
    #[tokio::test]
    #[ignore]
    async fn test_llm_api_connectivity() {
        let engine = LlmAnalysisEngine::new(&Config::from_env().expect("配置加载失败"));
        let data = serde_json::json!({"title": "1+1 等于几？"});
        let analysis = AnalysisEngine::<serde_json::Value>::analyze(&engine, &data)
            .await
            .expect("LLM 调用失败");
        println!("{:?}", analysis);
        assert!(!analysis.content.is_empty());
    }
}

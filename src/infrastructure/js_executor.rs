//! JS 执行器 - 基础设施层
//!
//! 持有唯一的 page 资源，只暴露"执行 JS"的能力

use std::time::Duration;

use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::CapabilityError;

/// JS 执行器
///
/// 职责：
/// - 持有唯一的 Page 资源
/// - 暴露 eval() 能力
/// - 不认识条目 / 批次
/// - 不处理业务流程
pub struct JsExecutor {
    page: Page,
}

impl JsExecutor {
    /// 创建新的 JS 执行器
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// 页面对应的 target id，作为检查点里的外部句柄
    pub fn handle_id(&self) -> String {
        self.page.target_id().inner().clone()
    }

    /// 执行 JS 代码并返回 JSON 结果
    pub async fn eval(&self, js_code: impl Into<String>) -> Result<JsonValue, CapabilityError> {
        let result = self.page.evaluate(js_code.into()).await?;
        result
            .into_value()
            .map_err(|e| CapabilityError::InvalidResponse(e.to_string()))
    }

    /// 带超时地执行 JS
    pub async fn eval_with_timeout(
        &self,
        js_code: impl Into<String>,
        timeout: Duration,
    ) -> Result<JsonValue, CapabilityError> {
        match tokio::time::timeout(timeout, self.eval(js_code)).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::timeout("js_eval", timeout)),
        }
    }

    /// 执行 JS 代码并反序列化为指定类型
    pub async fn eval_as<T: DeserializeOwned>(
        &self,
        js_code: impl Into<String>,
        timeout: Duration,
    ) -> Result<T, CapabilityError> {
        let json_value = self.eval_with_timeout(js_code, timeout).await?;
        serde_json::from_value(json_value).map_err(|e| CapabilityError::InvalidResponse(e.to_string()))
    }
}

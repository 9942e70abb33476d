//! 浏览器页面数据源 - 业务能力层
//!
//! 把一个已经打开的页面当作条目列表：页面上按顺序排列的元素就是条目，
//! "激活"就是点击第 `index` 个元素，"抓取"就是读出当前条目的字段。
//!
//! 字段里带有音频地址时，可以挂一个 [`AudioTranscriber`] 把音频转成文字。
//!
//! 三段 JS 脚本都可以替换，模板里的 `{index}` 会被替换成条目位置，
//! `{id}` 会被替换成 JSON 字符串字面量形式的条目标识。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::CapabilityError;
use crate::infrastructure::JsExecutor;
use crate::models::{ExternalRef, ItemRef};
use crate::services::audio_transcriber::AudioTranscriber;
use crate::services::traits::ItemDataSource;

const DEFAULT_ACTIVATE_JS: &str = r#"
(() => {
    const el = document.querySelectorAll('[data-item-id]')[{index}];
    if (!el) return false;
    el.scrollIntoView({ block: 'center' });
    el.click();
    return true;
})()
"#;

const DEFAULT_ITEM_ID_AT_JS: &str = r#"
(() => {
    const el = document.querySelectorAll('[data-item-id]')[{index}];
    return el ? el.getAttribute('data-item-id') : null;
})()
"#;

const DEFAULT_EXTRACT_JS: &str = r#"
(() => {
    const root = document.querySelector('[data-item-id=' + JSON.stringify({id}) + ']');
    if (!root) return null;
    const fields = {};
    root.querySelectorAll('[data-field]').forEach(node => {
        const media = node.tagName === 'AUDIO' || node.tagName === 'VIDEO';
        fields[node.getAttribute('data-field')] = media
            ? (node.currentSrc || node.src || '')
            : (node.innerText || '').trim();
    });
    return fields;
})()
"#;

/// 页面脚本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageScripts {
    /// 返回 `true` 表示激活成功
    pub activate: String,
    /// 返回该位置条目的标识或 `null`
    pub item_id_at: String,
    /// 返回 `{字段名: 文本}` 或 `null`，媒体元素取其 src
    pub extract: String,
}

impl Default for PageScripts {
    fn default() -> Self {
        Self {
            activate: DEFAULT_ACTIVATE_JS.to_string(),
            item_id_at: DEFAULT_ITEM_ID_AT_JS.to_string(),
            extract: DEFAULT_EXTRACT_JS.to_string(),
        }
    }
}

impl PageScripts {
    /// 用条目信息填充模板
    pub fn render(template: &str, index: usize, id: Option<&str>) -> String {
        let mut js = template.replace("{index}", &index.to_string());
        if let Some(id) = id {
            let literal = serde_json::to_string(id).unwrap_or_else(|_| "\"\"".to_string());
            js = js.replace("{id}", &literal);
        }
        js
    }
}

/// 一次抓取得到的页面快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    pub item_id: String,
    pub fields: BTreeMap<String, String>,
    pub captured_at: DateTime<Utc>,
}

/// 浏览器页面数据源
///
/// 页面只有一个，所以同一时刻只能有一个条目处于激活状态。
pub struct BrowserItemSource {
    executor: Arc<JsExecutor>,
    scripts: PageScripts,
    /// 点击后等待页面渲染的时间
    settle_delay: Duration,
    /// 抓取和清理脚本的超时
    eval_timeout: Duration,
    transcriber: Option<AudioTranscriber>,
}

impl BrowserItemSource {
    pub fn new(executor: Arc<JsExecutor>) -> Self {
        Self {
            executor,
            scripts: PageScripts::default(),
            settle_delay: Duration::from_millis(300),
            eval_timeout: Duration::from_secs(10),
            transcriber: None,
        }
    }

    pub fn with_scripts(mut self, scripts: PageScripts) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_transcriber(mut self, transcriber: AudioTranscriber) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn executor(&self) -> &Arc<JsExecutor> {
        &self.executor
    }
}

#[async_trait]
impl ItemDataSource for BrowserItemSource {
    type Data = PageSnapshot;

    async fn activate(&self, item: &ItemRef) -> Result<(), CapabilityError> {
        let js = PageScripts::render(&self.scripts.activate, item.index, Some(&item.id));
        match self.executor.eval(js).await? {
            JsonValue::Bool(true) => {
                tokio::time::sleep(self.settle_delay).await;
                Ok(())
            }
            _ => Err(CapabilityError::NotFound(format!(
                "页面上找不到第 {} 个条目",
                item.index + 1
            ))),
        }
    }

    async fn item_id_at(&self, index: usize) -> Result<Option<String>, CapabilityError> {
        let js = PageScripts::render(&self.scripts.item_id_at, index, None);
        match self.executor.eval(js).await? {
            JsonValue::Null => Ok(None),
            JsonValue::String(id) => Ok(Some(id)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn extract(&self, item: &ItemRef) -> Result<PageSnapshot, CapabilityError> {
        let js = PageScripts::render(&self.scripts.extract, item.index, Some(&item.id));
        let raw: Option<BTreeMap<String, JsonValue>> = self.executor.eval_as(js, self.eval_timeout).await?;
        let Some(raw) = raw else {
            return Err(CapabilityError::NotFound(format!("条目 {} 没有可抓取的内容", item.id)));
        };

        let mut fields = raw
            .into_iter()
            .map(|(key, value)| match value {
                JsonValue::String(text) => (key, text),
                other => (key, other.to_string()),
            })
            .collect::<BTreeMap<_, _>>();
        debug!("抓取条目 {}: {} 个字段", item.id, fields.len());

        if let Some(transcriber) = &self.transcriber {
            transcriber.enrich(&mut fields).await?;
        }

        Ok(PageSnapshot {
            item_id: item.id.clone(),
            fields,
            captured_at: Utc::now(),
        })
    }

    async fn cleanup(&self) {
        // 把页面滚回顶部，失败无所谓
        let _ = self
            .executor
            .eval_with_timeout("window.scrollTo(0, 0); true", self.eval_timeout)
            .await;
    }

    fn external_ref(&self) -> Option<ExternalRef> {
        Some(ExternalRef {
            handle_id: self.executor.handle_id(),
            last_health_check: Utc::now(),
            required: true,
        })
    }
}

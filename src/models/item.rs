use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 批处理中的一个条目引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    /// 外部系统中的唯一标识（用于漂移校验）
    pub id: String,
    /// 在批次中的位置（从 0 开始）
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ItemRef {
    pub fn new(id: impl Into<String>, index: usize) -> Self {
        Self {
            id: id.into(),
            index,
            label: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// 日志显示名
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// 条目处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Activation,
    Extraction,
    Analysis,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Activation => "activation",
            Phase::Extraction => "extraction",
            Phase::Analysis => "analysis",
        }
    }
}

/// 单个条目的处理结果
///
/// 每次尝试只写入一次；失败结果同样保留已抓取到的部分数据。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "D: Serialize, O: Serialize",
    deserialize = "D: serde::de::DeserializeOwned, O: serde::de::DeserializeOwned"
))]
pub struct ItemResult<D, O> {
    pub item: ItemRef,
    pub extracted: Option<D>,
    pub analysis: Option<O>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
    pub completed_at: DateTime<Utc>,
    /// 恢复时被跳过的条目
    #[serde(default)]
    pub skipped: bool,
}

impl<D, O> ItemResult<D, O> {
    pub fn succeeded(item: ItemRef, extracted: D, analysis: O, duration_ms: u64, attempt: u32) -> Self {
        Self {
            item,
            extracted: Some(extracted),
            analysis: Some(analysis),
            success: true,
            error: None,
            duration_ms,
            attempt,
            completed_at: Utc::now(),
            skipped: false,
        }
    }

    pub fn failed(
        item: ItemRef,
        extracted: Option<D>,
        error: impl Into<String>,
        duration_ms: u64,
        attempt: u32,
    ) -> Self {
        Self {
            item,
            extracted,
            analysis: None,
            success: false,
            error: Some(error.into()),
            duration_ms,
            attempt,
            completed_at: Utc::now(),
            skipped: false,
        }
    }

    pub fn index(&self) -> usize {
        self.item.index
    }
}

/// 一次失败的尝试记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedAttempt {
    pub index: usize,
    pub item_id: String,
    pub phase: Phase,
    pub error: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

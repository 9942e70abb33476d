//! 条目处理上下文
//!
//! 封装"我正在处理哪个批次的第几个条目"这一信息

use std::fmt::Display;

use crate::models::ItemRef;

/// 条目处理上下文
#[derive(Debug, Clone)]
pub struct ItemCtx {
    /// 批次ID
    pub run_id: String,

    /// 条目在批次中的位置（从0开始）
    pub index: usize,

    /// 批次条目总数（仅用于日志显示）
    pub total: usize,

    /// 第几次尝试（从1开始）
    pub attempt: u32,

    pub item: ItemRef,
}

impl ItemCtx {
    pub fn new(run_id: &str, item: &ItemRef, total: usize, attempt: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            index: item.index,
            total,
            attempt,
            item: item.clone(),
        }
    }

    /// 指标收集器里的操作 id
    pub fn operation_id(&self) -> String {
        format!("{}#{}", self.index, self.attempt)
    }
}

impl Display for ItemCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[条目 {}/{} {}]",
            self.index + 1,
            self.total,
            self.item.display_name()
        )
    }
}

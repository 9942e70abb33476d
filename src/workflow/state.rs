//! 条目状态机
//!
//! ```text
//! Queued → Activating → Extracting → Analyzing → Completed
//!              ↘            ↘            ↘
//!                         Failed
//! Queued → Skipped（恢复时跳过）
//! ```

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Activating,
    Extracting,
    Analyzing,
    Completed,
    Failed,
    Skipped,
}

impl ItemState {
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Queued, Activating)
                | (Queued, Skipped)
                | (Activating, Extracting)
                | (Extracting, Analyzing)
                | (Analyzing, Completed)
                | (Activating, Failed)
                | (Extracting, Failed)
                | (Analyzing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Completed | ItemState::Failed | ItemState::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Queued => "queued",
            ItemState::Activating => "activating",
            ItemState::Extracting => "extracting",
            ItemState::Analyzing => "analyzing",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
            ItemState::Skipped => "skipped",
        }
    }
}

/// 单个条目当前所处的状态
#[derive(Debug, Clone)]
pub struct ItemTracker {
    index: usize,
    state: ItemState,
}

impl ItemTracker {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: ItemState::Queued,
        }
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 迁移到下一个状态，非法迁移返回错误且状态不变
    pub fn transition(&mut self, next: ItemState) -> Result<ItemState, OrchestratorError> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                index: self.index,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(next)
    }
}

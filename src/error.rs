//! 错误类型
//!
//! 按关注点拆分：能力调用、存储、检查点、任务队列、编排、配置，
//! 最终统一到 [`AppError`]。

use thiserror::Error;

use crate::orchestrator::report::Report;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 外部能力调用错误（数据源 / 分析 / 转写）
    #[error("能力调用错误: {0}")]
    Capability(#[from] CapabilityError),
    /// 持久化存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 检查点错误
    #[error("检查点错误: {0}")]
    Checkpoint(#[from] CheckpointError),
    /// 任务队列错误
    #[error("队列错误: {0}")]
    Queue(#[from] QueueError),
    /// 批处理编排错误
    #[error("编排错误: {0}")]
    Orchestrator(#[from] OrchestratorError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 外部能力调用错误
///
/// `Timeout` 和 `Unavailable` 属于瞬时错误，可以退避重试；
/// 其余错误直接判定当前条目失败。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// 调用超时
    #[error("调用超时 ({operation}, {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },
    /// 下游服务不可用
    #[error("下游服务不可用: {0}")]
    Unavailable(String),
    /// 返回数据无效
    #[error("返回数据无效: {0}")]
    InvalidResponse(String),
    /// 引用的资源不存在
    #[error("资源不存在: {0}")]
    NotFound(String),
    /// 其他失败
    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CapabilityError::Timeout { .. } | CapabilityError::Unavailable(_)
        )
    }
}

/// 持久化存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 读取失败
    #[error("读取 {key} 失败: {source}")]
    ReadFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入失败
    #[error("写入 {key} 失败: {source}")]
    WriteFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// 删除失败
    #[error("删除 {key} 失败: {source}")]
    RemoveFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// 键名不合法
    #[error("非法的键名: {0}")]
    InvalidKey(String),
    /// 后端不可用
    #[error("存储后端不可用: {0}")]
    Unavailable(String),
}

/// 检查点错误
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// 检查点不存在
    #[error("检查点不存在: {0}")]
    NotFound(String),
    /// 完整性校验失败
    #[error("检查点 {id} 完整性校验失败 (期望 {expected}, 实际 {actual})")]
    IntegrityMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    /// 结构不合法
    #[error("检查点 {id} 结构不合法: {reason}")]
    InvalidStructure { id: String, reason: String },
    /// 配置变更被拒绝
    #[error("不允许修改配置: {0:?}")]
    ConfigChangeRejected(Vec<String>),
    /// 外部环境不可用
    #[error("外部环境不可用: {0}")]
    EnvironmentUnavailable(String),
    /// 序列化失败
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
    /// 底层存储失败
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 任务队列错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// 队列已满
    #[error("队列已满 (上限 {max_queue_size})")]
    QueueFull { max_queue_size: usize },
    /// 任务不存在
    #[error("任务不存在: {0}")]
    JobNotFound(String),
    /// 任务被取消
    #[error("任务已取消: {0}")]
    Cancelled(String),
    /// 任务最终失败
    #[error("任务 {job_id} 失败: {message}")]
    JobFailed { job_id: String, message: String },
}

/// 批处理编排错误
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// 已有批处理正在运行
    #[error("已有批处理正在运行")]
    AlreadyRunning,
    /// 错误率过高，熔断
    #[error("错误率过高: {failed}/{processed} 个条目失败")]
    HighErrorRate {
        failed: usize,
        processed: usize,
        partial: Box<Report>,
    },
    /// 被取消
    #[error("批处理已取消 (已处理 {} 个条目)", .partial.processed())]
    Cancelled { partial: Box<Report> },
    /// 外部数据源顺序发生漂移
    #[error("数据源状态漂移: 位置 {index} 期望 {expected}, 实际 {actual:?}")]
    StateDrift {
        index: usize,
        expected: String,
        actual: Option<String>,
    },
    /// 非法的状态迁移
    #[error("条目 {index} 非法状态迁移: {from:?} -> {to:?}")]
    InvalidTransition {
        index: usize,
        from: crate::workflow::ItemState,
        to: crate::workflow::ItemState,
    },
    /// 条目列表为空或配置不合法
    #[error("无效输入: {0}")]
    InvalidInput(String),
    /// 检查点读写失败
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl OrchestratorError {
    /// 中止时已经产生的部分报告
    pub fn partial_report(&self) -> Option<&Report> {
        match self {
            OrchestratorError::HighErrorRate { partial, .. }
            | OrchestratorError::Cancelled { partial } => Some(partial),
            _ => None,
        }
    }
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 取值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    InvalidValue { field: String, reason: String },
}

// ========== 从常见错误类型转换 ==========

impl From<chromiumoxide::error::CdpError> for CapabilityError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CapabilityError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Other(format!("JSON解析失败: {}", err))
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建配置取值错误
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        })
    }
}

impl CapabilityError {
    /// 创建超时错误
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        CapabilityError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

//! # Batch Orchestrator
//!
//! 可断点续跑的批处理编排引擎：逐个激活外部数据源里的条目，抓取数据，
//! 交给远程分析服务，并持续写入带完整性校验的检查点。
//!
//! ## 架构设计
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（Page、检查点目录），只暴露能力
//! - `JsExecutor` - 唯一的 page owner，提供 eval() 能力
//! - `FileStore` / `MemoryStore` - 键值存储
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 能力接口与实现，只处理单个条目
//! - `BrowserItemSource` - 页面数据源
//! - `LlmAnalysisEngine` - LLM 分析
//! - `WhisperHttpClient` - 音频转写
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个条目"的处理流程
//! - `ItemCtx` - 上下文封装（run_id + 条目位置 + 尝试次数）
//! - `ItemFlow` - 流程编排（activate → extract → analyze）
//! - `ItemTracker` - 条目状态机
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 批处理编排器
//! - `checkpoint/` - 检查点保存、校验、恢复
//! - `queue/` - 优先级任务队列
//! - `metrics/` - 性能指标
//!
//! ## 模块结构

pub mod browser;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod logger;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use browser::connect_to_browser_and_page;
pub use checkpoint::{CheckpointManager, ResumeOptions};
pub use config::Config;
pub use error::{AppError, AppResult, OrchestratorError};
pub use infrastructure::{FileStore, JsExecutor, MemoryStore};
pub use metrics::MetricsCollector;
pub use models::{BatchConfig, BatchRun, ItemRef, ItemResult};
pub use orchestrator::{BatchOrchestrator, Progress, Report};
pub use queue::{Job, Priority, PriorityJobQueue, QueueConfig};
pub use workflow::{ItemCtx, ItemFlow, ItemState};

//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批次调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批处理编排器
//! - 单实例运行（同一时刻只有一个批次）
//! - 顺序 / 两阶段并行执行
//! - 周期检查点、中断检查点、从检查点恢复
//! - 失败率熔断与协作式取消
//!
//! ### `progress` - 进度推送
//! - 完成百分比与剩余时间估计
//!
//! ### `report` - 批处理报告
//! - 成功 / 失败 / 跳过统计、错误列表、汇总和会话指标
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<ItemRef>)
//!     ↓
//! workflow::ItemFlow (处理单个条目)
//!     ↓
//! services (能力层：数据源 / 分析引擎)
//!     ↓
//! infrastructure (基础设施：JsExecutor / 存储)
//! ```

pub mod batch_processor;
pub mod progress;
pub mod report;

pub use batch_processor::{BatchOrchestrator, BREAKER_MIN_SAMPLE};
pub use progress::Progress;
pub use report::{CompletionEvent, ItemError, ItemOutcome, Report, RunStatus, SummaryStats};

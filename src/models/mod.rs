pub mod item;
pub mod loaders;
pub mod run;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use item::{FailedAttempt, ItemRef, ItemResult, Phase};
pub use loaders::{load_items_file, ItemsFile};
pub use run::{
    BatchConfig, BatchRun, ConfigOverride, ExecutionMode, ExternalRef, MetricsSnapshot,
    RecoveryStrategy, ResumeMetadata,
};

/// 可以随检查点持久化的数据类型
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + std::fmt::Debug + 'static {}

/// 分析结果
///
/// `category` 用于报告中的分类统计，没有分类的结果返回 `None`。
pub trait AnalysisOutput: Payload {
    fn category(&self) -> Option<String> {
        None
    }
}

impl AnalysisOutput for String {}

impl AnalysisOutput for serde_json::Value {
    fn category(&self) -> Option<String> {
        self.get("category").and_then(|v| v.as_str()).map(str::to_string)
    }
}

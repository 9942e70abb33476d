//! 基础设施层
//!
//! 持有稀缺资源（浏览器页面、存储目录），只向上暴露能力。

pub mod js_executor;
pub mod store;

pub use js_executor::JsExecutor;
pub use store::{FileStore, MemoryStore};

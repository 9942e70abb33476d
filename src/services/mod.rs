//! 业务能力层（Services）
//!
//! - `traits`：编排层依赖的能力接口
//! - `audio_transcriber`：条目音频转写
//! - `page_source`：浏览器页面数据源
//! - `llm_service`：LLM 分析引擎
//! - `whisper_client`：音频转写
//! - `env_probe`：恢复前的浏览器环境探测

pub mod audio_transcriber;
pub mod env_probe;
pub mod llm_service;
pub mod page_source;
pub mod traits;
pub mod whisper_client;

pub use audio_transcriber::{AudioTranscriber, AUDIO_FIELD, TRANSCRIPT_FIELD};
pub use env_probe::BrowserEnvironmentProbe;
pub use llm_service::{LlmAnalysis, LlmAnalysisEngine};
pub use page_source::{BrowserItemSource, PageScripts, PageSnapshot};
pub use traits::{
    AnalysisEngine, AudioBlob, EnvironmentProbe, FnProgress, HandleState, ItemDataSource,
    NoopProgress, NotificationSink, PersistentStore, ProgressSink, TranscriptionEngine,
};
pub use whisper_client::WhisperHttpClient;

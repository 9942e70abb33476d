use std::str::FromStr;

use crate::error::ConfigError;
use crate::models::{BatchConfig, ExecutionMode, RecoveryStrategy};
use crate::queue::QueueConfig;

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 浏览器调试端口
    pub browser_debug_port: u16,
    /// 目标URL
    pub target_url: String,
    /// 条目清单（TOML）
    pub items_file: String,
    /// 检查点目录
    pub checkpoint_dir: String,
    /// 输出日志文件
    pub output_log_file: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    // --- 转写服务 ---
    /// 设置后条目里的音频会先转写再分析
    pub whisper_api_url: Option<String>,
    // --- 批处理 ---
    pub execution_mode: ExecutionMode,
    pub max_concurrency: usize,
    /// 任务队列的并发数
    pub queue_concurrency: usize,
    pub checkpoint_interval: usize,
    pub max_checkpoints: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub item_timeout_ms: u64,
    /// 设置后从该检查点恢复，而不是开始新批次
    pub resume_checkpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let batch = BatchConfig::default();
        Self {
            browser_debug_port: 2001,
            target_url: String::new(),
            items_file: "items.toml".to_string(),
            checkpoint_dir: "checkpoints".to_string(),
            output_log_file: "output.txt".to_string(),
            verbose_logging: false,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            whisper_api_url: None,
            execution_mode: batch.mode,
            max_concurrency: batch.max_concurrency,
            queue_concurrency: QueueConfig::default().max_concurrency,
            checkpoint_interval: batch.checkpoint_interval,
            max_checkpoints: batch.max_checkpoints,
            max_retries: batch.max_retries,
            retry_base_delay_ms: batch.retry_base_delay_ms,
            item_timeout_ms: batch.item_timeout_ms,
            resume_checkpoint: None,
        }
    }
}

/// 读取并解析一个环境变量，未设置时返回 `None`
fn env_parse<T: FromStr>(var_name: &str, expected_type: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: expected_type.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        let config = Self {
            browser_debug_port: env_parse("BROWSER_DEBUG_PORT", "u16")?.unwrap_or(default.browser_debug_port),
            target_url: env_string("TARGET_URL").unwrap_or(default.target_url),
            items_file: env_string("ITEMS_FILE").unwrap_or(default.items_file),
            checkpoint_dir: env_string("CHECKPOINT_DIR").unwrap_or(default.checkpoint_dir),
            output_log_file: env_string("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
            verbose_logging: env_parse("VERBOSE_LOGGING", "bool")?.unwrap_or(default.verbose_logging),
            llm_api_key: env_string("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: env_string("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: env_string("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            whisper_api_url: env_string("WHISPER_API_URL").or(default.whisper_api_url),
            execution_mode: env_parse("EXECUTION_MODE", "sequential|parallel")?.unwrap_or(default.execution_mode),
            max_concurrency: env_parse("MAX_CONCURRENCY", "usize")?.unwrap_or(default.max_concurrency),
            queue_concurrency: env_parse("QUEUE_CONCURRENCY", "usize")?.unwrap_or(default.queue_concurrency),
            checkpoint_interval: env_parse("CHECKPOINT_INTERVAL", "usize")?.unwrap_or(default.checkpoint_interval),
            max_checkpoints: env_parse("MAX_CHECKPOINTS", "usize")?.unwrap_or(default.max_checkpoints),
            max_retries: env_parse("MAX_RETRIES", "u32")?.unwrap_or(default.max_retries),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", "u64")?.unwrap_or(default.retry_base_delay_ms),
            item_timeout_ms: env_parse("ITEM_TIMEOUT_MS", "u64")?.unwrap_or(default.item_timeout_ms),
            resume_checkpoint: env_string("RESUME_CHECKPOINT"),
        };

        config
            .batch_config()
            .validate()
            .map_err(|reason| ConfigError::InvalidValue {
                field: "batch".to_string(),
                reason,
            })?;
        if config.queue_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "QUEUE_CONCURRENCY".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        Ok(config)
    }

    /// 随检查点持久化的批处理配置
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            mode: self.execution_mode,
            max_concurrency: self.max_concurrency,
            checkpoint_interval: self.checkpoint_interval,
            max_checkpoints: self.max_checkpoints,
            max_retries: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
            item_timeout_ms: self.item_timeout_ms,
            recovery_strategy: RecoveryStrategy::Continue,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrency: self.queue_concurrency,
            default_max_retries: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
            ..QueueConfig::default()
        }
    }
}

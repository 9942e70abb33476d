//! 检查点管理器

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use super::integrity::{seal, unseal};
use super::resume::{compute_strategy, diff_config, validate_environment, ResumeOptions, ResumeStrategy};
use super::{Checkpoint, CheckpointInfo, KEY_PREFIX, SCHEMA_VERSION};
use crate::error::CheckpointError;
use crate::models::{BatchConfig, BatchRun, ConfigOverride, Payload};
use crate::services::{EnvironmentProbe, PersistentStore};

/// 恢复计划
#[derive(Debug, Clone)]
pub struct ResumePlan<D, O> {
    pub checkpoint_id: String,
    /// 从检查点还原的批次
    pub run: BatchRun<D, O>,
    /// 应用覆盖项之后的配置
    pub config: BatchConfig,
    pub strategy: ResumeStrategy,
    pub warnings: Vec<String>,
}

/// 检查点管理器
///
/// 负责序列化、完整性校验、原子落盘和清理旧检查点。
pub struct CheckpointManager {
    store: Arc<dyn PersistentStore>,
    probe: Option<Arc<dyn EnvironmentProbe>>,
    last_timestamp: Mutex<i64>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            store,
            probe: None,
            last_timestamp: Mutex::new(0),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn EnvironmentProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// 单调递增的毫秒时间戳
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ts = if now <= *last { *last + 1 } else { now };
        *last = ts;
        ts
    }

    fn key(run_id: &str, id: &str) -> String {
        format!("{}{}:{}", KEY_PREFIX, run_id, id)
    }

    fn parse_key(key: &str) -> Option<CheckpointInfo> {
        let rest = key.strip_prefix(KEY_PREFIX)?;
        let (run_id, id) = rest.rsplit_once(':')?;
        let millis: i64 = id.strip_prefix("cp-")?.split('-').next()?.parse().ok()?;
        let timestamp: DateTime<Utc> = Utc.timestamp_millis_opt(millis).single()?;
        Some(CheckpointInfo {
            id: id.to_string(),
            run_id: run_id.to_string(),
            timestamp,
            key: key.to_string(),
        })
    }

    /// 保存检查点，返回检查点 id
    pub async fn save<D: Payload, O: Payload>(&self, run: &BatchRun<D, O>) -> Result<String, CheckpointError> {
        let timestamp = self.next_timestamp();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("cp-{:013}-{}", timestamp, &suffix[..8]);

        let checkpoint = Checkpoint::from_run(id.clone(), timestamp, run);
        let body = serde_json::to_vec(&checkpoint)?;
        let (hash, sealed) = seal(&body);

        self.store.set(&Self::key(&run.run_id, &id), sealed).await?;
        info!(
            "💾 检查点已保存: {} (进度 {}/{}, 成功 {})",
            id,
            run.current_index,
            run.total_items(),
            run.success_count()
        );
        debug!("检查点 {} 校验值 {}", id, hash);

        self.prune(&run.run_id, run.config.max_checkpoints).await;
        Ok(id)
    }

    /// 清理同一批次的旧检查点，失败只记录日志
    async fn prune(&self, run_id: &str, keep: usize) {
        let checkpoints = match self.list_checkpoints(Some(run_id)).await {
            Ok(list) => list,
            Err(e) => {
                warn!("⚠️ 列出检查点失败，跳过清理: {}", e);
                return;
            }
        };

        for stale in checkpoints.into_iter().skip(keep.max(1)) {
            match self.store.remove(&stale.key).await {
                Ok(_) => debug!("🗑️ 清理旧检查点 {}", stale.id),
                Err(e) => warn!("⚠️ 清理检查点 {} 失败: {}", stale.id, e),
            }
        }
    }

    async fn find_key(&self, id: &str) -> Result<String, CheckpointError> {
        let suffix = format!(":{}", id);
        self.store
            .list_keys(KEY_PREFIX)
            .await?
            .into_iter()
            .find(|key| key.ends_with(&suffix))
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))
    }

    /// 读取并校验检查点
    pub async fn load<D: Payload, O: Payload>(&self, id: &str) -> Result<Checkpoint<D, O>, CheckpointError> {
        let key = self.find_key(id).await?;
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))?;

        let (hash, body) = unseal(id, &raw)?;
        let mut checkpoint: Checkpoint<D, O> =
            serde_json::from_slice(body).map_err(|e| CheckpointError::InvalidStructure {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        checkpoint.integrity_hash = hash;

        validate_structure(id, &checkpoint)?;
        debug!("检查点 {} 校验通过", id);
        Ok(checkpoint)
    }

    /// 列出检查点，最新的在前
    pub async fn list_checkpoints(&self, run_id: Option<&str>) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let prefix = match run_id {
            Some(run_id) => format!("{}{}:", KEY_PREFIX, run_id),
            None => KEY_PREFIX.to_string(),
        };

        let mut infos: Vec<CheckpointInfo> = self
            .store
            .list_keys(&prefix)
            .await?
            .iter()
            .filter_map(|key| Self::parse_key(key))
            .filter(|info| run_id.map_or(true, |r| info.run_id == r))
            .collect();
        infos.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(infos)
    }

    pub async fn latest_for_run(&self, run_id: &str) -> Result<Option<CheckpointInfo>, CheckpointError> {
        Ok(self.list_checkpoints(Some(run_id)).await?.into_iter().next())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, CheckpointError> {
        let key = match self.find_key(id).await {
            Ok(key) => key,
            Err(CheckpointError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.store.remove(&key).await?)
    }

    /// 读取检查点并生成恢复计划
    pub async fn resume<D: Payload, O: Payload>(
        &self,
        id: &str,
        overrides: &ConfigOverride,
        options: &ResumeOptions,
    ) -> Result<ResumePlan<D, O>, CheckpointError> {
        let checkpoint: Checkpoint<D, O> = self.load(id).await?;
        let mut warnings = Vec::new();

        if options.validate_environment {
            let external = checkpoint.resume_metadata.external_ref.as_ref();
            warnings.extend(validate_environment(external, self.probe.as_deref(), Utc::now()).await?);
        }

        let config = checkpoint.configuration.apply(overrides);
        let changes = diff_config(&checkpoint.configuration, &config);
        if !changes.is_empty() {
            if !options.allow_config_changes {
                return Err(CheckpointError::ConfigChangeRejected(changes));
            }
            warnings.extend(changes.into_iter().map(|c| format!("配置变更: {}", c)));
        }

        let run = checkpoint.into_run();
        let strategy = compute_strategy(&run, options);
        for warning in &warnings {
            warn!("⚠️ {}", warning);
        }
        info!(
            "🔁 从检查点 {} 恢复: 起始位置 {}, 模式 {:?}, 跳过 {}, 重试 {}",
            id,
            strategy.start_index,
            strategy.mode,
            strategy.skip.len(),
            strategy.retry.len()
        );

        Ok(ResumePlan {
            checkpoint_id: id.to_string(),
            run,
            config,
            strategy,
            warnings,
        })
    }
}

fn validate_structure<D, O>(id: &str, checkpoint: &Checkpoint<D, O>) -> Result<(), CheckpointError> {
    let invalid = |reason: String| CheckpointError::InvalidStructure {
        id: id.to_string(),
        reason,
    };

    if checkpoint.schema_version != SCHEMA_VERSION {
        return Err(invalid(format!(
            "不支持的版本 {} (当前 {})",
            checkpoint.schema_version, SCHEMA_VERSION
        )));
    }
    if checkpoint.id != id {
        return Err(invalid(format!("id 不一致: {}", checkpoint.id)));
    }
    if checkpoint.run_id.is_empty() {
        return Err(invalid("缺少 runId".to_string()));
    }
    if checkpoint.total_items != checkpoint.items.len() {
        return Err(invalid(format!(
            "totalItems {} 与条目数 {} 不一致",
            checkpoint.total_items,
            checkpoint.items.len()
        )));
    }
    if checkpoint.current_index > checkpoint.total_items {
        return Err(invalid(format!(
            "currentIndex {} 超出范围 [0, {}]",
            checkpoint.current_index, checkpoint.total_items
        )));
    }
    if let Some(r) = checkpoint
        .completed_results
        .iter()
        .find(|r| r.index() >= checkpoint.total_items)
    {
        return Err(invalid(format!("结果位置 {} 超出范围", r.index())));
    }
    if let Some(a) = checkpoint
        .failed_attempts
        .iter()
        .find(|a| a.index >= checkpoint.total_items)
    {
        return Err(invalid(format!("失败记录位置 {} 超出范围", a.index)));
    }
    Ok(())
}

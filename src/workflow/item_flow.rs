//! 条目处理流程 - 流程层
//!
//! 核心职责：定义"一个条目"的各个处理阶段
//!
//! 流程顺序：
//! 1. activate → 漂移校验
//! 2. extract（带重试）
//! 3. analyze（带重试）
//!
//! 流程层不持有批次状态，只负责调用能力、计时和日志；
//! 结果如何落入批次由编排层决定。

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CapabilityError, OrchestratorError};
use crate::metrics::MetricsCollector;
use crate::models::{BatchConfig, ItemRef};
use crate::services::{AnalysisEngine, ItemDataSource};
use crate::utils::logging::truncate_text;
use crate::workflow::item_ctx::ItemCtx;
use crate::workflow::retry::{call_with_timeout, with_retry, Retried};

pub const OP_ACTIVATE: &str = "activate";
pub const OP_EXTRACT: &str = "extract";
pub const OP_ANALYZE: &str = "analyze";

/// 条目处理流程
///
/// - 定义单个条目的阶段顺序
/// - 不持有批次状态（BatchRun）
/// - 只依赖能力接口（services）
pub struct ItemFlow<S, A> {
    source: Arc<S>,
    engine: Arc<A>,
    metrics: Arc<MetricsCollector>,
    verbose_logging: bool,
}

impl<S, A> ItemFlow<S, A>
where
    S: ItemDataSource,
    A: AnalysisEngine<S::Data>,
{
    pub fn new(source: Arc<S>, engine: Arc<A>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            source,
            engine,
            metrics,
            verbose_logging: false,
        }
    }

    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose_logging = verbose;
        self
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn engine(&self) -> &Arc<A> {
        &self.engine
    }

    fn meta(ctx: &ItemCtx) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("item_index".to_string(), ctx.index.to_string()),
            ("item_id".to_string(), ctx.item.id.clone()),
            ("attempt".to_string(), ctx.attempt.to_string()),
        ])
    }

    /// 激活条目，外层错误是致命的（漂移），内层错误只让当前条目失败
    pub async fn activate(
        &self,
        ctx: &ItemCtx,
        config: &BatchConfig,
    ) -> Result<Result<(), CapabilityError>, OrchestratorError> {
        let op_id = ctx.operation_id();
        self.metrics.start_operation(&op_id, OP_ACTIVATE);

        let source = &self.source;
        let item = &ctx.item;
        let activated = call_with_timeout(OP_ACTIVATE, config, source.activate(item)).await;
        let checked = match activated {
            Ok(()) => self.check_position(item, config).await,
            Err(e) => Ok(Err(e)),
        };

        let success = matches!(checked, Ok(Ok(())));
        self.metrics.end_operation(&op_id, OP_ACTIVATE, success, Self::meta(ctx));
        if let Ok(Err(e)) = &checked {
            warn!("{} ⚠️ 激活失败: {}", ctx, e);
        }
        checked
    }

    /// 校验外部数据源的顺序是否与批次一致
    async fn check_position(
        &self,
        item: &ItemRef,
        config: &BatchConfig,
    ) -> Result<Result<(), CapabilityError>, OrchestratorError> {
        let actual = match call_with_timeout(OP_ACTIVATE, config, self.source.item_id_at(item.index)).await {
            Ok(actual) => actual,
            Err(e) => return Ok(Err(e)),
        };

        if actual.as_deref() != Some(item.id.as_str()) {
            return Err(OrchestratorError::StateDrift {
                index: item.index,
                expected: item.id.clone(),
                actual,
            });
        }
        Ok(Ok(()))
    }

    /// 抓取条目数据
    pub async fn extract(
        &self,
        ctx: &ItemCtx,
        config: &BatchConfig,
        cancel: &CancellationToken,
    ) -> Retried<S::Data> {
        let op_id = ctx.operation_id();
        self.metrics.start_operation(&op_id, OP_EXTRACT);

        let source = &self.source;
        let item = &ctx.item;
        let retried = with_retry(OP_EXTRACT, config, cancel, move || source.extract(item)).await;

        self.metrics
            .end_operation(&op_id, OP_EXTRACT, retried.result.is_ok(), Self::meta(ctx));
        match &retried.result {
            Ok(data) => {
                debug!("{} ✓ 抓取完成 ({} 次尝试)", ctx, retried.attempts);
                if self.verbose_logging {
                    let preview = format!("{:?}", data);
                    info!("{} 数据: {}", ctx, truncate_text(&preview, 80));
                }
            }
            Err(e) => warn!("{} ⚠️ 抓取失败: {}", ctx, e),
        }
        retried
    }

    /// 分析抓取结果
    pub async fn analyze(
        &self,
        ctx: &ItemCtx,
        data: &S::Data,
        config: &BatchConfig,
        cancel: &CancellationToken,
    ) -> Retried<A::Output> {
        let op_id = ctx.operation_id();
        self.metrics.start_operation(&op_id, OP_ANALYZE);

        let engine = &self.engine;
        let retried = with_retry(OP_ANALYZE, config, cancel, move || engine.analyze(data)).await;

        self.metrics
            .end_operation(&op_id, OP_ANALYZE, retried.result.is_ok(), Self::meta(ctx));
        match &retried.result {
            Ok(_) => debug!("{} ✓ 分析完成 ({} 次尝试)", ctx, retried.attempts),
            Err(e) => warn!("{} ⚠️ 分析失败: {}", ctx, e),
        }
        retried
    }
}

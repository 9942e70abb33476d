//! 批处理编排器 - 编排层
//!
//! ## 职责
//!
//! 驱动一个批次的所有条目走完状态机，是整个系统的"指挥中心"。
//!
//! ## 核心功能
//!
//! 1. **单实例运行**：同一个编排器同时只允许一个批次
//! 2. **两种执行模式**：顺序模式；两阶段并行模式（顺序抓取 + 分块并发分析）
//! 3. **检查点**：每成功 `checkpoint_interval` 个条目保存一次，中止时再保存一次
//! 4. **熔断**：处理满 4 个条目后失败率超过一半即中止
//! 5. **取消**：在条目和阶段边界检查取消信号，不打断进行中的调用
//! 6. **恢复**：从检查点重建批次，按恢复策略跳过或重试失败条目

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointManager, ResumeOptions, ResumePlan, ResumeStrategy, RetryPlanEntry};
use crate::error::{AppError, CapabilityError, OrchestratorError};
use crate::metrics::{MetricsCollector, ITEM_OPERATION};
use crate::models::{
    BatchConfig, BatchRun, ConfigOverride, ExecutionMode, ItemRef, ItemResult, MetricsSnapshot,
    Phase, RecoveryStrategy,
};
use crate::orchestrator::progress::ProgressReporter;
use crate::orchestrator::report::{CompletionEvent, Report, RunStatus};
use crate::queue::{Job, Priority, PriorityJobQueue};
use crate::services::{AnalysisEngine, ItemDataSource, NotificationSink, ProgressSink};
use crate::utils::logging::{log_batch_complete, log_batch_start, log_items_loaded, log_startup};
use crate::workflow::item_flow::OP_ANALYZE;
use crate::workflow::{ItemCtx, ItemFlow, ItemState, ItemTracker, Retried};

/// 熔断前至少要处理的条目数
pub const BREAKER_MIN_SAMPLE: usize = 4;

type DataOf<S> = <S as ItemDataSource>::Data;
type OutputOf<S, A> = <A as AnalysisEngine<DataOf<S>>>::Output;
type RunOf<S, A> = BatchRun<DataOf<S>, OutputOf<S, A>>;

/// 正在被驱动的数据源（按 `Arc` 地址）
///
/// 数据源只有一个游标，同一进程内一个数据源同时只能服务一个批次，
/// 即使它被多个编排器共享。
static ACTIVE_SOURCES: Mutex<BTreeSet<usize>> = Mutex::new(BTreeSet::new());

fn active_sources() -> MutexGuard<'static, BTreeSet<usize>> {
    ACTIVE_SOURCES.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 单次运行标记，离开作用域时自动清除
struct RunGuard {
    key: usize,
}

impl RunGuard {
    fn acquire(key: usize) -> Result<Self, OrchestratorError> {
        if !active_sources().insert(key) {
            return Err(OrchestratorError::AlreadyRunning);
        }
        Ok(Self { key })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        active_sources().remove(&self.key);
    }
}

/// 提前结束批次的原因
enum Abort {
    Cancelled,
    HighErrorRate { failed: usize, processed: usize },
    Fatal(OrchestratorError),
}

impl Abort {
    fn reason(&self) -> &'static str {
        match self {
            Abort::Cancelled => "cancelled",
            Abort::HighErrorRate { .. } => "high_error_rate",
            Abort::Fatal(_) => "aborted",
        }
    }
}

impl From<OrchestratorError> for Abort {
    fn from(err: OrchestratorError) -> Self {
        Abort::Fatal(err)
    }
}

/// 一次执行期间的可变状态
struct Exec<'a> {
    token: CancellationToken,
    reporter: ProgressReporter<'a>,
    processed: usize,
    failed: usize,
    failed_indices: Vec<usize>,
}

/// 抓取完成、等待分析的条目
struct Extracted<D> {
    ctx: ItemCtx,
    tracker: ItemTracker,
    data: D,
    extract_ms: u64,
}

/// 批处理编排器
pub struct BatchOrchestrator<S, A>
where
    S: ItemDataSource + 'static,
    A: AnalysisEngine<S::Data> + 'static,
{
    flow: ItemFlow<S, A>,
    checkpoints: Arc<CheckpointManager>,
    metrics: Arc<MetricsCollector>,
    analysis_queue: Option<PriorityJobQueue<OutputOf<S, A>>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    cancel: Mutex<CancellationToken>,
    last_run: Mutex<Option<RunOf<S, A>>>,
}

impl<S, A> BatchOrchestrator<S, A>
where
    S: ItemDataSource + 'static,
    A: AnalysisEngine<S::Data> + 'static,
{
    pub fn new(source: Arc<S>, engine: Arc<A>, checkpoints: Arc<CheckpointManager>) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        Self {
            flow: ItemFlow::new(source, engine, metrics.clone()),
            checkpoints,
            metrics,
            analysis_queue: None,
            notifier: None,
            cancel: Mutex::new(CancellationToken::new()),
            last_run: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.flow = ItemFlow::new(self.flow.source().clone(), self.flow.engine().clone(), metrics.clone());
        self.metrics = metrics;
        self
    }

    /// 并行模式的分析阶段改为经由任务队列提交
    pub fn with_analysis_queue(mut self, queue: PriorityJobQueue<OutputOf<S, A>>) -> Self {
        self.analysis_queue = Some(queue);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.flow = self.flow.with_verbose_logging(verbose);
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// 数据源是否正在被某个批次驱动（包括共享同一数据源的其他编排器）
    pub fn is_running(&self) -> bool {
        active_sources().contains(&self.source_key())
    }

    fn source_key(&self) -> usize {
        Arc::as_ptr(self.flow.source()) as *const () as usize
    }

    /// 请求取消当前批次
    ///
    /// 在 `resume_with` 读取检查点期间发出的取消同样生效；
    /// 批次结束后令牌才会重置。
    pub fn cancel(&self) {
        info!("🛑 收到取消请求，将在当前条目结束后停止");
        self.token_slot().cancel();
    }

    /// 最近一次执行结束时的批次状态（含全部结果数据）
    pub fn last_run(&self) -> Option<RunOf<S, A>> {
        self.last_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn token_slot(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reset_token(&self) {
        *self.token_slot() = CancellationToken::new();
    }

    /// 运行一个新批次
    pub async fn run(
        &self,
        items: Vec<ItemRef>,
        config: BatchConfig,
        sink: &dyn ProgressSink,
    ) -> Result<Report, OrchestratorError> {
        config.validate().map_err(OrchestratorError::InvalidInput)?;
        validate_items(&items)?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let run_id = format!("run-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), &suffix[..6]);
        let mut run: RunOf<S, A> = BatchRun::new(run_id, items, config);
        run.resume.external_ref = self.flow.source().external_ref();

        self.execute(run, ResumeStrategy::fresh(), sink).await
    }

    /// 使用默认选项从检查点恢复
    pub async fn resume(&self, checkpoint_id: &str, sink: &dyn ProgressSink) -> Result<Report, OrchestratorError> {
        self.resume_with(checkpoint_id, &ConfigOverride::default(), &ResumeOptions::default(), sink)
            .await
    }

    pub async fn resume_with(
        &self,
        checkpoint_id: &str,
        overrides: &ConfigOverride,
        options: &ResumeOptions,
        sink: &dyn ProgressSink,
    ) -> Result<Report, OrchestratorError> {
        if self.is_running() {
            return Err(OrchestratorError::AlreadyRunning);
        }

        let plan: ResumePlan<DataOf<S>, OutputOf<S, A>> =
            self.checkpoints.resume(checkpoint_id, overrides, options).await?;
        plan.config.validate().map_err(OrchestratorError::InvalidInput)?;

        let ResumePlan {
            mut run,
            config,
            strategy,
            ..
        } = plan;
        run.config = config;
        run.resume.resume_count += 1;
        run.resume.resumed_from = Some(checkpoint_id.to_string());
        run.resume.reason = None;
        if let Some(external) = self.flow.source().external_ref() {
            run.resume.external_ref = Some(external);
        }

        for result in run.results.iter_mut() {
            if !result.success && strategy.skip.contains(&result.index()) {
                result.skipped = true;
            }
        }
        run.current_index = strategy.start_index;
        advance_cursor(&mut run);

        self.execute(run, strategy, sink).await
    }

    async fn execute(
        &self,
        mut run: RunOf<S, A>,
        strategy: ResumeStrategy,
        sink: &dyn ProgressSink,
    ) -> Result<Report, OrchestratorError> {
        let _guard = RunGuard::acquire(self.source_key())?;
        let started = Instant::now();
        self.metrics.start_session(&run.run_id);

        log_startup(&run.config);
        log_items_loaded(run.total_items(), run.config.max_concurrency);

        let mut ex = Exec {
            token: self.token_slot().clone(),
            reporter: ProgressReporter::new(
                &run.run_id,
                run.total_items(),
                run.results.len(),
                sink,
                self.metrics.clone(),
            ),
            processed: 0,
            failed: 0,
            failed_indices: Vec::new(),
        };
        for index in &strategy.skip {
            ex.reporter.emit(*index, ItemState::Skipped);
        }

        let outcome = self.drive(&mut run, &strategy, &mut ex).await;
        self.reset_token();

        // ========== 收尾：无论结果如何都执行 ==========
        self.flow.source().cleanup().await;
        let session = self.metrics.end_session();
        run.metrics = MetricsSnapshot {
            indicators: session.indicators.clone(),
            operation_count: session.total_operations,
            error_count: session.errors_by_kind.values().sum(),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(()) => {
                let report = Report::build(&run, duration_ms, session, false);
                info!(
                    "🏁 批处理完成 {}: 成功 {}/{}, 失败 {}, 跳过 {}",
                    run.run_id, report.succeeded, report.total, report.failed, report.skipped
                );
                self.notify(&report, RunStatus::Completed);
                Ok(report)
            }
            Err(abort) => {
                run.resume.reason = Some(abort.reason().to_string());
                let checkpoint_id = match self.checkpoints.save(&run).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        error!("❌ 中断检查点保存失败: {}", e);
                        None
                    }
                };

                let cancelled = matches!(abort, Abort::Cancelled);
                let mut report = Report::build(&run, duration_ms, session, cancelled);
                report.checkpoint_id = checkpoint_id;
                let status = if cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Aborted
                };
                self.notify(&report, status);

                Err(match abort {
                    Abort::Cancelled => {
                        warn!("🚫 批处理 {} 已取消", run.run_id);
                        OrchestratorError::Cancelled {
                            partial: Box::new(report),
                        }
                    }
                    Abort::HighErrorRate { failed, processed } => OrchestratorError::HighErrorRate {
                        failed,
                        processed,
                        partial: Box::new(report),
                    },
                    Abort::Fatal(e) => {
                        error!("❌ 批处理 {} 中止: {}", run.run_id, e);
                        e
                    }
                })
            }
        };

        *self.last_run.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(run);
        result
    }

    async fn drive(&self, run: &mut RunOf<S, A>, strategy: &ResumeStrategy, ex: &mut Exec<'_>) -> Result<(), Abort> {
        match run.config.mode {
            ExecutionMode::Sequential => self.run_sequential(run, strategy, ex).await?,
            ExecutionMode::Parallel => self.run_parallel(run, strategy, ex).await?,
        }

        if !strategy.retry.is_empty() {
            self.run_retry_plan(run, &strategy.retry, ex).await?;
        }
        if run.config.recovery_strategy == RecoveryStrategy::RetryAtEnd {
            self.retry_at_end(run, ex).await?;
        }
        Ok(())
    }

    // ========== 顺序模式 ==========

    async fn run_sequential(
        &self,
        run: &mut RunOf<S, A>,
        strategy: &ResumeStrategy,
        ex: &mut Exec<'_>,
    ) -> Result<(), Abort> {
        for index in pending_indices(run, strategy) {
            if ex.token.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            let attempt = next_attempt(run, index);
            self.process_item(run, index, attempt, ex).await?;
            self.check_breaker(ex)?;
        }
        Ok(())
    }

    /// 完整处理一个条目：激活 → 抓取 → 分析
    async fn process_item(
        &self,
        run: &mut RunOf<S, A>,
        index: usize,
        attempt: u32,
        ex: &mut Exec<'_>,
    ) -> Result<(), Abort> {
        let ctx = ItemCtx::new(&run.run_id, &run.items[index], run.total_items(), attempt);
        let mut tracker = ItemTracker::new(index);
        let started = Instant::now();
        self.metrics.start_operation(&ctx.operation_id(), ITEM_OPERATION);
        info!("{} ▶️ 开始处理 (第 {} 次)", ctx, attempt);

        let data = match self.extract_phase(run, &ctx, &mut tracker, ex).await? {
            Ok(data) => data,
            Err((phase, e)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                return self.fail_item(run, &ctx, &mut tracker, phase, &e, None, elapsed, ex).await;
            }
        };

        if ex.token.is_cancelled() {
            return Err(Abort::Cancelled);
        }

        let config = run.config.clone();
        tracker.transition(ItemState::Analyzing)?;
        ex.reporter.emit(index, tracker.state());
        let retried = self.flow.analyze(&ctx, &data, &config, &ex.token).await;
        self.record_errors(run, &ctx, Phase::Analysis, &retried.all_errors());

        let elapsed = started.elapsed().as_millis() as u64;
        match retried.result {
            Ok(output) => self.complete_item(run, &ctx, &mut tracker, data, output, elapsed, ex).await,
            Err(e) => {
                self.fail_item(run, &ctx, &mut tracker, Phase::Analysis, &e, Some(data), elapsed, ex)
                    .await
            }
        }
    }

    /// 激活、漂移校验和抓取；返回内层错误表示条目失败
    async fn extract_phase(
        &self,
        run: &mut RunOf<S, A>,
        ctx: &ItemCtx,
        tracker: &mut ItemTracker,
        ex: &mut Exec<'_>,
    ) -> Result<Result<DataOf<S>, (Phase, CapabilityError)>, Abort> {
        let config = run.config.clone();

        tracker.transition(ItemState::Activating)?;
        ex.reporter.emit(ctx.index, tracker.state());
        if let Err(e) = self.flow.activate(ctx, &config).await? {
            self.record_errors(run, ctx, Phase::Activation, &[&e]);
            return Ok(Err((Phase::Activation, e)));
        }

        tracker.transition(ItemState::Extracting)?;
        ex.reporter.emit(ctx.index, tracker.state());
        let retried = self.flow.extract(ctx, &config, &ex.token).await;
        self.record_errors(run, ctx, Phase::Extraction, &retried.all_errors());

        Ok(retried.result.map_err(|e| (Phase::Extraction, e)))
    }

    // ========== 两阶段并行模式 ==========

    async fn run_parallel(
        &self,
        run: &mut RunOf<S, A>,
        strategy: &ResumeStrategy,
        ex: &mut Exec<'_>,
    ) -> Result<(), Abort> {
        // 阶段一：数据源只有一个游标，必须逐个抓取
        let mut extracted: Vec<Extracted<DataOf<S>>> = Vec::new();
        for index in pending_indices(run, strategy) {
            if ex.token.is_cancelled() {
                return Err(Abort::Cancelled);
            }

            let attempt = next_attempt(run, index);
            let ctx = ItemCtx::new(&run.run_id, &run.items[index], run.total_items(), attempt);
            let mut tracker = ItemTracker::new(index);
            let started = Instant::now();
            self.metrics.start_operation(&ctx.operation_id(), ITEM_OPERATION);

            match self.extract_phase(run, &ctx, &mut tracker, ex).await? {
                Ok(data) => extracted.push(Extracted {
                    ctx,
                    tracker,
                    data,
                    extract_ms: started.elapsed().as_millis() as u64,
                }),
                Err((phase, e)) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    self.fail_item(run, &ctx, &mut tracker, phase, &e, None, elapsed, ex)
                        .await?;
                    self.check_breaker(ex)?;
                }
            }
        }
        info!("✓ 阶段一完成: {} 个条目抓取成功，开始分析", extracted.len());

        // 阶段二：按 max_concurrency 分块，一块全部完成后再开始下一块
        let chunk_size = run.config.max_concurrency.max(1);
        let total = extracted.len();
        let total_chunks = total.div_ceil(chunk_size);
        let config = run.config.clone();
        let mut chunk_num = 0;

        while !extracted.is_empty() {
            if ex.token.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            chunk_num += 1;
            let take = chunk_size.min(extracted.len());
            let mut chunk: Vec<Extracted<DataOf<S>>> = extracted.drain(..take).collect();
            let start = (chunk_num - 1) * chunk_size + 1;
            log_batch_start(chunk_num, total_chunks, start, start + take - 1, total);

            for entry in chunk.iter_mut() {
                entry.tracker.transition(ItemState::Analyzing)?;
                ex.reporter.emit(entry.ctx.index, entry.tracker.state());
            }

            let outputs = self.analyze_chunk(&chunk, &config, &ex.token).await;

            let mut succeeded = 0;
            let mut tripped = None;
            for (mut entry, (retried, analysis_time)) in chunk.into_iter().zip(outputs) {
                self.record_errors(run, &entry.ctx, Phase::Analysis, &retried.all_errors());
                let elapsed = entry.extract_ms + analysis_time.as_millis() as u64;
                match retried.result {
                    Ok(output) => {
                        succeeded += 1;
                        self.complete_item(run, &entry.ctx, &mut entry.tracker, entry.data, output, elapsed, ex)
                            .await?;
                    }
                    Err(e) => {
                        self.fail_item(
                            run,
                            &entry.ctx,
                            &mut entry.tracker,
                            Phase::Analysis,
                            &e,
                            Some(entry.data),
                            elapsed,
                            ex,
                        )
                        .await?;
                    }
                }
                // 同一块的其余结果仍要落入批次，熔断在块结束后生效
                if tripped.is_none() {
                    tripped = self.check_breaker(ex).err();
                }
            }
            log_batch_complete(chunk_num, succeeded, take);

            if let Some(abort) = tripped {
                return Err(abort);
            }
        }
        Ok(())
    }

    /// 并发分析一块条目，返回结果和各自耗时
    async fn analyze_chunk(
        &self,
        chunk: &[Extracted<DataOf<S>>],
        config: &BatchConfig,
        token: &CancellationToken,
    ) -> Vec<(Retried<OutputOf<S, A>>, Duration)> {
        if let Some(queue) = &self.analysis_queue {
            return self.analyze_via_queue(queue, chunk, config).await;
        }

        join_all(chunk.iter().map(|entry| async move {
            let started = Instant::now();
            let retried = self.flow.analyze(&entry.ctx, &entry.data, config, token).await;
            (retried, started.elapsed())
        }))
        .await
    }

    /// 经由任务队列分析，重试交给队列
    async fn analyze_via_queue(
        &self,
        queue: &PriorityJobQueue<OutputOf<S, A>>,
        chunk: &[Extracted<DataOf<S>>],
        config: &BatchConfig,
    ) -> Vec<(Retried<OutputOf<S, A>>, Duration)> {
        let submitted: Vec<_> = chunk
            .iter()
            .map(|entry| {
                let engine = self.flow.engine().clone();
                let data = entry.data.clone();
                let timeout = config.item_timeout();
                let (job, rx) = Job::new(Priority::Normal, move || {
                    let engine = engine.clone();
                    let data = data.clone();
                    async move {
                        match tokio::time::timeout(timeout, engine.analyze(&data)).await {
                            Ok(result) => result.map_err(AppError::from),
                            Err(_) => Err(AppError::from(CapabilityError::timeout(OP_ANALYZE, timeout))),
                        }
                    }
                })
                .with_id(format!("{}-{}", entry.ctx.run_id, entry.ctx.operation_id()))
                .with_max_retries(config.max_retries)
                .with_completion();

                let op_id = entry.ctx.operation_id();
                self.metrics.start_operation(&op_id, OP_ANALYZE);
                (entry, op_id, queue.submit(job), rx, Instant::now())
            })
            .collect();

        join_all(submitted.into_iter().map(|(entry, op_id, job_id, rx, started)| async move {
            let result = match job_id {
                Err(e) => Err(CapabilityError::Unavailable(e.to_string())),
                Ok(_) => match rx.await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(CapabilityError::Failed(e.to_string())),
                    Err(_) => Err(CapabilityError::Failed("任务队列已关闭".to_string())),
                },
            };
            let meta = BTreeMap::from([("item_index".to_string(), entry.ctx.index.to_string())]);
            self.metrics.end_operation(&op_id, OP_ANALYZE, result.is_ok(), meta);
            (
                Retried {
                    result,
                    attempts: 1,
                    retried_errors: Vec::new(),
                },
                started.elapsed(),
            )
        }))
        .await
    }

    // ========== 恢复后的重试 ==========

    /// 按恢复计划重试失败条目，第 n 次失败的条目等待 n 个延迟单位
    async fn run_retry_plan(
        &self,
        run: &mut RunOf<S, A>,
        plan: &[RetryPlanEntry],
        ex: &mut Exec<'_>,
    ) -> Result<(), Abort> {
        let mut ordered = plan.to_vec();
        ordered.sort_by_key(|entry| (entry.delay_ms, entry.index));
        let phase_start = Instant::now();

        for entry in ordered {
            if run.result_for(entry.index).is_some_and(|r| r.success) {
                continue;
            }
            let wait = entry.delay().saturating_sub(phase_start.elapsed());
            if !wait.is_zero() {
                info!(
                    "⏳ 条目 {} 将在 {} 秒后重试 (已失败 {} 次)",
                    entry.item_id,
                    wait.as_secs(),
                    entry.attempt_count
                );
                tokio::select! {
                    _ = ex.token.cancelled() => return Err(Abort::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            if ex.token.is_cancelled() {
                return Err(Abort::Cancelled);
            }

            let attempt = next_attempt(run, entry.index);
            self.process_item(run, entry.index, attempt, ex).await?;
            self.check_breaker(ex)?;
        }
        Ok(())
    }

    /// 把本次执行中失败的条目在末尾再跑一次
    async fn retry_at_end(&self, run: &mut RunOf<S, A>, ex: &mut Exec<'_>) -> Result<(), Abort> {
        let mut indices = std::mem::take(&mut ex.failed_indices);
        indices.sort_unstable();
        indices.dedup();
        if indices.is_empty() {
            return Ok(());
        }

        info!("🔁 末尾重试 {} 个失败条目", indices.len());
        for index in indices {
            if ex.token.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            if run.result_for(index).is_some_and(|r| r.success) {
                continue;
            }
            let attempt = next_attempt(run, index);
            self.process_item(run, index, attempt, ex).await?;
            self.check_breaker(ex)?;
        }
        Ok(())
    }

    // ========== 结果记录 ==========

    fn record_errors(&self, run: &mut RunOf<S, A>, ctx: &ItemCtx, phase: Phase, errors: &[&CapabilityError]) {
        for error in errors {
            let message = error.to_string();
            run.record_failure(&ctx.item, phase, message.clone(), ctx.attempt);
            self.metrics.record_error(phase.as_str(), &message);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_item(
        &self,
        run: &mut RunOf<S, A>,
        ctx: &ItemCtx,
        tracker: &mut ItemTracker,
        data: DataOf<S>,
        output: OutputOf<S, A>,
        duration_ms: u64,
        ex: &mut Exec<'_>,
    ) -> Result<(), Abort> {
        tracker.transition(ItemState::Completed)?;
        let result = ItemResult::succeeded(ctx.item.clone(), data, output, duration_ms, ctx.attempt);
        self.finish_item(run, ctx, tracker, result, ex);
        info!("{} ✅ 完成 ({} ms)", ctx, duration_ms);

        let interval = run.config.checkpoint_interval;
        if interval > 0 && run.success_count() % interval == 0 {
            run.metrics = self.metrics_snapshot();
            self.checkpoints
                .save(run)
                .await
                .map_err(|e| Abort::Fatal(e.into()))?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_item(
        &self,
        run: &mut RunOf<S, A>,
        ctx: &ItemCtx,
        tracker: &mut ItemTracker,
        phase: Phase,
        error: &CapabilityError,
        extracted: Option<DataOf<S>>,
        duration_ms: u64,
        ex: &mut Exec<'_>,
    ) -> Result<(), Abort> {
        tracker.transition(ItemState::Failed)?;
        let result = ItemResult::failed(ctx.item.clone(), extracted, error.to_string(), duration_ms, ctx.attempt);
        self.finish_item(run, ctx, tracker, result, ex);
        ex.failed += 1;
        ex.failed_indices.push(ctx.index);
        warn!("{} ❌ {}阶段失败: {}", ctx, phase.as_str(), error);
        Ok(())
    }

    fn finish_item(
        &self,
        run: &mut RunOf<S, A>,
        ctx: &ItemCtx,
        tracker: &ItemTracker,
        result: ItemResult<DataOf<S>, OutputOf<S, A>>,
        ex: &mut Exec<'_>,
    ) {
        let success = result.success;
        let duration_ms = result.duration_ms;
        let newly_terminal = run.result_for(ctx.index).is_none();
        run.record_result(result);
        advance_cursor(run);

        ex.processed += 1;
        self.metrics.take_resource_snapshot();
        ex.reporter.item_finished(duration_ms, newly_terminal);
        let meta = BTreeMap::from([
            ("item_index".to_string(), ctx.index.to_string()),
            ("item_id".to_string(), ctx.item.id.clone()),
        ]);
        self.metrics
            .end_operation(&ctx.operation_id(), ITEM_OPERATION, success, meta);
        ex.reporter.emit(ctx.index, tracker.state());
    }

    /// 失败率熔断
    fn check_breaker(&self, ex: &Exec<'_>) -> Result<(), Abort> {
        if ex.processed >= BREAKER_MIN_SAMPLE && ex.failed * 2 > ex.processed {
            error!(
                "🔥 错误率过高 ({}/{})，熔断中止批处理",
                ex.failed, ex.processed
            );
            return Err(Abort::HighErrorRate {
                failed: ex.failed,
                processed: ex.processed,
            });
        }
        Ok(())
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            indicators: self.metrics.live_indicators(),
            operation_count: self.metrics.operation_count(),
            error_count: self.metrics.error_count(),
        }
    }

    fn notify(&self, report: &Report, status: RunStatus) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(&CompletionEvent::from_report(report, status));
        }
    }
}

fn validate_items(items: &[ItemRef]) -> Result<(), OrchestratorError> {
    if items.is_empty() {
        return Err(OrchestratorError::InvalidInput("条目列表为空".to_string()));
    }
    if let Some((position, item)) = items.iter().enumerate().find(|(i, item)| item.index != *i) {
        return Err(OrchestratorError::InvalidInput(format!(
            "条目 {} 的位置是 {}，应为 {}",
            item.id, item.index, position
        )));
    }
    Ok(())
}

/// 本次执行要处理的条目：起始位置之后、未跳过、还没有终态结果
///
/// 已失败的条目只通过重试计划或末尾重试再次处理。
fn pending_indices<D, O>(run: &BatchRun<D, O>, strategy: &ResumeStrategy) -> Vec<usize> {
    (strategy.start_index..run.total_items())
        .filter(|index| !strategy.skip.contains(index))
        .filter(|index| run.result_for(*index).is_none())
        .collect()
}

fn next_attempt<D, O>(run: &BatchRun<D, O>, index: usize) -> u32 {
    run.result_for(index).map_or(1, |r| r.attempt + 1)
}

/// 游标移到第一个还没有结果的条目
fn advance_cursor<D, O>(run: &mut BatchRun<D, O>) {
    while run.current_index < run.total_items() && run.result_for(run.current_index).is_some() {
        run.current_index += 1;
    }
}

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use batch_orchestrator::checkpoint::{Checkpoint, ResumeOptions};
use batch_orchestrator::error::CapabilityError;
use batch_orchestrator::metrics::ResourceProbe;
use batch_orchestrator::models::{ConfigOverride, ExecutionMode};
use batch_orchestrator::orchestrator::{CompletionEvent, RunStatus};
use batch_orchestrator::services::{AnalysisEngine, FnProgress, ItemDataSource, NoopProgress, ProgressSink};
use batch_orchestrator::{
    BatchConfig, BatchOrchestrator, CheckpointManager, ItemRef, ItemState, MemoryStore, MetricsCollector,
    OrchestratorError, PriorityJobQueue, Progress, QueueConfig,
};

// ========== 测试替身 ==========

/// 外部条目列表；`ids` 表示外部系统里真实的顺序
struct FakeSource {
    ids: Vec<String>,
    /// 抓取时永久失败的条目
    broken: HashSet<String>,
    extract_calls: AtomicUsize,
}

impl FakeSource {
    fn new(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            broken: HashSet::new(),
            extract_calls: AtomicUsize::new(0),
        }
    }

    fn broken_on(mut self, ids: &[&str]) -> Self {
        self.broken = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemDataSource for FakeSource {
    type Data = String;

    async fn activate(&self, item: &ItemRef) -> Result<(), CapabilityError> {
        if item.index < self.ids.len() {
            Ok(())
        } else {
            Err(CapabilityError::NotFound(item.id.clone()))
        }
    }

    async fn item_id_at(&self, index: usize) -> Result<Option<String>, CapabilityError> {
        Ok(self.ids.get(index).cloned())
    }

    async fn extract(&self, item: &ItemRef) -> Result<String, CapabilityError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(&item.id) {
            return Err(CapabilityError::InvalidResponse(format!("{} 内容为空", item.id)));
        }
        Ok(format!("data-{}", item.id))
    }
}

/// 分析引擎：`failing` 里的数据永久失败，并记录最大并发
#[derive(Default)]
struct FakeEngine {
    failing: Mutex<HashSet<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeEngine {
    fn failing_on(ids: &[&str]) -> Self {
        Self {
            failing: Mutex::new(ids.iter().map(|id| format!("data-{}", id)).collect()),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

#[async_trait]
impl AnalysisEngine<String> for FakeEngine {
    type Output = Value;

    async fn analyze(&self, data: &String) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(data) {
            return Err(CapabilityError::Failed(format!("无法分析 {}", data)));
        }
        Ok(json!({"category": "ok", "source": data}))
    }
}

type Orchestrator = BatchOrchestrator<FakeSource, FakeEngine>;

fn items(ids: &[&str]) -> Vec<ItemRef> {
    ids.iter().enumerate().map(|(i, id)| ItemRef::new(*id, i)).collect()
}

fn config() -> BatchConfig {
    BatchConfig {
        checkpoint_interval: 0,
        max_retries: 0,
        retry_base_delay_ms: 1,
        item_timeout_ms: 2_000,
        ..Default::default()
    }
}

fn setup(source: FakeSource, engine: FakeEngine) -> (Arc<FakeSource>, Arc<FakeEngine>, Arc<CheckpointManager>, Orchestrator) {
    let source = Arc::new(source);
    let engine = Arc::new(engine);
    let checkpoints = Arc::new(CheckpointManager::new(Arc::new(MemoryStore::new())));
    let orchestrator = BatchOrchestrator::new(source.clone(), engine.clone(), checkpoints.clone());
    (source, engine, checkpoints, orchestrator)
}

const IDS: [&str; 5] = ["q0", "q1", "q2", "q3", "q4"];

// ========== 基本流程 ==========

#[tokio::test]
async fn test_sequential_run_completes_every_item() {
    let (source, _engine, _cps, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let seen = Mutex::new(Vec::<Progress>::new());
    let sink = FnProgress(|p: &Progress| seen.lock().unwrap().push(p.clone()));

    let report = orchestrator.run(items(&IDS), config(), &sink).await.unwrap();

    assert_eq!(report.total, 5);
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.failed, 0);
    assert!(!report.cancelled);
    assert_eq!(report.summary.categories.get("ok"), Some(&5));
    assert_eq!(source.extract_calls(), 5);

    let seen = seen.lock().unwrap();
    let last = seen.last().unwrap();
    assert_eq!(last.item_state, ItemState::Completed);
    assert_eq!(last.percent_complete, 100.0);
    assert!(seen.iter().any(|p| p.item_state == ItemState::Extracting));

    let run = orchestrator.last_run().unwrap();
    assert_eq!(run.current_index, 5);
    assert_eq!(run.results[0].extracted.as_deref(), Some("data-q0"));
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let (_, _, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());

    let empty = orchestrator.run(Vec::new(), config(), &NoopProgress).await;
    assert!(matches!(empty, Err(OrchestratorError::InvalidInput(_))));

    let mut misplaced = items(&IDS);
    misplaced[2].index = 7;
    let result = orchestrator.run(misplaced, config(), &NoopProgress).await;
    assert!(matches!(result, Err(OrchestratorError::InvalidInput(_))));

    let bad_config = BatchConfig {
        max_concurrency: 0,
        ..config()
    };
    let result = orchestrator.run(items(&IDS), bad_config, &NoopProgress).await;
    assert!(matches!(result, Err(OrchestratorError::InvalidInput(_))));
}

#[tokio::test]
async fn test_second_run_while_running_is_rejected() {
    let (_, _, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::slow(Duration::from_millis(30)));

    let (first, second) = tokio::join!(orchestrator.run(items(&IDS), config(), &NoopProgress), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        orchestrator.run(items(&IDS), config(), &NoopProgress).await
    });

    assert!(first.is_ok());
    assert!(matches!(second, Err(OrchestratorError::AlreadyRunning)));
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_orchestrators_sharing_a_source_do_not_overlap() {
    let source = Arc::new(FakeSource::new(&IDS));
    let engine = Arc::new(FakeEngine::slow(Duration::from_millis(30)));
    let checkpoints = Arc::new(CheckpointManager::new(Arc::new(MemoryStore::new())));
    let first = BatchOrchestrator::new(source.clone(), engine.clone(), checkpoints.clone());
    let second = BatchOrchestrator::new(source.clone(), engine.clone(), checkpoints);

    let (a, b) = tokio::join!(first.run(items(&IDS), config(), &NoopProgress), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(second.is_running());
        second.run(items(&IDS), config(), &NoopProgress).await
    });

    assert!(a.is_ok());
    assert!(matches!(b, Err(OrchestratorError::AlreadyRunning)));
    assert_eq!(source.extract_calls(), 5);
    assert!(!first.is_running() && !second.is_running());

    // 前一个批次结束后，另一个编排器可以接着使用同一数据源
    assert!(second.run(items(&IDS), config(), &NoopProgress).await.is_ok());
}

#[tokio::test]
async fn test_completion_event_is_sent() {
    let (_, _, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<CompletionEvent>();
    let orchestrator = orchestrator.with_notifier(Arc::new(tx));

    let report = orchestrator.run(items(&IDS), config(), &NoopProgress).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.run_id, report.run_id);
    assert_eq!(event.status, RunStatus::Completed);
    assert_eq!(event.succeeded, 5);
}

// ========== 检查点 ==========

#[tokio::test]
async fn test_checkpoint_cadence_follows_success_count() {
    let (_, _, checkpoints, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let cfg = BatchConfig {
        checkpoint_interval: 2,
        ..config()
    };

    let report = orchestrator.run(items(&IDS), cfg, &NoopProgress).await.unwrap();

    // 第 2、4 个成功后各写一次；正常完成不写中断检查点
    let saved = checkpoints.list_checkpoints(Some(&report.run_id)).await.unwrap();
    assert_eq!(saved.len(), 2);
    assert!(report.checkpoint_id.is_none());

    let latest: Checkpoint<String, Value> = checkpoints.load(&saved[0].id).await.unwrap();
    assert_eq!(latest.completed_results.len(), 4);
    assert_eq!(latest.current_index, 4);
}

#[tokio::test]
async fn test_state_drift_aborts_and_saves_checkpoint() {
    let (source, _, checkpoints, orchestrator) =
        setup(FakeSource::new(&["q0", "q1", "moved", "q3", "q4"]), FakeEngine::default());

    let result = orchestrator.run(items(&IDS), config(), &NoopProgress).await;

    match result {
        Err(OrchestratorError::StateDrift { index, expected, actual }) => {
            assert_eq!(index, 2);
            assert_eq!(expected, "q2");
            assert_eq!(actual.as_deref(), Some("moved"));
        }
        other => panic!("应当因漂移中止: {:?}", other.map(|r| r.run_id)),
    }
    assert_eq!(source.extract_calls(), 2);

    let run = orchestrator.last_run().unwrap();
    assert_eq!(run.results.len(), 2);
    let saved = checkpoints.list_checkpoints(Some(&run.run_id)).await.unwrap();
    assert_eq!(saved.len(), 1);
    let checkpoint: Checkpoint<String, Value> = checkpoints.load(&saved[0].id).await.unwrap();
    assert_eq!(checkpoint.resume_metadata.reason.as_deref(), Some("aborted"));
}

// ========== 熔断 ==========

#[tokio::test]
async fn test_circuit_breaker_trips_before_fifth_item() {
    let (source, _, _, orchestrator) =
        setup(FakeSource::new(&IDS), FakeEngine::failing_on(&["q0", "q1", "q2", "q3"]));

    let result = orchestrator.run(items(&IDS), config(), &NoopProgress).await;

    match result {
        Err(OrchestratorError::HighErrorRate { failed, processed, partial }) => {
            assert_eq!((failed, processed), (4, 4));
            assert_eq!(partial.failed, 4);
            assert_eq!(partial.errors.len(), 4);
            assert!(partial.checkpoint_id.is_some());
        }
        other => panic!("应当熔断: {:?}", other.map(|r| r.run_id)),
    }
    // 第 5 个条目不会被处理
    assert_eq!(source.extract_calls(), 4);
}

#[tokio::test]
async fn test_isolated_failures_do_not_trip_breaker() {
    let (_, _, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::failing_on(&["q1", "q3"]));

    let report = orchestrator.run(items(&IDS), config(), &NoopProgress).await.unwrap();

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 2);
    // 分析失败时保留抓取数据
    assert_eq!(report.summary.partial_failures, 2);
}

// ========== 并行模式 ==========

#[tokio::test]
async fn test_parallel_mode_bounds_analysis_concurrency() {
    let ids = ["a", "b", "c", "d", "e", "f", "g"];
    let (source, engine, _, orchestrator) = setup(FakeSource::new(&ids), FakeEngine::slow(Duration::from_millis(20)));
    let cfg = BatchConfig {
        mode: ExecutionMode::Parallel,
        max_concurrency: 2,
        ..config()
    };

    let report = orchestrator.run(items(&ids), cfg, &NoopProgress).await.unwrap();

    assert_eq!(report.succeeded, 7);
    assert_eq!(source.extract_calls(), 7);
    assert_eq!(engine.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_parallel_mode_through_job_queue() {
    let ids = ["a", "b", "c", "d", "e", "f"];
    let (_, engine, _, orchestrator) = setup(FakeSource::new(&ids), FakeEngine::slow(Duration::from_millis(20)));
    let queue = PriorityJobQueue::new(QueueConfig {
        max_concurrency: 2,
        ..Default::default()
    });
    let orchestrator = orchestrator.with_analysis_queue(queue.clone());
    let cfg = BatchConfig {
        mode: ExecutionMode::Parallel,
        max_concurrency: 4,
        ..config()
    };

    let report = orchestrator.run(items(&ids), cfg, &NoopProgress).await.unwrap();

    assert_eq!(report.succeeded, 6);
    assert!(engine.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(queue.stats().completed, 6);
}

fn parallel(max_concurrency: usize) -> BatchConfig {
    BatchConfig {
        mode: ExecutionMode::Parallel,
        max_concurrency,
        ..config()
    }
}

#[tokio::test]
async fn test_parallel_breaker_trips_during_extraction() {
    let (source, engine, _, orchestrator) = setup(
        FakeSource::new(&IDS).broken_on(&["q0", "q1", "q2", "q3"]),
        FakeEngine::default(),
    );

    let result = orchestrator.run(items(&IDS), parallel(2), &NoopProgress).await;

    match result {
        Err(OrchestratorError::HighErrorRate { failed, processed, partial }) => {
            assert_eq!((failed, processed), (4, 4));
            assert_eq!(partial.failed, 4);
            assert!(partial.checkpoint_id.is_some());
        }
        other => panic!("应当在抓取阶段熔断: {:?}", other.map(|r| r.run_id)),
    }
    // 第 5 个条目不再抓取，分析阶段不会开始
    assert_eq!(source.extract_calls(), 4);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_parallel_breaker_waits_for_chunk_to_finish() {
    let ids = ["a", "b", "c", "d", "e", "f", "g"];
    let (source, engine, checkpoints, orchestrator) =
        setup(FakeSource::new(&ids), FakeEngine::failing_on(&["a", "b", "c", "d"]));

    // 分块 [a b c] [d e f] [g]，第二块的 d 触发熔断
    let result = orchestrator.run(items(&ids), parallel(3), &NoopProgress).await;

    let partial = match result {
        Err(OrchestratorError::HighErrorRate { failed, processed, partial }) => {
            assert_eq!((failed, processed), (4, 4));
            partial
        }
        other => panic!("应当熔断: {:?}", other.map(|r| r.run_id)),
    };
    // 同一块里 e、f 的结果仍然落入批次，g 所在的块不再开始
    assert_eq!((partial.succeeded, partial.failed), (2, 4));
    assert_eq!(source.extract_calls(), 7);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 6);

    let checkpoint: Checkpoint<String, Value> =
        checkpoints.load(partial.checkpoint_id.as_deref().unwrap()).await.unwrap();
    assert_eq!(checkpoint.completed_results.len(), 6);
    assert_eq!(checkpoint.current_index, 6);
    assert_eq!(checkpoint.resume_metadata.reason.as_deref(), Some("high_error_rate"));
}

#[tokio::test]
async fn test_parallel_checkpoint_cadence_follows_success_count() {
    let (_, _, checkpoints, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let cfg = BatchConfig {
        checkpoint_interval: 2,
        ..parallel(2)
    };

    let report = orchestrator.run(items(&IDS), cfg, &NoopProgress).await.unwrap();

    let saved = checkpoints.list_checkpoints(Some(&report.run_id)).await.unwrap();
    assert_eq!(saved.len(), 2);
    let latest: Checkpoint<String, Value> = checkpoints.load(&saved[0].id).await.unwrap();
    assert_eq!(latest.completed_results.len(), 4);
    assert_eq!(latest.current_index, 4);
}

/// 在某个条目到达指定状态时取消
fn cancel_at(orchestrator: &Arc<Orchestrator>, index: usize, state: ItemState) -> impl ProgressSink {
    let handle = orchestrator.clone();
    FnProgress(move |p: &Progress| {
        if p.current_index == index && p.item_state == state {
            handle.cancel();
        }
    })
}

#[tokio::test]
async fn test_parallel_cancel_at_chunk_boundary_then_resume() {
    let (source, engine, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let orchestrator = Arc::new(orchestrator);
    let sink = cancel_at(&orchestrator, 1, ItemState::Completed);

    let result = orchestrator.run(items(&IDS), parallel(2), &sink).await;

    let checkpoint_id = match result {
        Err(OrchestratorError::Cancelled { partial }) => {
            assert_eq!((partial.succeeded, partial.failed), (2, 0));
            partial.checkpoint_id.clone().unwrap()
        }
        other => panic!("应当被取消: {:?}", other.map(|r| r.run_id)),
    };
    assert_eq!(source.extract_calls(), 5);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);

    let report = orchestrator.resume(&checkpoint_id, &NoopProgress).await.unwrap();

    assert_eq!(report.succeeded, 5);
    // 未分析的条目重新抓取，已完成的不会
    assert_eq!(source.extract_calls(), 8);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_parallel_cancel_between_phases_then_resume() {
    let (source, engine, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let orchestrator = Arc::new(orchestrator);
    let sink = cancel_at(&orchestrator, 4, ItemState::Extracting);

    let result = orchestrator.run(items(&IDS), parallel(2), &sink).await;

    let checkpoint_id = match result {
        Err(OrchestratorError::Cancelled { partial }) => {
            assert_eq!(partial.processed(), 0);
            partial.checkpoint_id.clone().unwrap()
        }
        other => panic!("应当被取消: {:?}", other.map(|r| r.run_id)),
    };
    // 进行中的抓取不会被打断，分析阶段不会开始
    assert_eq!(source.extract_calls(), 5);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);

    let report = orchestrator.resume(&checkpoint_id, &NoopProgress).await.unwrap();
    assert_eq!(report.succeeded, 5);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 5);
}

// ========== 取消与恢复 ==========

#[tokio::test]
async fn test_cancel_then_resume_finishes_remaining_items() {
    let (source, _, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let orchestrator = Arc::new(orchestrator);
    let handle = orchestrator.clone();
    let sink = FnProgress(move |p: &Progress| {
        if p.current_index == 1 && p.item_state == ItemState::Completed {
            handle.cancel();
        }
    });

    let result = orchestrator.run(items(&IDS), config(), &sink).await;

    let checkpoint_id = match result {
        Err(OrchestratorError::Cancelled { partial }) => {
            assert!(partial.cancelled);
            assert_eq!(partial.succeeded, 2);
            assert_eq!(partial.failed, 0);
            partial.checkpoint_id.clone().unwrap()
        }
        other => panic!("应当被取消: {:?}", other.map(|r| r.run_id)),
    };
    assert_eq!(source.extract_calls(), 2);

    let report = orchestrator.resume(&checkpoint_id, &NoopProgress).await.unwrap();

    assert_eq!(report.succeeded, 5);
    assert!(!report.cancelled);
    // 已完成的条目不会重新抓取
    assert_eq!(source.extract_calls(), 5);
    let run = orchestrator.last_run().unwrap();
    assert_eq!(run.resume.resume_count, 1);
    assert_eq!(run.resume.resumed_from.as_deref(), Some(checkpoint_id.as_str()));
}

async fn run_with_one_failure(orchestrator: &Orchestrator, checkpoints: &CheckpointManager) -> String {
    let ids = &IDS[..4];
    let cfg = BatchConfig {
        checkpoint_interval: 1,
        ..config()
    };
    let report = orchestrator.run(items(ids), cfg, &NoopProgress).await.unwrap();
    assert_eq!((report.succeeded, report.failed), (3, 1));
    checkpoints
        .latest_for_run(&report.run_id)
        .await
        .unwrap()
        .unwrap()
        .id
}

#[tokio::test]
async fn test_resume_skipping_failed_items() {
    let (_, engine, checkpoints, orchestrator) = setup(FakeSource::new(&IDS[..4]), FakeEngine::failing_on(&["q1"]));
    let checkpoint_id = run_with_one_failure(&orchestrator, &checkpoints).await;
    let calls_before = engine.calls.load(Ordering::SeqCst);

    let options = ResumeOptions {
        skip_failed: true,
        ..Default::default()
    };
    let report = orchestrator
        .resume_with(&checkpoint_id, &ConfigOverride::default(), &options, &NoopProgress)
        .await
        .unwrap();

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(engine.calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn test_resume_retrying_failed_items() {
    let (_, engine, checkpoints, orchestrator) = setup(FakeSource::new(&IDS[..4]), FakeEngine::failing_on(&["q1"]));
    let checkpoint_id = run_with_one_failure(&orchestrator, &checkpoints).await;
    engine.heal();

    let options = ResumeOptions {
        retry_failed: true,
        retry_delay_unit_ms: 10,
        ..Default::default()
    };
    let report = orchestrator
        .resume_with(&checkpoint_id, &ConfigOverride::default(), &options, &NoopProgress)
        .await
        .unwrap();

    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 0);
    let retried = report.outcomes.iter().find(|o| o.index == 1).unwrap();
    assert!(retried.success);
    assert_eq!(retried.attempt, 2);
}

#[tokio::test]
async fn test_resume_rejects_config_change_when_disallowed() {
    let (_, _, checkpoints, orchestrator) = setup(FakeSource::new(&IDS[..4]), FakeEngine::failing_on(&["q1"]));
    let checkpoint_id = run_with_one_failure(&orchestrator, &checkpoints).await;

    let overrides = ConfigOverride {
        max_retries: Some(5),
        ..Default::default()
    };
    let options = ResumeOptions {
        allow_config_changes: false,
        ..Default::default()
    };
    let result = orchestrator
        .resume_with(&checkpoint_id, &overrides, &options, &NoopProgress)
        .await;

    assert!(matches!(result, Err(OrchestratorError::Checkpoint(_))));
}

#[tokio::test]
async fn test_resume_unknown_checkpoint_fails() {
    let (_, _, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let result = orchestrator.resume("cp-missing", &NoopProgress).await;
    assert!(matches!(result, Err(OrchestratorError::Checkpoint(_))));
}

#[tokio::test]
async fn test_cancel_during_resume_setup_is_not_lost() {
    let (source, _, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let orchestrator = Arc::new(orchestrator);
    let sink = cancel_at(&orchestrator, 1, ItemState::Completed);
    let first = match orchestrator.run(items(&IDS), config(), &sink).await {
        Err(OrchestratorError::Cancelled { partial }) => partial.checkpoint_id.clone().unwrap(),
        other => panic!("应当被取消: {:?}", other.map(|r| r.run_id)),
    };

    // 恢复还在读取检查点时收到的取消
    orchestrator.cancel();
    let second = match orchestrator.resume(&first, &NoopProgress).await {
        Err(OrchestratorError::Cancelled { partial }) => {
            assert_eq!(partial.succeeded, 2);
            partial.checkpoint_id.clone().unwrap()
        }
        other => panic!("取消不应被丢弃: {:?}", other.map(|r| r.run_id)),
    };
    assert_eq!(source.extract_calls(), 2);

    // 令牌在上一批次结束时重置
    let report = orchestrator.resume(&second, &NoopProgress).await.unwrap();
    assert_eq!(report.succeeded, 5);
}

// ========== 指标 ==========

/// 每次采样增长 8MB
struct GrowingMemory {
    bytes: AtomicU64,
}

impl ResourceProbe for GrowingMemory {
    fn memory_bytes(&self) -> Option<u64> {
        Some(self.bytes.fetch_add(8 * 1024 * 1024, Ordering::SeqCst))
    }
}

#[tokio::test]
async fn test_memory_growth_during_run_is_reported_as_leak() {
    let (_, _, _, orchestrator) = setup(FakeSource::new(&IDS), FakeEngine::default());
    let metrics = Arc::new(MetricsCollector::with_probe(Box::new(GrowingMemory {
        bytes: AtomicU64::new(100 * 1024 * 1024),
    })));
    let orchestrator = orchestrator.with_metrics(metrics);
    let live_usage = Arc::new(Mutex::new(Vec::new()));
    let recorded = live_usage.clone();
    let sink = FnProgress(move |p: &Progress| {
        if p.item_state.is_terminal() {
            recorded.lock().unwrap().push(p.indicators.resource_usage_mb);
        }
    });

    let report = orchestrator.run(items(&IDS), config(), &sink).await.unwrap();

    let leak = report.metrics.leak;
    assert!(leak.suspected);
    assert_eq!(leak.mean_growth_bytes, (8 * 1024 * 1024) as f64);
    assert!(leak.confidence > 0.0);
    // 运行过程中就能看到内存用量
    let usage = live_usage.lock().unwrap().clone();
    assert_eq!(usage.len(), 5);
    assert!(usage.iter().all(|mb| *mb >= 100.0));
    assert!(usage.windows(2).all(|pair| pair[1] > pair[0]));
}

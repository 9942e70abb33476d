use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};

use batch_orchestrator::browser::connect_to_browser_and_page;
use batch_orchestrator::models::{load_items_file, ExecutionMode};
use batch_orchestrator::orchestrator::CompletionEvent;
use batch_orchestrator::queue::TranscriptionQueue;
use batch_orchestrator::services::{
    AudioTranscriber, BrowserEnvironmentProbe, BrowserItemSource, LlmAnalysisEngine, WhisperHttpClient,
};
use batch_orchestrator::utils::logging::{append_log_line, init_log_file, print_final_stats};
use batch_orchestrator::{
    logger, BatchOrchestrator, CheckpointManager, Config, FileStore, JsExecutor, Progress, PriorityJobQueue,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::from_env()?;

    // 初始化日志
    logger::init(config.verbose_logging);
    init_log_file(&config.output_log_file)?;

    // ========== 准备资源 ==========
    let session = connect_to_browser_and_page(config.browser_debug_port, &config.target_url).await?;
    let browser = Arc::new(session.browser);
    let executor = Arc::new(JsExecutor::new(session.page));
    let mut source = BrowserItemSource::new(executor);
    if let Some(whisper_url) = &config.whisper_api_url {
        info!("🎙️ 启用音频转写: {}", whisper_url);
        let whisper = Arc::new(WhisperHttpClient::new(whisper_url.as_str()));
        let transcription = TranscriptionQueue::new(
            whisper,
            config.queue_config(),
            config.batch_config().item_timeout(),
        );
        source = source.with_transcriber(AudioTranscriber::new(Arc::new(transcription)));
    }
    let source = Arc::new(source);
    let engine = Arc::new(LlmAnalysisEngine::new(&config));

    let store = Arc::new(FileStore::open(&config.checkpoint_dir).await?);
    let checkpoints = Arc::new(
        CheckpointManager::new(store).with_probe(Arc::new(BrowserEnvironmentProbe::new(browser.clone()))),
    );

    let (done_tx, mut done_rx) = unbounded_channel::<CompletionEvent>();
    let mut orchestrator = BatchOrchestrator::new(source, engine, checkpoints)
        .with_verbose_logging(config.verbose_logging)
        .with_notifier(Arc::new(done_tx));
    if config.execution_mode == ExecutionMode::Parallel {
        orchestrator = orchestrator.with_analysis_queue(PriorityJobQueue::new(config.queue_config()));
    }
    let orchestrator = Arc::new(orchestrator);

    // ========== 进度消费 ==========
    let (progress_tx, mut progress_rx) = unbounded_channel::<Progress>();
    let log_path = config.output_log_file.clone();
    let consumer = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            if !progress.item_state.is_terminal() {
                continue;
            }
            let eta = progress
                .estimated_time_remaining()
                .map(|d| format!("{}s", d.as_secs()))
                .unwrap_or_else(|| "-".to_string());
            info!(
                "📈 进度 {:.1}% (条目 {}/{} {}), 预计剩余 {}",
                progress.percent_complete,
                progress.current_index + 1,
                progress.total,
                progress.item_state.as_str(),
                eta
            );
            let line = format!(
                "[{}] 条目 {} {}",
                chrono::Local::now().format("%H:%M:%S"),
                progress.current_index + 1,
                progress.item_state.as_str()
            );
            if let Err(e) = append_log_line(&log_path, &line) {
                warn!("写入运行日志失败: {}", e);
            }
        }
    });

    // Ctrl-C → 取消
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.cancel();
            }
        });
    }

    // ========== 运行 ==========
    let outcome = match &config.resume_checkpoint {
        Some(checkpoint_id) => {
            info!("♻️ 从检查点恢复: {}", checkpoint_id);
            orchestrator.resume(checkpoint_id, &progress_tx).await
        }
        None => {
            let items = load_items_file(Path::new(&config.items_file)).await?;
            orchestrator.run(items, config.batch_config(), &progress_tx).await
        }
    };

    drop(progress_tx);
    let _ = consumer.await;
    while let Ok(event) = done_rx.try_recv() {
        info!("🔔 批处理 {} 结束: {:?}", event.run_id, event.status);
    }

    match outcome {
        Ok(report) => {
            print_final_stats(&report, &config.output_log_file);
            Ok(())
        }
        Err(e) => {
            if let Some(partial) = e.partial_report() {
                print_final_stats(partial, &config.output_log_file);
                if let Some(checkpoint_id) = &partial.checkpoint_id {
                    info!("💾 设置 RESUME_CHECKPOINT={} 可继续运行", checkpoint_id);
                }
            }
            Err(e.into())
        }
    }
}

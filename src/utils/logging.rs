/// 日志工具模块
///
/// 提供日志格式化和输出的辅助函数
use anyhow::Result;
use std::fs;
use tracing::info;

use crate::models::{BatchConfig, ExecutionMode};
use crate::orchestrator::Report;

/// 初始化运行日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n批处理运行日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 追加一行到运行日志文件
pub fn append_log_line(log_file_path: &str, line: &str) -> Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new().append(true).create(true).open(log_file_path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &BatchConfig) {
    let mode = match config.mode {
        ExecutionMode::Sequential => "顺序模式",
        ExecutionMode::Parallel => "两阶段并行模式",
    };
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - {}", mode);
    info!("📊 最大并发数: {}", config.max_concurrency);
    info!(
        "💾 每 {} 个成功条目保存一次检查点 (保留 {} 个)",
        config.checkpoint_interval, config.max_checkpoints
    );
    info!("{}", "=".repeat(60));
}

/// 记录条目加载信息
pub fn log_items_loaded(total: usize, max_concurrency: usize) {
    info!("✓ 找到 {} 个待处理的条目", total);
    info!("📋 分析阶段将以每批 {} 个的方式处理", max_concurrency);
}

/// 记录批次开始信息
///
/// # 参数
/// - `chunk_num`: 分块编号
/// - `total_chunks`: 分块总数
/// - `start`: 起始条目编号
/// - `end`: 结束条目编号
/// - `total`: 条目总数
pub fn log_batch_start(chunk_num: usize, total_chunks: usize, start: usize, end: usize, total: usize) {
    info!("{}", "─".repeat(60));
    info!("📦 开始分析第 {}/{} 批", chunk_num, total_chunks);
    info!("📄 本批条目: {}-{} / 共 {} 个", start, end, total);
}

pub fn log_batch_complete(chunk_num: usize, success: usize, total: usize) {
    info!("✓ 第 {} 批完成: 成功 {}/{}", chunk_num, success, total);
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
pub fn print_final_stats(report: &Report, log_file_path: &str) {
    info!("{}", "=".repeat(60));
    info!("📊 批处理统计 ({})", report.run_id);
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", report.succeeded, report.total);
    info!("❌ 失败: {}", report.failed);
    if report.skipped > 0 {
        info!("⏭️ 跳过: {}", report.skipped);
    }
    if report.cancelled {
        info!("🚫 批处理被取消");
    }
    info!("⏱️ 平均每条: {:.0} ms", report.summary.mean_item_ms);
    for (category, count) in &report.summary.categories {
        info!("   {}: {}", category, count);
    }
    info!("{}", "=".repeat(60));
    info!("日志已保存至: {}", log_file_path);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_text("批处理引擎", 3), "批处理...");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn test_log_file_header_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let path = path.to_str().unwrap();

        init_log_file(path).unwrap();
        append_log_line(path, "条目 1 完成").unwrap();

        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("批处理运行日志"));
        assert!(content.ends_with("条目 1 完成\n"));
    }
}

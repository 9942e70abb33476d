//! 外部能力调用的超时与重试
//!
//! 只有瞬时错误（超时、服务不可用）会重试，第 n 次重试前等待
//! `retry_base_delay * 2^(n-1)`。每次调用都受 `item_timeout` 约束。

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::CapabilityError;
use crate::models::BatchConfig;

/// 重试结果
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, CapabilityError>,
    /// 实际调用次数
    pub attempts: u32,
    /// 被重试掉的错误（不含最终错误）
    pub retried_errors: Vec<CapabilityError>,
}

impl<T> Retried<T> {
    /// 全部失败记录（含最终错误）
    pub fn all_errors(&self) -> Vec<&CapabilityError> {
        let mut errors: Vec<&CapabilityError> = self.retried_errors.iter().collect();
        if let Err(e) = &self.result {
            errors.push(e);
        }
        errors
    }
}

/// 带超时地执行一次调用
pub async fn call_with_timeout<T, Fut>(
    operation: &str,
    config: &BatchConfig,
    call: Fut,
) -> Result<T, CapabilityError>
where
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    match tokio::time::timeout(config.item_timeout(), call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::timeout(operation, config.item_timeout())),
    }
}

/// 带超时和退避重试地执行调用
///
/// 退避等待期间收到取消信号时立即返回最后一次错误。
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    config: &BatchConfig,
    cancel: &CancellationToken,
    mut call: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut retried_errors = Vec::new();
    let mut attempt = 1;

    loop {
        match call_with_timeout(operation, config, call()).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                    retried_errors,
                }
            }
            Err(e) if e.is_transient() && attempt <= config.max_retries => {
                let delay = config.backoff_delay(attempt);
                warn!(
                    "🔄 {} 失败 ({}), {} ms 后重试 ({}/{})",
                    operation,
                    e,
                    delay.as_millis(),
                    attempt,
                    config.max_retries
                );
                retried_errors.push(e);

                tokio::select! {
                    _ = cancel.cancelled() => {
                        let last = retried_errors.pop().unwrap_or(CapabilityError::Failed("已取消".to_string()));
                        return Retried {
                            result: Err(last),
                            attempts: attempt,
                            retried_errors,
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                return Retried {
                    result: Err(e),
                    attempts: attempt,
                    retried_errors,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn config(max_retries: u32) -> BatchConfig {
        BatchConfig {
            max_retries,
            retry_base_delay_ms: 10,
            item_timeout_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let retried = with_retry("extract", &config(3), &CancellationToken::new(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CapabilityError::Unavailable("busy".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(retried.result, Ok(42));
        assert_eq!(retried.attempts, 3);
        assert_eq!(retried.retried_errors.len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let retried: Retried<()> = with_retry("analyze", &config(3), &CancellationToken::new(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::InvalidResponse("bad json".into()))
        })
        .await;

        assert!(retried.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retried.all_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded_with_doubling_backoff() {
        let started = Instant::now();
        let retried: Retried<()> = with_retry("extract", &config(3), &CancellationToken::new(), || async {
            Err(CapabilityError::Unavailable("down".into()))
        })
        .await;

        assert_eq!(retried.attempts, 4);
        assert_eq!(retried.all_errors().len(), 4);
        // 10 + 20 + 40
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let retried: Retried<()> = with_retry("extract", &config(0), &CancellationToken::new(), || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
        .await;

        assert!(matches!(retried.result, Err(CapabilityError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let token = CancellationToken::new();
        token.cancel();
        let mut cfg = config(5);
        cfg.retry_base_delay_ms = 10_000;

        let started = Instant::now();
        let retried: Retried<()> = with_retry("extract", &cfg, &token, || async {
            Err(CapabilityError::Unavailable("down".into()))
        })
        .await;

        assert_eq!(retried.attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

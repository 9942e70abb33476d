//! 浏览器环境探测
//!
//! 恢复前确认检查点里记录的标签页还在。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Browser;
use tracing::debug;

use crate::services::traits::{EnvironmentProbe, HandleState};

pub struct BrowserEnvironmentProbe {
    browser: Arc<Browser>,
    timeout: Duration,
}

impl BrowserEnvironmentProbe {
    pub fn new(browser: Arc<Browser>) -> Self {
        Self {
            browser,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl EnvironmentProbe for BrowserEnvironmentProbe {
    async fn probe(&self, handle_id: &str) -> HandleState {
        let pages = match tokio::time::timeout(self.timeout, self.browser.pages()).await {
            Ok(Ok(pages)) => pages,
            Ok(Err(e)) => {
                debug!("获取页面列表失败: {}", e);
                return HandleState::Unreachable;
            }
            Err(_) => return HandleState::Unreachable,
        };

        if pages.iter().any(|page| page.target_id().inner() == handle_id) {
            HandleState::Present
        } else {
            debug!("浏览器中有 {} 个页面，但没有 {}", pages.len(), handle_id);
            HandleState::Missing
        }
    }
}

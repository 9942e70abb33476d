use std::time::Duration;

use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tracing::{debug, error, info};

use crate::error::CapabilityError;

/// 已连接的浏览器和目标页面
pub struct BrowserSession {
    pub browser: Browser,
    pub page: Page,
}

/// 连接到开启了远程调试的浏览器，找到（或打开）目标页面
///
/// 先在已有标签页里找 URL 以 `target_url` 开头的页面，找不到再新建。
pub async fn connect_to_browser_and_page(port: u16, target_url: &str) -> Result<BrowserSession, CapabilityError> {
    let browser_url = format!("http://localhost:{}", port);
    info!("🌐 正在连接到浏览器: {}", browser_url);

    let (browser, mut handler) = Browser::connect(&browser_url).await.map_err(|e| {
        error!("连接浏览器失败: {}", e);
        CapabilityError::Unavailable(format!("无法连接浏览器 {}: {}", browser_url, e))
    })?;

    // 在后台处理浏览器事件
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });

    // 等待浏览器同步标签页列表
    tokio::time::sleep(Duration::from_millis(300)).await;

    let pages = browser.pages().await?;
    debug!("获取到 {} 个页面", pages.len());

    for page in pages {
        if let Ok(Some(url)) = page.url().await {
            if !target_url.is_empty() && url.starts_with(target_url) {
                info!("✓ 复用已打开的页面: {}", url);
                return Ok(BrowserSession { browser, page });
            }
        }
    }

    let start = if target_url.is_empty() { "about:blank" } else { target_url };
    debug!("未找到目标页面，新建并导航到: {}", start);
    let page = browser.new_page(start).await.map_err(|e| {
        error!("创建新页面失败: {}", e);
        CapabilityError::from(e)
    })?;
    info!("✓ 已打开: {}", start);

    Ok(BrowserSession { browser, page })
}

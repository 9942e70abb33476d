use crate::models::item::ItemRef;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

/// 条目清单文件
///
/// ```toml
/// name = "夜间批次"
///
/// [[items]]
/// id = "A-1001"
/// label = "张三"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ItemsFile {
    #[serde(default)]
    pub name: Option<String>,
    pub items: Vec<ItemEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemEntry {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ItemsFile {
    /// 解析 TOML 文本
    pub fn parse(content: &str) -> Result<Self> {
        let file: ItemsFile = toml::from_str(content).context("无法解析条目清单")?;
        if file.items.is_empty() {
            anyhow::bail!("条目清单为空");
        }
        Ok(file)
    }

    /// 转换为按顺序编号的条目引用
    pub fn into_item_refs(self) -> Vec<ItemRef> {
        self.items
            .into_iter()
            .enumerate()
            .map(|(index, entry)| ItemRef {
                id: entry.id,
                index,
                label: entry.label,
                metadata: entry.metadata,
            })
            .collect()
    }
}

/// 从 TOML 文件加载条目清单
pub async fn load_items_file(path: &Path) -> Result<Vec<ItemRef>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", path.display()))?;

    let file = ItemsFile::parse(&content)
        .with_context(|| format!("无法解析TOML文件: {}", path.display()))?;

    if let Some(name) = &file.name {
        tracing::info!("正在加载批次: {}", name);
    }

    let items = file.into_item_refs();
    tracing::info!("成功加载 {} 个条目", items.len());
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_items_file_assigns_indices() {
        let file = ItemsFile::parse(
            r#"
            name = "demo"

            [[items]]
            id = "a"
            label = "第一个"

            [[items]]
            id = "b"
            metadata = { ward = "3B" }
            "#,
        )
        .unwrap();

        let items = file.into_item_refs();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].index, 0);
        assert_eq!(items[0].display_name(), "第一个");
        assert_eq!(items[1].index, 1);
        assert_eq!(items[1].metadata.get("ward").map(String::as_str), Some("3B"));
    }

    #[test]
    fn test_empty_items_file_is_rejected() {
        assert!(ItemsFile::parse("items = []").is_err());
    }

    #[tokio::test]
    async fn test_load_items_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.toml");
        std::fs::write(&path, "[[items]]\nid = \"x\"\n").unwrap();

        let items = load_items_file(&path).await.unwrap();
        assert_eq!(items, vec![ItemRef::new("x", 0)]);
    }
}

//! 检查点的落盘格式
//!
//! 第一行是正文字节的十六进制 SHA-256，其余字节是 JSON 正文。
//! 任意字节被改动都会导致校验失败。

use sha2::{Digest, Sha256};

use crate::error::CheckpointError;

/// 计算十六进制 SHA-256
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// 给正文加上校验行
pub fn seal(body: &[u8]) -> (String, Vec<u8>) {
    let hash = digest(body);
    let mut sealed = Vec::with_capacity(hash.len() + 1 + body.len());
    sealed.extend_from_slice(hash.as_bytes());
    sealed.push(b'\n');
    sealed.extend_from_slice(body);
    (hash, sealed)
}

/// 校验并取出正文，返回 `(hash, body)`
pub fn unseal<'a>(id: &str, raw: &'a [u8]) -> Result<(String, &'a [u8]), CheckpointError> {
    let Some(split) = raw.iter().position(|&b| b == b'\n') else {
        return Err(CheckpointError::InvalidStructure {
            id: id.to_string(),
            reason: "缺少校验行".to_string(),
        });
    };

    let (header, rest) = raw.split_at(split);
    let body = &rest[1..];
    let expected = String::from_utf8_lossy(header).trim().to_string();
    let actual = digest(body);

    if expected != actual {
        return Err(CheckpointError::IntegrityMismatch {
            id: id.to_string(),
            expected,
            actual,
        });
    }
    Ok((actual, body))
}

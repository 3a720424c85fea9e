// 管理员主机密钥注册表
// 以 keys/<name> 存储 { "key": "<PEM 私钥>" }

use tracing::{debug, info};

use super::storage::Storage;
use crate::error::{BackendError, Result};
use crate::models::HostKey;
use crate::ssh::decode_private_key;

const KEY_PREFIX: &str = "keys/";

fn key_path(name: &str) -> String {
    format!("{}{}", KEY_PREFIX, name)
}

/// 密钥名只允许 ASCII 字母、数字、下划线和连字符
pub fn validate_key_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(BackendError::Validation(format!("Invalid key name '{}'", name)))
    }
}

/// 读取密钥，不存在时返回 None（与存储故障区分开）
pub fn get_key(storage: &dyn Storage, name: &str) -> Result<Option<HostKey>> {
    let Some(value) = storage.get(&key_path(name))? else {
        return Ok(None);
    };
    let key: HostKey = serde_json::from_value(value).map_err(|e| {
        BackendError::Storage(anyhow::anyhow!("corrupt entry at {}: {}", key_path(name), e))
    })?;
    Ok(Some(key))
}

/// 注册或覆盖密钥
/// 空密钥和无法解析的密钥返回校验错误，不改变已有状态
pub fn write_key(storage: &dyn Storage, name: &str, key: &str) -> Result<()> {
    validate_key_name(name)?;

    if key.trim().is_empty() {
        return Err(BackendError::Validation("Missing key".to_string()));
    }
    if let Err(e) = decode_private_key(key) {
        debug!("[Registry] Rejected key '{}': {}", name, e);
        return Err(BackendError::Validation("Invalid key".to_string()));
    }

    let value = serde_json::to_value(HostKey {
        key: key.to_string(),
    })
    .map_err(|e| BackendError::Storage(e.into()))?;
    storage.put(&key_path(name), value)?;

    info!("[Registry] Registered host key '{}'", name);
    Ok(())
}

/// 删除密钥（幂等）
pub fn delete_key(storage: &dyn Storage, name: &str) -> Result<()> {
    storage.delete(&key_path(name))?;
    info!("[Registry] Deleted host key '{}'", name);
    Ok(())
}

/// 列出已注册的密钥名
pub fn list_keys(storage: &dyn Storage) -> Result<Vec<String>> {
    Ok(storage.list(KEY_PREFIX)?)
}

// 管理员主机密钥数据结构

use std::fmt;

use serde::{Deserialize, Serialize};

/// 管理员主机密钥（存储在 keys/<name>）
/// 该私钥在目标主机上具有 root 权限，用于安装 / 卸载动态公钥
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKey {
    pub key: String,
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKey").field("key", &"<redacted>").finish()
    }
}

// 租约引擎错误类型定义

use thiserror::Error;

use crate::ssh::SshError;

/// 引擎错误类型
#[derive(Debug, Error)]
pub enum BackendError {
    /// 用户输入不合法（空密钥、无法解析的密钥等），不改变任何状态
    #[error("{0}")]
    Validation(String),

    /// secret 内部元数据缺失或类型不符（数据损坏或版本不兼容）
    #[error("secret is missing internal data: {0}")]
    Integrity(String),

    /// 管理员主机密钥不存在
    #[error("key '{0}' not found")]
    KeyNotFound(String),

    /// 远程传输 / 执行失败，租约管理器应按计划重试
    #[error("error {operation} on {target}: {source}")]
    Transport {
        operation: &'static str,
        target: String,
        #[source]
        source: SshError,
    },

    /// 存储后端故障
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    /// 动态密钥生成失败
    #[error("failed to generate dynamic key: {0}")]
    KeyGeneration(String),

    /// 未注册的 secret 类型
    #[error("unknown secret type '{0}'")]
    UnknownSecretKind(String),

    /// 租约不存在（从未登记或已撤销）
    #[error("lease '{0}' not found")]
    UnknownLease(String),
}

impl BackendError {
    /// 是否可重试（传输、存储类故障）
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transport { .. } | BackendError::Storage(_))
    }

    /// 是否为用户输入错误
    pub fn is_validation(&self) -> bool {
        matches!(self, BackendError::Validation(_))
    }

    pub(crate) fn transport(operation: &'static str, target: impl Into<String>, source: SshError) -> Self {
        BackendError::Transport {
            operation,
            target: target.into(),
            source,
        }
    }
}

/// Result 别名
pub type Result<T> = std::result::Result<T, BackendError>;

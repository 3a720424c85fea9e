// SSH 客户端核心实现

use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use super::config::SshConfig;
use super::error::SshError;
use super::handler::SshClientHandler;
use super::proxy::connect_via_proxy;
use super::session::SshSession;

/// SSH 客户端
/// 负责建立 SSH 连接并返回 SshSession
pub struct SshClient {
    /// 连接配置
    config: SshConfig,
}

impl SshClient {
    /// 创建新的 SSH 客户端
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// 执行连接（异步）
    /// 返回 SshSession 用于后续操作
    pub async fn connect(&self) -> Result<SshSession, SshError> {
        let target = self.config.target();
        debug!("[SSH] Connecting to {}", target);

        // 解析私钥放在网络连接之前，坏密钥不必走一趟网络
        let key = decode_private_key(&self.config.private_key)?;

        let connect_timeout = Duration::from_secs(self.config.connect_timeout);
        let tcp_stream = match &self.config.proxy {
            Some(proxy) => {
                debug!("[SSH] Using {:?} proxy {}:{}", proxy.proxy_type, proxy.host, proxy.port);
                connect_via_proxy(proxy, &self.config.host, self.config.port, connect_timeout)
                    .await?
            }
            None => {
                let addr = format!("{}:{}", self.config.host, self.config.port);
                let socket_addr = lookup_host(addr.as_str())
                    .await
                    .map_err(|e| SshError::Config(format!("Failed to resolve address: {}", e)))?
                    .next()
                    .ok_or_else(|| SshError::Config("No valid address found".to_string()))?;

                timeout(connect_timeout, TcpStream::connect(socket_addr))
                    .await
                    .map_err(|_| SshError::Timeout(self.config.connect_timeout))?
                    .map_err(SshError::Io)?
            }
        };

        // SSH 握手
        let russh_config = Arc::new(self.config.to_russh_config());
        let handler = SshClientHandler::new(&self.config.host, self.config.port);

        let mut handle = timeout(
            connect_timeout,
            russh::client::connect_stream(russh_config, tcp_stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(self.config.connect_timeout))?
        .map_err(SshError::from)?;

        self.authenticate(&mut handle, key).await?;

        info!("[SSH] Session established with {}", target);

        Ok(SshSession::new(Arc::new(handle), self.config.host.clone()))
    }

    /// 公钥认证
    async fn authenticate(
        &self,
        handle: &mut Handle<SshClientHandler>,
        key: russh::keys::PrivateKey,
    ) -> Result<(), SshError> {
        use russh::client::AuthResult;

        // RSA 密钥按服务器支持的最佳哈希签名（rsa-sha2-256/512），其他密钥类型忽略该参数
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(SshError::from)?
            .flatten();
        let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

        let auth_result = handle
            .authenticate_publickey(&self.config.username, key_with_alg)
            .await
            .map_err(SshError::from)?;

        match auth_result {
            AuthResult::Success => Ok(()),
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                if partial_success {
                    return Err(SshError::Auth(
                        "Partial authentication - additional auth required".to_string(),
                    ));
                }
                Err(SshError::Auth(format!(
                    "Public key authentication failed for '{}'. Server suggests: {:?}",
                    self.config.username, remaining_methods
                )))
            }
        }
    }
}

/// 解析内存中的私钥文本（PEM 或 OpenSSH 格式）
pub fn decode_private_key(pem: &str) -> Result<russh::keys::PrivateKey, SshError> {
    russh::keys::decode_secret_key(pem, None)
        .map_err(|e| SshError::Key(format!("Failed to decode key: {}", e)))
}

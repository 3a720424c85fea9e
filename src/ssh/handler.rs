// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait

use russh::keys::PublicKey;
use std::future::Future;
use tracing::debug;

/// SSH 客户端 Handler
/// 目标主机由管理员私钥授信，这里只记录服务器公钥指纹
pub struct SshClientHandler {
    /// 目标地址（host:port，用于日志）
    target: String,
}

impl SshClientHandler {
    /// 创建新的 Handler
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            target: format!("{}:{}", host, port),
        }
    }
}

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256);

        debug!(
            "[SSH] Server key for {}: {} {}",
            self.target,
            server_public_key.algorithm(),
            fingerprint
        );

        async { Ok(true) }
    }
}

// SSH 传输模块
//
// 模块结构:
// - config: 连接配置 (SshConfig, ProxyConfig, KeepaliveConfig)
// - error: 错误类型 (SshError)
// - handler: russh Handler 实现
// - client: SSH 客户端核心（连接 + 公钥认证）
// - session: 会话 (SshSession, ExecChannel)，提供命令执行和 SFTP 写文件
// - proxy: HTTP / SOCKS5 代理隧道

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod proxy;
pub mod session;

// 公开导出
pub use client::{decode_private_key, SshClient};
pub use config::{KeepaliveConfig, ProxyConfig, ProxyType, SshConfig};
pub use error::SshError;
pub use session::{CommandOutput, ExecChannel, SshSession};

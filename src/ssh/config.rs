// SSH 连接配置

use std::fmt;
use std::time::Duration;

/// SSH 连接配置
/// 管理员私钥以 PEM 文本形式保存在内存中，不落盘
#[derive(Clone)]
pub struct SshConfig {
    /// 目标主机
    pub host: String,
    /// 端口
    pub port: u16,
    /// 用户名（管理员账户）
    pub username: String,
    /// 管理员私钥（PEM / OpenSSH 格式）
    pub private_key: String,
    /// 连接超时（秒）
    pub connect_timeout: u64,
    /// 代理配置
    pub proxy: Option<ProxyConfig>,
    /// 心跳配置
    pub keepalive: KeepaliveConfig,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            private_key: String::new(),
            connect_timeout: 30,
            proxy: None,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

// 私钥不能出现在日志中
impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("proxy", &self.proxy)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl SshConfig {
    /// 目标地址描述（user@host:port），用于日志和错误上下文
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// 构建 russh 配置
    pub fn to_russh_config(&self) -> russh::client::Config {
        let mut config = russh::client::Config::default();
        // russh 没有单独的 connection_timeout，用 inactivity_timeout 兜底
        config.inactivity_timeout = Some(Duration::from_secs(self.connect_timeout));
        if self.keepalive.enabled {
            config.keepalive_interval = Some(Duration::from_secs(self.keepalive.interval));
            config.keepalive_max = self.keepalive.max_retries as usize;
        }
        config
    }
}

/// 代理类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProxyType {
    #[default]
    Http,
    Socks5,
}

/// 代理配置
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// 代理类型
    pub proxy_type: ProxyType,
    /// 代理主机
    pub host: String,
    /// 代理端口
    pub port: u16,
    /// 认证信息（用户名, 密码）
    pub auth: Option<(String, String)>,
}

/// 心跳配置
#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    /// 是否启用心跳
    pub enabled: bool,
    /// 心跳间隔（秒）
    pub interval: u64,
    /// 最大重试次数
    pub max_retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 60,
            max_retries: 3,
        }
    }
}

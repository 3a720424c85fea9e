// Settings 配置数据结构

use serde::{Deserialize, Serialize};

use crate::ssh::{KeepaliveConfig, ProxyConfig, ProxyType as SshProxyType};

// ======================== 主配置结构 ========================

/// 服务设置（持久化用）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub lease: LeaseSettings,
    pub storage: StorageSettings,
}

// ======================== 连接设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// 连接超时（秒）
    pub connect_timeout: u64,
    /// 是否启用心跳
    pub keepalive_enabled: bool,
    /// 心跳间隔（秒）
    pub keepalive_interval: u64,
    /// 心跳最大重试次数
    pub keepalive_max: u32,
    /// 连接目标主机使用的代理
    pub proxy: Option<ProxySettings>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            keepalive_enabled: true,
            keepalive_interval: 60,
            keepalive_max: 3,
            proxy: None,
        }
    }
}

impl ConnectionSettings {
    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            enabled: self.keepalive_enabled,
            interval: self.keepalive_interval,
            max_retries: self.keepalive_max,
        }
    }
}

/// 代理类型
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub enum ProxyType {
    #[default]
    Http,
    Socks5,
}

/// 代理配置（持久化用）
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ProxySettings {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl From<&ProxySettings> for ProxyConfig {
    fn from(p: &ProxySettings) -> Self {
        ProxyConfig {
            proxy_type: match p.proxy_type {
                ProxyType::Http => SshProxyType::Http,
                ProxyType::Socks5 => SshProxyType::Socks5,
            },
            host: p.host.clone(),
            port: p.port,
            auth: match (&p.username, &p.password) {
                (Some(u), Some(pw)) => Some((u.clone(), pw.clone())),
                _ => None,
            },
        }
    }
}

// ======================== 租约设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// 单次 renew / revoke 调用的截止时间（秒），超时按传输失败处理
    pub revoke_timeout: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            revoke_timeout: 120,
        }
    }
}

// ======================== 存储设置 ========================

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// 存储文件路径，未设置时使用配置目录下的 store.json
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "connection": { "connect_timeout": 5 } }"#).unwrap();
        assert_eq!(settings.connection.connect_timeout, 5);
        assert_eq!(settings.connection.keepalive_interval, 60);
        assert_eq!(settings.lease.revoke_timeout, 120);
        assert!(settings.storage.path.is_none());
    }

    #[test]
    fn test_proxy_auth_requires_both_fields() {
        let mut proxy = ProxySettings {
            proxy_type: ProxyType::Socks5,
            host: "bastion".to_string(),
            port: 1080,
            username: Some("ops".to_string()),
            password: None,
        };
        assert!(ProxyConfig::from(&proxy).auth.is_none());

        proxy.password = Some("pw".to_string());
        let config = ProxyConfig::from(&proxy);
        assert_eq!(config.proxy_type, SshProxyType::Socks5);
        assert_eq!(config.auth, Some(("ops".to_string(), "pw".to_string())));
    }
}

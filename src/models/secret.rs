// Secret 数据结构
// 返回给调用方的 data 与仅供 renew / revoke 使用的 internal_data 分开保存

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::lease::LeaseOptions;
use crate::error::BackendError;

/// 带租约的 secret
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    /// 租约 ID
    pub lease_id: String,
    /// secret 类型标签（租约管理器按此分发 renew / revoke）
    pub kind: String,
    /// 返回给调用方的数据
    pub data: Map<String, Value>,
    /// 内部元数据，对调用方不透明
    pub internal_data: Map<String, Value>,
    /// 租约计时信息
    pub lease: LeaseOptions,
}

/// 动态密钥 secret 的内部元数据
/// 撤销时必须完整且类型正确，任何缺失都按完整性错误处理，不做默认值回退
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicKeyInternal {
    /// 目标主机上执行安装 / 卸载的管理员账户
    pub admin_user: String,
    /// 安装了动态公钥的登录账户
    pub username: String,
    pub ip: String,
    /// 元数据存储可能把数字还原成浮点数
    #[serde(deserialize_with = "port_from_number")]
    pub port: u16,
    /// 管理员主机密钥名（指向 keys/<name>）
    pub host_key_name: String,
    /// 动态公钥（OpenSSH 单行格式）
    pub dynamic_public_key: String,
    /// 安装时使用的脚本原文，卸载时原样复用
    pub install_script: String,
}

// 脚本内容较长，日志里只保留长度
impl fmt::Debug for DynamicKeyInternal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicKeyInternal")
            .field("admin_user", &self.admin_user)
            .field("username", &self.username)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("host_key_name", &self.host_key_name)
            .field("dynamic_public_key", &self.dynamic_public_key)
            .field("install_script", &format_args!("<{} bytes>", self.install_script.len()))
            .finish()
    }
}

impl DynamicKeyInternal {
    /// 从 secret 内部元数据解码
    pub fn from_internal_data(data: &Map<String, Value>) -> Result<Self, BackendError> {
        serde_json::from_value(Value::Object(data.clone()))
            .map_err(|e| BackendError::Integrity(e.to_string()))
    }

    /// 编码为 secret 内部元数据
    pub fn to_internal_data(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // 所有字段都是字符串或整数，序列化不会得到非对象
            _ => Map::new(),
        }
    }

    /// 目标地址描述（admin@ip:port）
    pub fn admin_target(&self) -> String {
        format!("{}@{}:{}", self.admin_user, self.ip, self.port)
    }
}

fn port_from_number<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw.fract() != 0.0 || !(1.0..=65535.0).contains(&raw) {
        return Err(D::Error::custom(format!("invalid port {}", raw)));
    }
    Ok(raw as u16)
}

// 租约相关数据结构

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 租约配置（存储在 config/lease，单位：秒）
/// lease_max 为 0 表示不设上限
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub lease: u64,
    pub lease_max: u64,
}

impl LeaseConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease)
    }

    pub fn lease_max(&self) -> Duration {
        Duration::from_secs(self.lease_max)
    }
}

/// 某一类 secret 的默认租期
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseDefaults {
    pub duration: Duration,
    pub grace_period: Duration,
}

/// 单个租约的计时信息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaseOptions {
    /// 当前有效期（从 renewed_at 起算）
    pub ttl: Duration,
    /// 宽限期
    pub grace_period: Duration,
    /// 本次续约请求的时长，0 表示使用配置的默认值
    pub increment: Duration,
    /// 签发时间
    pub issue_time: DateTime<Utc>,
    /// 最近一次续约时间
    pub renewed_at: Option<DateTime<Utc>>,
}

impl LeaseOptions {
    pub fn new(defaults: LeaseDefaults, issue_time: DateTime<Utc>) -> Self {
        Self {
            ttl: defaults.duration,
            grace_period: defaults.grace_period,
            increment: Duration::ZERO,
            issue_time,
            renewed_at: None,
        }
    }

    /// 过期时间
    pub fn expires_at(&self) -> DateTime<Utc> {
        let base = self.renewed_at.unwrap_or(self.issue_time);
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| base.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

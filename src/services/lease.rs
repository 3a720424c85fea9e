// 租约配置、续约策略与进程内租约管理器

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{info, warn};

use super::lifecycle::{BackendContext, SecretKind};
use super::storage::Storage;
use crate::error::{BackendError, Result};
use crate::models::{LeaseConfig, LeaseOptions, Secret};
use crate::ssh::SshError;

const LEASE_CONFIG_PATH: &str = "config/lease";

/// 记住的已撤销租约数量，超出后最早的记录被丢弃，state() 对其返回 None
const REVOKED_HISTORY: usize = 1024;

// ======================== 租约配置 ========================

/// 读取租约配置，未配置时返回 None
pub fn read_lease_config(storage: &dyn Storage) -> Result<Option<LeaseConfig>> {
    let Some(value) = storage.get(LEASE_CONFIG_PATH)? else {
        return Ok(None);
    };
    let config = serde_json::from_value(value).map_err(|e| {
        BackendError::Storage(anyhow::anyhow!("corrupt entry at {}: {}", LEASE_CONFIG_PATH, e))
    })?;
    Ok(Some(config))
}

/// 写入租约配置
pub fn write_lease_config(storage: &dyn Storage, config: &LeaseConfig) -> Result<()> {
    if config.lease_max != 0 && config.lease > config.lease_max {
        return Err(BackendError::Validation(format!(
            "lease ({}s) must not exceed lease_max ({}s)",
            config.lease, config.lease_max
        )));
    }
    let value = serde_json::to_value(config).map_err(|e| BackendError::Storage(e.into()))?;
    storage.put(LEASE_CONFIG_PATH, value)?;
    info!(
        "[Lease] Config updated: lease={}s lease_max={}s",
        config.lease, config.lease_max
    );
    Ok(())
}

// ======================== 续约策略 ========================

/// 计算续约后的租约
/// 续约时长取请求值（未请求时取配置的 lease），不超过 lease_max；
/// 配置了 lease_max 时，从签发起算的总寿命也不超过 lease_max
pub fn lease_extend(config: &LeaseConfig, current: &LeaseOptions, now: DateTime<Utc>) -> LeaseOptions {
    let mut ttl = if current.increment.is_zero() {
        config.lease()
    } else {
        current.increment
    };
    if ttl.is_zero() {
        ttl = current.ttl;
    }

    let lease_max = config.lease_max();
    if !lease_max.is_zero() {
        ttl = ttl.min(lease_max);

        let max_expire = chrono::Duration::from_std(lease_max)
            .ok()
            .and_then(|max| current.issue_time.checked_add_signed(max))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let remaining = (max_expire - now).to_std().unwrap_or(Duration::ZERO);
        ttl = ttl.min(remaining);
    }

    LeaseOptions {
        ttl,
        increment: Duration::ZERO,
        renewed_at: Some(now),
        ..current.clone()
    }
}

// ======================== 租约管理器 ========================

/// 单个租约的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// 可续约
    Active,
    /// 已发起撤销但尚未成功，等待重试
    RevocationInProgress,
    /// 已撤销
    Revoked,
}

/// 容量固定的最近撤销记录
struct RecentlyRevoked {
    capacity: usize,
    ids: VecDeque<String>,
}

impl RecentlyRevoked {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ids: VecDeque::with_capacity(capacity),
        }
    }

    fn insert(&mut self, lease_id: &str) {
        if self.contains(lease_id) {
            return;
        }
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(lease_id.to_string());
    }

    fn contains(&self, lease_id: &str) -> bool {
        self.ids.iter().any(|id| id == lease_id)
    }
}

struct LeaseEntry {
    secret: Secret,
    state: LeaseState,
    attempts: u32,
}

/// 进程内租约管理器
/// 按类型标签分发 renew / revoke，只有撤销完全成功才遗忘租约
pub struct LeaseManager {
    ctx: BackendContext,
    kinds: HashMap<&'static str, Arc<dyn SecretKind>>,
    leases: RwLock<HashMap<String, LeaseEntry>>,
    revoked: RwLock<RecentlyRevoked>,
    /// 单次 renew / revoke 的截止时间
    deadline: Duration,
}

impl LeaseManager {
    pub fn new(ctx: BackendContext, deadline: Duration) -> Self {
        Self {
            ctx,
            kinds: HashMap::new(),
            leases: RwLock::new(HashMap::new()),
            revoked: RwLock::new(RecentlyRevoked::new(REVOKED_HISTORY)),
            deadline,
        }
    }

    /// 注册一类 secret
    pub fn register(&mut self, kind: Arc<dyn SecretKind>) {
        self.kinds.insert(kind.type_tag(), kind);
    }

    pub fn context(&self) -> &BackendContext {
        &self.ctx
    }

    fn kind(&self, tag: &str) -> Result<Arc<dyn SecretKind>> {
        self.kinds
            .get(tag)
            .cloned()
            .ok_or_else(|| BackendError::UnknownSecretKind(tag.to_string()))
    }

    fn read_leases(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, LeaseEntry>> {
        self.leases.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_leases(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LeaseEntry>> {
        self.leases.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记新签发的 secret
    pub fn track(&self, secret: Secret) -> Result<()> {
        self.kind(&secret.kind)?;
        let lease_id = secret.lease_id.clone();
        self.write_leases().insert(
            lease_id,
            LeaseEntry {
                secret,
                state: LeaseState::Active,
                attempts: 0,
            },
        );
        Ok(())
    }

    /// 查询租约状态
    pub fn state(&self, lease_id: &str) -> Option<LeaseState> {
        if let Some(entry) = self.read_leases().get(lease_id) {
            return Some(entry.state);
        }
        let revoked = self.revoked.read().unwrap_or_else(|e| e.into_inner());
        revoked.contains(lease_id).then_some(LeaseState::Revoked)
    }

    /// 已尝试撤销的次数
    pub fn revoke_attempts(&self, lease_id: &str) -> Option<u32> {
        self.read_leases().get(lease_id).map(|e| e.attempts)
    }

    /// 获取仍在管理中的 secret
    pub fn secret(&self, lease_id: &str) -> Option<Secret> {
        self.read_leases().get(lease_id).map(|e| e.secret.clone())
    }

    /// 已过期（含宽限期）且尚未撤销的租约
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read_leases()
            .iter()
            .filter(|(_, entry)| {
                let grace = chrono::Duration::from_std(entry.secret.lease.grace_period)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                entry
                    .secret
                    .lease
                    .expires_at()
                    .checked_add_signed(grace)
                    .is_some_and(|deadline| deadline <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn deadline_error(&self, lease_id: &str) -> BackendError {
        BackendError::transport(
            "waiting for lease operation",
            lease_id,
            SshError::Timeout(self.deadline.as_secs()),
        )
    }

    /// 续约，increment 为 0 时使用配置的默认时长
    pub async fn renew(&self, lease_id: &str, increment: Duration) -> Result<LeaseOptions> {
        let mut secret = {
            let leases = self.read_leases();
            let entry = leases
                .get(lease_id)
                .ok_or_else(|| BackendError::UnknownLease(lease_id.to_string()))?;
            if entry.state != LeaseState::Active {
                return Err(BackendError::Validation(format!(
                    "lease '{}' is being revoked and cannot be renewed",
                    lease_id
                )));
            }
            entry.secret.clone()
        };
        secret.lease.increment = increment;

        let kind = self.kind(&secret.kind)?;
        let options = timeout(self.deadline, kind.renew(&self.ctx, &secret, Utc::now()))
            .await
            .map_err(|_| self.deadline_error(lease_id))??;

        if let Some(entry) = self.write_leases().get_mut(lease_id) {
            if entry.state == LeaseState::Active {
                entry.secret.lease = options.clone();
            }
        }
        Ok(options)
    }

    /// 撤销；失败时租约保持“撤销中”，之后重试会从头执行整个卸载流程
    pub async fn revoke(&self, lease_id: &str) -> Result<()> {
        let secret = {
            let mut leases = self.write_leases();
            let entry = leases
                .get_mut(lease_id)
                .ok_or_else(|| BackendError::UnknownLease(lease_id.to_string()))?;
            entry.state = LeaseState::RevocationInProgress;
            entry.attempts += 1;
            entry.secret.clone()
        };

        let kind = self.kind(&secret.kind)?;
        let result = match timeout(self.deadline, kind.revoke(&self.ctx, &secret)).await {
            Ok(result) => result,
            Err(_) => Err(self.deadline_error(lease_id)),
        };

        match result {
            Ok(()) => {
                self.write_leases().remove(lease_id);
                self.revoked
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(lease_id);
                info!("[Lease] Lease {} revoked", lease_id);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[Lease] Revocation of {} failed (retryable: {}): {}",
                    lease_id,
                    e.is_retryable(),
                    e
                );
                Err(e)
            }
        }
    }
}

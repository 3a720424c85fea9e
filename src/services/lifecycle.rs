// 动态密钥生命周期
// 签发：生成密钥对并安装到目标主机
// 续约：只调整租约时间，不做远程操作
// 撤销：按固定顺序卸载公钥，任何一步失败都返回错误，由租约管理器重试

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::{error, info};
use uuid::Uuid;

use super::installer::{
    is_shell_safe, script_filename, RemoteInstaller, RemoteTarget, DEFAULT_INSTALL_SCRIPT,
};
use super::lease::{lease_extend, read_lease_config};
use super::otp::OtpGenerator;
use super::registry;
use super::storage::Storage;
use crate::error::{BackendError, Result};
use crate::models::{
    DynamicKeyInternal, HostKey, LeaseConfig, LeaseDefaults, LeaseOptions, Secret,
};

/// 动态密钥 secret 的类型标签
pub const SECRET_DYNAMIC_KEY_TYPE: &str = "secret_dynamic_key_type";

/// 动态密钥默认租期 10 分钟，宽限期 2 分钟
pub const DYNAMIC_KEY_DEFAULTS: LeaseDefaults = LeaseDefaults {
    duration: Duration::from_secs(10 * 60),
    grace_period: Duration::from_secs(2 * 60),
};

/// 没有租约配置时续约使用的回退值：1 小时，不设上限
pub const FALLBACK_LEASE: LeaseConfig = LeaseConfig {
    lease: 60 * 60,
    lease_max: 0,
};

/// 每次生命周期操作显式传入的上下文
#[derive(Clone)]
pub struct BackendContext {
    pub storage: Arc<dyn Storage>,
    pub installer: Arc<dyn RemoteInstaller>,
    pub otp: OtpGenerator,
}

impl BackendContext {
    /// 创建上下文，salt 从存储读取（首次使用时生成）
    pub fn new(storage: Arc<dyn Storage>, installer: Arc<dyn RemoteInstaller>) -> Result<Self> {
        let otp = OtpGenerator::load_or_create(storage.as_ref())?;
        Ok(Self {
            storage,
            installer,
            otp,
        })
    }
}

/// 一类 secret 的续约 / 撤销回调，租约管理器按类型标签分发
#[async_trait]
pub trait SecretKind: Send + Sync {
    fn type_tag(&self) -> &'static str;

    fn defaults(&self) -> LeaseDefaults;

    async fn renew(
        &self,
        ctx: &BackendContext,
        secret: &Secret,
        now: DateTime<Utc>,
    ) -> Result<LeaseOptions>;

    async fn revoke(&self, ctx: &BackendContext, secret: &Secret) -> Result<()>;
}

/// 签发请求
#[derive(Clone, Debug)]
pub struct IssueRequest {
    /// 管理员主机密钥名
    pub host_key_name: String,
    /// 目标主机上的管理员账户
    pub admin_user: String,
    /// 要为其安装动态公钥的账户
    pub username: String,
    pub ip: String,
    pub port: u16,
    /// 自定义安装脚本，None 时使用默认脚本
    pub install_script: Option<String>,
}

impl IssueRequest {
    fn validate(&self) -> Result<()> {
        registry::validate_key_name(&self.host_key_name)?;
        if !is_shell_safe(&self.username) {
            return Err(BackendError::Validation(format!(
                "Invalid username '{}'",
                self.username
            )));
        }
        if self.admin_user.trim().is_empty() {
            return Err(BackendError::Validation("Missing admin_user".to_string()));
        }
        if self.ip.trim().is_empty() {
            return Err(BackendError::Validation("Missing ip".to_string()));
        }
        if self.port == 0 {
            return Err(BackendError::Validation("Invalid port 0".to_string()));
        }
        if matches!(&self.install_script, Some(script) if script.trim().is_empty()) {
            return Err(BackendError::Validation("Empty install_script".to_string()));
        }
        Ok(())
    }
}

/// 动态密钥对
struct DynamicKeyPair {
    private_key: String,
    public_key: String,
}

fn generate_key_pair() -> Result<DynamicKeyPair> {
    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .map_err(|e| BackendError::KeyGeneration(e.to_string()))?;
    let private_key = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| BackendError::KeyGeneration(e.to_string()))?
        .to_string();
    let public_key = key
        .public_key()
        .to_openssh()
        .map_err(|e| BackendError::KeyGeneration(e.to_string()))?;
    Ok(DynamicKeyPair {
        private_key,
        public_key,
    })
}

/// 上传到目标主机的公钥文件内容，必须以换行结尾，否则追加到 authorized_keys 时会和下一行粘连
fn public_key_payload(public_key: &str) -> Vec<u8> {
    let mut payload = public_key.trim_end().as_bytes().to_vec();
    payload.push(b'\n');
    payload
}

fn lookup_host_key(storage: &dyn Storage, name: &str) -> Result<HostKey> {
    registry::get_key(storage, name)?.ok_or_else(|| BackendError::KeyNotFound(name.to_string()))
}

/// 上传公钥和脚本后执行；公钥上传失败时不再碰脚本和 authorized_keys
async fn deliver_and_run(
    ctx: &BackendContext,
    internal: &DynamicKeyInternal,
    host_key: &HostKey,
    install: bool,
) -> Result<()> {
    let target = RemoteTarget::new(&internal.admin_user, &internal.ip, internal.port);
    let target_label = target.to_string();

    // 每次远程操作都用新的标识，不复用安装时的文件名
    let (_, key_filename) = ctx.otp.generate();

    ctx.installer
        .upload(
            &target,
            &host_key.key,
            &key_filename,
            &public_key_payload(&internal.dynamic_public_key),
        )
        .await
        .map_err(|e| BackendError::transport("uploading public key", &target_label, e))?;

    ctx.installer
        .upload(
            &target,
            &host_key.key,
            &script_filename(&key_filename),
            internal.install_script.as_bytes(),
        )
        .await
        .map_err(|e| BackendError::transport("uploading script file", &target_label, e))?;

    let operation = if install {
        "installing public key into authorized_keys file"
    } else {
        "removing public key from authorized_keys file"
    };
    ctx.installer
        .install_public_key(&target, &host_key.key, &key_filename, &internal.username, install)
        .await
        .map_err(|e| BackendError::transport(operation, &target_label, e))?;

    Ok(())
}

/// 动态密钥 secret
#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicKeySecret;

impl DynamicKeySecret {
    /// 签发动态密钥：生成密钥对，安装公钥，返回带租约的 secret
    pub async fn issue(&self, ctx: &BackendContext, request: &IssueRequest) -> Result<Secret> {
        request.validate()?;

        let host_key = lookup_host_key(ctx.storage.as_ref(), &request.host_key_name)?;
        let pair = generate_key_pair()?;

        let internal = DynamicKeyInternal {
            admin_user: request.admin_user.clone(),
            username: request.username.clone(),
            ip: request.ip.clone(),
            port: request.port,
            host_key_name: request.host_key_name.clone(),
            dynamic_public_key: pair.public_key,
            install_script: request
                .install_script
                .clone()
                .unwrap_or_else(|| DEFAULT_INSTALL_SCRIPT.to_string()),
        };

        if let Err(e) = deliver_and_run(ctx, &internal, &host_key, true).await {
            error!(
                "[Issue] Failed to install dynamic key for {} on {}: {}",
                internal.username, internal.ip, e
            );
            return Err(e);
        }

        let mut data = Map::new();
        data.insert("username".to_string(), json!(internal.username));
        data.insert("ip".to_string(), json!(internal.ip));
        data.insert("port".to_string(), json!(internal.port));
        data.insert("key".to_string(), Value::String(pair.private_key));
        data.insert("key_type".to_string(), json!("dynamic"));

        let secret = Secret {
            lease_id: Uuid::new_v4().to_string(),
            kind: SECRET_DYNAMIC_KEY_TYPE.to_string(),
            data,
            internal_data: internal.to_internal_data(),
            lease: LeaseOptions::new(self.defaults(), Utc::now()),
        };

        info!(
            "[Issue] Installed dynamic key for {}@{} (lease {})",
            internal.username, internal.ip, secret.lease_id
        );
        Ok(secret)
    }
}

#[async_trait]
impl SecretKind for DynamicKeySecret {
    fn type_tag(&self) -> &'static str {
        SECRET_DYNAMIC_KEY_TYPE
    }

    fn defaults(&self) -> LeaseDefaults {
        DYNAMIC_KEY_DEFAULTS
    }

    async fn renew(
        &self,
        ctx: &BackendContext,
        secret: &Secret,
        now: DateTime<Utc>,
    ) -> Result<LeaseOptions> {
        let config = read_lease_config(ctx.storage.as_ref())?.unwrap_or(FALLBACK_LEASE);
        let options = lease_extend(&config, &secret.lease, now);
        info!(
            "[Renew] Lease {} extended by {}s",
            secret.lease_id,
            options.ttl.as_secs()
        );
        Ok(options)
    }

    async fn revoke(&self, ctx: &BackendContext, secret: &Secret) -> Result<()> {
        // 元数据不完整时不做任何远程操作
        let internal = DynamicKeyInternal::from_internal_data(&secret.internal_data)?;

        let host_key = lookup_host_key(ctx.storage.as_ref(), &internal.host_key_name)?;

        if let Err(e) = deliver_and_run(ctx, &internal, &host_key, false).await {
            error!("[Revoke] Lease {} not revoked: {}", secret.lease_id, e);
            return Err(e);
        }

        info!(
            "[Revoke] Removed dynamic key for {}@{} (lease {})",
            internal.username, internal.ip, secret.lease_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> IssueRequest {
        IssueRequest {
            host_key_name: "root1".to_string(),
            admin_user: "root".to_string(),
            username: "deploy".to_string(),
            ip: "10.0.0.5".to_string(),
            port: 22,
            install_script: None,
        }
    }

    #[test]
    fn test_generated_pair_is_usable_by_ssh_client() {
        let pair = generate_key_pair().unwrap();
        assert!(crate::ssh::decode_private_key(&pair.private_key).is_ok());
        assert!(pair.public_key.starts_with("ssh-ed25519 "));
    }

    #[test]
    fn test_public_key_payload_ends_with_single_newline() {
        assert_eq!(public_key_payload("ssh-ed25519 AAAA"), b"ssh-ed25519 AAAA\n".to_vec());
        assert_eq!(public_key_payload("ssh-ed25519 AAAA\n"), b"ssh-ed25519 AAAA\n".to_vec());
    }

    #[test]
    fn test_issue_request_validation() {
        assert!(request().validate().is_ok());

        let mut bad = request();
        bad.username = "deploy; reboot".to_string();
        assert!(bad.validate().unwrap_err().is_validation());

        let mut bad = request();
        bad.port = 0;
        assert!(bad.validate().is_err());

        let mut bad = request();
        bad.install_script = Some("  ".to_string());
        assert!(bad.validate().is_err());

        let mut bad = request();
        bad.host_key_name = "a/b".to_string();
        assert!(bad.validate().is_err());
    }
}

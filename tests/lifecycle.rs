// 生命周期集成测试
// 使用内存存储和记录调用的假安装器，不访问网络

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use sshlease::models::{DynamicKeyInternal, LeaseConfig, Secret};
use sshlease::services::{
    registry, write_lease_config, BackendContext, DynamicKeySecret, IssueRequest, LeaseManager,
    LeaseState, MemoryStorage, RemoteInstaller, RemoteTarget, SecretKind, Storage,
    DEFAULT_INSTALL_SCRIPT,
};
use sshlease::ssh::SshError;
use sshlease::BackendError;

#[derive(Clone, Debug, PartialEq)]
enum Call {
    Upload {
        target: RemoteTarget,
        filename: String,
        payload: Vec<u8>,
    },
    Exec {
        target: RemoteTarget,
        filename: String,
        username: String,
        install: bool,
    },
}

/// 记录所有调用；可让第 n 次上传（从 1 开始）或执行失败
#[derive(Default)]
struct RecordingInstaller {
    calls: Mutex<Vec<Call>>,
    uploads: Mutex<usize>,
    fail_upload: Mutex<Option<usize>>,
    fail_exec: Mutex<bool>,
    delay: Option<Duration>,
}

impl RecordingInstaller {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn reset(&self) {
        self.calls.lock().unwrap().clear();
        *self.uploads.lock().unwrap() = 0;
        *self.fail_upload.lock().unwrap() = None;
        *self.fail_exec.lock().unwrap() = false;
    }

    fn fail_nth_upload(&self, n: usize) {
        *self.fail_upload.lock().unwrap() = Some(n);
    }

    fn fail_exec(&self) {
        *self.fail_exec.lock().unwrap() = true;
    }
}

#[async_trait]
impl RemoteInstaller for RecordingInstaller {
    async fn upload(
        &self,
        target: &RemoteTarget,
        _admin_key: &str,
        remote_filename: &str,
        payload: &[u8],
    ) -> Result<(), SshError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let n = {
            let mut uploads = self.uploads.lock().unwrap();
            *uploads += 1;
            *uploads
        };
        if *self.fail_upload.lock().unwrap() == Some(n) {
            return Err(SshError::Channel("connection reset by peer".to_string()));
        }
        self.calls.lock().unwrap().push(Call::Upload {
            target: target.clone(),
            filename: remote_filename.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn install_public_key(
        &self,
        target: &RemoteTarget,
        _admin_key: &str,
        remote_filename: &str,
        username: &str,
        install: bool,
    ) -> Result<(), SshError> {
        if *self.fail_exec.lock().unwrap() {
            return Err(SshError::RemoteCommand {
                exit_code: 1,
                stderr: "sudo: a password is required".to_string(),
            });
        }
        self.calls.lock().unwrap().push(Call::Exec {
            target: target.clone(),
            filename: remote_filename.to_string(),
            username: username.to_string(),
            install,
        });
        Ok(())
    }
}

fn admin_pem() -> String {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .unwrap()
        .to_openssh(LineEnding::LF)
        .unwrap()
        .to_string()
}

struct Fixture {
    storage: Arc<MemoryStorage>,
    installer: Arc<RecordingInstaller>,
    manager: LeaseManager,
}

fn fixture_with(installer: RecordingInstaller, deadline: Duration) -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    let installer = Arc::new(installer);
    registry::write_key(storage.as_ref(), "root1", &admin_pem()).unwrap();

    let ctx = BackendContext::new(storage.clone(), installer.clone()).unwrap();
    let mut manager = LeaseManager::new(ctx, deadline);
    manager.register(Arc::new(DynamicKeySecret));

    Fixture {
        storage,
        installer,
        manager,
    }
}

fn fixture() -> Fixture {
    fixture_with(RecordingInstaller::default(), Duration::from_secs(5))
}

fn issue_request() -> IssueRequest {
    IssueRequest {
        host_key_name: "root1".to_string(),
        admin_user: "root".to_string(),
        username: "deploy".to_string(),
        ip: "10.0.0.5".to_string(),
        port: 22,
        install_script: None,
    }
}

async fn issue(fx: &Fixture) -> Secret {
    let secret = DynamicKeySecret
        .issue(fx.manager.context(), &issue_request())
        .await
        .unwrap();
    fx.manager.track(secret.clone()).unwrap();
    fx.installer.reset();
    secret
}

fn upload_names(calls: &[Call]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::Upload { filename, .. } => Some(filename.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn issue_installs_key_and_returns_secret() {
    let fx = fixture();
    let secret = DynamicKeySecret
        .issue(fx.manager.context(), &issue_request())
        .await
        .unwrap();

    let calls = fx.installer.calls();
    assert_eq!(calls.len(), 3);
    assert!(matches!(&calls[2], Call::Exec { install: true, username, .. } if username == "deploy"));

    assert_eq!(secret.kind, "secret_dynamic_key_type");
    assert_eq!(secret.data["username"], json!("deploy"));
    assert_eq!(secret.data["ip"], json!("10.0.0.5"));
    assert_eq!(secret.data["key_type"], json!("dynamic"));
    let private_key = secret.data["key"].as_str().unwrap();
    assert!(sshlease::ssh::decode_private_key(private_key).is_ok());

    // 调用方数据中不含内部元数据
    assert!(secret.data.get("host_key_name").is_none());
    let internal = DynamicKeyInternal::from_internal_data(&secret.internal_data).unwrap();
    assert_eq!(internal.host_key_name, "root1");
    assert_eq!(internal.install_script, DEFAULT_INSTALL_SCRIPT);
    assert_eq!(secret.lease.ttl, Duration::from_secs(600));
    assert_eq!(secret.lease.grace_period, Duration::from_secs(120));
}

#[tokio::test]
async fn issue_with_unknown_host_key_touches_nothing() {
    let fx = fixture();
    let mut request = issue_request();
    request.host_key_name = "missing".to_string();

    let err = DynamicKeySecret
        .issue(fx.manager.context(), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::KeyNotFound(ref name) if name == "missing"));
    assert!(fx.installer.calls().is_empty());
}

#[tokio::test]
async fn revoke_runs_full_uninstall_pipeline() {
    let fx = fixture();
    let secret = issue(&fx).await;
    let internal = DynamicKeyInternal::from_internal_data(&secret.internal_data).unwrap();

    fx.manager.revoke(&secret.lease_id).await.unwrap();

    let calls = fx.installer.calls();
    assert_eq!(calls.len(), 3);
    let target = RemoteTarget::new("root", "10.0.0.5", 22);

    let key_file = match &calls[0] {
        Call::Upload {
            target: t,
            filename,
            payload,
        } => {
            assert_eq!(t, &target);
            assert_eq!(payload, &format!("{}\n", internal.dynamic_public_key).into_bytes());
            filename.clone()
        }
        other => panic!("expected public key upload, got {:?}", other),
    };
    assert_eq!(
        calls[1],
        Call::Upload {
            target: target.clone(),
            filename: format!("{}.sh", key_file),
            payload: DEFAULT_INSTALL_SCRIPT.as_bytes().to_vec(),
        }
    );
    assert_eq!(
        calls[2],
        Call::Exec {
            target,
            filename: key_file,
            username: "deploy".to_string(),
            install: false,
        }
    );

    assert_eq!(fx.manager.state(&secret.lease_id), Some(LeaseState::Revoked));
    assert!(fx.manager.secret(&secret.lease_id).is_none());
}

#[tokio::test]
async fn script_upload_failure_keeps_lease_for_retry() {
    let fx = fixture();
    let secret = issue(&fx).await;
    fx.installer.fail_nth_upload(2);

    let err = fx.manager.revoke(&secret.lease_id).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("uploading script file"));

    let calls = fx.installer.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls.iter().any(|c| matches!(c, Call::Exec { .. })));
    assert_eq!(
        fx.manager.state(&secret.lease_id),
        Some(LeaseState::RevocationInProgress)
    );
    assert!(fx.manager.secret(&secret.lease_id).is_some());

    // 重试从头执行，并使用新的文件名
    let first_name = upload_names(&calls)[0].clone();
    fx.installer.reset();
    fx.manager.revoke(&secret.lease_id).await.unwrap();
    let retried = upload_names(&fx.installer.calls());
    assert_eq!(retried.len(), 2);
    assert_ne!(retried[0], first_name);
    assert_eq!(fx.manager.state(&secret.lease_id), Some(LeaseState::Revoked));
}

#[tokio::test]
async fn public_key_upload_failure_aborts_before_script() {
    let fx = fixture();
    let secret = issue(&fx).await;
    fx.installer.fail_nth_upload(1);

    let err = fx.manager.revoke(&secret.lease_id).await.unwrap_err();
    assert!(err.to_string().contains("uploading public key"));
    assert!(fx.installer.calls().is_empty());
    assert_eq!(fx.manager.revoke_attempts(&secret.lease_id), Some(1));
}

#[tokio::test]
async fn remote_execution_failure_is_reported() {
    let fx = fixture();
    let secret = issue(&fx).await;
    fx.installer.fail_exec();

    let err = fx.manager.revoke(&secret.lease_id).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        BackendError::Transport {
            source: SshError::RemoteCommand { exit_code: 1, .. },
            ..
        }
    ));
    assert_eq!(
        fx.manager.state(&secret.lease_id),
        Some(LeaseState::RevocationInProgress)
    );
}

#[tokio::test]
async fn revoke_without_host_key_fails_before_network() {
    let fx = fixture();
    let secret = issue(&fx).await;
    registry::delete_key(fx.storage.as_ref(), "root1").unwrap();

    let err = fx.manager.revoke(&secret.lease_id).await.unwrap_err();
    assert!(matches!(err, BackendError::KeyNotFound(_)));
    assert!(!err.is_retryable());
    assert!(fx.installer.calls().is_empty());
    assert_ne!(fx.manager.state(&secret.lease_id), Some(LeaseState::Revoked));
}

#[tokio::test]
async fn revoke_with_incomplete_metadata_fails_before_network() {
    let fx = fixture();
    for field in ["admin_user", "ip", "port", "dynamic_public_key", "install_script"] {
        let mut secret = issue(&fx).await;
        secret.internal_data.remove(field);

        let err = DynamicKeySecret
            .revoke(fx.manager.context(), &secret)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Integrity(_)), "field {}", field);
        assert!(fx.installer.calls().is_empty());
    }
}

#[tokio::test]
async fn revoke_accepts_float_encoded_port() {
    let fx = fixture();
    let mut secret = issue(&fx).await;
    secret.internal_data.insert("port".to_string(), json!(2222.0));

    DynamicKeySecret
        .revoke(fx.manager.context(), &secret)
        .await
        .unwrap();
    assert!(fx
        .installer
        .calls()
        .iter()
        .all(|c| matches!(c, Call::Upload { target, .. } | Call::Exec { target, .. } if target.port == 2222)));
}

#[tokio::test]
async fn separate_revokes_use_distinct_identifiers() {
    let fx = fixture();
    let secret = issue(&fx).await;

    DynamicKeySecret
        .revoke(fx.manager.context(), &secret)
        .await
        .unwrap();
    let first = upload_names(&fx.installer.calls());
    fx.installer.reset();

    DynamicKeySecret
        .revoke(fx.manager.context(), &secret)
        .await
        .unwrap();
    let second = upload_names(&fx.installer.calls());

    assert_ne!(first[0], second[0]);
    assert_ne!(first[1], second[1]);
}

#[tokio::test]
async fn renew_caps_at_configured_maximum() {
    let fx = fixture();
    let secret = issue(&fx).await;
    write_lease_config(
        fx.storage.as_ref(),
        &LeaseConfig {
            lease: 3600,
            lease_max: 7200,
        },
    )
    .unwrap();

    let options = fx
        .manager
        .renew(&secret.lease_id, Duration::from_secs(3 * 3600))
        .await
        .unwrap();
    assert!(options.ttl <= Duration::from_secs(7200));
    let renewed_at = options.renewed_at.unwrap();
    assert!(options.expires_at() <= renewed_at + chrono::Duration::hours(2));
    assert!(fx.installer.calls().is_empty());
    assert_eq!(fx.manager.secret(&secret.lease_id).unwrap().lease, options);
}

#[tokio::test]
async fn renew_without_config_falls_back_to_one_hour() {
    let fx = fixture();
    let secret = issue(&fx).await;
    assert!(sshlease::services::read_lease_config(fx.storage.as_ref())
        .unwrap()
        .is_none());

    let options = fx
        .manager
        .renew(&secret.lease_id, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(options.ttl, Duration::from_secs(3600));
}

#[tokio::test]
async fn lease_in_revocation_cannot_be_renewed() {
    let fx = fixture();
    let secret = issue(&fx).await;
    fx.installer.fail_nth_upload(1);
    assert!(fx.manager.revoke(&secret.lease_id).await.is_err());

    let err = fx
        .manager
        .renew(&secret.lease_id, Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn unknown_lease_and_kind_are_rejected() {
    let fx = fixture();
    assert!(matches!(
        fx.manager.revoke("nope").await,
        Err(BackendError::UnknownLease(_))
    ));

    let mut secret = issue(&fx).await;
    secret.kind = "secret_other_type".to_string();
    assert!(matches!(
        fx.manager.track(secret),
        Err(BackendError::UnknownSecretKind(_))
    ));
}

#[tokio::test]
async fn slow_revoke_hits_deadline_and_stays_pending() {
    let installer = RecordingInstaller {
        delay: Some(Duration::from_millis(500)),
        ..Default::default()
    };
    let fx = fixture_with(installer, Duration::from_millis(50));

    // 签发绕过管理器的截止时间
    let secret = DynamicKeySecret
        .issue(fx.manager.context(), &issue_request())
        .await
        .unwrap();
    fx.manager.track(secret.clone()).unwrap();

    let err = fx.manager.revoke(&secret.lease_id).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        fx.manager.state(&secret.lease_id),
        Some(LeaseState::RevocationInProgress)
    );
}

#[tokio::test]
async fn expired_lists_leases_past_grace_period() {
    let fx = fixture();
    let secret = issue(&fx).await;

    let now = chrono::Utc::now();
    assert!(fx.manager.expired(now).is_empty());
    // 10 分钟租期 + 2 分钟宽限
    let later = secret.lease.issue_time + chrono::Duration::minutes(12);
    assert_eq!(fx.manager.expired(later), vec![secret.lease_id.clone()]);
}

#[test]
fn storage_is_shared_with_registry() {
    let storage = MemoryStorage::new();
    registry::write_key(&storage, "root1", &admin_pem()).unwrap();
    assert!(storage.get("keys/root1").unwrap().unwrap()["key"].is_string());
}

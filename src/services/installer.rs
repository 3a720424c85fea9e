// 远程安装协议
// 用管理员私钥把动态公钥和安装脚本传到目标主机，再远程执行脚本
// 在目标账户的 authorized_keys 中添加或删除该公钥

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::models::settings::ConnectionSettings;
use crate::ssh::{ProxyConfig, SshClient, SshConfig, SshError, SshSession};

/// 默认安装脚本
/// 参数：install|uninstall <公钥文件> <authorized_keys 文件>
/// 先删除已有的同一公钥，install 时再追加，保证重复安装不会留下多份。
/// 任何读写失败、或执行后公钥状态与预期不符时以非零状态退出
pub const DEFAULT_INSTALL_SCRIPT: &str = r#"#!/bin/bash
#
# Adds or removes a public key in an authorized_keys file.
# Usage: <script> install|uninstall <public key file> <authorized_keys file>

set -u

if [ $# -ne 3 ]; then
    echo "usage: $0 install|uninstall <public key file> <authorized_keys file>" >&2
    exit 1
fi

OPTION="$1"
PUBLIC_KEY_FILE="$2"
AUTH_KEYS_FILE="$3"
TEMP_FILE="temp_$(basename "$PUBLIC_KEY_FILE")"

trap 'rm -f "$PUBLIC_KEY_FILE" "$TEMP_FILE"' EXIT

case "$OPTION" in
    install|uninstall) ;;
    *)
        echo "unknown option $OPTION" >&2
        exit 1
        ;;
esac

if [ ! -s "$PUBLIC_KEY_FILE" ]; then
    echo "public key file $PUBLIC_KEY_FILE is missing" >&2
    exit 1
fi

if [ "$(id -u)" -eq 0 ]; then
    SUDO=""
elif command -v sudo > /dev/null 2>&1; then
    SUDO="sudo -n"
else
    echo "sudo is required to modify $AUTH_KEYS_FILE" >&2
    exit 1
fi

if ! $SUDO test -e "$AUTH_KEYS_FILE"; then
    $SUDO mkdir -p "$(dirname "$AUTH_KEYS_FILE")" || exit 1
    $SUDO touch "$AUTH_KEYS_FILE" || exit 1
fi

: > "$TEMP_FILE" || exit 1

# grep exits 1 when no lines remain, which is a valid result
$SUDO grep -vFf "$PUBLIC_KEY_FILE" "$AUTH_KEYS_FILE" > "$TEMP_FILE"
if [ $? -gt 1 ]; then
    echo "failed to read $AUTH_KEYS_FILE" >&2
    exit 1
fi

$SUDO tee "$AUTH_KEYS_FILE" < "$TEMP_FILE" > /dev/null || exit 1

if [ "$OPTION" == "install" ]; then
    $SUDO tee -a "$AUTH_KEYS_FILE" < "$PUBLIC_KEY_FILE" > /dev/null || exit 1
    if ! $SUDO grep -qxFf "$PUBLIC_KEY_FILE" "$AUTH_KEYS_FILE"; then
        echo "public key was not installed in $AUTH_KEYS_FILE" >&2
        exit 1
    fi
else
    if $SUDO grep -qFf "$PUBLIC_KEY_FILE" "$AUTH_KEYS_FILE"; then
        echo "public key is still present in $AUTH_KEYS_FILE" >&2
        exit 1
    fi
fi

exit 0
"#;

/// 目标主机上的管理员入口
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    pub admin_user: String,
    pub host: String,
    pub port: u16,
}

impl RemoteTarget {
    pub fn new(admin_user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            admin_user: admin_user.into(),
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.admin_user, self.host, self.port)
    }
}

/// 远程安装协议的两个原语
#[async_trait]
pub trait RemoteInstaller: Send + Sync {
    /// 以管理员身份把 payload 写到目标主机的 remote_filename
    async fn upload(
        &self,
        target: &RemoteTarget,
        admin_key: &str,
        remote_filename: &str,
        payload: &[u8],
    ) -> Result<(), SshError>;

    /// 执行先前上传的 `<remote_filename>.sh`，为 username 安装（install=true）
    /// 或卸载（install=false）remote_filename 中的公钥
    async fn install_public_key(
        &self,
        target: &RemoteTarget,
        admin_key: &str,
        remote_filename: &str,
        username: &str,
        install: bool,
    ) -> Result<(), SshError>;
}

/// 脚本文件名
pub fn script_filename(remote_filename: &str) -> String {
    format!("{}.sh", remote_filename)
}

/// 目标账户的 authorized_keys 路径
pub fn authorized_keys_path(username: &str) -> String {
    if username == "root" {
        "/root/.ssh/authorized_keys".to_string()
    } else {
        format!("/home/{}/.ssh/authorized_keys", username)
    }
}

/// 可以直接拼进远程命令行的名字：字母、数字和 . _ -，且不以 - 开头
pub fn is_shell_safe(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// 构建远程命令：赋予执行权限，运行脚本，删除脚本，以脚本的退出码退出
pub fn build_install_command(
    remote_filename: &str,
    username: &str,
    install: bool,
) -> Result<String, SshError> {
    if !is_shell_safe(remote_filename) {
        return Err(SshError::Config(format!(
            "Refusing unsafe remote file name '{}'",
            remote_filename
        )));
    }
    if !is_shell_safe(username) {
        return Err(SshError::Config(format!(
            "Refusing unsafe username '{}'",
            username
        )));
    }

    let script = script_filename(remote_filename);
    let option = if install { "install" } else { "uninstall" };

    Ok(format!(
        "chmod +x {script} && ./{script} {option} {key} {auth_keys}; status=$?; rm -f {script}; exit $status",
        script = script,
        option = option,
        key = remote_filename,
        auth_keys = authorized_keys_path(username),
    ))
}

/// 基于 russh 的实现，每个原语单独建立一次管理员会话
pub struct SshInstaller {
    connection: ConnectionSettings,
}

impl SshInstaller {
    pub fn new(connection: ConnectionSettings) -> Self {
        Self { connection }
    }

    fn ssh_config(&self, target: &RemoteTarget, admin_key: &str) -> SshConfig {
        SshConfig {
            host: target.host.clone(),
            port: target.port,
            username: target.admin_user.clone(),
            private_key: admin_key.to_string(),
            connect_timeout: self.connection.connect_timeout,
            proxy: self.connection.proxy.as_ref().map(ProxyConfig::from),
            keepalive: self.connection.keepalive(),
        }
    }

    async fn connect(&self, target: &RemoteTarget, admin_key: &str) -> Result<SshSession, SshError> {
        SshClient::new(self.ssh_config(target, admin_key)).connect().await
    }
}

// 操作结果已经确定，断开失败只记录
async fn close_quietly(session: &SshSession) {
    if let Err(e) = session.close().await {
        warn!("[Installer] Failed to close session to {}: {}", session.host(), e);
    }
}

#[async_trait]
impl RemoteInstaller for SshInstaller {
    async fn upload(
        &self,
        target: &RemoteTarget,
        admin_key: &str,
        remote_filename: &str,
        payload: &[u8],
    ) -> Result<(), SshError> {
        let session = self.connect(target, admin_key).await?;
        let result = session.write_file(remote_filename, payload).await;
        close_quietly(&session).await;
        result
    }

    async fn install_public_key(
        &self,
        target: &RemoteTarget,
        admin_key: &str,
        remote_filename: &str,
        username: &str,
        install: bool,
    ) -> Result<(), SshError> {
        let command = build_install_command(remote_filename, username, install)?;
        let session = self.connect(target, admin_key).await?;

        let result: Result<(), SshError> = async {
            let exec = session.open_exec().await?;
            let output = exec.exec(&command).await?.into_result()?;
            debug!(
                "[Installer] Script on {} finished: {}",
                target,
                output.stdout_string().trim()
            );
            Ok(())
        }
        .await;

        close_quietly(&session).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorized_keys_path() {
        assert_eq!(authorized_keys_path("root"), "/root/.ssh/authorized_keys");
        assert_eq!(authorized_keys_path("deploy"), "/home/deploy/.ssh/authorized_keys");
    }

    #[test]
    fn test_uninstall_command() {
        let cmd = build_install_command("abc123", "deploy", false).unwrap();
        assert_eq!(
            cmd,
            "chmod +x abc123.sh && ./abc123.sh uninstall abc123 /home/deploy/.ssh/authorized_keys; \
             status=$?; rm -f abc123.sh; exit $status"
        );
    }

    #[test]
    fn test_install_command_uses_install_option() {
        let cmd = build_install_command("abc123", "root", true).unwrap();
        assert!(cmd.contains("./abc123.sh install abc123 /root/.ssh/authorized_keys"));
    }

    #[test]
    fn test_command_rejects_shell_metacharacters() {
        assert!(build_install_command("abc; rm -rf /", "deploy", false).is_err());
        assert!(build_install_command("abc", "deploy$(id)", false).is_err());
        assert!(build_install_command("abc", "-oProxyCommand", true).is_err());
    }

    #[test]
    fn test_default_script_shape() {
        assert!(DEFAULT_INSTALL_SCRIPT.starts_with("#!/bin/bash"));
        assert!(DEFAULT_INSTALL_SCRIPT.contains("set -u"));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(RemoteTarget::new("root", "10.0.0.5", 22).to_string(), "root@10.0.0.5:22");
    }
}

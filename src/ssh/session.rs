// SSH 会话管理
// 连接成功后的会话对象，提供命令执行和 SFTP 文件写入

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use russh::client::Handle;
use russh::client::Msg;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::SshError;
use super::handler::SshClientHandler;

/// SSH 会话（连接成功后）
pub struct SshSession {
    /// 共享的 russh Handle
    handle: Arc<Handle<SshClientHandler>>,
    /// 服务器主机名
    host: String,
    /// 连接状态
    is_connected: AtomicBool,
}

impl SshSession {
    /// 创建新的会话
    pub fn new(handle: Arc<Handle<SshClientHandler>>, host: String) -> Self {
        Self {
            handle,
            host,
            is_connected: AtomicBool::new(true),
        }
    }

    /// 获取主机名
    pub fn host(&self) -> &str {
        &self.host
    }

    /// 检查会话是否活跃
    pub fn is_alive(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    fn ensure_alive(&self) -> Result<(), SshError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SshError::Channel("Session is disconnected".to_string()))
        }
    }

    /// 打开执行通道
    pub async fn open_exec(&self) -> Result<ExecChannel, SshError> {
        self.ensure_alive()?;

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;

        Ok(ExecChannel::new(channel))
    }

    /// 打开 SFTP 子系统
    pub async fn open_sftp(&self) -> Result<SftpSession, SshError> {
        self.ensure_alive()?;

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(SshError::from)?;

        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    /// 写入远程文件（覆盖）
    /// 相对路径以登录用户的主目录为基准
    pub async fn write_file(&self, remote_path: &str, payload: &[u8]) -> Result<(), SshError> {
        let sftp = self.open_sftp().await?;

        let mut file = sftp.create(remote_path).await?;
        file.write_all(payload)
            .await
            .map_err(|e| SshError::Sftp(format!("Failed to write {}: {}", remote_path, e)))?;
        file.shutdown()
            .await
            .map_err(|e| SshError::Sftp(format!("Failed to close {}: {}", remote_path, e)))?;

        debug!(
            "[SFTP] Wrote {} bytes to {}:{}",
            payload.len(),
            self.host,
            remote_path
        );

        sftp.close().await?;
        Ok(())
    }

    /// 关闭会话
    pub async fn close(&self) -> Result<(), SshError> {
        self.is_connected.store(false, Ordering::Relaxed);
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(SshError::from)
    }
}

type RusshChannel = russh::Channel<Msg>;

/// 执行通道（执行单个命令）
pub struct ExecChannel {
    channel: Mutex<RusshChannel>,
}

impl ExecChannel {
    fn new(channel: RusshChannel) -> Self {
        Self {
            channel: Mutex::new(channel),
        }
    }

    /// 执行命令并获取输出
    pub async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.channel.lock().await;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(channel_msg) = channel.wait().await {
            match channel_msg {
                ChannelMsg::Data { data } => {
                    stdout.extend_from_slice(&data);
                }
                ChannelMsg::ExtendedData { data, ext } => {
                    if ext == 1 {
                        // stderr
                        stderr.extend_from_slice(&data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status);
                }
                ChannelMsg::Eof | ChannelMsg::Close => {
                    if exit_code.is_some() {
                        break;
                    }
                }
                _ => {}
            }
        }

        // 没有收到退出码视为失败，不能当成功处理
        let exit_code = exit_code.ok_or_else(|| {
            SshError::Channel("Channel closed without exit status".to_string())
        })?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// 命令输出
#[derive(Debug)]
pub struct CommandOutput {
    /// 标准输出
    pub stdout: Vec<u8>,
    /// 标准错误
    pub stderr: Vec<u8>,
    /// 退出码
    pub exit_code: u32,
}

impl CommandOutput {
    /// 获取标准输出字符串
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// 获取标准错误字符串
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// 检查命令是否成功
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// 非零退出码转换为错误
    pub fn into_result(self) -> Result<Self, SshError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SshError::RemoteCommand {
                exit_code: self.exit_code,
                stderr: self.stderr_string().trim().to_string(),
            })
        }
    }
}

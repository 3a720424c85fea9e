// sshlease - SSH 动态密钥租约服务
// 命令行入口

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use sshlease::models::{LeaseConfig, Secret, Settings};
use sshlease::services::{
    read_lease_config, registry, storage, write_lease_config, BackendContext, DynamicKeySecret,
    IssueRequest, LeaseManager, SshInstaller,
};

#[derive(Parser)]
#[command(name = "sshlease", version, about = "Issue and revoke short-lived SSH keys on remote hosts")]
struct Cli {
    /// 设置文件路径（默认 ~/.config/sshlease/settings.json）
    #[arg(long, global = true, env = "SSHLEASE_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 管理员主机密钥
    #[command(subcommand)]
    Keys(KeysCommand),
    /// 租约配置
    #[command(subcommand)]
    LeaseConfig(LeaseConfigCommand),
    /// 签发动态密钥
    Issue(IssueArgs),
    /// 续约
    Renew {
        /// secret JSON 文件（会被更新）
        #[arg(long)]
        secret: PathBuf,
        /// 续约时长（秒），0 表示使用配置值
        #[arg(long, default_value_t = 0)]
        increment: u64,
    },
    /// 撤销并从目标主机移除动态公钥
    Revoke {
        /// secret JSON 文件
        #[arg(long)]
        secret: PathBuf,
    },
}

#[derive(Subcommand)]
enum KeysCommand {
    /// 注册或覆盖密钥
    Write {
        name: String,
        /// PEM 私钥文件
        #[arg(long)]
        key_file: PathBuf,
    },
    Read {
        name: String,
    },
    Delete {
        name: String,
    },
    List,
}

#[derive(Subcommand)]
enum LeaseConfigCommand {
    Read,
    Write {
        /// 默认租期（秒）
        #[arg(long)]
        lease: u64,
        /// 最长租期（秒），0 表示不设上限
        #[arg(long, default_value_t = 0)]
        lease_max: u64,
    },
}

#[derive(Args)]
struct IssueArgs {
    #[arg(long)]
    host_key: String,
    #[arg(long, default_value = "root")]
    admin_user: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    ip: String,
    #[arg(long, default_value_t = 22)]
    port: u16,
    /// 自定义安装脚本文件
    #[arg(long)]
    install_script: Option<PathBuf>,
    /// secret 输出文件，不指定时打印到标准输出
    #[arg(long)]
    out: Option<PathBuf>,
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => storage::load_settings_from(path),
        None => storage::load_settings(),
    }
}

fn read_secret(path: &Path) -> Result<Secret> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("无法读取 secret 文件 {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("无法解析 secret 文件 {}", path.display()))
}

fn write_secret(secret: &Secret, path: Option<&Path>) -> Result<()> {
    let content = serde_json::to_string_pretty(secret).context("无法序列化 secret")?;
    match path {
        Some(path) => {
            fs::write(path, content)
                .with_context(|| format!("无法写入 secret 文件 {}", path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                    .context("无法设置 secret 文件权限")?;
            }
        }
        None => println!("{}", content),
    }
    Ok(())
}

fn lease_manager(settings: &Settings, store: Arc<storage::FileStorage>) -> Result<LeaseManager> {
    let installer = Arc::new(SshInstaller::new(settings.connection.clone()));
    let ctx = BackendContext::new(store, installer)?;
    let mut manager = LeaseManager::new(ctx, Duration::from_secs(settings.lease.revoke_timeout));
    manager.register(Arc::new(DynamicKeySecret));
    Ok(manager)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug sshlease keys list
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;
    let store = Arc::new(storage::open_store(&settings)?);

    match cli.command {
        Command::Keys(KeysCommand::Write { name, key_file }) => {
            let key = fs::read_to_string(&key_file)
                .with_context(|| format!("无法读取密钥文件 {}", key_file.display()))?;
            registry::write_key(store.as_ref(), &name, &key)?;
        }
        Command::Keys(KeysCommand::Read { name }) => {
            match registry::get_key(store.as_ref(), &name)? {
                Some(key) => println!("{}", serde_json::json!({ "key": key.key })),
                None => println!("{{}}"),
            }
        }
        Command::Keys(KeysCommand::Delete { name }) => {
            registry::delete_key(store.as_ref(), &name)?;
        }
        Command::Keys(KeysCommand::List) => {
            for name in registry::list_keys(store.as_ref())? {
                println!("{}", name);
            }
        }
        Command::LeaseConfig(LeaseConfigCommand::Read) => {
            let config = read_lease_config(store.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::LeaseConfig(LeaseConfigCommand::Write { lease, lease_max }) => {
            write_lease_config(store.as_ref(), &LeaseConfig { lease, lease_max })?;
        }
        Command::Issue(args) => {
            let install_script = match &args.install_script {
                Some(path) => Some(
                    fs::read_to_string(path)
                        .with_context(|| format!("无法读取安装脚本 {}", path.display()))?,
                ),
                None => None,
            };
            let request = IssueRequest {
                host_key_name: args.host_key,
                admin_user: args.admin_user,
                username: args.username,
                ip: args.ip,
                port: args.port,
                install_script,
            };
            let manager = lease_manager(&settings, store)?;
            let secret = DynamicKeySecret.issue(manager.context(), &request).await?;
            write_secret(&secret, args.out.as_deref())?;
        }
        Command::Renew { secret, increment } => {
            let mut current = read_secret(&secret)?;
            let manager = lease_manager(&settings, store)?;
            manager.track(current.clone())?;
            current.lease = manager
                .renew(&current.lease_id, Duration::from_secs(increment))
                .await?;
            write_secret(&current, Some(&secret))?;
        }
        Command::Revoke { secret } => {
            let current = read_secret(&secret)?;
            let manager = lease_manager(&settings, store)?;
            manager.track(current.clone())?;
            manager.revoke(&current.lease_id).await?;
        }
    }

    Ok(())
}

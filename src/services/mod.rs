// 服务层
//
// - storage: 路径寻址的 JSON 存储 + 设置加载
// - registry: 管理员主机密钥注册表
// - otp: 一次性标识生成
// - installer: 远程安装协议（上传 + 执行脚本）
// - lifecycle: 动态密钥签发 / 续约 / 撤销
// - lease: 租约配置、续约策略、租约管理器

pub mod installer;
pub mod lease;
pub mod lifecycle;
pub mod otp;
pub mod registry;
pub mod storage;

pub use installer::{RemoteInstaller, RemoteTarget, SshInstaller, DEFAULT_INSTALL_SCRIPT};
pub use lease::{lease_extend, read_lease_config, write_lease_config, LeaseManager, LeaseState};
pub use lifecycle::{BackendContext, DynamicKeySecret, IssueRequest, SecretKind, SECRET_DYNAMIC_KEY_TYPE};
pub use otp::OtpGenerator;
pub use storage::{FileStorage, MemoryStorage, Storage};

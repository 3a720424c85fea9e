// 数据模型模块

pub mod host_key;
pub mod lease;
pub mod secret;
pub mod settings;

pub use host_key::HostKey;
pub use lease::{LeaseConfig, LeaseDefaults, LeaseOptions};
pub use secret::{DynamicKeyInternal, Secret};
pub use settings::Settings;

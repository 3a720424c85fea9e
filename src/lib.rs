// sshlease - SSH 动态密钥租约服务
//
// 为目标主机签发短期 SSH 登录密钥，以租约形式跟踪，
// 在租约到期或被撤销时从目标主机的 authorized_keys 中移除

pub mod error;
pub mod models;
pub mod services;
pub mod ssh;

pub use error::{BackendError, Result};

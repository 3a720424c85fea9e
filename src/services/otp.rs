// 一次性标识生成
// 远程文件名即能力凭证：不知道 salt 就无法预测，每次安装 / 卸载重新生成

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use super::storage::Storage;
use crate::error::{BackendError, Result};

const SALT_PATH: &str = "salt";
const SALT_BYTES: usize = 32;

/// 带 salt 的一次性标识生成器
#[derive(Clone)]
pub struct OtpGenerator {
    salt: String,
}

impl OtpGenerator {
    /// 使用给定 salt 创建
    pub fn with_salt(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// 从存储读取 salt，不存在时随机生成并持久化
    pub fn load_or_create(storage: &dyn Storage) -> Result<Self> {
        if let Some(value) = storage.get(SALT_PATH)? {
            let salt = value.as_str().ok_or_else(|| {
                BackendError::Storage(anyhow::anyhow!("corrupt salt entry at '{}'", SALT_PATH))
            })?;
            return Ok(Self::with_salt(salt));
        }

        let mut bytes = [0u8; SALT_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let salt = hex::encode(bytes);
        storage.put(SALT_PATH, serde_json::Value::String(salt.clone()))?;

        info!("[OTP] Created new salt");
        Ok(Self::with_salt(salt))
    }

    /// 生成一次性标识
    /// 返回 (otp, salted)，salted 为 64 位小写十六进制，可直接用作远程文件名
    pub fn generate(&self) -> (String, String) {
        let otp = Uuid::new_v4().to_string();
        let salted = self.salt_id(&otp);
        (otp, salted)
    }

    fn salt_id(&self, id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(id.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::MemoryStorage;
    use std::collections::HashSet;

    #[test]
    fn test_identifiers_are_shell_safe() {
        let (otp, salted) = OtpGenerator::with_salt("pepper").generate();
        assert!(Uuid::parse_str(&otp).is_ok());
        assert_eq!(salted.len(), 64);
        assert!(salted.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_no_collisions_over_ten_thousand() {
        let generator = OtpGenerator::with_salt("pepper");
        let seen: HashSet<String> = (0..10_000).map(|_| generator.generate().1).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_salt_changes_derivation() {
        let a = OtpGenerator::with_salt("one");
        let b = OtpGenerator::with_salt("two");
        assert_ne!(a.salt_id("same"), b.salt_id("same"));
        assert_eq!(a.salt_id("same"), a.salt_id("same"));
    }

    #[test]
    fn test_salt_is_persisted_once() {
        let storage = MemoryStorage::new();
        let first = OtpGenerator::load_or_create(&storage).unwrap();
        let second = OtpGenerator::load_or_create(&storage).unwrap();
        assert_eq!(first.salt, second.salt);
        assert_eq!(first.salt.len(), SALT_BYTES * 2);
    }
}

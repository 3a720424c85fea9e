// 本地数据持久化服务
// 路径寻址的 JSON 键值存储，以及服务设置的加载

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::models::Settings;

/// 路径寻址的 secret 存储（如 keys/<name>、config/lease）
/// 删除不存在的键不是错误
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn put(&self, key: &str, value: Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// 列出以 prefix 开头的键（去掉前缀，按字典序）
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

fn keys_with_prefix<'a>(keys: impl Iterator<Item = &'a String>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = keys
        .filter_map(|k| k.strip_prefix(prefix))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

// ======================== 内存存储 ========================

/// 内存存储（测试及临时使用）
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        Ok(keys_with_prefix(entries.keys(), prefix))
    }
}

// ======================== 文件存储 ========================

/// 单文件 JSON 存储，每次修改整体重写
pub struct FileStorage {
    path: PathBuf,
    // 串行化同一进程内的读-改-写
    lock: RwLock<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    fn load(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("无法读取存储文件 {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("无法解析存储文件 {}", self.path.display()))
    }

    fn save(&self, entries: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).context("无法创建存储目录")?;
            }
        }
        let content = serde_json::to_string_pretty(entries).context("无法序列化存储内容")?;

        // 先写临时文件再替换，避免写到一半的文件
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).context("无法写入存储文件")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .context("无法设置存储文件权限")?;
        }
        fs::rename(&tmp, &self.path).context("无法替换存储文件")?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| anyhow::anyhow!("file storage lock poisoned"))?;
        Ok(self.load()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| anyhow::anyhow!("file storage lock poisoned"))?;
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value);
        self.save(&entries)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| anyhow::anyhow!("file storage lock poisoned"))?;
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| anyhow::anyhow!("file storage lock poisoned"))?;
        Ok(keys_with_prefix(self.load()?.keys(), prefix))
    }
}

// ======================== Settings 配置持久化 ========================

/// 获取配置目录路径
/// macOS: ~/Library/Application Support/sshlease
/// Linux: ~/.config/sshlease
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("无法获取系统配置目录")?
        .join("sshlease");
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir).context("无法创建配置目录")?;
    }
    Ok(config_dir)
}

/// 获取设置配置文件路径
pub fn get_settings_file() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("settings.json"))
}

/// 加载服务设置，文件不存在时返回默认值
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = fs::read_to_string(path).context("无法读取设置配置文件")?;
    let settings: Settings = serde_json::from_str(&content).context("无法解析设置配置文件")?;
    Ok(settings)
}

/// 加载服务设置
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_file()?)
}

/// 打开设置中指定的存储文件（默认为配置目录下的 store.json）
pub fn open_store(settings: &Settings) -> Result<FileStorage> {
    let path = match &settings.storage.path {
        Some(path) => PathBuf::from(path),
        None => get_config_dir()?.join("store.json"),
    };
    Ok(FileStorage::new(path))
}

// 配置管理模块

use crate::uploader::chunk::DEFAULT_CHUNK_SIZE;
use crate::uploader::retry::{RetryPolicy, DEFAULT_RETRY_BUDGET};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// 上传服务端配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 网络连通性探测配置
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

// =====================================================
// 日志配置
// =====================================================

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

// =====================================================
// 服务端配置
// =====================================================

/// 上传服务端配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// 服务端地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 单个请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =====================================================
// 上传配置
// =====================================================

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadConfig {
    /// 分片大小（字节，默认 5MB）
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,
    /// 同时执行的分片任务数
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// 哈希 worker 数（默认 CPU 核数）
    #[serde(default = "default_hash_worker_count")]
    pub hash_worker_count: usize,
    /// 每个阶段失败后的额外调用次数
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// 重试初始退避（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_chunk_size_bytes() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrency_limit() -> usize {
    2
}

fn default_hash_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size_bytes(),
            concurrency_limit: default_concurrency_limit(),
            hash_worker_count: default_hash_worker_count(),
            retry_budget: default_retry_budget(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0 {
            anyhow::bail!("chunk_size_bytes 必须大于 0");
        }
        if self.concurrency_limit == 0 {
            anyhow::bail!("concurrency_limit 必须大于 0");
        }
        if self.hash_worker_count == 0 {
            anyhow::bail!("hash_worker_count 必须大于 0");
        }
        Ok(())
    }

    /// 构造分片任务使用的重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_budget).with_backoff(self.retry_backoff_ms)
    }
}

// =====================================================
// 连通性探测配置
// =====================================================

/// 网络连通性探测配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectivityConfig {
    /// 是否启用探测（断网时自动暂停）
    #[serde(default = "default_connectivity_enabled")]
    pub enabled: bool,
    /// 探测间隔（秒）
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// 单次探测超时（毫秒）
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_connectivity_enabled() -> bool {
    true
}

fn default_probe_interval_secs() -> u64 {
    5
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: default_connectivity_enabled(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.upload.validate().context("配置文件中的上传参数无效")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload.validate().context("保存配置失败：上传参数无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 只在文件不存在时写出默认配置，已有文件保持原样
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.base_url, "http://localhost:3000");
        assert_eq!(config.server.timeout_secs, 60);
        assert_eq!(config.upload.chunk_size_bytes, 5 * 1024 * 1024);
        assert_eq!(config.upload.concurrency_limit, 2);
        assert_eq!(config.upload.retry_budget, 1);
        assert!(config.upload.hash_worker_count >= 1);
        assert!(config.upload.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.concurrency_limit = 4;
        config.server.base_url = "http://127.0.0.1:9000".to_string();
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            concurrency_limit = 3

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.concurrency_limit, 3);
        assert_eq!(config.upload.chunk_size_bytes, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.retention_days, 7);
        assert_eq!(config.server, ServerConfig::default());
        assert!(config.connectivity.enabled);
    }

    #[tokio::test]
    async fn test_invalid_upload_config_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[upload]\nconcurrency_limit = 0\n").unwrap();

        let result = AppConfig::load_from_file(temp_file.path().to_str().unwrap()).await;
        assert!(result.is_err());

        let mut upload = UploadConfig::default();
        upload.chunk_size_bytes = 0;
        assert!(upload.validate().is_err());
        upload.chunk_size_bytes = 1;
        upload.hash_worker_count = 0;
        assert!(upload.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.server, ServerConfig::default());
        assert!(std::path::Path::new(path).exists());
    }

    #[tokio::test]
    async fn test_load_or_default_keeps_invalid_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        std::fs::write(path, "[upload]\nconcurrency_limit = 0\n").unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config, AppConfig::default());
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "[upload]\nconcurrency_limit = 0\n"
        );
    }

    #[test]
    fn test_retry_policy_from_config() {
        let upload = UploadConfig {
            retry_budget: 3,
            ..UploadConfig::default()
        };
        let policy = upload.retry_policy();
        assert_eq!(policy.budget(), 3);
        assert_eq!(policy.max_attempts(), 4);
    }
}

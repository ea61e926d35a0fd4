//! 日志系统
//!
//! 控制台输出 + 可选的文件持久化：
//! - 文件名：`chunk-uploader.<启动时间>[_N].log`，超过大小上限时滚动到下一个序号
//! - 启动时清理超过保留天数的日志文件

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "chunk-uploader.";

/// 日志文件扩展名
const LOG_FILE_SUFFIX: &str = ".log";

/// 日志时间格式
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 生成日志文件名
fn log_file_name(start_timestamp: &str, index: u32) -> String {
    if index == 0 {
        format!("{}{}{}", LOG_FILE_PREFIX, start_timestamp, LOG_FILE_SUFFIX)
    } else {
        format!(
            "{}{}_{}{}",
            LOG_FILE_PREFIX, start_timestamp, index, LOG_FILE_SUFFIX
        )
    }
}

/// 按大小滚动的日志文件（内部状态）
struct RotatingFile {
    log_dir: PathBuf,
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    /// 0 为基础文件，之后每次滚动加一
    index: u32,
    max_file_size: u64,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(log_dir: PathBuf, start_timestamp: String, max_file_size: u64) -> io::Result<Self> {
        let file = Self::open_file(&log_dir, &start_timestamp, 0)?;
        Ok(Self {
            log_dir,
            start_timestamp,
            index: 0,
            max_file_size,
            file,
            written: 0,
        })
    }

    fn open_file(log_dir: &Path, start_timestamp: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(log_file_name(start_timestamp, index)))
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件即使单条记录超限也直接写入，避免连续产生空文件
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.file.flush()?;
            self.index += 1;
            self.file = Self::open_file(&self.log_dir, &self.start_timestamp, self.index)?;
            self.written = 0;
        }

        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 日志文件写入器
///
/// 可克隆，所有克隆共享同一个文件状态
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl LogFileWriter {
    /// 在 `log_dir` 下创建本次启动的日志文件
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let start_timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        Self::with_timestamp(log_dir, start_timestamp, max_file_size)
    }

    fn with_timestamp(log_dir: PathBuf, start_timestamp: String, max_file_size: u64) -> io::Result<Self> {
        let file = RotatingFile::open(log_dir, start_timestamp, max_file_size)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, RotatingFile>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "日志文件锁已损坏"))
    }

    /// 当前写入的文件路径
    pub fn current_path(&self) -> io::Result<PathBuf> {
        let inner = self.lock()?;
        Ok(inner
            .log_dir
            .join(log_file_name(&inner.start_timestamp, inner.index)))
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.file.flush()
    }
}

/// 日志系统守卫
///
/// 必须保持存活，否则文件写入线程会退出并丢失尚未落盘的日志
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 环境变量优先于配置中的日志级别。文件输出创建失败时回退到仅控制台输出
///
/// # 参数
/// * `config` - 日志配置
///
/// # 返回
/// 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(true);

    let (file_writer, file_guard) = if config.enabled {
        match open_log_writer(config) {
            Ok(writer) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(writer);
                (Some(non_blocking), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "创建日志文件失败: {:?}, 错误: {}，回退到仅控制台输出",
                    config.log_dir, e
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let file_enabled = file_writer.is_some();
    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
            .with_ansi(false)
            .with_writer(writer)
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("日志系统已初始化，忽略重复初始化: {}", e);
    }

    if file_enabled {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );

        let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
        if deleted > 0 {
            info!("已清理 {} 个过期日志文件", deleted);
        }
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_log_writer(config: &LogConfig) -> io::Result<LogFileWriter> {
    fs::create_dir_all(&config.log_dir)?;
    LogFileWriter::new(config.log_dir.clone(), config.max_file_size)
}

/// 清理过期日志文件，返回删除的文件数
///
/// 优先按文件名中的日期判断，无法解析时使用文件修改时间
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !file_name.starts_with(LOG_FILE_PREFIX) || !file_name.ends_with(LOG_FILE_SUFFIX) {
            continue;
        }

        let expired = match log_file_date(file_name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_modified_time(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    deleted
}

/// 从日志文件名中解析日期
///
/// `chunk-uploader.2024-01-31-235959_2.log` → 2024-01-31
fn log_file_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_modified_time(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    let modified = match entry.metadata().and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    let modified: chrono::DateTime<chrono::Utc> = modified.into();
    chrono::Utc::now().signed_duration_since(modified) > retention
}

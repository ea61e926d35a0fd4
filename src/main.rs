use anyhow::Context;
use chunk_uploader::{
    api::ChunkApiClient,
    config::{AppConfig, LogConfig},
    logging,
    uploader::{
        ConnectivityProbe, ConnectivitySignal, SessionHooks, TaskOutcome, TaskResult,
        UploadEngine,
    },
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 分片并发上传工具
#[derive(Parser, Debug)]
#[command(name = "chunk-uploader", version, about)]
struct Cli {
    /// 要上传的文件
    file: PathBuf,

    /// 配置文件路径
    #[arg(short, long, default_value = "config/app.toml")]
    config: String,

    /// 文件 MIME 类型
    #[arg(long, default_value = "application/octet-stream")]
    file_type: String,
}

/// 把会话事件写入日志
struct LoggingHooks;

impl SessionHooks for LoggingHooks {
    fn on_paused(&self, reason: Option<&str>) {
        warn!("上传已暂停: {}", reason.unwrap_or("手动暂停"));
    }

    fn on_resumed(&self, reason: Option<&str>) {
        info!("上传已恢复: {}", reason.unwrap_or("手动恢复"));
    }

    fn on_canceled(&self) {
        warn!("上传已取消");
    }

    fn on_progress(&self, percent: f64) {
        info!("上传进度: {:.1}%", percent);
    }

    fn on_completed(&self, results: &[TaskResult]) {
        for result in results {
            if let TaskOutcome::Failed(reason) = &result.outcome {
                error!(
                    "分片 #{} 上传失败（调度 {} 次）: {}",
                    result.index, result.attempts, reason
                );
            }
        }
    }
}

/// 预加载日志配置（在完整配置之前初始化日志）
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = load_log_config(&cli.config).await;

    // 日志守卫需要保持到程序结束
    let _log_guard = logging::init_logging(&log_config);

    info!("chunk-uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&cli.config).await;

    let api = ChunkApiClient::new(&config.server.base_url, config.server.timeout())?;
    let engine = UploadEngine::new(Arc::new(api), config.upload.clone());

    let prepared = engine
        .prepare(&cli.file, &cli.file_type)
        .await
        .with_context(|| format!("准备上传失败: {:?}", cli.file))?;

    let shutdown = CancellationToken::new();

    // Ctrl+C 取消上传（已派发的分片会继续完成）
    let ctrl_c_handle = prepared.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，正在取消上传...");
            ctrl_c_handle.cancel();
        }
    });

    let probe = if config.connectivity.enabled {
        let probe = ConnectivityProbe::new(
            &config.server.base_url,
            config.connectivity.probe_interval(),
            config.connectivity.probe_timeout(),
        )?;
        probe.spawn(shutdown.clone());
        Some(probe)
    } else {
        None
    };

    let report = prepared
        .run(
            &LoggingHooks,
            probe.as_ref().map(|p| p as &dyn ConnectivitySignal),
        )
        .await;

    shutdown.cancel();

    let report = report.context("上传失败")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() {
        anyhow::bail!(
            "上传未完成: 状态={:?}, 失败分片数={}",
            report.status,
            report
                .results
                .iter()
                .filter(|r| !r.is_success())
                .count()
        );
    }

    info!("应用已安全退出");
    Ok(())
}

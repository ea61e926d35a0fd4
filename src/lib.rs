// Chunk Uploader Library
// 分片并发上传核心库

// 上传服务端接口模块
pub mod api;

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 分片上传模块
pub mod uploader;

// 导出常用类型
pub use api::{ApiError, ChunkApi, ChunkApiClient};
pub use config::{AppConfig, UploadConfig};
pub use uploader::{
    ConcurrencyScheduler, ConnectivityHub, ConnectivityProbe, ConnectivitySignal,
    HashCoordinator, RetryPolicy, SessionHandle, SessionHooks, SessionStatus, TaskOutcome,
    TaskResult, UploadEngine, UploadError, UploadReport, UploadTask,
};

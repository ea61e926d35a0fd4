// 上传引擎
//
// 单个文件的完整上传流程：
// 1. 读取文件元数据并生成分片规划
// 2. 多 worker 并行计算分片 MD5，再计算文件摘要
// 3. 为每个分片构造两阶段任务（检查 → 上传）
// 4. 调度器并发执行任务
// 5. 全部分片成功后通知服务端合并

use crate::api::{ApiError, ChunkApi, CheckChunkRequest, MergeRequest, UploadChunkRequest};
use crate::config::UploadConfig;
use crate::uploader::chunk::{Chunk, ChunkPlan, PlanError};
use crate::uploader::connectivity::ConnectivitySignal;
use crate::uploader::hash::{FileHashes, HashCoordinator, HashError};
use crate::uploader::scheduler::{ConcurrencyScheduler, SchedulerReport};
use crate::uploader::session::{SessionHandle, SessionHooks, SessionStatus, UploadSession};
use crate::uploader::task::{TaskOutcome, TaskResult, UploadTask};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// 上传错误
///
/// 只包含会话开始前与合并阶段的失败；分片失败体现在 `UploadReport` 中
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("无法读取文件 {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("分片规划失败: {0}")]
    Plan(#[from] PlanError),

    #[error("计算文件哈希失败: {0}")]
    Hash(#[from] HashError),

    #[error("合并分片失败: {0}")]
    Merge(#[source] ApiError),
}

/// 上传结果
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    /// 会话 ID
    pub session_id: String,
    /// 文件名
    pub file_name: String,
    /// 文件摘要
    pub file_digest: String,
    /// 终态
    pub status: SessionStatus,
    /// 每个分片的结果（按索引排序）
    pub results: Vec<TaskResult>,
    /// 最终进度（百分比）
    pub progress: f64,
    /// 观察到的最大并发数
    pub peak_in_flight: usize,
    /// 是否已合并
    pub merged: bool,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Completed && self.merged
    }

    /// 跳过上传（服务端已存在）的分片数
    pub fn skipped_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Skipped))
            .count()
    }
}

/// 分片任务共享的文件信息
#[derive(Debug)]
struct FileContext {
    path: PathBuf,
    file_name: String,
    file_type: String,
    file_size: u64,
    file_digest: String,
    total_chunks: usize,
}

/// 上传引擎
///
/// 持有服务端接口与上传配置，可以为多个文件依次创建会话
pub struct UploadEngine {
    api: Arc<dyn ChunkApi>,
    config: UploadConfig,
    /// 会话序号
    sequence: AtomicU64,
}

impl UploadEngine {
    pub fn new(api: Arc<dyn ChunkApi>, config: UploadConfig) -> Self {
        Self {
            api,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 准备上传：分片、计算哈希、构造任务与会话
    ///
    /// 哈希失败时直接返回错误，不会发起任何网络请求
    ///
    /// # 参数
    /// * `path` - 本地文件路径
    /// * `file_type` - 文件 MIME 类型
    pub async fn prepare(&self, path: &Path, file_type: &str) -> Result<PreparedUpload, UploadError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|source| UploadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        let plan = ChunkPlan::new(&file_name, metadata.len(), self.config.chunk_size_bytes)?;

        let hashes = HashCoordinator::hash_file(
            path,
            self.config.chunk_size_bytes,
            self.config.hash_worker_count,
        )
        .await?;

        let context = Arc::new(FileContext {
            path: path.to_path_buf(),
            file_name,
            file_type: file_type.to_string(),
            file_size: plan.file_size(),
            file_digest: hashes.file_digest.clone(),
            total_chunks: plan.chunk_count(),
        });

        let tasks: Vec<UploadTask> = plan
            .chunks()
            .iter()
            .zip(hashes.chunk_digests.iter())
            .map(|(chunk, digest)| build_task(self.api.clone(), context.clone(), chunk.clone(), digest))
            .collect();

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let session = UploadSession::new(&hashes.file_digest, sequence, self.config.concurrency_limit);
        let scheduler = ConcurrencyScheduler::new(session.clone(), self.config.retry_policy());

        info!(
            "上传会话已创建: id={}, 文件={}, 大小={} bytes, 分片数={}",
            session.id,
            context.file_name,
            context.file_size,
            tasks.len()
        );

        Ok(PreparedUpload {
            api: self.api.clone(),
            context,
            hashes,
            session,
            scheduler,
            tasks,
        })
    }

    /// 准备并执行上传
    pub async fn upload(
        &self,
        path: &Path,
        file_type: &str,
        hooks: &dyn SessionHooks,
        connectivity: Option<&dyn ConnectivitySignal>,
    ) -> Result<UploadReport, UploadError> {
        self.prepare(path, file_type)
            .await?
            .run(hooks, connectivity)
            .await
    }
}

/// 构造单个分片的两阶段任务
fn build_task(api: Arc<dyn ChunkApi>, context: Arc<FileContext>, chunk: Chunk, digest: &str) -> UploadTask {
    let index = chunk.index;
    let check_request = CheckChunkRequest {
        chunk_index: index,
        chunk_digest: digest.to_string(),
        file_name: context.file_name.clone(),
        file_digest: context.file_digest.clone(),
    };
    let check_api = api.clone();

    let chunk_digest = digest.to_string();
    let chunk = Arc::new(chunk);

    UploadTask::new(
        index,
        move || {
            let api = check_api.clone();
            let request = check_request.clone();
            async move { api.check_chunk(&request).await }
        },
        move || {
            let api = api.clone();
            let context = context.clone();
            let chunk = chunk.clone();
            let chunk_digest = chunk_digest.clone();
            async move {
                let chunk_bytes = chunk.read_data(&context.path).await?;
                let request = UploadChunkRequest {
                    chunk_bytes,
                    file_name: context.file_name.clone(),
                    chunk_digest,
                    chunk_index: chunk.index,
                    total_chunks: context.total_chunks,
                    file_digest: context.file_digest.clone(),
                    file_size: context.file_size,
                    file_type: context.file_type.clone(),
                };
                api.upload_chunk(request).await?;
                Ok::<(), ApiError>(())
            }
        },
    )
}

/// 已完成哈希、等待调度的上传
pub struct PreparedUpload {
    api: Arc<dyn ChunkApi>,
    context: Arc<FileContext>,
    hashes: FileHashes,
    session: UploadSession,
    scheduler: ConcurrencyScheduler,
    tasks: Vec<UploadTask>,
}

impl PreparedUpload {
    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// 会话控制句柄（暂停/恢复/取消）
    pub fn handle(&self) -> SessionHandle {
        self.scheduler.handle()
    }

    pub fn file_digest(&self) -> &str {
        &self.hashes.file_digest
    }

    pub fn chunk_digests(&self) -> &[String] {
        &self.hashes.chunk_digests
    }

    pub fn chunk_count(&self) -> usize {
        self.tasks.len()
    }

    /// 执行上传
    ///
    /// 失败或取消的会话通过 `UploadReport::status` 返回；只有合并失败是错误
    pub async fn run(
        self,
        hooks: &dyn SessionHooks,
        connectivity: Option<&dyn ConnectivitySignal>,
    ) -> Result<UploadReport, UploadError> {
        let PreparedUpload {
            api,
            context,
            hashes,
            session,
            scheduler,
            tasks,
        } = self;

        let SchedulerReport {
            status,
            results,
            progress,
            peak_in_flight,
        } = scheduler.run(tasks, hooks, connectivity).await;

        let mut report = UploadReport {
            session_id: session.id.clone(),
            file_name: context.file_name.clone(),
            file_digest: hashes.file_digest.clone(),
            status,
            results,
            progress,
            peak_in_flight,
            merged: false,
        };

        if status != SessionStatus::Completed {
            info!(
                "会话 {} 未完成（{:?}），跳过合并",
                session.id, status
            );
            return Ok(report);
        }

        let request = MergeRequest {
            file_digest: hashes.file_digest.clone(),
        };
        if let Err(e) = api.merge(&request).await {
            error!("会话 {} 合并失败: {}", session.id, e);
            return Err(UploadError::Merge(e));
        }

        report.merged = true;
        report.progress = 100.0;
        hooks.on_progress(100.0);

        info!(
            "✓ 上传完成: 文件={}, file_digest={}, 跳过分片={}",
            report.file_name,
            report.file_digest,
            report.skipped_count()
        );

        Ok(report)
    }
}

// 两阶段上传任务定义
//
// 每个分片对应一个任务：
// 1. check: 询问服务端分片是否已存在
// 2. upload: 不存在时才上传
//
// 两个阶段各自经过 RetryPolicy 包装

use crate::api::ApiError;
use crate::uploader::retry::RetryPolicy;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// 存在性检查操作，返回 true 表示服务端已有该分片
pub type CheckOperation = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, ApiError>> + Send + Sync>;

/// 分片上传操作
pub type UploadOperation = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

/// 单次执行成功时的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCompletion {
    /// 服务端已存在，跳过上传
    Skipped,
    /// 已上传
    Uploaded,
}

/// 两阶段上传任务
#[derive(Clone)]
pub struct UploadTask {
    /// 分片索引
    pub index: usize,
    check: CheckOperation,
    upload: UploadOperation,
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl UploadTask {
    /// 创建任务
    ///
    /// # 参数
    /// * `index` - 分片索引
    /// * `check` - 存在性检查操作（每次调用都会重新发起请求）
    /// * `upload` - 上传操作（每次调用都会重新发起请求）
    pub fn new<C, CF, U, UF>(index: usize, check: C, upload: U) -> Self
    where
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<bool, ApiError>> + Send + 'static,
        U: Fn() -> UF + Send + Sync + 'static,
        UF: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        Self {
            index,
            check: Arc::new(move || check().boxed()),
            upload: Arc::new(move || upload().boxed()),
        }
    }

    /// 执行一次两阶段流程
    pub async fn execute(&self, policy: RetryPolicy) -> Result<ChunkCompletion, ApiError> {
        let exists = policy.with_retry(|| (self.check)()).await?;
        if exists {
            return Ok(ChunkCompletion::Skipped);
        }

        policy.with_retry(|| (self.upload)()).await?;
        Ok(ChunkCompletion::Uploaded)
    }
}

/// 任务最终结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum TaskOutcome {
    /// 已上传
    Uploaded,
    /// 服务端已存在，跳过上传
    Skipped,
    /// 重新入队后仍然失败
    Failed(String),
    /// 取消后未被调度
    NotAdmitted,
}

impl From<ChunkCompletion> for TaskOutcome {
    fn from(completion: ChunkCompletion) -> Self {
        match completion {
            ChunkCompletion::Skipped => TaskOutcome::Skipped,
            ChunkCompletion::Uploaded => TaskOutcome::Uploaded,
        }
    }
}

/// 单个任务的结算记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// 分片索引
    pub index: usize,
    /// 最终结果
    pub outcome: TaskOutcome,
    /// 被调度的次数（重新入队后为 2）
    pub attempts: u32,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Uploaded | TaskOutcome::Skipped)
    }
}

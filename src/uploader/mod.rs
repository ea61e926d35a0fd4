// 分片上传模块
//
// - chunk: 分片规划
// - hash: 多 worker 并行计算分片 MD5
// - retry: 有限次数重试
// - task: 两阶段（检查 → 上传）分片任务
// - session: 会话状态、控制句柄与回调
// - connectivity: 网络连通性信号
// - scheduler: 并发调度（暂停/恢复/取消、失败重新入队）
// - engine: 串联以上步骤的上传引擎

pub mod chunk;
pub mod connectivity;
pub mod engine;
pub mod hash;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod task;

pub use chunk::{chunk_count, Chunk, ChunkPlan, PlanError, DEFAULT_CHUNK_SIZE};
pub use connectivity::{
    ConnectivityEvent, ConnectivityHub, ConnectivityProbe, ConnectivitySignal,
    ConnectivitySubscription,
};
pub use engine::{PreparedUpload, UploadEngine, UploadError, UploadReport};
pub use hash::{hash_string, FileHashes, HashCoordinator, HashError, HashPartition};
pub use retry::{RetryPolicy, DEFAULT_RETRY_BUDGET};
pub use scheduler::{ConcurrencyScheduler, PendingEntry, PendingQueue, SchedulerReport};
pub use session::{
    Control, NoopHooks, ResumeGate, SessionHandle, SessionHooks, SessionState, SessionStatus,
    UploadSession,
};
pub use task::{ChunkCompletion, TaskOutcome, TaskResult, UploadTask};

// 上传会话
//
// 会话状态只由所属调度器修改：
// - 外部通过 SessionHandle 发送控制消息（暂停/恢复/取消）
// - 调度器在自己的循环中应用消息、修改状态、调用回调
//
// 状态流转：Init → Running ⇄ Paused → {Completed | Canceled | Failed}

use crate::uploader::task::TaskResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// 已创建，尚未开始调度
    Init,
    /// 调度中
    Running,
    /// 已暂停（不再调度新任务，已调度的任务继续执行）
    Paused,
    /// 全部分片成功
    Completed,
    /// 已取消
    Canceled,
    /// 至少一个分片在重新入队后仍然失败
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Canceled | SessionStatus::Failed
        )
    }
}

/// 会话标识与配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// 会话 ID：`{file_digest}-{sequence}`
    pub id: String,
    /// 文件摘要
    pub file_digest: String,
    /// 会话序号
    pub sequence: u64,
    /// 最大并发任务数
    pub concurrency_limit: usize,
}

impl UploadSession {
    pub fn new(file_digest: &str, sequence: u64, concurrency_limit: usize) -> Self {
        Self {
            id: format!("{}-{}", file_digest, sequence),
            file_digest: file_digest.to_string(),
            sequence,
            concurrency_limit,
        }
    }
}

/// 恢复门：暂停时创建，下一次恢复时触发且只触发一次
#[derive(Debug)]
pub struct ResumeGate {
    tx: Option<oneshot::Sender<()>>,
    rx: oneshot::Receiver<()>,
}

impl Default for ResumeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumeGate {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self { tx: Some(tx), rx }
    }

    /// 打开恢复门，返回 false 表示已经打开过
    pub fn open(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_none()
    }

    /// 等待恢复门打开
    pub async fn wait(&mut self) {
        // 发送端只会在 open() 中被消费，Err 只可能在 open 之后出现
        let _ = (&mut self.rx).await;
    }
}

/// 会话内部状态
#[derive(Debug)]
pub struct SessionState {
    status: SessionStatus,
    paused: bool,
    canceled: bool,
    resume_gate: Option<ResumeGate>,
    progress_by_chunk: BTreeMap<usize, f64>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Init,
            paused: false,
            canceled: false,
            resume_gate: None,
            progress_by_chunk: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// 进入调度
    pub(crate) fn start(&mut self) {
        if self.status == SessionStatus::Init {
            self.status = SessionStatus::Running;
        }
    }

    /// 暂停，返回 false 表示状态未变化（已暂停、已取消或已结束）
    pub(crate) fn pause(&mut self) -> bool {
        if self.paused || self.canceled || self.status.is_terminal() {
            return false;
        }
        self.paused = true;
        self.status = SessionStatus::Paused;
        self.resume_gate = Some(ResumeGate::new());
        true
    }

    /// 恢复，返回 false 表示状态未变化
    pub(crate) fn resume(&mut self) -> bool {
        if !self.paused || self.canceled {
            return false;
        }
        self.paused = false;
        self.status = SessionStatus::Running;
        if let Some(gate) = self.resume_gate.as_mut() {
            gate.open();
        }
        true
    }

    /// 取消，返回 false 表示已经取消过
    ///
    /// 取消不可逆，同时丢弃未打开的恢复门
    pub(crate) fn cancel(&mut self) -> bool {
        if self.canceled || self.status.is_terminal() {
            return false;
        }
        self.canceled = true;
        self.paused = false;
        self.status = SessionStatus::Canceled;
        self.resume_gate = None;
        true
    }

    /// 是否存在尚未被调度循环消费的恢复门
    pub fn has_resume_gate(&self) -> bool {
        self.resume_gate.is_some()
    }

    /// 当前恢复门（仅在暂停后存在）
    pub(crate) fn resume_gate_mut(&mut self) -> Option<&mut ResumeGate> {
        self.resume_gate.as_mut()
    }

    /// 恢复门已被消费
    pub(crate) fn clear_resume_gate(&mut self) {
        self.resume_gate = None;
    }

    /// 记录分片进度
    ///
    /// 仅在既未暂停也未取消时生效，返回是否记录成功
    pub(crate) fn record_progress(&mut self, index: usize, share: f64) -> bool {
        if self.paused || self.canceled {
            debug!("会话已暂停或取消，丢弃分片 #{} 的进度", index);
            return false;
        }
        self.progress_by_chunk.insert(index, share);
        true
    }

    /// 总进度（百分比，最大 100）
    pub fn progress(&self) -> f64 {
        self.progress_by_chunk.values().sum::<f64>().min(100.0)
    }

    /// 结束会话
    pub(crate) fn finish(&mut self, status: SessionStatus) {
        if !self.canceled {
            self.status = status;
        }
        self.paused = false;
        self.resume_gate = None;
    }
}

/// 会话回调
///
/// 所有方法都在调度器循环中同步调用，实现中不应阻塞
pub trait SessionHooks: Send + Sync {
    fn on_paused(&self, _reason: Option<&str>) {}

    fn on_resumed(&self, _reason: Option<&str>) {}

    fn on_canceled(&self) {}

    fn on_progress(&self, _percent: f64) {}

    fn on_completed(&self, _results: &[TaskResult]) {}
}

/// 不做任何处理的回调
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

/// 控制消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Pause(Option<String>),
    Resume(Option<String>),
    Cancel,
}

/// 会话控制句柄
///
/// 可以克隆并在任意任务中使用；调度器结束后所有操作都返回 false
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    tx: mpsc::UnboundedSender<Control>,
}

impl SessionHandle {
    pub(crate) fn new(session_id: String, tx: mpsc::UnboundedSender<Control>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 暂停调度新任务
    pub fn pause(&self, reason: Option<&str>) -> bool {
        self.send(Control::Pause(reason.map(str::to_string)))
    }

    /// 恢复调度
    pub fn resume(&self, reason: Option<&str>) -> bool {
        self.send(Control::Resume(reason.map(str::to_string)))
    }

    /// 取消会话（不可逆）
    pub fn cancel(&self) -> bool {
        self.send(Control::Cancel)
    }

    /// 调度器是否仍在运行
    pub fn is_active(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, control: Control) -> bool {
        self.tx.send(control).is_ok()
    }
}

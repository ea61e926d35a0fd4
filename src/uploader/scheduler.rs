// 分片并发调度器
//
// 单个协调循环负责：
// - 按分片索引顺序准入任务（失败任务在队尾获得一次额外机会）
// - 限制同时执行的任务数
// - 处理暂停/恢复/取消控制消息与连通性事件
// - 汇总进度与每个任务的结算结果
//
// 会话状态只在本循环中修改；已派发的任务永远不会被中止

use crate::api::ApiError;
use crate::uploader::connectivity::{ConnectivityEvent, ConnectivitySignal, ConnectivitySubscription};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::session::{
    Control, ResumeGate, SessionHandle, SessionHooks, SessionState, SessionStatus, UploadSession,
};
use crate::uploader::task::{ChunkCompletion, TaskOutcome, TaskResult, UploadTask};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

// =====================================================
// 待调度队列
// =====================================================

/// 待调度条目
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub task: UploadTask,
    /// 0 = 首次调度，1 = 重新入队
    pub attempt: u32,
}

/// 待调度队列
///
/// 初始按分片索引排列；失败的任务通过 `requeue` 追加到队尾，每个任务最多一次
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<PendingEntry>,
}

impl PendingQueue {
    pub fn new(tasks: Vec<UploadTask>) -> Self {
        Self {
            queue: tasks
                .into_iter()
                .map(|task| PendingEntry { task, attempt: 0 })
                .collect(),
        }
    }

    pub fn pop_front(&mut self) -> Option<PendingEntry> {
        self.queue.pop_front()
    }

    /// 将首次失败的任务追加到队尾
    ///
    /// 已经重新入队过的任务返回 false
    pub fn requeue(&mut self, entry: PendingEntry) -> bool {
        if entry.attempt > 0 {
            return false;
        }
        self.queue.push_back(PendingEntry {
            task: entry.task,
            attempt: entry.attempt + 1,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// =====================================================
// 调度结果
// =====================================================

/// 单次执行的结果
enum AttemptResult {
    Completed(ChunkCompletion),
    Failed(ApiError),
    Panicked(String),
}

/// 任务结算
struct Settlement {
    entry: PendingEntry,
    result: AttemptResult,
}

/// 调度报告
#[derive(Debug, Clone)]
pub struct SchedulerReport {
    /// 终态
    pub status: SessionStatus,
    /// 每个任务的结果（按分片索引排序）
    pub results: Vec<TaskResult>,
    /// 汇总进度（百分比）
    pub progress: f64,
    /// 观察到的最大并发数
    pub peak_in_flight: usize,
}

impl SchedulerReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(TaskResult::is_success)
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Failed(_)))
            .count()
    }
}

// =====================================================
// 调度器
// =====================================================

/// 分片并发调度器
pub struct ConcurrencyScheduler {
    session: UploadSession,
    policy: RetryPolicy,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl ConcurrencyScheduler {
    /// 创建调度器
    ///
    /// # 参数
    /// * `session` - 会话信息（包含并发上限）
    /// * `policy` - 每个阶段使用的重试策略
    pub fn new(session: UploadSession, policy: RetryPolicy) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            session,
            policy,
            control_tx,
            control_rx,
        }
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// 获取控制句柄
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.session.id.clone(), self.control_tx.clone())
    }

    /// 运行调度循环，直到所有任务结算或取消后已派发任务全部结算
    ///
    /// # 参数
    /// * `tasks` - 按分片索引排列的任务
    /// * `hooks` - 会话回调
    /// * `connectivity` - 可选的连通性信号源，会话期间保持订阅
    pub async fn run(
        self,
        tasks: Vec<UploadTask>,
        hooks: &dyn SessionHooks,
        connectivity: Option<&dyn ConnectivitySignal>,
    ) -> SchedulerReport {
        let ConcurrencyScheduler {
            session,
            policy,
            control_tx,
            mut control_rx,
        } = self;
        // 只保留外部句柄，所有句柄释放后控制通道关闭
        drop(control_tx);

        let limit = session.concurrency_limit.max(1);
        let total = tasks.len();
        let share = if total == 0 { 0.0 } else { 100.0 / total as f64 };
        let started_at = Instant::now();

        info!(
            "会话 {} 开始调度: 分片数={}, 并发上限={}",
            session.id, total, limit
        );

        let mut results: BTreeMap<usize, TaskResult> = tasks
            .iter()
            .map(|task| {
                (
                    task.index,
                    TaskResult {
                        index: task.index,
                        outcome: TaskOutcome::NotAdmitted,
                        attempts: 0,
                    },
                )
            })
            .collect();

        let mut state = SessionState::new();
        state.start();

        let mut pending = PendingQueue::new(tasks);
        let mut in_flight: JoinSet<Settlement> = JoinSet::new();
        // 运行时任务 id → (分片索引, 调度序号)，任务异常退出时据此记账
        let mut dispatched: HashMap<TaskId, (usize, u32)> = HashMap::new();
        let mut peak_in_flight = 0usize;
        let mut subscription = connectivity.map(|signal| signal.subscribe());
        let mut controls_open = true;

        // 订阅前发生的断网事件不会重放，按当前状态补一次暂停
        if connectivity.is_some_and(|signal| !signal.is_online()) {
            apply_control(
                &session,
                &mut state,
                hooks,
                Control::Pause(Some("offline".to_string())),
            );
        }

        loop {
            // 准入前先处理已到达的控制消息
            while controls_open {
                match control_rx.try_recv() {
                    Ok(control) => apply_control(&session, &mut state, hooks, control),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("会话 {} 的控制句柄已全部释放", session.id);
                        controls_open = false;
                    }
                }
            }

            // 准入：未取消、未暂停、恢复门已消费、未达并发上限
            while admission_open(&state) && in_flight.len() < limit {
                let Some(entry) = pending.pop_front() else {
                    break;
                };
                if let Some(result) = results.get_mut(&entry.task.index) {
                    result.attempts = entry.attempt + 1;
                }
                let key = (entry.task.index, entry.attempt);
                let id = dispatch(&mut in_flight, entry, policy);
                dispatched.insert(id, key);
                peak_in_flight = peak_in_flight.max(in_flight.len());
            }

            if in_flight.is_empty() && (state.is_canceled() || pending.is_empty()) {
                break;
            }

            let connectivity_open = subscription
                .as_ref()
                .map(ConnectivitySubscription::is_attached)
                .unwrap_or(false);

            if state.is_paused() && in_flight.is_empty() && !controls_open && !connectivity_open {
                warn!("会话 {} 已暂停且无法再被恢复，自动取消", session.id);
                apply_control(&session, &mut state, hooks, Control::Cancel);
                continue;
            }

            let has_in_flight = !in_flight.is_empty();
            let gate_armed = state.has_resume_gate();

            tokio::select! {
                control = control_rx.recv(), if controls_open => {
                    match control {
                        Some(control) => apply_control(&session, &mut state, hooks, control),
                        None => {
                            debug!("会话 {} 的控制句柄已全部释放", session.id);
                            controls_open = false;
                        }
                    }
                }
                event = next_connectivity_event(subscription.as_mut()), if connectivity_open => {
                    match event {
                        Some(ConnectivityEvent::Lost) => apply_control(
                            &session,
                            &mut state,
                            hooks,
                            Control::Pause(Some("offline".to_string())),
                        ),
                        Some(ConnectivityEvent::Restored) => apply_control(
                            &session,
                            &mut state,
                            hooks,
                            Control::Resume(Some("online".to_string())),
                        ),
                        None => debug!("会话 {} 的连通性信号已关闭", session.id),
                    }
                }
                _ = wait_resume_gate(state.resume_gate_mut()), if gate_armed => {
                    debug!("会话 {} 恢复门已打开，继续准入", session.id);
                    state.clear_resume_gate();
                }
                Some(joined) = in_flight.join_next_with_id(), if has_in_flight => {
                    match joined {
                        Ok((id, settlement)) => {
                            dispatched.remove(&id);
                            settle(
                                settlement,
                                share,
                                &mut state,
                                &mut pending,
                                &mut results,
                                hooks,
                            )
                        }
                        // 任务内的 panic 已被捕获，这里只可能是任务被中止或运行时关闭
                        Err(e) => record_lost_task(e, &mut dispatched, &mut results),
                    }
                }
                else => break,
            }
        }

        if let Some(mut subscription) = subscription.take() {
            subscription.detach();
        }

        let results: Vec<TaskResult> = results.into_values().collect();
        let status = if state.is_canceled() {
            SessionStatus::Canceled
        } else if results.iter().all(TaskResult::is_success) {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        state.finish(status);

        hooks.on_completed(&results);

        info!(
            "会话 {} 调度结束: 状态={:?}, 进度={:.1}%, 最大并发={}, 耗时={}ms",
            session.id,
            state.status(),
            state.progress(),
            peak_in_flight,
            started_at.elapsed().as_millis()
        );

        SchedulerReport {
            status: state.status(),
            results,
            progress: state.progress(),
            peak_in_flight,
        }
    }
}

fn admission_open(state: &SessionState) -> bool {
    !state.is_canceled() && !state.is_paused() && !state.has_resume_gate()
}

/// 派发一个任务，返回运行时任务 id
fn dispatch(in_flight: &mut JoinSet<Settlement>, entry: PendingEntry, policy: RetryPolicy) -> TaskId {
    debug!(
        "派发分片 #{} (第 {} 次调度)",
        entry.task.index,
        entry.attempt + 1
    );
    in_flight.spawn(async move {
        let result = match AssertUnwindSafe(entry.task.execute(policy))
            .catch_unwind()
            .await
        {
            Ok(Ok(completion)) => AttemptResult::Completed(completion),
            Ok(Err(e)) => AttemptResult::Failed(e),
            Err(panic) => AttemptResult::Panicked(panic_message(panic.as_ref())),
        };
        Settlement { entry, result }
    })
    .id()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 应用一条控制消息并调用对应回调；无效的状态转换被忽略
fn apply_control(
    session: &UploadSession,
    state: &mut SessionState,
    hooks: &dyn SessionHooks,
    control: Control,
) {
    match control {
        Control::Pause(reason) => {
            if state.pause() {
                info!("会话 {} 已暂停: {:?}", session.id, reason);
                hooks.on_paused(reason.as_deref());
            } else {
                debug!("会话 {} 忽略暂停请求", session.id);
            }
        }
        Control::Resume(reason) => {
            if state.resume() {
                info!("会话 {} 已恢复: {:?}", session.id, reason);
                hooks.on_resumed(reason.as_deref());
            } else {
                debug!("会话 {} 忽略恢复请求", session.id);
            }
        }
        Control::Cancel => {
            if state.cancel() {
                info!("会话 {} 已取消", session.id);
                hooks.on_canceled();
            } else {
                debug!("会话 {} 忽略取消请求", session.id);
            }
        }
    }
}

/// 结算一个已完成的任务
fn settle(
    settlement: Settlement,
    share: f64,
    state: &mut SessionState,
    pending: &mut PendingQueue,
    results: &mut BTreeMap<usize, TaskResult>,
    hooks: &dyn SessionHooks,
) {
    let Settlement { entry, result } = settlement;
    let index = entry.task.index;
    let attempts = entry.attempt + 1;

    let outcome = match result {
        AttemptResult::Completed(completion) => {
            debug!("分片 #{} 结算: {:?}", index, completion);
            if state.record_progress(index, share) {
                hooks.on_progress(state.progress());
            }
            TaskOutcome::from(completion)
        }
        AttemptResult::Failed(e) => {
            let message = e.to_string();
            if state.is_canceled() {
                debug!("会话已取消，分片 #{} 的失败不再重新入队: {}", index, message);
            } else if pending.requeue(entry) {
                warn!("分片 #{} 失败，已重新加入队尾: {}", index, message);
            } else {
                error!("分片 #{} 重新入队后仍然失败: {}", index, message);
            }
            TaskOutcome::Failed(message)
        }
        AttemptResult::Panicked(message) => {
            error!("分片 #{} 执行时 panic: {}", index, message);
            TaskOutcome::Failed(format!("task panicked: {}", message))
        }
    };

    if let Some(record) = results.get_mut(&index) {
        record.outcome = outcome;
        record.attempts = attempts;
    }
}

/// 已派发的任务没有产出结算（被中止或运行时关闭），记为永久失败
fn record_lost_task(
    error: JoinError,
    dispatched: &mut HashMap<TaskId, (usize, u32)>,
    results: &mut BTreeMap<usize, TaskResult>,
) {
    let Some((index, attempt)) = dispatched.remove(&error.id()) else {
        error!("未知的分片任务异常退出: {}", error);
        return;
    };
    error!("分片 #{} 任务异常退出: {}", index, error);
    if let Some(record) = results.get_mut(&index) {
        record.outcome = TaskOutcome::Failed(format!("task lost: {}", error));
        record.attempts = attempt + 1;
    }
}

async fn next_connectivity_event(
    subscription: Option<&mut ConnectivitySubscription>,
) -> Option<ConnectivityEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => None,
    }
}

async fn wait_resume_gate(gate: Option<&mut ResumeGate>) {
    match gate {
        Some(gate) => gate.wait().await,
        None => std::future::pending().await,
    }
}

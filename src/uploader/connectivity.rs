// 网络连通性信号
//
// 调度器在会话生命周期内订阅连通性事件：
// - Lost     → pause("offline")
// - Restored → resume("online")
//
// 订阅时信号源已处于离线状态的，调度器立即暂停
// 会话结束时（任何终态）订阅都会被解除

use anyhow::{Context, Result};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 广播通道容量
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// 连通性事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// 网络断开
    Lost,
    /// 网络恢复
    Restored,
}

/// 连通性信号源
pub trait ConnectivitySignal: Send + Sync {
    /// 注册监听
    fn subscribe(&self) -> ConnectivitySubscription;

    /// 当前是否在线（最近一次发布的状态）
    fn is_online(&self) -> bool;
}

/// 一次连通性订阅
///
/// Drop 时自动解除；也可以调用 `detach()` 提前解除
#[derive(Debug)]
pub struct ConnectivitySubscription {
    rx: Option<broadcast::Receiver<ConnectivityEvent>>,
    listeners: Arc<AtomicUsize>,
}

impl ConnectivitySubscription {
    fn new(rx: broadcast::Receiver<ConnectivityEvent>, listeners: Arc<AtomicUsize>) -> Self {
        listeners.fetch_add(1, Ordering::SeqCst);
        Self {
            rx: Some(rx),
            listeners,
        }
    }

    /// 接收下一个事件
    ///
    /// 返回 None 表示已解除订阅或信号源已关闭
    pub async fn recv(&mut self) -> Option<ConnectivityEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("连通性事件积压，跳过 {} 条", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.detach();
                    return None;
                }
            }
        }
    }

    /// 解除订阅（可重复调用）
    pub fn detach(&mut self) {
        if self.rx.take().is_some() {
            self.listeners.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.rx.is_some()
    }
}

impl Drop for ConnectivitySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// 进程内连通性广播器
///
/// 广播通道不保留历史事件，最近一次的在线状态单独记录
#[derive(Debug, Clone)]
pub struct ConnectivityHub {
    tx: broadcast::Sender<ConnectivityEvent>,
    listeners: Arc<AtomicUsize>,
    online: Arc<AtomicBool>,
}

impl Default for ConnectivityHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            listeners: Arc::new(AtomicUsize::new(0)),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// 发布事件，返回收到事件的订阅数
    ///
    /// 先更新在线状态再广播，没有订阅者时状态同样生效
    pub fn publish(&self, event: ConnectivityEvent) -> usize {
        self.online
            .store(event == ConnectivityEvent::Restored, Ordering::SeqCst);
        self.tx.send(event).unwrap_or(0)
    }

    /// 当前仍然有效的订阅数
    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }
}

impl ConnectivitySignal for ConnectivityHub {
    fn subscribe(&self) -> ConnectivitySubscription {
        ConnectivitySubscription::new(self.tx.subscribe(), self.listeners.clone())
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// 基于 TCP 探测的连通性信号
///
/// 周期性地连接上传服务器，只在状态变化时发布事件
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    hub: ConnectivityHub,
    target: String,
    interval: Duration,
    timeout: Duration,
}

impl ConnectivityProbe {
    /// 创建探测器
    ///
    /// # 参数
    /// * `base_url` - 上传服务器地址，探测目标为其 host:port
    /// * `interval` - 探测间隔
    /// * `timeout` - 单次连接超时
    pub fn new(base_url: &str, interval: Duration, timeout: Duration) -> Result<Self> {
        let url = Url::parse(base_url).with_context(|| format!("无效的服务器地址: {}", base_url))?;
        let host = url
            .host_str()
            .with_context(|| format!("服务器地址缺少主机名: {}", base_url))?;
        let port = url
            .port_or_known_default()
            .with_context(|| format!("无法确定服务器端口: {}", base_url))?;

        Ok(Self {
            hub: ConnectivityHub::new(),
            target: format!("{}:{}", host, port),
            interval,
            timeout,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn hub(&self) -> &ConnectivityHub {
        &self.hub
    }

    /// 探测一次目标是否可连接
    pub async fn check_once(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("连通性探测失败: {} ({})", self.target, e);
                false
            }
            Err(_) => {
                debug!("连通性探测超时: {}", self.target);
                false
            }
        }
    }

    /// 启动后台探测任务，token 取消时退出
    pub fn spawn(&self, token: CancellationToken) -> JoinHandle<()> {
        let probe = self.clone();
        tokio::spawn(async move {
            info!(
                "连通性探测已启动: target={}, interval={:?}",
                probe.target, probe.interval
            );
            let mut tracker = OnlineTracker::default();
            let mut ticker = tokio::time::interval(probe.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = probe.check_once().await;
                        if let Some(event) = tracker.observe(reachable) {
                            match event {
                                ConnectivityEvent::Lost => warn!("网络连接中断: {}", probe.target),
                                ConnectivityEvent::Restored => info!("网络连接恢复: {}", probe.target),
                            }
                            probe.hub.publish(event);
                        }
                    }
                }
            }
            debug!("连通性探测已停止");
        })
    }
}

impl ConnectivitySignal for ConnectivityProbe {
    fn subscribe(&self) -> ConnectivitySubscription {
        self.hub.subscribe()
    }

    fn is_online(&self) -> bool {
        self.hub.is_online()
    }
}

/// 在线状态跟踪，初始视为在线
#[derive(Debug)]
struct OnlineTracker {
    online: bool,
}

impl Default for OnlineTracker {
    fn default() -> Self {
        Self { online: true }
    }
}

impl OnlineTracker {
    fn observe(&mut self, reachable: bool) -> Option<ConnectivityEvent> {
        if reachable == self.online {
            return None;
        }
        self.online = reachable;
        Some(if reachable {
            ConnectivityEvent::Restored
        } else {
            ConnectivityEvent::Lost
        })
    }
}

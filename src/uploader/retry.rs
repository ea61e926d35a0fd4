// 重试策略
//
// 对单个异步操作做有限次数的重试：
// - 失败且仍有预算：重新调用操作，预算减一
// - 预算耗尽：返回第一次调用的错误
//
// 被重试的操作必须可以安全地重复执行（网络请求函数，而不是会累积副作用的闭包）

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 默认重试预算
pub const DEFAULT_RETRY_BUDGET: u32 = 1;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 计算指数退避延迟
///
/// # 延迟序列（initial=100ms）
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - 最大: 5000ms
fn calculate_backoff_delay(initial_backoff_ms: u64, retry_count: u32) -> u64 {
    let factor = 2u64.saturating_pow(retry_count);
    initial_backoff_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 失败后允许的额外调用次数
    budget: u32,
    /// 初始退避延迟（毫秒），0 表示立即重试
    initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BUDGET)
    }
}

impl RetryPolicy {
    /// 创建立即重试的策略
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            initial_backoff_ms: 0,
        }
    }

    /// 设置重试之间的指数退避
    pub fn with_backoff(mut self, initial_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// 最多调用次数
    pub fn max_attempts(&self) -> u32 {
        self.budget.saturating_add(1)
    }

    /// 执行操作，失败时按预算重试
    ///
    /// # 参数
    /// * `operation` - 每次调用都生成一个新的 future
    pub async fn with_retry<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut remaining = self.budget;
        let mut retry_count = 0u32;
        let mut first_error: Option<E> = None;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if remaining == 0 => return Err(first_error.unwrap_or(e)),
                Err(e) => {
                    remaining -= 1;

                    let backoff_ms = calculate_backoff_delay(self.initial_backoff_ms, retry_count);
                    warn!(
                        "操作失败，{}ms 后重试 ({}/{}): {}",
                        backoff_ms,
                        retry_count + 1,
                        self.budget,
                        e
                    );
                    first_error.get_or_insert(e);
                    if backoff_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    }

                    retry_count += 1;
                }
            }
        }
    }
}

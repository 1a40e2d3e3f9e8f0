use crate::options::Options;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// 跨任务共享的取消令牌。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 建连、解析与带上下文的 `accept` 需要在调用方放弃时尽快返回；
/// - 取消通过 [`Notify`] 直接唤醒等待者，不依赖固定间隔轮询，因此取消延迟只受调度影响。
///
/// ## 契约（What）
/// - `cancel` 首次调用返回 `true`，之后返回 `false`；
/// - 克隆体共享同一状态，任意一方取消对全部可见；
/// - [`Cancellation::cancelled`] 在令牌已取消时立即完成。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒所有等待者。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 等待令牌被取消。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记再检查标志，避免 cancel 落在两者之间导致丢失唤醒。
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 一次调用携带的取消、截止时间与选项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 对应建连、监听时的“调用上下文”：调用方通过它传递外部取消信号、绝对截止时间，
///   以及需要转交给引擎的 [`Options`]；
/// - 以值语义传递，克隆成本为一次 `Arc` 计数与选项复制。
///
/// ## 契约（What）
/// - `deadline` 为 `None` 表示不设上限；
/// - `with_timeout` 以当前时刻为基准换算截止时间，若已存在更早的截止时间则保留更早者。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Option<Instant>,
    options: Options,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(earliest(self.deadline, Some(candidate)).unwrap_or(candidate));
        self
    }

    /// 附加传递给引擎的选项。
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

/// 取两个可选截止时间中更早的一个。
pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let cancellation = Cancellation::new();
        let waiter = {
            let cancellation = cancellation.clone();
            tokio::spawn(async move { cancellation.cancelled().await })
        };
        tokio::task::yield_now().await;
        assert!(cancellation.cancel());
        assert!(!cancellation.cancel());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
    }

    #[tokio::test]
    async fn already_cancelled_completes_immediately() {
        let cancellation = Cancellation::new();
        cancellation.cancel();
        tokio::time::timeout(Duration::from_millis(10), cancellation.cancelled())
            .await
            .expect("immediate");
    }

    #[test]
    fn earliest_picks_the_smaller_deadline() {
        let now = Instant::now();
        let later = now + Duration::from_secs(5);
        assert_eq!(earliest(Some(now), Some(later)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(Some(now), None), Some(now));
        assert_eq!(earliest(None, None), None);
    }

    #[tokio::test]
    async fn with_timeout_keeps_earlier_deadline() {
        let soon = Instant::now() + Duration::from_millis(10);
        let ctx = CallContext::new()
            .with_deadline(soon)
            .with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(soon));
    }
}

use crate::addr::SrtAddr;
use crate::conn::SrtConn;
use crate::context::CallContext;
use crate::engine::EngineListener;
use crate::error::{ACCEPT, CLOSE, SrtError, closed_error, map_io_error};
use crate::util::run_with_context;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, error, warn};

#[derive(Clone, Debug)]
enum ListenerState {
    Open,
    Closed,
    Failed(Arc<io::Error>),
}

/// SRT 监听器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 多个任务可以持有同一监听器的克隆并发 `accept`，每条入站连接只交付给一个调用方；
/// - 生命周期由 `watch` 状态广播：关闭或引擎故障时，所有阻塞中的 `accept`
///   同时被唤醒，不依赖轮询。
///
/// ## 逻辑（How）
/// - `accept` 在同一个 `select!` 中等待状态离开 `Open` 与引擎交付连接；
/// - 单次握手失败（中止、重置、非法握手、超时）记录告警后继续等待；
/// - 其他引擎错误使监听器进入 `Failed`，同一个错误对象被分发给当前及后续全部调用方。
///
/// ## 契约（What）
/// - `close` 不阻塞；首次调用返回 `Ok(())` 并释放引擎句柄，之后返回关闭错误；
/// - 关闭后所有 `accept` 立即返回 [`SrtError::Closed`]；
/// - 最后一个克隆被丢弃时自动释放引擎句柄。
#[derive(Clone)]
pub struct SrtListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    handle: Box<dyn EngineListener>,
    local: SrtAddr,
    state: watch::Sender<ListenerState>,
    close_called: AtomicBool,
}

impl fmt::Debug for SrtListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtListener")
            .field("local", &self.inner.local)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// 单次握手失败，监听器可以继续使用。
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::InvalidData
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

impl SrtListener {
    pub(crate) fn new(handle: Box<dyn EngineListener>, local: SrtAddr) -> Self {
        let (state, _) = watch::channel(ListenerState::Open);
        Self {
            inner: Arc::new(ListenerInner {
                handle,
                local,
                state,
                close_called: AtomicBool::new(false),
            }),
        }
    }

    /// 监听器绑定的地址（端口 0 已替换为实际分配的端口）。
    pub fn addr(&self) -> &SrtAddr {
        &self.inner.local
    }

    /// 等待下一条入站连接。
    pub async fn accept(&self) -> Result<SrtConn, SrtError> {
        let mut state = self.inner.state.subscribe();
        loop {
            let terminal = self.terminal_error(&state.borrow_and_update());
            if let Some(err) = terminal {
                return Err(err);
            }

            let outcome = tokio::select! {
                biased;
                _ = state.wait_for(|state| !matches!(state, ListenerState::Open)) => None,
                outcome = self.inner.handle.accept() => Some(outcome),
            };
            let Some(outcome) = outcome else {
                continue;
            };

            match outcome {
                Ok(handle) => {
                    let conn = SrtConn::from_engine(handle, ACCEPT)?;
                    debug!(
                        local = %conn.local_addr(),
                        remote = %conn.remote_addr(),
                        "srt connection accepted"
                    );
                    return Ok(conn);
                }
                Err(err) if is_transient(&err) => {
                    warn!(addr = %self.inner.local, error = %err, "srt handshake failed, listener keeps accepting");
                }
                Err(err) => self.fail(err),
            }
        }
    }

    /// 带取消与截止时间的 `accept`。
    pub async fn accept_context(&self, ctx: &CallContext) -> Result<SrtConn, SrtError> {
        run_with_context(ctx.cancellation(), ctx.deadline(), ACCEPT, self.accept()).await
    }

    /// 关闭监听器，唤醒全部阻塞中的 `accept`。
    pub fn close(&self) -> Result<(), SrtError> {
        if self.inner.close_called.swap(true, Ordering::AcqRel) {
            return Err(closed_error(CLOSE, "listener"));
        }
        let was_open = self.inner.state.send_if_modified(|state| {
            if matches!(state, ListenerState::Open) {
                *state = ListenerState::Closed;
                true
            } else {
                false
            }
        });
        debug!(addr = %self.inner.local, "srt listener closed");
        if was_open {
            self.inner
                .handle
                .close()
                .map_err(|err| map_io_error(CLOSE, Some(&self.inner.local), err))?;
        }
        Ok(())
    }

    fn fail(&self, err: io::Error) {
        let source = Arc::new(err);
        let transitioned = self.inner.state.send_if_modified(|state| {
            if matches!(state, ListenerState::Open) {
                *state = ListenerState::Failed(Arc::clone(&source));
                true
            } else {
                false
            }
        });
        if transitioned {
            error!(addr = %self.inner.local, error = %source, "srt listener failed");
            let _ = self.inner.handle.close();
        }
    }

    fn terminal_error(&self, state: &ListenerState) -> Option<SrtError> {
        match state {
            ListenerState::Open => None,
            ListenerState::Closed => Some(closed_error(ACCEPT, "listener")),
            ListenerState::Failed(source) => Some(SrtError::Io {
                op: ACCEPT,
                addr: Some(self.inner.local.clone()),
                source: Arc::clone(source),
            }),
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if matches!(*self.state.borrow(), ListenerState::Open) {
            let _ = self.handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::SrtTransport;
    use crate::engine::memory::MemoryEngine;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn handshake_failures_are_logged_and_recovered() {
        let engine = MemoryEngine::new();
        let srt = SrtTransport::new(engine.clone());
        let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
        engine.fail_next_handshakes(1);

        let addr = ln.addr().to_string();
        let dialer = srt.clone();
        let dials = tokio::spawn(async move {
            let first = dialer.dial("srt", &addr).await.expect("first dial");
            let second = dialer.dial("srt", &addr).await.expect("second dial");
            (first, second)
        });

        let accepted = tokio::time::timeout(Duration::from_secs(5), ln.accept())
            .await
            .expect("accept in time")
            .expect("accept after recovery");
        let (_first, second) = dials.await.expect("join");
        assert_eq!(accepted.remote_addr(), second.local_addr());
        assert!(logs_contain("srt handshake failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn engine_failure_is_logged_once() {
        let engine = MemoryEngine::new();
        let srt = SrtTransport::new(engine.clone());
        let ln = srt.listen("srt", "127.0.0.1:0").await.expect("listen");
        engine.shutdown();

        let first = ln.accept().await.expect_err("failed");
        let second = ln.accept().await.expect_err("still failed");
        assert_eq!(first.to_string(), second.to_string());
        assert!(logs_contain("srt listener failed"));
    }
}

use crate::addr::SrtAddr;
use crate::engine::{EngineConnection, ShutdownDirection};
use crate::error::{
    CLOSE, OperationKind, READ, SHUTDOWN, SrtError, WRITE, WRITE_VECTORED, closed_error,
    map_io_error, timeout_error,
};
use crate::util::deadline_expired;
use std::fmt;
use std::future::poll_fn;
use std::io::{self, IoSlice};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::debug;

const COPY_CHUNK: usize = 16 * 1024;

/// 已建立的 SRT 流连接。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一连接常由一个读任务与一个写任务共同驱动，因此读方向与写方向各自持有
///   独立的串行锁与截止时间，任一方向阻塞都不会占用另一方向或 `close` 需要的资源；
/// - 克隆成本为一次 `Arc` 计数，读写任务各持一份克隆即可。
///
/// ## 逻辑（How）
/// - 每次阻塞调用在同一个 `select!` 中竞争三件事：关闭标志、引擎的 `poll_*`、
///   本方向截止时间；截止时间以 `watch` 保存，修改后正在阻塞的调用会立即重新计时；
/// - 引擎读写以 `poll` 形式接收调用方缓冲区，稳态路径不做堆分配。
///
/// ## 契约（What）
/// - `read` 可能短读，`Ok(0)` 表示对端关闭写方向；
/// - `write`/`write_vectored` 写完全部字节才返回；
/// - 截止时间到期返回 [`SrtError::Timeout`]，连接仍可继续使用；
/// - `close` 幂等：首次返回 `Ok(())`，之后返回关闭错误；进行中的读写立即以关闭错误返回。
///
/// ## 注意事项（Trade-offs）
/// - 读写在截止或关闭时中断，已完成的字节数记录在错误的 `transferred` 中
///   （见 [`SrtError::transferred`]），重试时应从该位置继续。
#[derive(Clone)]
pub struct SrtConn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    handle: Box<dyn EngineConnection>,
    local: SrtAddr,
    remote: SrtAddr,
    read: Side,
    write: Side,
    closed: watch::Sender<bool>,
}

/// 单个方向的串行锁与截止时间。
struct Side {
    lock: Mutex<()>,
    deadline: watch::Sender<Option<Instant>>,
}

impl Side {
    fn new() -> Self {
        let (deadline, _) = watch::channel(None);
        Self {
            lock: Mutex::new(()),
            deadline,
        }
    }
}

impl fmt::Debug for SrtConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtConn")
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("closed", &*self.inner.closed.borrow())
            .finish()
    }
}

impl SrtConn {
    /// 包装引擎连接句柄，读取双方端点。
    pub(crate) fn from_engine(
        handle: Box<dyn EngineConnection>,
        op: OperationKind,
    ) -> Result<Self, SrtError> {
        let local = handle
            .local_addr()
            .map_err(|err| map_io_error(op, None, err))?;
        let remote = handle
            .remote_addr()
            .map_err(|err| map_io_error(op, None, err))?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ConnInner {
                handle,
                local,
                remote,
                read: Side::new(),
                write: Side::new(),
                closed,
            }),
        })
    }

    pub fn local_addr(&self) -> &SrtAddr {
        &self.inner.local
    }

    pub fn remote_addr(&self) -> &SrtAddr {
        &self.inner.remote
    }

    /// 引擎是否原生支持聚合写。
    pub fn is_write_vectored(&self) -> bool {
        self.inner.handle.is_send_vectored()
    }

    /// 读取一次，返回实际读取的字节数。
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SrtError> {
        let _guard = self.inner.read.lock.lock().await;
        self.recv_locked(buf).await
    }

    /// 读满 `buf`。
    ///
    /// 流在读满前结束时返回 [`SrtError::UnexpectedEof`]，其中 `read` 为本次调用
    /// 已经写入 `buf` 的字节数；截止或关闭打断时该数量记录在 `transferred` 中。
    pub async fn read_full(&self, buf: &mut [u8]) -> Result<usize, SrtError> {
        let _guard = self.inner.read.lock.lock().await;
        let mut filled = 0;
        while filled < buf.len() {
            let read = self
                .recv_locked(&mut buf[filled..])
                .await
                .map_err(|err| err.with_transferred(filled as u64))?;
            match read {
                0 => return Err(SrtError::UnexpectedEof { read: filled }),
                read => filled += read,
            }
        }
        Ok(filled)
    }

    /// 写出整个缓冲区。
    pub async fn write(&self, buf: &[u8]) -> Result<usize, SrtError> {
        let _guard = self.inner.write.lock.lock().await;
        self.send_all_locked(buf, WRITE).await
    }

    /// 将多个缓冲区作为一次逻辑写出，返回总字节数。
    ///
    /// 调用结束后 `bufs` 的内容处于未指定状态。
    pub async fn write_vectored(&self, mut bufs: &mut [IoSlice<'_>]) -> Result<u64, SrtError> {
        let _guard = self.inner.write.lock.lock().await;
        let handle = &self.inner.handle;
        let mut written = 0u64;
        IoSlice::advance_slices(&mut bufs, 0);
        while !bufs.is_empty() {
            let chunk = self
                .drive(&self.inner.write, WRITE_VECTORED, |cx| {
                    handle.poll_send_vectored(cx, &*bufs)
                })
                .await
                .map_err(|err| err.with_transferred(written))?;
            if chunk == 0 {
                return Err(self.write_zero(WRITE_VECTORED));
            }
            written += chunk as u64;
            IoSlice::advance_slices(&mut bufs, chunk);
        }
        Ok(written)
    }

    /// 将 `reader` 的内容全部写入连接，直到其返回 EOF。
    pub async fn copy_from<R>(&self, reader: &mut R) -> Result<u64, SrtError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = [0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            let read = reader
                .read(&mut chunk)
                .await
                .map_err(|err| map_io_error(WRITE, None, err))?;
            if read == 0 {
                return Ok(copied);
            }
            if let Err(err) = self.write(&chunk[..read]).await {
                let partial = err.transferred();
                return Err(err.with_transferred(copied + partial));
            }
            copied += read as u64;
        }
    }

    /// 同时设置读、写截止时间；`None` 表示取消截止。
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.read.deadline.send_replace(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.write.deadline.send_replace(deadline);
    }

    /// 半关闭。
    pub fn shutdown(&self, direction: ShutdownDirection) -> Result<(), SrtError> {
        if *self.inner.closed.borrow() {
            return Err(closed_error(SHUTDOWN, "connection"));
        }
        self.inner
            .handle
            .shutdown(direction)
            .map_err(|err| map_io_error(SHUTDOWN, Some(&self.inner.remote), err))
    }

    /// 关闭连接并唤醒所有进行中的读写。
    pub fn close(&self) -> Result<(), SrtError> {
        if self.inner.closed.send_replace(true) {
            return Err(closed_error(CLOSE, "connection"));
        }
        debug!(local = %self.inner.local, remote = %self.inner.remote, "srt connection closed");
        self.inner
            .handle
            .close()
            .map_err(|err| map_io_error(CLOSE, Some(&self.inner.remote), err))
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    async fn recv_locked(&self, buf: &mut [u8]) -> Result<usize, SrtError> {
        let handle = &self.inner.handle;
        self.drive(&self.inner.read, READ, |cx| handle.poll_recv(cx, &mut *buf))
            .await
    }

    async fn send_all_locked(&self, buf: &[u8], op: OperationKind) -> Result<usize, SrtError> {
        let handle = &self.inner.handle;
        let mut written = 0;
        while written < buf.len() {
            let rest = &buf[written..];
            let chunk = self
                .drive(&self.inner.write, op, |cx| handle.poll_send(cx, rest))
                .await
                .map_err(|err| err.with_transferred(written as u64))?;
            if chunk == 0 {
                return Err(self.write_zero(op));
            }
            written += chunk;
        }
        Ok(written)
    }

    fn write_zero(&self, op: OperationKind) -> SrtError {
        map_io_error(
            op,
            Some(&self.inner.remote),
            io::Error::from(io::ErrorKind::WriteZero),
        )
    }

    /// 驱动一次引擎 `poll_*`，同时观察关闭标志与本方向截止时间。
    async fn drive<T, F>(&self, side: &Side, op: OperationKind, mut poll: F) -> Result<T, SrtError>
    where
        F: FnMut(&mut Context<'_>) -> Poll<io::Result<T>>,
    {
        let mut closed = self.inner.closed.subscribe();
        let mut deadline_rx = side.deadline.subscribe();
        loop {
            if *closed.borrow() {
                return Err(closed_error(op, "connection"));
            }
            let deadline = *deadline_rx.borrow_and_update();
            if deadline_expired(deadline) {
                return Err(timeout_error(op));
            }

            // 计时器只在设置了截止时间时创建，未启用时钟的运行时也能读写。
            let expiry = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(expiry);

            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => {
                    return Err(closed_error(op, "connection"));
                }
                result = poll_fn(&mut poll) => {
                    return result.map_err(|err| map_io_error(op, Some(&self.inner.remote), err));
                }
                // 截止时间被修改：回到循环顶部按新值重新计时。
                _ = deadline_rx.changed() => {}
                _ = &mut expiry => {
                    return Err(timeout_error(op));
                }
            }
        }
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if !self.closed.send_replace(true) {
            let _ = self.handle.close();
        }
    }
}

//! 可靠传输引擎的能力边界。
//!
//! 套接字层只通过本模块的三个 trait 与引擎交互：引擎负责握手、可靠性、拥塞控制与
//! 重传，本层负责地址、生命周期、截止时间与并发契约。`memory` 子模块提供进程内的
//! 确定性实现，供测试、基准与演示使用。

pub mod memory;

use crate::addr::SrtAddr;
use crate::options::Options;
use async_trait::async_trait;
use std::io::{self, IoSlice};
use std::task::{Context, Poll};
use tokio::time::Instant;

/// 半关闭方向。
///
/// - `Read`：关闭读方向，继续允许写；
/// - `Write`：关闭写方向，对端读到流结束；
/// - `Both`：同时关闭读写。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

impl From<ShutdownDirection> for std::net::Shutdown {
    fn from(direction: ShutdownDirection) -> Self {
        match direction {
            ShutdownDirection::Read => std::net::Shutdown::Read,
            ShutdownDirection::Write => std::net::Shutdown::Write,
            ShutdownDirection::Both => std::net::Shutdown::Both,
        }
    }
}

/// 引擎入口：绑定监听与发起连接。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `listen`：绑定 `addr`（端口 0 表示分配临时端口），返回独占的监听句柄；
/// - `connect`：向 `addr` 握手，`deadline` 为截止时间（`None` 表示不限），`options`
///   原样来自调用方；无法识别或非法的选项由引擎自行决定忽略或报错；
/// - 两个方法返回的 Future 被丢弃时必须释放已占用的资源（如临时端口）。
#[async_trait]
pub trait TransportEngine: Send + Sync + 'static {
    async fn listen(
        &self,
        addr: &SrtAddr,
        options: &Options,
    ) -> io::Result<Box<dyn EngineListener>>;

    async fn connect(
        &self,
        addr: &SrtAddr,
        options: &Options,
        deadline: Option<Instant>,
    ) -> io::Result<Box<dyn EngineConnection>>;
}

/// 引擎监听句柄。
///
/// # 契约（What）
/// - `accept` 必须允许多个调用方并发等待，且是取消安全的：Future 被丢弃时不得吞掉
///   已完成握手的连接；
/// - 单次握手失败以 `ConnectionAborted`/`ConnectionReset`/`InvalidData`/`TimedOut`
///   报告，监听器会继续使用该句柄；其他错误视为不可恢复；
/// - `close` 幂等，且不得阻塞。
#[async_trait]
pub trait EngineListener: Send + Sync {
    fn local_addr(&self) -> io::Result<SrtAddr>;

    async fn accept(&self) -> io::Result<Box<dyn EngineConnection>>;

    fn close(&self) -> io::Result<()>;
}

/// 引擎连接句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读写采用 `poll` 形式，调用方提供缓冲区，套接字层在稳态读写中无需分配任何
///   中间对象；
/// - 读方向与写方向可能被两个任务同时驱动，因此所有方法都只借用 `&self`。
///
/// ## 契约（What）
/// - `poll_recv` 返回 `Ok(0)` 表示流结束；
/// - `poll_send` 可以只接受部分字节；
/// - `poll_send_vectored` 默认退化为发送第一个非空缓冲区，原生支持时应覆盖并让
///   `is_send_vectored` 返回 `true`；
/// - `close` 之后挂起中的 `poll_*` 必须被唤醒并返回错误。
pub trait EngineConnection: Send + Sync {
    fn local_addr(&self) -> io::Result<SrtAddr>;

    fn remote_addr(&self) -> io::Result<SrtAddr>;

    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    fn poll_send_vectored(
        &self,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let buf = bufs
            .iter()
            .find(|buf| !buf.is_empty())
            .map_or(&[][..], |buf| &**buf);
        self.poll_send(cx, buf)
    }

    fn is_send_vectored(&self) -> bool {
        false
    }

    fn shutdown(&self, direction: ShutdownDirection) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;
}

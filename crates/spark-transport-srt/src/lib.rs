#![doc = r#"
# spark-transport-srt

## 设计动机（Why）
- **定位**：为基于不可靠包通道的可靠传输（SRT）提供与常规流式套接字一致的
  编程模型：地址解析、监听、建连、读写、截止时间与关闭。
- **架构角色**：位于传输引擎之上的套接字层。握手、重传、拥塞控制等协议细节由
  引擎负责，本 crate 只通过 [`engine`] 模块的能力 trait 与之交互。
- **设计理念**：所有阻塞操作都是 `async fn`，只挂起调用任务；取消与截止时间以
  可观察的信号与阻塞 Future 竞争，而不是强行终止任务。

## 核心契约（What）
- **地址**：[`Resolver`] 接受 `srt`/`srt4`/`srt6`/空网络标识，解析 `host:port`、
  `[v6%zone]:port` 与主机名；字面量解析满足 `to_string` 往返；
- **监听**：[`SrtListener`] 支持多个任务并发 `accept`，单次握手失败不会终止监听器，
  `close` 立即唤醒全部等待者；
- **建连**：[`Dialer`] 组合超时、绝对截止与外部取消，选项包原样转交引擎；
- **连接**：[`SrtConn`] 读写方向相互独立，截止时间可随时重设且到期不致命，
  稳态读写不做堆分配；
- **错误**：[`SrtError`] 携带 `spark.transport.srt.*` 稳定错误码与
  [`ErrorCategory`]，调用方无需比较字符串即可决定是否重试。

## 实现策略（How）
- **执行框架**：Tokio；截止时间与关闭标志以 `tokio::sync::watch` 广播，
  阻塞调用在 `tokio::select!` 中同时等待引擎、关闭与截止；
- **引擎边界**：`listen`/`connect`/`accept` 为异步 trait 方法，读写为 `poll_*`
  形式，由调用方提供缓冲区；
- **测试引擎**：[`MemoryEngine`] 在进程内以环形缓冲区模拟连接，支持握手延迟、
  握手失败注入与不可恢复故障，供测试、基准与演示使用。

## 风险与考量（Trade-offs）
- **自连接防护**：建连时若引擎返回本端与远端相同的连接会被拒绝，但端口复用策略
  属于引擎，本层只能尽力而为；
- **部分读写**：读写在截止或关闭时中断时，已完成的字节数随错误返回
  （[`SrtError::transferred`]），调用方据此从正确的流位置继续。
"#]

mod addr;
mod config;
mod conn;
mod context;
mod dialer;
pub mod engine;
pub mod error;
mod listener;
mod options;
mod resolver;
mod transport;
mod util;

pub use addr::{NETWORK, SrtAddr};
pub use config::SrtConfig;
pub use conn::SrtConn;
pub use context::{CallContext, Cancellation};
pub use dialer::Dialer;
pub use engine::memory::{MemoryEngine, MemoryEngineConfig};
pub use engine::ShutdownDirection;
pub use error::{ErrorCategory, OperationKind, SrtError};
pub use listener::SrtListener;
pub use options::Options;
pub use resolver::{NameLookup, Network, Resolver, SystemLookup};
pub use transport::SrtTransport;

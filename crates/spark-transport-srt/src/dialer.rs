use crate::conn::SrtConn;
use crate::context::{CallContext, earliest};
use crate::error::{DIAL, SrtError, map_io_error};
use crate::options::Options;
use crate::resolver::Network;
use crate::transport::SrtTransport;
use crate::util::run_with_context;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 建连配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把超时、绝对截止时间与默认选项集中在一个可复用的值上，`dial`/`dial_context`
///   只需关心目标地址；
/// - 零值（无超时、无截止、空选项）即 [`SrtTransport::dial`] 的行为。
///
/// ## 逻辑（How）
/// 1. 先校验网络标识，未知网络永远不会被报告为地址格式错误；
/// 2. 计算有效截止时间：`now + timeout`、`deadline` 与上下文截止时间中最早者；
/// 3. 在 `run_with_context` 中依次解析地址、调用引擎 `connect`，取消与截止可在任一步打断；
/// 4. 引擎返回的连接若本地端点与远端端点相同，关闭句柄并返回 [`SrtError::SelfConnect`]。
///
/// ## 契约（What）
/// - 选项为 `with_options` 的默认值叠加上下文选项，原样交给引擎；
/// - 引擎错误包装为 [`SrtError::Io`]，不改写原始文本。
#[derive(Clone, Debug)]
pub struct Dialer {
    srt: SrtTransport,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    options: Options,
}

impl Dialer {
    pub(crate) fn new(srt: SrtTransport) -> Self {
        Self {
            srt,
            timeout: None,
            deadline: None,
            options: Options::new(),
        }
    }

    /// 建连超时；`Duration::ZERO` 表示不限。
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 默认选项，上下文中的同名选项优先。
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub async fn dial(&self, network: &str, address: &str) -> Result<SrtConn, SrtError> {
        self.dial_context(&CallContext::new(), network, address)
            .await
    }

    pub async fn dial_context(
        &self,
        ctx: &CallContext,
        network: &str,
        address: &str,
    ) -> Result<SrtConn, SrtError> {
        let network = Network::parse(network)?;
        let deadline = earliest(
            earliest(self.timeout.map(|timeout| Instant::now() + timeout), self.deadline),
            ctx.deadline(),
        );
        let options = self.options.merged(ctx.options());

        run_with_context(ctx.cancellation(), deadline, DIAL, async {
            let remote = self.srt.resolver().resolve_network(network, address).await?;
            debug!(network = %network, remote = %remote, "srt dial");
            let handle = self
                .srt
                .engine()
                .connect(&remote, &options, deadline)
                .await
                .map_err(|err| map_io_error(DIAL, Some(&remote), err))?;
            let conn = SrtConn::from_engine(handle, DIAL)?;

            if conn.local_addr().same_endpoint(conn.remote_addr()) {
                warn!(addr = %conn.local_addr(), "srt dial connected to itself, dropping connection");
                let _ = conn.close();
                return Err(SrtError::SelfConnect {
                    op: DIAL,
                    addr: remote,
                });
            }
            debug!(local = %conn.local_addr(), remote = %conn.remote_addr(), "srt connection established");
            Ok(conn)
        })
        .await
    }
}

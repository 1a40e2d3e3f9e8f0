use crate::addr::SrtAddr;
use crate::config::SrtConfig;
use crate::conn::SrtConn;
use crate::context::CallContext;
use crate::dialer::Dialer;
use crate::engine::TransportEngine;
use crate::error::{LISTEN, SrtError, map_io_error};
use crate::listener::SrtListener;
use crate::resolver::{Network, Resolver};
use crate::util::run_with_context;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// 套接字层入口：绑定一个传输引擎与一个地址解析器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 所有监听与建连都经由同一个值发起，引擎与名称解析均以构造参数注入，
///   测试只需替换为 [`MemoryEngine`](crate::engine::memory::MemoryEngine) 与确定性查询函数；
/// - 克隆成本为两次 `Arc` 计数，可以放心在任务之间传递。
///
/// ## 契约（What）
/// - `listen*`：解析地址后交由引擎绑定，监听器地址反映引擎实际分配的端口；
/// - `dial`：等价于零值 [`Dialer`]，但会应用 [`SrtConfig`] 中的默认超时与选项；
/// - 配置中的默认选项位于调用方选项之下，同名键以调用方为准。
#[derive(Clone)]
pub struct SrtTransport {
    engine: Arc<dyn TransportEngine>,
    resolver: Resolver,
    config: SrtConfig,
}

impl fmt::Debug for SrtTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtTransport")
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SrtTransport {
    pub fn new(engine: impl TransportEngine) -> Self {
        Self::from_shared(Arc::new(engine))
    }

    /// 与其他实例共享同一个引擎。
    pub fn from_shared(engine: Arc<dyn TransportEngine>) -> Self {
        Self {
            engine,
            resolver: Resolver::new(),
            config: SrtConfig::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_config(mut self, config: SrtConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn config(&self) -> &SrtConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<dyn TransportEngine> {
        &self.engine
    }

    pub async fn resolve(&self, network: &str, address: &str) -> Result<SrtAddr, SrtError> {
        self.resolver.resolve(network, address).await
    }

    pub async fn listen(&self, network: &str, address: &str) -> Result<SrtListener, SrtError> {
        self.listen_context(&CallContext::new(), network, address)
            .await
    }

    /// 带上下文的监听；上下文中的选项会转交给引擎。
    pub async fn listen_context(
        &self,
        ctx: &CallContext,
        network: &str,
        address: &str,
    ) -> Result<SrtListener, SrtError> {
        let network = Network::parse(network)?;
        run_with_context(ctx.cancellation(), ctx.deadline(), LISTEN, async {
            let addr = self.resolver.resolve_network(network, address).await?;
            self.bind(ctx, &addr).await
        })
        .await
    }

    /// 以已解析的地址监听；`None` 表示任意地址、任意端口。
    pub async fn listen_addr(
        &self,
        ctx: &CallContext,
        network: &str,
        addr: Option<&SrtAddr>,
    ) -> Result<SrtListener, SrtError> {
        let network = Network::parse(network)?;
        let addr = addr.cloned().unwrap_or_default();
        if let Some(ip) = addr.ip()
            && !network.allows(&ip)
        {
            return Err(SrtError::NoSuitableAddress {
                network: network.as_str(),
                addr: addr.to_string(),
            });
        }
        run_with_context(ctx.cancellation(), ctx.deadline(), LISTEN, self.bind(ctx, &addr)).await
    }

    /// 按配置构造的 [`Dialer`]。
    pub fn dialer(&self) -> Dialer {
        let dialer = Dialer::new(self.clone()).with_options(self.config.options.clone());
        match self.config.dial_timeout() {
            Some(timeout) => dialer.with_timeout(timeout),
            None => dialer,
        }
    }

    pub async fn dial(&self, network: &str, address: &str) -> Result<SrtConn, SrtError> {
        self.dialer().dial(network, address).await
    }

    async fn bind(&self, ctx: &CallContext, addr: &SrtAddr) -> Result<SrtListener, SrtError> {
        let options = self.config.options.merged(ctx.options());
        let handle = self
            .engine
            .listen(addr, &options)
            .await
            .map_err(|err| map_io_error(LISTEN, Some(addr), err))?;
        let local = handle
            .local_addr()
            .map_err(|err| map_io_error(LISTEN, Some(addr), err))?;
        debug!(addr = %local, "srt listener bound");
        Ok(SrtListener::new(handle, local))
    }
}

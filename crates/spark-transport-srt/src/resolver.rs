use crate::addr::SrtAddr;
use crate::context::CallContext;
use crate::error::{RESOLVE, SrtError};
use crate::util::run_with_context;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

/// 网络标识：通用、仅 IPv4、仅 IPv6。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Srt,
    Srt4,
    Srt6,
}

impl Network {
    /// 解析网络标识；空字符串等同于 `"srt"`。
    ///
    /// 其他取值一律返回 [`SrtError::UnknownNetwork`]，调用方可以据此与地址格式错误区分。
    pub fn parse(token: &str) -> Result<Self, SrtError> {
        match token {
            "" | "srt" => Ok(Network::Srt),
            "srt4" => Ok(Network::Srt4),
            "srt6" => Ok(Network::Srt6),
            other => Err(SrtError::UnknownNetwork(other.to_owned())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Srt => "srt",
            Network::Srt4 => "srt4",
            Network::Srt6 => "srt6",
        }
    }

    /// 判断 IP 是否属于该网络允许的协议族。
    pub fn allows(&self, ip: &IpAddr) -> bool {
        match self {
            Network::Srt => true,
            Network::Srt4 => ip.is_ipv4(),
            Network::Srt6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 主机名查询能力。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 名称解析是解析器唯一的外部依赖，以构造参数注入，测试可以替换为确定性实现，
///   不存在进程级的可变钩子；
/// - 任何 `Fn(&str) -> io::Result<Vec<IpAddr>>` 闭包都自动实现本 trait。
///
/// ## 契约（What）
/// - 返回的候选按偏好排序；空列表表示名称存在但没有地址；
/// - 失败以 [`io::Error`] 报告，解析器将其包装为 [`SrtError::Lookup`]。
#[async_trait]
pub trait NameLookup: Send + Sync + 'static {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// 基于 Tokio 系统解析器的默认实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLookup;

#[async_trait]
impl NameLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[async_trait]
impl<F> NameLookup for F
where
    F: Fn(&str) -> io::Result<Vec<IpAddr>> + Send + Sync + 'static,
{
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        (self)(host)
    }
}

/// 将 `(网络, 地址文本)` 解析为 [`SrtAddr`]。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 地址文本形如 `host:port`，`host` 可为空、IPv4 点分十进制、`[v6]`、`[v6%zone]`
///   或主机名；`port` 为 0–65535 的十进制数，空端口视为 0；
/// - 字面量直接解析，不触发名称查询；受限网络下协族不符返回
///   [`SrtError::NoSuitableAddress`]；
/// - 主机名经 [`NameLookup`] 查询，候选按网络过滤，通用网络优先 IPv4；
/// - 对字面量解析得到的地址 `a`，`resolve(a.network(), a.to_string())` 必然得到与 `a`
///   相等的值。
///
/// ## 注意事项（Trade-offs）
/// - 非数字端口不做服务名查询，直接视为格式错误。
#[derive(Clone)]
pub struct Resolver {
    lookup: Arc<dyn NameLookup>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl Resolver {
    /// 使用系统名称解析的解析器。
    pub fn new() -> Self {
        Self::with_lookup(SystemLookup)
    }

    /// 使用给定名称查询实现的解析器。
    pub fn with_lookup(lookup: impl NameLookup) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    pub async fn resolve(&self, network: &str, address: &str) -> Result<SrtAddr, SrtError> {
        let network = Network::parse(network)?;
        self.resolve_network(network, address).await
    }

    /// 带取消与截止时间的解析。
    pub async fn resolve_with(
        &self,
        ctx: &CallContext,
        network: &str,
        address: &str,
    ) -> Result<SrtAddr, SrtError> {
        let network = Network::parse(network)?;
        run_with_context(
            ctx.cancellation(),
            ctx.deadline(),
            RESOLVE,
            self.resolve_network(network, address),
        )
        .await
    }

    pub(crate) async fn resolve_network(
        &self,
        network: Network,
        address: &str,
    ) -> Result<SrtAddr, SrtError> {
        let (host, port, bracketed) = split_host_port(address)?;
        let port = parse_port(port)?;
        let (host, zone) = split_host_zone(host);

        if host.is_empty() && !bracketed {
            if let Some(zone) = zone {
                return Err(invalid(format!("%{zone}"), "zone requires an IPv6 address"));
            }
            return Ok(SrtAddr::new(None, port));
        }

        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip.to_canonical(),
            Err(_) if bracketed => return Err(invalid(host, "invalid IP literal")),
            Err(_) => self.lookup_host(network, host, address).await?,
        };
        if !network.allows(&ip) {
            return Err(SrtError::NoSuitableAddress {
                network: network.as_str(),
                addr: address.to_owned(),
            });
        }

        let addr = SrtAddr::new(Some(ip), port);
        match zone {
            Some(zone) => addr.with_zone(zone),
            None => Ok(addr),
        }
    }

    async fn lookup_host(
        &self,
        network: Network,
        host: &str,
        address: &str,
    ) -> Result<IpAddr, SrtError> {
        let candidates = self
            .lookup
            .lookup(host)
            .await
            .map_err(|source| SrtError::Lookup {
                host: host.to_owned(),
                source: Arc::new(source),
            })?;
        let candidates = candidates.into_iter().map(|ip| ip.to_canonical());
        let picked = match network {
            Network::Srt => {
                let all: Vec<IpAddr> = candidates.collect();
                all.iter()
                    .find(|ip| ip.is_ipv4())
                    .or_else(|| all.first())
                    .copied()
            }
            restricted => candidates.into_iter().find(|ip| restricted.allows(ip)),
        };
        picked.ok_or_else(|| SrtError::NoSuitableAddress {
            network: network.as_str(),
            addr: address.to_owned(),
        })
    }
}

fn invalid(addr: impl Into<String>, reason: &'static str) -> SrtError {
    SrtError::InvalidAddress {
        addr: addr.into(),
        reason,
    }
}

/// 拆分 `host:port`，返回 `(host, port, 是否带方括号)`。
fn split_host_port(address: &str) -> Result<(&str, &str, bool), SrtError> {
    let (host, port, bracketed) = if let Some(rest) = address.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(invalid(address, "missing ']' in address"));
        };
        let after = &rest[end + 1..];
        let Some(port) = after.strip_prefix(':') else {
            return Err(invalid(address, "missing port in address"));
        };
        (&rest[..end], port, true)
    } else {
        let Some(colon) = address.rfind(':') else {
            return Err(invalid(address, "missing port in address"));
        };
        let host = &address[..colon];
        if host.contains(':') {
            return Err(invalid(address, "too many colons in address"));
        }
        (host, &address[colon + 1..], false)
    };

    if host.contains('[') {
        return Err(invalid(address, "unexpected '[' in address"));
    }
    if host.contains(']') || port.contains(']') {
        return Err(invalid(address, "unexpected ']' in address"));
    }
    Ok((host, port, bracketed))
}

fn split_host_zone(host: &str) -> (&str, Option<&str>) {
    match host.rfind('%') {
        Some(index) => (&host[..index], Some(&host[index + 1..])),
        None => (host, None),
    }
}

fn parse_port(port: &str) -> Result<u16, SrtError> {
    if port.is_empty() {
        return Ok(0);
    }
    if !port.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(invalid(port, "invalid port"));
    }
    port.parse::<u16>()
        .map_err(|_| invalid(port, "port out of range"))
}

use crate::error::SrtError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// 网络标识，对应 [`SrtAddr::network`] 的返回值。
pub const NETWORK: &str = "srt";

/// SRT 端点地址。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 监听器、连接与解析器共享的唯一地址表示；与 `std::net::SocketAddr` 不同，
///   它允许“无 IP”（绑定任意地址）并以文本形式保存 IPv6 作用域（如 `en0`）。
///
/// ## 契约（What）
/// - `ip`：`None` 表示未指定地址；IPv4 映射的 IPv6 地址会被规整为 IPv4，
///   保证 `to_string` 后再解析得到相等的值；
/// - `port`：0 在绑定时表示由引擎分配临时端口；
/// - `zone`：仅在 IPv6 地址上允许非空；
/// - 相等性为结构化比较（ip、port、zone 全部相等）。
///
/// ## 注意事项（Trade-offs）
/// - 地址一经构造即不可变；需要修改端口时使用 [`SrtAddr::with_port`] 生成新值。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SrtAddr {
    ip: Option<IpAddr>,
    port: u16,
    zone: Option<String>,
}

impl SrtAddr {
    /// 以 IP 与端口构造地址。
    pub fn new(ip: Option<IpAddr>, port: u16) -> Self {
        Self {
            ip: ip.map(|ip| ip.to_canonical()),
            port,
            zone: None,
        }
    }

    /// 附加 IPv6 作用域；空字符串表示清除作用域。
    ///
    /// 非 IPv6 地址携带作用域，或作用域含有 `%`、`[`、`]` 时返回
    /// [`SrtError::InvalidAddress`]。
    pub fn with_zone(mut self, zone: impl Into<String>) -> Result<Self, SrtError> {
        let zone = zone.into();
        if zone.is_empty() {
            self.zone = None;
            return Ok(self);
        }
        if zone.contains(['%', '[', ']']) {
            return Err(SrtError::InvalidAddress {
                addr: format!("{}%{}", self.host(), zone),
                reason: "invalid zone",
            });
        }
        match self.ip {
            Some(IpAddr::V6(_)) => {
                self.zone = Some(zone);
                Ok(self)
            }
            _ => Err(SrtError::InvalidAddress {
                addr: format!("{}%{}", self.host(), zone),
                reason: "zone requires an IPv6 address",
            }),
        }
    }

    /// 返回端口替换后的新地址。
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            ip: self.ip,
            port,
            zone: self.zone.clone(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    /// 网络名称，始终为 `"srt"`。
    pub fn network(&self) -> &'static str {
        NETWORK
    }

    /// IP 缺失或为全零地址时返回 `true`。
    pub fn is_unspecified(&self) -> bool {
        self.ip.is_none_or(|ip| ip.is_unspecified())
    }

    /// 端点是否指向同一 IP 与端口（忽略作用域）。
    pub fn same_endpoint(&self, other: &SrtAddr) -> bool {
        self.ip == other.ip && self.port == other.port
    }

    /// 转换为标准库地址；缺失 IP 时以 IPv4 全零地址代替，数字作用域映射为 `scope_id`。
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self.ip {
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
            Some(IpAddr::V4(v4)) => SocketAddr::new(IpAddr::V4(v4), self.port),
            Some(IpAddr::V6(v6)) => {
                let scope_id = self
                    .zone
                    .as_deref()
                    .and_then(|zone| zone.parse::<u32>().ok())
                    .unwrap_or(0);
                SocketAddr::V6(SocketAddrV6::new(v6, self.port, 0, scope_id))
            }
        }
    }

    fn host(&self) -> String {
        match self.ip {
            None => String::new(),
            Some(ip) => ip.to_string(),
        }
    }
}

impl fmt::Display for SrtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip, self.zone.as_deref()) {
            (None, _) => write!(f, ":{}", self.port),
            (Some(IpAddr::V4(ip)), _) => write!(f, "{}:{}", ip, self.port),
            (Some(IpAddr::V6(ip)), None) => write!(f, "[{}]:{}", ip, self.port),
            (Some(IpAddr::V6(ip)), Some(zone)) => write!(f, "[{}%{}]:{}", ip, zone, self.port),
        }
    }
}

impl From<SocketAddr> for SrtAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => SrtAddr::new(Some(IpAddr::V4(*v4.ip())), v4.port()),
            SocketAddr::V6(v6) => {
                let mut out = SrtAddr::new(Some(IpAddr::V6(*v6.ip())), v6.port());
                if v6.scope_id() != 0 && out.ip.is_some_and(|ip| ip.is_ipv6()) {
                    out.zone = Some(v6.scope_id().to_string());
                }
                out
            }
        }
    }
}

impl From<(IpAddr, u16)> for SrtAddr {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        SrtAddr::new(Some(ip), port)
    }
}

impl From<(Ipv4Addr, u16)> for SrtAddr {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        SrtAddr::new(Some(IpAddr::V4(ip)), port)
    }
}

impl From<(Ipv6Addr, u16)> for SrtAddr {
    fn from((ip, port): (Ipv6Addr, u16)) -> Self {
        SrtAddr::new(Some(IpAddr::V6(ip)), port)
    }
}

use crate::addr::SrtAddr;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// 描述一次套接字操作对应的稳定错误码与默认文案。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 让解析、监听、建连、读写、关闭等失败共享一张错误码表，日志与告警可直接按
///   `spark.transport.srt.*` 聚合，而无需解析自然语言文案；
/// - 与 [`SrtError`] 的变体正交：同一个 `Timeout` 变体可以携带 `read`/`write`/`dial`
///   不同的操作类别。
///
/// ## 契约（What）
/// - `code`：稳定错误码，发布后不得修改；
/// - `message`：用于拼装 `Display` 的操作名（如 `"srt dial"`）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

pub const RESOLVE: OperationKind = OperationKind {
    code: "spark.transport.srt.resolve_failed",
    message: "srt resolve",
};
pub const LISTEN: OperationKind = OperationKind {
    code: "spark.transport.srt.listen_failed",
    message: "srt listen",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.srt.accept_failed",
    message: "srt accept",
};
pub const DIAL: OperationKind = OperationKind {
    code: "spark.transport.srt.dial_failed",
    message: "srt dial",
};
pub const READ: OperationKind = OperationKind {
    code: "spark.transport.srt.read_failed",
    message: "srt read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.transport.srt.write_failed",
    message: "srt write",
};
pub const WRITE_VECTORED: OperationKind = OperationKind {
    code: "spark.transport.srt.writev_failed",
    message: "srt write_vectored",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.transport.srt.shutdown_failed",
    message: "srt shutdown",
};
pub const CLOSE: OperationKind = OperationKind {
    code: "spark.transport.srt.close_failed",
    message: "srt close",
};

const UNKNOWN_NETWORK_CODE: &str = "spark.transport.srt.unknown_network";
const INVALID_ADDRESS_CODE: &str = "spark.transport.srt.invalid_address";
const NO_SUITABLE_ADDRESS_CODE: &str = "spark.transport.srt.no_suitable_address";
const LOOKUP_CODE: &str = "spark.transport.srt.lookup_failed";
const CANCEL_CODE: &str = "spark.transport.srt.cancelled";
const TIMEOUT_CODE: &str = "spark.transport.srt.timeout";
const CLOSED_CODE: &str = "spark.transport.srt.closed";
const UNEXPECTED_EOF_CODE: &str = "spark.transport.srt.unexpected_eof";
const SELF_CONNECT_CODE: &str = "spark.transport.srt.self_connect";
const INVALID_CONFIG_CODE: &str = "spark.transport.srt.invalid_config";

/// 错误分类，驱动调用方的重试/退避/终止决策。
///
/// - `Retryable`：携带建议的退避时长；
/// - `NonRetryable`：本地或语义错误，重试无意义；
/// - `Timeout`：截止时间到期，调用方可退避后重试；
/// - `Cancelled`：调用方主动取消；
/// - `Closed`：连接或监听器已关闭，可重复观测。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Retryable { after: Duration },
    NonRetryable,
    Timeout,
    Cancelled,
    Closed,
}

impl ErrorCategory {
    fn retryable(after: Duration) -> Self {
        ErrorCategory::Retryable { after }
    }
}

/// SRT 套接字层的统一错误类型。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 区分“本地输入错误”（未知网络、地址格式）与“运行期错误”（超时、取消、关闭、
///   引擎失败），让调用方无需比较字符串即可决定是否重试；
/// - 引擎返回的 [`io::Error`] 以 `Arc` 保存，监听器进入失败态后可将同一个错误分发
///   给所有阻塞中的 `accept` 调用者。
///
/// ## 契约（What）
/// - [`SrtError::code`] 返回稳定错误码；[`SrtError::category`] 返回分类；
/// - `UnexpectedEof::read` 为该次调用实际读取的字节数，可能非零；
/// - `Timeout`/`Closed` 的 `transferred` 为被打断的读写在出错前已经完成的字节数，
///   调用方据此得知流的确切位置，非读写操作恒为 0；
/// - `Io` 变体从不改写引擎错误文本，`source()` 可取回原始错误。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum SrtError {
    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },

    #[error("{network} {addr}: no suitable address found")]
    NoSuitableAddress { network: &'static str, addr: String },

    #[error("lookup {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("{op} timed out")]
    Timeout {
        op: OperationKind,
        transferred: u64,
    },

    #[error("{op} cancelled")]
    Cancelled { op: OperationKind },

    #[error("{op}: use of closed {resource}")]
    Closed {
        op: OperationKind,
        resource: &'static str,
        transferred: u64,
    },

    #[error("unexpected end of stream after {read} bytes")]
    UnexpectedEof { read: usize },

    #[error("{op} {addr}: connected to self")]
    SelfConnect { op: OperationKind, addr: SrtAddr },

    #[error("{op}{}: {source}", display_addr(.addr))]
    Io {
        op: OperationKind,
        addr: Option<SrtAddr>,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn display_addr(addr: &Option<SrtAddr>) -> String {
    match addr {
        Some(addr) => format!(" {addr}"),
        None => String::new(),
    }
}

impl SrtError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SrtError::UnknownNetwork(_) => UNKNOWN_NETWORK_CODE,
            SrtError::InvalidAddress { .. } => INVALID_ADDRESS_CODE,
            SrtError::NoSuitableAddress { .. } => NO_SUITABLE_ADDRESS_CODE,
            SrtError::Lookup { .. } => LOOKUP_CODE,
            SrtError::Timeout { .. } => TIMEOUT_CODE,
            SrtError::Cancelled { .. } => CANCEL_CODE,
            SrtError::Closed { .. } => CLOSED_CODE,
            SrtError::UnexpectedEof { .. } => UNEXPECTED_EOF_CODE,
            SrtError::SelfConnect { .. } => SELF_CONNECT_CODE,
            SrtError::Io { op, .. } => op.code,
            SrtError::InvalidConfig(_) => INVALID_CONFIG_CODE,
        }
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            SrtError::UnknownNetwork(_)
            | SrtError::InvalidAddress { .. }
            | SrtError::NoSuitableAddress { .. }
            | SrtError::UnexpectedEof { .. }
            | SrtError::InvalidConfig(_) => ErrorCategory::NonRetryable,
            SrtError::Lookup { source, .. } => categorize_io_error(source),
            SrtError::Timeout { .. } => ErrorCategory::Timeout,
            SrtError::Cancelled { .. } => ErrorCategory::Cancelled,
            SrtError::Closed { .. } => ErrorCategory::Closed,
            SrtError::SelfConnect { .. } => ErrorCategory::retryable(Duration::from_millis(50)),
            SrtError::Io { source, .. } => categorize_io_error(source),
        }
    }

    /// 是否为超时类错误，包括引擎报告的 `TimedOut`。
    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SrtError::Cancelled { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SrtError::Closed { .. })
    }

    /// 超时与可重试错误均视为可退避重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Retryable { .. } | ErrorCategory::Timeout
        )
    }

    /// 出错前本次调用已经读出或写入的字节数。
    pub fn transferred(&self) -> u64 {
        match self {
            SrtError::Timeout { transferred, .. } | SrtError::Closed { transferred, .. } => {
                *transferred
            }
            SrtError::UnexpectedEof { read } => *read as u64,
            _ => 0,
        }
    }

    /// 为被打断的读写补记已完成的字节数；其他变体原样返回。
    pub(crate) fn with_transferred(mut self, count: u64) -> Self {
        if let SrtError::Timeout { transferred, .. } | SrtError::Closed { transferred, .. } =
            &mut self
        {
            *transferred = count;
        }
        self
    }

    /// 若错误源自引擎，返回原始 [`io::ErrorKind`]。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SrtError::Io { source, .. } | SrtError::Lookup { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

impl From<SrtError> for io::Error {
    fn from(error: SrtError) -> Self {
        let kind = match &error {
            SrtError::UnknownNetwork(_)
            | SrtError::InvalidAddress { .. }
            | SrtError::NoSuitableAddress { .. }
            | SrtError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            SrtError::Timeout { .. } => io::ErrorKind::TimedOut,
            SrtError::Cancelled { .. } => io::ErrorKind::Interrupted,
            SrtError::Closed { .. } => io::ErrorKind::NotConnected,
            SrtError::UnexpectedEof { .. } => io::ErrorKind::UnexpectedEof,
            SrtError::SelfConnect { .. } => io::ErrorKind::ConnectionRefused,
            SrtError::Io { source, .. } | SrtError::Lookup { source, .. } => source.kind(),
        };
        io::Error::new(kind, error)
    }
}

/// 将引擎返回的 IO 错误包装为带操作与地址上下文的 [`SrtError`]。
pub(crate) fn map_io_error(op: OperationKind, addr: Option<&SrtAddr>, error: io::Error) -> SrtError {
    SrtError::Io {
        op,
        addr: addr.cloned(),
        source: Arc::new(error),
    }
}

pub(crate) fn cancelled_error(op: OperationKind) -> SrtError {
    SrtError::Cancelled { op }
}

pub(crate) fn timeout_error(op: OperationKind) -> SrtError {
    SrtError::Timeout { op, transferred: 0 }
}

pub(crate) fn closed_error(op: OperationKind, resource: &'static str) -> SrtError {
    SrtError::Closed {
        op,
        resource,
        transferred: 0,
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::retryable(Duration::from_millis(5))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => ErrorCategory::retryable(Duration::from_millis(50)),
        ErrorKind::WriteZero => ErrorCategory::retryable(Duration::from_millis(10)),
        _ => ErrorCategory::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_timeouts_are_classified_as_timeouts() {
        let error = map_io_error(DIAL, None, io::Error::from(io::ErrorKind::TimedOut));
        assert!(error.is_timeout());
        assert!(error.is_retryable());
        assert_eq!(error.code(), DIAL.code);
    }

    #[test]
    fn closed_errors_are_terminal() {
        let error = closed_error(READ, "connection");
        assert!(error.is_closed());
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "srt read: use of closed connection");
    }

    #[test]
    fn unknown_network_is_not_an_address_error() {
        let error = SrtError::UnknownNetwork("http".into());
        assert_eq!(error.code(), UNKNOWN_NETWORK_CODE);
        assert_ne!(error.code(), INVALID_ADDRESS_CODE);
        assert_eq!(error.to_string(), "unknown network http");
    }

    #[test]
    fn io_conversion_keeps_kind() {
        let error: io::Error = SrtError::UnexpectedEof { read: 2 }.into();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);

        let error: io::Error = timeout_error(WRITE).into();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn partial_progress_is_attached_to_interrupted_calls() {
        let error = timeout_error(WRITE).with_transferred(16);
        assert_eq!(error.transferred(), 16);
        assert_eq!(error.to_string(), "srt write timed out");

        let error = closed_error(READ, "connection").with_transferred(3);
        assert_eq!(error.transferred(), 3);

        let error = cancelled_error(DIAL).with_transferred(7);
        assert_eq!(error.transferred(), 0);
    }

    #[test]
    fn io_errors_render_address_context() {
        let addr = SrtAddr::new(Some([127, 0, 0, 1].into()), 9000);
        let error = map_io_error(
            DIAL,
            Some(&addr),
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(error.to_string(), "srt dial 127.0.0.1:9000: refused");
        assert_eq!(error.io_kind(), Some(io::ErrorKind::ConnectionRefused));
    }
}

/// 自定义错误类型
///
/// 连接处理流水线上的每一种失败都对应一个变体，处理器据此决定给客户端的回应
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 请求中没有 Host 头
    #[error("No Host header found in the request")]
    MissingHostHeader,

    /// Host 头中的端口无法解析
    #[error("Invalid port in Host header: {0:?}")]
    InvalidPort(String),

    /// 客户端超出流量配额
    #[error("Traffic quota exceeded for {ip}: {transferred} bytes (limit: {limit} bytes)")]
    QuotaExceeded {
        ip: IpAddr,
        transferred: u64,
        limit: u64,
    },

    /// 上游连接或 TLS 握手超时
    #[error("Connecting to {addr} timed out after {duration:?}")]
    ConnectTimeout { addr: String, duration: Duration },

    /// 上游连接失败（DNS、拒绝连接等）
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// SNI 名称无效
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    /// TLS 握手失败（包括证书校验失败）
    #[error("TLS handshake with {addr} failed: {source}")]
    TlsHandshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 请求头超过允许的大小
    #[error("Request head exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// 客户端读取超时
    #[error("Client read timed out after {0:?}")]
    ClientTimeout(Duration),

    /// 隧道转发中的 I/O 错误
    #[error("Relay I/O error: {0}")]
    RelayIo(#[source] io::Error),

    /// 持久化失败
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建连接失败错误
    pub fn connect_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建连接超时错误
    pub fn connect_timeout(addr: impl Into<String>, duration: Duration) -> Self {
        Self::ConnectTimeout {
            addr: addr.into(),
            duration,
        }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 是否为解析失败（对连接致命，不回应）
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Self::MissingHostHeader | Self::InvalidPort(_))
    }

    /// 是否为上游不可达类错误
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::ConnectFailed { .. }
                | Self::InvalidServerName(_)
                | Self::TlsHandshake { .. }
        )
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. } | Self::ClientTimeout(_))
    }
}

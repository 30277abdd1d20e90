/// 上游连接模块
///
/// 建立到目标主机的 TCP 连接，按需升级为 TLS。连接和握手都受超时限制，
/// 失败时直接返回错误，不做重试。
use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use crate::tls::load_upstream_client_config;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{rustls, TlsConnector};
use tracing::{debug, info};

/// 上游连接抽象
///
/// 统一封装明文 TCP 和 TLS 两种连接
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> UpstreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 已建立的上游连接
pub type UpstreamStream = Pin<Box<dyn UpstreamIo>>;

/// 上游拨号接口
#[async_trait]
pub trait UpstreamConnect: Send + Sync {
    /// 连接到 host:port，`use_tls` 为 true 时完成 TLS 握手后返回
    async fn connect(&self, host: &str, port: u16, use_tls: bool) -> Result<UpstreamStream>;
}

/// 默认的上游连接器
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(tls_config: Arc<rustls::ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls: TlsConnector::from(tls_config),
            connect_timeout,
        }
    }

    /// 根据配置加载根证书并创建连接器
    pub fn from_config(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let tls_config =
            load_upstream_client_config(config.ca_bundle.as_deref(), config.min_tls_version)?;
        Ok(Self::new(tls_config, config.connect_timeout()))
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    async fn dial(&self, host: &str, port: u16, addr: &str) -> Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::connect_timeout(addr, self.connect_timeout))?
            .map_err(|e| ProxyError::connect_failed(addr, e))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        Ok(stream)
    }
}

#[async_trait]
impl UpstreamConnect for UpstreamConnector {
    async fn connect(&self, host: &str, port: u16, use_tls: bool) -> Result<UpstreamStream> {
        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        let tcp_stream = self.dial(host, port, &addr).await?;
        if !use_tls {
            debug!("TCP connection established to {}", addr);
            return Ok(Box::pin(tcp_stream));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::InvalidServerName(host.to_string()))?;

        let tls_stream = timeout(self.connect_timeout, self.tls.connect(server_name, tcp_stream))
            .await
            .map_err(|_| ProxyError::connect_timeout(&addr, self.connect_timeout))?
            .map_err(|source| ProxyError::TlsHandshake {
                addr: addr.clone(),
                source,
            })?;

        info!("TLS connection established to {}", addr);
        Ok(Box::pin(tls_stream))
    }
}

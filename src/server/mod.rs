pub mod handler;
mod stats;

pub use handler::{handle_connection, ConnectionOutcome};
pub use stats::{start_stats_server, StatsSnapshot};

use crate::config::ProxyConfig;
use crate::persistence::{JsonlRecordSink, NullRecordSink, RecordSink};
use crate::quota::QuotaRegistry;
use crate::relay::RelaySettings;
use crate::stats::StatsManager;
use crate::upstream::{UpstreamConnect, UpstreamConnector};
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 关闭时等待连接结束的最长时间
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// accept 出错后的退避时间
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// 服务器依赖（用于依赖注入）
pub struct ServerDependencies {
    pub quota_registry: QuotaRegistry,
    pub stats_manager: StatsManager,
    pub connector: Arc<dyn UpstreamConnect>,
    pub record_sink: Arc<dyn RecordSink>,
}

impl ServerDependencies {
    /// 使用给定的配额表和连接器，不记录请求
    pub fn new(quota_registry: QuotaRegistry, connector: Arc<dyn UpstreamConnect>) -> Self {
        Self {
            quota_registry,
            stats_manager: StatsManager::new(),
            connector,
            record_sink: Arc::new(NullRecordSink),
        }
    }

    /// 根据配置创建默认依赖
    pub async fn from_config(config: &ProxyConfig) -> Result<Self> {
        let connector = UpstreamConnector::from_config(&config.upstream)
            .context("Failed to create upstream connector")?;
        let mut deps = Self::new(
            QuotaRegistry::new(config.quota.effective_limit_bytes()),
            Arc::new(connector),
        );

        if let Some(ref persistence) = config.persistence {
            let sink = JsonlRecordSink::open(&persistence.path)
                .await
                .with_context(|| format!("Failed to open record file {:?}", persistence.path))?;
            info!("Recording requests to {:?}", persistence.path);
            deps.record_sink = Arc::new(sink);
        }

        Ok(deps)
    }
}

/// 服务器状态管理（避免过度克隆）
pub struct ServerState {
    pub config: Arc<ProxyConfig>,
    pub quota_registry: QuotaRegistry,
    pub stats_manager: StatsManager,
    pub connector: Arc<dyn UpstreamConnect>,
    pub record_sink: Arc<dyn RecordSink>,
    pub relay_settings: RelaySettings,
}

impl ServerState {
    /// 从配置和依赖创建状态
    pub fn with_dependencies(config: ProxyConfig, deps: ServerDependencies) -> Self {
        let relay_settings = config.relay.settings();
        Self {
            config: Arc::new(config),
            quota_registry: deps.quota_registry,
            stats_manager: deps.stats_manager,
            connector: deps.connector,
            record_sink: deps.record_sink,
            relay_settings,
        }
    }
}

/// 已绑定端口、尚未开始接受连接的代理服务器
pub struct ProxyServer {
    listener: TcpListener,
    stats_listener: Option<TcpListener>,
    state: Arc<ServerState>,
}

impl ProxyServer {
    /// 绑定监听端口（以及可选的统计端口）
    pub async fn bind(config: ProxyConfig, deps: ServerDependencies) -> Result<Self> {
        let addr = resolve_bind_addr(&config.listen_addr()).await?;
        let listener = bind_listener(addr, config.backlog)
            .with_context(|| format!("Failed to bind proxy listener on {}", addr))?;

        let stats_listener = match config.stats_listen_addr() {
            Some(stats_addr) => {
                let listener = TcpListener::bind(&stats_addr)
                    .await
                    .with_context(|| format!("Failed to bind stats server on {}", stats_addr))?;
                Some(listener)
            }
            None => None,
        };

        let state = Arc::new(ServerState::with_dependencies(config, deps));
        Ok(Self {
            listener,
            stats_listener,
            state,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 统计服务器的实际地址
    pub fn stats_addr(&self) -> Option<SocketAddr> {
        self.stats_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// 接受连接直到 `shutdown` 被取消
    ///
    /// 每个连接在独立任务中处理；关闭时通知所有连接并最多等待一个宽限期。
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            listener,
            stats_listener,
            state,
        } = self;

        if let Some(stats_listener) = stats_listener {
            let stats_manager = state.stats_manager.clone();
            let quota_registry = state.quota_registry.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    start_stats_server(stats_listener, stats_manager, quota_registry, shutdown)
                        .await
                {
                    error!("Stats server error: {}", e);
                }
            });
        }

        info!(
            "Proxy listening on {} (backlog {})",
            listener.local_addr()?,
            state.config.backlog
        );

        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal, stopping proxy...");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let state = Arc::clone(&state);
                            let shutdown = shutdown.clone();
                            tracker.spawn(async move {
                                let _guard = state.stats_manager.track_connection();
                                match handle_connection(stream, peer, Arc::clone(&state), shutdown).await {
                                    Ok(outcome) => debug!("Connection from {} finished: {:?}", peer, outcome),
                                    Err(e) => warn!("Connection from {} aborted: {}", peer, e),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        drop(listener);
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connections still active after {:?}, exiting anyway",
                tracker.len(),
                SHUTDOWN_GRACE_PERIOD
            );
        }

        info!("Proxy stopped gracefully");
        Ok(())
    }
}

/// 运行代理服务器直到收到 Ctrl+C
pub async fn run_server(config: ProxyConfig) -> Result<()> {
    let deps = ServerDependencies::from_config(&config).await?;
    let server = ProxyServer::bind(config, deps).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_token.cancel(),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    info!("Waiting for client connections... (Press Ctrl+C to stop)");
    server.run(shutdown).await
}

async fn resolve_bind_addr(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Failed to resolve bind address {}", addr))?
        .next()
        .with_context(|| format!("Bind address {} resolved to nothing", addr))
}

/// 创建指定 backlog 的监听 socket
fn bind_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    TcpListener::from_std(socket.into())
}

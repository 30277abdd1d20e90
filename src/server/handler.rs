/// 单个客户端连接的处理流程
///
/// 读取请求 → 配额检查 → 解析目标 → 连接上游 → 转发或建立隧道 → 关闭。
/// 所有失败都在这里处理，不会传播到接受循环。
use super::ServerState;
use crate::error::{ProxyError, Result};
use crate::forwarder::{forward, forward_body, should_forward_body};
use crate::persistence::{RequestRecord, ResponseRecord};
use crate::relay::relay;
use crate::request::{self, find_header_end, TargetAddress};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 配额超限时的回应
pub const RESPONSE_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";

/// 隧道建立后的回应
pub const RESPONSE_CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// 每次从客户端读取的字节数
const CLIENT_READ_CHUNK: usize = 8192;

/// 连接的最终结果
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// 客户端没有发送任何数据就关闭了
    Empty,
    /// 配额超限，已回应 403
    Rejected(ProxyError),
    /// 无法得到目标地址，直接关闭
    ParseFailed(ProxyError),
    /// 上游不可达，直接关闭
    ConnectFailed(ProxyError),
    /// 普通请求已转发
    Forwarded { response_bytes: u64 },
    /// 隧道已结束
    Tunneled { bytes_up: u64, bytes_down: u64 },
    /// 服务器关闭
    Cancelled,
}

/// 读取阶段的结果
enum ReadResult {
    Complete(Vec<u8>),
    Empty,
    Rejected(ProxyError),
    Cancelled,
}

/// 处理一个客户端连接
pub async fn handle_connection<S>(
    mut client: S,
    peer: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<ConnectionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client_ip = peer.ip();

    let request = match read_request(&mut client, client_ip, &state, &shutdown).await? {
        ReadResult::Complete(request) => request,
        ReadResult::Empty => {
            debug!("Client {} closed without sending data", peer);
            return Ok(ConnectionOutcome::Empty);
        }
        ReadResult::Rejected(e) => {
            warn!("Rejecting {}: {}", peer, e);
            state.stats_manager.record_rejected();
            // 客户端可能已经关闭，写失败不影响结果
            let _ = client.write_all(RESPONSE_FORBIDDEN).await;
            let _ = client.shutdown().await;
            return Ok(ConnectionOutcome::Rejected(e));
        }
        ReadResult::Cancelled => return Ok(ConnectionOutcome::Cancelled),
    };

    let target = match request::parse_target(&request) {
        Ok(target) => target,
        Err(e) => {
            warn!("Failed to parse request from {}: {}", peer, e);
            state.stats_manager.record_parse_failure();
            return Ok(ConnectionOutcome::ParseFailed(e));
        }
    };

    let method = request::method(&request).unwrap_or("UNKNOWN").to_string();
    info!("{} {} {}", peer, method, target);

    let request_id = save_request(
        &state,
        &RequestRecord::new(client_ip, &method, &target.host, target.port, &request),
    )
    .await;

    let use_tls = target.is_tunnel && state.config.upstream.tunnel_tls;
    let connect = state.connector.connect(&target.host, target.port, use_tls);
    let mut upstream = tokio::select! {
        _ = shutdown.cancelled() => return Ok(ConnectionOutcome::Cancelled),
        result = connect => match result {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Failed to connect to {} for {}: {}", target, peer, e);
                state.stats_manager.record_connect_failure();
                let _ = client.shutdown().await;
                return Ok(ConnectionOutcome::ConnectFailed(e));
            }
        },
    };

    if target.is_tunnel {
        return run_tunnel(client, upstream, &request, &target, client_ip, request_id, &state, shutdown)
            .await;
    }

    // 普通请求
    let max_head_size = state.config.client.max_header_size;
    let response_timeout = state.config.upstream.response_timeout();
    let head = forward(&mut upstream, &request, max_head_size, response_timeout)
        .await
        .map_err(ProxyError::RelayIo)?;
    state.stats_manager.add_bytes_up(request.len() as u64);

    client.write_all(&head.head).await?;
    let mut response_bytes = head.head.len() as u64;

    if should_forward_body(state.config.response_mode) {
        match forward_body(
            &mut upstream,
            &mut client,
            &head,
            &method,
            state.config.relay.settings().idle_timeout,
        )
        .await
        {
            Ok(n) => response_bytes += n,
            Err(e) => debug!("Response body from {} ended early: {}", target, e),
        }
    }

    client.flush().await?;
    let _ = client.shutdown().await;
    state.stats_manager.add_bytes_down(response_bytes);
    state.stats_manager.record_forwarded();

    save_response(
        &state,
        &ResponseRecord::response(request_id, client_ip, &head.head),
    )
    .await;

    debug!(
        "Forwarded {} -> {} ({} response bytes)",
        peer, target, response_bytes
    );
    Ok(ConnectionOutcome::Forwarded { response_bytes })
}

/// 读取请求直到请求头结束或客户端关闭
///
/// 每个数据块在接受之前先经过配额检查
async fn read_request<S>(
    client: &mut S,
    client_ip: IpAddr,
    state: &ServerState,
    shutdown: &CancellationToken,
) -> Result<ReadResult>
where
    S: AsyncRead + Unpin,
{
    let read_timeout = state.config.client.read_timeout();
    let max_header_size = state.config.client.max_header_size;

    let mut request = Vec::new();
    let mut chunk = vec![0u8; CLIENT_READ_CHUNK];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => return Ok(ReadResult::Cancelled),
            result = timeout(read_timeout, client.read(&mut chunk)) => match result {
                Ok(result) => result?,
                Err(_) => return Err(ProxyError::ClientTimeout(read_timeout)),
            },
        };

        if n == 0 {
            if request.is_empty() {
                return Ok(ReadResult::Empty);
            }
            // 没有结束标记，按已读到的内容处理
            return Ok(ReadResult::Complete(request));
        }

        if state.quota_registry.check(client_ip, n as u64).is_exceeded() {
            let quota = state.quota_registry.quota_for(client_ip);
            return Ok(ReadResult::Rejected(ProxyError::QuotaExceeded {
                ip: client_ip,
                transferred: quota.transferred_bytes(),
                limit: quota.limit_bytes(),
            }));
        }

        let search_from = request
            .len()
            .saturating_sub(request::HEADER_TERMINATOR.len() - 1);
        request.extend_from_slice(&chunk[..n]);

        if find_header_end(&request[search_from..]).is_some() {
            return Ok(ReadResult::Complete(request));
        }
        if request.len() > max_header_size {
            return Err(ProxyError::RequestTooLarge {
                limit: max_header_size,
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_tunnel<S>(
    mut client: S,
    mut upstream: crate::upstream::UpstreamStream,
    request: &[u8],
    target: &TargetAddress,
    client_ip: IpAddr,
    request_id: Option<u64>,
    state: &ServerState,
    shutdown: CancellationToken,
) -> Result<ConnectionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    client.write_all(RESPONSE_CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    state.stats_manager.record_tunnel_opened();

    // 请求头之后已经读到的数据属于隧道
    let mut early_bytes = 0u64;
    if let Some(end) = find_header_end(request) {
        let pending = &request[end..];
        if !pending.is_empty() {
            upstream.write_all(pending).await.map_err(ProxyError::RelayIo)?;
            early_bytes = pending.len() as u64;
        }
    }

    let outcome = relay(client, upstream, &state.relay_settings, shutdown).await?;
    let bytes_up = outcome.bytes_up + early_bytes;
    let bytes_down = outcome.bytes_down;

    state.stats_manager.add_bytes_up(bytes_up);
    state.stats_manager.add_bytes_down(bytes_down);

    match outcome.error {
        Some(e) => debug!("Tunnel to {} closed with error: {}", target, e),
        None => debug!("Tunnel to {} closed", target),
    }
    info!(
        "Tunnel {} -> {} finished: {} bytes up, {} bytes down",
        client_ip, target, bytes_up, bytes_down
    );

    save_response(
        state,
        &ResponseRecord::tunnel_close(request_id, client_ip, bytes_up, bytes_down),
    )
    .await;

    Ok(ConnectionOutcome::Tunneled {
        bytes_up,
        bytes_down,
    })
}

/// 保存请求记录，失败时只记录日志
async fn save_request(state: &ServerState, record: &RequestRecord) -> Option<u64> {
    match state.record_sink.save_request(record).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Failed to save request record: {}", e);
            None
        }
    }
}

async fn save_response(state: &ServerState, record: &ResponseRecord) {
    if let Err(e) = state.record_sink.save_response(record).await {
        warn!("Failed to save response record: {}", e);
    }
}

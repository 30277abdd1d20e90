/// 隧道数据转发
///
/// 两个方向各自独立限速。任一方向读到 EOF 或出错都会结束整个隧道：
/// 该方向关闭目标端的写半部，并取消另一方向，后者在下一个挂起点退出。
/// 因此半关闭之后对端不会再收到任何数据。
use crate::error::Result;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 连接空闲超时时间（防止资源泄漏）
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 隧道参数
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// 每个方向的速率上限
    pub rate: RateLimiterConfig,
    /// 单个方向读取的空闲超时
    pub idle_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            rate: RateLimiterConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// 隧道结束后的统计
#[derive(Debug, Default)]
pub struct RelayOutcome {
    /// 客户端 → 上游
    pub bytes_up: u64,
    /// 上游 → 客户端
    pub bytes_down: u64,
    /// 第一个出错方向的错误
    pub error: Option<io::Error>,
}

/// 单个方向的结果
struct PumpResult {
    bytes: u64,
    error: Option<io::Error>,
}

/// 在客户端和上游之间双向转发，直到任一方向结束
///
/// 两个连接的所有权都会移入，返回时两端均已释放。
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    settings: &RelaySettings,
    shutdown: CancellationToken,
) -> Result<RelayOutcome>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let up_limiter = RateLimiter::new(settings.rate.clone())?;
    let down_limiter = RateLimiter::new(settings.rate.clone())?;

    // 任一方向结束时取消，服务器关闭时也会被取消
    let session = shutdown.child_token();

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let result = pump(
            "client->upstream",
            &mut client_read,
            &mut upstream_write,
            &up_limiter,
            settings.idle_timeout,
            &session,
        )
        .await;
        session.cancel();
        result
    };

    let upstream_to_client = async {
        let result = pump(
            "upstream->client",
            &mut upstream_read,
            &mut client_write,
            &down_limiter,
            settings.idle_timeout,
            &session,
        )
        .await;
        session.cancel();
        result
    };

    // 使用 join! 确保两个方向都结束后才返回
    let (up, down) = tokio::join!(client_to_upstream, upstream_to_client);

    Ok(RelayOutcome {
        bytes_up: up.bytes,
        bytes_down: down.bytes,
        error: up.error.or(down.error),
    })
}

/// 单方向转发：每次最多读取 `chunk_size` 字节，取得令牌后写出
async fn pump<R, W>(
    direction: &'static str,
    reader: &mut R,
    writer: &mut W,
    limiter: &RateLimiter,
    idle_timeout: Duration,
    session: &CancellationToken,
) -> PumpResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; limiter.chunk_size()];
    let mut total = 0u64;

    let error = loop {
        let n = tokio::select! {
            _ = session.cancelled() => break None,
            result = timeout(idle_timeout, reader.read(&mut buf)) => match result {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => break Some(e),
                Err(_) => {
                    break Some(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "Connection idle timeout",
                    ))
                }
            },
        };

        if n == 0 {
            debug!("Relay {}: EOF after {} bytes", direction, total);
            break None;
        }

        tokio::select! {
            _ = session.cancelled() => break None,
            _ = limiter.acquire(n) => {}
        }

        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Some(e);
        }
        total += n as u64;
    };

    if let Some(ref e) = error {
        warn!("Relay {} error after {} bytes: {}", direction, total, e);
    }

    // 把 EOF 传递给对端
    let _ = writer.shutdown().await;

    PumpResult {
        bytes: total,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::duplex;

    fn settings(bytes_per_second: u32) -> RelaySettings {
        RelaySettings {
            rate: RateLimiterConfig::new(bytes_per_second, Duration::from_millis(100)),
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_relay_delivers_in_order_and_terminates() {
        let (client_proxy_side, mut client) = duplex(1024);
        let (upstream_proxy_side, mut upstream) = duplex(1024);

        let relay_task = tokio::spawn(async move {
            relay(
                client_proxy_side,
                upstream_proxy_side,
                &settings(1024 * 1024),
                CancellationToken::new(),
            )
            .await
        });

        client.write_all(b"b1").await.unwrap();
        client.write_all(b"b2").await.unwrap();
        client.write_all(b"b3").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"b1b2b3");

        let outcome = relay_task.await.unwrap().unwrap();
        assert_eq!(outcome.bytes_up, 6);
        assert_eq!(outcome.bytes_down, 0);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (client_proxy_side, mut client) = duplex(1024);
        let (upstream_proxy_side, mut upstream) = duplex(1024);

        let relay_task = tokio::spawn(async move {
            relay(
                client_proxy_side,
                upstream_proxy_side,
                &settings(1024 * 1024),
                CancellationToken::new(),
            )
            .await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(upstream);
        let outcome = relay_task.await.unwrap().unwrap();
        assert_eq!(outcome.bytes_up, 4);
        assert_eq!(outcome.bytes_down, 4);
    }

    #[tokio::test]
    async fn test_half_close_ends_whole_tunnel() {
        let (client_proxy_side, mut client) = duplex(1024);
        let (upstream_proxy_side, mut upstream) = duplex(1024);

        let relay_task = tokio::spawn(async move {
            relay(
                client_proxy_side,
                upstream_proxy_side,
                &settings(1024 * 1024),
                CancellationToken::new(),
            )
            .await
        });

        client.write_all(b"req").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"req");

        // 客户端半关闭后隧道已经结束，迟到的回复不会送达
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = upstream.write_all(b"reply").await;

        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());

        let outcome = relay_task.await.unwrap().unwrap();
        assert_eq!(outcome.bytes_up, 3);
        assert_eq!(outcome.bytes_down, 0);
    }

    #[tokio::test]
    async fn test_relay_rate_ceiling() {
        let (client_proxy_side, mut client) = duplex(64 * 1024);
        let (upstream_proxy_side, mut upstream) = duplex(64 * 1024);

        let relay_task = tokio::spawn(async move {
            relay(
                client_proxy_side,
                upstream_proxy_side,
                &settings(10_000),
                CancellationToken::new(),
            )
            .await
        });

        // 数据源不限速
        let writer = tokio::spawn(async move {
            let chunk = [0x5au8; 4096];
            while client.write_all(&chunk).await.is_ok() {}
        });

        let window = Duration::from_millis(500);
        let start = Instant::now();
        let mut received = 0usize;
        let mut buf = [0u8; 4096];
        while start.elapsed() < window {
            match timeout(window.saturating_sub(start.elapsed()), upstream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => received += n,
            }
        }

        // C * W = 5000，允许一个时间片（1000 字节）的突发和少量调度误差
        assert!(received <= 5_000 + 1_000 + 500, "received {} bytes", received);
        assert!(received >= 1_000, "received {} bytes", received);

        writer.abort();
        drop(upstream);
        let _ = relay_task.await;
    }

    #[tokio::test]
    async fn test_relay_stops_on_shutdown() {
        let (client_proxy_side, _client) = duplex(1024);
        let (upstream_proxy_side, _upstream) = duplex(1024);
        let shutdown = CancellationToken::new();

        let relay_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                relay(
                    client_proxy_side,
                    upstream_proxy_side,
                    &settings(1024),
                    shutdown,
                )
                .await
            }
        });

        shutdown.cancel();
        let outcome = timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("relay should stop after shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(outcome.bytes_up + outcome.bytes_down, 0);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (client_proxy_side, _client) = duplex(1024);
        let (upstream_proxy_side, _upstream) = duplex(1024);

        let settings = RelaySettings {
            rate: RateLimiterConfig::new(1024, Duration::from_millis(100)),
            idle_timeout: Duration::from_millis(100),
        };

        let outcome = timeout(
            Duration::from_secs(2),
            relay(
                client_proxy_side,
                upstream_proxy_side,
                &settings,
                CancellationToken::new(),
            ),
        )
        .await
        .unwrap()
        .unwrap();

        let err = outcome.error.expect("idle relay should report a timeout");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}

use crate::quota::{QuotaRegistry, QuotaUsage};
use crate::stats::{ProxyStats, StatsManager};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// `/stats` 返回的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub proxy: ProxyStats,
    pub quotas: Vec<QuotaUsage>,
}

/// 启动统计数据 HTTP 服务器
pub async fn start_stats_server(
    listener: TcpListener,
    stats_manager: StatsManager,
    quota_registry: QuotaRegistry,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Stats server listening on http://{}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((mut stream, addr)) => {
                    let stats_manager = stats_manager.clone();
                    let quota_registry = quota_registry.clone();

                    tokio::spawn(async move {
                        handle_stats_request(&mut stream, addr, &stats_manager, &quota_registry)
                            .await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept stats connection: {}", e);
                }
            },
        }
    }

    Ok(())
}

/// 处理单个统计请求
async fn handle_stats_request(
    stream: &mut TcpStream,
    addr: SocketAddr,
    stats_manager: &StatsManager,
    quota_registry: &QuotaRegistry,
) {
    let mut buffer = vec![0u8; 4096];
    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to read from stats client {}: {}", addr, e);
            return;
        }
    };

    // 解析HTTP请求
    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = if path == "/stats" || path == "/stats/" {
        let snapshot = StatsSnapshot {
            proxy: stats_manager.get_stats(),
            quotas: quota_registry.usage(),
        };
        let json = serde_json::to_string_pretty(&snapshot).unwrap_or_default();

        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            json.len(),
            json
        )
    } else {
        let body = "404 Not Found";
        format!(
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response to {}: {}", addr, e);
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fetch(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stats_manager = StatsManager::new();
        stats_manager.record_rejected();
        let quota_registry = QuotaRegistry::new(100);
        quota_registry.check("10.0.0.1".parse().unwrap(), 42);

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(start_stats_server(
            listener,
            stats_manager,
            quota_registry,
            shutdown.clone(),
        ));

        let response = fetch(addr, "/stats").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let snapshot: StatsSnapshot = serde_json::from_str(body).unwrap();
        assert_eq!(snapshot.proxy.rejected_requests, 1);
        assert_eq!(snapshot.quotas.len(), 1);
        assert_eq!(snapshot.quotas[0].transferred_bytes, 42);
        assert_eq!(snapshot.quotas[0].limit_bytes, 100);

        let response = fetch(addr, "/other").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}

//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use quota_proxy::error::Result as ProxyResult;
use quota_proxy::upstream::{UpstreamConnect, UpstreamStream};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

/// Create a unique temporary file path
pub fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "{}-{}-{}-{}.{}",
        prefix,
        timestamp,
        counter,
        std::process::id(),
        extension
    ))
}

/// Self-signed certificate for "localhost" plus a PEM file containing it
pub struct TestCert {
    pub cert_der: rustls::pki_types::CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub ca_path: PathBuf,
}

impl TestCert {
    pub fn generate() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .expect("Failed to generate test certificate");

        let ca_path = temp_path("test-ca", "pem");
        std::fs::write(&ca_path, certified.cert.pem()).expect("Failed to write CA bundle");

        Self {
            cert_der: certified.cert.der().clone(),
            key_der: certified.signing_key.serialize_der(),
            ca_path,
        }
    }

    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
            rustls::pki_types::PrivatePkcs8KeyDer::from(self.key_der.clone()),
        );
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], key)
            .expect("Failed to build server config");
        Arc::new(config)
    }
}

impl Drop for TestCert {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.ca_path);
    }
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// TLS echo server using the given certificate
pub async fn start_tls_echo_server(cert: &TestCert) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind TLS echo server");
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(cert.server_config());

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(socket).await else {
                    return;
                };
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// HTTP server that answers every request with a fixed response and counts connections
pub async fn start_http_server(response: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind HTTP server");
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = vec![0u8; 4096];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, accepted)
}

/// Server that accepts TCP connections and never sends anything
pub async fn start_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind silent server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    addr
}

/// Port on which nothing is listening
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Connector that sends every connection to a fixed local address, keeping the
/// requested host for TLS. Records each (host, port, use_tls) it was asked for.
pub struct RedirectConnector<C> {
    inner: C,
    port: u16,
    pub calls: Mutex<Vec<(String, u16, bool)>>,
}

impl<C> RedirectConnector<C> {
    pub fn new(inner: C, port: u16) -> Arc<Self> {
        Arc::new(Self {
            inner,
            port,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, u16, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl<C: UpstreamConnect> UpstreamConnect for RedirectConnector<C> {
    async fn connect(&self, host: &str, port: u16, use_tls: bool) -> ProxyResult<UpstreamStream> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), port, use_tls));
        self.inner.connect(host, self.port, use_tls).await
    }
}

/// Plain TCP dialer to 127.0.0.1 that ignores the TLS flag
pub struct LoopbackConnector;

#[async_trait]
impl UpstreamConnect for LoopbackConnector {
    async fn connect(&self, _host: &str, port: u16, _use_tls: bool) -> ProxyResult<UpstreamStream> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        Ok(Box::pin(stream))
    }
}

/// Send raw bytes to the proxy and read until it closes the connection
pub async fn send_and_read_all(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.expect("connect to proxy");
    stream.write_all(request).await.expect("write request");
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .expect("read response");
    response
}

/// Poll `condition` until it holds or the timeout elapses
pub async fn wait_until<F: Fn() -> bool>(condition: F, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::tls::MinTlsVersion;

use super::{
    validator::ConfigValidator, ClientLimitConfig, PersistenceConfig, ProxyConfig, QuotaConfig,
    RelayConfig, ResponseMode, UpstreamConfig,
};

/// ProxyConfig Builder
///
/// 未设置的字段使用与配置文件相同的默认值
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    bind_addr: Option<String>,
    bind_port: Option<u16>,
    backlog: Option<u32>,
    response_mode: Option<ResponseMode>,
    stats_port: Option<u16>,
    stats_addr: Option<String>,
    quota: QuotaConfig,
    upstream: UpstreamConfig,
    relay: RelayConfig,
    client: ClientLimitConfig,
    persistence_path: Option<PathBuf>,
}

impl ProxyConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置绑定地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    /// 设置绑定端口（0 表示由系统分配）
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = Some(mode);
        self
    }

    /// 设置统计端口
    pub fn stats_port(mut self, port: u16) -> Self {
        self.stats_port = Some(port);
        self
    }

    /// 设置统计地址
    pub fn stats_addr(mut self, addr: impl Into<String>) -> Self {
        self.stats_addr = Some(addr.into());
        self
    }

    /// 以 MB 设置配额
    pub fn quota_limit_mb(mut self, limit_mb: u64) -> Self {
        self.quota.limit_mb = limit_mb;
        self.quota.limit_bytes = None;
        self
    }

    /// 以字节设置配额
    pub fn quota_limit_bytes(mut self, limit_bytes: u64) -> Self {
        self.quota.limit_bytes = Some(limit_bytes);
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.upstream.connect_timeout_secs = secs;
        self
    }

    pub fn response_timeout_secs(mut self, secs: u64) -> Self {
        self.upstream.response_timeout_secs = secs;
        self
    }

    /// 隧道是否与目标建立 TLS
    pub fn tunnel_tls(mut self, enabled: bool) -> Self {
        self.upstream.tunnel_tls = enabled;
        self
    }

    pub fn min_tls_version(mut self, version: MinTlsVersion) -> Self {
        self.upstream.min_tls_version = version;
        self
    }

    /// 设置 CA 证书包路径
    pub fn ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.upstream.ca_bundle = Some(path.into());
        self
    }

    /// 设置隧道速率
    pub fn relay_rate(mut self, bytes_per_second: u32, slice_millis: u64) -> Self {
        self.relay.bytes_per_second = bytes_per_second;
        self.relay.slice_millis = slice_millis;
        self
    }

    pub fn relay_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.relay.idle_timeout_secs = secs;
        self
    }

    pub fn client_read_timeout_secs(mut self, secs: u64) -> Self {
        self.client.read_timeout_secs = secs;
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.client.max_header_size = size;
        self
    }

    /// 启用请求/响应记录
    pub fn persistence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = Some(path.into());
        self
    }

    /// 构建 ProxyConfig 并验证
    pub fn build(self) -> Result<ProxyConfig> {
        let config = ProxyConfig {
            bind_addr: self.bind_addr.unwrap_or_else(super::default_bind_addr),
            bind_port: self.bind_port.context("bind_port is required")?,
            backlog: self.backlog.unwrap_or_else(super::default_backlog),
            response_mode: self.response_mode.unwrap_or_default(),
            stats_port: self.stats_port,
            stats_addr: self.stats_addr,
            quota: self.quota,
            upstream: self.upstream,
            relay: self.relay,
            client: self.client,
            persistence: self.persistence_path.map(|path| PersistenceConfig { path }),
        };

        // 验证配置
        ConfigValidator::validate_proxy_config(&config)?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_port() {
        assert!(ProxyConfigBuilder::new().build().is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = ProxyConfigBuilder::new()
            .bind_addr("127.0.0.1")
            .bind_port(0)
            .quota_limit_bytes(10)
            .tunnel_tls(false)
            .relay_rate(10_000, 100)
            .response_mode(ResponseMode::Full)
            .persistence_path("/tmp/records.jsonl")
            .build()
            .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.quota.effective_limit_bytes(), 10);
        assert!(!config.upstream.tunnel_tls);
        assert_eq!(config.relay.settings().rate.burst_bytes(), 1_000);
        assert_eq!(config.response_mode, ResponseMode::Full);
        assert!(config.persistence.is_some());
    }

    #[test]
    fn test_builder_validates() {
        let result = ProxyConfigBuilder::new()
            .bind_port(8080)
            .relay_rate(0, 100)
            .build();
        assert!(result.is_err());
    }
}

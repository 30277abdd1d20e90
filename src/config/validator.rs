use anyhow::{bail, Result};
use tracing::warn;

use super::{ClientLimitConfig, ProxyConfig, QuotaConfig, RelayConfig, UpstreamConfig};

/// 最小的合法请求头 `"GET / HTTP/1.0\r\n\r\n"` 的长度
const MIN_HEADER_SIZE: usize = 18;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证超时不为 0
    pub fn validate_timeout(secs: u64, context: &str) -> Result<()> {
        if secs == 0 {
            bail!("{} must be greater than 0", context);
        }
        Ok(())
    }

    /// 验证代理配置
    pub fn validate_proxy_config(config: &ProxyConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "Proxy bind_addr")?;

        if config.backlog == 0 {
            bail!("backlog must be greater than 0");
        }

        // 验证统计服务器地址（如果配置了）
        if let Some(ref addr) = config.stats_addr {
            Self::validate_address(addr, "Proxy stats_addr")?;
        }
        if config.bind_port != 0 && config.stats_port == Some(config.bind_port) {
            bail!(
                "stats_port ({}) cannot be the same as bind_port",
                config.bind_port
            );
        }

        Self::validate_quota_config(&config.quota)?;
        Self::validate_upstream_config(&config.upstream)?;
        Self::validate_relay_config(&config.relay)?;
        Self::validate_client_limit_config(&config.client)?;

        if let Some(ref persistence) = config.persistence {
            if persistence.path.as_os_str().is_empty() {
                bail!("persistence.path cannot be empty");
            }
        }

        Ok(())
    }

    /// 验证配额配置
    pub fn validate_quota_config(config: &QuotaConfig) -> Result<()> {
        if config.effective_limit_bytes() == 0 {
            warn!("quota limit is 0 bytes, every request will be rejected");
        }
        Ok(())
    }

    /// 验证上游配置
    pub fn validate_upstream_config(config: &UpstreamConfig) -> Result<()> {
        Self::validate_timeout(config.connect_timeout_secs, "upstream.connect_timeout_secs")?;
        Self::validate_timeout(
            config.response_timeout_secs,
            "upstream.response_timeout_secs",
        )?;
        if let Some(ref ca_bundle) = config.ca_bundle {
            if ca_bundle.as_os_str().is_empty() {
                bail!("upstream.ca_bundle cannot be empty");
            }
        }
        if !config.tunnel_tls {
            warn!("upstream.tunnel_tls is disabled, tunnels will relay raw TCP");
        }
        Ok(())
    }

    /// 验证隧道转发配置
    pub fn validate_relay_config(config: &RelayConfig) -> Result<()> {
        if config.bytes_per_second == 0 {
            bail!("relay.bytes_per_second must be greater than 0");
        }
        if config.slice_millis == 0 {
            bail!("relay.slice_millis must be greater than 0");
        }
        if config.slice_millis > 1000 {
            warn!(
                "relay.slice_millis ({}) is longer than one second, tunnels will be bursty",
                config.slice_millis
            );
        }
        Self::validate_timeout(config.idle_timeout_secs, "relay.idle_timeout_secs")?;
        Ok(())
    }

    /// 验证客户端请求限制
    pub fn validate_client_limit_config(config: &ClientLimitConfig) -> Result<()> {
        Self::validate_timeout(config.read_timeout_secs, "client.read_timeout_secs")?;
        if config.max_header_size < MIN_HEADER_SIZE {
            bail!(
                "client.max_header_size must be at least {} bytes (current: {})",
                MIN_HEADER_SIZE,
                config.max_header_size
            );
        }
        // 建议值检查
        if config.max_header_size > 1024 * 1024 {
            warn!(
                "client.max_header_size is very large ({} bytes), \
                 this may lead to memory exhaustion",
                config.max_header_size
            );
        }
        Ok(())
    }
}

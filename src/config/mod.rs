// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

pub use builder::ProxyConfigBuilder;
pub use validator::ConfigValidator;

use crate::rate_limiter::RateLimiterConfig;
use crate::relay::RelaySettings;
use crate::tls::MinTlsVersion;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 普通请求的响应转发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// 只转发响应头
    #[default]
    Head,
    /// 转发响应头和响应体
    Full,
}

/// 流量配额配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// 每个源 IP 的流量上限（MB）
    #[serde(default = "default_limit_mb")]
    pub limit_mb: u64,
    /// 精确的字节上限，设置后优先于 limit_mb
    #[serde(default)]
    pub limit_bytes: Option<u64>,
}

impl QuotaConfig {
    /// 实际生效的字节上限
    pub fn effective_limit_bytes(&self) -> u64 {
        self.limit_bytes
            .unwrap_or_else(|| self.limit_mb.saturating_mul(1024 * 1024))
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit_mb: default_limit_mb(),
            limit_bytes: None,
        }
    }
}

/// 上游连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// TCP 连接和 TLS 握手的超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 读取上游响应头的超时（秒）
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    /// 隧道模式下是否与目标主机建立 TLS
    #[serde(default = "default_true")]
    pub tunnel_tls: bool,
    /// TLS 最低版本
    #[serde(default)]
    pub min_tls_version: MinTlsVersion,
    /// 受信任的 CA 证书包（可选，默认使用系统证书库）
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            tunnel_tls: true,
            min_tls_version: MinTlsVersion::default(),
            ca_bundle: None,
        }
    }
}

/// 隧道转发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 每个方向每秒允许的字节数
    #[serde(default = "default_bytes_per_second")]
    pub bytes_per_second: u32,
    /// 时间片长度（毫秒）
    #[serde(default = "default_slice_millis")]
    pub slice_millis: u64,
    /// 空闲超时（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl RelayConfig {
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            rate: RateLimiterConfig::new(
                self.bytes_per_second,
                Duration::from_millis(self.slice_millis),
            ),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: default_bytes_per_second(),
            slice_millis: default_slice_millis(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// 客户端请求读取限制
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientLimitConfig {
    /// 读取请求的超时（秒）
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 最大请求头大小（字节）
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

impl ClientLimitConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for ClientLimitConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout_secs(),
            max_header_size: default_max_header_size(),
        }
    }
}

/// 请求/响应记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON Lines 文件路径
    pub path: PathBuf,
}

/// 代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口
    pub bind_port: u16,
    /// 监听队列长度
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub response_mode: ResponseMode,
    /// 统计信息 HTTP 服务器端口（可选）
    #[serde(default)]
    pub stats_port: Option<u16>,
    /// 统计信息服务器绑定地址（可选，默认使用 bind_addr）
    #[serde(default)]
    pub stats_addr: Option<String>,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub client: ClientLimitConfig,
    #[serde(default)]
    pub persistence: Option<PersistenceConfig>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    200
}

fn default_limit_mb() -> u64 {
    100
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_response_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_bytes_per_second() -> u32 {
    1024 * 1024
}

fn default_slice_millis() -> u64 {
    100
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    64 * 1024
}

impl ProxyConfig {
    /// 创建 Builder
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_proxy_config(self)
    }

    /// 监听地址字符串
    pub fn listen_addr(&self) -> String {
        if self.bind_addr.contains(':') {
            format!("[{}]:{}", self.bind_addr, self.bind_port)
        } else {
            format!("{}:{}", self.bind_addr, self.bind_port)
        }
    }

    /// 统计服务器地址（未配置端口时为 None）
    pub fn stats_listen_addr(&self) -> Option<String> {
        let port = self.stats_port?;
        let addr = self.stats_addr.as_deref().unwrap_or(&self.bind_addr);
        Some(if addr.contains(':') {
            format!("[{}]:{}", addr, port)
        } else {
            format!("{}:{}", addr, port)
        })
    }

    /// 从 TOML 文本解析（需要 `[proxy]` 表）
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct ProxyConfigWrapper {
            proxy: ProxyConfig,
        }

        let wrapper: ProxyConfigWrapper =
            toml::from_str(content).context("Failed to parse proxy configuration")?;
        wrapper
            .proxy
            .validate()
            .context("Proxy configuration validation failed")?;
        Ok(wrapper.proxy)
    }

    /// 从文件加载配置
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml_str(&content)
    }
}

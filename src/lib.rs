/// quota-proxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod persistence;
pub mod quota;
pub mod rate_limiter;
pub mod relay;
pub mod request;
pub mod server;
pub mod stats;
pub mod tls;
pub mod upstream;

// 重新导出常用类型
pub use config::{ProxyConfig, ResponseMode};
pub use error::{ProxyError, Result};
pub use quota::{QuotaDecision, QuotaRegistry};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use request::{parse_target, TargetAddress};
pub use server::{run_server, ProxyServer, ServerDependencies, ServerState};
pub use upstream::{UpstreamConnect, UpstreamConnector, UpstreamStream};

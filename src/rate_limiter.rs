/// 速率限制器模块
///
/// 使用 token bucket 算法限制隧道每个方向的字节速率。
/// 令牌以 `bytes_per_second` 的速率补充，桶容量为一个时间片内允许的字节数。
use crate::error::{ProxyError, Result};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// 默认时间片
pub const DEFAULT_SLICE: Duration = Duration::from_millis(100);

/// 单次读取的上限，与桶容量无关
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// 速率限制器配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// 每秒允许的字节数
    pub bytes_per_second: u32,
    /// 时间片长度，决定突发容量
    pub slice: Duration,
}

impl RateLimiterConfig {
    pub fn new(bytes_per_second: u32, slice: Duration) -> Self {
        Self {
            bytes_per_second,
            slice,
        }
    }

    /// 一个时间片内允许的字节数（至少为 1）
    pub fn burst_bytes(&self) -> u32 {
        let burst = u128::from(self.bytes_per_second) * self.slice.as_millis() / 1000;
        burst.clamp(1, u128::from(u32::MAX)) as u32
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: 1024 * 1024, // 1 MiB/s
            slice: DEFAULT_SLICE,
        }
    }
}

/// 字节速率限制器
pub struct RateLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: RateLimiterConfig,
    burst: NonZeroU32,
}

impl RateLimiter {
    /// 创建新的速率限制器
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        let rate = NonZeroU32::new(config.bytes_per_second)
            .ok_or_else(|| ProxyError::config_error("bytes_per_second must be > 0"))?;
        let burst = NonZeroU32::new(config.burst_bytes())
            .ok_or_else(|| ProxyError::config_error("burst size must be > 0"))?;

        let quota = Quota::per_second(rate).allow_burst(burst);

        Ok(Self {
            inner: Arc::new(GovernorLimiter::direct(quota)),
            config,
            burst,
        })
    }

    /// 单次读取的最大字节数：桶容量，但不超过 `MAX_CHUNK_SIZE`
    pub fn chunk_size(&self) -> usize {
        (self.burst.get() as usize).min(MAX_CHUNK_SIZE)
    }

    /// 尝试获取 `bytes` 个令牌（非阻塞）
    /// 返回 Err(Duration) 表示需要等待的时间
    pub fn check(&self, bytes: NonZeroU32) -> std::result::Result<(), Duration> {
        match self.inner.check_n(bytes) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(not_until)) => Err(not_until.wait_time_from(DefaultClock::default().now())),
            // 超过桶容量的请求永远无法满足，按一个时间片处理
            Err(_) => Err(self.config.slice),
        }
    }

    /// 异步等待直到可以发送 `bytes` 字节
    pub async fn acquire(&self, bytes: usize) {
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(self.chunk_size());
            let Some(cells) = NonZeroU32::new(chunk as u32) else {
                break;
            };

            loop {
                match self.check(cells) {
                    Ok(()) => break,
                    Err(wait_time) => tokio::time::sleep(wait_time).await,
                }
            }
            remaining -= chunk;
        }
    }

    /// 获取配置信息
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
            burst: self.burst,
        }
    }
}

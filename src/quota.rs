/// 流量配额模块
///
/// 按客户端源 IP 统计入站字节数，超过上限后拒绝服务。配额不会自动重置。
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 配额检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Exceeded,
}

impl QuotaDecision {
    pub fn is_exceeded(self) -> bool {
        self == QuotaDecision::Exceeded
    }
}

/// 单个源 IP 的流量配额
#[derive(Debug)]
pub struct TrafficQuota {
    ip: IpAddr,
    limit_bytes: u64,
    transferred_bytes: AtomicU64,
}

impl TrafficQuota {
    pub fn new(ip: IpAddr, limit_bytes: u64) -> Self {
        Self {
            ip,
            limit_bytes,
            transferred_bytes: AtomicU64::new(0),
        }
    }

    /// 累加字节数，新的总量严格大于上限时返回 Exceeded
    pub fn add(&self, bytes: u64) -> QuotaDecision {
        let total = self
            .transferred_bytes
            .fetch_add(bytes, Ordering::AcqRel)
            .saturating_add(bytes);
        if total > self.limit_bytes {
            QuotaDecision::Exceeded
        } else {
            QuotaDecision::Allowed
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Acquire)
    }
}

/// Usage row exposed through the stats endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub ip: IpAddr,
    pub transferred_bytes: u64,
    pub limit_bytes: u64,
}

/// 配额注册表，按源 IP 懒创建配额
///
/// 注册表本身可克隆，克隆体共享同一份状态；生命周期跟随持有它的服务器。
#[derive(Debug, Clone)]
pub struct QuotaRegistry {
    limit_bytes: u64,
    quotas: Arc<Mutex<HashMap<IpAddr, Arc<TrafficQuota>>>>,
}

impl QuotaRegistry {
    /// 创建注册表，`limit_bytes` 对之后创建的每个配额生效
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit_bytes,
            quotas: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 以 MB 为单位创建
    pub fn with_limit_mb(limit_mb: u64) -> Self {
        Self::new(limit_mb.saturating_mul(1024 * 1024))
    }

    /// 查找或创建该 IP 的配额
    pub fn quota_for(&self, ip: IpAddr) -> Arc<TrafficQuota> {
        let mut quotas = self.quotas.lock();
        quotas
            .entry(ip)
            .or_insert_with(|| Arc::new(TrafficQuota::new(ip, self.limit_bytes)))
            .clone()
    }

    /// 记录入站字节并返回检查结果
    pub fn check(&self, ip: IpAddr, incoming: u64) -> QuotaDecision {
        // 计数在锁外完成，同一 IP 的并发连接只竞争原子计数器
        self.quota_for(ip).add(incoming)
    }

    /// 当前已传输字节数（未见过的 IP 返回 None）
    pub fn transferred(&self, ip: IpAddr) -> Option<u64> {
        self.quotas.lock().get(&ip).map(|q| q.transferred_bytes())
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// 已跟踪的 IP 数量
    pub fn len(&self) -> usize {
        self.quotas.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.lock().is_empty()
    }

    /// 所有配额的快照，按 IP 排序
    pub fn usage(&self) -> Vec<QuotaUsage> {
        let mut rows: Vec<QuotaUsage> = self
            .quotas
            .lock()
            .values()
            .map(|q| QuotaUsage {
                ip: q.ip(),
                transferred_bytes: q.transferred_bytes(),
                limit_bytes: q.limit_bytes(),
            })
            .collect();
        rows.sort_by_key(|row| row.ip);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_exceeded_only_when_strictly_over_limit() {
        let registry = QuotaRegistry::new(100);
        let client = ip("192.0.2.1");

        assert_eq!(registry.check(client, 60), QuotaDecision::Allowed);
        // 恰好等于上限仍然允许
        assert_eq!(registry.check(client, 40), QuotaDecision::Allowed);
        assert_eq!(registry.check(client, 1), QuotaDecision::Exceeded);
    }

    #[test]
    fn test_counts_are_additive() {
        let registry = QuotaRegistry::new(1_000);
        let client = ip("192.0.2.2");

        registry.check(client, 7);
        registry.check(client, 7);
        assert_eq!(registry.transferred(client), Some(14));
    }

    #[test]
    fn test_quota_is_never_reset() {
        let registry = QuotaRegistry::new(10);
        let client = ip("192.0.2.3");

        assert!(registry.check(client, 11).is_exceeded());
        // 之后的任意请求仍然被拒绝
        assert!(registry.check(client, 1).is_exceeded());
        assert_eq!(registry.transferred(client), Some(12));
    }

    #[test]
    fn test_separate_ips_are_independent() {
        let registry = QuotaRegistry::new(10);
        assert!(registry.check(ip("192.0.2.4"), 11).is_exceeded());
        assert!(!registry.check(ip("192.0.2.5"), 10).is_exceeded());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.transferred(ip("198.51.100.1")), None);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = QuotaRegistry::new(10);
        let clone = registry.clone();
        registry.check(ip("192.0.2.6"), 10);
        assert!(clone.check(ip("192.0.2.6"), 1).is_exceeded());
    }

    #[test]
    fn test_with_limit_mb() {
        let registry = QuotaRegistry::with_limit_mb(2);
        assert_eq!(registry.limit_bytes(), 2 * 1024 * 1024);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_usage_snapshot() {
        let registry = QuotaRegistry::new(50);
        registry.check(ip("192.0.2.9"), 5);
        registry.check(ip("192.0.2.8"), 3);

        let usage = registry.usage();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].ip, ip("192.0.2.8"));
        assert_eq!(usage[0].transferred_bytes, 3);
        assert_eq!(usage[1].limit_bytes, 50);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let registry = QuotaRegistry::new(u64::MAX);
        let client = ip("192.0.2.10");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        registry.check(client, 3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.transferred(client), Some(8 * 1_000 * 3));
    }
}

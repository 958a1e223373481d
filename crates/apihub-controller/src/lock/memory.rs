//! 内存协调服务
//!
//! 单进程内的租约表，过期判断使用 tokio 时钟，便于在测试中推进时间。

use apihub_common::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::Coordinator;

/// 租约记录
#[derive(Debug, Clone)]
struct LeaseRecord {
    /// 持有者
    holder: String,
    /// 过期时间
    expires_at: Instant,
}

/// 内存协调服务
#[derive(Default)]
pub struct MemoryCoordinator {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前持有者（未过期）
    pub async fn holder(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(key)
            .filter(|r| r.expires_at > Instant::now())
            .map(|r| r.holder.clone())
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some(record) = leases.get(key) {
            if record.holder != holder && record.expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(
            key.to_string(),
            LeaseRecord {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(key) {
            Some(record) if record.holder == holder => {
                record.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).map(|r| r.holder == holder).unwrap_or(false) {
            leases.remove(key);
        }
        Ok(())
    }
}

//! 周期同步的领导者选举
//!
//! 多个副本共享同一个协调服务租约，只有持有租约的副本执行周期同步。

use apihub_common::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::lock::Coordinator;

/// 默认的领导者租约键
pub const DEFAULT_LEADER_LEASE: &str = "apihub-sync-leader";

/// 领导者选举配置
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// 租约键
    pub lease: String,
    /// 租约有效期
    pub ttl: Duration,
    /// 续约/竞选间隔
    pub retry_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEADER_LEASE.to_string(),
            ttl: Duration::from_secs(15),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// 领导者选举器
pub struct LeaderElector {
    coordinator: Arc<dyn Coordinator>,
    identity: String,
    config: LeaderConfig,
    is_leader: AtomicBool,
}

impl LeaderElector {
    /// 创建新的领导者选举器
    pub fn new(coordinator: Arc<dyn Coordinator>, identity: impl Into<String>, config: LeaderConfig) -> Self {
        Self {
            coordinator,
            identity: identity.into(),
            config,
            is_leader: AtomicBool::new(false),
        }
    }

    /// 本副本标识
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 当前是否为领导者
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// 执行一轮竞选或续约，返回本轮之后是否为领导者
    pub async fn tick(&self) -> Result<bool> {
        let was_leader = self.is_leader();
        let result = if was_leader {
            self.coordinator
                .renew(&self.config.lease, &self.identity, self.config.ttl)
                .await
        } else {
            self.coordinator
                .try_acquire(&self.config.lease, &self.identity, self.config.ttl)
                .await
        };

        // 协调服务不可用时不能确认租约仍然有效，按失去领导权处理
        let leading = match result {
            Ok(leading) => leading,
            Err(e) => {
                self.is_leader.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.is_leader.store(leading, Ordering::SeqCst);
        match (was_leader, leading) {
            (false, true) => info!(identity = %self.identity, "已成为周期同步领导者"),
            (true, false) => warn!(identity = %self.identity, "已失去周期同步领导权"),
            _ => {}
        }
        Ok(leading)
    }

    /// 持续竞选直到收到关闭信号，退出时释放租约
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.tick().await {
                warn!("领导者选举失败: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }

        if let Err(e) = self.release().await {
            warn!("释放领导者租约失败: {}", e);
        }
    }

    /// 主动放弃领导权
    pub async fn release(&self) -> Result<()> {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            info!(identity = %self.identity, "释放周期同步领导权");
            self.coordinator.release(&self.config.lease, &self.identity).await?;
        }
        Ok(())
    }
}

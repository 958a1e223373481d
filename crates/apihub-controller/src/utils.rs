//! 控制面工具函数
//!
//! 固定间隔重试策略与按名称生成网关对象标识的辅助函数。

use std::time::Duration;

/// 固定间隔重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（包含首次）
    pub attempts: u32,
    /// 两次尝试之间的固定间隔
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// 创建重试策略，尝试次数至少为 1
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// 第 `attempt` 次（从 1 开始）失败后是否还能继续
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

/// 网关对象名称：同一命名空间内唯一，用于幂等创建
pub fn gateway_name(namespace: &str, name: &str) -> String {
    format!("{}.{}", namespace, name)
}

/// Api 对应的 ACL 分组
pub fn acl_group(namespace: &str, api: &str) -> String {
    format!("api-{}-{}", namespace, api)
}

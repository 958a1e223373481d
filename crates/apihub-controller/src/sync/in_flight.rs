//! 本进程正在协调的记录
//!
//! 协调引擎在处理期间登记记录，周期同步回收中断记录时跳过仍在处理的。

use apihub_common::ResourceKind;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

type Key = (ResourceKind, String, String);

/// 正在协调的记录集合
#[derive(Debug, Default)]
pub struct InFlight {
    records: Mutex<HashSet<Key>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashSet<Key>> {
        // 持锁期间只做集合增删，不会留下不一致的状态
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 登记一条记录，返回的凭证离开作用域时注销
    pub fn enter(self: &Arc<Self>, kind: ResourceKind, namespace: &str, name: &str) -> InFlightGuard {
        let key = (kind, namespace.to_string(), name.to_string());
        self.records().insert(key.clone());
        InFlightGuard {
            owner: self.clone(),
            key,
        }
    }

    /// 记录是否正在协调
    pub fn contains(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        self.records()
            .contains(&(kind, namespace.to_string(), name.to_string()))
    }
}

/// 登记凭证
pub struct InFlightGuard {
    owner: Arc<InFlight>,
    key: Key,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner.records().remove(&self.key);
    }
}

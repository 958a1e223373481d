//! 周期同步模块
//!
//! 事件驱动的协调之外，领导者副本按固定间隔重新计算派生计数、
//! 拉取调用量，并回收处理中断的资源。

mod in_flight;
mod leader;
mod synchronizer;

pub use in_flight::{InFlight, InFlightGuard};
pub use leader::{LeaderConfig, LeaderElector, DEFAULT_LEADER_LEASE};
pub use synchronizer::{PeriodicSynchronizer, SyncConfig};

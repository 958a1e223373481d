//! ApiHub 控制面组件
//!
//! 该模块提供协调引擎依赖的基础设施：带版本号的资源存储、网关编排客户端、
//! 分布式写锁、领导者选举与周期同步，以及调用量遥测。

pub mod gateway;
pub mod lock;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod utils;

pub use gateway::{GatewayOperator, KongClient, KongConfig};
pub use lock::{create_unique, Coordinator, DistributedLock, LeaseCoordinator, LockConfig, LockGuard, MemoryCoordinator};
pub use store::{modify, ResourceStore, Stores, WatchEvent, DEFAULT_NAMESPACE};
pub use sync::{InFlight, LeaderConfig, LeaderElector, PeriodicSynchronizer, SyncConfig};
pub use telemetry::{PrometheusTelemetry, Telemetry, TelemetryConfig};
pub use utils::RetryPolicy;

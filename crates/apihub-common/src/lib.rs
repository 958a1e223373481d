//! ApiHub Common - 跨模块共享的数据结构
//!
//! 该模块提供 ApiHub 控制面所有组件共享的资源模型与统一的错误处理机制。

pub mod error;
pub mod models;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::relation::*;
pub use models::resources::*;
pub use models::selector::LabelSelector;
pub use models::status::*;

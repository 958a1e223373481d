//! 数据模型模块
//!
//! 该模块定义了 ApiHub 控制面的资源类型、生命周期状态、
//! 关联关系标记与标签选择器。

pub mod relation;
pub mod resources;
pub mod selector;
pub mod status;

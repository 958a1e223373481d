//! 网关编排模块
//!
//! 该模块封装对外部 API 网关管理接口的全部调用：服务、路由、插件、
//! consumer、ACL 与 JWT 凭证。每个操作都是独立的幂等单元：
//! 同名对象已存在时返回已有对象，删除不存在的对象视为成功。

mod kong;
mod types;

pub use kong::{KongClient, KongConfig};
pub use types::*;

use apihub_common::Result;
use async_trait::async_trait;

/// 网关编排操作
#[async_trait]
pub trait GatewayOperator: Send + Sync {
    /// 创建服务，同名服务已存在时返回已有服务
    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceInfo>;

    /// 更新服务
    async fn update_service(&self, id: &str, request: &ServiceRequest) -> Result<ServiceInfo>;

    /// 删除服务
    async fn delete_service(&self, id: &str) -> Result<()>;

    /// 创建路由，同名路由已存在时返回已有路由
    async fn create_route(&self, request: &RouteRequest) -> Result<RouteInfo>;

    /// 更新路由
    async fn update_route(&self, id: &str, request: &RouteRequest) -> Result<RouteInfo>;

    /// 删除路由
    async fn delete_route(&self, id: &str) -> Result<()>;

    /// 在路由上启用插件，同名插件已存在时更新其配置
    async fn add_route_plugin(&self, route_id: &str, request: &PluginRequest) -> Result<PluginInfo>;

    /// 在 consumer 上启用插件，同名插件已存在时更新其配置
    async fn add_consumer_plugin(&self, consumer_id: &str, request: &PluginRequest) -> Result<PluginInfo>;

    /// 更新插件配置
    async fn update_plugin(&self, id: &str, request: &PluginRequest) -> Result<PluginInfo>;

    /// 删除插件
    async fn delete_plugin(&self, id: &str) -> Result<()>;

    /// 创建 consumer，同名 consumer 已存在时返回已有 consumer
    async fn create_consumer(&self, request: &ConsumerRequest) -> Result<ConsumerInfo>;

    /// 删除 consumer
    async fn delete_consumer(&self, id: &str) -> Result<()>;

    /// 为 consumer 创建 JWT 凭证
    async fn create_jwt_credential(&self, consumer_id: &str, request: &JwtRequest) -> Result<JwtCredential>;

    /// 将 consumer 加入 ACL 分组，已在分组内时视为成功
    async fn add_consumer_acl(&self, consumer_id: &str, group: &str) -> Result<AclInfo>;

    /// 将 consumer 移出 ACL 分组
    async fn remove_consumer_acl(&self, consumer_id: &str, group: &str) -> Result<()>;
}

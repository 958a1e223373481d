//! ApiHub Operator - API 管理平台控制面
//!
//! 该模块实现了 ApiHub 的协调引擎：监听 Api、ServiceUnit、Trafficcontrol、
//! Application、Apply 与 Datasource 六类资源，按状态转移表驱动网关编排，
//! 并由选举出的领导者周期性同步调用量等派生计数。

pub mod config;
pub mod controller;
pub mod event_handler;
pub mod metrics;
pub mod reconcile;

use anyhow::{Context as _, Result};
use apihub_common::{Api, Application, Apply, Datasource, ServiceUnit, Trafficcontrol};
use apihub_controller::{
    Coordinator, GatewayOperator, KongClient, LeaseCoordinator, MemoryCoordinator,
    PrometheusTelemetry, Stores,
};
use kube::{Client, CustomResourceExt};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::OperatorConfig;
use crate::controller::{Components, Controller};

/// 运行选项
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 使用内存存储与内存协调服务，用于本地调试
    pub in_memory: bool,
    /// 本进程标识，用于锁与领导者租约
    pub identity: String,
}

/// Operator 主结构体
pub struct ApiHubOperator {
    /// 控制器
    controller: Arc<RwLock<Controller>>,
}

impl ApiHubOperator {
    /// 创建新的 Operator 实例
    pub async fn new(config: OperatorConfig, options: RunOptions) -> Result<Self> {
        let gateway: Arc<dyn GatewayOperator> =
            Arc::new(KongClient::new(config.gateway.kong_config()).context("创建网关客户端失败")?);
        let telemetry = Arc::new(
            PrometheusTelemetry::new(config.telemetry.telemetry_config()).context("创建遥测客户端失败")?,
        );

        let (stores, coordinator): (Stores, Arc<dyn Coordinator>) = if options.in_memory {
            warn!("使用内存存储运行，重启后数据丢失");
            (Stores::in_memory(), Arc::new(MemoryCoordinator::new()))
        } else {
            let client = Client::try_default().await.context("创建 Kubernetes 客户端失败")?;
            (
                Stores::kube(client.clone(), config.store.watch_namespace()),
                Arc::new(LeaseCoordinator::new(client, &config.lock.lease_namespace)),
            )
        };

        let controller = Controller::new(
            &config,
            Components {
                stores,
                gateway,
                coordinator,
                telemetry,
                identity: options.identity,
            },
        )?;

        Ok(Self::with_controller(controller))
    }

    /// 使用已构建的控制器创建 Operator
    pub fn with_controller(controller: Controller) -> Self {
        Self {
            controller: Arc::new(RwLock::new(controller)),
        }
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        self.controller.write().await.start().await
    }

    /// 停止 Operator
    pub async fn stop(&self) -> Result<()> {
        self.controller.write().await.stop().await
    }

    /// 获取控制器
    pub fn controller(&self) -> Arc<RwLock<Controller>> {
        self.controller.clone()
    }
}

/// 全部自定义资源定义，YAML 多文档格式
pub fn crd_manifests() -> Result<String> {
    let documents = [
        serde_yaml::to_string(&Api::crd()),
        serde_yaml::to_string(&ServiceUnit::crd()),
        serde_yaml::to_string(&Trafficcontrol::crd()),
        serde_yaml::to_string(&Application::crd()),
        serde_yaml::to_string(&Apply::crd()),
        serde_yaml::to_string(&Datasource::crd()),
    ]
    .into_iter()
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("序列化资源定义失败")?;

    Ok(documents.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_manifests() {
        let manifests = crd_manifests().unwrap();
        assert_eq!(manifests.matches("kind: CustomResourceDefinition").count(), 6);
        assert!(manifests.contains("name: apis.apihub.io"));
        assert!(manifests.contains("name: trafficcontrols.apihub.io"));
    }
}

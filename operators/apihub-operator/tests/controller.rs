mod common;

use apihub_common::{Action, Api, ManagedResource, ProcessStatus, PublishStatus, ServiceUnit};
use apihub_controller::{create_unique, MemoryCoordinator, ResourceStore, Stores};
use apihub_operator::config::OperatorConfig;
use apihub_operator::controller::{Components, Controller};
use common::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn config() -> OperatorConfig {
    let mut config = OperatorConfig::default();
    config.metrics.enabled = false;
    config.worker.concurrency = 2;
    config
}

fn controller(gateway: Arc<FakeGateway>) -> Controller {
    Controller::new(
        &config(),
        Components {
            stores: Stores::in_memory(),
            gateway,
            coordinator: Arc::new(MemoryCoordinator::new()),
            telemetry: Arc::new(StaticTelemetry(HashMap::new())),
            identity: "replica-0".to_string(),
        },
    )
    .unwrap()
}

/// 轮询直到记录处理完成
async fn settled<K: ManagedResource>(store: &dyn ResourceStore<K>, name: &str) -> K {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let obj = store.get(NS, name).await.unwrap();
            let done = obj
                .common()
                .map(|c| c.status == ProcessStatus::Success || c.status == ProcessStatus::Error)
                .unwrap_or(false);
            if done {
                return obj;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("记录未在超时前处理完成")
}

#[test_log::test(tokio::test)]
async fn test_controller_processes_created_records() {
    let gateway = FakeGateway::new();
    let mut controller = controller(gateway.clone());
    controller.start().await.unwrap();
    assert!(controller.is_running());

    let stores = controller.stores().clone();
    let lock = controller.lock();

    let unit: ServiceUnit = create_unique(&lock, &*stores.service_units, service_unit("su1", Some(Action::Publish)))
        .await
        .unwrap();
    assert_eq!(unit.common().unwrap().status, ProcessStatus::Init);
    let unit = settled(&*stores.service_units, "su1").await;
    assert_eq!(unit.common().unwrap().status, ProcessStatus::Success);
    assert_eq!(unit.status.unwrap().publish_status, PublishStatus::Released);

    let _: Api = create_unique(&lock, &*stores.apis, api("orders", "su1", Some(Action::Publish)))
        .await
        .unwrap();
    let orders = settled(&*stores.apis, "orders").await;
    assert_eq!(orders.common().unwrap().status, ProcessStatus::Success);
    assert_eq!(publish_status(&orders), PublishStatus::Released);
    assert_eq!(gateway.route_count(), 1);

    let metrics = controller.metrics();
    assert_eq!(metrics.reconcile_count("Api", "succeeded"), 1);

    controller.stop().await.unwrap();
    assert!(!controller.is_running());
}

#[tokio::test]
async fn test_duplicate_display_name_rejected() {
    let gateway = FakeGateway::new();
    let controller = controller(gateway);
    let stores = controller.stores().clone();
    let lock = controller.lock();

    create_unique(&lock, &*stores.service_units, service_unit("su1", None))
        .await
        .unwrap();

    // 同一展示名称的另一条记录
    let mut duplicate = service_unit("su2", None);
    duplicate.spec.name = "服务-su1".to_string();
    let err = create_unique(&lock, &*stores.service_units, duplicate)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("服务-su1"));
    assert!(stores.service_units.get(NS, "su2").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_controller_restart() {
    let gateway = FakeGateway::new();
    let mut controller = controller(gateway.clone());

    controller.start().await.unwrap();
    controller.stop().await.unwrap();
    controller.start().await.unwrap();

    let stores = controller.stores().clone();
    stores
        .service_units
        .create(service_unit("su1", Some(Action::Publish)))
        .await
        .unwrap();
    let unit = settled(&*stores.service_units, "su1").await;
    assert_eq!(unit.common().unwrap().status, ProcessStatus::Success);
    assert_eq!(gateway.state(|s| s.services.len()), 1);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_table_reused_across_restart() {
    let gateway = FakeGateway::new();
    let mut controller = controller(gateway);

    let handlers = controller.handlers();
    assert_eq!(
        handlers.kinds(),
        ["Api", "ServiceUnit", "Trafficcontrol", "Application", "Apply", "Datasource"]
    );

    controller.start().await.unwrap();
    controller.stop().await.unwrap();
    controller.start().await.unwrap();
    assert!(Arc::ptr_eq(&handlers, &controller.handlers()));
    assert!(Arc::ptr_eq(&handlers.apis, &controller.handlers().apis));
    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_reconcile() {
    let gateway = FakeGateway::new();
    gateway.set_latency(Duration::from_millis(300));
    let mut controller = controller(gateway.clone());
    controller.start().await.unwrap();

    let stores = controller.stores().clone();
    stores
        .service_units
        .create(service_unit("su1", Some(Action::Publish)))
        .await
        .unwrap();

    // 等到协调任务进入网关调用
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let unit = stores.service_units.get(NS, "su1").await.unwrap();
            if unit.common().map(|c| c.status) == Some(ProcessStatus::Running) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("协调任务未开始");

    controller.stop().await.unwrap();

    // stop 返回时协调任务已写入终态
    let unit = stores.service_units.get(NS, "su1").await.unwrap();
    assert_eq!(unit.common().unwrap().status, ProcessStatus::Success);
    assert_eq!(gateway.state(|s| s.services.len()), 1);
}

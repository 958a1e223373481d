//! 周期同步器
//!
//! 每类资源一个同步任务，按固定间隔重新计算派生计数并回写状态。
//! 派生计数可由关联资源重新计算，写入失败只记录日志。

use apihub_common::{
    Api, CommonStatus, LabelSelector, ManagedResource, Phase, ProcessStatus, ResourceKind, Result,
};
use chrono::Utc;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{InFlight, LeaderElector};
use crate::store::{modify, ResourceStore, Stores};
use crate::telemetry::Telemetry;
use crate::utils::gateway_name;

/// 周期同步的资源类型
const SYNCED_KINDS: [ResourceKind; 6] = [
    ResourceKind::Api,
    ResourceKind::ServiceUnit,
    ResourceKind::Trafficcontrol,
    ResourceKind::Application,
    ResourceKind::Apply,
    ResourceKind::Datasource,
];

/// 周期同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 同步间隔
    pub interval: Duration,
    /// 启动后的首次延迟
    pub initial_delay: Duration,
    /// 处于 Running 超过该时长的资源视为处理中断
    ///
    /// 本进程登记为处理中的记录不会被回收；其他副本上的处理只受该阈值
    /// 约束，阈值必须大于单次协调在网关重试全部耗尽时的最长耗时。
    pub stale_running: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(30),
            stale_running: Duration::from_secs(600),
        }
    }
}

/// 周期同步器
pub struct PeriodicSynchronizer {
    stores: Stores,
    telemetry: Arc<dyn Telemetry>,
    elector: Arc<LeaderElector>,
    config: SyncConfig,
    in_flight: Arc<InFlight>,
}

impl PeriodicSynchronizer {
    /// 创建新的周期同步器
    pub fn new(
        stores: Stores,
        telemetry: Arc<dyn Telemetry>,
        elector: Arc<LeaderElector>,
        config: SyncConfig,
    ) -> Self {
        Self {
            stores,
            telemetry,
            elector,
            config,
            in_flight: Arc::new(InFlight::new()),
        }
    }

    /// 共享协调引擎的处理中登记，回收中断记录时跳过其中的记录
    pub fn with_in_flight(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// 为每类资源启动一个同步任务
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        SYNCED_KINDS
            .iter()
            .map(|&kind| {
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.run_kind(kind, shutdown).await })
            })
            .collect()
    }

    async fn run_kind(&self, kind: ResourceKind, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.initial_delay) => {}
            _ = shutdown.changed() => return,
        }

        info!(kind = %kind, "周期同步任务已启动，间隔: {}秒", self.config.interval.as_secs());
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!(kind = %kind, "周期同步任务已停止");
                    return;
                }
            }

            if !self.elector.is_leader() {
                debug!(kind = %kind, "非领导者，跳过本轮同步");
                continue;
            }

            match self.sync_kind(kind).await {
                Ok(0) => debug!(kind = %kind, "本轮同步无变化"),
                Ok(patched) => info!(kind = %kind, patched, "周期同步完成"),
                Err(e) => warn!(kind = %kind, "周期同步失败: {}", e),
            }
        }
    }

    /// 同步一类资源，返回写回的资源数
    pub async fn sync_kind(&self, kind: ResourceKind) -> Result<usize> {
        let (recovered, synced) = match kind {
            ResourceKind::Api => {
                let recovered = self.recover_stale(&*self.stores.apis).await?;
                (recovered, self.sync_apis().await)
            }
            ResourceKind::ServiceUnit => {
                let recovered = self.recover_stale(&*self.stores.service_units).await?;
                (recovered, self.sync_service_units().await)
            }
            ResourceKind::Trafficcontrol => {
                let recovered = self.recover_stale(&*self.stores.trafficcontrols).await?;
                (recovered, self.sync_trafficcontrols().await)
            }
            ResourceKind::Application => {
                let recovered = self.recover_stale(&*self.stores.applications).await?;
                (recovered, self.sync_applications().await)
            }
            ResourceKind::Apply => (self.recover_stale(&*self.stores.applies).await?, Ok(0)),
            ResourceKind::Datasource => {
                let recovered = self.recover_stale(&*self.stores.datasources).await?;
                (recovered, self.sync_datasources().await)
            }
        };
        Ok(recovered + synced?)
    }

    /// Api 调用次数来自遥测，遥测中没有记录的路由保持原值
    pub async fn sync_apis(&self) -> Result<usize> {
        let counts = self.telemetry.call_counts().await?;
        let apis = self.stores.apis.list(None, &LabelSelector::everything()).await?;

        let mut patched = 0;
        for api in apis {
            let namespace = api.namespace_or_default();
            let name = api.name_any();
            let Some(&count) = counts.get(&gateway_name(&namespace, &name)) else {
                continue;
            };
            if api.status.as_ref().map(|s| s.called_count) == Some(count) {
                continue;
            }

            let changed = patch(&*self.stores.apis, &namespace, &name, |api| {
                let status = api.status.get_or_insert_with(Default::default);
                if status.called_count == count {
                    return false;
                }
                status.called_count = count;
                true
            })
            .await;
            patched += usize::from(changed);
        }
        Ok(patched)
    }

    /// 服务单元的 Api 数为引用它且已发布的 Api 数
    pub async fn sync_service_units(&self) -> Result<usize> {
        let apis = self.stores.apis.list(None, &LabelSelector::everything()).await?;
        let mut released: HashMap<(String, String), u64> = HashMap::new();
        for api in apis.iter().filter(|a| a.phase() == Phase::Released) {
            *released
                .entry((api.namespace_or_default(), api.spec.service_unit.clone()))
                .or_default() += 1;
        }

        let units = self.stores.service_units.list(None, &LabelSelector::everything()).await?;
        let mut patched = 0;
        for unit in units {
            let namespace = unit.namespace_or_default();
            let name = unit.name_any();
            let count = released.get(&(namespace.clone(), name.clone())).copied().unwrap_or(0);
            if unit.status.as_ref().map(|s| s.api_count).unwrap_or(0) == count {
                continue;
            }

            let changed = patch(&*self.stores.service_units, &namespace, &name, |unit| {
                let status = unit.status.get_or_insert_with(Default::default);
                if status.api_count == count {
                    return false;
                }
                status.api_count = count;
                true
            })
            .await;
            patched += usize::from(changed);
        }
        Ok(patched)
    }

    pub async fn sync_trafficcontrols(&self) -> Result<usize> {
        let controls = self.stores.trafficcontrols.list(None, &LabelSelector::everything()).await?;
        let mut patched = 0;
        for control in controls {
            let count = control.spec.apis.len() as u64;
            if control.status.as_ref().map(|s| s.api_count).unwrap_or(0) == count {
                continue;
            }

            let namespace = control.namespace_or_default();
            let name = control.name_any();
            let changed = patch(&*self.stores.trafficcontrols, &namespace, &name, |control| {
                let count = control.spec.apis.len() as u64;
                let status = control.status.get_or_insert_with(Default::default);
                if status.api_count == count {
                    return false;
                }
                status.api_count = count;
                true
            })
            .await;
            patched += usize::from(changed);
        }
        Ok(patched)
    }

    /// 应用的调用次数为其绑定 Api 调用次数之和
    pub async fn sync_applications(&self) -> Result<usize> {
        let apis = self.stores.apis.list(None, &LabelSelector::everything()).await?;
        let called: HashMap<(String, String), u64> = apis
            .iter()
            .map(|api: &Api| {
                let count = api.status.as_ref().map(|s| s.called_count).unwrap_or(0);
                ((api.namespace_or_default(), api.name_any()), count)
            })
            .collect();

        let applications = self.stores.applications.list(None, &LabelSelector::everything()).await?;
        let mut patched = 0;
        for app in applications {
            let namespace = app.namespace_or_default();
            let name = app.name_any();
            let api_count = app.spec.apis.len() as u64;
            let called_count: u64 = app
                .spec
                .apis
                .iter()
                .filter_map(|api| called.get(&(namespace.clone(), api.clone())))
                .sum();

            let current = app
                .status
                .as_ref()
                .map(|s| (s.api_count, s.called_count))
                .unwrap_or((0, 0));
            if current == (api_count, called_count) {
                continue;
            }

            let changed = patch(&*self.stores.applications, &namespace, &name, |app| {
                let status = app.status.get_or_insert_with(Default::default);
                if (status.api_count, status.called_count) == (api_count, called_count) {
                    return false;
                }
                status.api_count = api_count;
                status.called_count = called_count;
                true
            })
            .await;
            patched += usize::from(changed);
        }
        Ok(patched)
    }

    pub async fn sync_datasources(&self) -> Result<usize> {
        let units = self.stores.service_units.list(None, &LabelSelector::everything()).await?;
        let mut referenced: HashMap<(String, String), u64> = HashMap::new();
        for unit in &units {
            if let Some(datasource) = &unit.spec.datasource {
                *referenced
                    .entry((unit.namespace_or_default(), datasource.clone()))
                    .or_default() += 1;
            }
        }

        let datasources = self.stores.datasources.list(None, &LabelSelector::everything()).await?;
        let mut patched = 0;
        for ds in datasources {
            let namespace = ds.namespace_or_default();
            let name = ds.name_any();
            let count = referenced.get(&(namespace.clone(), name.clone())).copied().unwrap_or(0);
            if ds.status.as_ref().map(|s| s.service_unit_count).unwrap_or(0) == count {
                continue;
            }

            let changed = patch(&*self.stores.datasources, &namespace, &name, |ds| {
                let status = ds.status.get_or_insert_with(Default::default);
                if status.service_unit_count == count {
                    return false;
                }
                status.service_unit_count = count;
                true
            })
            .await;
            patched += usize::from(changed);
        }
        Ok(patched)
    }

    /// 将长时间停留在 Running 的资源重置为 Init，交由协调引擎重新处理
    pub async fn recover_stale<K: ManagedResource>(&self, store: &dyn ResourceStore<K>) -> Result<usize> {
        let threshold = chrono::Duration::from_std(self.config.stale_running)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let is_stale = move |common: Option<&CommonStatus>| {
            common
                .filter(|c| c.status == ProcessStatus::Running)
                .map(|c| c.last_transition.map(|t| Utc::now() - t > threshold).unwrap_or(true))
                .unwrap_or(false)
        };

        let objects = store.list(None, &LabelSelector::everything()).await?;
        let mut recovered = 0;
        for obj in objects.iter().filter(|o| is_stale(o.common())) {
            let namespace = obj.namespace_or_default();
            let name = obj.name_any();
            if self.in_flight.contains(K::KIND, &namespace, &name) {
                debug!(kind = %K::KIND, namespace = %namespace, name = %name, "记录仍在本进程处理中，跳过回收");
                continue;
            }
            let changed = patch(store, &namespace, &name, |obj| {
                if !is_stale(obj.common()) {
                    return false;
                }
                let common = obj.common_mut();
                common.status = ProcessStatus::Init;
                common.message = Some("处理中断，重新排队".to_string());
                common.last_transition = Some(Utc::now());
                true
            })
            .await;
            if changed {
                warn!(kind = %K::KIND, namespace = %namespace, name = %name, "资源处理中断，已重置为待处理");
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

/// 写回派生状态，失败时只记录日志
async fn patch<K, F>(store: &dyn ResourceStore<K>, namespace: &str, name: &str, mut mutate: F) -> bool
where
    K: ManagedResource,
    F: FnMut(&mut K) -> bool + Send,
{
    let mut changed = false;
    let result = modify(store, namespace, name, |obj| {
        changed = mutate(obj);
        Ok(changed)
    })
    .await;

    match result {
        Ok(Some(_)) => changed,
        Ok(None) => false,
        Err(e) => {
            warn!(kind = %K::KIND, namespace, name, "更新派生计数失败: {}", e);
            false
        }
    }
}

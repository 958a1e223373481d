//! 资源存储模块
//!
//! 该模块抽象了带版本号的资源存储：按命名空间读取、按标签列举、
//! 乐观并发更新与变更监听。生产环境使用 Kubernetes 自定义资源，
//! 测试与本地运行使用内存实现。

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use apihub_common::{
    Api, Application, Apply, Datasource, Error, LabelSelector, ManagedResource, Result,
    ServiceUnit, Trafficcontrol,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::Client;
use std::sync::Arc;
use tracing::debug;

/// 未开启多租户时使用的共享命名空间
pub const DEFAULT_NAMESPACE: &str = "default";

/// 冲突后重新读取的最大次数
const MODIFY_ATTEMPTS: usize = 5;

/// 资源变更事件
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// 资源新增（包括监听重建后的全量列举）
    Added(K),
    /// 资源变更
    Changed(K),
    /// 资源删除
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// 事件携带的资源
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Changed(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// 带版本号的资源存储
#[async_trait]
pub trait ResourceStore<K: ManagedResource>: Send + Sync {
    /// 读取单个资源
    async fn get(&self, namespace: &str, name: &str) -> Result<K>;

    /// 按命名空间与标签选择器列举资源，命名空间为 `None` 时列举全部
    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<K>>;

    /// 创建资源，同名资源已存在时返回 `AlreadyExists`
    async fn create(&self, obj: K) -> Result<K>;

    /// 基于资源携带的版本号更新，版本不一致时返回 `Conflict`
    ///
    /// 创建与更新都按当前 spec 重写索引标签。
    async fn update(&self, obj: K) -> Result<K>;

    /// 删除资源
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// 监听资源变更
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// 读取最新版本并修改，遇到版本冲突时重新读取后再计算
///
/// `mutate` 返回 `false` 表示无需写回。资源不存在时返回 `Ok(None)`。
pub async fn modify<K, F>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Option<K>>
where
    K: ManagedResource,
    F: FnMut(&mut K) -> Result<bool> + Send,
{
    let mut last_error = None;

    for attempt in 0..MODIFY_ATTEMPTS {
        let mut obj = match store.get(namespace, name).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        if !mutate(&mut obj)? {
            return Ok(Some(obj));
        }

        match store.update(obj).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() => {
                debug!(kind = %K::KIND, namespace, name, attempt, "版本冲突，重新读取");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| Error::conflict(K::KIND, namespace, name)))
}

/// 各类资源的存储集合
#[derive(Clone)]
pub struct Stores {
    pub apis: Arc<dyn ResourceStore<Api>>,
    pub service_units: Arc<dyn ResourceStore<ServiceUnit>>,
    pub trafficcontrols: Arc<dyn ResourceStore<Trafficcontrol>>,
    pub applications: Arc<dyn ResourceStore<Application>>,
    pub applies: Arc<dyn ResourceStore<Apply>>,
    pub datasources: Arc<dyn ResourceStore<Datasource>>,
}

impl Stores {
    /// 创建内存存储集合
    pub fn in_memory() -> Self {
        Self {
            apis: Arc::new(MemoryStore::new()),
            service_units: Arc::new(MemoryStore::new()),
            trafficcontrols: Arc::new(MemoryStore::new()),
            applications: Arc::new(MemoryStore::new()),
            applies: Arc::new(MemoryStore::new()),
            datasources: Arc::new(MemoryStore::new()),
        }
    }

    /// 创建基于 Kubernetes 自定义资源的存储集合
    ///
    /// `namespace` 为 `Some` 时只监听该命名空间（未开启多租户）。
    pub fn kube(client: Client, namespace: Option<String>) -> Self {
        Self {
            apis: Arc::new(KubeStore::new(client.clone(), namespace.clone())),
            service_units: Arc::new(KubeStore::new(client.clone(), namespace.clone())),
            trafficcontrols: Arc::new(KubeStore::new(client.clone(), namespace.clone())),
            applications: Arc::new(KubeStore::new(client.clone(), namespace.clone())),
            applies: Arc::new(KubeStore::new(client.clone(), namespace.clone())),
            datasources: Arc::new(KubeStore::new(client, namespace)),
        }
    }
}

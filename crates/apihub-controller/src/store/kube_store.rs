//! Kubernetes 资源存储
//!
//! 基于 kube-rs 将资源保存为自定义资源。spec 与 status 分别通过主资源与
//! status 子资源写入，版本冲突（409）映射为 `Conflict`。
//!
//! 一次 `update` 可能拆成两次写入，两次写入由 [`guarded_update`] 串联：
//! 只写有变化的部分，status 写入失败时把已写入的 spec 回滚到更新前的内容。
//! 只有整个更新没有留下任何痕迹时才返回 `Conflict`。

use apihub_common::{Error, LabelSelector, ManagedResource, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    runtime::watcher,
    Client, ResourceExt,
};
use std::marker::PhantomData;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ResourceStore, WatchEvent, DEFAULT_NAMESPACE};

/// Kubernetes 资源存储
pub struct KubeStore<K> {
    /// Kubernetes 客户端
    client: Client,
    /// 监听范围，`None` 表示所有命名空间
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: ManagedResource + kube::Resource<Scope = NamespaceResourceScope>,
{
    /// 创建新的存储
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self {
            client,
            namespace,
            _kind: PhantomData,
        }
    }

    fn namespaced(&self, namespace: &str) -> kube::Api<K> {
        kube::Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped(&self, namespace: Option<&str>) -> kube::Api<K> {
        match namespace.or(self.namespace.as_deref()) {
            Some(ns) => self.namespaced(ns),
            None => kube::Api::all(self.client.clone()),
        }
    }
}

/// 将 kube 错误映射为统一错误
fn map_error<K: ManagedResource>(err: kube::Error, namespace: &str, name: &str, creating: bool) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(K::KIND, namespace, name),
        kube::Error::Api(resp) if resp.code == 409 && creating => {
            Error::already_exists(K::KIND, namespace, name)
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::conflict(K::KIND, namespace, name),
        _ => Error::Store(err.to_string()),
    }
}

/// 拆分写入所需的三个原子操作
#[async_trait]
trait SplitWriter<K>: Send + Sync {
    /// 读取最新对象
    async fn fetch(&self, name: &str) -> kube::Result<K>;

    /// 写主资源（spec 与 metadata），status 被服务端忽略
    async fn write_main(&self, name: &str, obj: &K) -> kube::Result<K>;

    /// 写 status 子资源
    async fn write_status(&self, name: &str, body: Vec<u8>) -> kube::Result<K>;
}

#[async_trait]
impl<K> SplitWriter<K> for kube::Api<K>
where
    K: ManagedResource + kube::Resource<Scope = NamespaceResourceScope>,
{
    async fn fetch(&self, name: &str) -> kube::Result<K> {
        self.get(name).await
    }

    async fn write_main(&self, name: &str, obj: &K) -> kube::Result<K> {
        self.replace(name, &PostParams::default(), obj).await
    }

    async fn write_status(&self, name: &str, body: Vec<u8>) -> kube::Result<K> {
        self.replace_status(name, &PostParams::default(), body).await
    }
}

/// 主资源部分：spec 与可由调用方修改的 metadata
fn main_part(value: &Value) -> Value {
    serde_json::json!({
        "spec": value["spec"],
        "labels": value["metadata"]["labels"],
        "annotations": value["metadata"]["annotations"],
        "finalizers": value["metadata"]["finalizers"],
    })
}

/// 校验版本后按需写入主资源与 status 子资源
///
/// status 写入失败时，若主资源已经写入，则以刚写入的版本号回滚为更新前
/// 的内容：回滚成功时返回 status 写入的原始错误，回滚失败时返回
/// `Error::Store`，此时主资源保留了新内容。
async fn guarded_update<K, W>(writer: &W, namespace: &str, obj: K) -> Result<K>
where
    K: ManagedResource,
    W: SplitWriter<K> + ?Sized,
{
    let name = obj.name_any();
    let current = writer
        .fetch(&name)
        .await
        .map_err(|e| map_error::<K>(e, namespace, &name, false))?;
    if current.resource_version() != obj.resource_version() {
        return Err(Error::conflict(K::KIND, namespace, &name));
    }

    let desired = serde_json::to_value(&obj)?;
    let stored = serde_json::to_value(&current)?;
    let main_changed = main_part(&desired) != main_part(&stored);
    let status_changed = !desired["status"].is_null() && desired["status"] != stored["status"];

    let written = if main_changed {
        Some(
            writer
                .write_main(&name, &obj)
                .await
                .map_err(|e| map_error::<K>(e, namespace, &name, false))?,
        )
    } else {
        None
    };

    if !status_changed {
        return Ok(written.unwrap_or(current));
    }

    let mut body = desired;
    body["metadata"]["resourceVersion"] = serde_json::json!(written
        .as_ref()
        .map(|w| w.resource_version())
        .unwrap_or_else(|| current.resource_version()));

    debug!(kind = %K::KIND, namespace = %namespace, name = %name, "写入 status 子资源");
    let err = match writer.write_status(&name, serde_json::to_vec(&body)?).await {
        Ok(updated) => return Ok(updated),
        Err(e) => map_error::<K>(e, namespace, &name, false),
    };

    let Some(written) = written else {
        return Err(err);
    };

    let mut restore = current;
    restore.meta_mut().resource_version = written.resource_version();
    match writer.write_main(&name, &restore).await {
        Ok(_) => {
            warn!(kind = %K::KIND, namespace = %namespace, name = %name, "status 写入失败，spec 已回滚: {}", err);
            Err(err)
        }
        Err(e) => {
            warn!(kind = %K::KIND, namespace = %namespace, name = %name, "status 写入失败且 spec 回滚失败: {}", e);
            Err(Error::Store(format!(
                "{} {}/{} 的 status 写入失败（{}），spec 已写入但未能回滚",
                K::KIND,
                namespace,
                name,
                err
            )))
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: ManagedResource + kube::Resource<Scope = NamespaceResourceScope>,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        self.namespaced(namespace)
            .get(name)
            .await
            .map_err(|e| map_error::<K>(e, namespace, name, false))
    }

    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }

        let list = self
            .scoped(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(list.items)
    }

    async fn create(&self, mut obj: K) -> Result<K> {
        obj.refresh_index_labels();
        let namespace = obj.namespace().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let name = obj.name_any();
        self.namespaced(&namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_error::<K>(e, &namespace, &name, true))
    }

    async fn update(&self, mut obj: K) -> Result<K> {
        obj.refresh_index_labels();
        let namespace = obj.namespace().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        guarded_update(&self.namespaced(&namespace), &namespace, obj).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error::<K>(e, namespace, name, false))?;
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        watcher(self.scoped(None), watcher::Config::default())
            .map(|event| match event {
                Ok(watcher::Event::Applied(obj)) => vec![Ok(WatchEvent::Changed(obj))],
                Ok(watcher::Event::Deleted(obj)) => vec![Ok(WatchEvent::Deleted(obj))],
                Ok(watcher::Event::Restarted(objs)) => {
                    objs.into_iter().map(|obj| Ok(WatchEvent::Added(obj))).collect()
                }
                Err(e) => vec![Err(Error::Store(e.to_string()))],
            })
            .flat_map(stream::iter)
            .boxed()
    }
}

//! 内存资源存储
//!
//! 进程内的版本化存储，行为与 Kubernetes 存储保持一致：
//! 每次写入递增全局版本号，更新时校验版本号，变更通过广播通道分发。

use apihub_common::{Error, LabelSelector, ManagedResource, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use super::{ResourceStore, WatchEvent, DEFAULT_NAMESPACE};

/// 广播通道容量
const EVENT_BUFFER: usize = 1024;

/// 内存资源存储
pub struct MemoryStore<K> {
    /// 资源数据，键为（命名空间，名称）
    objects: RwLock<BTreeMap<(String, String), K>>,
    /// 全局版本号
    revision: AtomicU64,
    /// 变更事件广播
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: ManagedResource> MemoryStore<K> {
    /// 创建空存储
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            events,
        }
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: WatchEvent<K>) {
        // 没有监听者时发送失败，忽略即可
        let _ = self.events.send(event);
    }
}

impl<K: ManagedResource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of<K: ManagedResource>(obj: &K) -> (String, String) {
    (
        obj.namespace().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        obj.name_any(),
    )
}

#[async_trait]
impl<K: ManagedResource> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        let objects = self.objects.read().await;
        objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(K::KIND, namespace, name))
    }

    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<K>> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true))
            .filter(|(_, obj)| selector.matches(obj.labels()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, mut obj: K) -> Result<K> {
        let (namespace, name) = key_of(&obj);
        let mut objects = self.objects.write().await;
        if objects.contains_key(&(namespace.clone(), name.clone())) {
            return Err(Error::already_exists(K::KIND, &namespace, &name));
        }

        obj.refresh_index_labels();
        obj.meta_mut().namespace = Some(namespace.clone());
        obj.meta_mut().resource_version = Some(self.next_revision());
        objects.insert((namespace, name), obj.clone());
        drop(objects);

        self.publish(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: K) -> Result<K> {
        let (namespace, name) = key_of(&obj);
        let mut objects = self.objects.write().await;
        let current = objects
            .get(&(namespace.clone(), name.clone()))
            .ok_or_else(|| Error::not_found(K::KIND, &namespace, &name))?;

        if current.resource_version() != obj.resource_version() {
            return Err(Error::conflict(K::KIND, &namespace, &name));
        }

        obj.refresh_index_labels();
        obj.meta_mut().namespace = Some(namespace.clone());
        obj.meta_mut().resource_version = Some(self.next_revision());
        objects.insert((namespace, name), obj.clone());
        drop(objects);

        self.publish(WatchEvent::Changed(obj.clone()));
        Ok(obj)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let removed = self
            .objects
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::not_found(K::KIND, namespace, name))?;

        self.publish(WatchEvent::Deleted(removed));
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let receiver = self.events.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind = %K::KIND, skipped, "监听者处理过慢，丢弃部分事件");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

//! 分布式写锁模块
//!
//! 多个 API 服务副本并发创建资源时，“校验唯一再写入”这一段必须串行。
//! 锁以租约形式保存在外部协调服务中：持有者定期续约，进程崩溃后租约
//! 到期即可被其他竞争者回收，无需人工清理。

mod lease;
mod memory;

pub use lease::LeaseCoordinator;
pub use memory::MemoryCoordinator;

use apihub_common::{Error, LabelSelector, ManagedResource, Result};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::ResourceStore;

/// 协调服务
///
/// 以键为单位维护带过期时间的租约。
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// 尝试获取租约：租约空闲、已过期或已由 `holder` 持有时成功
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// 续约，只有当前持有者可以续约
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// 释放租约，非持有者释放时忽略
    async fn release(&self, key: &str, holder: &str) -> Result<()>;
}

/// 分布式锁配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 租约有效期
    pub ttl: Duration,
    /// 获取锁的最长等待时间
    pub acquire_timeout: Duration,
    /// 竞争失败后的轮询间隔
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// 分布式写锁
pub struct DistributedLock {
    /// 协调服务
    coordinator: Arc<dyn Coordinator>,
    /// 本进程标识
    identity: String,
    /// 锁配置
    config: LockConfig,
}

impl DistributedLock {
    /// 创建新的分布式锁
    pub fn new(coordinator: Arc<dyn Coordinator>, identity: impl Into<String>, config: LockConfig) -> Self {
        Self {
            coordinator,
            identity: identity.into(),
            config,
        }
    }

    /// 获取指定类别的锁
    ///
    /// 超过 `acquire_timeout` 仍未获取时返回 `Error::LockTimeout`。
    pub async fn acquire(&self, category: &str) -> Result<LockGuard> {
        let key = lock_key(category);
        // 同一进程内的多个调用方也必须互斥，持有者标识精确到单次获取
        let holder = format!("{}-{}", self.identity, uuid::Uuid::new_v4());
        let ttl = self.config.ttl;

        let attempt = async {
            loop {
                if self.coordinator.try_acquire(&key, &holder, ttl).await? {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        match tokio::time::timeout(self.config.acquire_timeout, attempt).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(category, "获取分布式锁超时");
                return Err(Error::LockTimeout(category.to_string()));
            }
        }

        debug!(category, holder = %holder, "已获取分布式锁");

        let (lost_tx, lost) = watch::channel(false);
        let keepalive = spawn_keepalive(self.coordinator.clone(), key.clone(), holder.clone(), ttl, lost_tx);
        Ok(LockGuard {
            coordinator: self.coordinator.clone(),
            key,
            holder,
            keepalive: Some(keepalive),
            lost,
            released: false,
        })
    }
}

fn lock_key(category: &str) -> String {
    format!("apihub-lock-{}", category.to_lowercase())
}

/// 持有期间按 TTL 的三分之一续约
///
/// 租约被回收，或连续续约失败超过一个 TTL 时，通过 `lost` 通知持有者。
fn spawn_keepalive(
    coordinator: Arc<dyn Coordinator>,
    key: String,
    holder: String,
    ttl: Duration,
    lost: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (ttl / 3).max(Duration::from_millis(10));
        let mut renewed = Instant::now();
        loop {
            tokio::time::sleep(period).await;
            match coordinator.renew(&key, &holder, ttl).await {
                Ok(true) => renewed = Instant::now(),
                Ok(false) => {
                    warn!(key = %key, "租约已被回收，停止续约");
                    lost.send_replace(true);
                    return;
                }
                Err(e) => {
                    warn!(key = %key, "续约失败: {}", e);
                    if renewed.elapsed() >= ttl {
                        warn!(key = %key, "超过租约有效期未能续约，视为已丢失");
                        lost.send_replace(true);
                        return;
                    }
                }
            }
        }
    })
}

/// 锁持有凭证
///
/// 显式调用 [`LockGuard::release`] 或在离开作用域时释放，保证只释放一次。
pub struct LockGuard {
    coordinator: Arc<dyn Coordinator>,
    key: String,
    holder: String,
    keepalive: Option<JoinHandle<()>>,
    lost: watch::Receiver<bool>,
    released: bool,
}

impl LockGuard {
    /// 锁对应的键
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 租约是否已丢失，丢失后持有者不能再依赖互斥
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// 租约丢失的通知
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }

    /// 释放锁
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        self.coordinator.release(&self.key, &self.holder).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }

        let coordinator = self.coordinator.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = coordinator.release(&key, &holder).await {
                        warn!(key = %key, "释放分布式锁失败，等待租约过期: {}", e);
                    }
                });
            }
            Err(_) => warn!(key = %key, "运行时已关闭，等待租约过期"),
        }
    }
}

/// 在写锁保护下校验展示名称唯一后创建资源
///
/// 同一命名空间内已存在同名资源时返回 `AlreadyExists`；获取锁超时，
/// 或写入前租约已丢失时不做任何写入。
pub async fn create_unique<K: ManagedResource>(
    lock: &DistributedLock,
    store: &dyn ResourceStore<K>,
    mut obj: K,
) -> Result<K> {
    let guard = lock.acquire(K::KIND.as_str()).await?;

    let result = async {
        let namespace = obj.namespace_or_default();
        let existing = store.list(Some(&namespace), &LabelSelector::everything()).await?;
        if existing.iter().any(|o| o.display_name() == obj.display_name()) {
            return Err(Error::already_exists(K::KIND, &namespace, obj.display_name()));
        }

        if guard.is_lost() {
            warn!(kind = %K::KIND, key = %guard.key(), "租约已丢失，放弃创建");
            return Err(Error::Coordination(format!("分布式锁 {} 的租约已丢失", guard.key())));
        }
        obj.meta_mut().namespace = Some(namespace);
        store.create(obj).await
    }
    .await;

    if let Err(e) = guard.release().await {
        warn!("释放分布式锁失败，等待租约过期: {}", e);
    }

    if let Ok(created) = &result {
        info!(kind = %K::KIND, name = %created.name_any(), "资源已创建");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WatchEvent};
    use apihub_common::{Datasource, DatasourceSpec, DatasourceType};
    use futures::stream::BoxStream;

    /// 获取后立即被其他竞争者回收的租约
    struct RevokedCoordinator;

    #[async_trait]
    impl Coordinator for RevokedCoordinator {
        async fn try_acquire(&self, _key: &str, _holder: &str, _ttl: Duration) -> Result<bool> {
            Ok(true)
        }

        async fn renew(&self, _key: &str, _holder: &str, _ttl: Duration) -> Result<bool> {
            Ok(false)
        }

        async fn release(&self, _key: &str, _holder: &str) -> Result<()> {
            Ok(())
        }
    }

    /// 列举耗时超过租约有效期的存储
    struct SlowListStore(MemoryStore<Datasource>);

    #[async_trait]
    impl ResourceStore<Datasource> for SlowListStore {
        async fn get(&self, namespace: &str, name: &str) -> Result<Datasource> {
            self.0.get(namespace, name).await
        }

        async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Datasource>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.0.list(namespace, selector).await
        }

        async fn create(&self, obj: Datasource) -> Result<Datasource> {
            self.0.create(obj).await
        }

        async fn update(&self, obj: Datasource) -> Result<Datasource> {
            self.0.update(obj).await
        }

        async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
            self.0.delete(namespace, name).await
        }

        fn watch(&self) -> BoxStream<'static, Result<WatchEvent<Datasource>>> {
            self.0.watch()
        }
    }

    fn lock(coordinator: Arc<MemoryCoordinator>) -> DistributedLock {
        DistributedLock::new(coordinator, "replica-a", LockConfig::default())
    }

    fn datasource(name: &str, display: &str) -> Datasource {
        Datasource::new(
            name,
            DatasourceSpec {
                name: display.to_string(),
                kind: DatasourceType::Postgres,
                host: "db".to_string(),
                port: 5432,
                database: Some("orders".to_string()),
                user: None,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion_timeout() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let lock = lock(coordinator);

        let first = lock.acquire("api").await.unwrap();
        let err = lock.acquire("api").await.err().unwrap();
        assert!(matches!(err, Error::LockTimeout(_)));

        first.release().await.unwrap();
        lock.acquire("api").await.unwrap().release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_acquires_after_release() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let lock = Arc::new(lock(coordinator));

        let first = lock.acquire("api").await.unwrap();
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("api").await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());
        first.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_is_kept_alive() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let lock = lock(coordinator);

        let first = lock.acquire("api").await.unwrap();
        // 超过 TTL 后仍由持有者续约，竞争者无法获取
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(lock.acquire("api").await.is_err());
        first.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_lock() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let lock = lock(coordinator);

        {
            let _guard = lock.acquire("application").await.unwrap();
        }
        tokio::task::yield_now().await;
        lock.acquire("application").await.unwrap().release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_categories_are_independent() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let lock = lock(coordinator);

        let api = lock.acquire("api").await.unwrap();
        let app = lock.acquire("application").await.unwrap();
        assert_ne!(api.key(), app.key());
        api.release().await.unwrap();
        app.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_unique_rejects_duplicate_display_name() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let lock = lock(coordinator);
        let store = MemoryStore::<Datasource>::new();

        create_unique(&lock, &store, datasource("ds-1", "订单库")).await.unwrap();
        let err = create_unique(&lock, &store, datasource("ds-2", "订单库")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        create_unique(&lock, &store, datasource("ds-3", "用户库")).await.unwrap();
        let all = store.list(None, &LabelSelector::everything()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_lease_marks_guard_lost() {
        let lock = DistributedLock::new(Arc::new(RevokedCoordinator), "replica-a", LockConfig::default());
        let guard = lock.acquire("api").await.unwrap();
        assert!(!guard.is_lost());

        let mut lost = guard.lost();
        tokio::time::timeout(Duration::from_secs(10), lost.wait_for(|lost| *lost))
            .await
            .unwrap()
            .unwrap();
        assert!(guard.is_lost());
        guard.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_unique_aborts_after_lease_lost() {
        let lock = DistributedLock::new(Arc::new(RevokedCoordinator), "replica-a", LockConfig::default());
        let store = SlowListStore(MemoryStore::new());

        let err = create_unique(&lock, &store, datasource("ds-1", "订单库")).await.unwrap_err();
        assert!(matches!(err, Error::Coordination(_)));
        assert!(store.0.get("default", "ds-1").await.unwrap_err().is_not_found());
    }
}

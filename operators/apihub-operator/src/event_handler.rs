//! 事件处理模块
//!
//! 每类资源一个监听任务：先订阅变更再全量列举，避免两者之间的变更丢失；
//! 之后每收到一条待处理记录的变更就派发一次协调。同一记录在本进程内
//! 同时只有一个协调任务，处理期间到达的新通知合并为一次重新协调。
//! 协调任务由监听任务持有，收到关闭信号后等待它们全部结束再退出。

use apihub_common::{LabelSelector, ManagedResource};
use apihub_controller::WatchEvent;
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::reconcile::{Handler, ReconcileOutcome, Reconciler};

/// 监听中断后重建的等待时间
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// 定期重新列举的间隔，补偿监听期间丢失的事件
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

type Key = (String, String);

/// 资源事件处理器
pub struct EventHandler<H: Handler> {
    /// 协调器
    reconciler: Arc<Reconciler<H>>,
    /// 并发上限
    permits: Arc<Semaphore>,
    /// 正在协调的记录，值表示处理期间是否又收到了通知
    in_flight: Arc<Mutex<HashMap<Key, bool>>>,
}

impl<H: Handler> EventHandler<H> {
    /// 创建新的事件处理器
    pub fn new(reconciler: Arc<Reconciler<H>>, concurrency: usize) -> Self {
        Self {
            reconciler,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 资源类型
    pub fn kind(&self) -> &'static str {
        self.reconciler.kind()
    }

    /// 启动监听任务
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// 持续监听直到收到关闭信号，监听中断后等待片刻重建
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.reconciler.kind();
        info!(kind, "启动资源监听器");
        let mut tasks = JoinSet::new();

        loop {
            let store = self.reconciler.store();
            let mut events = store.watch();
            self.resync(&mut tasks).await;

            let mut resync = tokio::time::interval(RESYNC_INTERVAL);
            resync.tick().await;

            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(WatchEvent::Added(obj))) | Some(Ok(WatchEvent::Changed(obj))) => {
                            if is_pending(&obj) {
                                self.dispatch(&mut tasks, obj.namespace_or_default(), obj.name_any()).await;
                            }
                        }
                        Some(Ok(WatchEvent::Deleted(obj))) => {
                            debug!(kind, name = %obj.name_any(), "记录已删除");
                        }
                        Some(Err(e)) => {
                            error!(kind, "资源监听器错误: {}", e);
                            break;
                        }
                        None => {
                            warn!(kind, "资源监听已结束");
                            break;
                        }
                    },
                    _ = resync.tick() => self.resync(&mut tasks).await,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => reap(kind, joined),
                    _ = shutdown.changed() => {
                        drain(kind, &mut tasks).await;
                        return;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RESTART_DELAY) => info!(kind, "重新启动资源监听器"),
                _ = shutdown.changed() => {
                    drain(kind, &mut tasks).await;
                    return;
                }
            }
        }
    }

    /// 列举全部记录并派发待处理的
    async fn resync(&self, tasks: &mut JoinSet<()>) {
        let kind = self.reconciler.kind();
        match self.reconciler.store().list(None, &LabelSelector::everything()).await {
            Ok(objs) => {
                let pending: Vec<_> = objs.into_iter().filter(is_pending).collect();
                if !pending.is_empty() {
                    debug!(kind, count = pending.len(), "列举到待处理记录");
                }
                for obj in pending {
                    self.dispatch(tasks, obj.namespace_or_default(), obj.name_any()).await;
                }
            }
            Err(e) => warn!(kind, "列举资源失败: {}", e),
        }
    }

    /// 派发一次协调；记录正在协调时只做标记，由当前任务结束后重新协调
    async fn dispatch(&self, tasks: &mut JoinSet<()>, namespace: String, name: String) {
        let key = (namespace, name);
        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(dirty) = in_flight.get_mut(&key) {
                *dirty = true;
                return;
            }
            in_flight.insert(key.clone(), false);
        }

        let reconciler = self.reconciler.clone();
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();
        tasks.spawn(async move {
            let (namespace, name) = &key;
            loop {
                let Ok(permit) = permits.acquire().await else {
                    in_flight.lock().await.remove(&key);
                    return;
                };
                match reconciler.reconcile(namespace, name).await {
                    Ok(ReconcileOutcome::Failed(message)) => {
                        debug!(kind = reconciler.kind(), namespace = %namespace, name = %name, "协调失败: {}", message)
                    }
                    Ok(outcome) => {
                        debug!(kind = reconciler.kind(), namespace = %namespace, name = %name, outcome = outcome.as_str(), "协调结束")
                    }
                    Err(e) => {
                        error!(kind = reconciler.kind(), namespace = %namespace, name = %name, "协调错误: {}", e)
                    }
                }
                drop(permit);

                let mut guard = in_flight.lock().await;
                if guard.get(&key).copied().unwrap_or(false) {
                    guard.insert(key.clone(), false);
                } else {
                    guard.remove(&key);
                    return;
                }
            }
        });
    }
}

fn reap(kind: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(kind, "协调任务异常退出: {}", e);
    }
}

/// 等待已派发的协调任务结束
async fn drain(kind: &str, tasks: &mut JoinSet<()>) {
    if !tasks.is_empty() {
        info!(kind, count = tasks.len(), "等待进行中的协调任务结束");
    }
    while let Some(joined) = tasks.join_next().await {
        reap(kind, joined);
    }
    info!(kind, "资源监听器已停止");
}

fn is_pending<K: ManagedResource>(obj: &K) -> bool {
    obj.common().map(|c| c.is_pending()).unwrap_or(false)
}

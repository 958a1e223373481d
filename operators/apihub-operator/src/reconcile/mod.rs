//! 资源协调模块
//!
//! 每类资源由一个 [`Handler`] 描述：状态转移表与各操作的具体实现。
//! [`Reconciler`] 负责通用流程：
//!
//! 1. 读取最新记录，只处理 `Init` 且带有动作的记录；
//! 2. 按 `(阶段, 动作)` 查表，表中不存在的组合记录日志后忽略；
//! 3. 以乐观并发写入 `Running`，冲突说明其他处理者已接手，本次放弃；
//! 4. 执行操作（网关调用先于状态推进）；
//! 5. 写入 `Success`（推进阶段）或 `Error`（阶段不变）。
//!
//! 引擎内部不做重试，失败的记录需要重新提交动作。

mod api;
mod application;
mod apply;
mod datasource;
mod serviceunit;
mod table;
mod trafficcontrol;

pub use api::{ApiHandler, ApiOp};
pub use application::{ApplicationHandler, ApplicationOp};
pub use apply::{ApplyHandler, ApplyOp};
pub use datasource::{DatasourceHandler, DatasourceOp};
pub use serviceunit::{ServiceUnitHandler, ServiceUnitOp};
pub use table::{NextPhase, StateTable, Transition};
pub use trafficcontrol::{TrafficcontrolHandler, TrafficcontrolOp};

use apihub_common::{
    Action, Desired, Error, ManagedResource, ProcessStatus, RelationKind, RelationSet, Result,
};
use apihub_controller::{modify, GatewayOperator, InFlight, ResourceStore, Stores};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metrics::OperatorMetrics;

/// 协调上下文
pub struct Context {
    /// 资源存储
    pub stores: Stores,
    /// 网关编排
    pub gateway: Arc<dyn GatewayOperator>,
    /// 指标
    pub metrics: Arc<OperatorMetrics>,
    /// 本进程正在协调的记录
    pub in_flight: Arc<InFlight>,
}

/// 单次协调的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 记录不存在或不需要处理
    Skipped,
    /// 当前阶段不支持该动作
    NoOp,
    /// 写入冲突，结果已交给其他处理者
    Conflict,
    /// 处理成功
    Succeeded,
    /// 处理失败，错误信息已写入状态
    Failed(String),
    /// 记录已删除
    Removed,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Skipped => "skipped",
            ReconcileOutcome::NoOp => "noop",
            ReconcileOutcome::Conflict => "conflict",
            ReconcileOutcome::Succeeded => "succeeded",
            ReconcileOutcome::Failed(_) => "failed",
            ReconcileOutcome::Removed => "removed",
        }
    }
}

/// 资源处理器
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// 处理的资源类型
    type Resource: ManagedResource;
    /// 状态转移表中的操作
    type Operation: Copy + fmt::Debug + Send + Sync + 'static;

    /// 资源所在的存储
    fn store(&self, ctx: &Context) -> Arc<dyn ResourceStore<Self::Resource>>;

    /// 状态转移表
    fn table(&self) -> &StateTable<Self::Operation>;

    /// 执行操作，成功时返回写入状态的消息
    async fn apply(&self, ctx: &Context, operation: Self::Operation, obj: &mut Self::Resource) -> Result<String>;

    /// 成功后仍需继续处理的动作，例如处理期间新增的关联标记
    fn follow_up(&self, _obj: &Self::Resource) -> Option<Action> {
        None
    }

    /// 最终写入冲突且记录仍由本次处理持有时，合并处理期间其他写入者的修改
    ///
    /// `started` 为写入 Running 后的记录，`latest` 为重新读取的记录。
    fn merge(&self, ours: Self::Resource, _started: &Self::Resource, _latest: &Self::Resource) -> Self::Resource {
        ours
    }
}

/// 通用协调器
pub struct Reconciler<H: Handler> {
    handler: H,
    ctx: Arc<Context>,
}

impl<H: Handler> Reconciler<H> {
    /// 创建新的协调器
    pub fn new(handler: H, ctx: Arc<Context>) -> Self {
        Self { handler, ctx }
    }

    pub fn kind(&self) -> &'static str {
        H::Resource::KIND.as_str()
    }

    pub fn store(&self) -> Arc<dyn ResourceStore<H::Resource>> {
        self.handler.store(&self.ctx)
    }

    /// 协调单个资源
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let kind = self.kind();
        self.ctx.metrics.reconcile_started(kind);
        let guard = self.ctx.in_flight.enter(H::Resource::KIND, namespace, name);
        let result = self.run(namespace, name).await;
        drop(guard);
        self.ctx.metrics.reconcile_finished(kind);

        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "error",
        };
        self.ctx.metrics.record_reconcile(kind, outcome);
        result
    }

    async fn run(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let kind = self.kind();
        let store = self.store();

        let obj = match store.get(namespace, name).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Ok(ReconcileOutcome::Skipped),
            Err(e) => return Err(e),
        };

        let Some(action) = obj.common().filter(|c| c.is_pending()).and_then(|c| c.action) else {
            debug!(kind, namespace, name, "记录无待处理动作");
            return Ok(ReconcileOutcome::Skipped);
        };

        let phase = obj.phase();
        let Some(transition) = self.handler.table().lookup(phase, action) else {
            info!(kind, namespace, name, action = %action, phase = ?phase, "当前阶段不支持该动作，忽略");
            return Ok(ReconcileOutcome::NoOp);
        };

        let mut running = obj;
        running.common_mut().start();
        let started = match store.update(running).await {
            Ok(started) => started,
            Err(e) if e.is_conflict() => {
                debug!(kind, namespace, name, "写入 Running 冲突，放弃本次处理");
                return Ok(ReconcileOutcome::Conflict);
            }
            Err(e) => return Err(e),
        };

        info!(kind, namespace, name, action = %action, operation = ?transition.operation, "开始处理");

        let mut current = started.clone();
        match self.handler.apply(&self.ctx, transition.operation, &mut current).await {
            Ok(message) => {
                if transition.next == NextPhase::Removed {
                    match store.delete(namespace, name).await {
                        Ok(()) => {
                            info!(kind, namespace, name, "记录已删除");
                            return Ok(ReconcileOutcome::Removed);
                        }
                        Err(e) if e.is_not_found() => return Ok(ReconcileOutcome::Removed),
                        Err(e) => {
                            let message = format!("删除记录失败: {}", e);
                            warn!(kind, namespace, name, "{}", message);
                            current.common_mut().fail(message.clone());
                            return self.finish(current, &started, action, ReconcileOutcome::Failed(message)).await;
                        }
                    }
                }

                if let NextPhase::To(next) = transition.next {
                    current.set_phase(next);
                }
                self.conclude(&mut current, message);
                info!(kind, namespace, name, action = %action, "处理成功");
                self.finish(current, &started, action, ReconcileOutcome::Succeeded).await
            }
            Err(e) => {
                let message = e.to_string();
                warn!(kind, namespace, name, action = %action, "处理失败: {}", message);
                current.common_mut().fail(message.clone());
                self.finish(current, &started, action, ReconcileOutcome::Failed(message)).await
            }
        }
    }

    /// 写入成功状态；仍有后续动作时重新排队
    fn conclude(&self, obj: &mut H::Resource, message: String) {
        match self.handler.follow_up(obj) {
            Some(next) => {
                debug!(kind = self.kind(), name = %obj.name_any(), action = %next, "存在后续动作，重新排队");
                let common = obj.common_mut();
                common.request(next);
                common.message = Some(message);
            }
            None => obj.common_mut().succeed(message),
        }
    }

    /// 写入终态
    ///
    /// 冲突时重新读取：记录仍处于本次处理的 Running 时合并后覆盖，否则丢弃本次结果。
    async fn finish(
        &self,
        obj: H::Resource,
        started: &H::Resource,
        action: Action,
        outcome: ReconcileOutcome,
    ) -> Result<ReconcileOutcome> {
        let kind = self.kind();
        let store = self.store();
        let namespace = obj.namespace_or_default();
        let name = obj.name_any();

        match store.update(obj.clone()).await {
            Ok(_) => return Ok(outcome),
            Err(e) if !e.is_conflict() => return Err(e),
            Err(_) => debug!(kind, namespace = %namespace, name = %name, "写入终态冲突，重新读取"),
        }

        let latest = match store.get(&namespace, &name).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => {
                warn!(kind, namespace = %namespace, name = %name, "记录已被删除，丢弃本次结果");
                return Ok(ReconcileOutcome::Conflict);
            }
            Err(e) => return Err(e),
        };

        let still_ours = latest
            .common()
            .map(|c| c.status == ProcessStatus::Running && c.action == Some(action))
            .unwrap_or(false);
        if !still_ours {
            warn!(kind, namespace = %namespace, name = %name, "记录已被其他处理者修改，丢弃本次结果");
            return Ok(ReconcileOutcome::Conflict);
        }

        let mut merged = self.handler.merge(obj, started, &latest);
        merged.meta_mut().resource_version = latest.resource_version();
        let succeeded = merged
            .common()
            .map(|c| c.status == ProcessStatus::Success)
            .unwrap_or(false);
        if succeeded {
            if let Some(next) = self.handler.follow_up(&merged) {
                let common = merged.common_mut();
                let message = common.message.take();
                common.request(next);
                common.message = message;
            }
        }

        match store.update(merged).await {
            Ok(_) => Ok(outcome),
            Err(e) if e.is_conflict() => {
                warn!(kind, namespace = %namespace, name = %name, "再次写入冲突，丢弃本次结果");
                Ok(ReconcileOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }
}

/// 关联标记对应的动作
pub fn relation_action(desired: Desired) -> Action {
    match desired {
        Desired::Bound => Action::Bind,
        Desired::Unbound => Action::UnBind,
    }
}

/// 存在未确认关联标记时的后续动作，绑定优先
pub(crate) fn pending_relation_action(relations: &RelationSet) -> Option<Action> {
    let pending = relations.pending();
    if pending.is_empty() {
        None
    } else if pending.iter().any(|f| f.desired == Desired::Bound) {
        Some(Action::Bind)
    } else {
        Some(Action::UnBind)
    }
}

/// 合并处理期间新增的关联标记
///
/// `latest` 中未确认、且处理开始时不存在的标记视为新增。
pub(crate) fn merge_relations(ours: &mut RelationSet, started: &RelationSet, latest: &RelationSet) {
    for flag in latest.pending() {
        if !started.iter().any(|f| f == &flag) {
            ours.flag(flag.kind, &flag.related_id, flag.desired);
        }
    }
}

/// 合并处理期间其他写入者对列表的增删
pub(crate) fn merge_list(ours: &mut Vec<String>, started: &[String], latest: &[String]) {
    ours.retain(|item| !started.contains(item) || latest.contains(item));
    for item in latest {
        if !started.contains(item) && !ours.contains(item) {
            ours.push(item.clone());
        }
    }
}

/// 合并处理期间其他写入者对映射的增删改
pub(crate) fn merge_map(
    ours: &mut BTreeMap<String, String>,
    started: &BTreeMap<String, String>,
    latest: &BTreeMap<String, String>,
) {
    for (key, value) in started {
        if !latest.contains_key(key) && ours.get(key) == Some(value) {
            ours.remove(key);
        }
    }
    for (key, value) in latest {
        if started.get(key) != Some(value) {
            ours.insert(key.clone(), value.clone());
        }
    }
}

/// 为关联资源写入关联标记并请求处理
///
/// 目标记录正在处理或已有其他待处理动作时只写入标记，由其处理完成后继续。
/// `reject_running` 为真时，目标处于 Running 直接返回错误。
pub(crate) async fn hand_relation<K, F>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
    relation: (RelationKind, &str, Desired),
    reject_running: bool,
    relations: F,
) -> Result<Option<K>>
where
    K: ManagedResource,
    F: Fn(&mut K) -> &mut RelationSet + Send + Sync,
{
    let (kind, related_id, desired) = relation;
    modify(store, namespace, name, |obj| {
        let running = obj
            .common()
            .map(|c| c.status == ProcessStatus::Running)
            .unwrap_or(false);
        if running && reject_running {
            return Err(Error::Invalid(format!("{} {} 正在处理中", K::KIND, name)));
        }

        relations(obj).flag(kind, related_id, desired);

        let common = obj.common_mut();
        if !running && !common.is_pending() {
            common.request(relation_action(desired));
        }
        Ok(true)
    })
    .await
}

/// 调整服务单元的 Api 计数，失败只记录日志
pub(crate) async fn adjust_api_count(ctx: &Context, namespace: &str, service_unit: &str, delta: i64) {
    let result = modify(&*ctx.stores.service_units, namespace, service_unit, |unit| {
        let status = unit.status.get_or_insert_with(Default::default);
        status.api_count = if delta >= 0 {
            status.api_count.saturating_add(delta as u64)
        } else {
            status.api_count.saturating_sub(delta.unsigned_abs())
        };
        Ok(true)
    })
    .await;

    match result {
        Ok(Some(unit)) => debug!(
            namespace,
            service_unit,
            api_count = unit.status.map(|s| s.api_count).unwrap_or(0),
            "服务单元 Api 计数已更新"
        ),
        Ok(None) => warn!(namespace, service_unit, "服务单元不存在，跳过计数更新"),
        Err(e) => warn!(namespace, service_unit, "更新服务单元 Api 计数失败: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apihub_common::{Trafficcontrol, TrafficcontrolSpec, LimitType, RateQuota};
    use apihub_controller::store::MemoryStore;

    fn trafficcontrol(name: &str) -> Trafficcontrol {
        let mut tc = Trafficcontrol::new(
            name,
            TrafficcontrolSpec {
                name: name.to_string(),
                limit_type: LimitType::Api,
                quota: RateQuota {
                    minute: Some(100),
                    ..Default::default()
                },
                apis: vec![],
                applications: vec![],
                relations: RelationSet::new(),
            },
        );
        tc.metadata.namespace = Some("default".to_string());
        tc
    }

    #[test]
    fn test_pending_relation_action_prefers_bind() {
        let mut set = RelationSet::new();
        assert_eq!(pending_relation_action(&set), None);
        set.flag(RelationKind::Api, "a", Desired::Unbound);
        assert_eq!(pending_relation_action(&set), Some(Action::UnBind));
        set.flag(RelationKind::Api, "b", Desired::Bound);
        assert_eq!(pending_relation_action(&set), Some(Action::Bind));
    }

    #[test]
    fn test_merge_relations_keeps_only_new_flags() {
        let mut started = RelationSet::new();
        started.flag(RelationKind::Api, "a", Desired::Bound);

        // 本次处理确认并清理了 a
        let mut ours = RelationSet::new();

        let mut latest = started.clone();
        latest.flag(RelationKind::Api, "b", Desired::Bound);

        merge_relations(&mut ours, &started, &latest);
        assert!(!ours.contains(RelationKind::Api, "a"));
        assert!(ours.contains(RelationKind::Api, "b"));
    }

    #[test]
    fn test_merge_list() {
        let started = vec!["a".to_string(), "b".to_string()];
        // 本次处理删除 a、新增 c；其他写入者删除 b、新增 d
        let mut ours = vec!["b".to_string(), "c".to_string()];
        let latest = vec!["a".to_string(), "d".to_string()];

        merge_list(&mut ours, &started, &latest);
        assert_eq!(ours, vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_merge_map() {
        let started = BTreeMap::from([("a".to_string(), "p1".to_string())]);
        let mut ours = BTreeMap::from([
            ("a".to_string(), "p1".to_string()),
            ("b".to_string(), "p2".to_string()),
        ]);
        let latest = BTreeMap::from([("c".to_string(), "p3".to_string())]);

        merge_map(&mut ours, &started, &latest);
        assert_eq!(ours.len(), 2);
        assert!(!ours.contains_key("a"));
        assert_eq!(ours["b"], "p2");
        assert_eq!(ours["c"], "p3");
    }

    #[tokio::test]
    async fn test_hand_relation_requests_action() {
        let store = MemoryStore::<Trafficcontrol>::new();
        store.create(trafficcontrol("gold")).await.unwrap();

        let tc = hand_relation(
            &store,
            "default",
            "gold",
            (RelationKind::Api, "orders", Desired::Bound),
            false,
            |tc: &mut Trafficcontrol| &mut tc.spec.relations,
        )
        .await
        .unwrap()
        .unwrap();

        assert!(tc.common().unwrap().is_pending());
        assert_eq!(tc.common().unwrap().action, Some(Action::Bind));
        assert_eq!(tc.spec.relations.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_hand_relation_does_not_interrupt_running() {
        let store = MemoryStore::<Trafficcontrol>::new();
        let mut tc = trafficcontrol("gold");
        tc.common_mut().request(Action::Update);
        tc.common_mut().start();
        store.create(tc).await.unwrap();

        let tc = hand_relation(
            &store,
            "default",
            "gold",
            (RelationKind::Api, "orders", Desired::Bound),
            false,
            |tc: &mut Trafficcontrol| &mut tc.spec.relations,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(tc.common().unwrap().status, ProcessStatus::Running);
        assert_eq!(tc.common().unwrap().action, Some(Action::Update));
        assert_eq!(tc.spec.relations.len(), 1);

        let err = hand_relation(
            &store,
            "default",
            "gold",
            (RelationKind::Api, "users", Desired::Bound),
            true,
            |tc: &mut Trafficcontrol| &mut tc.spec.relations,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}

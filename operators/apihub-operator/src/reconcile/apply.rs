//! 申请协调
//!
//! 申请审批通过后以 Bind/UnBind 动作进入引擎，引擎只负责把关联标记
//! 交给目标 Api，实际的网关变更由 Api 的协调完成。

use apihub_common::{
    Action, Api, Apply, ApplyTarget, Desired, Error, ManagedResource, Phase, RelationKind,
    ResourceKind, Result,
};
use apihub_controller::ResourceStore;
use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::info;

use super::{hand_relation, Context, Handler, NextPhase, StateTable};

/// 申请操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOp {
    /// 转交关联标记
    Hand(Desired),
    Delete,
}

pub struct ApplyHandler {
    table: StateTable<ApplyOp>,
}

impl ApplyHandler {
    pub fn new() -> Self {
        let any = [Phase::Any];
        let table = StateTable::new(ResourceKind::Apply)
            .on(&any, Action::Bind, ApplyOp::Hand(Desired::Bound), NextPhase::Stay)
            .on(&any, Action::UnBind, ApplyOp::Hand(Desired::Unbound), NextPhase::Stay)
            .on(&any, Action::Delete, ApplyOp::Delete, NextPhase::Removed);
        Self { table }
    }

    async fn hand(&self, ctx: &Context, apply: &Apply, desired: Desired) -> Result<String> {
        let namespace = apply.namespace_or_default();
        if apply.spec.is_expired(Utc::now()) {
            return Err(Error::Invalid("申请已过期".to_string()));
        }

        let app_id = apply.spec.app_id.as_str();
        let target_id = apply.spec.target_id.as_str();
        match ctx.stores.applications.get(&namespace, app_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(Error::Invalid(format!("应用 {} 不存在", app_id)));
            }
            Err(e) => return Err(e),
        }

        match apply.spec.target_type {
            ApplyTarget::Api => {
                let handed = hand_relation(
                    &*ctx.stores.apis,
                    &namespace,
                    target_id,
                    (RelationKind::Application, app_id, desired),
                    true,
                    |api: &mut Api| &mut api.spec.relations,
                )
                .await?;
                if handed.is_none() {
                    return Err(Error::Invalid(format!("Api {} 不存在", target_id)));
                }
            }
        }

        info!(
            namespace = %namespace,
            name = %apply.name_any(),
            app = app_id,
            api = target_id,
            desired = ?desired,
            "关联标记已转交"
        );
        Ok(format!("已转交 Api {}", target_id))
    }
}

impl Default for ApplyHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ApplyHandler {
    type Resource = Apply;
    type Operation = ApplyOp;

    fn store(&self, ctx: &Context) -> Arc<dyn ResourceStore<Apply>> {
        ctx.stores.applies.clone()
    }

    fn table(&self) -> &StateTable<ApplyOp> {
        &self.table
    }

    async fn apply(&self, ctx: &Context, operation: ApplyOp, apply: &mut Apply) -> Result<String> {
        match operation {
            ApplyOp::Hand(desired) => self.hand(ctx, apply, desired).await,
            ApplyOp::Delete => Ok("申请已删除".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_table() {
        let handler = ApplyHandler::new();
        let table = handler.table();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.lookup(Phase::Any, Action::UnBind).map(|t| t.operation),
            Some(ApplyOp::Hand(Desired::Unbound))
        );
        assert!(table.lookup(Phase::Any, Action::Publish).is_none());
    }
}

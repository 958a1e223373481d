//! 服务单元协调

use apihub_common::{
    Action, Api, Error, LabelSelector, ManagedResource, Phase, PublishStatus, Result, ServiceUnit,
    LABEL_SERVICE_UNIT,
};
use apihub_controller::gateway::ServiceRequest;
use apihub_controller::utils::gateway_name;
use apihub_controller::ResourceStore;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Context, Handler, NextPhase, StateTable};

/// 服务单元操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceUnitOp {
    Publish,
    Offline,
    UpdateLocal,
    UpdateRemote,
    Delete,
}

pub struct ServiceUnitHandler {
    table: StateTable<ServiceUnitOp>,
}

impl ServiceUnitHandler {
    pub fn new() -> Self {
        let unpublished = [Phase::UnRelease, Phase::Offlined];
        let released = [Phase::Released];

        let table = StateTable::new(apihub_common::ResourceKind::ServiceUnit)
            .on(&unpublished, Action::Publish, ServiceUnitOp::Publish, NextPhase::To(Phase::Released))
            .on(&released, Action::Offline, ServiceUnitOp::Offline, NextPhase::To(Phase::Offlined))
            .on(&unpublished, Action::Update, ServiceUnitOp::UpdateLocal, NextPhase::Stay)
            .on(&released, Action::Update, ServiceUnitOp::UpdateRemote, NextPhase::Stay)
            .on(&unpublished, Action::Delete, ServiceUnitOp::Delete, NextPhase::Removed);

        Self { table }
    }
}

impl Default for ServiceUnitHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ServiceUnitHandler {
    type Resource = ServiceUnit;
    type Operation = ServiceUnitOp;

    fn store(&self, ctx: &Context) -> Arc<dyn ResourceStore<ServiceUnit>> {
        ctx.stores.service_units.clone()
    }

    fn table(&self) -> &StateTable<ServiceUnitOp> {
        &self.table
    }

    async fn apply(&self, ctx: &Context, operation: ServiceUnitOp, unit: &mut ServiceUnit) -> Result<String> {
        let namespace = unit.namespace_or_default();
        let name = unit.name_any();

        match operation {
            ServiceUnitOp::Publish => {
                validate(unit)?;
                let existing = unit.status.as_ref().and_then(|s| s.service_id.clone());
                let service_id = match existing {
                    Some(id) => id,
                    None => {
                        let service = ctx.gateway.create_service(&service_request(&namespace, unit)).await?;
                        unit.status.get_or_insert_with(Default::default).service_id = Some(service.id.clone());
                        service.id
                    }
                };
                info!(namespace = %namespace, name = %name, service_id = %service_id, "服务单元已发布");
                Ok(format!("服务单元已发布，服务 {}", service_id))
            }
            ServiceUnitOp::Offline => {
                let released = referencing_apis(ctx, &namespace, &name, true).await?;
                if !released.is_empty() {
                    return Err(Error::Invalid(format!(
                        "服务单元仍有 {} 个已发布的 Api: {}",
                        released.len(),
                        released.join(", ")
                    )));
                }
                if let Some(service_id) = unit.status.as_ref().and_then(|s| s.service_id.clone()) {
                    ctx.gateway.delete_service(&service_id).await?;
                }
                unit.status.get_or_insert_with(Default::default).service_id = None;
                info!(namespace = %namespace, name = %name, "服务单元已下线");
                Ok("服务单元已下线".to_string())
            }
            ServiceUnitOp::UpdateLocal => {
                validate(unit)?;
                Ok("服务单元已更新".to_string())
            }
            ServiceUnitOp::UpdateRemote => {
                validate(unit)?;
                let service_id = unit
                    .status
                    .as_ref()
                    .and_then(|s| s.service_id.clone())
                    .ok_or_else(|| Error::Invalid(format!("服务单元 {} 缺少服务标识", name)))?;
                ctx.gateway
                    .update_service(&service_id, &service_request(&namespace, unit))
                    .await?;
                Ok("服务已更新".to_string())
            }
            ServiceUnitOp::Delete => {
                let apis = referencing_apis(ctx, &namespace, &name, false).await?;
                if !apis.is_empty() {
                    return Err(Error::Invalid(format!("服务单元仍被 Api 引用: {}", apis.join(", "))));
                }
                if let Some(service_id) = unit.status.as_ref().and_then(|s| s.service_id.clone()) {
                    warn!(namespace = %namespace, name = %name, service_id = %service_id, "删除残留服务");
                    ctx.gateway.delete_service(&service_id).await?;
                }
                Ok("服务单元已删除".to_string())
            }
        }
    }

    fn merge(&self, mut ours: ServiceUnit, _started: &ServiceUnit, latest: &ServiceUnit) -> ServiceUnit {
        if let (Some(status), Some(latest)) = (ours.status.as_mut(), latest.status.as_ref()) {
            status.api_count = latest.api_count;
        }
        ours
    }
}

fn validate(unit: &ServiceUnit) -> Result<()> {
    let url = unit.spec.url.as_str();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::Invalid(format!("服务单元 {} 的上游地址无效: {}", unit.spec.name, url)));
    }
    Ok(())
}

fn service_request(namespace: &str, unit: &ServiceUnit) -> ServiceRequest {
    ServiceRequest {
        name: gateway_name(namespace, &unit.name_any()),
        url: unit.spec.url.clone(),
    }
}

/// 引用该服务单元的 Api 名称，`released_only` 为真时只统计已发布的
async fn referencing_apis(ctx: &Context, namespace: &str, unit: &str, released_only: bool) -> Result<Vec<String>> {
    let apis: Vec<Api> = ctx
        .stores
        .apis
        .list(Some(namespace), &LabelSelector::everything().eq(LABEL_SERVICE_UNIT, unit))
        .await?;
    Ok(apis
        .into_iter()
        .filter(|api| api.spec.service_unit == unit)
        .filter(|api| {
            !released_only
                || api.status.as_ref().map(|s| s.publish_status) == Some(PublishStatus::Released)
        })
        .map(|api| api.name_any())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apihub_common::ServiceUnitSpec;

    #[test]
    fn test_validate_url() {
        let mut unit = ServiceUnit::new(
            "su1",
            ServiceUnitSpec {
                name: "订单服务".to_string(),
                url: "orders:8080".to_string(),
                datasource: None,
            },
        );
        assert!(validate(&unit).is_err());
        unit.spec.url = "http://orders:8080".to_string();
        assert!(validate(&unit).is_ok());
    }

    #[test]
    fn test_serviceunit_table() {
        let table = ServiceUnitHandler::new();
        let table = table.table();
        assert!(table.lookup(Phase::Released, Action::Delete).is_none());
        assert!(table.lookup(Phase::Released, Action::Publish).is_none());
        assert_eq!(
            table.lookup(Phase::Offlined, Action::Delete).map(|t| t.next),
            Some(NextPhase::Removed)
        );
    }
}

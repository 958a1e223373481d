//! 数据源协调

use apihub_common::{
    Action, Datasource, Error, LabelSelector, ManagedResource, Phase, ResourceKind, Result,
    ServiceUnit, LABEL_DATASOURCE,
};
use apihub_controller::ResourceStore;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;

use super::{Context, Handler, NextPhase, StateTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasourceOp {
    Validate,
    Delete,
}

pub struct DatasourceHandler {
    table: StateTable<DatasourceOp>,
}

impl DatasourceHandler {
    pub fn new() -> Self {
        let any = [Phase::Any];
        let table = StateTable::new(ResourceKind::Datasource)
            .on(&any, Action::Publish, DatasourceOp::Validate, NextPhase::Stay)
            .on(&any, Action::Update, DatasourceOp::Validate, NextPhase::Stay)
            .on(&any, Action::Delete, DatasourceOp::Delete, NextPhase::Removed);
        Self { table }
    }
}

impl Default for DatasourceHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for DatasourceHandler {
    type Resource = Datasource;
    type Operation = DatasourceOp;

    fn store(&self, ctx: &Context) -> Arc<dyn ResourceStore<Datasource>> {
        ctx.stores.datasources.clone()
    }

    fn table(&self) -> &StateTable<DatasourceOp> {
        &self.table
    }

    async fn apply(&self, ctx: &Context, operation: DatasourceOp, ds: &mut Datasource) -> Result<String> {
        match operation {
            DatasourceOp::Validate => {
                validate(ds)?;
                Ok("数据源配置有效".to_string())
            }
            DatasourceOp::Delete => {
                let namespace = ds.namespace_or_default();
                let name = ds.name_any();
                let units: Vec<ServiceUnit> = ctx
                    .stores
                    .service_units
                    .list(Some(&namespace), &LabelSelector::everything().eq(LABEL_DATASOURCE, &name))
                    .await?;
                let users: Vec<String> = units
                    .iter()
                    .filter(|su| su.spec.datasource.as_deref() == Some(name.as_str()))
                    .map(|su| su.name_any())
                    .collect();
                if !users.is_empty() {
                    return Err(Error::Invalid(format!("数据源仍被服务单元引用: {}", users.join(", "))));
                }
                Ok("数据源已删除".to_string())
            }
        }
    }
}

fn validate(ds: &Datasource) -> Result<()> {
    if ds.spec.name.trim().is_empty() {
        return Err(Error::Invalid("数据源名称不能为空".to_string()));
    }
    if ds.spec.host.trim().is_empty() {
        return Err(Error::Invalid(format!("数据源 {} 未配置主机地址", ds.spec.name)));
    }
    if ds.spec.port == 0 {
        return Err(Error::Invalid(format!("数据源 {} 的端口无效", ds.spec.name)));
    }
    Ok(())
}

//! 流控策略协调
//!
//! 流控策略没有发布阶段。绑定 Api 时在其路由上挂载限流插件，
//! 并在 Api 上记录策略引用；同一路由只保留一个限流插件，
//! 策略绑定期间 Api 自身的每秒上限不再生效。按应用或用户限流的策略
//! 还可以绑定应用，此时限流插件挂在应用的 consumer 上。

use apihub_common::{
    Action, Api, Desired, Error, LimitType, ManagedResource, Phase, ProcessStatus, RelationKind,
    ResourceKind, Result, Trafficcontrol,
};
use apihub_controller::gateway::PluginRequest;
use apihub_controller::{modify, ResourceStore};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    merge_list, merge_map, merge_relations, pending_relation_action, Context, Handler, NextPhase,
    StateTable,
};

/// 流控策略操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficcontrolOp {
    /// 处理 Api 关联标记
    Relate,
    /// 更新全部插件配置
    Update,
    /// 删除全部插件与记录
    Delete,
}

pub struct TrafficcontrolHandler {
    table: StateTable<TrafficcontrolOp>,
}

impl TrafficcontrolHandler {
    pub fn new() -> Self {
        let any = [Phase::Any];
        let table = StateTable::new(ResourceKind::Trafficcontrol)
            .on(&any, Action::Bind, TrafficcontrolOp::Relate, NextPhase::Stay)
            .on(&any, Action::UnBind, TrafficcontrolOp::Relate, NextPhase::Stay)
            .on(&any, Action::Update, TrafficcontrolOp::Update, NextPhase::Stay)
            .on(&any, Action::Delete, TrafficcontrolOp::Delete, NextPhase::Removed);
        Self { table }
    }

    async fn relate(&self, ctx: &Context, tc: &mut Trafficcontrol) -> Result<String> {
        let namespace = tc.namespace_or_default();
        let name = tc.name_any();

        for flag in tc.spec.relations.pending() {
            match (flag.kind, flag.desired) {
                (RelationKind::Api, Desired::Bound) => bind_api(ctx, tc, &namespace, &name, &flag.related_id).await?,
                (RelationKind::Api, Desired::Unbound) => {
                    unbind_api(ctx, tc, &namespace, &name, &flag.related_id).await?
                }
                (RelationKind::Application, Desired::Bound) => {
                    bind_application(ctx, tc, &namespace, &flag.related_id).await?
                }
                (RelationKind::Application, Desired::Unbound) => unbind_application(ctx, tc, &flag.related_id).await?,
            }
            tc.spec.relations.confirm(flag.kind, &flag.related_id);
            debug!(namespace = %namespace, name = %name, kind = ?flag.kind, related = %flag.related_id, desired = ?flag.desired, "关联已确认");
        }

        let settled = tc.spec.relations.clear_confirmed();
        tc.status.get_or_insert_with(Default::default).api_count = tc.spec.apis.len() as u64;
        Ok(format!("已处理 {} 条关联变更", settled))
    }

    async fn update(&self, ctx: &Context, tc: &mut Trafficcontrol) -> Result<String> {
        ensure_quota(tc)?;
        let request = PluginRequest::rate_limiting(tc.spec.limit_type, &tc.spec.quota);
        let plugins = tc.status.as_ref().map(|s| s.plugins.clone()).unwrap_or_default();
        for (api, plugin_id) in &plugins {
            ctx.gateway.update_plugin(plugin_id, &request).await?;
            debug!(name = %tc.name_any(), api = %api, plugin_id = %plugin_id, "限流插件已更新");
        }
        let consumer_plugins = tc
            .status
            .as_ref()
            .map(|s| s.consumer_plugins.clone())
            .unwrap_or_default();
        for (app, plugin_id) in &consumer_plugins {
            ctx.gateway.update_plugin(plugin_id, &request).await?;
            debug!(name = %tc.name_any(), app = %app, plugin_id = %plugin_id, "consumer 限流插件已更新");
        }
        Ok(format!("已更新 {} 个限流插件", plugins.len() + consumer_plugins.len()))
    }

    async fn delete(&self, ctx: &Context, tc: &mut Trafficcontrol) -> Result<String> {
        let namespace = tc.namespace_or_default();
        let name = tc.name_any();

        let plugins = tc.status.as_ref().map(|s| s.plugins.clone()).unwrap_or_default();
        for (api, plugin_id) in plugins {
            ctx.gateway.delete_plugin(&plugin_id).await?;
            if let Some(status) = tc.status.as_mut() {
                status.plugins.remove(&api);
            }
        }

        for api in tc.spec.apis.clone() {
            release_api(ctx, &namespace, &name, &api).await?;
        }

        for app in tc.spec.applications.clone() {
            unbind_application(ctx, tc, &app).await?;
        }

        info!(namespace = %namespace, name = %name, "流控策略已删除");
        Ok("流控策略已删除".to_string())
    }
}

impl Default for TrafficcontrolHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for TrafficcontrolHandler {
    type Resource = Trafficcontrol;
    type Operation = TrafficcontrolOp;

    fn store(&self, ctx: &Context) -> Arc<dyn ResourceStore<Trafficcontrol>> {
        ctx.stores.trafficcontrols.clone()
    }

    fn table(&self) -> &StateTable<TrafficcontrolOp> {
        &self.table
    }

    async fn apply(&self, ctx: &Context, operation: TrafficcontrolOp, tc: &mut Trafficcontrol) -> Result<String> {
        match operation {
            TrafficcontrolOp::Relate => self.relate(ctx, tc).await,
            TrafficcontrolOp::Update => self.update(ctx, tc).await,
            TrafficcontrolOp::Delete => self.delete(ctx, tc).await,
        }
    }

    fn follow_up(&self, tc: &Trafficcontrol) -> Option<Action> {
        pending_relation_action(&tc.spec.relations)
    }

    fn merge(&self, mut ours: Trafficcontrol, started: &Trafficcontrol, latest: &Trafficcontrol) -> Trafficcontrol {
        merge_relations(&mut ours.spec.relations, &started.spec.relations, &latest.spec.relations);
        merge_list(&mut ours.spec.apis, &started.spec.apis, &latest.spec.apis);
        merge_list(&mut ours.spec.applications, &started.spec.applications, &latest.spec.applications);

        let empty = Default::default();
        let started_plugins = started.status.as_ref().map(|s| &s.plugins).unwrap_or(&empty);
        let latest_plugins = latest.status.as_ref().map(|s| &s.plugins).unwrap_or(&empty);
        let started_consumers = started.status.as_ref().map(|s| &s.consumer_plugins).unwrap_or(&empty);
        let latest_consumers = latest.status.as_ref().map(|s| &s.consumer_plugins).unwrap_or(&empty);
        let status = ours.status.get_or_insert_with(Default::default);
        merge_map(&mut status.plugins, started_plugins, latest_plugins);
        merge_map(&mut status.consumer_plugins, started_consumers, latest_consumers);
        status.api_count = ours.spec.apis.len() as u64;
        ours
    }
}

fn ensure_quota(tc: &Trafficcontrol) -> Result<()> {
    if tc.spec.quota.is_empty() {
        return Err(Error::Invalid(format!("流控策略 {} 未配置任何周期的限额", tc.spec.name)));
    }
    Ok(())
}

async fn bind_api(ctx: &Context, tc: &mut Trafficcontrol, namespace: &str, name: &str, api_name: &str) -> Result<()> {
    ensure_quota(tc)?;

    let api: Api = ctx.stores.apis.get(namespace, api_name).await?;
    if let Some(other) = api.spec.trafficcontrol.as_deref().filter(|other| *other != name) {
        return Err(Error::Invalid(format!("Api {} 已绑定流控策略 {}", api_name, other)));
    }
    if api.common().map(|c| c.status == ProcessStatus::Running).unwrap_or(false) {
        return Err(Error::Invalid(format!("Api {} 正在处理中，请稍后重试", api_name)));
    }

    let route_id = api.status.as_ref().and_then(|s| s.route_id.clone());
    let has_plugin = tc
        .status
        .as_ref()
        .map(|s| s.plugins.contains_key(api_name))
        .unwrap_or(false);

    let mut created = None;
    if let (Some(route_id), false) = (route_id, has_plugin) {
        let request = PluginRequest::rate_limiting(tc.spec.limit_type, &tc.spec.quota);
        let plugin = ctx.gateway.add_route_plugin(&route_id, &request).await?;
        tc.status
            .get_or_insert_with(Default::default)
            .plugins
            .insert(api_name.to_string(), plugin.id.clone());
        created = Some(plugin.id);
    }

    if !tc.spec.apis.iter().any(|a| a == api_name) {
        tc.spec.apis.push(api_name.to_string());
    }

    let tc_name = name.to_string();
    modify(&*ctx.stores.apis, namespace, api_name, move |api| {
        api.spec.trafficcontrol = Some(tc_name.clone());
        // 同名插件按配置覆盖，Api 原有的每秒限流插件已被替换
        if created.is_some() {
            if let Some(status) = api.status.as_mut() {
                status.rate_plugin_id = None;
            }
        }
        Ok(true)
    })
    .await?;
    Ok(())
}

async fn unbind_api(ctx: &Context, tc: &mut Trafficcontrol, namespace: &str, name: &str, api_name: &str) -> Result<()> {
    let plugin_id = tc.status.as_ref().and_then(|s| s.plugins.get(api_name).cloned());
    if let Some(plugin_id) = plugin_id {
        ctx.gateway.delete_plugin(&plugin_id).await?;
        if let Some(status) = tc.status.as_mut() {
            status.plugins.remove(api_name);
        }
    }
    tc.spec.apis.retain(|a| a != api_name);
    release_api(ctx, namespace, name, api_name).await
}

/// 在应用的 consumer 上挂载限流插件，只有按应用或用户限流的策略可以绑定应用
async fn bind_application(ctx: &Context, tc: &mut Trafficcontrol, namespace: &str, app_name: &str) -> Result<()> {
    ensure_quota(tc)?;
    if !matches!(tc.spec.limit_type, LimitType::App | LimitType::User) {
        return Err(Error::Invalid(format!(
            "流控策略 {} 的限流维度 {:?} 不能绑定应用",
            tc.spec.name, tc.spec.limit_type
        )));
    }

    let has_plugin = tc
        .status
        .as_ref()
        .map(|s| s.consumer_plugins.contains_key(app_name))
        .unwrap_or(false);
    if !has_plugin {
        let app = ctx.stores.applications.get(namespace, app_name).await?;
        let consumer_id = app
            .status
            .and_then(|s| s.consumer_id)
            .ok_or_else(|| Error::Invalid(format!("应用 {} 尚未发布", app_name)))?;
        let request = PluginRequest::rate_limiting(tc.spec.limit_type, &tc.spec.quota);
        let plugin = ctx.gateway.add_consumer_plugin(&consumer_id, &request).await?;
        tc.status
            .get_or_insert_with(Default::default)
            .consumer_plugins
            .insert(app_name.to_string(), plugin.id);
    }

    if !tc.spec.applications.iter().any(|a| a == app_name) {
        tc.spec.applications.push(app_name.to_string());
    }
    Ok(())
}

async fn unbind_application(ctx: &Context, tc: &mut Trafficcontrol, app_name: &str) -> Result<()> {
    let plugin_id = tc.status.as_ref().and_then(|s| s.consumer_plugins.get(app_name).cloned());
    if let Some(plugin_id) = plugin_id {
        ctx.gateway.delete_plugin(&plugin_id).await?;
        if let Some(status) = tc.status.as_mut() {
            status.consumer_plugins.remove(app_name);
        }
    }
    tc.spec.applications.retain(|a| a != app_name);
    Ok(())
}

/// 清除 Api 上的策略引用；已发布且配置了每秒上限的 Api 恢复自身的限流插件
async fn release_api(ctx: &Context, namespace: &str, name: &str, api_name: &str) -> Result<()> {
    let api = match ctx.stores.apis.get(namespace, api_name).await {
        Ok(api) => api,
        Err(e) if e.is_not_found() => {
            debug!(namespace, api = api_name, "Api 已不存在，跳过");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if api.spec.trafficcontrol.as_deref() != Some(name) {
        return Ok(());
    }

    let mut restored = None;
    let route_id = api.status.as_ref().and_then(|s| s.route_id.clone());
    if let (Some(route_id), Some(rate)) = (route_id, api.spec.rate) {
        let plugin = ctx
            .gateway
            .add_route_plugin(&route_id, &PluginRequest::per_second(rate))
            .await?;
        restored = Some(plugin.id);
    }

    let tc_name = name.to_string();
    modify(&*ctx.stores.apis, namespace, api_name, move |api| {
        if api.spec.trafficcontrol.as_deref() != Some(tc_name.as_str()) {
            return Ok(false);
        }
        api.spec.trafficcontrol = None;
        if let Some(plugin_id) = restored.clone() {
            api.status.get_or_insert_with(Default::default).rate_plugin_id = Some(plugin_id);
        }
        Ok(true)
    })
    .await?;
    Ok(())
}

//! Api 协调
//!
//! 发布时在网关上创建路由并挂载 ACL 与限流插件，下线时删除路由，
//! 绑定/解绑时维护应用的 ACL 分组成员关系。

use apihub_common::{
    Action, Api, ApiSpec, Desired, Error, ManagedResource, Phase, PublishStatus, RelationKind,
    ResourceKind, Result,
};
use apihub_controller::gateway::{ObjectRef, PluginRequest, RouteRequest};
use apihub_controller::utils::{acl_group, gateway_name};
use apihub_controller::{modify, ResourceStore};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    adjust_api_count, merge_list, merge_relations, pending_relation_action, Context, Handler,
    NextPhase, StateTable,
};

/// Api 操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOp {
    /// 创建路由并挂载插件
    Publish,
    /// 删除路由
    Offline,
    /// 未发布时只更新本地记录
    UpdateLocal,
    /// 已发布时同步更新路由
    UpdateRemote,
    /// 清理残留并删除记录
    Delete,
    /// 已发布时同步网关 ACL
    BindRemote,
    /// 未发布时只维护本地关联
    BindLocal,
}

/// Api 处理器
pub struct ApiHandler {
    table: StateTable<ApiOp>,
}

impl ApiHandler {
    pub fn new() -> Self {
        let unpublished = [Phase::UnRelease, Phase::Offlined];
        let released = [Phase::Released];

        let table = StateTable::new(ResourceKind::Api)
            .on(&unpublished, Action::Publish, ApiOp::Publish, NextPhase::To(Phase::Released))
            .on(&released, Action::Offline, ApiOp::Offline, NextPhase::To(Phase::Offlined))
            .on(&unpublished, Action::Update, ApiOp::UpdateLocal, NextPhase::Stay)
            .on(&released, Action::Update, ApiOp::UpdateRemote, NextPhase::Stay)
            .on(&unpublished, Action::Delete, ApiOp::Delete, NextPhase::Removed)
            .on(&released, Action::Bind, ApiOp::BindRemote, NextPhase::Stay)
            .on(&released, Action::UnBind, ApiOp::BindRemote, NextPhase::Stay)
            .on(&unpublished, Action::Bind, ApiOp::BindLocal, NextPhase::Stay)
            .on(&unpublished, Action::UnBind, ApiOp::BindLocal, NextPhase::Stay);

        Self { table }
    }

    async fn publish(&self, ctx: &Context, api: &mut Api) -> Result<String> {
        validate(&api.spec)?;
        let namespace = api.namespace_or_default();
        let name = api.name_any();

        let service_id = released_service_id(ctx, &namespace, &api.spec.service_unit).await?;
        let request = route_request(&namespace, &name, &api.spec, &service_id);

        let route_id = match api.status.as_ref().and_then(|s| s.route_id.clone()) {
            Some(route_id) => {
                debug!(namespace = %namespace, name = %name, route_id = %route_id, "复用已创建的路由");
                route_id
            }
            None => {
                let route = ctx.gateway.create_route(&request).await?;
                api.status.get_or_insert_with(Default::default).route_id = Some(route.id.clone());
                route.id
            }
        };

        // 路由不能在没有 ACL 的情况下对外暴露，ACL 创建失败时撤回路由
        let group = acl_group(&namespace, &name);
        if api.status.as_ref().and_then(|s| s.acl_plugin_id.as_ref()).is_none() {
            match ctx
                .gateway
                .add_route_plugin(&route_id, &PluginRequest::acl(vec![group.clone()]))
                .await
            {
                Ok(plugin) => {
                    api.status.get_or_insert_with(Default::default).acl_plugin_id = Some(plugin.id);
                }
                Err(e) => {
                    match ctx.gateway.delete_route(&route_id).await {
                        Ok(()) => {
                            api.status.get_or_insert_with(Default::default).route_id = None;
                            warn!(namespace = %namespace, name = %name, route_id = %route_id, "ACL 创建失败，已撤回路由");
                        }
                        Err(err) => {
                            warn!(namespace = %namespace, name = %name, route_id = %route_id, "ACL 创建失败且撤回路由失败: {}", err)
                        }
                    }
                    return Err(e);
                }
            }
        }

        // 绑定了流控策略时由策略提供限流插件，同一路由只能有一个限流插件
        match api.spec.trafficcontrol.clone() {
            Some(trafficcontrol) => {
                attach_trafficcontrol(ctx, &namespace, &name, &trafficcontrol, &route_id).await?;
            }
            None => {
                if let Some(rate) = api.spec.rate {
                    if api.status.as_ref().and_then(|s| s.rate_plugin_id.as_ref()).is_none() {
                        let plugin = ctx
                            .gateway
                            .add_route_plugin(&route_id, &PluginRequest::per_second(rate))
                            .await?;
                        api.status.get_or_insert_with(Default::default).rate_plugin_id = Some(plugin.id);
                    }
                }
            }
        }

        for app_name in api.spec.applications.clone() {
            match consumer_of(ctx, &namespace, &app_name).await? {
                Some(Some(consumer_id)) => {
                    ctx.gateway.add_consumer_acl(&consumer_id, &group).await?;
                }
                _ => debug!(namespace = %namespace, app = %app_name, "应用尚未发布，跳过 ACL"),
            }
        }

        let status = api.status.get_or_insert_with(Default::default);
        if !status.counted {
            status.counted = true;
            adjust_api_count(ctx, &namespace, &api.spec.service_unit, 1).await;
        }

        info!(namespace = %namespace, name = %name, route_id = %route_id, "Api 已发布");
        Ok(format!("Api 已发布，路由 {}", route_id))
    }

    async fn offline(&self, ctx: &Context, api: &mut Api) -> Result<String> {
        let namespace = api.namespace_or_default();
        let name = api.name_any();

        // 删除路由时网关一并删除挂载在路由上的插件
        if let Some(route_id) = api.status.as_ref().and_then(|s| s.route_id.clone()) {
            ctx.gateway.delete_route(&route_id).await?;
        }

        let status = api.status.get_or_insert_with(Default::default);
        status.route_id = None;
        status.acl_plugin_id = None;
        status.rate_plugin_id = None;

        if let Some(trafficcontrol) = api.spec.trafficcontrol.clone() {
            detach_plugin_record(ctx, &namespace, &name, &trafficcontrol).await;
        }

        let status = api.status.get_or_insert_with(Default::default);
        if status.counted {
            status.counted = false;
            adjust_api_count(ctx, &namespace, &api.spec.service_unit, -1).await;
        }

        info!(namespace = %namespace, name = %name, "Api 已下线");
        Ok("Api 已下线".to_string())
    }

    async fn update_remote(&self, ctx: &Context, api: &mut Api) -> Result<String> {
        validate(&api.spec)?;
        let namespace = api.namespace_or_default();
        let name = api.name_any();

        let route_id = api
            .status
            .as_ref()
            .and_then(|s| s.route_id.clone())
            .ok_or_else(|| Error::Invalid(format!("Api {} 缺少路由标识", name)))?;
        let service_id = released_service_id(ctx, &namespace, &api.spec.service_unit).await?;
        ctx.gateway
            .update_route(&route_id, &route_request(&namespace, &name, &api.spec, &service_id))
            .await?;

        if api.spec.trafficcontrol.is_none() {
            let existing = api.status.as_ref().and_then(|s| s.rate_plugin_id.clone());
            let plugin_id = match (api.spec.rate, existing) {
                (Some(rate), Some(id)) => {
                    ctx.gateway.update_plugin(&id, &PluginRequest::per_second(rate)).await?;
                    Some(id)
                }
                (Some(rate), None) => {
                    let plugin = ctx
                        .gateway
                        .add_route_plugin(&route_id, &PluginRequest::per_second(rate))
                        .await?;
                    Some(plugin.id)
                }
                (None, Some(id)) => {
                    ctx.gateway.delete_plugin(&id).await?;
                    None
                }
                (None, None) => None,
            };
            api.status.get_or_insert_with(Default::default).rate_plugin_id = plugin_id;
        }

        Ok("路由已更新".to_string())
    }

    async fn delete(&self, ctx: &Context, api: &mut Api) -> Result<String> {
        let namespace = api.namespace_or_default();
        let name = api.name_any();

        if let Some(route_id) = api.status.as_ref().and_then(|s| s.route_id.clone()) {
            warn!(namespace = %namespace, name = %name, route_id = %route_id, "删除残留路由");
            ctx.gateway.delete_route(&route_id).await?;
            api.status.get_or_insert_with(Default::default).route_id = None;
        }

        if let Some(trafficcontrol) = api.spec.trafficcontrol.clone() {
            let api_name = name.clone();
            modify(&*ctx.stores.trafficcontrols, &namespace, &trafficcontrol, move |tc| {
                tc.spec.apis.retain(|a| a != &api_name);
                tc.spec.relations.remove(RelationKind::Api, &api_name);
                if let Some(status) = tc.status.as_mut() {
                    status.plugins.remove(&api_name);
                }
                Ok(true)
            })
            .await?;
        }

        let group = acl_group(&namespace, &name);
        for app_name in api.spec.applications.clone() {
            if let Some(Some(consumer_id)) = consumer_of(ctx, &namespace, &app_name).await? {
                ctx.gateway.remove_consumer_acl(&consumer_id, &group).await?;
            }
            let api_name = name.clone();
            modify(&*ctx.stores.applications, &namespace, &app_name, move |app| {
                app.spec.apis.retain(|a| a != &api_name);
                Ok(true)
            })
            .await?;
        }

        if api.status.as_ref().map(|s| s.counted).unwrap_or(false) {
            adjust_api_count(ctx, &namespace, &api.spec.service_unit, -1).await;
        }

        Ok("Api 已删除".to_string())
    }

    /// 处理应用关联标记，`remote` 为真时同步网关 ACL
    async fn bind(&self, ctx: &Context, api: &mut Api, remote: bool) -> Result<String> {
        let namespace = api.namespace_or_default();
        let name = api.name_any();
        let group = acl_group(&namespace, &name);

        for flag in api.spec.relations.pending() {
            if flag.kind != RelationKind::Application {
                warn!(namespace = %namespace, name = %name, kind = ?flag.kind, "忽略不支持的关联类型");
                api.spec.relations.confirm(flag.kind, &flag.related_id);
                continue;
            }

            let app_name = flag.related_id.as_str();
            match flag.desired {
                Desired::Bound => {
                    let consumer = consumer_of(ctx, &namespace, app_name)
                        .await?
                        .ok_or_else(|| Error::not_found(ResourceKind::Application, &namespace, app_name));
                    if remote {
                        let consumer_id = consumer?
                            .ok_or_else(|| Error::Invalid(format!("应用 {} 尚未发布", app_name)))?;
                        ctx.gateway.add_consumer_acl(&consumer_id, &group).await?;
                    } else {
                        consumer?;
                    }

                    if !api.spec.applications.iter().any(|a| a == app_name) {
                        api.spec.applications.push(app_name.to_string());
                    }
                    let api_name = name.clone();
                    modify(&*ctx.stores.applications, &namespace, app_name, move |app| {
                        if app.spec.apis.contains(&api_name) {
                            return Ok(false);
                        }
                        app.spec.apis.push(api_name.clone());
                        Ok(true)
                    })
                    .await?;
                }
                Desired::Unbound => {
                    if remote {
                        if let Some(Some(consumer_id)) = consumer_of(ctx, &namespace, app_name).await? {
                            ctx.gateway.remove_consumer_acl(&consumer_id, &group).await?;
                        }
                    }

                    api.spec.applications.retain(|a| a != app_name);
                    let api_name = name.clone();
                    modify(&*ctx.stores.applications, &namespace, app_name, move |app| {
                        let before = app.spec.apis.len();
                        app.spec.apis.retain(|a| a != &api_name);
                        Ok(app.spec.apis.len() != before)
                    })
                    .await?;
                }
            }

            api.spec.relations.confirm(RelationKind::Application, app_name);
            debug!(namespace = %namespace, name = %name, app = %app_name, desired = ?flag.desired, "关联已确认");
        }

        let settled = api.spec.relations.clear_confirmed();
        Ok(format!("已处理 {} 条关联变更", settled))
    }
}

impl Default for ApiHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ApiHandler {
    type Resource = Api;
    type Operation = ApiOp;

    fn store(&self, ctx: &Context) -> Arc<dyn ResourceStore<Api>> {
        ctx.stores.apis.clone()
    }

    fn table(&self) -> &StateTable<ApiOp> {
        &self.table
    }

    async fn apply(&self, ctx: &Context, operation: ApiOp, api: &mut Api) -> Result<String> {
        match operation {
            ApiOp::Publish => self.publish(ctx, api).await,
            ApiOp::Offline => self.offline(ctx, api).await,
            ApiOp::UpdateLocal => {
                validate(&api.spec)?;
                Ok("Api 已更新".to_string())
            }
            ApiOp::UpdateRemote => self.update_remote(ctx, api).await,
            ApiOp::Delete => self.delete(ctx, api).await,
            ApiOp::BindRemote => self.bind(ctx, api, true).await,
            ApiOp::BindLocal => self.bind(ctx, api, false).await,
        }
    }

    fn follow_up(&self, api: &Api) -> Option<Action> {
        pending_relation_action(&api.spec.relations)
    }

    fn merge(&self, mut ours: Api, started: &Api, latest: &Api) -> Api {
        merge_relations(&mut ours.spec.relations, &started.spec.relations, &latest.spec.relations);
        merge_list(
            &mut ours.spec.applications,
            &started.spec.applications,
            &latest.spec.applications,
        );
        if latest.spec.trafficcontrol != started.spec.trafficcontrol {
            ours.spec.trafficcontrol = latest.spec.trafficcontrol.clone();
        }
        if let (Some(status), Some(latest)) = (ours.status.as_mut(), latest.status.as_ref()) {
            status.called_count = latest.called_count;
        }
        ours
    }
}

fn validate(spec: &ApiSpec) -> Result<()> {
    if spec.paths.is_empty() {
        return Err(Error::Invalid(format!("Api {} 未配置请求路径", spec.name)));
    }
    if spec.paths.iter().any(|p| !p.starts_with('/')) {
        return Err(Error::Invalid(format!("Api {} 的请求路径必须以 / 开头", spec.name)));
    }
    Ok(())
}

fn route_request(namespace: &str, name: &str, spec: &ApiSpec, service_id: &str) -> RouteRequest {
    RouteRequest {
        name: gateway_name(namespace, name),
        service: ObjectRef {
            id: service_id.to_string(),
        },
        protocols: spec.protocols.clone(),
        paths: spec.paths.clone(),
        methods: spec.methods.clone(),
    }
}

/// 已发布服务单元的网关服务标识
async fn released_service_id(ctx: &Context, namespace: &str, service_unit: &str) -> Result<String> {
    let unit = match ctx.stores.service_units.get(namespace, service_unit).await {
        Ok(unit) => unit,
        Err(e) if e.is_not_found() => {
            return Err(Error::Invalid(format!("服务单元 {} 不存在", service_unit)));
        }
        Err(e) => return Err(e),
    };

    unit.status
        .as_ref()
        .filter(|s| s.publish_status == PublishStatus::Released)
        .and_then(|s| s.service_id.clone())
        .ok_or_else(|| Error::Invalid(format!("服务单元 {} 未发布", service_unit)))
}

/// 应用的 consumer 标识；应用不存在时返回 `None`，未发布时返回 `Some(None)`
async fn consumer_of(ctx: &Context, namespace: &str, app: &str) -> Result<Option<Option<String>>> {
    match ctx.stores.applications.get(namespace, app).await {
        Ok(app) => Ok(Some(app.status.and_then(|s| s.consumer_id))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// 在路由上挂载流控策略的限流插件并登记
async fn attach_trafficcontrol(
    ctx: &Context,
    namespace: &str,
    api: &str,
    trafficcontrol: &str,
    route_id: &str,
) -> Result<()> {
    let tc = match ctx.stores.trafficcontrols.get(namespace, trafficcontrol).await {
        Ok(tc) => tc,
        Err(e) if e.is_not_found() => {
            warn!(namespace, api, trafficcontrol, "流控策略不存在，跳过限流插件");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if tc.spec.quota.is_empty() {
        warn!(namespace, api, trafficcontrol, "流控策略未配置限额，跳过限流插件");
        return Ok(());
    }

    let request = PluginRequest::rate_limiting(tc.spec.limit_type, &tc.spec.quota);
    let plugin = ctx.gateway.add_route_plugin(route_id, &request).await?;

    let api_name = api.to_string();
    modify(&*ctx.stores.trafficcontrols, namespace, trafficcontrol, move |tc| {
        tc.status
            .get_or_insert_with(Default::default)
            .plugins
            .insert(api_name.clone(), plugin.id.clone());
        if !tc.spec.apis.contains(&api_name) {
            tc.spec.apis.push(api_name.clone());
        }
        Ok(true)
    })
    .await?;
    Ok(())
}

/// 路由删除后插件随之删除，只需清理流控策略上的登记
async fn detach_plugin_record(ctx: &Context, namespace: &str, api: &str, trafficcontrol: &str) {
    let api_name = api.to_string();
    let result = modify(&*ctx.stores.trafficcontrols, namespace, trafficcontrol, move |tc| {
        Ok(tc
            .status
            .as_mut()
            .map(|s| s.plugins.remove(&api_name).is_some())
            .unwrap_or(false))
    })
    .await;
    if let Err(e) = result {
        warn!(namespace, api, trafficcontrol, "清理流控插件登记失败: {}", e);
    }
}

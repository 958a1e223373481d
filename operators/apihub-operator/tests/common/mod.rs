//! 集成测试共用的内存网关与资源构造函数

#![allow(dead_code)]

use apihub_common::{
    Action, Api, ApiSpec, Application, ApplicationSpec, Apply, ApplySpec, ApplyTarget, Datasource,
    DatasourceSpec, DatasourceType, Error, LimitType, ManagedResource, PublishStatus, RateQuota,
    RelationSet, Result, ServiceUnit, ServiceUnitSpec, Trafficcontrol, TrafficcontrolSpec,
};
use apihub_controller::gateway::{
    AclInfo, ConsumerInfo, ConsumerRequest, JwtCredential, JwtRequest, PluginInfo, PluginRequest,
    RouteInfo, RouteRequest, ServiceInfo, ServiceRequest,
};
use apihub_controller::{GatewayOperator, InFlight, Stores, Telemetry};
use apihub_operator::metrics::OperatorMetrics;
use apihub_operator::reconcile::Context;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NS: &str = "default";

/// 网关上的插件
#[derive(Debug, Clone)]
pub struct FakePlugin {
    /// 挂载对象：路由或 consumer 的 ID
    pub scope: String,
    pub request: PluginRequest,
}

#[derive(Debug, Default)]
pub struct GatewayState {
    pub services: BTreeMap<String, ServiceRequest>,
    pub routes: BTreeMap<String, RouteRequest>,
    pub plugins: BTreeMap<String, FakePlugin>,
    pub consumers: BTreeMap<String, ConsumerRequest>,
    pub acls: BTreeMap<String, BTreeSet<String>>,
    pub jwts: BTreeMap<String, JwtCredential>,
    pub calls: usize,
    next_id: u64,
}

impl GatewayState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// 行为与 Kong 管理接口一致的内存网关
///
/// 同名创建返回已有对象，删除不存在的对象视为成功，删除路由或 consumer
/// 时一并删除挂载在其上的插件。
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
    failure: Mutex<Option<u16>>,
    plugin_failure: Mutex<Option<(String, u16)>>,
    latency: Mutex<Duration>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 之后的每次调用都返回指定状态码，`None` 恢复正常
    pub fn set_failure(&self, status: Option<u16>) {
        *self.failure.lock().unwrap() = status;
    }

    /// 之后创建指定名称的插件时返回该状态码
    pub fn fail_plugin(&self, name: &str, status: u16) {
        *self.plugin_failure.lock().unwrap() = Some((name.to_string(), status));
    }

    /// 创建服务前等待的时长
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    async fn pause(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn state<T>(&self, f: impl FnOnce(&GatewayState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    pub fn calls(&self) -> usize {
        self.state(|s| s.calls)
    }

    pub fn route_count(&self) -> usize {
        self.state(|s| s.routes.len())
    }

    /// 挂载在指定对象上的插件名称
    pub fn plugins_on(&self, scope: &str) -> Vec<String> {
        self.state(|s| {
            s.plugins
                .values()
                .filter(|p| p.scope == scope)
                .map(|p| p.request.name.clone())
                .collect()
        })
    }

    pub fn plugin(&self, id: &str) -> Option<FakePlugin> {
        self.state(|s| s.plugins.get(id).cloned())
    }

    pub fn groups_of(&self, consumer_id: &str) -> BTreeSet<String> {
        self.state(|s| s.acls.get(consumer_id).cloned().unwrap_or_default())
    }

    fn enter(&self) -> Result<std::sync::MutexGuard<'_, GatewayState>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if let Some(status) = *self.failure.lock().unwrap() {
            return Err(Error::GatewayStatus {
                status,
                body: "injected".to_string(),
            });
        }
        Ok(state)
    }
}

fn not_found(path: &str) -> Error {
    Error::GatewayStatus {
        status: 404,
        body: format!("{} not found", path),
    }
}

#[async_trait]
impl GatewayOperator for FakeGateway {
    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceInfo> {
        self.pause().await;
        let mut state = self.enter()?;
        let existing = state.services.iter().find(|(_, s)| s.name == request.name).map(|(id, _)| id.clone());
        let id = match existing {
            Some(id) => id,
            None => {
                let id = state.id("svc");
                state.services.insert(id.clone(), request.clone());
                id
            }
        };
        Ok(ServiceInfo { id, name: Some(request.name.clone()) })
    }

    async fn update_service(&self, id: &str, request: &ServiceRequest) -> Result<ServiceInfo> {
        let mut state = self.enter()?;
        let service = state.services.get_mut(id).ok_or_else(|| not_found("service"))?;
        *service = request.clone();
        Ok(ServiceInfo { id: id.to_string(), name: Some(request.name.clone()) })
    }

    async fn delete_service(&self, id: &str) -> Result<()> {
        let mut state = self.enter()?;
        state.services.remove(id);
        Ok(())
    }

    async fn create_route(&self, request: &RouteRequest) -> Result<RouteInfo> {
        let mut state = self.enter()?;
        if !state.services.contains_key(&request.service.id) {
            return Err(Error::GatewayStatus { status: 400, body: "unknown service".to_string() });
        }
        let existing = state.routes.iter().find(|(_, r)| r.name == request.name).map(|(id, _)| id.clone());
        let id = match existing {
            Some(id) => id,
            None => {
                let id = state.id("route");
                state.routes.insert(id.clone(), request.clone());
                id
            }
        };
        Ok(RouteInfo {
            id,
            hosts: None,
            protocols: request.protocols.clone(),
            paths: Some(request.paths.clone()),
        })
    }

    async fn update_route(&self, id: &str, request: &RouteRequest) -> Result<RouteInfo> {
        let mut state = self.enter()?;
        let route = state.routes.get_mut(id).ok_or_else(|| not_found("route"))?;
        *route = request.clone();
        Ok(RouteInfo {
            id: id.to_string(),
            hosts: None,
            protocols: request.protocols.clone(),
            paths: Some(request.paths.clone()),
        })
    }

    async fn delete_route(&self, id: &str) -> Result<()> {
        let mut state = self.enter()?;
        state.routes.remove(id);
        state.plugins.retain(|_, p| p.scope != id);
        Ok(())
    }

    async fn add_route_plugin(&self, route_id: &str, request: &PluginRequest) -> Result<PluginInfo> {
        let mut state = self.enter()?;
        if !state.routes.contains_key(route_id) {
            return Err(not_found("route"));
        }
        if let Some((name, status)) = self.plugin_failure.lock().unwrap().clone() {
            if name == request.name {
                return Err(Error::GatewayStatus { status, body: "injected".to_string() });
            }
        }
        add_plugin(&mut state, route_id, request)
    }

    async fn add_consumer_plugin(&self, consumer_id: &str, request: &PluginRequest) -> Result<PluginInfo> {
        let mut state = self.enter()?;
        if !state.consumers.contains_key(consumer_id) {
            return Err(not_found("consumer"));
        }
        add_plugin(&mut state, consumer_id, request)
    }

    async fn update_plugin(&self, id: &str, request: &PluginRequest) -> Result<PluginInfo> {
        let mut state = self.enter()?;
        let plugin = state.plugins.get_mut(id).ok_or_else(|| not_found("plugin"))?;
        plugin.request = request.clone();
        Ok(PluginInfo { id: id.to_string(), name: Some(request.name.clone()) })
    }

    async fn delete_plugin(&self, id: &str) -> Result<()> {
        let mut state = self.enter()?;
        state.plugins.remove(id);
        Ok(())
    }

    async fn create_consumer(&self, request: &ConsumerRequest) -> Result<ConsumerInfo> {
        let mut state = self.enter()?;
        let existing = state
            .consumers
            .iter()
            .find(|(_, c)| c.username == request.username)
            .map(|(id, _)| id.clone());
        let id = match existing {
            Some(id) => id,
            None => {
                let id = state.id("consumer");
                state.consumers.insert(id.clone(), request.clone());
                id
            }
        };
        Ok(ConsumerInfo { id, username: Some(request.username.clone()) })
    }

    async fn delete_consumer(&self, id: &str) -> Result<()> {
        let mut state = self.enter()?;
        state.consumers.remove(id);
        state.acls.remove(id);
        state.jwts.remove(id);
        state.plugins.retain(|_, p| p.scope != id);
        Ok(())
    }

    async fn create_jwt_credential(&self, consumer_id: &str, request: &JwtRequest) -> Result<JwtCredential> {
        let mut state = self.enter()?;
        if !state.consumers.contains_key(consumer_id) {
            return Err(not_found("consumer"));
        }
        let id = state.id("jwt");
        let credential = JwtCredential {
            id: Some(id.clone()),
            key: request.key.clone().unwrap_or_else(|| format!("key-{}", id)),
            secret: request.secret.clone().unwrap_or_else(|| format!("secret-{}", id)),
        };
        state.jwts.insert(consumer_id.to_string(), credential.clone());
        Ok(credential)
    }

    async fn add_consumer_acl(&self, consumer_id: &str, group: &str) -> Result<AclInfo> {
        let mut state = self.enter()?;
        if !state.consumers.contains_key(consumer_id) {
            return Err(not_found("consumer"));
        }
        state.acls.entry(consumer_id.to_string()).or_default().insert(group.to_string());
        Ok(AclInfo {
            id: format!("{}:{}", consumer_id, group),
            group: Some(group.to_string()),
        })
    }

    async fn remove_consumer_acl(&self, consumer_id: &str, group: &str) -> Result<()> {
        let mut state = self.enter()?;
        if let Some(groups) = state.acls.get_mut(consumer_id) {
            groups.remove(group);
        }
        Ok(())
    }
}

fn add_plugin(state: &mut GatewayState, scope: &str, request: &PluginRequest) -> Result<PluginInfo> {
    let existing = state
        .plugins
        .iter()
        .find(|(_, p)| p.scope == scope && p.request.name == request.name)
        .map(|(id, _)| id.clone());
    let id = match existing {
        Some(id) => id,
        None => state.id("plugin"),
    };
    state.plugins.insert(
        id.clone(),
        FakePlugin {
            scope: scope.to_string(),
            request: request.clone(),
        },
    );
    Ok(PluginInfo { id, name: Some(request.name.clone()) })
}

/// 固定调用量
pub struct StaticTelemetry(pub HashMap<String, u64>);

#[async_trait]
impl Telemetry for StaticTelemetry {
    async fn call_counts(&self) -> Result<HashMap<String, u64>> {
        Ok(self.0.clone())
    }
}

pub fn context(gateway: Arc<FakeGateway>) -> Arc<Context> {
    Arc::new(Context {
        stores: Stores::in_memory(),
        gateway,
        metrics: Arc::new(OperatorMetrics::new().unwrap()),
        in_flight: Arc::new(InFlight::new()),
    })
}

fn named<K: ManagedResource>(mut obj: K, action: Option<Action>) -> K {
    obj.meta_mut().namespace = Some(NS.to_string());
    if let Some(action) = action {
        obj.common_mut().request(action);
    }
    obj
}

pub fn service_unit(name: &str, action: Option<Action>) -> ServiceUnit {
    named(
        ServiceUnit::new(
            name,
            ServiceUnitSpec {
                name: format!("服务-{}", name),
                url: format!("http://{}.svc:8080", name),
                datasource: None,
            },
        ),
        action,
    )
}

pub fn api(name: &str, service_unit: &str, action: Option<Action>) -> Api {
    named(
        Api::new(
            name,
            ApiSpec {
                name: format!("接口-{}", name),
                service_unit: service_unit.to_string(),
                applications: vec![],
                methods: vec!["GET".to_string()],
                protocols: vec!["http".to_string()],
                paths: vec![format!("/{}", name)],
                parameters: vec![],
                rate: None,
                trafficcontrol: None,
                relations: RelationSet::new(),
            },
        ),
        action,
    )
}

pub fn application(name: &str, action: Option<Action>) -> Application {
    named(
        Application::new(
            name,
            ApplicationSpec {
                name: format!("应用-{}", name),
                owner: "alice".to_string(),
                credential: None,
                apis: vec![],
            },
        ),
        action,
    )
}

pub fn trafficcontrol(name: &str, minute: u64, action: Option<Action>) -> Trafficcontrol {
    named(
        Trafficcontrol::new(
            name,
            TrafficcontrolSpec {
                name: format!("策略-{}", name),
                limit_type: LimitType::Ip,
                quota: RateQuota {
                    minute: Some(minute),
                    ..Default::default()
                },
                apis: vec![],
                applications: vec![],
                relations: RelationSet::new(),
            },
        ),
        action,
    )
}

pub fn apply(name: &str, app: &str, api: &str, action: Option<Action>) -> Apply {
    named(
        Apply::new(
            name,
            ApplySpec {
                target_type: ApplyTarget::Api,
                target_id: api.to_string(),
                app_id: app.to_string(),
                expire_at: None,
                reason: Some("联调".to_string()),
            },
        ),
        action,
    )
}

pub fn datasource(name: &str, action: Option<Action>) -> Datasource {
    named(
        Datasource::new(
            name,
            DatasourceSpec {
                name: format!("数据源-{}", name),
                kind: DatasourceType::Mysql,
                host: "10.0.0.8".to_string(),
                port: 3306,
                database: Some("orders".to_string()),
                user: Some("apihub".to_string()),
            },
        ),
        action,
    )
}

/// 重新请求动作
pub async fn request<K: ManagedResource>(store: &dyn apihub_controller::ResourceStore<K>, name: &str, action: Action) {
    apihub_controller::modify(store, NS, name, |obj| {
        obj.common_mut().request(action);
        Ok(true)
    })
    .await
    .unwrap()
    .unwrap();
}

pub fn publish_status(api: &Api) -> PublishStatus {
    api.status.as_ref().map(|s| s.publish_status).unwrap_or_default()
}

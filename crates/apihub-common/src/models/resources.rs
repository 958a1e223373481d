//! 自定义资源定义
//!
//! 定义 ApiHub 的六类资源：Api、ServiceUnit、Trafficcontrol、Application、
//! Apply 与 Datasource。它们以自定义资源的形式保存在资源存储中，
//! 期望状态写在 spec，协调结果写在 status。

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::relation::RelationSet;
use super::status::{CommonStatus, Phase, PublishStatus};

/// Api 所属服务单元的索引标签
pub const LABEL_SERVICE_UNIT: &str = "apihub.io/serviceunit";
/// ServiceUnit 所用数据源的索引标签
pub const LABEL_DATASOURCE: &str = "apihub.io/datasource";
/// Apply 发起应用的索引标签
pub const LABEL_APPLICATION: &str = "apihub.io/application";

const INDEX_LABEL_KEYS: [&str; 3] = [LABEL_SERVICE_UNIT, LABEL_DATASOURCE, LABEL_APPLICATION];

/// 资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Api,
    ServiceUnit,
    Trafficcontrol,
    Application,
    Apply,
    Datasource,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Api => "Api",
            ResourceKind::ServiceUnit => "ServiceUnit",
            ResourceKind::Trafficcontrol => "Trafficcontrol",
            ResourceKind::Application => "Application",
            ResourceKind::Apply => "Apply",
            ResourceKind::Datasource => "Datasource",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 受协调引擎管理的资源
pub trait ManagedResource:
    kube::Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// 资源类型
    const KIND: ResourceKind;

    /// 状态公共部分，资源尚未被协调时为 `None`
    fn common(&self) -> Option<&CommonStatus>;

    /// 可写的状态公共部分，必要时初始化状态
    fn common_mut(&mut self) -> &mut CommonStatus;

    /// 当前阶段
    fn phase(&self) -> Phase {
        Phase::Any
    }

    /// 设置阶段，没有发布阶段的资源忽略
    fn set_phase(&mut self, _phase: Phase) {}

    /// 展示名称，用于唯一性校验
    fn display_name(&self) -> &str;

    /// 二级索引标签
    fn index_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// 按当前 spec 重写索引标签，引用被清空时同时删除旧标签
    fn refresh_index_labels(&mut self) {
        let labels = self.index_labels();
        let current = self.labels_mut();
        current.retain(|key, _| !INDEX_LABEL_KEYS.contains(&key.as_str()));
        current.extend(labels);
    }

    /// 命名空间，缺省时为 `default`
    fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }
}

/// Api 请求参数
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiParameter {
    /// 参数名称
    pub name: String,
    /// 参数位置：query、header、path、body
    pub location: String,
    /// 是否必填
    #[serde(default)]
    pub required: bool,
}

/// Api 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "apihub.io", version = "v1", kind = "Api", namespaced)]
#[kube(status = "ApiStatus")]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#)]
#[kube(printcolumn = r#"{"name":"Publish", "type":"string", "jsonPath":".status.publishStatus"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    /// 展示名称
    pub name: String,

    /// 所属服务单元名称
    pub service_unit: String,

    /// 已绑定的应用
    #[serde(default)]
    pub applications: Vec<String>,

    /// 请求方法
    #[serde(default)]
    pub methods: Vec<String>,

    /// 协议列表
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,

    /// 路由路径
    pub paths: Vec<String>,

    /// 请求参数
    #[serde(default)]
    pub parameters: Vec<ApiParameter>,

    /// 每秒请求上限
    pub rate: Option<u64>,

    /// 绑定的流控策略
    pub trafficcontrol: Option<String>,

    /// 待确认的应用关联
    #[serde(default)]
    pub relations: RelationSet,
}

/// Api 状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    #[serde(flatten)]
    pub common: CommonStatus,

    /// 发布状态
    #[serde(default)]
    pub publish_status: PublishStatus,

    /// 网关路由 ID
    pub route_id: Option<String>,

    /// 路由上 ACL 插件 ID
    pub acl_plugin_id: Option<String>,

    /// 路由上限速插件 ID（对应 spec.rate）
    pub rate_plugin_id: Option<String>,

    /// 调用次数
    #[serde(default)]
    pub called_count: u64,

    /// 是否已计入服务单元的 Api 数量
    #[serde(default)]
    pub counted: bool,
}

/// 服务单元规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "apihub.io", version = "v1", kind = "ServiceUnit", namespaced)]
#[kube(status = "ServiceUnitStatus")]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#)]
#[kube(printcolumn = r#"{"name":"Apis", "type":"integer", "jsonPath":".status.apiCount"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUnitSpec {
    /// 展示名称
    pub name: String,

    /// 上游服务地址
    pub url: String,

    /// 数据源名称
    pub datasource: Option<String>,
}

/// 服务单元状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUnitStatus {
    #[serde(flatten)]
    pub common: CommonStatus,

    /// 发布状态
    #[serde(default)]
    pub publish_status: PublishStatus,

    /// 网关服务 ID
    pub service_id: Option<String>,

    /// 已发布 Api 数量
    #[serde(default)]
    pub api_count: u64,
}

/// 限流维度
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum LimitType {
    /// 按 Api 限流
    Api,
    /// 按来源 IP 限流
    Ip,
    /// 按应用限流
    App,
    /// 按用户限流
    User,
}

/// 各周期配额
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RateQuota {
    pub second: Option<u64>,
    pub minute: Option<u64>,
    pub hour: Option<u64>,
    pub day: Option<u64>,
    pub month: Option<u64>,
    pub year: Option<u64>,
}

impl RateQuota {
    /// 是否至少设置了一个周期
    pub fn is_empty(&self) -> bool {
        self.second.is_none()
            && self.minute.is_none()
            && self.hour.is_none()
            && self.day.is_none()
            && self.month.is_none()
            && self.year.is_none()
    }
}

/// 流控策略规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "apihub.io", version = "v1", kind = "Trafficcontrol", namespaced)]
#[kube(status = "TrafficcontrolStatus")]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#)]
#[serde(rename_all = "camelCase")]
pub struct TrafficcontrolSpec {
    /// 展示名称
    pub name: String,

    /// 限流维度
    pub limit_type: LimitType,

    /// 配额
    pub quota: RateQuota,

    /// 已绑定的 Api
    #[serde(default)]
    pub apis: Vec<String>,

    /// 已绑定的应用，限流插件挂在应用的 consumer 上
    #[serde(default)]
    pub applications: Vec<String>,

    /// 待确认的 Api 与应用关联
    #[serde(default)]
    pub relations: RelationSet,
}

/// 流控策略状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficcontrolStatus {
    #[serde(flatten)]
    pub common: CommonStatus,

    /// Api 名称到网关限流插件 ID 的映射
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,

    /// 应用名称到 consumer 限流插件 ID 的映射
    #[serde(default)]
    pub consumer_plugins: BTreeMap<String, String>,

    /// 已绑定 Api 数量
    #[serde(default)]
    pub api_count: u64,
}

/// 应用凭证
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Credential {
    pub key: String,
    pub secret: String,
}

/// 应用规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "apihub.io", version = "v1", kind = "Application", namespaced)]
#[kube(status = "ApplicationStatus")]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// 展示名称
    pub name: String,

    /// 所有者
    pub owner: String,

    /// 租户指定的凭证，缺省时由网关生成
    pub credential: Option<Credential>,

    /// 已绑定的 Api
    #[serde(default)]
    pub apis: Vec<String>,
}

/// 应用状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(flatten)]
    pub common: CommonStatus,

    /// 网关 consumer ID
    pub consumer_id: Option<String>,

    /// JWT 凭证 key
    pub jwt_key: Option<String>,

    /// JWT 凭证 secret
    pub jwt_secret: Option<String>,

    /// 已绑定 Api 数量
    #[serde(default)]
    pub api_count: u64,

    /// 调用次数
    #[serde(default)]
    pub called_count: u64,
}

/// 申请目标类型
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ApplyTarget {
    Api,
}

/// 申请规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "apihub.io", version = "v1", kind = "Apply", namespaced)]
#[kube(status = "ApplyStatus")]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ApplySpec {
    /// 目标类型
    pub target_type: ApplyTarget,

    /// 目标名称
    pub target_id: String,

    /// 发起申请的应用
    pub app_id: String,

    /// 过期时间
    pub expire_at: Option<DateTime<Utc>>,

    /// 申请理由
    pub reason: Option<String>,
}

impl ApplySpec {
    /// 申请是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// 申请状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyStatus {
    #[serde(flatten)]
    pub common: CommonStatus,
}

/// 数据源类型
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum DatasourceType {
    Mysql,
    Postgres,
    Mongo,
    Redis,
}

/// 数据源规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "apihub.io", version = "v1", kind = "Datasource", namespaced)]
#[kube(status = "DatasourceStatus")]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceSpec {
    /// 展示名称
    pub name: String,

    /// 数据源类型
    #[serde(rename = "type")]
    pub kind: DatasourceType,

    pub host: String,

    pub port: u16,

    pub database: Option<String>,

    pub user: Option<String>,
}

/// 数据源状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceStatus {
    #[serde(flatten)]
    pub common: CommonStatus,

    /// 引用该数据源的服务单元数量
    #[serde(default)]
    pub service_unit_count: u64,
}

fn default_protocols() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

impl ManagedResource for Api {
    const KIND: ResourceKind = ResourceKind::Api;

    fn common(&self) -> Option<&CommonStatus> {
        self.status.as_ref().map(|s| &s.common)
    }

    fn common_mut(&mut self) -> &mut CommonStatus {
        &mut self.status.get_or_insert_with(Default::default).common
    }

    fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|s| s.publish_status)
            .unwrap_or_default()
            .into()
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(publish_status) = phase.publish_status() {
            self.status.get_or_insert_with(Default::default).publish_status = publish_status;
        }
    }

    fn display_name(&self) -> &str {
        &self.spec.name
    }

    fn index_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_SERVICE_UNIT.to_string(), self.spec.service_unit.clone())])
    }
}

impl ManagedResource for ServiceUnit {
    const KIND: ResourceKind = ResourceKind::ServiceUnit;

    fn common(&self) -> Option<&CommonStatus> {
        self.status.as_ref().map(|s| &s.common)
    }

    fn common_mut(&mut self) -> &mut CommonStatus {
        &mut self.status.get_or_insert_with(Default::default).common
    }

    fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|s| s.publish_status)
            .unwrap_or_default()
            .into()
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(publish_status) = phase.publish_status() {
            self.status.get_or_insert_with(Default::default).publish_status = publish_status;
        }
    }

    fn display_name(&self) -> &str {
        &self.spec.name
    }

    fn index_labels(&self) -> BTreeMap<String, String> {
        self.spec
            .datasource
            .iter()
            .map(|ds| (LABEL_DATASOURCE.to_string(), ds.clone()))
            .collect()
    }
}

impl ManagedResource for Trafficcontrol {
    const KIND: ResourceKind = ResourceKind::Trafficcontrol;

    fn common(&self) -> Option<&CommonStatus> {
        self.status.as_ref().map(|s| &s.common)
    }

    fn common_mut(&mut self) -> &mut CommonStatus {
        &mut self.status.get_or_insert_with(Default::default).common
    }

    fn display_name(&self) -> &str {
        &self.spec.name
    }
}

impl ManagedResource for Application {
    const KIND: ResourceKind = ResourceKind::Application;

    fn common(&self) -> Option<&CommonStatus> {
        self.status.as_ref().map(|s| &s.common)
    }

    fn common_mut(&mut self) -> &mut CommonStatus {
        &mut self.status.get_or_insert_with(Default::default).common
    }

    fn display_name(&self) -> &str {
        &self.spec.name
    }
}

impl ManagedResource for Apply {
    const KIND: ResourceKind = ResourceKind::Apply;

    fn common(&self) -> Option<&CommonStatus> {
        self.status.as_ref().map(|s| &s.common)
    }

    fn common_mut(&mut self) -> &mut CommonStatus {
        &mut self.status.get_or_insert_with(Default::default).common
    }

    // 申请没有展示名称，按对象名称判重
    fn display_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn index_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_APPLICATION.to_string(), self.spec.app_id.clone())])
    }
}

impl ManagedResource for Datasource {
    const KIND: ResourceKind = ResourceKind::Datasource;

    fn common(&self) -> Option<&CommonStatus> {
        self.status.as_ref().map(|s| &s.common)
    }

    fn common_mut(&mut self) -> &mut CommonStatus {
        &mut self.status.get_or_insert_with(Default::default).common
    }

    fn display_name(&self) -> &str {
        &self.spec.name
    }
}

//! 网关管理接口的请求与响应类型

use apihub_common::{LimitType, RateQuota};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// 服务创建/更新请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRequest {
    pub name: String,
    pub url: String,
}

/// 网关服务
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// 引用其他网关对象
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRef {
    pub id: String,
}

/// 路由创建/更新请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteRequest {
    pub name: String,
    pub service: ObjectRef,
    pub protocols: Vec<String>,
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

/// 网关路由
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouteInfo {
    pub id: String,
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
}

/// 插件请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginRequest {
    pub name: String,
    pub config: Value,
}

impl PluginRequest {
    /// 限流插件
    pub fn rate_limiting(limit_type: LimitType, quota: &RateQuota) -> Self {
        let limit_by = match limit_type {
            LimitType::Api => "service",
            LimitType::Ip => "ip",
            LimitType::App => "consumer",
            LimitType::User => "credential",
        };

        let mut config = Map::new();
        config.insert("limit_by".to_string(), json!(limit_by));
        let periods = [
            ("second", quota.second),
            ("minute", quota.minute),
            ("hour", quota.hour),
            ("day", quota.day),
            ("month", quota.month),
            ("year", quota.year),
        ];
        for (period, value) in periods {
            if let Some(value) = value {
                config.insert(period.to_string(), json!(value));
            }
        }

        Self {
            name: "rate-limiting".to_string(),
            config: Value::Object(config),
        }
    }

    /// 每秒请求上限
    pub fn per_second(limit: u64) -> Self {
        Self::rate_limiting(
            LimitType::Api,
            &RateQuota {
                second: Some(limit),
                ..Default::default()
            },
        )
    }

    /// ACL 白名单插件
    pub fn acl(allow: Vec<String>) -> Self {
        Self {
            name: "acl".to_string(),
            config: json!({ "allow": allow, "hide_groups_header": true }),
        }
    }
}

/// 网关插件
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// consumer 创建请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerRequest {
    pub username: String,
    pub custom_id: String,
}

/// 网关 consumer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsumerInfo {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// JWT 凭证创建请求
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct JwtRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// JWT 凭证
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JwtCredential {
    #[serde(default)]
    pub id: Option<String>,
    pub key: String,
    pub secret: String,
}

/// ACL 分组请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AclRequest {
    pub group: String,
}

/// consumer 的 ACL 分组
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AclInfo {
    pub id: String,
    #[serde(default)]
    pub group: Option<String>,
}

/// 网关列表响应
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
}

//! Kong 管理接口客户端
//!
//! 每次调用：序列化类型化请求，按固定间隔重试（仅 400/500 与传输错误），
//! 2xx 时解析响应并返回远端标识，其他状态码直接返回结构化错误。

use apihub_common::{Error, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::*;
use super::GatewayOperator;
use crate::utils::RetryPolicy;

/// Kong 客户端配置
#[derive(Debug, Clone)]
pub struct KongConfig {
    /// 管理接口地址
    pub admin_url: String,
    /// 重试策略
    pub retry: RetryPolicy,
    /// 单次请求超时
    pub timeout: Duration,
}

impl Default for KongConfig {
    fn default() -> Self {
        Self {
            admin_url: "http://kong-admin:8001".to_string(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// 单次调用的最终响应
#[derive(Debug)]
struct Reply {
    status: StatusCode,
    body: String,
}

impl Reply {
    fn ensure_success(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(Error::GatewayStatus {
                status: self.status.as_u16(),
                body: self.body,
            })
        }
    }

    fn decode<T: DeserializeOwned>(self) -> Result<T> {
        let reply = self.ensure_success()?;
        serde_json::from_str(&reply.body).map_err(|e| Error::GatewayDecode(e.to_string()))
    }
}

/// Kong 管理接口客户端
#[derive(Clone)]
pub struct KongClient {
    /// HTTP 客户端
    http: reqwest::Client,
    /// 管理接口地址（不含结尾斜杠）
    base_url: String,
    /// 重试策略
    retry: RetryPolicy,
}

impl KongClient {
    /// 创建新的客户端
    pub fn new(config: KongConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("创建网关 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.admin_url.trim_end_matches('/').to_string(),
            retry: config.retry,
        })
    }

    /// 发送请求，400/500 与传输错误按固定间隔重试
    async fn execute<B: Serialize + Sync>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Reply> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!(method = %method, path, attempt, "调用网关管理接口");

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .map_err(|e| Error::GatewayTransport(e.to_string()))?;

                    let retryable = Error::GatewayStatus {
                        status: status.as_u16(),
                        body: String::new(),
                    }
                    .is_retryable();
                    if retryable && self.retry.should_retry(attempt) {
                        warn!(method = %method, path, attempt, status = status.as_u16(), "网关返回可重试状态");
                        tokio::time::sleep(self.retry.interval).await;
                        continue;
                    }

                    return Ok(Reply { status, body });
                }
                Err(e) => {
                    if self.retry.should_retry(attempt) {
                        warn!(method = %method, path, attempt, "网关请求失败: {}", e);
                        tokio::time::sleep(self.retry.interval).await;
                        continue;
                    }
                    return Err(Error::GatewayTransport(e.to_string()));
                }
            }
        }
    }

    /// 创建对象；409 时按名称读取已有对象
    async fn create_or_get<B, T>(&self, collection: &str, body: &B, lookup: &str) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let reply = self.execute(Method::POST, collection, Some(body)).await?;
        if reply.status == StatusCode::CONFLICT {
            debug!(collection, lookup, "对象已存在，读取已有对象");
            return self
                .execute::<()>(Method::GET, &format!("{}/{}", collection, lookup), None)
                .await?
                .decode();
        }
        reply.decode()
    }

    /// 删除对象；404 视为成功
    async fn delete_path(&self, path: &str) -> Result<()> {
        let reply = self.execute::<()>(Method::DELETE, path, None).await?;
        if reply.status == StatusCode::NOT_FOUND {
            debug!(path, "对象不存在，视为已删除");
            return Ok(());
        }
        reply.ensure_success().map(|_| ())
    }

    /// 在 `scope` 上启用插件；同名插件已存在时更新其配置
    async fn add_plugin(&self, scope: &str, request: &PluginRequest) -> Result<PluginInfo> {
        let collection = format!("{}/plugins", scope);
        let reply = self.execute(Method::POST, &collection, Some(request)).await?;
        if reply.status != StatusCode::CONFLICT {
            return reply.decode();
        }

        let page: Page<PluginInfo> = self
            .execute::<()>(Method::GET, &collection, None)
            .await?
            .decode()?;
        let existing = page
            .data
            .into_iter()
            .find(|p| p.name.as_deref() == Some(request.name.as_str()))
            .ok_or_else(|| Error::GatewayStatus {
                status: StatusCode::CONFLICT.as_u16(),
                body: format!("插件 {} 冲突但未找到已有插件", request.name),
            })?;

        debug!(scope, plugin = %existing.id, "插件已存在，更新配置");
        self.update_plugin(&existing.id, request).await
    }
}

#[async_trait]
impl GatewayOperator for KongClient {
    async fn create_service(&self, request: &ServiceRequest) -> Result<ServiceInfo> {
        self.create_or_get("/services", request, &request.name).await
    }

    async fn update_service(&self, id: &str, request: &ServiceRequest) -> Result<ServiceInfo> {
        self.execute(Method::PATCH, &format!("/services/{}", id), Some(request))
            .await?
            .decode()
    }

    async fn delete_service(&self, id: &str) -> Result<()> {
        self.delete_path(&format!("/services/{}", id)).await
    }

    async fn create_route(&self, request: &RouteRequest) -> Result<RouteInfo> {
        self.create_or_get("/routes", request, &request.name).await
    }

    async fn update_route(&self, id: &str, request: &RouteRequest) -> Result<RouteInfo> {
        self.execute(Method::PATCH, &format!("/routes/{}", id), Some(request))
            .await?
            .decode()
    }

    async fn delete_route(&self, id: &str) -> Result<()> {
        self.delete_path(&format!("/routes/{}", id)).await
    }

    async fn add_route_plugin(&self, route_id: &str, request: &PluginRequest) -> Result<PluginInfo> {
        self.add_plugin(&format!("/routes/{}", route_id), request).await
    }

    async fn add_consumer_plugin(&self, consumer_id: &str, request: &PluginRequest) -> Result<PluginInfo> {
        self.add_plugin(&format!("/consumers/{}", consumer_id), request).await
    }

    async fn update_plugin(&self, id: &str, request: &PluginRequest) -> Result<PluginInfo> {
        self.execute(Method::PATCH, &format!("/plugins/{}", id), Some(request))
            .await?
            .decode()
    }

    async fn delete_plugin(&self, id: &str) -> Result<()> {
        self.delete_path(&format!("/plugins/{}", id)).await
    }

    async fn create_consumer(&self, request: &ConsumerRequest) -> Result<ConsumerInfo> {
        self.create_or_get("/consumers", request, &request.username).await
    }

    async fn delete_consumer(&self, id: &str) -> Result<()> {
        self.delete_path(&format!("/consumers/{}", id)).await
    }

    async fn create_jwt_credential(&self, consumer_id: &str, request: &JwtRequest) -> Result<JwtCredential> {
        self.execute(Method::POST, &format!("/consumers/{}/jwt", consumer_id), Some(request))
            .await?
            .decode()
    }

    async fn add_consumer_acl(&self, consumer_id: &str, group: &str) -> Result<AclInfo> {
        let request = AclRequest {
            group: group.to_string(),
        };
        self.create_or_get(&format!("/consumers/{}/acls", consumer_id), &request, group)
            .await
    }

    async fn remove_consumer_acl(&self, consumer_id: &str, group: &str) -> Result<()> {
        self.delete_path(&format!("/consumers/{}/acls/{}", consumer_id, group))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, interval: Duration) -> KongClient {
        KongClient::new(KongConfig {
            admin_url: server.uri(),
            retry: RetryPolicy::new(3, interval),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    fn route_request() -> RouteRequest {
        RouteRequest {
            name: "default.orders".to_string(),
            service: ObjectRef { id: "svc-1".to_string() },
            protocols: vec!["http".to_string()],
            paths: vec!["/orders".to_string()],
            methods: vec!["GET".to_string()],
        }
    }

    #[tokio::test]
    async fn test_create_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routes"))
            .and(body_partial_json(json!({"service": {"id": "svc-1"}, "paths": ["/orders"]})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "route-1",
                "hosts": null,
                "protocols": ["http"],
                "paths": ["/orders"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let route = client(&server, Duration::from_millis(10))
            .create_route(&route_request())
            .await
            .unwrap();
        assert_eq!(route.id, "route-1");
        assert_eq!(route.paths, Some(vec!["/orders".to_string()]));
    }

    #[tokio::test]
    async fn test_create_route_conflict_returns_existing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routes"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({"message": "unique constraint violation"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/routes/default.orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "route-1", "protocols": ["http"]})))
            .expect(1)
            .mount(&server)
            .await;

        let route = client(&server, Duration::from_millis(10))
            .create_route(&route_request())
            .await
            .unwrap();
        assert_eq!(route.id, "route-1");
    }

    #[tokio::test]
    async fn test_retry_bound_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routes"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let interval = Duration::from_millis(50);
        let started = Instant::now();
        let err = client(&server, interval)
            .create_route(&route_request())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::GatewayStatus { status: 500, .. }));
        assert!(started.elapsed() >= interval * 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers"))
            .respond_with(ResponseTemplate::new(400))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/consumers"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "consumer-1", "username": "default.mobile"})))
            .mount(&server)
            .await;

        let consumer = client(&server, Duration::from_millis(10))
            .create_consumer(&ConsumerRequest {
                username: "default.mobile".to_string(),
                custom_id: "alice".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(consumer.id, "consumer-1");
    }

    #[tokio::test]
    async fn test_other_status_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routes"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, Duration::from_millis(10))
            .create_route(&route_request())
            .await
            .unwrap_err();
        match err {
            Error::GatewayStatus { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "forbidden");
            }
            other => panic!("非预期错误: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_missing_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/routes/route-1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, Duration::from_millis(10))
            .delete_route("route-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/consumer-1/jwt"))
            .respond_with(ResponseTemplate::new(201).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server, Duration::from_millis(10))
            .create_jwt_credential("consumer-1", &JwtRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GatewayDecode(_)));
    }

    #[tokio::test]
    async fn test_plugin_conflict_updates_existing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routes/route-1/plugins"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/routes/route-1/plugins"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "plugin-acl", "name": "acl"},
                    {"id": "plugin-rl", "name": "rate-limiting"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/plugins/plugin-rl"))
            .and(body_partial_json(json!({"config": {"second": 5}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "plugin-rl", "name": "rate-limiting"})))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = client(&server, Duration::from_millis(10))
            .add_route_plugin("route-1", &PluginRequest::per_second(5))
            .await
            .unwrap();
        assert_eq!(plugin.id, "plugin-rl");
    }

    #[tokio::test]
    async fn test_acl_membership_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/consumer-1/acls"))
            .and(body_partial_json(json!({"group": "api-default-orders"})))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/consumers/consumer-1/acls/api-default-orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "acl-1", "group": "api-default-orders"})))
            .mount(&server)
            .await;

        let acl = client(&server, Duration::from_millis(10))
            .add_consumer_acl("consumer-1", "api-default-orders")
            .await
            .unwrap();
        assert_eq!(acl.id, "acl-1");
    }
}

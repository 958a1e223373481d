//! 调用量遥测
//!
//! 从 Prometheus 查询网关按路由统计的请求数，供周期同步写回 Api 与
//! Application 的调用次数。

use apihub_common::{Error, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// 调用量来源
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Telemetry: Send + Sync {
    /// 按网关路由名统计的累计调用次数
    async fn call_counts(&self) -> Result<HashMap<String, u64>>;
}

/// Prometheus 查询结果
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    metric: HashMap<String, String>,
    value: (f64, String),
}

/// Prometheus 遥测配置
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Prometheus 服务器地址
    pub prometheus_url: String,
    /// 统计窗口，如 `30d`
    pub range: String,
    /// 请求超时
    pub timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prometheus_url: "http://prometheus:9090".to_string(),
            range: "30d".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// 基于 Prometheus 的遥测实现
pub struct PrometheusTelemetry {
    http_client: HttpClient,
    config: TelemetryConfig,
}

impl PrometheusTelemetry {
    /// 创建新的 Prometheus 遥测
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Telemetry(e.to_string()))?;
        Ok(Self { http_client, config })
    }

    fn query(&self) -> String {
        format!(
            "sum by (route) (increase(kong_http_requests_total[{}]))",
            self.config.range
        )
    }
}

#[async_trait]
impl Telemetry for PrometheusTelemetry {
    async fn call_counts(&self) -> Result<HashMap<String, u64>> {
        let query = self.query();
        let url = format!("{}/api/v1/query", self.config.prometheus_url.trim_end_matches('/'));

        debug!("查询Prometheus: {}", query);

        let response = self
            .http_client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| Error::Telemetry(format!("请求Prometheus失败: {}", e)))?;

        let data: PrometheusResponse = response
            .json()
            .await
            .map_err(|e| Error::Telemetry(format!("解析Prometheus响应失败: {}", e)))?;

        if data.status != "success" {
            return Err(Error::Telemetry(format!("Prometheus查询失败: {}", data.status)));
        }

        let mut counts = HashMap::new();
        for result in data.data.result {
            let Some(route) = result.metric.get("route") else {
                continue;
            };
            // increase() 返回浮点数，向下取整
            let value = result.value.1.parse::<f64>().unwrap_or(0.0).max(0.0) as u64;
            counts.insert(route.clone(), value);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn telemetry(server: &MockServer) -> PrometheusTelemetry {
        PrometheusTelemetry::new(TelemetryConfig {
            prometheus_url: server.uri(),
            range: "1h".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_call_counts_by_route() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param(
                "query",
                "sum by (route) (increase(kong_http_requests_total[1h]))",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [
                        { "metric": { "route": "default.orders" }, "value": [1700000000.0, "42.7"] },
                        { "metric": { "route": "default.users" }, "value": [1700000000.0, "3"] },
                        { "metric": {}, "value": [1700000000.0, "9"] }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let counts = telemetry(&server).call_counts().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts["default.orders"], 42);
        assert_eq!(counts["default.users"], 3);
    }

    #[tokio::test]
    async fn test_query_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "data": { "result": [] }
            })))
            .mount(&server)
            .await;

        let err = telemetry(&server).call_counts().await.unwrap_err();
        assert!(matches!(err, Error::Telemetry(_)));
    }
}

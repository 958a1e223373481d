//! 指标收集与导出模块
//!
//! 记录各类资源的协调结果，并通过 Prometheus 格式导出。

use anyhow::{Context, Result};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Operator 指标
pub struct OperatorMetrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 协调结果计数
    reconcile_total: IntCounterVec,
    /// 正在进行的协调数
    in_flight: IntGaugeVec,
}

impl OperatorMetrics {
    /// 创建新的指标集合
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("apihub_reconcile_total", "Total number of reconcile attempts by outcome"),
            &["kind", "outcome"],
        )?;
        let in_flight = IntGaugeVec::new(
            Opts::new("apihub_reconcile_in_flight", "Number of reconciles currently running"),
            &["kind"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            in_flight,
        })
    }

    /// 记录一次协调结果
    pub fn record_reconcile(&self, kind: &str, outcome: &str) {
        self.reconcile_total.with_label_values(&[kind, outcome]).inc();
    }

    /// 某类资源的某种结果累计次数
    pub fn reconcile_count(&self, kind: &str, outcome: &str) -> u64 {
        self.reconcile_total.with_label_values(&[kind, outcome]).get()
    }

    pub fn reconcile_started(&self, kind: &str) {
        self.in_flight.with_label_values(&[kind]).inc();
    }

    pub fn reconcile_finished(&self, kind: &str) {
        self.in_flight.with_label_values(&[kind]).dec();
    }

    /// 以文本格式导出全部指标
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("编码指标失败")?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    /// 启动 HTTP 服务器提供 Prometheus 指标端点
    pub fn serve(self: Arc<Self>, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let metrics = self.clone();
        let make_svc = make_service_fn(move |_| {
            let metrics = metrics.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                    let metrics = metrics.clone();
                    async move { Ok::<_, Infallible>(metrics.respond(&request)) }
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .with_context(|| format!("绑定指标端口失败: {}", addr))?
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });

        info!("指标服务器已启动: http://{}/metrics", addr);
        Ok(tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("指标服务器错误: {}", e);
            }
        }))
    }

    fn respond(&self, request: &Request<Body>) -> Response<Body> {
        if request.uri().path() != "/metrics" {
            let mut response = Response::new(Body::from("not found"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            return response;
        }

        match self.encode() {
            Ok((content_type, buffer)) => {
                let mut response = Response::new(Body::from(buffer));
                if let Ok(value) = content_type.parse() {
                    response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                }
                response
            }
            Err(e) => {
                error!("导出指标失败: {}", e);
                let mut response = Response::new(Body::from(e.to_string()));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_counter() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.record_reconcile("Api", "succeeded");
        metrics.record_reconcile("Api", "succeeded");
        metrics.record_reconcile("Api", "failed");

        assert_eq!(metrics.reconcile_count("Api", "succeeded"), 2);
        assert_eq!(metrics.reconcile_count("Api", "failed"), 1);

        let (content_type, buffer) = metrics.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("apihub_reconcile_total{kind=\"Api\",outcome=\"succeeded\"} 2"));
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let metrics = OperatorMetrics::new().unwrap();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        assert_eq!(metrics.respond(&request).status(), StatusCode::NOT_FOUND);
    }
}

//! 配置管理模块
//!
//! 该模块负责加载 Operator 的配置文件，支持 YAML/JSON 格式，
//! 并允许通过 `APIHUB_` 前缀的环境变量覆盖任意配置项，
//! 例如 `APIHUB_GATEWAY__ADMIN_URL`。

use anyhow::{anyhow, Context, Result};
use apihub_controller::{KongConfig, LeaderConfig, LockConfig, RetryPolicy, SyncConfig, TelemetryConfig};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Operator 配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// 资源存储配置
    pub store: StoreSettings,
    /// 网关配置
    pub gateway: GatewaySettings,
    /// 分布式写锁配置
    pub lock: LockSettings,
    /// 周期同步配置
    pub sync: SyncSettings,
    /// 遥测配置
    pub telemetry: TelemetrySettings,
    /// 协调任务配置
    pub worker: WorkerSettings,
    /// 指标服务器配置
    pub metrics: MetricsSettings,
    /// 日志级别
    pub log_level: String,
}

/// 资源存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// 未开启多租户时使用的命名空间
    pub namespace: String,
    /// 是否开启多租户（监听全部命名空间）
    pub multi_tenant: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            multi_tenant: false,
        }
    }
}

impl StoreSettings {
    /// 监听的命名空间，多租户时为 `None`
    pub fn watch_namespace(&self) -> Option<String> {
        (!self.multi_tenant).then(|| self.namespace.clone())
    }
}

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// 管理接口地址
    pub admin_url: String,
    /// 单次调用的最大尝试次数
    pub attempts: u32,
    /// 重试间隔（秒）
    pub interval_seconds: u64,
    /// 单次请求超时（秒）
    pub timeout_seconds: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            admin_url: "http://kong-admin:8001".to_string(),
            attempts: 3,
            interval_seconds: 5,
            timeout_seconds: 10,
        }
    }
}

impl GatewaySettings {
    /// 单次网关调用在重试全部耗尽时的最长耗时
    pub fn worst_case_call(&self) -> Duration {
        let attempts = u64::from(self.attempts.max(1));
        Duration::from_secs(attempts * self.timeout_seconds + (attempts - 1) * self.interval_seconds)
    }

    pub fn kong_config(&self) -> KongConfig {
        KongConfig {
            admin_url: self.admin_url.clone(),
            retry: RetryPolicy::new(self.attempts, Duration::from_secs(self.interval_seconds)),
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

/// 分布式写锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// 租约有效期（秒）
    pub ttl_seconds: u64,
    /// 获取锁的超时时间（秒）
    pub acquire_timeout_seconds: u64,
    /// Lease 对象所在命名空间
    pub lease_namespace: String,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 5,
            acquire_timeout_seconds: 5,
            lease_namespace: "default".to_string(),
        }
    }
}

impl LockSettings {
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            ttl: Duration::from_secs(self.ttl_seconds),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_seconds),
            ..Default::default()
        }
    }
}

/// 周期同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// 同步间隔（秒）
    pub interval_seconds: u64,
    /// 首次同步延迟（秒）
    pub initial_delay_seconds: u64,
    /// Running 超时阈值（秒），必须大于单次网关调用的最长耗时
    pub stale_running_seconds: u64,
    /// 领导者租约名称
    pub leader_lease: String,
    /// 领导者租约有效期（秒）
    pub leader_ttl_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            initial_delay_seconds: 30,
            stale_running_seconds: 600,
            leader_lease: apihub_controller::sync::DEFAULT_LEADER_LEASE.to_string(),
            leader_ttl_seconds: 15,
        }
    }
}

impl SyncSettings {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: Duration::from_secs(self.interval_seconds),
            initial_delay: Duration::from_secs(self.initial_delay_seconds),
            stale_running: Duration::from_secs(self.stale_running_seconds),
        }
    }

    /// 续约间隔取租约有效期的三分之一
    pub fn leader_config(&self) -> LeaderConfig {
        let ttl = Duration::from_secs(self.leader_ttl_seconds.max(3));
        LeaderConfig {
            lease: self.leader_lease.clone(),
            ttl,
            retry_interval: ttl / 3,
        }
    }
}

/// 遥测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Prometheus 服务器地址
    pub prometheus_url: String,
    /// 统计窗口
    pub range: String,
    /// 请求超时（秒）
    pub timeout_seconds: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            prometheus_url: "http://prometheus:9090".to_string(),
            range: "30d".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl TelemetrySettings {
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            prometheus_url: self.prometheus_url.clone(),
            range: self.range.clone(),
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

/// 协调任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// 每类资源的最大并发协调数
    pub concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

/// 指标服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// 是否启用
    pub enabled: bool,
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

impl MetricsSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_address
            .parse()
            .with_context(|| format!("无效的监听地址: {}", self.listen_address))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl OperatorConfig {
    /// 加载配置：配置文件（可选）叠加 `APIHUB_` 环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

            // 确定配置文件格式
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
            };
            builder = builder.add_source(File::with_name(config_file).format(format));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("APIHUB")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("构建配置失败")?;

        let mut operator_config = config
            .try_deserialize::<OperatorConfig>()
            .context("配置格式错误")?;
        if operator_config.log_level.is_empty() {
            operator_config.log_level = "info".to_string();
        }
        operator_config.validate()?;
        Ok(operator_config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(anyhow!("worker.concurrency 必须大于 0"));
        }
        if self.gateway.admin_url.is_empty() {
            return Err(anyhow!("gateway.admin_url 不能为空"));
        }
        let worst_case = self.gateway.worst_case_call().as_secs();
        if self.sync.stale_running_seconds <= worst_case {
            return Err(anyhow!(
                "sync.stale_running_seconds ({}) 必须大于单次网关调用的最长耗时 {} 秒",
                self.sync.stale_running_seconds,
                worst_case
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.gateway.kong_config().retry, RetryPolicy::default());
        assert_eq!(config.lock.lock_config().ttl, Duration::from_secs(5));
        assert_eq!(config.sync.sync_config().interval, Duration::from_secs(60));
        assert_eq!(config.store.watch_namespace().as_deref(), Some("default"));
    }

    #[test]
    fn test_load_yaml() {
        let file = write_config(
            ".yaml",
            r#"
store:
  multi_tenant: true
gateway:
  admin_url: "http://127.0.0.1:8001"
  interval_seconds: 1
sync:
  interval_seconds: 120
  leader_ttl_seconds: 30
log_level: debug
"#,
        );

        let config = OperatorConfig::load(Some(file.path())).unwrap();
        assert!(config.store.watch_namespace().is_none());
        assert_eq!(config.gateway.admin_url, "http://127.0.0.1:8001");
        assert_eq!(config.gateway.kong_config().retry.interval, Duration::from_secs(1));
        assert_eq!(config.sync.sync_config().interval, Duration::from_secs(120));
        assert_eq!(config.sync.leader_config().retry_interval, Duration::from_secs(10));
        assert_eq!(config.telemetry.range, "30d");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_load_json() {
        let file = write_config(".json", r#"{ "metrics": { "listen_address": "127.0.0.1", "port": 9100 } }"#);
        let config = OperatorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.metrics.socket_addr().unwrap().to_string(), "127.0.0.1:9100");
    }

    #[test]
    fn test_unsupported_format() {
        let file = write_config(".toml", "log_level = \"info\"");
        assert!(OperatorConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let file = write_config(".yaml", "worker:\n  concurrency: 0\n");
        assert!(OperatorConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_stale_threshold_must_exceed_gateway_retries() {
        assert_eq!(GatewaySettings::default().worst_case_call(), Duration::from_secs(40));

        let file = write_config(
            ".yaml",
            "gateway:\n  attempts: 5\n  timeout_seconds: 30\nsync:\n  stale_running_seconds: 120\n",
        );
        let err = OperatorConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("stale_running_seconds"));
    }
}

//! 错误处理模块
//!
//! 该模块提供 ApiHub 控制面的统一错误类型。存储冲突、网关远端错误、
//! 锁获取超时等错误各自对应独立的变体，调用方据此决定重新读取、
//! 标记资源失败或直接向请求方返回。

use std::io;
use thiserror::Error;

/// ApiHub 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 资源不存在
    #[error("资源不存在: {kind} {namespace}/{name}")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// 乐观并发冲突，调用方需重新读取后再计算
    #[error("资源版本冲突: {kind} {namespace}/{name}")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },

    /// 资源已存在
    #[error("资源已存在: {kind} {namespace}/{name}")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    /// 资源存储后端错误
    #[error("资源存储错误: {0}")]
    Store(String),

    /// 网关返回非预期状态码
    #[error("网关返回错误状态 {status}: {body}")]
    GatewayStatus { status: u16, body: String },

    /// 网关传输层错误
    #[error("网关请求失败: {0}")]
    GatewayTransport(String),

    /// 网关响应无法解析
    #[error("网关响应解析失败: {0}")]
    GatewayDecode(String),

    /// 获取分布式锁超时
    #[error("获取分布式锁 {0} 超时")]
    LockTimeout(String),

    /// 协调服务错误
    #[error("协调服务错误: {0}")]
    Coordination(String),

    /// 监控数据源错误
    #[error("监控数据查询失败: {0}")]
    Telemetry(String),

    /// 资源内容校验失败
    #[error("资源校验失败: {0}")]
    Invalid(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// ApiHub 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 构造资源不存在错误
    pub fn not_found(kind: impl ToString, namespace: &str, name: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// 构造版本冲突错误
    pub fn conflict(kind: impl ToString, namespace: &str, name: &str) -> Self {
        Error::Conflict {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// 构造资源已存在错误
    pub fn already_exists(kind: impl ToString, namespace: &str, name: &str) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// 是否为乐观并发冲突
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// 是否为资源不存在
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// 是否值得由调用方重新提交
    ///
    /// 锁超时、版本冲突与网关传输错误属于瞬时错误；网关只有 400 与 500
    /// 视为可重试，其余非 2xx 状态重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LockTimeout(_)
            | Error::Conflict { .. }
            | Error::GatewayTransport(_)
            | Error::Coordination(_) => true,
            Error::GatewayStatus { status, .. } => matches!(status, 400 | 500),
            _ => false,
        }
    }
}

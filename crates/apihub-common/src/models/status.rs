//! 生命周期状态模型
//!
//! 所有资源共享同一套处理状态（Init/Running/Success/Error）与动作集合，
//! Api 与 ServiceUnit 额外携带发布阶段。协调引擎只在 `Init` 时处理动作。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum ProcessStatus {
    /// 等待处理
    #[default]
    Init,
    /// 处理中
    Running,
    /// 处理成功
    Success,
    /// 处理失败
    Error,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Init => write!(f, "Init"),
            ProcessStatus::Running => write!(f, "Running"),
            ProcessStatus::Success => write!(f, "Success"),
            ProcessStatus::Error => write!(f, "Error"),
        }
    }
}

/// 最近一次请求的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Action {
    Publish,
    Offline,
    Update,
    Delete,
    Bind,
    UnBind,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Publish => write!(f, "Publish"),
            Action::Offline => write!(f, "Offline"),
            Action::Update => write!(f, "Update"),
            Action::Delete => write!(f, "Delete"),
            Action::Bind => write!(f, "Bind"),
            Action::UnBind => write!(f, "UnBind"),
        }
    }
}

/// 发布状态，仅 Api 与 ServiceUnit 使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum PublishStatus {
    /// 未发布
    #[default]
    UnRelease,
    /// 已发布
    Released,
    /// 已下线
    Offlined,
}

/// 状态表中的阶段键
///
/// 没有发布阶段的资源类型统一使用 `Any`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    UnRelease,
    Released,
    Offlined,
    Any,
}

impl From<PublishStatus> for Phase {
    fn from(status: PublishStatus) -> Self {
        match status {
            PublishStatus::UnRelease => Phase::UnRelease,
            PublishStatus::Released => Phase::Released,
            PublishStatus::Offlined => Phase::Offlined,
        }
    }
}

impl Phase {
    /// 转换回发布状态，`Any` 没有对应值
    pub fn publish_status(&self) -> Option<PublishStatus> {
        match self {
            Phase::UnRelease => Some(PublishStatus::UnRelease),
            Phase::Released => Some(PublishStatus::Released),
            Phase::Offlined => Some(PublishStatus::Offlined),
            Phase::Any => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::UnRelease => write!(f, "UnRelease"),
            Phase::Released => write!(f, "Released"),
            Phase::Offlined => write!(f, "Offlined"),
            Phase::Any => write!(f, "Any"),
        }
    }
}

/// 所有资源状态的公共部分
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommonStatus {
    /// 处理状态
    #[serde(default)]
    pub status: ProcessStatus,

    /// 最近一次请求的动作
    pub action: Option<Action>,

    /// 状态消息
    pub message: Option<String>,

    /// 最近一次状态变化时间
    pub last_transition: Option<DateTime<Utc>>,
}

impl CommonStatus {
    /// 请求一个新动作，资源回到 `Init` 等待协调
    pub fn request(&mut self, action: Action) {
        self.status = ProcessStatus::Init;
        self.action = Some(action);
        self.message = None;
        self.last_transition = Some(Utc::now());
    }

    /// 标记为处理中
    pub fn start(&mut self) {
        self.status = ProcessStatus::Running;
        self.message = None;
        self.last_transition = Some(Utc::now());
    }

    /// 标记为处理成功
    pub fn succeed(&mut self, message: impl Into<String>) {
        self.status = ProcessStatus::Success;
        self.message = Some(message.into());
        self.last_transition = Some(Utc::now());
    }

    /// 标记为处理失败
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = ProcessStatus::Error;
        self.message = Some(message.into());
        self.last_transition = Some(Utc::now());
    }

    /// 是否等待处理
    pub fn is_pending(&self) -> bool {
        self.status == ProcessStatus::Init && self.action.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let mut status = CommonStatus::default();
        assert!(!status.is_pending());

        status.request(Action::Publish);
        assert!(status.is_pending());

        status.start();
        assert_eq!(status.status, ProcessStatus::Running);
        assert!(!status.is_pending());

        status.fail("网关不可用");
        assert_eq!(status.status, ProcessStatus::Error);
        assert_eq!(status.message.as_deref(), Some("网关不可用"));
    }

    #[test]
    fn test_phase_round_trip() {
        for status in [PublishStatus::UnRelease, PublishStatus::Released, PublishStatus::Offlined] {
            assert_eq!(Phase::from(status).publish_status(), Some(status));
        }
        assert_eq!(Phase::Any.publish_status(), None);
    }

    #[test]
    fn test_status_serialization() {
        let mut status = CommonStatus::default();
        status.request(Action::Offline);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "Init");
        assert_eq!(value["action"], "Offline");
        assert!(value.get("lastTransition").is_some());
    }
}

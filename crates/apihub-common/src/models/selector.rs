//! 标签选择器
//!
//! 支持 `key=value` 与 `key` 两种等值要求，多个要求以逗号分隔。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// 单个标签要求
#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    value: Option<String>,
}

/// 标签选择器
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// 匹配所有资源的选择器
    pub fn everything() -> Self {
        Self::default()
    }

    /// 追加 `key=value` 要求
    pub fn eq(mut self, key: &str, value: &str) -> Self {
        self.requirements.push(Requirement {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        self
    }

    /// 追加“存在该标签”要求
    pub fn exists(mut self, key: &str) -> Self {
        self.requirements.push(Requirement {
            key: key.to_string(),
            value: None,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// 判断标签集合是否满足选择器
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| match (&r.value, labels.get(&r.key)) {
            (Some(expected), Some(actual)) => expected == actual,
            (None, Some(_)) => true,
            _ => false,
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match &r.value {
                Some(value) => format!("{}={}", r.key, value),
                None => r.key.clone(),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut selector = LabelSelector::everything();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            selector = match part.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(Error::Invalid(format!("无效的标签选择器: {}", s)));
                    }
                    selector.eq(key, value.trim())
                }
                None => selector.exists(part),
            };
        }
        Ok(selector)
    }
}

//! 关联关系标记
//!
//! 多对多关系（Api↔Application、Trafficcontrol↔Api）的增量变更通过
//! 关联标记记录：门面层写入期望状态，协调引擎逐条确认后清理。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 关联对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum RelationKind {
    Application,
    Api,
}

/// 期望的关联状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Desired {
    /// 期望绑定
    Bound,
    /// 期望解绑
    Unbound,
}

/// 单条关联标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelationFlag {
    /// 关联对象类型
    pub kind: RelationKind,
    /// 关联对象名称
    pub related_id: String,
    /// 期望状态
    pub desired: Desired,
    /// 是否已在网关与关联对象上确认
    #[serde(default)]
    pub confirmed: bool,
}

/// 关联标记集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RelationSet(Vec<RelationFlag>);

impl RelationSet {
    /// 创建空集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录期望状态；同一关联对象只保留最新的一条未确认标记
    pub fn flag(&mut self, kind: RelationKind, related_id: &str, desired: Desired) {
        self.0.retain(|f| !(f.kind == kind && f.related_id == related_id));
        self.0.push(RelationFlag {
            kind,
            related_id: related_id.to_string(),
            desired,
            confirmed: false,
        });
    }

    /// 未确认的标记
    pub fn pending(&self) -> Vec<RelationFlag> {
        self.0.iter().filter(|f| !f.confirmed).cloned().collect()
    }

    /// 确认一条标记
    pub fn confirm(&mut self, kind: RelationKind, related_id: &str) {
        for flag in self.0.iter_mut() {
            if flag.kind == kind && flag.related_id == related_id {
                flag.confirmed = true;
            }
        }
    }

    /// 删除与某个关联对象有关的全部标记
    pub fn remove(&mut self, kind: RelationKind, related_id: &str) {
        self.0.retain(|f| !(f.kind == kind && f.related_id == related_id));
    }

    /// 是否存在指定关联对象的标记
    pub fn contains(&self, kind: RelationKind, related_id: &str) -> bool {
        self.0.iter().any(|f| f.kind == kind && f.related_id == related_id)
    }

    /// 清理已确认的标记，返回清理数量
    pub fn clear_confirmed(&mut self) -> usize {
        let before = self.0.len();
        self.0.retain(|f| !f.confirmed);
        before - self.0.len()
    }

    /// 是否全部已确认
    pub fn is_settled(&self) -> bool {
        self.0.iter().all(|f| f.confirmed)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelationFlag> {
        self.0.iter()
    }
}

impl From<Vec<RelationFlag>> for RelationSet {
    fn from(flags: Vec<RelationFlag>) -> Self {
        Self(flags)
    }
}

//! 状态转移表
//!
//! 每类资源在启动时构建一张 `(阶段, 动作) -> 转移` 表，
//! 表中不存在的组合一律视为无操作。

use apihub_common::{Action, Phase, ResourceKind};
use std::collections::HashMap;
use std::fmt;

/// 操作成功后的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPhase {
    /// 保持当前阶段
    Stay,
    /// 进入指定阶段
    To(Phase),
    /// 删除记录
    Removed,
}

/// 一次状态转移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<O> {
    /// 要执行的操作
    pub operation: O,
    /// 成功后的阶段
    pub next: NextPhase,
}

/// 状态转移表
#[derive(Clone)]
pub struct StateTable<O> {
    kind: ResourceKind,
    entries: HashMap<(Phase, Action), Transition<O>>,
}

impl<O: Copy + fmt::Debug> StateTable<O> {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// 为若干阶段下的同一动作登记转移
    pub fn on(mut self, phases: &[Phase], action: Action, operation: O, next: NextPhase) -> Self {
        for &phase in phases {
            self.entries.insert((phase, action), Transition { operation, next });
        }
        self
    }

    pub fn lookup(&self, phase: Phase, action: Action) -> Option<Transition<O>> {
        self.entries.get(&(phase, action)).copied()
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<O: fmt::Debug> fmt::Debug for StateTable<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTable")
            .field("kind", &self.kind)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Start,
        Stop,
    }

    #[test]
    fn test_lookup() {
        let table = StateTable::new(ResourceKind::Api)
            .on(&[Phase::UnRelease, Phase::Offlined], Action::Publish, Op::Start, NextPhase::To(Phase::Released))
            .on(&[Phase::Released], Action::Offline, Op::Stop, NextPhase::To(Phase::Offlined));

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.lookup(Phase::Offlined, Action::Publish),
            Some(Transition {
                operation: Op::Start,
                next: NextPhase::To(Phase::Released)
            })
        );
        assert!(table.lookup(Phase::Released, Action::Publish).is_none());
        assert!(table.lookup(Phase::Offlined, Action::Offline).is_none());
    }
}

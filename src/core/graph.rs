//! 回合内调用依赖图
//!
//! 邻接表 + 入度表。独立调用之间没有顺序保证；显式数据依赖的调用只在依赖成功终止后
//! 才变为就绪。依赖以失败/超时终止时，依赖方（含传递依赖方）被判 DependencyUnmet，
//! 永不派发。

use std::collections::HashMap;

use crate::core::planner::{CallId, TurnPlan};
use crate::core::OrchestratorError;

/// 调用节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    /// 仍有未完成依赖
    Waiting,
    /// 入度归零，可以派发
    Ready,
    /// 已被调用方取走派发
    Dispatched,
    /// 成功终止
    Succeeded,
    /// 失败/超时终止，或依赖未满足
    Failed,
}

/// 依赖解析图
pub struct InvocationGraph {
    /// call_id -> 依赖它的调用
    adjacency: HashMap<CallId, Vec<CallId>>,
    in_degree: HashMap<CallId, usize>,
    states: HashMap<CallId, NodeState>,
}

impl InvocationGraph {
    /// 由回合计划构建；引用缺失或成环属配置错误
    pub fn new(plan: &TurnPlan) -> Result<Self, OrchestratorError> {
        let mut adjacency: HashMap<CallId, Vec<CallId>> = HashMap::new();
        let mut in_degree: HashMap<CallId, usize> = HashMap::new();

        for call in &plan.calls {
            if in_degree.insert(call.call_id.clone(), 0).is_some() {
                return Err(OrchestratorError::Config(format!(
                    "duplicate call id '{}' in turn plan",
                    call.call_id
                )));
            }
            adjacency.entry(call.call_id.clone()).or_default();
        }

        for call in &plan.calls {
            for dep in &call.depends_on {
                if !adjacency.contains_key(dep) {
                    return Err(OrchestratorError::Config(format!(
                        "call '{}' depends on unknown call '{}'",
                        call.call_id, dep
                    )));
                }
                adjacency.get_mut(dep).expect("checked above").push(call.call_id.clone());
                *in_degree.get_mut(&call.call_id).expect("inserted above") += 1;
            }
        }

        let states = in_degree
            .iter()
            .map(|(id, degree)| {
                let state = if *degree == 0 { NodeState::Ready } else { NodeState::Waiting };
                (id.clone(), state)
            })
            .collect();

        let graph = Self {
            adjacency,
            in_degree,
            states,
        };
        graph.check_acyclic(plan)?;
        Ok(graph)
    }

    /// Kahn 拓扑检查：处理不完全部节点即有环
    fn check_acyclic(&self, plan: &TurnPlan) -> Result<(), OrchestratorError> {
        let mut degrees = self.in_degree.clone();
        let mut queue: Vec<CallId> = degrees
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut seen = 0usize;
        while let Some(id) = queue.pop() {
            seen += 1;
            for dependent in self.adjacency.get(&id).into_iter().flatten() {
                let degree = degrees.get_mut(dependent).expect("node exists");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(dependent.clone());
                }
            }
        }
        if seen != plan.calls.len() {
            return Err(OrchestratorError::Config(
                "cyclic dependency in turn plan".to_string(),
            ));
        }
        Ok(())
    }

    /// 取走当前全部就绪调用（标记为已派发，不会重复返回）
    pub fn take_ready(&mut self) -> Vec<CallId> {
        let ready: Vec<CallId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == NodeState::Ready)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ready {
            self.states.insert(id.clone(), NodeState::Dispatched);
        }
        ready
    }

    /// 记录一个调用的终态。成功时返回新就绪的调用；失败时返回被连带判
    /// DependencyUnmet 的全部（含传递）依赖方，它们同时被标为 Failed。
    pub fn mark_terminal(&mut self, call_id: &str, succeeded: bool) -> GraphProgress {
        let mut progress = GraphProgress::default();
        self.states.insert(
            call_id.to_string(),
            if succeeded { NodeState::Succeeded } else { NodeState::Failed },
        );

        if succeeded {
            for dependent in self.adjacency.get(call_id).cloned().into_iter().flatten() {
                let degree = self.in_degree.get_mut(&dependent).expect("node exists");
                *degree -= 1;
                if *degree == 0 && self.states.get(&dependent) == Some(&NodeState::Waiting) {
                    self.states.insert(dependent.clone(), NodeState::Ready);
                    progress.newly_ready.push(dependent);
                }
            }
        } else {
            // 级联：失败依赖的整棵依赖子树全部跳过
            let mut stack: Vec<CallId> =
                self.adjacency.get(call_id).cloned().unwrap_or_default();
            while let Some(dependent) = stack.pop() {
                if self.states.get(&dependent) == Some(&NodeState::Waiting) {
                    self.states.insert(dependent.clone(), NodeState::Failed);
                    stack.extend(self.adjacency.get(&dependent).cloned().into_iter().flatten());
                    progress.unmet.push(dependent);
                }
            }
        }

        progress
    }

    /// 是否所有调用都已终止（成功、失败或连带跳过）
    pub fn all_terminal(&self) -> bool {
        self.states
            .values()
            .all(|s| matches!(s, NodeState::Succeeded | NodeState::Failed))
    }

    /// 仍处于已派发、未终止状态的调用
    pub fn in_flight(&self) -> Vec<CallId> {
        self.states
            .iter()
            .filter(|(_, s)| **s == NodeState::Dispatched)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// mark_terminal 的结果
#[derive(Debug, Default)]
pub struct GraphProgress {
    pub newly_ready: Vec<CallId>,
    pub unmet: Vec<CallId>,
}

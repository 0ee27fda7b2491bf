//! 核心编排层：错误税目、依赖图、规划器、聚合器、回合状态机

pub mod aggregator;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod planner;

pub use aggregator::ResultAggregator;
pub use error::{FieldViolation, OrchestratorError};
pub use graph::InvocationGraph;
pub use orchestrator::{Orchestrator, TurnRequest, TurnResponse};
pub use planner::{detect_intent, ArgBinding, PlannedCall, RulePlanner, TurnPlan, TurnPlanner};

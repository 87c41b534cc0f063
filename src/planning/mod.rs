//! 规划层：分析 / 计划的提示词、响应契约与解析

pub mod contract;
pub mod planner;
pub mod prompts;

pub use contract::{
    extract_tag, parse_action_plan, parse_analysis, parse_flag, AgentActionPlan, AgentTaskAnalysis,
    ParseError, PlanValidation,
};
pub use planner::{analyze_task, request_action_plan};

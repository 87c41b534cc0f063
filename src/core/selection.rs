//! Agent 选择：能力 / 性能 / 专长加权打分 + 候选计划
//!
//! score = 0.4 × capability + 0.3 × performance + 0.3 × specialization。
//! 只有给出有效计划的候选参与比较；最高分为 0 视为没有合适的 Agent。

use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;

use crate::agent::{Agent, AgentConfiguration};
use crate::core::{Task, Usage};
use crate::planning::{request_action_plan, AgentActionPlan, AgentTaskAnalysis};
use crate::tools::ToolInfo;

pub const CAPABILITY_WEIGHT: f64 = 0.4;
pub const PERFORMANCE_WEIGHT: f64 = 0.3;
pub const SPECIALIZATION_WEIGHT: f64 = 0.3;

/// 未配置 max_tokens 时的性能分
pub const DEFAULT_PERFORMANCE: f64 = 0.5;

pub const DEFAULT_REFERENCE_TOKEN_BUDGET: u32 = 4096;

/// 选择结果
#[derive(Clone)]
pub struct AgentSelectionResult {
    pub agent: Arc<dyn Agent>,
    pub action_plan: Option<AgentActionPlan>,
    pub score: f64,
    /// 计划请求消耗
    pub usage: Usage,
}

impl fmt::Debug for AgentSelectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSelectionResult")
            .field("agent", &self.agent.name())
            .field("action_plan", &self.action_plan)
            .field("score", &self.score)
            .finish()
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// 所需能力中能在工具名里匹配到的比例（大小写无关，双向子串）
pub fn capability_match(analysis: &AgentTaskAnalysis, tools: &[ToolInfo]) -> f64 {
    if analysis.capabilities.is_empty() {
        return 0.0;
    }
    let matched = analysis
        .capabilities
        .iter()
        .filter(|cap| {
            tools
                .iter()
                .any(|t| contains_ci(&t.name, cap) || contains_ci(cap, &t.name))
        })
        .count();
    matched as f64 / analysis.capabilities.len() as f64
}

/// max_tokens 相对参考预算的比例，上限 1.0
pub fn performance_score(config: &AgentConfiguration, reference_budget: u32) -> f64 {
    match config.max_tokens {
        Some(max_tokens) if reference_budget > 0 => {
            (max_tokens as f64 / reference_budget as f64).min(1.0)
        }
        Some(_) => 1.0,
        None => DEFAULT_PERFORMANCE,
    }
}

/// 所需专长出现在 Agent 描述中的比例
pub fn specialization_match(analysis: &AgentTaskAnalysis, description: &str) -> f64 {
    if analysis.specialization.is_empty() {
        return 0.0;
    }
    let matched = analysis
        .specialization
        .iter()
        .filter(|s| contains_ci(description, s))
        .count();
    matched as f64 / analysis.specialization.len() as f64
}

pub fn score_agent(agent: &dyn Agent, analysis: &AgentTaskAnalysis, reference_budget: u32) -> f64 {
    let config = agent.configuration();
    CAPABILITY_WEIGHT * capability_match(analysis, &agent.tools())
        + PERFORMANCE_WEIGHT * performance_score(config, reference_budget)
        + SPECIALIZATION_WEIGHT * specialization_match(analysis, &config.description)
}

/// 为任务选择最合适的 Agent：候选并发生成计划，有效计划者中取最高分（同分取靠前者）
pub async fn select_best_agent_for_task(
    candidates: &[Arc<dyn Agent>],
    task: &Task,
    analysis: &AgentTaskAnalysis,
    context: &[String],
    reference_budget: u32,
) -> Option<AgentSelectionResult> {
    let plans = join_all(candidates.iter().map(|agent| async move {
        let model = agent.language_model();
        request_action_plan(model.as_ref(), task, &agent.tools(), context).await
    }))
    .await;

    let mut best: Option<AgentSelectionResult> = None;
    for (agent, plan) in candidates.iter().zip(plans) {
        let (plan, usage) = match plan {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(agent = agent.name(), kind = %e.kind, "candidate ineligible: {}", e);
                continue;
            }
        };
        let score = score_agent(agent.as_ref(), analysis, reference_budget);
        tracing::debug!(agent = agent.name(), score, "candidate scored");
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(AgentSelectionResult {
                agent: Arc::clone(agent),
                action_plan: Some(plan),
                score,
                usage,
            });
        }
    }

    match best {
        Some(selection) if selection.score > 0.0 => {
            tracing::info!(
                task_id = %task.id,
                agent = selection.agent.name(),
                score = selection.score,
                "agent selected"
            );
            Some(selection)
        }
        Some(_) => {
            tracing::warn!(task_id = %task.id, "best candidate scored 0");
            None
        }
        None => {
            tracing::warn!(task_id = %task.id, "no candidate produced a valid plan");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LlmAgent;
    use crate::llm::ScriptedLanguageModel;
    use crate::tools::DeclaredTool;

    const VALID_PLAN: &str = "<steps>\n1. do it\n</steps>\n<validation>\nsteps_valid: yes\ntools_available: yes\n</validation>";

    fn analysis(caps: &[&str], specs: &[&str]) -> AgentTaskAnalysis {
        AgentTaskAnalysis {
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            specialization: specs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn planner_agent(name: &str, reply: &str) -> LlmAgent {
        LlmAgent::new(name, Arc::new(ScriptedLanguageModel::new(name).with_default(reply)))
    }

    #[test]
    fn test_capability_match_is_case_insensitive_substring() {
        let tools = vec![ToolInfo::new("Web_Search", ""), ToolInfo::new("sql", "")];
        let a = analysis(&["search", "sql_query", "image"], &[]);
        let score = capability_match(&a, &tools);
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_performance_score() {
        let mut config = AgentConfiguration::default();
        assert_eq!(performance_score(&config, 4096), 0.5);
        config.max_tokens = Some(2048);
        assert_eq!(performance_score(&config, 4096), 0.5);
        config.max_tokens = Some(10_000);
        assert_eq!(performance_score(&config, 4096), 1.0);
        config.max_tokens = Some(0);
        assert_eq!(performance_score(&config, 4096), 0.0);
    }

    #[test]
    fn test_weighted_score() {
        let agent = planner_agent("a", VALID_PLAN)
            .with_description("Financial research analyst")
            .with_max_tokens(4096)
            .with_tool(DeclaredTool::new("web_search", ""));
        let a = analysis(&["web_search"], &["finance", "research"]);
        // 0.4 × 1 + 0.3 × 1 + 0.3 × 0.5
        assert!((score_agent(&agent, &a, 4096) - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_selects_highest_scoring_valid_plan() {
        let strong_but_no_plan: Arc<dyn Agent> = Arc::new(
            planner_agent("strong", "I refuse to plan")
                .with_tool(DeclaredTool::new("web_search", ""))
                .with_max_tokens(8192),
        );
        let weak: Arc<dyn Agent> = Arc::new(planner_agent("weak", VALID_PLAN));
        let good: Arc<dyn Agent> = Arc::new(
            planner_agent("good", VALID_PLAN).with_tool(DeclaredTool::new("web_search", "")),
        );

        let selected = select_best_agent_for_task(
            &[strong_but_no_plan, weak, good],
            &Task::new("t", "find news"),
            &analysis(&["search"], &[]),
            &[],
            4096,
        )
        .await
        .unwrap();
        assert_eq!(selected.agent.name(), "good");
        assert_eq!(selected.action_plan.unwrap().steps, vec!["do it"]);
    }

    #[tokio::test]
    async fn test_ties_go_to_first_candidate() {
        let first: Arc<dyn Agent> = Arc::new(planner_agent("first", VALID_PLAN));
        let second: Arc<dyn Agent> = Arc::new(planner_agent("second", VALID_PLAN));
        let selected = select_best_agent_for_task(
            &[first, second],
            &Task::new("t", "x"),
            &AgentTaskAnalysis::default(),
            &[],
            4096,
        )
        .await
        .unwrap();
        assert_eq!(selected.agent.name(), "first");
        assert_eq!(selected.score, 0.15);
    }

    #[tokio::test]
    async fn test_zero_score_selects_nothing() {
        let agent: Arc<dyn Agent> = Arc::new(planner_agent("a", VALID_PLAN).with_max_tokens(0));
        let selected = select_best_agent_for_task(
            &[agent],
            &Task::new("t", "x"),
            &AgentTaskAnalysis::default(),
            &[],
            4096,
        )
        .await;
        assert!(selected.is_none());
    }
}

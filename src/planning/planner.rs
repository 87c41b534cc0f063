//! Planner：调用语言模型得到任务分析与行动计划
//!
//! 每次模型调用都受任务 timeout 约束。
//! 分析失败（模型报错、超时或响应无法解析）降级为空分析；
//! 计划失败返回 PlanParseFailure / Timeout，由选择阶段把该候选排除。

use crate::core::{ErrorKind, Task, TaskError, Usage};
use crate::llm::{generate_within, LanguageModel};
use crate::planning::contract::{parse_action_plan, parse_analysis, AgentActionPlan, AgentTaskAnalysis};
use crate::planning::prompts::{analysis_prompt, plan_prompt};
use crate::tools::ToolInfo;

/// 分析任务需求；永不失败
pub async fn analyze_task(
    model: &dyn LanguageModel,
    task: &Task,
    context: &[String],
) -> (AgentTaskAnalysis, Usage) {
    let prompt = analysis_prompt(task, context);
    let generation = match generate_within(model, &prompt, task.timeout).await {
        Ok(g) => g,
        Err(e) => {
            tracing::warn!(
                task_id = %task.id,
                kind = %ErrorKind::AnalysisParseFailure,
                "analysis request failed, using empty analysis: {}",
                e
            );
            return (AgentTaskAnalysis::default(), Usage::default());
        }
    };
    match parse_analysis(&generation.text) {
        Ok(analysis) => {
            tracing::debug!(task_id = %task.id, ?analysis, "task analyzed");
            (analysis, generation.usage)
        }
        Err(e) => {
            tracing::warn!(
                task_id = %task.id,
                kind = %ErrorKind::AnalysisParseFailure,
                "analysis parse failed, using empty analysis: {}",
                e
            );
            (AgentTaskAnalysis::default(), generation.usage)
        }
    }
}

/// 请求行动计划；只返回通过自检的计划
pub async fn request_action_plan(
    model: &dyn LanguageModel,
    task: &Task,
    tools: &[ToolInfo],
    context: &[String],
) -> Result<(AgentActionPlan, Usage), TaskError> {
    let prompt = plan_prompt(task, tools, context);
    let generation = generate_within(model, &prompt, task.timeout).await?;
    let plan = parse_action_plan(&generation.text)
        .map_err(|e| TaskError::new(ErrorKind::PlanParseFailure, e.to_string()))?;
    if !plan.is_valid() {
        return Err(TaskError::new(
            ErrorKind::PlanParseFailure,
            "Plan failed self-validation (steps_valid / tools_available)",
        ));
    }
    Ok((plan, generation.usage))
}

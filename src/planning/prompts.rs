//! 分析 / 计划 / 执行提示词
//!
//! 提示词由带标签的分段组成，要求模型按 contract 中的标签格式作答；
//! 同时附上 JSON Schema，允许模型直接返回 JSON 对象。

use schemars::schema_for;

use crate::core::Task;
use crate::planning::contract::{AgentActionPlan, AgentTaskAnalysis};
use crate::tools::ToolInfo;

pub fn analysis_schema_json() -> String {
    serde_json::to_string_pretty(&schema_for!(AgentTaskAnalysis)).unwrap_or_default()
}

pub fn plan_schema_json() -> String {
    serde_json::to_string_pretty(&schema_for!(AgentActionPlan)).unwrap_or_default()
}

fn context_section(context: &[String]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n## Previous results\n");
    for (i, item) in context.iter().enumerate() {
        section.push_str(&format!("{}. {}\n", i + 1, item));
    }
    section
}

/// 任务需求分析提示词（orchestrator 使用）
pub fn analysis_prompt(task: &Task, context: &[String]) -> String {
    format!(
        "## Role\n\
         You analyze tasks and decide what an agent needs in order to complete them.\n\n\
         ## Task\n{prompt}\n{context}\n\
         ## Response format\n\
         Answer with exactly these sections:\n\
         <capabilities>comma separated tool capabilities</capabilities>\n\
         <complexity>number between 0 and 1</complexity>\n\
         <specialization>comma separated areas of expertise</specialization>\n\
         <required_actions>comma separated actions</required_actions>\n\
         <context_dependencies>comma separated dependencies, or none</context_dependencies>\n\n\
         Alternatively answer with a single JSON object matching this schema:\n{schema}\n",
        prompt = task.prompt(),
        context = context_section(context),
        schema = analysis_schema_json(),
    )
}

/// 行动计划提示词（候选 Agent 使用，列出其可用工具）
pub fn plan_prompt(task: &Task, tools: &[ToolInfo], context: &[String]) -> String {
    let tool_list = if tools.is_empty() {
        "(no tools)\n".to_string()
    } else {
        tools
            .iter()
            .map(|t| format!("- {}: {}\n", t.name, t.description))
            .collect::<String>()
    };
    format!(
        "## Task\n{prompt}\n{context}\n\
         ## Available tools\n{tool_list}\n\
         ## Response format\n\
         Plan the task using only the available tools. Answer with:\n\
         <steps>\n1. first action\n2. second action\n</steps>\n\
         <estimated_steps>number of steps</estimated_steps>\n\
         <fallbacks>\n- alternative action if a step fails\n</fallbacks>\n\
         <validation>\nsteps_valid: yes|no\ntools_available: yes|no\nfallbacks_defined: yes|no\n</validation>\n\n\
         Alternatively answer with a single JSON object matching this schema:\n{schema}\n",
        prompt = task.prompt(),
        context = context_section(context),
        schema = plan_schema_json(),
    )
}

/// 执行提示词：Agent 描述 + 拓扑角色 + 任务
pub fn execution_prompt(description: &str, tools: &[ToolInfo], task: &Task) -> String {
    let mut prompt = String::new();
    if !description.is_empty() {
        prompt.push_str(&format!("## Agent\n{description}\n\n"));
    }
    if !tools.is_empty() {
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        prompt.push_str(&format!("## Tools\n{}\n\n", names.join(", ")));
    }
    if let Some(role) = task.metadata("role").and_then(|v| v.as_str()) {
        prompt.push_str(&format!("## Role\n{role}\n\n"));
    }
    if let Some(round) = task.metadata("round") {
        prompt.push_str(&format!(
            "## Round\n{round}\nIf your answer no longer changes, finish with <converged>yes</converged>.\n\n"
        ));
    }
    prompt.push_str(&format!("## Task\n{}\n", task.prompt()));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_prompt_lists_tools_and_schema() {
        let task = Task::new("t", "write a report");
        let tools = vec![ToolInfo::new("web_search", "Search the web")];
        let prompt = plan_prompt(&task, &tools, &["earlier output".to_string()]);
        assert!(prompt.contains("- web_search: Search the web"));
        assert!(prompt.contains("1. earlier output"));
        assert!(prompt.contains("\"steps\""));
        assert!(prompt.contains("<validation>"));
    }

    #[test]
    fn test_execution_prompt_includes_role() {
        let task = Task::new("t", "plan it").with_metadata("role", "coordinator");
        let prompt = execution_prompt("Lead planner", &[], &task);
        assert!(prompt.contains("## Role\ncoordinator"));
        assert!(prompt.ends_with("## Task\nplan it\n"));
    }
}

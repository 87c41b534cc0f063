//! Agent 契约与基于语言模型的实现
//!
//! 编排核心（TopologyExecutor / AgenticExecutor）只依赖 Agent trait：
//! execute 执行任务，plan 给出步骤，tools / language_model / configuration 供选择与规划使用，
//! memory 暴露 Agent 独占的 MemoryManager。LlmAgent 是唯一的内置实现。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Task, TaskError, TaskResult};
use crate::llm::LanguageModel;
use crate::memory::{MemoryEntry, MemoryManager, MemoryRole, MemoryType};
use crate::planning::prompts::execution_prompt;
use crate::planning::{extract_tag, parse_flag, request_action_plan};
use crate::tools::{Tool, ToolInfo, ToolRegistry};

/// Agent 配置（描述用于专长匹配，max_tokens 用于性能分）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfiguration {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// Agent 契约
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// 执行任务；失败以 FAILED 结果返回，不抛错
    async fn execute(&self, task: &Task) -> TaskResult;

    /// 为任务给出有序步骤；默认用自己的语言模型按计划提示词生成
    async fn plan(&self, task: &Task) -> Result<Vec<String>, TaskError> {
        let model = self.language_model();
        let (plan, _) = request_action_plan(model.as_ref(), task, &self.tools(), &[]).await?;
        Ok(plan.steps)
    }

    fn tools(&self) -> Vec<ToolInfo>;

    fn language_model(&self) -> Arc<dyn LanguageModel>;

    fn configuration(&self) -> &AgentConfiguration;

    fn memory(&self) -> &MemoryManager;
}

/// 基于语言模型的 Agent：把任务（含拓扑角色 / 轮次）拼成提示词交给模型
pub struct LlmAgent {
    name: String,
    model: Arc<dyn LanguageModel>,
    tools: ToolRegistry,
    config: AgentConfiguration,
    memory: MemoryManager,
}

impl LlmAgent {
    pub fn new(name: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        let name = name.into();
        let memory = MemoryManager::in_memory(format!("{name}-memory"));
        Self {
            name,
            model,
            tools: ToolRegistry::new(),
            config: AgentConfiguration::default(),
            memory,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.config.description = description.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_memory(mut self, memory: MemoryManager) -> Self {
        self.memory = memory;
        self
    }

    pub fn tool_registry(&self) -> &ToolRegistry {
        &self.tools
    }

    /// 把回复写入自己的记忆（受任务 timeout 约束）；失败只记日志
    async fn remember(&self, task: &Task, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let entry = MemoryEntry::new(MemoryType::Conversation, text)
            .with_role(MemoryRole::Assistant)
            .with_agent(self.name.clone())
            .with_metadata("taskId", task.id.clone());
        match tokio::time::timeout(task.timeout, self.memory.add(entry)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(agent = %self.name, task_id = %task.id, "failed to record response: {}", e)
            }
            Err(_) => {
                tracing::warn!(agent = %self.name, task_id = %task.id, "recording response timed out")
            }
        }
    }
}

/// 去掉回复中的 `<converged>` 标记，返回 (正文, 是否收敛)
fn split_converged(text: &str) -> (String, Option<bool>) {
    match extract_tag(text, "converged") {
        Some(flag) => {
            let body = match (text.find("<converged>"), text.find("</converged>")) {
                (Some(start), Some(end)) => {
                    format!("{}{}", &text[..start], &text[end + "</converged>".len()..])
                }
                _ => text.to_string(),
            };
            (body.trim().to_string(), Some(parse_flag(&flag)))
        }
        None => (text.trim().to_string(), None),
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &Task) -> TaskResult {
        let started_at = Utc::now();
        let prompt = execution_prompt(&self.config.description, &self.tools.infos(), task);
        tracing::debug!(agent = %self.name, task_id = %task.id, "executing task");

        match self.model.generate_text(&prompt).await {
            Ok(generation) => {
                let (body, converged) = split_converged(&generation.text);
                self.remember(task, &body).await;
                // 空回复视为没有产出（output 为 null），由完成判定决定是否继续
                let output = if body.is_empty() {
                    Value::Null
                } else {
                    Value::String(body)
                };
                let mut result =
                    TaskResult::completed(output, started_at).with_usage(generation.usage);
                if let Some(flag) = converged {
                    result = result.with_converged(flag);
                }
                result
            }
            Err(e) => {
                tracing::warn!(agent = %self.name, task_id = %task.id, "model call failed: {}", e);
                TaskResult::failed(e.into(), started_at)
            }
        }
    }

    fn tools(&self) -> Vec<ToolInfo> {
        self.tools.infos()
    }

    fn language_model(&self) -> Arc<dyn LanguageModel> {
        Arc::clone(&self.model)
    }

    fn configuration(&self) -> &AgentConfiguration {
        &self.config
    }

    fn memory(&self) -> &MemoryManager {
        &self.memory
    }
}

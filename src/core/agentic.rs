//! Agentic 执行：分析 → 选择 → 计划 → 按步执行（失败走 fallback）→ 完成判定，最多 max_loops 轮
//!
//! 终止性失败（无合适 Agent、fallback 用尽）立即返回，不再进入下一轮；
//! 未完成则把已有中间结果作为上下文进入下一轮。所有失败都以 FAILED 结果返回，不向外抛错。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::config::OrchestratorSection;
use crate::core::dispatch::dispatch;
use crate::core::selection::{
    select_best_agent_for_task, AgentSelectionResult, DEFAULT_REFERENCE_TOKEN_BUDGET,
};
use crate::core::{ErrorKind, ExecutionMetrics, Task, TaskError, TaskResult, TaskStatus, Usage};
use crate::memory::{MemoryEntry, MemoryType};
use crate::planning::{analyze_task, AgentActionPlan};

#[derive(Debug, Clone)]
pub struct AgenticConfig {
    pub max_loops: u32,
    /// 性能分的参考 token 预算
    pub reference_token_budget: u32,
}

impl Default for AgenticConfig {
    fn default() -> Self {
        Self {
            max_loops: 3,
            reference_token_budget: DEFAULT_REFERENCE_TOKEN_BUDGET,
        }
    }
}

impl From<&OrchestratorSection> for AgenticConfig {
    fn from(section: &OrchestratorSection) -> Self {
        Self {
            max_loops: section.max_loops.max(1),
            reference_token_budget: section.reference_token_budget,
        }
    }
}

/// 一次执行中的中间记录
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub loop_index: u32,
    pub agent: String,
    /// 步骤或 fallback 的动作描述
    pub action: String,
    pub is_fallback: bool,
    pub result: TaskResult,
}

/// execute 的完整输出
#[derive(Debug, Clone)]
pub struct AgenticOutcome {
    pub result: TaskResult,
    pub intermediate_results: Vec<StepRecord>,
    /// 每轮选中的 Agent
    pub selected_agents: Vec<String>,
    pub loops: u32,
}

/// 一轮计划执行的结局
enum LoopEnd {
    /// 所有步骤跑完（或直接执行），最后一条结果用于完成判定
    Finished(TaskResult),
    /// 步骤失败且 fallback 用尽 / 被取消
    Terminal(TaskResult),
}

pub struct AgenticExecutor {
    orchestrator: Arc<dyn Agent>,
    candidates: Vec<Arc<dyn Agent>>,
    config: AgenticConfig,
    metrics: ExecutionMetrics,
    cancel: CancellationToken,
}

impl AgenticExecutor {
    pub fn new(orchestrator: Arc<dyn Agent>, candidates: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            orchestrator,
            candidates,
            config: AgenticConfig::default(),
            metrics: ExecutionMetrics::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: AgenticConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub fn take_metrics(&mut self) -> ExecutionMetrics {
        std::mem::take(&mut self.metrics)
    }

    /// 执行任务，返回最终结果与中间记录
    pub async fn execute(&mut self, task: Task) -> AgenticOutcome {
        let started_at = Utc::now();
        tracing::info!(
            task_id = %task.id,
            candidates = self.candidates.len(),
            max_loops = self.config.max_loops,
            "agentic execution started"
        );

        let mut run = Run {
            task: &task,
            cancel: &self.cancel,
            started_at,
            records: Vec::new(),
            selected: Vec::new(),
            usage: Usage::default(),
            loops: 0,
        };
        let result = run
            .drive(self.orchestrator.as_ref(), &self.candidates, &self.config)
            .await
            .with_usage(run.usage);

        self.metrics
            .record(result.status == TaskStatus::Completed, result.duration_ms as f64);
        tracing::info!(
            task_id = %task.id,
            status = result.status.as_str(),
            loops = run.loops,
            "agentic execution finished"
        );

        AgenticOutcome {
            result,
            intermediate_results: run.records,
            selected_agents: run.selected,
            loops: run.loops,
        }
    }
}

/// 单次 execute 的可变状态
struct Run<'a> {
    task: &'a Task,
    cancel: &'a CancellationToken,
    started_at: DateTime<Utc>,
    records: Vec<StepRecord>,
    selected: Vec<String>,
    usage: Usage,
    loops: u32,
}

impl Run<'_> {
    fn fail(&self, kind: ErrorKind, message: impl Into<String>) -> TaskResult {
        TaskResult::failed(TaskError::new(kind, message), self.started_at)
    }

    /// 前几轮的中间结果，作为下一轮分析 / 计划的上下文
    fn context(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| match r.result.status {
                TaskStatus::Completed => format!("{}: {}", r.action, r.result.output_text()),
                _ => format!(
                    "{} failed: {}",
                    r.action,
                    r.result.error_message().unwrap_or("cancelled")
                ),
            })
            .collect()
    }

    async fn drive(
        &mut self,
        orchestrator: &dyn Agent,
        candidates: &[Arc<dyn Agent>],
        config: &AgenticConfig,
    ) -> TaskResult {
        for loop_index in 1..=config.max_loops {
            if self.cancel.is_cancelled() {
                return TaskResult::cancelled(self.started_at);
            }
            self.loops = loop_index;
            let context = self.context();

            let model = orchestrator.language_model();
            let (analysis, usage) = analyze_task(model.as_ref(), self.task, &context).await;
            self.usage.accumulate(&usage);

            let Some(selection) = select_best_agent_for_task(
                candidates,
                self.task,
                &analysis,
                &context,
                config.reference_token_budget,
            )
            .await
            else {
                return self.fail(ErrorKind::SelectionFailure, "No suitable agent found");
            };
            self.usage.accumulate(&selection.usage);
            self.selected.push(selection.agent.name().to_string());

            match self.run_selection(&selection, loop_index).await {
                LoopEnd::Terminal(result) => return result,
                LoopEnd::Finished(last) if last.is_complete() => {
                    return TaskResult::completed(last.output.unwrap_or(Value::Null), self.started_at);
                }
                LoopEnd::Finished(_) => {
                    tracing::info!(task_id = %self.task.id, loop_index, "task not complete, looping");
                }
            }
        }

        self.fail(
            ErrorKind::LoopExhausted,
            format!("Task not completed within {} loops", config.max_loops),
        )
    }

    async fn run_selection(&mut self, selection: &AgentSelectionResult, loop_index: u32) -> LoopEnd {
        let agent = selection.agent.as_ref();
        let plan = match &selection.action_plan {
            Some(plan) => plan,
            None => {
                let action = self.task.prompt().to_string();
                let result = self.run_action(agent, &action, loop_index, false).await;
                return LoopEnd::Finished(result);
            }
        };
        self.run_plan(agent, plan, loop_index).await
    }

    async fn run_plan(&mut self, agent: &dyn Agent, plan: &AgentActionPlan, loop_index: u32) -> LoopEnd {
        let mut last = None;
        for (index, step) in plan.steps.iter().enumerate() {
            let result = self.run_action(agent, step, loop_index, false).await;
            match result.status {
                TaskStatus::Completed => {
                    last = Some(result);
                    continue;
                }
                TaskStatus::Cancelled => return LoopEnd::Terminal(TaskResult::cancelled(self.started_at)),
                _ => {}
            }

            tracing::warn!(
                agent = agent.name(),
                step = index + 1,
                fallbacks = plan.fallbacks.len(),
                "step failed, trying fallbacks"
            );
            match self.run_fallbacks(agent, &plan.fallbacks, loop_index, result).await {
                Ok(recovered) => last = Some(recovered),
                Err(end) => return end,
            }
        }
        match last {
            Some(result) => LoopEnd::Finished(result),
            None => LoopEnd::Finished(self.fail(ErrorKind::Internal, "Plan has no steps")),
        }
    }

    /// 按顺序尝试 fallback；首个成功者代替失败步骤。全部失败时以最后一次结果终止（step_failure）
    async fn run_fallbacks(
        &mut self,
        agent: &dyn Agent,
        fallbacks: &[String],
        loop_index: u32,
        failed_step: TaskResult,
    ) -> Result<TaskResult, LoopEnd> {
        let mut last_failure = failed_step;
        for fallback in fallbacks {
            let result = self.run_action(agent, fallback, loop_index, true).await;
            match result.status {
                TaskStatus::Completed => {
                    tracing::info!(agent = agent.name(), fallback = %fallback, "fallback succeeded");
                    return Ok(result);
                }
                TaskStatus::Cancelled => {
                    return Err(LoopEnd::Terminal(TaskResult::cancelled(self.started_at)))
                }
                _ => last_failure = result,
            }
        }

        let message = last_failure
            .error_message()
            .unwrap_or("Step failed")
            .to_string();
        tracing::warn!(agent = agent.name(), "all fallbacks exhausted: {}", message);
        Err(LoopEnd::Terminal(TaskResult::failed(
            TaskError::new(ErrorKind::StepFailure, message),
            self.started_at,
        )))
    }

    /// 以子任务执行一个动作，记录中间结果并写入 Agent 记忆
    async fn run_action(
        &mut self,
        agent: &dyn Agent,
        action: &str,
        loop_index: u32,
        is_fallback: bool,
    ) -> TaskResult {
        let prompt = if action == self.task.prompt() {
            action.to_string()
        } else {
            format!("{action}\n\n## Overall task\n{}", self.task.prompt())
        };
        let sub = self
            .task
            .sub_task(format!("{}:{}", self.task.name, action), prompt)
            .with_metadata("loop", loop_index)
            .with_metadata("fallback", is_fallback);
        let sub_id = sub.id.clone();

        let result = dispatch(agent, sub, self.cancel).await;
        if let Some(u) = &result.usage {
            self.usage.accumulate(u);
        }
        record_to_memory(agent, &sub_id, action, &result, self.task.timeout).await;

        self.records.push(StepRecord {
            loop_index,
            agent: agent.name().to_string(),
            action: action.to_string(),
            is_fallback,
            result: result.clone(),
        });
        result
    }
}

/// 写入 Agent 记忆：动作记为 task，结果记为 result / error；失败或超时只记日志
async fn record_to_memory(
    agent: &dyn Agent,
    task_id: &str,
    action: &str,
    result: &TaskResult,
    limit: Duration,
) {
    let mut entries = vec![MemoryEntry::new(MemoryType::Task, action)];
    match result.status {
        TaskStatus::Completed => {
            let text = result.output_text();
            if !text.trim().is_empty() {
                entries.push(MemoryEntry::new(MemoryType::Result, text));
            }
        }
        _ => {
            let message = result.error_message().unwrap_or("cancelled");
            entries.push(MemoryEntry::new(MemoryType::Error, message).with_importance(0.8));
        }
    }
    let entries = entries
        .into_iter()
        .filter(|e| !e.content.trim().is_empty())
        .map(|e| e.with_agent(agent.name()).with_metadata("taskId", task_id))
        .collect::<Vec<_>>();
    if entries.is_empty() {
        return;
    }
    match tokio::time::timeout(limit, agent.memory().add_many(entries)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::warn!(agent = agent.name(), task_id, "failed to record step in memory: {}", e)
        }
        Err(_) => tracing::warn!(
            agent = agent.name(),
            task_id,
            kind = %ErrorKind::Timeout,
            "recording step in memory timed out"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LlmAgent;
    use crate::llm::{Generation, LanguageModel, LlmError, ScriptedLanguageModel};
    use crate::memory::QueryOptions;
    use crate::tools::DeclaredTool;

    const ANALYSIS: &str = "<capabilities>web_search</capabilities><complexity>0.4</complexity>\
        <specialization>research</specialization>";

    fn orchestrator() -> Arc<dyn Agent> {
        Arc::new(LlmAgent::new(
            "orchestrator",
            Arc::new(ScriptedLanguageModel::new("orchestrator").with_default(ANALYSIS)),
        ))
    }

    fn plan(steps: &[&str], fallbacks: &[&str]) -> String {
        let steps: String = steps
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}\n", i + 1, s))
            .collect();
        let fallbacks: String = fallbacks.iter().map(|f| format!("- {f}\n")).collect();
        format!(
            "<steps>\n{steps}</steps>\n<fallbacks>\n{fallbacks}</fallbacks>\n\
             <validation>\nsteps_valid: yes\ntools_available: yes\nfallbacks_defined: yes\n</validation>"
        )
    }

    fn researcher(model: Arc<ScriptedLanguageModel>) -> Arc<dyn Agent> {
        Arc::new(
            LlmAgent::new("researcher", model)
                .with_description("research specialist")
                .with_tool(DeclaredTool::new("web_search", "Search the web")),
        )
    }

    #[tokio::test]
    async fn test_completes_plan_in_one_loop() {
        let model = Arc::new(
            ScriptedLanguageModel::new("r")
                .with_rule("<steps>", plan(&["gather sources", "write summary"], &[]))
                .with_rule("gather sources", "three sources")
                .with_rule("write summary", "the summary"),
        );
        let mut executor = AgenticExecutor::new(orchestrator(), vec![researcher(model)]);
        let outcome = executor.execute(Task::new("t", "summarize the news")).await;

        assert_eq!(outcome.result.status, TaskStatus::Completed);
        assert_eq!(outcome.result.output_text(), "the summary");
        assert_eq!(outcome.loops, 1);
        assert_eq!(outcome.selected_agents, vec!["researcher"]);
        assert_eq!(outcome.intermediate_results.len(), 2);
        assert_eq!(executor.metrics().successful_tasks, 1);
    }

    #[tokio::test]
    async fn test_no_valid_plan_is_selection_failure() {
        let model = Arc::new(ScriptedLanguageModel::new("r").with_default("cannot plan"));
        let mut executor = AgenticExecutor::new(orchestrator(), vec![researcher(model.clone())]);
        let outcome = executor.execute(Task::new("t", "x")).await;
        assert_eq!(outcome.result.error_message(), Some("No suitable agent found"));
        assert_eq!(outcome.result.error.unwrap().kind, ErrorKind::SelectionFailure);
        assert_eq!(outcome.loops, 1);
        // 只请求过一次计划
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_fallbacks_fail_with_last_fallback_error() {
        let model = Arc::new(
            ScriptedLanguageModel::new("r")
                .with_rule("<steps>", plan(&["primary step"], &["first fallback", "second fallback"]))
                .with_error_rule("primary step", LlmError::ApiError("primary broke".into()))
                .with_error_rule("first fallback", LlmError::ApiError("first broke".into()))
                .with_error_rule("second fallback", LlmError::ApiError("second broke".into())),
        );
        let mut executor = AgenticExecutor::new(orchestrator(), vec![researcher(model)]);
        let outcome = executor.execute(Task::new("t", "x")).await;

        let error = outcome.result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StepFailure);
        assert!(error.message.contains("second broke"));
        assert_eq!(outcome.loops, 1);
        assert_eq!(outcome.intermediate_results.len(), 3);
    }

    #[tokio::test]
    async fn test_step_without_fallbacks_fails_with_own_error() {
        let model = Arc::new(
            ScriptedLanguageModel::new("r")
                .with_rule("<steps>", plan(&["only step"], &[]))
                .with_error_rule("only step", LlmError::Validation("bad input".into())),
        );
        let mut executor = AgenticExecutor::new(orchestrator(), vec![researcher(model)]);
        let outcome = executor.execute(Task::new("t", "x")).await;
        assert!(outcome.result.error_message().unwrap().contains("bad input"));
    }

    #[tokio::test]
    async fn test_loop_exhausted_when_output_stays_empty() {
        let model = Arc::new(
            ScriptedLanguageModel::new("r")
                .with_rule("<steps>", plan(&["think"], &[]))
                .with_rule("think", ""),
        );
        let mut executor = AgenticExecutor::new(orchestrator(), vec![researcher(model.clone())])
            .with_config(AgenticConfig {
                max_loops: 2,
                ..Default::default()
            });
        let outcome = executor.execute(Task::new("t", "x")).await;
        assert_eq!(
            outcome.result.error_message(),
            Some("Task not completed within 2 loops")
        );
        assert_eq!(outcome.loops, 2);
        assert_eq!(outcome.selected_agents.len(), 2);

        // 第二轮计划提示携带第一轮的中间结果
        let plan_prompts: Vec<String> = model
            .prompts()
            .into_iter()
            .filter(|p| p.contains("<steps>"))
            .collect();
        assert_eq!(plan_prompts.len(), 2);
        assert!(!plan_prompts[0].contains("## Previous results"));
        assert!(plan_prompts[1].contains("## Previous results\n1. think: "));
    }

    /// 永不返回的模型
    struct StalledModel;

    #[async_trait::async_trait]
    impl LanguageModel for StalledModel {
        fn model_name(&self) -> &str {
            "stalled"
        }

        async fn generate_text(&self, _prompt: &str) -> Result<Generation, LlmError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(LlmError::ApiError("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_stalled_models_still_yield_a_result() {
        let orchestrator: Arc<dyn Agent> = Arc::new(LlmAgent::new("orchestrator", Arc::new(StalledModel)));
        let candidate: Arc<dyn Agent> = Arc::new(LlmAgent::new("slow", Arc::new(StalledModel)));
        let mut executor = AgenticExecutor::new(orchestrator, vec![candidate]);
        let task = Task::new("t", "x").with_timeout(Duration::from_millis(50));

        let outcome = tokio::time::timeout(Duration::from_secs(2), executor.execute(task))
            .await
            .expect("executor must return within the task timeout");
        assert_eq!(outcome.result.status, TaskStatus::Failed);
        assert_eq!(outcome.result.error_message(), Some("No suitable agent found"));
    }

    #[tokio::test]
    async fn test_steps_are_recorded_in_agent_memory() {
        let model = Arc::new(
            ScriptedLanguageModel::new("r")
                .with_rule("<steps>", plan(&["collect figures"], &[]))
                .with_rule("collect figures", "revenue grew"),
        );
        let agent = researcher(model);
        let mut executor = AgenticExecutor::new(orchestrator(), vec![agent.clone()]);
        executor.execute(Task::new("t", "x")).await;

        let results = agent
            .memory()
            .search("revenue", &QueryOptions::default().with_filter("type", "result"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}

//! 拓扑执行：把一个任务分发到固定的一组 Agent
//!
//! - Sequential：上一个 Agent 的输出作为下一个的提示，首个失败即返回
//! - Parallel：同一提示并发发给所有 Agent（Semaphore 限流），失败转为标记值，只返回成功输出（保持顺序）
//! - Hierarchical：首个 Agent 为协调者出计划 → 其余 Agent 并行执行 → 协调者汇总
//! - Mesh：多轮 Parallel，每轮以上一轮序列化输出 + 轮次为提示，全部收敛或达到轮数上限即停止
//!
//! 每次调用都把成功 / 失败与耗时记入执行器自己持有的 ExecutionMetrics。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::config::TopologySection;
use crate::core::dispatch::dispatch;
use crate::core::{ErrorKind, ExecutionMetrics, Task, TaskError, TaskResult, TaskStatus, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Sequential,
    Parallel,
    Hierarchical,
    Mesh,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Sequential => "sequential",
            Topology::Parallel => "parallel",
            Topology::Hierarchical => "hierarchical",
            Topology::Mesh => "mesh",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topology {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Topology::Sequential),
            "parallel" => Ok(Topology::Parallel),
            "hierarchical" => Ok(Topology::Hierarchical),
            "mesh" => Ok(Topology::Mesh),
            _ => Err(TaskError::new(
                ErrorKind::TopologyUnsupported,
                format!("Unsupported topology: {s}"),
            )),
        }
    }
}

/// 拓扑执行配置
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Mesh 默认轮数上限（可被任务元数据 maxConcurrency 覆盖）
    pub mesh_max_rounds: u32,
    pub max_parallel_agents: usize,
    /// 没有 worker 时是否允许只由协调者完成
    pub allow_coordinator_only: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            mesh_max_rounds: 5,
            max_parallel_agents: 8,
            allow_coordinator_only: false,
        }
    }
}

impl From<&TopologySection> for TopologyConfig {
    fn from(section: &TopologySection) -> Self {
        Self {
            mesh_max_rounds: section.mesh_max_rounds.max(1),
            max_parallel_agents: section.max_parallel_agents.max(1),
            allow_coordinator_only: section.allow_coordinator_only,
        }
    }
}

/// Parallel 中单个 Agent 的结果；失败被标记而不是中断整组
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    Succeeded { agent: String, result: TaskResult },
    Failed { agent: String, error: TaskError },
}

impl AgentOutcome {
    pub fn agent(&self) -> &str {
        match self {
            AgentOutcome::Succeeded { agent, .. } | AgentOutcome::Failed { agent, .. } => agent,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, AgentOutcome::Succeeded { result, .. } if result.converged == Some(true))
    }
}

/// 一组 Parallel 结果的汇总
struct ParallelRound {
    outcomes: Vec<AgentOutcome>,
    usage: Usage,
}

impl ParallelRound {
    fn outputs(&self) -> Vec<Value> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                AgentOutcome::Succeeded { result, .. } => {
                    Some(result.output.clone().unwrap_or(Value::Null))
                }
                AgentOutcome::Failed { .. } => None,
            })
            .collect()
    }

    fn all_failed(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|o| matches!(o, AgentOutcome::Succeeded { .. }))
    }

    fn failure_summary(&self) -> String {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                AgentOutcome::Failed { agent, error } => Some(format!("{agent}: {error}")),
                AgentOutcome::Succeeded { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn serialize_outputs(outputs: &[Value]) -> String {
    serde_json::to_string(outputs).unwrap_or_else(|_| "[]".to_string())
}

/// 按拓扑策略把任务分发给一组 Agent
pub struct TopologyExecutor {
    agents: Vec<Arc<dyn Agent>>,
    config: TopologyConfig,
    semaphore: Arc<Semaphore>,
    metrics: ExecutionMetrics,
    cancel: CancellationToken,
}

impl TopologyExecutor {
    pub fn new(agents: Vec<Arc<dyn Agent>>) -> Self {
        Self::with_config(agents, TopologyConfig::default())
    }

    pub fn with_config(agents: Vec<Arc<dyn Agent>>, config: TopologyConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_agents.max(1)));
        Self {
            agents,
            config,
            semaphore,
            metrics: ExecutionMetrics::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// 外部取消令牌：取消后在途调用的结果被丢弃，任务记为 CANCELLED
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn agents(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    /// 取走当前统计并清零，由调用方合并
    pub fn take_metrics(&mut self) -> ExecutionMetrics {
        std::mem::take(&mut self.metrics)
    }

    /// 按名称执行；未知拓扑立即失败，不调用任何 Agent
    pub async fn execute_named(&mut self, topology: &str, task: Task) -> TaskResult {
        match topology.parse::<Topology>() {
            Ok(t) => self.execute(t, task).await,
            Err(e) => {
                tracing::warn!(task_id = %task.id, topology, "{}", e);
                let result = TaskResult::failed(e, Utc::now());
                self.metrics.record(false, result.duration_ms as f64);
                result
            }
        }
    }

    pub async fn execute(&mut self, topology: Topology, task: Task) -> TaskResult {
        let started_at = Utc::now();
        tracing::info!(
            task_id = %task.id,
            topology = %topology,
            agents = self.agents.len(),
            "topology execution started"
        );

        let result = match topology {
            Topology::Sequential => self.run_sequential(&task, started_at).await,
            Topology::Parallel => self.run_parallel(&task, started_at).await,
            Topology::Hierarchical => self.run_hierarchical(&task, started_at).await,
            Topology::Mesh => self.run_mesh(&task, started_at).await,
        };
        let result = if self.cancel.is_cancelled() && result.status != TaskStatus::Completed {
            TaskResult::cancelled(started_at)
        } else {
            result
        };

        self.metrics
            .record(result.status == TaskStatus::Completed, result.duration_ms as f64);
        tracing::info!(
            task_id = %task.id,
            topology = %topology,
            status = result.status.as_str(),
            duration_ms = result.duration_ms,
            "topology execution finished"
        );
        result
    }

    fn no_agents(started_at: chrono::DateTime<Utc>) -> TaskResult {
        TaskResult::failed(
            TaskError::new(ErrorKind::Validation, "No agents available"),
            started_at,
        )
    }

    async fn run_sequential(&self, task: &Task, started_at: chrono::DateTime<Utc>) -> TaskResult {
        if self.agents.is_empty() {
            return Self::no_agents(started_at);
        }
        let mut usage = Usage::default();
        let mut prompt = task.prompt().to_string();
        let mut last_output = Value::Null;

        for (index, agent) in self.agents.iter().enumerate() {
            let step = task
                .sub_task(format!("{}:{}", task.name, agent.name()), prompt.clone())
                .with_metadata("position", index);
            let result = dispatch(agent.as_ref(), step, &self.cancel).await;
            if let Some(u) = &result.usage {
                usage.accumulate(u);
            }
            if result.status != TaskStatus::Completed {
                tracing::warn!(agent = agent.name(), position = index, "sequential chain stopped");
                return Self::rebase(result, started_at);
            }
            prompt = result.output_text();
            last_output = result.output.unwrap_or(Value::Null);
        }

        TaskResult::completed(last_output, started_at).with_usage(usage)
    }

    /// 失败 / 取消结果改用整体开始时间
    fn rebase(result: TaskResult, started_at: chrono::DateTime<Utc>) -> TaskResult {
        match (result.status, result.error) {
            (TaskStatus::Cancelled, _) => TaskResult::cancelled(started_at),
            (_, Some(error)) => TaskResult::failed(error, started_at),
            (_, None) => TaskResult::failed(
                TaskError::internal("Agent returned no result"),
                started_at,
            ),
        }
    }

    /// 对一组 Agent 并发执行同一提示；结果顺序与 agents 一致
    async fn fan_out(&self, agents: &[Arc<dyn Agent>], task: &Task, prompt: &str) -> ParallelRound {
        let outcomes = join_all(agents.iter().map(|agent| {
            let sub = task.sub_task(format!("{}:{}", task.name, agent.name()), prompt);
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let name = agent.name().to_string();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return AgentOutcome::Failed {
                            agent: name,
                            error: TaskError::internal("Parallel semaphore closed"),
                        }
                    }
                };
                let result = dispatch(agent.as_ref(), sub, &self.cancel).await;
                match (result.status, result.error.clone()) {
                    (TaskStatus::Completed, _) => AgentOutcome::Succeeded { agent: name, result },
                    (TaskStatus::Cancelled, _) => AgentOutcome::Failed {
                        agent: name,
                        error: TaskError::internal("Cancelled"),
                    },
                    (_, error) => AgentOutcome::Failed {
                        agent: name,
                        error: error
                            .unwrap_or_else(|| TaskError::internal("Agent returned no result")),
                    },
                }
            }
        }))
        .await;

        let mut usage = Usage::default();
        for outcome in &outcomes {
            match outcome {
                AgentOutcome::Succeeded { result, .. } => {
                    if let Some(u) = &result.usage {
                        usage.accumulate(u);
                    }
                }
                AgentOutcome::Failed { agent, error } => {
                    tracing::warn!(agent = %agent, kind = %error.kind, "parallel branch failed: {}", error);
                }
            }
        }
        ParallelRound { outcomes, usage }
    }

    /// 并发执行并返回每个 Agent 的标记结果（调用方自行汇总）
    pub async fn parallel_outcomes(&self, task: &Task) -> Vec<AgentOutcome> {
        self.fan_out(&self.agents, task, task.prompt()).await.outcomes
    }

    async fn run_parallel(&self, task: &Task, started_at: chrono::DateTime<Utc>) -> TaskResult {
        if self.agents.is_empty() {
            return Self::no_agents(started_at);
        }
        let round = self.fan_out(&self.agents, task, task.prompt()).await;
        if round.all_failed() {
            tracing::warn!(
                task_id = %task.id,
                failures = %round.failure_summary(),
                "every parallel agent failed"
            );
        }
        TaskResult::completed(Value::Array(round.outputs()), started_at).with_usage(round.usage)
    }

    async fn run_hierarchical(&self, task: &Task, started_at: chrono::DateTime<Utc>) -> TaskResult {
        let Some((coordinator, workers)) = self.agents.split_first() else {
            return TaskResult::failed(
                TaskError::new(ErrorKind::Validation, "No coordinator agent available"),
                started_at,
            );
        };
        if workers.is_empty() && !self.config.allow_coordinator_only {
            return TaskResult::failed(
                TaskError::new(ErrorKind::Validation, "No worker agents available"),
                started_at,
            );
        }

        let mut usage = Usage::default();
        let plan_task = task
            .sub_task(format!("{}:plan", task.name), task.prompt())
            .with_metadata("role", "coordinator");
        let plan = dispatch(coordinator.as_ref(), plan_task, &self.cancel).await;
        if let Some(u) = &plan.usage {
            usage.accumulate(u);
        }
        if plan.status != TaskStatus::Completed {
            tracing::warn!(agent = coordinator.name(), "coordinator failed to plan");
            return Self::rebase(plan, started_at);
        }
        if workers.is_empty() {
            tracing::info!(agent = coordinator.name(), "coordinator-only execution");
            return TaskResult::completed(plan.output.unwrap_or(Value::Null), started_at)
                .with_usage(usage);
        }

        let round = self.fan_out(workers, task, &plan.output_text()).await;
        usage.accumulate(&round.usage);
        // 汇总阶段的前提：至少一个 worker 有产出
        if round.all_failed() {
            return TaskResult::failed(
                TaskError::internal(format!("All agents failed: {}", round.failure_summary())),
                started_at,
            );
        }

        let aggregate_task = task
            .sub_task(format!("{}:aggregate", task.name), serialize_outputs(&round.outputs()))
            .with_metadata("role", "aggregator");
        let aggregate = dispatch(coordinator.as_ref(), aggregate_task, &self.cancel).await;
        if let Some(u) = &aggregate.usage {
            usage.accumulate(u);
        }
        if aggregate.status != TaskStatus::Completed {
            return Self::rebase(aggregate, started_at);
        }
        TaskResult::completed(aggregate.output.unwrap_or(Value::Null), started_at).with_usage(usage)
    }

    /// Mesh 轮数上限：任务元数据 maxConcurrency 优先
    fn mesh_rounds(&self, task: &Task) -> u32 {
        task.metadata("maxConcurrency")
            .and_then(Value::as_u64)
            .map(|n| n.clamp(1, u32::MAX as u64) as u32)
            .unwrap_or(self.config.mesh_max_rounds)
            .max(1)
    }

    async fn run_mesh(&self, task: &Task, started_at: chrono::DateTime<Utc>) -> TaskResult {
        if self.agents.is_empty() {
            return Self::no_agents(started_at);
        }
        let max_rounds = self.mesh_rounds(task);
        let mut usage = Usage::default();
        let mut previous = task.prompt().to_string();
        let mut outputs = Vec::new();
        let mut converged = false;

        for round_index in 1..=max_rounds {
            if self.cancel.is_cancelled() {
                return TaskResult::cancelled(started_at);
            }
            let round_task = task.clone().with_metadata("round", round_index);
            let prompt = format!("[round {round_index}]\n{previous}");
            let round = self.fan_out(&self.agents, &round_task, &prompt).await;
            usage.accumulate(&round.usage);
            outputs = round.outputs();
            if round.all_failed() {
                tracing::warn!(
                    task_id = %task.id,
                    round = round_index,
                    failures = %round.failure_summary(),
                    "every mesh agent failed, stopping"
                );
                break;
            }

            previous = serialize_outputs(&outputs);
            converged = round.outcomes.iter().all(AgentOutcome::is_converged);
            tracing::debug!(round = round_index, converged, "mesh round finished");
            if converged {
                tracing::info!(task_id = %task.id, rounds = round_index, "mesh converged");
                break;
            }
        }

        TaskResult::completed(Value::Array(outputs), started_at)
            .with_usage(usage)
            .with_converged(converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LlmAgent;
    use crate::llm::{LlmError, ScriptedLanguageModel};

    fn agent(name: &str, reply: &str) -> Arc<dyn Agent> {
        Arc::new(LlmAgent::new(
            name,
            Arc::new(ScriptedLanguageModel::new(name).with_default(reply)),
        ))
    }

    fn failing(name: &str) -> Arc<dyn Agent> {
        Arc::new(LlmAgent::new(
            name,
            Arc::new(
                ScriptedLanguageModel::new(name).with_error_rule("", LlmError::ApiError("down".into())),
            ),
        ))
    }

    #[test]
    fn test_parse_topology() {
        assert_eq!("Mesh".parse::<Topology>().unwrap(), Topology::Mesh);
        let err = "star".parse::<Topology>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::TopologyUnsupported);
        assert_eq!(err.message, "Unsupported topology: star");
    }

    #[tokio::test]
    async fn test_unsupported_topology_invokes_nobody() {
        let model = Arc::new(ScriptedLanguageModel::new("m"));
        let a: Arc<dyn Agent> = Arc::new(LlmAgent::new("a", model.clone()));
        let mut executor = TopologyExecutor::new(vec![a]);
        let result = executor.execute_named("ring", Task::new("t", "x")).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(model.call_count(), 0);
        assert_eq!(executor.metrics().failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_parallel_all_failed_completes_empty() {
        let mut executor = TopologyExecutor::new(vec![failing("a"), failing("b")]);
        let result = executor.execute(Topology::Parallel, Task::new("t", "x")).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.output, Some(Value::Array(Vec::new())));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_mesh_all_failed_round_ends_with_empty_output() {
        let mut executor = TopologyExecutor::new(vec![failing("a")]);
        let task = Task::new("t", "x").with_metadata("maxConcurrency", 4);
        let result = executor.execute(Topology::Mesh, task).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.output, Some(Value::Array(Vec::new())));
        assert_eq!(result.converged, Some(false));
    }

    #[tokio::test]
    async fn test_hierarchical_requires_a_worker_output() {
        let mut executor = TopologyExecutor::new(vec![agent("lead", "plan"), failing("w")]);
        let result = executor.execute(Topology::Hierarchical, Task::new("t", "x")).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_message().unwrap().starts_with("All agents failed"));
    }

    #[tokio::test]
    async fn test_parallel_outcomes_are_tagged() {
        let executor = TopologyExecutor::new(vec![agent("a", "A"), failing("b")]);
        let outcomes = executor.parallel_outcomes(&Task::new("t", "x")).await;
        assert!(matches!(outcomes[0], AgentOutcome::Succeeded { .. }));
        assert!(matches!(&outcomes[1], AgentOutcome::Failed { agent, .. } if agent == "b"));
    }

    #[tokio::test]
    async fn test_hierarchical_roles_and_aggregation() {
        let coordinator_model = Arc::new(
            ScriptedLanguageModel::new("lead")
                .with_rule("## Role\naggregator", "final report")
                .with_rule("## Role\ncoordinator", "plan: split work"),
        );
        let coordinator: Arc<dyn Agent> = Arc::new(LlmAgent::new("lead", coordinator_model.clone()));
        let worker_model = Arc::new(ScriptedLanguageModel::new("w").with_default("part"));
        let worker: Arc<dyn Agent> = Arc::new(LlmAgent::new("w", worker_model.clone()));

        let mut executor = TopologyExecutor::new(vec![coordinator, worker]);
        let result = executor.execute(Topology::Hierarchical, Task::new("t", "report")).await;
        assert_eq!(result.output_text(), "final report");

        assert!(worker_model.prompts()[0].contains("plan: split work"));
        let prompts = coordinator_model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains(r#"["part"]"#));
    }

    #[tokio::test]
    async fn test_hierarchical_without_agents_or_workers() {
        let mut executor = TopologyExecutor::new(Vec::new());
        let result = executor.execute(Topology::Hierarchical, Task::new("t", "x")).await;
        assert_eq!(result.error_message(), Some("No coordinator agent available"));

        let mut executor = TopologyExecutor::new(vec![agent("lead", "plan")]);
        let result = executor.execute(Topology::Hierarchical, Task::new("t", "x")).await;
        assert_eq!(result.error_message(), Some("No worker agents available"));

        let config = TopologyConfig {
            allow_coordinator_only: true,
            ..Default::default()
        };
        let mut executor = TopologyExecutor::with_config(vec![agent("lead", "plan")], config);
        let result = executor.execute(Topology::Hierarchical, Task::new("t", "x")).await;
        assert_eq!(result.output_text(), "plan");
    }

    #[tokio::test]
    async fn test_mesh_round_limit_from_metadata() {
        let model = Arc::new(ScriptedLanguageModel::new("m").with_default("never settles"));
        let a: Arc<dyn Agent> = Arc::new(LlmAgent::new("a", model.clone()));
        let mut executor = TopologyExecutor::new(vec![a]);
        let task = Task::new("t", "x").with_metadata("maxConcurrency", 3);
        let result = executor.execute(Topology::Mesh, task).await;
        assert_eq!(model.call_count(), 3);
        assert_eq!(result.converged, Some(false));
        assert_eq!(result.output_text(), r#"["never settles"]"#);
    }

    #[tokio::test]
    async fn test_cancelled_execution() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut executor =
            TopologyExecutor::new(vec![agent("a", "A")]).with_cancellation(cancel);
        let result = executor.execute(Topology::Sequential, Task::new("t", "x")).await;
        assert_eq!(result.status, TaskStatus::Cancelled);
    }
}

//! 单次 Agent 调用：绑定执行者、超时、取消、落终态
//!
//! 拓扑与 agentic 执行器对 Agent 的每次调用都经过 dispatch；
//! 超时记为 FAILED(timeout)，取消记为 CANCELLED，迟到的结果直接丢弃。

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::core::{Task, TaskError, TaskResult};

/// 在 agent 上执行 task（task 按值传入，执行后即丢弃；重试需新建 Task）
pub async fn dispatch(agent: &dyn Agent, mut task: Task, cancel: &CancellationToken) -> TaskResult {
    let started_at = Utc::now();
    if let Err(e) = task.bind_executor(agent.name()) {
        return TaskResult::failed(TaskError::internal(e.to_string()), started_at);
    }

    let timeout = task.timeout;
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!(agent = agent.name(), task_id = %task.id, "task cancelled");
            TaskResult::cancelled(started_at)
        }
        outcome = tokio::time::timeout(timeout, agent.execute(&task)) => match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(agent = agent.name(), task_id = %task.id, ?timeout, "task timed out");
                TaskResult::failed(
                    TaskError::timeout(format!(
                        "Agent {} timed out after {}ms",
                        agent.name(),
                        timeout.as_millis()
                    )),
                    started_at,
                )
            }
        },
    };

    if let Err(e) = task.finish(&result) {
        tracing::debug!(task_id = %task.id, "finish skipped: {}", e);
    }
    result
}

//! 任务模型：Task / RetryPolicy / TaskResult
//!
//! 状态机：Pending → Running → {Completed, Failed}；Pending/Running → Cancelled（仅外部取消）。
//! 终态不可变；重新执行总是通过 sub_task 创建新的 Task，而不是修改已完成的 Task。

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{LifecycleError, TaskError};

/// 任务 ID
pub type TaskId = String;

/// 默认任务超时（秒）
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 120;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

/// 任务输入：提示文本 + 任意元数据 + 可选图片引用
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub prompt: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl TaskInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            metadata: HashMap::new(),
            images: Vec::new(),
        }
    }
}

/// 重试配置；本层只做透传，不在 TaskResult 内部自动重试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_multiplier: 2.0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// 构造时夹紧非法值：max_attempts ≥ 1，backoff_multiplier ≥ 1
    pub fn new(
        max_attempts: u32,
        backoff_multiplier: f64,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        let backoff_multiplier = if backoff_multiplier.is_finite() && backoff_multiplier >= 1.0 {
            backoff_multiplier
        } else {
            1.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            backoff_multiplier,
            initial_delay,
            max_delay,
        }
    }

    /// 第 attempt 次（从 1 开始）重试前的等待：min(max_delay, initial × multiplier^(attempt-1))
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let secs = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Token / 成本统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost: None,
        }
    }

    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost = match (self.cost, other.cost) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

/// 工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub input: TaskInput,
    pub status: TaskStatus,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// 绑定的执行者（Agent 名称），每次执行最多绑定一次
    pub executor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            input: TaskInput::new(prompt),
            status: TaskStatus::Pending,
            timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            retry_policy: RetryPolicy::default(),
            executor: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.input.images = images;
        self
    }

    pub fn prompt(&self) -> &str {
        &self.input.prompt
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.input.metadata.get(key)
    }

    /// 派生子任务：新 ID、新提示，继承元数据 / 超时 / 重试配置，记录父任务
    pub fn sub_task(&self, name: impl Into<String>, prompt: impl Into<String>) -> Task {
        let mut child = Task::new(name, prompt);
        child.input.metadata = self.input.metadata.clone();
        child.input.images = self.input.images.clone();
        child
            .input
            .metadata
            .insert("parentTaskId".to_string(), Value::String(self.id.clone()));
        child.timeout = self.timeout;
        child.retry_policy = self.retry_policy.clone();
        child
    }

    /// 重新执行：复制输入与配置生成新 Task（新 ID、Pending），原 Task 不变
    pub fn retry_attempt(&self) -> Task {
        let attempt = self
            .metadata("attempt")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            + 1;
        let mut retry = Task::new(self.name.clone(), self.input.prompt.clone());
        retry.input = self.input.clone();
        retry
            .input
            .metadata
            .insert("retryOf".to_string(), Value::String(self.id.clone()));
        retry
            .input
            .metadata
            .insert("attempt".to_string(), Value::from(attempt));
        retry.timeout = self.timeout;
        retry.retry_policy = self.retry_policy.clone();
        retry
    }

    /// 绑定执行者并进入 Running；同一 Task 只能绑定一次
    pub fn bind_executor(&mut self, executor: impl Into<String>) -> Result<(), LifecycleError> {
        if self.status.is_terminal() {
            return Err(LifecycleError::Terminal {
                task_id: self.id.clone(),
                status: self.status.as_str().to_string(),
            });
        }
        if let Some(existing) = &self.executor {
            return Err(LifecycleError::AlreadyBound {
                task_id: self.id.clone(),
                executor: existing.clone(),
            });
        }
        self.executor = Some(executor.into());
        self.status = TaskStatus::Running;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 按执行结果进入终态（Completed / Failed / Cancelled）
    pub fn finish(&mut self, result: &TaskResult) -> Result<(), LifecycleError> {
        if self.status.is_terminal() {
            return Err(LifecycleError::Terminal {
                task_id: self.id.clone(),
                status: self.status.as_str().to_string(),
            });
        }
        if self.executor.is_none() && result.status != TaskStatus::Cancelled {
            return Err(LifecycleError::Unbound {
                task_id: self.id.clone(),
            });
        }
        self.status = result.status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 外部取消：仅 Pending / Running 可取消
    pub fn cancel(&mut self) -> Result<(), LifecycleError> {
        if self.status.is_terminal() {
            return Err(LifecycleError::Terminal {
                task_id: self.id.clone(),
                status: self.status.as_str().to_string(),
            });
        }
        self.status = TaskStatus::Cancelled;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// 执行结果：失败时 error 必有值且 output 为 None
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<TaskError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Mesh 拓扑使用：Agent 是否认为本轮已收敛
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converged: Option<bool>,
}

impl TaskResult {
    fn finished(
        status: TaskStatus,
        output: Option<Value>,
        error: Option<TaskError>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            status,
            output,
            error,
            started_at,
            completed_at,
            duration_ms,
            usage: None,
            converged: None,
        }
    }

    pub fn completed(output: impl Into<Value>, started_at: DateTime<Utc>) -> Self {
        Self::finished(TaskStatus::Completed, Some(output.into()), None, started_at)
    }

    pub fn failed(error: TaskError, started_at: DateTime<Utc>) -> Self {
        Self::finished(TaskStatus::Failed, None, Some(error), started_at)
    }

    pub fn cancelled(started_at: DateTime<Utc>) -> Self {
        Self::finished(TaskStatus::Cancelled, None, None, started_at)
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_converged(mut self, converged: bool) -> Self {
        self.converged = Some(converged);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// 完成判定：Completed 且 output 非空（JSON null 也视为空）
    pub fn is_complete(&self) -> bool {
        self.is_success() && self.output.as_ref().is_some_and(|v| !v.is_null())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// 输出转为下一步的提示文本：字符串原样使用，其它 JSON 序列化
    pub fn output_text(&self) -> String {
        match &self.output {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(v) => v.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy::new(
            5,
            2.0,
            Duration::from_millis(100),
            Duration::from_millis(350),
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_policy_clamps_invalid_values() {
        let policy = RetryPolicy::new(0, 0.5, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_multiplier, 1.0);
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(1));
    }

    #[test]
    fn test_bind_executor_once() {
        let mut task = Task::new("t", "hello");
        task.bind_executor("alpha").unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        let err = task.bind_executor("beta").unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyBound { .. }));
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let mut task = Task::new("t", "hello");
        task.bind_executor("alpha").unwrap();
        let result = TaskResult::completed("done", Utc::now());
        task.finish(&result).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.cancel().is_err());
        assert!(task.finish(&result).is_err());
    }

    #[test]
    fn test_cancel_pending_task() {
        let mut task = Task::new("t", "hello");
        task.cancel().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.bind_executor("alpha").is_err());
    }

    #[test]
    fn test_sub_task_inherits_configuration() {
        let parent = Task::new("parent", "root")
            .with_timeout(Duration::from_secs(7))
            .with_metadata("maxConcurrency", 3);
        let child = parent.sub_task("child", "step one");
        assert_ne!(child.id, parent.id);
        assert_eq!(child.timeout, Duration::from_secs(7));
        assert_eq!(child.metadata("maxConcurrency"), Some(&Value::from(3)));
        assert_eq!(
            child.metadata("parentTaskId"),
            Some(&Value::String(parent.id.clone()))
        );
        assert!(child.executor.is_none());
    }

    #[test]
    fn test_retry_attempt_is_a_fresh_task() {
        let mut first = Task::new("fetch", "get data").with_metadata("source", "api");
        first.bind_executor("agent-a").unwrap();
        first
            .finish(&TaskResult::failed(TaskError::timeout("slow"), Utc::now()))
            .unwrap();

        let retry = first.retry_attempt();
        assert_ne!(retry.id, first.id);
        assert_eq!(retry.status, TaskStatus::Pending);
        assert!(retry.executor.is_none());
        assert_eq!(retry.metadata("attempt"), Some(&Value::from(2u64)));
        assert_eq!(retry.metadata("source"), Some(&Value::from("api")));
        assert_eq!(first.status, TaskStatus::Failed);
        assert_eq!(retry.retry_attempt().metadata("attempt"), Some(&Value::from(3u64)));
    }

    #[test]
    fn test_failed_result_has_error_and_no_output() {
        let r = TaskResult::failed(TaskError::new(ErrorKind::Internal, "boom"), Utc::now());
        assert_eq!(r.status, TaskStatus::Failed);
        assert!(r.output.is_none());
        assert_eq!(r.error_message(), Some("boom"));
        assert!(!r.is_complete());
    }

    #[test]
    fn test_null_output_is_not_complete() {
        let r = TaskResult::completed(Value::Null, Utc::now());
        assert!(r.is_success());
        assert!(!r.is_complete());
    }

    #[test]
    fn test_output_text() {
        assert_eq!(TaskResult::completed("plain", Utc::now()).output_text(), "plain");
        let json = TaskResult::completed(serde_json::json!(["a", 1]), Utc::now());
        assert_eq!(json.output_text(), r#"["a",1]"#);
    }
}

//! 执行指标：由调用方（TopologyExecutor / AgenticExecutor）持有，不使用进程级全局计数器
//!
//! average_response_time 只通过增量公式更新：avg = (old × (n-1) + new) / n，n 为自增后的 total_tasks。

use serde::{Deserialize, Serialize};

/// 滚动执行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    /// 平均响应时间（毫秒）
    pub average_response_time: f64,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次执行结果
    pub fn record(&mut self, success: bool, duration_ms: f64) {
        self.total_tasks += 1;
        if success {
            self.successful_tasks += 1;
        } else {
            self.failed_tasks += 1;
        }
        let n = self.total_tasks as f64;
        self.average_response_time = (self.average_response_time * (n - 1.0) + duration_ms) / n;
    }

    /// 合并另一调用点的统计（按次数加权）
    pub fn merge(&mut self, other: &ExecutionMetrics) {
        let total = self.total_tasks + other.total_tasks;
        if total == 0 {
            return;
        }
        self.average_response_time = (self.average_response_time * self.total_tasks as f64
            + other.average_response_time * other.total_tasks as f64)
            / total as f64;
        self.total_tasks = total;
        self.successful_tasks += other.successful_tasks;
        self.failed_tasks += other.failed_tasks;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.successful_tasks as f64 / self.total_tasks as f64
        }
    }
}

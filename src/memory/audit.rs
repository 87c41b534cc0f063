//! 一致性巡检：比较主存储与各副本的条目总数
//!
//! 只检测不修复。副本数量与主存储不一致、或副本不可达，均记为不一致并输出 warn 日志；
//! 报告通过 watch 通道发布，由运维侧决定是否做全量重同步。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::memory::store::MemoryStore;

/// 单个副本的比对结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaDrift {
    pub replica: String,
    pub count: Option<u64>,
    /// replica_count - primary_count；任一侧不可达时为 None
    pub difference: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplicaDrift {
    pub fn is_consistent(&self) -> bool {
        self.difference == Some(0)
    }
}

/// 一次巡检的报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub checked_at: DateTime<Utc>,
    pub primary: String,
    pub primary_count: Option<u64>,
    pub replicas: Vec<ReplicaDrift>,
}

impl ConsistencyReport {
    pub fn inconsistencies(&self) -> Vec<&ReplicaDrift> {
        self.replicas.iter().filter(|r| !r.is_consistent()).collect()
    }

    pub fn is_consistent(&self) -> bool {
        self.replicas.iter().all(ReplicaDrift::is_consistent)
    }
}

/// 执行一次比对（副本并发计数）
pub async fn audit_once(
    primary: &Arc<dyn MemoryStore>,
    replicas: &[Arc<dyn MemoryStore>],
) -> ConsistencyReport {
    let primary_count = match primary.count().await {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(
                store = primary.name(),
                "consistency audit: primary count failed: {}",
                e
            );
            None
        }
    };

    let counts = join_all(
        replicas
            .iter()
            .map(|r| async move { (r.name().to_string(), r.count().await) }),
    )
    .await;

    let replicas: Vec<ReplicaDrift> = counts
        .into_iter()
        .map(|(replica, result)| match result {
            Ok(count) => ReplicaDrift {
                replica,
                count: Some(count),
                difference: primary_count.map(|p| count as i64 - p as i64),
                error: None,
            },
            Err(e) => ReplicaDrift {
                replica,
                count: None,
                difference: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    for drift in replicas.iter().filter(|d| !d.is_consistent()) {
        tracing::warn!(
            primary = primary.name(),
            replica = %drift.replica,
            primary_count = ?primary_count,
            replica_count = ?drift.count,
            difference = ?drift.difference,
            error = ?drift.error,
            "consistency audit: replica inconsistency detected"
        );
    }

    ConsistencyReport {
        checked_at: Utc::now(),
        primary: primary.name().to_string(),
        primary_count,
        replicas,
    }
}

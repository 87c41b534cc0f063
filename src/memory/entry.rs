//! 记忆条目与查询选项
//!
//! MemoryEntry 由 Agent 在对话、执行任务、记录错误时创建；只能通过 update（MemoryPatch）修改，
//! 只能通过显式 delete / clear 删除。所有存储实现排序前统一调用 adjust_score。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Message,
    Task,
    Result,
    Error,
    System,
    Tool,
    Conversation,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Message => "message",
            MemoryType::Task => "task",
            MemoryType::Result => "result",
            MemoryType::Error => "error",
            MemoryType::System => "system",
            MemoryType::Tool => "tool",
            MemoryType::Conversation => "conversation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(MemoryType::Message),
            "task" => Some(MemoryType::Task),
            "result" => Some(MemoryType::Result),
            "error" => Some(MemoryType::Error),
            "system" => Some(MemoryType::System),
            "tool" => Some(MemoryType::Tool),
            "conversation" => Some(MemoryType::Conversation),
            _ => None,
        }
    }
}

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRole {
    System,
    User,
    Assistant,
}

impl MemoryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryRole::System => "system",
            MemoryRole::User => "user",
            MemoryRole::Assistant => "assistant",
        }
    }
}

/// 记忆条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub entry_type: MemoryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MemoryRole>,
    pub timestamp: DateTime<Utc>,
    pub token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub importance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub is_consolidated: bool,
    #[serde(default)]
    pub consolidation_score: f64,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_reason: Option<String>,
}

/// 默认重要度
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

impl MemoryEntry {
    pub fn new(entry_type: MemoryType, content: impl Into<String>) -> Self {
        let content = content.into();
        let token_count = content.split_whitespace().count() as u64;
        Self {
            id: format!("mem_{}", uuid::Uuid::new_v4()),
            content,
            entry_type,
            role: None,
            timestamp: Utc::now(),
            token_count,
            embedding: None,
            tags: Vec::new(),
            importance: DEFAULT_IMPORTANCE,
            agent_id: None,
            metadata: HashMap::new(),
            is_consolidated: false,
            consolidation_score: 0.0,
            is_archived: false,
            archive_reason: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_role(mut self, role: MemoryRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn consolidated(mut self, score: f64) -> Self {
        self.is_consolidated = true;
        self.consolidation_score = score;
        self
    }

    pub fn archived(mut self, reason: impl Into<String>) -> Self {
        self.is_archived = true;
        self.archive_reason = Some(reason.into());
        self
    }

    /// 写入前校验：内容非空、重要度在 0..=1
    pub fn validate(&self) -> Result<(), String> {
        if self.content.trim().is_empty() {
            return Err(format!("Memory entry {} has empty content", self.id));
        }
        if !(0.0..=1.0).contains(&self.importance) {
            return Err(format!(
                "Memory entry {} importance {} out of range",
                self.id, self.importance
            ));
        }
        Ok(())
    }

    /// 应用局部更新
    pub fn apply(&mut self, patch: &MemoryPatch) {
        if let Some(content) = &patch.content {
            self.content = content.clone();
            self.token_count = content.split_whitespace().count() as u64;
        }
        if let Some(tags) = &patch.tags {
            self.tags = tags.clone();
        }
        if let Some(importance) = patch.importance {
            self.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(embedding) = &patch.embedding {
            self.embedding = Some(embedding.clone());
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata.extend(metadata.clone());
        }
        if let Some(score) = patch.consolidation_score {
            self.is_consolidated = true;
            self.consolidation_score = score;
        }
        if let Some(reason) = &patch.archive_reason {
            self.is_archived = true;
            self.archive_reason = Some(reason.clone());
        }
    }

    /// 字段相等过滤：type / role / agentId / tag 为内置字段，其余键匹配 metadata
    pub fn matches_filter(&self, filter: &HashMap<String, Value>) -> bool {
        filter.iter().all(|(key, expected)| match key.as_str() {
            "type" => expected.as_str() == Some(self.entry_type.as_str()),
            "role" => expected.as_str() == self.role.map(|r| r.as_str()),
            "agentId" => expected.as_str() == self.agent_id.as_deref(),
            "tag" => expected
                .as_str()
                .is_some_and(|t| self.tags.iter().any(|tag| tag == t)),
            "isArchived" => expected.as_bool() == Some(self.is_archived),
            other => self.metadata.get(other) == Some(expected),
        })
    }
}

/// 局部更新
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub importance: Option<f64>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Option<HashMap<String, Value>>,
    /// 设置后条目标记为已合并
    pub consolidation_score: Option<f64>,
    /// 设置后条目标记为已归档
    pub archive_reason: Option<String>,
}

/// 带分数的检索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f64,
}

/// 查询选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    #[serde(default)]
    pub filter: HashMap<String, Value>,
    pub min_score: Option<f64>,
}

impl QueryOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// 排序前的统一分数修正
pub fn adjust_score(base_score: f64, entry: &MemoryEntry) -> f64 {
    let consolidation = if entry.is_consolidated {
        1.0 + entry.consolidation_score
    } else {
        1.0
    };
    let archive = if entry.is_archived { 0.5 } else { 1.0 };
    base_score * (1.0 + entry.importance) * consolidation * archive
}

/// 过滤、修正分数、按阈值筛选、降序排序并分页；各存储实现共用
pub fn rank_entries(
    candidates: impl IntoIterator<Item = (MemoryEntry, f64)>,
    options: &QueryOptions,
) -> Vec<ScoredEntry> {
    let mut scored: Vec<ScoredEntry> = candidates
        .into_iter()
        .filter(|(entry, base)| *base > 0.0 && entry.matches_filter(&options.filter))
        .map(|(entry, base)| {
            let score = adjust_score(base, &entry);
            ScoredEntry { entry, score }
        })
        .filter(|s| options.min_score.map_or(true, |min| s.score >= min))
        .collect();
    sort_by_score_desc(&mut scored);
    scored
        .into_iter()
        .skip(options.offset)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect()
}

pub fn sort_by_score_desc(entries: &mut [ScoredEntry]) {
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// 将文本切分为小写词集合，用于关键词检索
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

/// 关键词基础分：查询词在文档中出现的比例（0..=1）
pub fn keyword_score(query: &str, content: &str) -> f64 {
    let query_tokens = tokenize_lower(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens = tokenize_lower(content);
    query_tokens.intersection(&doc_tokens).count() as f64 / query_tokens.len() as f64
}

/// 余弦相似度；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

//! 脚本化 LLM（用于测试与演示，无需 API）
//!
//! 先消费预置队列中的回复；队列为空时按「提示包含关键字」规则匹配；都不匹配则返回默认回复。
//! 所有收到的提示都会记录下来，便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::Usage;
use crate::llm::{Generation, LanguageModel, LlmError};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Error(LlmError),
}

/// 脚本化语言模型
#[derive(Debug)]
pub struct ScriptedLanguageModel {
    name: String,
    queue: Mutex<VecDeque<Reply>>,
    rules: Vec<(String, Reply)>,
    default_reply: Reply,
    prompts: Mutex<Vec<String>>,
}

impl Default for ScriptedLanguageModel {
    fn default() -> Self {
        Self::new("scripted")
    }
}

impl ScriptedLanguageModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            rules: Vec::new(),
            default_reply: Reply::Text(String::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 提示中包含 needle 时返回 reply（按注册顺序匹配第一条）
    pub fn with_rule(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Reply::Text(reply.into())));
        self
    }

    pub fn with_error_rule(mut self, needle: impl Into<String>, err: LlmError) -> Self {
        self.rules.push((needle.into(), Reply::Error(err)));
        self
    }

    pub fn with_default(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = Reply::Text(reply.into());
        self
    }

    /// 预置一条一次性回复
    pub fn enqueue(self, reply: impl Into<String>) -> Self {
        self.lock_queue().push_back(Reply::Text(reply.into()));
        self
    }

    pub fn enqueue_error(self, err: LlmError) -> Self {
        self.lock_queue().push_back(Reply::Error(err));
        self
    }

    /// 已收到的提示（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Reply>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_reply(&self, prompt: &str) -> Reply {
        if let Some(reply) = self.lock_queue().pop_front() {
            return reply;
        }
        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate_text(&self, prompt: &str) -> Result<Generation, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        match self.next_reply(prompt) {
            Reply::Text(text) => {
                let prompt_tokens = prompt.split_whitespace().count() as u64;
                let completion_tokens = text.split_whitespace().count() as u64;
                Ok(Generation::new(
                    text,
                    Usage::new(prompt_tokens, completion_tokens),
                ))
            }
            Reply::Error(err) => Err(err),
        }
    }
}

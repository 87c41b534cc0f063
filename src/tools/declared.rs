//! 声明式工具：只声明能力名与描述，执行时回显输入
//!
//! 用于演示 Agent 与测试中的能力匹配；真实工具由外部实现 Tool trait 接入。

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

pub struct DeclaredTool {
    name: String,
    description: String,
}

impl DeclaredTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

#[async_trait]
impl Tool for DeclaredTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "input": { "type": "string" } },
            "required": ["input"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        args.get("input")
            .and_then(Value::as_str)
            .map(|input| format!("[{}] {}", self.name, input))
            .ok_or_else(|| format!("{}: missing \"input\"", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_echoes_input() {
        let tool = DeclaredTool::new("summarize", "Summarize text");
        let out = tool
            .execute(serde_json::json!({ "input": "long text" }))
            .await
            .unwrap();
        assert_eq!(out, "[summarize] long text");
        assert!(tool.execute(Value::Null).await.is_err());
    }
}

//! Hive 命令行入口
//!
//! 用法：`hive <sequential|parallel|hierarchical|mesh|agentic> <prompt...>`
//! 用配置中的语言模型构建一组演示 Agent，执行后把 TaskResult 以 JSON 打印到标准输出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use hive::config::{load_config, AppConfig};
use hive::core::{AgenticConfig, TopologyConfig};
use hive::llm::{create_language_model_from_config, LanguageModel};
use hive::memory::MemoryManager;
use hive::tools::DeclaredTool;
use hive::{observability, Agent, AgenticExecutor, LlmAgent, Task, TopologyExecutor};

const USAGE: &str = "usage: hive <sequential|parallel|hierarchical|mesh|agentic> <prompt...>";

fn demo_agent(
    cfg: &AppConfig,
    model: &Arc<dyn LanguageModel>,
    name: &str,
    description: &str,
    tools: &[(&str, &str)],
) -> anyhow::Result<Arc<dyn Agent>> {
    let memory = MemoryManager::from_config(&cfg.memory, name)
        .with_context(|| format!("Failed to open memory for {name}"))?;
    let mut agent = LlmAgent::new(name, Arc::clone(model))
        .with_description(description)
        .with_memory(memory);
    for (tool, about) in tools {
        agent = agent.with_tool(DeclaredTool::new(*tool, *about));
    }
    Ok(Arc::new(agent))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let mode = args.next().context(USAGE)?;
    let prompt = args.collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        bail!(USAGE);
    }

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let model = create_language_model_from_config(&cfg);

    let lead = demo_agent(&cfg, &model, "lead", "Coordinator that plans and aggregates work", &[])?;
    let researcher = demo_agent(
        &cfg,
        &model,
        "researcher",
        "Research specialist for gathering facts",
        &[("web_search", "Search the web"), ("summarize", "Summarize text")],
    )?;
    let writer = demo_agent(
        &cfg,
        &model,
        "writer",
        "Writing specialist for reports",
        &[("draft", "Draft a document"), ("review", "Review a draft")],
    )?;

    let task = Task::new("cli", prompt)
        .with_timeout(Duration::from_secs(cfg.orchestrator.default_task_timeout_secs))
        .with_retry_policy(cfg.retry.to_policy());

    let result = if mode == "agentic" {
        let mut executor = AgenticExecutor::new(lead, vec![researcher, writer])
            .with_config(AgenticConfig::from(&cfg.orchestrator));
        let outcome = executor.execute(task).await;
        tracing::info!(
            loops = outcome.loops,
            steps = outcome.intermediate_results.len(),
            selected = ?outcome.selected_agents,
            "agentic run finished"
        );
        outcome.result
    } else {
        let mut executor = TopologyExecutor::with_config(
            vec![lead, researcher, writer],
            TopologyConfig::from(&cfg.topology),
        );
        let result = executor.execute_named(&mode, task).await;
        tracing::info!(metrics = ?executor.metrics(), "topology run finished");
        result
    };

    let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
    println!("{json}");
    Ok(())
}

//! 语言模型响应契约：任务分析与行动计划
//!
//! 线上格式为分隔标签（`<capabilities>...</capabilities>` 等），解析为强类型结构并校验；
//! 没有任何标签时接受一个符合 JSON Schema 的对象。解析失败由调用方降级处理：
//! 分析 → 空分析，计划 → 该候选不参与选择。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Response contains no recognizable sections")]
    NoSections,

    #[error("Invalid JSON response: {0}")]
    Json(String),

    #[error("Invalid value for <{tag}>: {value}")]
    InvalidValue { tag: &'static str, value: String },

    #[error("Plan has no steps")]
    EmptyPlan,
}

/// 任务需求分析（由 orchestrator 的语言模型产出）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentTaskAnalysis {
    /// 完成任务所需的能力（与工具名匹配）
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 复杂度 0-1
    #[serde(default)]
    pub complexity: f64,
    /// 所需专长（与 Agent 描述匹配）
    #[serde(default)]
    pub specialization: Vec<String>,
    #[serde(default)]
    pub required_actions: Vec<String>,
    #[serde(default)]
    pub context_dependencies: Vec<String>,
}

impl AgentTaskAnalysis {
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
            && self.specialization.is_empty()
            && self.required_actions.is_empty()
            && self.context_dependencies.is_empty()
            && self.complexity == 0.0
    }

    fn normalized(mut self) -> Self {
        self.complexity = if self.complexity.is_finite() {
            self.complexity.clamp(0.0, 1.0)
        } else {
            0.0
        };
        for list in [
            &mut self.capabilities,
            &mut self.specialization,
            &mut self.required_actions,
            &mut self.context_dependencies,
        ] {
            list.retain(|item| !item.trim().is_empty());
        }
        self
    }
}

/// 计划自检标记
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlanValidation {
    pub steps_valid: bool,
    pub tools_available: bool,
    pub fallbacks_defined: bool,
}

/// 行动计划（由候选 Agent 自己的语言模型产出）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentActionPlan {
    /// 有序步骤（可读的动作描述）
    pub steps: Vec<String>,
    #[serde(default)]
    pub estimated_steps: usize,
    /// 步骤失败时按顺序尝试的替代动作
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub validation: PlanValidation,
}

impl AgentActionPlan {
    /// 计划可用：steps_valid 与 tools_available 都为真
    pub fn is_valid(&self) -> bool {
        self.validation.steps_valid && self.validation.tools_available
    }

    fn normalized(mut self) -> Result<Self, ParseError> {
        self.steps.retain(|s| !s.trim().is_empty());
        self.fallbacks.retain(|s| !s.trim().is_empty());
        if self.steps.is_empty() {
            return Err(ParseError::EmptyPlan);
        }
        if self.estimated_steps == 0 {
            self.estimated_steps = self.steps.len();
        }
        Ok(self)
    }
}

/// 线上格式使用的全部标签
const KNOWN_TAGS: &[&str] = &[
    "capabilities",
    "complexity",
    "specialization",
    "required_actions",
    "context_dependencies",
    "steps",
    "estimated_steps",
    "fallbacks",
    "validation",
    "converged",
];

fn build_tag_regex(tag: &str) -> Option<Regex> {
    let tag = regex::escape(tag);
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).ok()
}

fn known_tag_regexes() -> &'static HashMap<&'static str, Regex> {
    static RE: OnceLock<HashMap<&'static str, Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        KNOWN_TAGS
            .iter()
            .filter_map(|tag| build_tag_regex(tag).map(|re| (*tag, re)))
            .collect()
    })
}

/// 取出 `<tag>...</tag>` 之间的文本（首个匹配，去首尾空白）
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let capture = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    };
    match known_tag_regexes().get(tag) {
        Some(re) => capture(re),
        None => capture(&build_tag_regex(tag)?),
    }
}

fn list_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s*").expect("Invalid list marker regex"))
}

/// 列表解析：逗号或换行分隔，去掉 `- ` / `1. ` 等列表前缀与空项
pub fn parse_list(raw: &str) -> Vec<String> {
    let marker = list_marker();
    let items: Box<dyn Iterator<Item = &str>> = if raw.contains('\n') {
        Box::new(raw.lines())
    } else {
        Box::new(raw.split(','))
    };
    items
        .map(|line| marker.replace(line, "").trim().to_string())
        .filter(|item| !item.is_empty() && !item.eq_ignore_ascii_case("none"))
        .collect()
}

/// 按行解析的步骤列表：逗号不作为分隔符
fn parse_lines(raw: &str) -> Vec<String> {
    let marker = list_marker();
    raw.lines()
        .map(|line| marker.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// yes / true / y / 1 视为真
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "y" | "true" | "1"
    )
}

/// 从文本中截取最外层 JSON 对象（可能包在 ```json 代码块里）
fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let body = match trimmed.find("```json") {
        Some(start) => {
            let rest = &trimmed[start + 7..];
            rest.find("```").map(|end| &rest[..end]).unwrap_or(rest)
        }
        None => trimmed,
    };
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

fn parse_json<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, ParseError> {
    let json = extract_json(text).ok_or(ParseError::NoSections)?;
    serde_json::from_str(json).map_err(|e| ParseError::Json(e.to_string()))
}

pub fn parse_analysis(text: &str) -> Result<AgentTaskAnalysis, ParseError> {
    let capabilities = extract_tag(text, "capabilities");
    let complexity = extract_tag(text, "complexity");
    let specialization = extract_tag(text, "specialization");
    let required_actions = extract_tag(text, "required_actions");
    let context_dependencies = extract_tag(text, "context_dependencies");

    let any_tag = [
        &capabilities,
        &complexity,
        &specialization,
        &required_actions,
        &context_dependencies,
    ]
    .iter()
    .any(|t| t.is_some());
    if !any_tag {
        return parse_json::<AgentTaskAnalysis>(text).map(AgentTaskAnalysis::normalized);
    }

    let complexity = match complexity {
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|_| ParseError::InvalidValue {
                tag: "complexity",
                value: raw.clone(),
            })?,
        None => 0.0,
    };

    Ok(AgentTaskAnalysis {
        capabilities: capabilities.as_deref().map(parse_list).unwrap_or_default(),
        complexity,
        specialization: specialization.as_deref().map(parse_list).unwrap_or_default(),
        required_actions: required_actions.as_deref().map(parse_list).unwrap_or_default(),
        context_dependencies: context_dependencies
            .as_deref()
            .map(parse_list)
            .unwrap_or_default(),
    }
    .normalized())
}

fn parse_validation(raw: &str) -> PlanValidation {
    let mut validation = PlanValidation::default();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let flag = parse_flag(value);
        let key = list_marker().replace(key, "").trim().to_ascii_lowercase().replace(' ', "_");
        match key.as_str() {
            "steps_valid" => validation.steps_valid = flag,
            "tools_available" => validation.tools_available = flag,
            "fallbacks_defined" => validation.fallbacks_defined = flag,
            _ => {}
        }
    }
    validation
}

pub fn parse_action_plan(text: &str) -> Result<AgentActionPlan, ParseError> {
    let Some(steps) = extract_tag(text, "steps") else {
        return parse_json::<AgentActionPlan>(text).and_then(AgentActionPlan::normalized);
    };

    let estimated_steps = match extract_tag(text, "estimated_steps") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidValue {
                tag: "estimated_steps",
                value: raw.clone(),
            })?,
        None => 0,
    };

    AgentActionPlan {
        steps: parse_lines(&steps),
        estimated_steps,
        fallbacks: extract_tag(text, "fallbacks")
            .as_deref()
            .map(parse_lines)
            .unwrap_or_default(),
        validation: extract_tag(text, "validation")
            .as_deref()
            .map(parse_validation)
            .unwrap_or_default(),
    }
    .normalized()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tag_known_and_ad_hoc() {
        assert_eq!(known_tag_regexes().len(), KNOWN_TAGS.len());
        let text = "<steps>\n1. a\n</steps><note>x+y</note>";
        assert_eq!(extract_tag(text, "steps").as_deref(), Some("1. a"));
        assert_eq!(extract_tag(text, "note").as_deref(), Some("x+y"));
        assert_eq!(extract_tag(text, "fallbacks"), None);
    }

    #[test]
    fn test_parse_tagged_analysis() {
        let text = "Here is my analysis:\n\
            <capabilities>web_search, summarize</capabilities>\n\
            <complexity>0.7</complexity>\n\
            <specialization>\n- research\n- finance\n</specialization>\n\
            <required_actions>collect sources</required_actions>\n\
            <context_dependencies>none</context_dependencies>";
        let analysis = parse_analysis(text).unwrap();
        assert_eq!(analysis.capabilities, vec!["web_search", "summarize"]);
        assert_eq!(analysis.complexity, 0.7);
        assert_eq!(analysis.specialization, vec!["research", "finance"]);
        assert_eq!(analysis.required_actions, vec!["collect sources"]);
        assert!(analysis.context_dependencies.is_empty());
    }

    #[test]
    fn test_complexity_is_clamped() {
        let analysis = parse_analysis("<complexity>3.5</complexity>").unwrap();
        assert_eq!(analysis.complexity, 1.0);
    }

    #[test]
    fn test_bad_complexity_is_error() {
        assert!(matches!(
            parse_analysis("<complexity>high</complexity>"),
            Err(ParseError::InvalidValue { tag: "complexity", .. })
        ));
    }

    #[test]
    fn test_analysis_json_fallback() {
        let text = "```json\n{\"capabilities\": [\"sql\"], \"complexity\": 0.2}\n```";
        let analysis = parse_analysis(text).unwrap();
        assert_eq!(analysis.capabilities, vec!["sql"]);
        assert_eq!(analysis.complexity, 0.2);
    }

    #[test]
    fn test_free_text_is_not_an_analysis() {
        assert_eq!(parse_analysis("I cannot help"), Err(ParseError::NoSections));
    }

    #[test]
    fn test_parse_tagged_plan() {
        let text = "<steps>\n1. Search for sources, news\n2. Summarize findings\n</steps>\n\
            <fallbacks>\n- Use cached data\n</fallbacks>\n\
            <validation>\nsteps_valid: yes\ntools_available: YES\nfallbacks_defined: no\n</validation>";
        let plan = parse_action_plan(text).unwrap();
        assert_eq!(
            plan.steps,
            vec!["Search for sources, news", "Summarize findings"]
        );
        assert_eq!(plan.estimated_steps, 2);
        assert_eq!(plan.fallbacks, vec!["Use cached data"]);
        assert!(plan.is_valid());
        assert!(!plan.validation.fallbacks_defined);
    }

    #[test]
    fn test_plan_without_validation_is_invalid() {
        let plan = parse_action_plan("<steps>do it</steps>").unwrap();
        assert!(!plan.is_valid());
    }

    #[test]
    fn test_plan_with_empty_steps_is_error() {
        assert_eq!(
            parse_action_plan("<steps>\n\n</steps>"),
            Err(ParseError::EmptyPlan)
        );
    }

    #[test]
    fn test_plan_json_fallback() {
        let text = r#"{"steps": ["a", "b"], "fallbacks": ["c"],
            "validation": {"steps_valid": true, "tools_available": true, "fallbacks_defined": true}}"#;
        let plan = parse_action_plan(text).unwrap();
        assert_eq!(plan.estimated_steps, 2);
        assert!(plan.is_valid());
    }
}

use crate::types::ExecuteOptions;
use async_trait::async_trait;
use conductor_core::ConductorResult;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Everything a backend receives to run one workflow step of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInvocation {
    pub agent: String,
    pub step: String,
    pub description: String,
    pub tools: Vec<String>,
    pub input: serde_json::Value,
    pub options: ExecuteOptions,
    /// Cancelled when the dispatch is abandoned. Backends that start nested
    /// workflows pass it on so the whole tree stops together.
    #[serde(skip)]
    pub cancel: CancellationToken,
}

/// Everything a backend receives to run one named prompt of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptInvocation {
    pub agent: String,
    pub prompt: String,
    pub template: String,
    pub input: serde_json::Value,
    pub options: ExecuteOptions,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

/// The capability that actually performs agent work.
///
/// Errors returned here pass through the dispatcher unchanged.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn run_step(&self, invocation: StepInvocation) -> ConductorResult<serde_json::Value>;

    /// Defaults to rendering the template against the input object.
    async fn run_prompt(
        &self,
        invocation: PromptInvocation,
    ) -> ConductorResult<serde_json::Value> {
        let rendered = render_template(&invocation.template, &invocation.input);
        Ok(serde_json::json!({
            "prompt": invocation.prompt,
            "rendered": rendered,
        }))
    }
}

/// Substitute `{{key}}` placeholders with top-level fields of `input`.
///
/// String values are inserted verbatim, other values as compact JSON.
/// Unknown placeholders are left in place.
pub fn render_template(template: &str, input: &serde_json::Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = after[..close].trim();
        match input.get(key) {
            Some(serde_json::Value::String(s)) => out.push_str(s),
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Backend that performs no work and echoes each invocation back.
///
/// Used by the CLI to inspect what a workflow would dispatch.
#[derive(Debug, Default, Clone)]
pub struct DryRunBackend;

#[async_trait]
impl ToolBackend for DryRunBackend {
    async fn run_step(&self, invocation: StepInvocation) -> ConductorResult<serde_json::Value> {
        Ok(serde_json::json!({
            "agent": invocation.agent,
            "step": invocation.step,
            "description": invocation.description,
            "tools": invocation.tools,
            "input": invocation.input,
            "dry_run": true,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_template() {
        let input = json!({"name": "auth", "count": 3});
        assert_eq!(
            render_template("Review {{name}} ({{ count }} files)", &input),
            "Review auth (3 files)"
        );
        assert_eq!(render_template("{{missing}} stays", &input), "{{missing}} stays");
        assert_eq!(render_template("open {{name", &input), "open {{name");
        assert_eq!(render_template("no placeholders", &json!(null)), "no placeholders");
    }

    #[tokio::test]
    async fn test_default_prompt_rendering() {
        let result = DryRunBackend
            .run_prompt(PromptInvocation {
                agent: "writer".into(),
                prompt: "greet".into(),
                template: "Hello {{who}}".into(),
                input: json!({"who": "team"}),
                options: ExecuteOptions::default(),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(result["rendered"], "Hello team");
    }

    #[tokio::test]
    async fn test_dry_run_echoes_step() {
        let result = DryRunBackend
            .run_step(StepInvocation {
                agent: "builder".into(),
                step: "compile".into(),
                description: "Compile".into(),
                tools: vec!["cargo".into()],
                input: json!({"target": "x86_64"}),
                options: ExecuteOptions::default(),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(result["step"], "compile");
        assert_eq!(result["dry_run"], true);
    }
}

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::task::TaskState;
use crate::types::{Action, PageSnapshot, TaskError};

/// Decision-making collaborator: one page snapshot in, exactly one Action out.
///
/// Implementations may fail; the control loop recovers from planning errors
/// by substituting a deterministic default action, never by failing the task.
#[async_trait]
pub trait Planner: Send {
    async fn plan(
        &mut self,
        snapshot: &PageSnapshot,
        task: &TaskState,
    ) -> Result<Action, TaskError>;
}

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

const SYSTEM_PROMPT: &str = r#"You are a browser automation planner. You are shown the interactive elements of the current page, each tagged with an integer index, plus a short task status summary. Decide exactly ONE next action.

Available action types:
- navigate: load a URL (target=URL)
- click: click an element (target=element index such as "3"; value may be "right", "middle" or "double")
- input: type into an element (target=element index, value=text; append "|ENTER" to the value to press Enter after typing)
- extract: collect the page's data records
- wait: pause (value=milliseconds)
- scroll: scroll to an element (target=index) or by pixels (value=pixels)
- hover: hover over an element (target=element index)
- check_goal: test whether the task goal is met (value=optional criteria text)

Rules:
1. Respond with a single JSON object, no markdown and no commentary:
   {"reasoning": "...", "action": {"type": "...", "target": "...", "value": "...", "description": "..."}, "confidence": 0.9}
2. Reference elements only by the indices shown to you; they change on every step.
3. For a search task: type the query into the search input with "|ENTER", wait for results, then extract.
4. Extract before navigating away from a page that holds useful data.
5. Use check_goal once you believe the task is finished.
6. Avoid repeating an action that already failed; try a different element or strategy."#;

/// Planner backed by an OpenAI-compatible chat-completions endpoint.
pub struct LlmPlanner {
    client: Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl LlmPlanner {
    /// Credentials and model come from the environment: `OPENAI_API_KEY`,
    /// `WEBPILOT_MODEL`, `WEBPILOT_API_BASE`.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set in environment"))?;
        Ok(Self {
            client: Client::new(),
            api_key,
            model: std::env::var("WEBPILOT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_base: std::env::var("WEBPILOT_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
        })
    }

    fn build_prompt(snapshot: &PageSnapshot, task: &TaskState) -> String {
        let mut lines = Vec::new();
        if task.step_count() == 0 {
            lines.push("The task has just started.".to_string());
        } else {
            lines.push(format!("Executed {} steps so far.", task.step_count()));
            lines.push(format!("Recent actions: {}.", task.recent_summary()));
        }
        lines.push(format!("Current page: {} ({})", snapshot.page.title, snapshot.page.url));
        if !task.extracted_data.is_empty() {
            lines.push(format!(
                "Extracted {} data records so far.",
                task.extracted_data.len()
            ));
        }
        if let Some(err) = &task.error_context {
            lines.push(format!("Last error: {err}"));
        }
        if task.step_count() > 3 {
            lines.push("Avoid repeating earlier actions; try a new strategy if stuck.".to_string());
        }

        let elements = if snapshot.elements.is_empty() {
            "(no interactive elements found)".to_string()
        } else {
            snapshot.elements.join("\n")
        };

        format!(
            "{}\n\nTask goal: {}\n\nInteractive elements on the current page:\n{}\n\nDecide the next action.",
            lines.join("\n"),
            task.instruction,
            elements
        )
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &mut self,
        snapshot: &PageSnapshot,
        task: &TaskState,
    ) -> Result<Action, TaskError> {
        let prompt = Self::build_prompt(snapshot, task);
        debug!(chars = prompt.len(), "planner prompt built");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": prompt },
                ],
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|e| TaskError::Planning(format!("planner request failed: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TaskError::Planning(format!("planner response unreadable: {e}")))?;

        if !status.is_success() {
            let msg = body["error"]["message"].as_str().unwrap_or("unknown API error");
            return Err(TaskError::Planning(format!("API error ({status}): {msg}")));
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| TaskError::Planning("no content in model response".into()))?;

        let action = parse_action(content)?;
        debug!(action = action.action_type.as_str(), "planner decided");
        Ok(action)
    }
}

/// Parse model output into an Action. Tolerates markdown fences and a
/// `{reasoning, action, confidence}` wrapper around the action itself.
pub fn parse_action(content: &str) -> Result<Action, TaskError> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    let json_str = match (start, end) {
        (Some(s), Some(e)) if s < e => &cleaned[s..=e],
        _ => {
            warn!(content = %content.chars().take(120).collect::<String>(), "no JSON in planner output");
            return Err(TaskError::Planning("no JSON object in model output".into()));
        }
    };

    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| TaskError::Planning(format!("model output is not valid JSON: {e}")))?;

    let action_value = if value.get("action").is_some() {
        value["action"].clone()
    } else {
        value
    };

    serde_json::from_value(action_value)
        .map_err(|e| TaskError::Planning(format!("model output is not a valid action: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionType;

    #[test]
    fn parses_a_bare_action_object() {
        let action = parse_action(r#"{"type":"click","target":"4","description":"click search"}"#)
            .unwrap();
        assert_eq!(action.action_type, ActionType::Click);
        assert_eq!(action.target.as_deref(), Some("4"));
    }

    #[test]
    fn parses_a_reasoning_wrapper_with_fences() {
        let content = r#"```json
{"reasoning": "the search box is element 1", "action": {"type": "input", "target": "1", "value": "rust|ENTER"}, "confidence": 0.9}
```"#;
        let action = parse_action(content).unwrap();
        assert_eq!(action.action_type, ActionType::Input);
        assert_eq!(action.value.as_deref(), Some("rust|ENTER"));
    }

    #[test]
    fn surrounding_prose_is_ignored() {
        let content = r#"Sure! Here is the next step: {"type":"wait","value":"500"} hope that helps"#;
        let action = parse_action(content).unwrap();
        assert_eq!(action.action_type, ActionType::Wait);
    }

    #[test]
    fn malformed_output_is_a_planning_error() {
        assert!(matches!(
            parse_action("I would click the button"),
            Err(TaskError::Planning(_))
        ));
        assert!(matches!(
            parse_action(r#"{"type":"fly_to_the_moon"}"#),
            Err(TaskError::Planning(_))
        ));
    }
}

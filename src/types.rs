use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One operation the planner asks the executor to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Navigate,
    Click,
    Input,
    Extract,
    Wait,
    Scroll,
    Hover,
    CheckGoal,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Navigate => "navigate",
            ActionType::Click => "click",
            ActionType::Input => "input",
            ActionType::Extract => "extract",
            ActionType::Wait => "wait",
            ActionType::Scroll => "scroll",
            ActionType::Hover => "hover",
            ActionType::CheckGoal => "check_goal",
        }
    }
}

/// A single typed instruction from planning to execution. Immutable once issued.
///
/// `target` is an element index ("7"), a URL, or absent. `value` carries input
/// text (optionally with a trailing `|ENTER` marker), a wait duration in
/// milliseconds, or goal criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_timeout() -> u64 {
    DEFAULT_ACTION_TIMEOUT_MS
}

fn default_retry_count() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Action {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            target: None,
            value: None,
            description: String::new(),
            timeout: DEFAULT_ACTION_TIMEOUT_MS,
            retry_count: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn navigate(url: &str) -> Self {
        let mut a = Self::new(ActionType::Navigate);
        a.target = Some(url.to_string());
        a.description = format!("Navigate to {url}");
        a
    }

    pub fn click(index: usize) -> Self {
        let mut a = Self::new(ActionType::Click);
        a.target = Some(index.to_string());
        a.description = format!("Click element [{index}]");
        a
    }

    pub fn input(index: usize, text: &str, press_enter: bool) -> Self {
        let mut a = Self::new(ActionType::Input);
        a.target = Some(index.to_string());
        a.value = Some(if press_enter {
            format!("{text}{ENTER_MARKER}")
        } else {
            text.to_string()
        });
        a.description = format!("Type into element [{index}]");
        a
    }

    pub fn extract() -> Self {
        let mut a = Self::new(ActionType::Extract);
        a.description = "Extract page data".to_string();
        a
    }

    pub fn wait(ms: u64) -> Self {
        let mut a = Self::new(ActionType::Wait);
        a.value = Some(ms.to_string());
        a.description = format!("Wait {ms}ms");
        a
    }

    pub fn check_goal(criteria: &str) -> Self {
        let mut a = Self::new(ActionType::CheckGoal);
        if !criteria.is_empty() {
            a.value = Some(criteria.to_string());
        }
        a.description = "Check whether the goal is met".to_string();
        a
    }

    /// Parse `target` as an element index.
    pub fn element_index(&self) -> Option<usize> {
        self.target.as_deref().and_then(|t| t.trim().parse().ok())
    }
}

/// Basic identity of the current page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

/// Page-state snapshot attached to every ActionResult: identity plus a few
/// derived flags the planner and goal checks key off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub element_count: usize,
    pub has_search_box: bool,
    pub looks_like_results: bool,
}

/// Screenshot payload as exposed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Screenshot {
    #[serde(rename = "imageBase64")]
    pub image_base64: String,
    #[serde(rename = "imageType")]
    pub image_type: String,
}

/// Outcome of executing one Action. Produced exactly once per Action; errors
/// are captured here and never propagate past the executor boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_state: Option<PageState>,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
}

impl ActionResult {
    pub fn ok(action: Action, data: Option<serde_json::Value>, secs: f64) -> Self {
        Self {
            success: true,
            action,
            data,
            error: None,
            page_state: None,
            execution_time: secs,
        }
    }

    pub fn err(action: Action, error: TaskError, secs: f64) -> Self {
        Self {
            success: false,
            action,
            data: None,
            error: Some(error.to_string()),
            page_state: None,
            execution_time: secs,
        }
    }
}

/// Per-step failure taxonomy. Everything here is caught at the executor or
/// loop boundary and folded into an ActionResult.
#[derive(Debug, Error)]
pub enum TaskError {
    /// An action failed against the live page. Consumes one retry.
    #[error("browser: {0}")]
    Browser(String),
    /// Planner output was unusable. Recovered locally with a default action.
    #[error("planning: {0}")]
    Planning(String),
    /// A bounded operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Any other failure during a step.
    #[error("step: {0}")]
    Step(String),
}

impl TaskError {
    pub fn recoverable(&self) -> bool {
        // Everything per-step is recoverable up to the retry budget; only the
        // loop itself escalates repeated failures into a failed task.
        true
    }

    pub fn browser(err: anyhow::Error) -> Self {
        let msg = format!("{err:#}");
        if msg.to_lowercase().contains("timeout") {
            TaskError::Timeout(msg)
        } else {
            TaskError::Browser(msg)
        }
    }
}

/// What the planner sees each step: page identity plus the indexed element
/// descriptions from the current generation.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub page: PageInfo,
    pub generation: u64,
    pub elements: Vec<String>,
}

pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_STEPS: u32 = 15;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_WAIT_MS: u64 = 2_000;
/// Trailing marker on an `input` value requesting an Enter keypress after typing.
pub const ENTER_MARKER: &str = "|ENTER";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_with_all_fields() {
        let mut action = Action::input(3, "rust tutorials", true);
        action.timeout = 8_000;
        action.retry_count = 2;

        let wire = serde_json::to_value(&action).unwrap();
        assert_eq!(wire["type"], "input");
        assert_eq!(wire["target"], "3");
        assert_eq!(wire["value"], "rust tutorials|ENTER");

        let back: Action = serde_json::from_value(wire).unwrap();
        assert_eq!(back.action_type, ActionType::Input);
        assert_eq!(back.target.as_deref(), Some("3"));
        assert_eq!(back.value.as_deref(), Some("rust tutorials|ENTER"));
        assert_eq!(back.timeout, 8_000);
        assert_eq!(back.retry_count, 2);
    }

    #[test]
    fn absent_optionals_stay_absent_on_the_wire() {
        let action = Action::extract();
        let wire = serde_json::to_value(&action).unwrap();
        let obj = wire.as_object().unwrap();
        assert!(!obj.contains_key("target"));
        assert!(!obj.contains_key("value"));

        let back: Action = serde_json::from_value(wire).unwrap();
        assert!(back.target.is_none());
        assert!(back.value.is_none());
    }

    #[test]
    fn minimal_wire_action_gets_defaults() {
        let back: Action = serde_json::from_str(r#"{"type":"wait"}"#).unwrap();
        assert_eq!(back.action_type, ActionType::Wait);
        assert_eq!(back.timeout, DEFAULT_ACTION_TIMEOUT_MS);
        assert_eq!(back.retry_count, DEFAULT_MAX_RETRIES);
        assert!(back.description.is_empty());
    }

    #[test]
    fn action_type_uses_snake_case_on_the_wire() {
        let v = serde_json::to_value(ActionType::CheckGoal).unwrap();
        assert_eq!(v, "check_goal");
        let t: ActionType = serde_json::from_value(v).unwrap();
        assert_eq!(t, ActionType::CheckGoal);
    }

    #[test]
    fn element_index_parses_only_integers() {
        assert_eq!(Action::click(7).element_index(), Some(7));
        assert_eq!(Action::navigate("https://example.com").element_index(), None);
    }

    #[test]
    fn anyhow_timeouts_map_to_timeout_errors() {
        let e = TaskError::browser(anyhow::anyhow!("Navigation Timeout after 10s"));
        assert!(matches!(e, TaskError::Timeout(_)));
        let e = TaskError::browser(anyhow::anyhow!("element vanished"));
        assert!(matches!(e, TaskError::Browser(_)));
    }
}

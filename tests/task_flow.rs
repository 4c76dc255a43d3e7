//! Full control-loop tests against an in-memory browser fake.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use webpilot::brain::Planner;
use webpilot::engine::{Engine, EngineConfig};
use webpilot::hands::Browser;
use webpilot::task::TaskState;
use webpilot::types::{Action, PageInfo, PageSnapshot, Screenshot, TaskError};

/// Scriptable page: canned scan/link/text payloads plus recorded interactions.
#[derive(Default)]
struct FakeBrowser {
    url: Mutex<String>,
    scan_elements: Mutex<serde_json::Value>,
    links: Mutex<serde_json::Value>,
    page_text: Mutex<String>,
    native_click_fails: Mutex<bool>,
    clicks: Mutex<Vec<String>>,
    typed: Mutex<Vec<String>>,
    keys: Mutex<Vec<String>>,
}

impl FakeBrowser {
    fn new() -> Self {
        let fake = Self::default();
        *fake.scan_elements.lock().unwrap() = json!([]);
        *fake.links.lock().unwrap() = json!([]);
        fake
    }

    fn with_inputs(self, count: usize) -> Self {
        let elements: Vec<_> = (0..count)
            .map(|i| {
                json!({
                    "raw": i,
                    "tag": "input",
                    "kind": "text",
                    "text": "",
                    "placeholder": format!("field {i}"),
                    "x": 100.0,
                    "y": 50.0 + 40.0 * i as f64,
                    "w": 220.0,
                    "h": 28.0,
                    "hidden": false,
                })
            })
            .collect();
        *self.scan_elements.lock().unwrap() = json!(elements);
        self
    }

    fn with_links(self, count: usize) -> Self {
        let links: Vec<_> = (0..count)
            .map(|i| {
                json!({
                    "title": format!("result {i}"),
                    "url": format!("https://found.test/{i}"),
                    "description": format!("result {i}"),
                })
            })
            .collect();
        *self.links.lock().unwrap() = json!(links);
        self
    }

    fn failing_clicks(self) -> Self {
        *self.native_click_fails.lock().unwrap() = true;
        self
    }
}

impl Browser for FakeBrowser {
    fn navigate(&self, url: &str) -> Result<PageInfo> {
        *self.url.lock().unwrap() = url.to_string();
        Ok(self.page_info())
    }

    fn page_info(&self) -> PageInfo {
        PageInfo {
            url: self.url.lock().unwrap().clone(),
            title: "Fake page".to_string(),
        }
    }

    fn run_script(&self, code: &str) -> Result<serde_json::Value> {
        if code.contains("__wpScan") {
            let payload = json!({
                "elements": *self.scan_elements.lock().unwrap(),
                "errors": [],
            });
            Ok(serde_json::Value::String(payload.to_string()))
        } else if code.contains("__wpMark") {
            Ok(serde_json::Value::String("0".to_string()))
        } else if code.contains("__wpLinks") {
            Ok(serde_json::Value::String(
                self.links.lock().unwrap().to_string(),
            ))
        } else if code.contains("__wpText") {
            Ok(serde_json::Value::String(
                self.page_text.lock().unwrap().clone(),
            ))
        } else if code.contains("__wpClick") {
            // The synthetic fallback fails alongside the native strategy.
            if *self.native_click_fails.lock().unwrap() {
                Ok(serde_json::Value::Bool(false))
            } else {
                self.clicks.lock().unwrap().push("script".to_string());
                Ok(serde_json::Value::Bool(true))
            }
        } else {
            Ok(serde_json::Value::Bool(true))
        }
    }

    fn click(&self, selector: &str, _timeout_ms: u64) -> Result<()> {
        if *self.native_click_fails.lock().unwrap() {
            bail!("interaction rejected by page");
        }
        self.clicks.lock().unwrap().push(selector.to_string());
        Ok(())
    }

    fn hover(&self, _selector: &str, _timeout_ms: u64) -> Result<()> {
        Ok(())
    }

    fn scroll_into_view(&self, _selector: &str, _timeout_ms: u64) -> Result<()> {
        Ok(())
    }

    fn type_text(&self, _selector: &str, text: &str, _timeout_ms: u64) -> Result<()> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<()> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn screenshot(&self) -> Result<Screenshot> {
        Ok(Screenshot {
            image_base64: String::new(),
            image_type: "image/jpeg".to_string(),
        })
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Replays a fixed action sequence, then falls back to short waits.
struct ScriptedPlanner {
    actions: VecDeque<Action>,
}

impl ScriptedPlanner {
    fn new(actions: Vec<Action>) -> Self {
        Self {
            actions: actions.into(),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &mut self,
        _snapshot: &PageSnapshot,
        _task: &TaskState,
    ) -> Result<Action, TaskError> {
        Ok(self.actions.pop_front().unwrap_or_else(|| Action::wait(10)))
    }
}

/// Always produces unusable output, like a model answering in prose.
struct MalformedPlanner;

#[async_trait]
impl Planner for MalformedPlanner {
    async fn plan(
        &mut self,
        _snapshot: &PageSnapshot,
        _task: &TaskState,
    ) -> Result<Action, TaskError> {
        webpilot::brain::parse_action("I think we should probably click something?")
    }
}

fn quick_config(max_steps: u32, max_retries: u32) -> EngineConfig {
    EngineConfig {
        max_steps,
        max_retries,
        highlight: false,
        default_wait_ms: 10,
    }
}

#[tokio::test]
async fn step_limit_fails_the_task_but_keeps_extracted_data() {
    // max_steps=1, the planner only ever extracts, the page holds 3 records.
    let browser = Arc::new(FakeBrowser::new().with_links(3));
    let planner = ScriptedPlanner::new(vec![Action::extract(), Action::extract()]);
    let mut engine = Engine::new(browser, planner).with_config(quick_config(1, 3));

    let result = engine.run("grab the list", "https://start.test").await;

    assert_eq!(result.total_steps, 1);
    assert_eq!(result.final_data.len(), 3);
    assert_eq!(result.extracted_items, 3);
    assert!(!result.success);
    assert!(result.error_message.unwrap().contains("step limit"));
}

#[tokio::test]
async fn malformed_planner_output_degrades_to_default_waits() {
    let browser = Arc::new(FakeBrowser::new());
    let mut engine = Engine::new(browser, MalformedPlanner).with_config(quick_config(2, 3));

    let result = engine.run("do something vague", "https://start.test").await;

    assert_eq!(result.total_steps, 2);
    assert!(!result.success);
    // Both steps were substituted and executed; nothing escaped the loop.
    let substitutions = result
        .execution_log
        .iter()
        .filter(|l| l.contains("substituting default"))
        .count();
    assert_eq!(substitutions, 2);
    // The page was already positioned, so both defaults were waits.
    for step in ["step 1: Wait", "step 2: Wait"] {
        assert!(
            result.execution_log.iter().any(|l| l.contains(step)),
            "missing {step} in {:?}",
            result.execution_log
        );
    }
}

#[tokio::test]
async fn search_tasks_auto_complete_once_enough_data_is_collected() {
    let browser = Arc::new(FakeBrowser::new().with_links(5));
    let planner = ScriptedPlanner::new(vec![
        Action::wait(10),
        Action::wait(10),
        Action::wait(10),
        Action::extract(),
    ]);
    let mut engine = Engine::new(browser, planner).with_config(quick_config(15, 3));

    let result = engine
        .run("search for rust tutorials", "https://start.test")
        .await;

    // 5 records landed at step 4: the loop exits well before max_steps.
    assert!(result.success);
    assert!(result.goal_achieved);
    assert_eq!(result.total_steps, 4);
    assert_eq!(result.final_data.len(), 5);
}

#[tokio::test]
async fn consecutive_click_failures_exhaust_the_retry_budget() {
    let browser = Arc::new(FakeBrowser::new().with_inputs(2).with_links(2).failing_clicks());
    let planner = ScriptedPlanner::new(vec![
        Action::extract(),
        Action::click(1),
        Action::click(1),
        Action::click(1),
    ]);
    let mut engine = Engine::new(browser, planner).with_config(quick_config(10, 3));

    let result = engine.run("press the button", "https://start.test").await;

    assert!(!result.success);
    assert!(!result.error_message.unwrap().is_empty());
    assert_eq!(result.total_steps, 4);
    // Data extracted before the failures is still returned.
    assert_eq!(result.final_data.len(), 2);
}

#[tokio::test]
async fn enter_marker_types_text_then_presses_enter_exactly_once() {
    let browser = Arc::new(FakeBrowser::new().with_inputs(2));
    let planner = ScriptedPlanner::new(vec![
        Action::input(1, "hello", true),
        Action::input(2, "plain", false),
    ]);
    let mut engine = Engine::new(browser.clone(), planner).with_config(quick_config(2, 3));

    let result = engine.run("fill the form", "https://start.test").await;

    assert_eq!(result.total_steps, 2);
    let typed = browser.typed.lock().unwrap().clone();
    assert_eq!(typed, vec!["hello".to_string(), "plain".to_string()]);
    // Only the |ENTER-marked value triggered a keypress.
    let keys = browser.keys.lock().unwrap().clone();
    assert_eq!(keys, vec!["Enter".to_string()]);
}

#[tokio::test]
async fn stale_element_references_fail_the_step_without_killing_the_task() {
    // The page has one input; the planner aims at element 9.
    let browser = Arc::new(FakeBrowser::new().with_inputs(1));
    let planner = ScriptedPlanner::new(vec![Action::click(9), Action::extract()]);
    let mut engine = Engine::new(browser, planner).with_config(quick_config(2, 3));

    let result = engine.run("click the thing", "https://start.test").await;

    assert_eq!(result.total_steps, 2);
    let failed_step = result
        .execution_log
        .iter()
        .any(|l| l.contains("step 1 failed") && l.contains("element [9]"));
    assert!(failed_step, "log: {:?}", result.execution_log);
}

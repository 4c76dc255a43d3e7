use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::spawn_blocking;
use tracing::{error, info, warn};

use crate::brain::Planner;
use crate::dom::{self, ElementIndex};
use crate::executor::{self, GoalContext};
use crate::face::AgentEvent;
use crate::hands::{Browser, BrowserSession};
use crate::task::{TaskResult, TaskState, TaskStatus};
use crate::types::{
    Action, DEFAULT_MAX_RETRIES, DEFAULT_MAX_STEPS, DEFAULT_WAIT_MS, PageSnapshot,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_steps: u32,
    pub max_retries: u32,
    /// Draw labeled overlay markers on indexed elements.
    pub highlight: bool,
    /// Duration of the substituted `wait` when planner output is unusable.
    pub default_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_retries: DEFAULT_MAX_RETRIES,
            highlight: true,
            default_wait_ms: DEFAULT_WAIT_MS,
        }
    }
}

/// Drives one task to completion: index, plan, execute, update, repeat.
///
/// Steps run strictly sequentially against one page; every blocking browser
/// call is pushed onto the blocking pool so the runtime stays free. The
/// result for step N is fully applied to the task state before step N+1's
/// indexing pass runs.
pub struct Engine<B: Browser + 'static, P: Planner> {
    browser: Arc<B>,
    planner: P,
    config: EngineConfig,
    events: Option<broadcast::Sender<AgentEvent>>,
    generation: u64,
}

impl<B: Browser + 'static, P: Planner> Engine<B, P> {
    pub fn new(browser: Arc<B>, planner: P) -> Self {
        Self {
            browser,
            planner,
            config: EngineConfig::default(),
            events: None,
            generation: 0,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub async fn run(&mut self, instruction: &str, target_url: &str) -> TaskResult {
        let start = Instant::now();
        let mut task = TaskState::new(
            instruction,
            target_url,
            self.config.max_steps,
            self.config.max_retries,
        );
        let mut log: Vec<String> = Vec::new();

        info!(instruction, target_url, "task started");
        self.emit(AgentEvent::TaskStarted {
            instruction: instruction.to_string(),
        });

        // Position the page before the first step. A slow or failed initial
        // load is not fatal: the planner's first default action is a navigate.
        {
            let browser = self.browser.clone();
            let url = target_url.to_string();
            match spawn_blocking(move || browser.navigate(&url)).await {
                Ok(Ok(page)) => {
                    task.current_url = page.url.clone();
                    log.push(format!("opened target page: {}", page.url));
                }
                Ok(Err(e)) => {
                    warn!(error = %format!("{e:#}"), "initial navigation failed");
                    log.push(format!("initial navigation failed: {e:#}"));
                }
                Err(join) => {
                    return self.bail(task, log, start, format!("browser worker died: {join}"));
                }
            }
        }

        task.begin();

        while task.should_continue() {
            // 1. Fresh element index: a new generation per step, so the
            // upcoming action resolves against the page as it is now.
            self.generation += 1;
            let index = {
                let browser = self.browser.clone();
                let generation = self.generation;
                let highlight = self.config.highlight;
                match spawn_blocking(move || dom::index_page(&*browser, generation, highlight))
                    .await
                {
                    Ok(Ok(index)) => index,
                    Ok(Err(e)) => {
                        warn!(error = %format!("{e:#}"), "indexing failed, continuing with empty index");
                        log.push(format!("element indexing failed: {e:#}"));
                        ElementIndex::empty(generation)
                    }
                    Err(join) => {
                        return self.bail(task, log, start, format!("browser worker died: {join}"));
                    }
                }
            };

            // 2. Snapshot for the planner.
            let page = {
                let browser = self.browser.clone();
                spawn_blocking(move || browser.page_info())
                    .await
                    .unwrap_or_default()
            };
            let snapshot = PageSnapshot {
                page,
                generation: index.generation,
                elements: index.describe(),
            };

            // 3. Exactly one action per step. Unusable planner output is
            // recovered locally with a deterministic default.
            self.emit(AgentEvent::Thinking);
            let action = match self.planner.plan(&snapshot, &task).await {
                Ok(action) => action,
                Err(e) => {
                    warn!(error = %e, "planner output unusable, substituting default");
                    log.push(format!("planner output unusable ({e}), substituting default"));
                    default_action(&task, &self.config)
                }
            };

            let step_no = task.step_count() + 1;
            self.emit(AgentEvent::Step {
                number: step_no,
                description: describe(&action),
            });
            log.push(format!("step {step_no}: {}", describe(&action)));

            // 4. Execute against the current generation.
            let result = {
                let browser = self.browser.clone();
                let action = action.clone();
                let index = index.clone();
                let ctx = GoalContext {
                    instruction: task.instruction.clone(),
                    extracted_items: task.extracted_data.len(),
                };
                match spawn_blocking(move || executor::execute(&*browser, &action, &index, &ctx))
                    .await
                {
                    Ok(result) => result,
                    Err(join) => {
                        return self.bail(task, log, start, format!("step execution died: {join}"));
                    }
                }
            };

            // 5. Fold the result into the task state.
            if let Some(err) = &result.error {
                self.emit(AgentEvent::StepError {
                    message: err.clone(),
                });
                log.push(format!("step {step_no} failed: {err}"));
            } else {
                log.push(format!(
                    "step {step_no} ok ({:.2}s)",
                    result.execution_time
                ));
            }

            let extracted_before = task.extracted_data.len();
            task.apply(action, result);

            let extracted_now = task.extracted_data.len();
            if extracted_now > extracted_before {
                self.emit(AgentEvent::Extracted {
                    count: extracted_now,
                });
                log.push(format!(
                    "collected {} new records ({extracted_now} total)",
                    extracted_now - extracted_before
                ));
            }
            if task.goal_achieved() {
                log.push("goal achieved".to_string());
            }
            if task.status == TaskStatus::Failed {
                log.push(format!(
                    "retry budget exhausted after {} consecutive failures",
                    task.retry_count()
                ));
            }
        }

        task.finalize();
        let result = task.into_result(log, start.elapsed().as_secs_f64());
        info!(
            success = result.success,
            steps = result.total_steps,
            items = result.extracted_items,
            "task finished"
        );
        if result.success {
            self.emit(AgentEvent::TaskComplete {
                summary: format!(
                    "finished in {} steps with {} extracted records",
                    result.total_steps, result.extracted_items
                ),
            });
        } else {
            self.emit(AgentEvent::TaskFailed {
                message: result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "task did not reach its goal".to_string()),
            });
        }
        self.emit(AgentEvent::Ready);
        result
    }

    /// Catastrophic exit outside the step boundary: fail immediately but
    /// still return whatever was extracted.
    fn bail(
        &self,
        mut task: TaskState,
        mut log: Vec<String>,
        start: Instant,
        message: String,
    ) -> TaskResult {
        error!(message = %message, "task aborted");
        task.status = TaskStatus::Failed;
        task.error_context = Some(message.clone());
        log.push(message.clone());
        let result = task.into_result(log, start.elapsed().as_secs_f64());
        self.emit(AgentEvent::TaskFailed { message });
        self.emit(AgentEvent::Ready);
        result
    }
}

/// Deterministic fallback when the planner produced nothing usable: open the
/// target page if it was never reached, otherwise let the page settle.
pub fn default_action(task: &TaskState, config: &EngineConfig) -> Action {
    if task.step_count() == 0 && task.current_url.is_empty() {
        Action::navigate(&task.target_url)
    } else {
        Action::wait(config.default_wait_ms)
    }
}

fn describe(action: &Action) -> String {
    if action.description.is_empty() {
        let mut d = action.action_type.as_str().to_string();
        if let Some(t) = &action.target {
            d.push_str(&format!(" {t}"));
        }
        d
    } else {
        action.description.clone()
    }
}

/// One entry in a batch run.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub instruction: String,
    pub target_url: String,
}

/// Run independent tasks under a bounded concurrency limit. Every task owns
/// its own browser session (isolated cookies/storage); nothing is shared
/// across task boundaries, so no locking is involved.
pub async fn run_batch<P, F>(
    specs: Vec<TaskSpec>,
    max_concurrent: usize,
    headless: bool,
    config: EngineConfig,
    make_planner: F,
) -> Vec<TaskResult>
where
    P: Planner + Send + 'static,
    F: Fn() -> P,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut handles = Vec::with_capacity(specs.len());

    for spec in specs {
        let permit_source = semaphore.clone();
        let planner = make_planner();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit_source.acquire_owned().await.expect("semaphore open");

            let session = match spawn_blocking(move || BrowserSession::launch(headless)).await {
                Ok(Ok(session)) => Arc::new(session),
                Ok(Err(e)) => return launch_failure(&spec, format!("{e:#}")),
                Err(join) => return launch_failure(&spec, join.to_string()),
            };

            let mut engine = Engine::new(session.clone(), planner).with_config(config);
            let result = engine.run(&spec.instruction, &spec.target_url).await;

            let closer = session.clone();
            let _ = spawn_blocking(move || closer.close()).await;
            result
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.unwrap_or_else(|join| TaskResult {
            success: false,
            final_data: Vec::new(),
            execution_log: vec![format!("task worker died: {join}")],
            total_steps: 0,
            total_time: 0.0,
            error_message: Some(join.to_string()),
            goal_achieved: false,
            extracted_items: 0,
        }));
    }
    results
}

fn launch_failure(spec: &TaskSpec, message: String) -> TaskResult {
    error!(instruction = %spec.instruction, message = %message, "browser launch failed");
    TaskResult {
        success: false,
        final_data: Vec::new(),
        execution_log: vec![format!("browser launch failed: {message}")],
        total_steps: 0,
        total_time: 0.0,
        error_message: Some(message),
        goal_achieved: false,
        extracted_items: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_action_navigates_only_while_unpositioned() {
        let config = EngineConfig::default();
        let task = TaskState::new("x", "https://example.com", 5, 3);
        let first = default_action(&task, &config);
        assert_eq!(first.action_type, crate::types::ActionType::Navigate);
        assert_eq!(first.target.as_deref(), Some("https://example.com"));

        // Once the page is positioned, the default degrades to a wait even on
        // the first planned step.
        let mut positioned = TaskState::new("x", "https://example.com", 5, 3);
        positioned.current_url = "https://example.com".to_string();
        let on_page = default_action(&positioned, &config);
        assert_eq!(on_page.action_type, crate::types::ActionType::Wait);

        let mut later = TaskState::new("x", "https://example.com", 5, 3);
        later.begin();
        let wait = Action::wait(10);
        let ok = crate::types::ActionResult::ok(wait.clone(), None, 0.0);
        later.apply(wait, ok);
        let second = default_action(&later, &config);
        assert_eq!(second.action_type, crate::types::ActionType::Wait);
        assert_eq!(
            second.value.as_deref(),
            Some(config.default_wait_ms.to_string().as_str())
        );
    }
}

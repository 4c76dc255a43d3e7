use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::{Action, ActionResult, ActionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Resumable; never entered by the core loop itself.
    Paused,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// How many (Action, ActionResult) pairs are kept for planner summaries.
/// Extracted data itself is never truncated.
pub const HISTORY_LIMIT: usize = 5;
/// Auto-completion: a search-type task with this much data after this many
/// steps is declared done to bound otherwise indefinite loops.
const AUTO_COMPLETE_MIN_ITEMS: usize = 5;
const AUTO_COMPLETE_MIN_STEPS: u32 = 3;

/// Mutable state of one running task. Created once per task, updated after
/// every executed action, folded into a TaskResult at the end.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub instruction: String,
    pub target_url: String,
    pub current_url: String,
    pub status: TaskStatus,
    pub max_steps: u32,
    pub max_retries: u32,
    pub error_context: Option<String>,
    pub extracted_data: Vec<serde_json::Value>,
    step_count: u32,
    retry_count: u32,
    goal_achieved: bool,
    history: VecDeque<(Action, ActionResult)>,
}

impl TaskState {
    pub fn new(instruction: &str, target_url: &str, max_steps: u32, max_retries: u32) -> Self {
        Self {
            instruction: instruction.to_string(),
            target_url: target_url.to_string(),
            current_url: String::new(),
            status: TaskStatus::Pending,
            max_steps,
            max_retries,
            error_context: None,
            extracted_data: Vec::new(),
            step_count: 0,
            retry_count: 0,
            goal_achieved: false,
            history: VecDeque::new(),
        }
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn goal_achieved(&self) -> bool {
        self.goal_achieved
    }

    /// Mark the goal met. Monotonic: once true it is never reset.
    pub fn achieve_goal(&mut self) {
        self.goal_achieved = true;
    }

    /// First step attempt: pending tasks become in-progress.
    pub fn begin(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::InProgress;
        }
    }

    /// The single continuation predicate for the control loop.
    pub fn should_continue(&self) -> bool {
        !self.goal_achieved && self.step_count < self.max_steps && !self.status.is_terminal()
    }

    pub fn recent_history(&self) -> impl Iterator<Item = &(Action, ActionResult)> {
        self.history.iter()
    }

    /// Short textual summary of the retained history for planner prompts.
    pub fn recent_summary(&self) -> String {
        if self.history.is_empty() {
            return "no actions executed yet".to_string();
        }
        let first_shown = self.step_count - self.history.len() as u32;
        self.history
            .iter()
            .enumerate()
            .map(|(i, (action, result))| {
                let status = if result.success { "ok" } else { "failed" };
                format!(
                    "step {} {}: {}",
                    first_shown + i as u32 + 1,
                    action.action_type.as_str(),
                    status
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Fold one executed action into the task: history, step counter, data
    /// merge, goal flags and the retry budget.
    pub fn apply(&mut self, action: Action, result: ActionResult) {
        if let Some(state) = &result.page_state {
            if !state.url.is_empty() {
                self.current_url = state.url.clone();
            }
        }

        if action.action_type == ActionType::Extract && result.success {
            if let Some(items) = result
                .data
                .as_ref()
                .and_then(|d| d.get("items"))
                .and_then(|i| i.as_array())
            {
                self.extracted_data.extend(items.iter().cloned());
            }
        }

        if action.action_type == ActionType::CheckGoal && result.success {
            let achieved = result
                .data
                .as_ref()
                .and_then(|d| d.get("goal_achieved"))
                .and_then(|g| g.as_bool())
                .unwrap_or(false);
            if achieved {
                self.achieve_goal();
            }
        }

        if result.success {
            self.retry_count = 0;
        } else {
            self.retry_count += 1;
            self.error_context = result.error.clone();
            if self.retry_count >= self.max_retries {
                self.status = TaskStatus::Failed;
            }
        }

        self.history.push_back((action, result));
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.step_count += 1;

        if !self.goal_achieved && self.auto_complete_due() {
            self.achieve_goal();
        }
    }

    /// Fallback completion rule for search-like instructions.
    fn auto_complete_due(&self) -> bool {
        self.extracted_data.len() >= AUTO_COMPLETE_MIN_ITEMS
            && self.step_count > AUTO_COMPLETE_MIN_STEPS
            && is_search_task(&self.instruction)
    }

    /// Settle the terminal status once the loop has exited.
    pub fn finalize(&mut self) {
        if self.goal_achieved {
            self.status = TaskStatus::Completed;
        } else if self.status != TaskStatus::Failed && self.step_count >= self.max_steps {
            self.status = TaskStatus::Failed;
            if self.error_context.is_none() {
                self.error_context = Some(format!(
                    "reached maximum step limit ({}) before the goal was met",
                    self.max_steps
                ));
            }
        }
    }

    /// Derive the immutable task summary. Partial data is always carried.
    pub fn into_result(self, execution_log: Vec<String>, total_time: f64) -> TaskResult {
        TaskResult {
            success: self.status == TaskStatus::Completed,
            goal_achieved: self.goal_achieved,
            extracted_items: self.extracted_data.len(),
            final_data: self.extracted_data,
            execution_log,
            total_steps: self.step_count,
            total_time,
            error_message: self.error_context,
        }
    }
}

/// Does the instruction read like a search/collection task?
pub fn is_search_task(instruction: &str) -> bool {
    let instruction = instruction.to_lowercase();
    ["search", "find", "look up", "lookup", "query", "collect"]
        .iter()
        .any(|kw| instruction.contains(kw))
}

/// Immutable summary of a finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub final_data: Vec<serde_json::Value>,
    pub execution_log: Vec<String>,
    pub total_steps: u32,
    pub total_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub goal_achieved: bool,
    pub extracted_items: usize,
}

//! LLM-driven browser automation.
//!
//! A task is one natural-language instruction against one page. Each step the
//! engine re-indexes the page's interactive elements, asks the planner for a
//! single typed [`types::Action`], executes it with a native-first/synthetic-
//! fallback strategy, and folds the [`types::ActionResult`] into the
//! [`task::TaskState`] until the goal is met or the step/retry budget runs out.

pub mod brain;
pub mod dom;
pub mod engine;
pub mod executor;
pub mod face;
pub mod hands;
pub mod task;
pub mod types;

pub use brain::{LlmPlanner, Planner};
pub use dom::{ElementIndex, InteractiveElement, Role};
pub use engine::{Engine, EngineConfig, TaskSpec, run_batch};
pub use hands::{Browser, BrowserSession};
pub use task::{TaskResult, TaskState, TaskStatus};
pub use types::{Action, ActionResult, ActionType, PageSnapshot, TaskError};

use anyhow::Result;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::dom::{self, ElementIndex, InteractiveElement};
use crate::hands::Browser;
use crate::task::is_search_task;
use crate::types::{
    Action, ActionResult, ActionType, DEFAULT_WAIT_MS, ENTER_MARKER, PageState, TaskError,
};

/// Task-level facts the goal check needs beyond the page itself.
#[derive(Debug, Clone, Default)]
pub struct GoalContext {
    pub instruction: String,
    pub extracted_items: usize,
}

/// Execute one action against the current element index.
///
/// Never returns an error: every failure is folded into a failed
/// ActionResult, and every execution is timed regardless of outcome.
pub fn execute<B: Browser + ?Sized>(
    browser: &B,
    action: &Action,
    index: &ElementIndex,
    ctx: &GoalContext,
) -> ActionResult {
    let start = Instant::now();
    let outcome = dispatch(browser, action, index, ctx);
    let secs = start.elapsed().as_secs_f64();

    let mut result = match outcome {
        Ok(data) => ActionResult::ok(action.clone(), data, secs),
        Err(e) => {
            warn!(action = action.action_type.as_str(), error = %e, "action failed");
            ActionResult::err(action.clone(), e, secs)
        }
    };
    result.page_state = Some(observe(browser, index));
    result
}

fn dispatch<B: Browser + ?Sized>(
    browser: &B,
    action: &Action,
    index: &ElementIndex,
    ctx: &GoalContext,
) -> Result<Option<serde_json::Value>, TaskError> {
    match action.action_type {
        ActionType::Navigate => navigate(browser, action),
        ActionType::Click => click(browser, action, index),
        ActionType::Input => input(browser, action, index),
        ActionType::Extract => extract(browser, index),
        ActionType::Wait => wait(action),
        ActionType::Scroll => scroll(browser, action, index),
        ActionType::Hover => hover(browser, action, index),
        ActionType::CheckGoal => check_goal(browser, action, ctx),
    }
}

/// Ordered strategies, first success wins.
fn first_success(
    strategies: Vec<(&'static str, Box<dyn FnOnce() -> Result<()> + '_>)>,
) -> Result<(), TaskError> {
    let mut last: Option<TaskError> = None;
    for (name, run) in strategies {
        match run() {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(strategy = name, error = %format!("{e:#}"), "strategy failed");
                last = Some(TaskError::browser(e));
            }
        }
    }
    Err(last.unwrap_or_else(|| TaskError::Step("no strategy available".into())))
}

fn resolve<'a>(
    action: &Action,
    index: &'a ElementIndex,
) -> Result<&'a InteractiveElement, TaskError> {
    let idx = action
        .element_index()
        .ok_or_else(|| TaskError::Step(format!("{:?} target is not an element index", action.target)))?;
    index.resolve(idx).ok_or_else(|| {
        TaskError::Browser(format!(
            "element [{idx}] not present in index generation {}",
            index.generation
        ))
    })
}

fn navigate<B: Browser + ?Sized>(
    browser: &B,
    action: &Action,
) -> Result<Option<serde_json::Value>, TaskError> {
    let url = action
        .target
        .as_deref()
        .ok_or_else(|| TaskError::Step("navigate requires a target url".into()))?;

    match browser.navigate(url) {
        Ok(page) => Ok(Some(json!({ "url": page.url, "title": page.title }))),
        // Many pages never reach full network idle; a slow load is a warning,
        // not a failure.
        Err(e) => match TaskError::browser(e) {
            TaskError::Timeout(msg) => {
                warn!(url, "navigation timed out, continuing with partial load");
                let page = browser.page_info();
                Ok(Some(json!({
                    "url": page.url,
                    "title": page.title,
                    "warning": msg,
                })))
            }
            other => Err(other),
        },
    }
}

/// Click modifier carried in `value`: "right" / "middle" for the button,
/// "double" for a double left click. Absent means a single left click.
fn parse_click_value(value: Option<&str>) -> (u32, u8) {
    match value.map(|v| v.trim().to_lowercase()).as_deref() {
        Some("right") => (1, 2),
        Some("middle") => (1, 1),
        Some("double") => (2, 0),
        _ => (1, 0),
    }
}

fn click<B: Browser + ?Sized>(
    browser: &B,
    action: &Action,
    index: &ElementIndex,
) -> Result<Option<serde_json::Value>, TaskError> {
    let el = resolve(action, index)?;
    let (clicks, button) = parse_click_value(action.value.as_deref());
    let selector = el.selector.clone();
    let timeout = action.timeout;

    let mut strategies: Vec<(&'static str, Box<dyn FnOnce() -> Result<()> + '_>)> = Vec::new();
    if clicks == 1 && button == 0 {
        strategies.push((
            "native",
            Box::new(move || browser.click(&selector, timeout)),
        ));
    }
    let sel = el.selector.clone();
    strategies.push((
        "synthetic-events",
        Box::new(move || {
            let code = format!(
                r#"(() => {{ // __wpClick
  const el = document.querySelector('{sel}');
  if (!el) return false;
  for (let n = 0; n < {clicks}; n++) {{
    const types = {button} === 2
      ? ['mousedown', 'mouseup', 'contextmenu']
      : ['mousedown', 'mouseup', 'click'];
    for (const t of types) {{
      el.dispatchEvent(new MouseEvent(t, {{
        view: window, bubbles: true, cancelable: true, button: {button},
      }}));
    }}
  }}
  return true;
}})()"#
            );
            expect_true(browser.run_script(&code)?)
        }),
    ));

    first_success(strategies)?;
    Ok(Some(json!({ "clicked": el.index })))
}

/// Split an input value into the text to inject and whether a trailing
/// `|ENTER` marker requested a keypress after typing.
pub fn parse_input_value(value: &str) -> (&str, bool) {
    match value.strip_suffix(ENTER_MARKER) {
        Some(text) => (text, true),
        None => (value, false),
    }
}

fn input<B: Browser + ?Sized>(
    browser: &B,
    action: &Action,
    index: &ElementIndex,
) -> Result<Option<serde_json::Value>, TaskError> {
    let el = resolve(action, index)?;
    let value = action
        .value
        .as_deref()
        .ok_or_else(|| TaskError::Step("input requires a value".into()))?;
    let (text, press_enter) = parse_input_value(value);
    let timeout = action.timeout;

    let native_sel = el.selector.clone();
    let script_sel = el.selector.clone();
    first_success(vec![
        (
            "native",
            Box::new(move || {
                browser.type_text(&native_sel, text, timeout)?;
                if press_enter {
                    browser.press_key("Enter")?;
                }
                Ok(())
            }),
        ),
        (
            "synthetic-events",
            Box::new(move || {
                let quoted = serde_json::to_string(text).expect("plain string");
                let code = format!(
                    r#"(() => {{ // __wpInput
  let input = document.querySelector('{script_sel}');
  if (!input) return false;
  if (input.tagName !== 'INPUT' && input.tagName !== 'TEXTAREA' && input.childElementCount !== 0) {{
    input = input.querySelector('input') || input.querySelector('textarea')
      || input.querySelector('[contenteditable="true"]') || input;
  }}
  input.focus && input.focus();
  const text = {quoted};
  if (input.value === undefined) {{
    input.textContent = text;
  }} else {{
    input.value = text;
    const setter = Object.getOwnPropertyDescriptor(input.__proto__, 'value');
    setter && setter.set && setter.set.call(input, text);
  }}
  input.dispatchEvent(new Event('input', {{ bubbles: true }}));
  if ({press_enter}) {{
    for (const t of ['keydown', 'keypress', 'keyup']) {{
      input.dispatchEvent(new KeyboardEvent(t, {{
        key: 'Enter', code: 'Enter', keyCode: 13, bubbles: true, cancelable: true,
      }}));
    }}
  }}
  return true;
}})()"#
                );
                expect_true(browser.run_script(&code)?)
            }),
        ),
    ])?;

    Ok(Some(json!({ "typed": text, "enter": press_enter })))
}

fn hover<B: Browser + ?Sized>(
    browser: &B,
    action: &Action,
    index: &ElementIndex,
) -> Result<Option<serde_json::Value>, TaskError> {
    let el = resolve(action, index)?;
    let native_sel = el.selector.clone();
    let script_sel = el.selector.clone();
    let timeout = action.timeout;

    first_success(vec![
        (
            "native",
            Box::new(move || browser.hover(&native_sel, timeout)),
        ),
        (
            "synthetic-events",
            Box::new(move || {
                let code = format!(
                    r#"(() => {{ // __wpHover
  const el = document.querySelector('{script_sel}');
  if (!el) return false;
  el.dispatchEvent(new MouseEvent('mouseenter', {{
    bubbles: true, cancelable: true, view: window,
  }}));
  return true;
}})()"#
                );
                expect_true(browser.run_script(&code)?)
            }),
        ),
    ])?;

    Ok(Some(json!({ "hovered": el.index })))
}

fn scroll<B: Browser + ?Sized>(
    browser: &B,
    action: &Action,
    index: &ElementIndex,
) -> Result<Option<serde_json::Value>, TaskError> {
    if action.element_index().is_some() {
        let el = resolve(action, index)?;
        let native_sel = el.selector.clone();
        let script_sel = el.selector.clone();
        let timeout = action.timeout;
        first_success(vec![
            (
                "native",
                Box::new(move || browser.scroll_into_view(&native_sel, timeout)),
            ),
            (
                "synthetic-events",
                Box::new(move || {
                    let code = format!(
                        r#"(() => {{ // __wpScrollTo
  const el = document.querySelector('{script_sel}');
  if (!el) return false;
  el.scrollIntoView({{ block: 'center' }});
  return true;
}})()"#
                    );
                    expect_true(browser.run_script(&code)?)
                }),
            ),
        ])?;
        return Ok(Some(json!({ "scrolled_to": el.index })));
    }

    // No element target: scroll the window by a pixel delta from `value`.
    let dy: i64 = action
        .value
        .as_deref()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(600);
    browser
        .run_script(&format!(
            "(() => {{ // __wpScrollBy\n  window.scrollBy(0, {dy});\n  return true;\n}})()"
        ))
        .map_err(TaskError::browser)?;
    Ok(Some(json!({ "scrolled_by": dy })))
}

fn wait(action: &Action) -> Result<Option<serde_json::Value>, TaskError> {
    let ms: u64 = action
        .value
        .as_deref()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_WAIT_MS);
    std::thread::sleep(std::time::Duration::from_millis(ms));
    Ok(Some(json!({ "waited_ms": ms })))
}

fn extract<B: Browser + ?Sized>(
    browser: &B,
    index: &ElementIndex,
) -> Result<Option<serde_json::Value>, TaskError> {
    let text = dom::visible_text(browser).map_err(TaskError::browser)?;
    let items = dom::collect_links(browser).map_err(TaskError::browser)?;
    let page = browser.page_info();
    info!(items = items.len(), "extracted page data");

    // One structured record per call; the loop merges `items` into the
    // task's accumulated data.
    Ok(Some(json!({
        "url": page.url,
        "title": page.title,
        "text": text,
        "elements": index.describe(),
        "items": items,
    })))
}

fn check_goal<B: Browser + ?Sized>(
    browser: &B,
    action: &Action,
    ctx: &GoalContext,
) -> Result<Option<serde_json::Value>, TaskError> {
    let page = browser.page_info();
    let achieved = match action.value.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(criteria) => {
            let text = dom::visible_text(browser).unwrap_or_default();
            criteria_met(criteria, &page.url, &page.title, &text)
        }
        None => {
            is_search_task(&ctx.instruction)
                && ctx.extracted_items > 0
                && looks_like_results(&page.url)
        }
    };
    Ok(Some(json!({ "goal_achieved": achieved })))
}

/// Every whitespace-separated criteria term must appear somewhere in the
/// page's url, title or visible text (case-insensitive).
fn criteria_met(criteria: &str, url: &str, title: &str, text: &str) -> bool {
    let haystack = format!("{url}\n{title}\n{text}").to_lowercase();
    criteria
        .split_whitespace()
        .all(|term| haystack.contains(&term.to_lowercase()))
}

pub fn looks_like_results(url: &str) -> bool {
    let url = url.to_lowercase();
    url.contains("search") || url.contains("result") || url.contains("?q=") || url.contains("&q=")
        || url.contains("query=")
}

fn observe<B: Browser + ?Sized>(browser: &B, index: &ElementIndex) -> PageState {
    let page = browser.page_info();
    PageState {
        looks_like_results: looks_like_results(&page.url),
        url: page.url,
        title: page.title,
        element_count: index.len(),
        has_search_box: index.has_search_box(),
    }
}

fn expect_true(v: serde_json::Value) -> Result<()> {
    if v.as_bool() == Some(true) {
        Ok(())
    } else {
        anyhow::bail!("target element no longer present in page")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_marker_is_parsed_and_stripped() {
        assert_eq!(parse_input_value("hello|ENTER"), ("hello", true));
        assert_eq!(parse_input_value("hello"), ("hello", false));
        assert_eq!(parse_input_value("|ENTER"), ("", true));
        // Marker only counts at the very end.
        assert_eq!(parse_input_value("a|ENTERb"), ("a|ENTERb", false));
    }

    #[test]
    fn click_value_selects_button_and_count() {
        assert_eq!(parse_click_value(None), (1, 0));
        assert_eq!(parse_click_value(Some("right")), (1, 2));
        assert_eq!(parse_click_value(Some("middle")), (1, 1));
        assert_eq!(parse_click_value(Some("double")), (2, 0));
        assert_eq!(parse_click_value(Some("whatever")), (1, 0));
    }

    #[test]
    fn criteria_terms_all_have_to_match() {
        assert!(criteria_met(
            "rust tutorials",
            "https://example.com/search?q=rust",
            "Rust tutorials - results",
            "learn rust here"
        ));
        assert!(!criteria_met(
            "rust tutorials",
            "https://example.com",
            "Welcome",
            "nothing relevant"
        ));
    }

    #[test]
    fn results_urls_are_recognized() {
        assert!(looks_like_results("https://g.test/search?q=x"));
        assert!(looks_like_results("https://site.test/results/page"));
        assert!(!looks_like_results("https://example.com/home"));
    }
}

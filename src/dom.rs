use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hands::Browser;

/// Semantic category assigned to an indexed element. Drives ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    SearchInput,
    SearchButton,
    FormInput,
    ActionButton,
    NavigationLink,
    FormButton,
    TextArea,
    Generic,
}

impl Role {
    /// Ranking priority: lower sorts first.
    pub fn priority(&self) -> u8 {
        match self {
            Role::SearchInput => 1,
            Role::SearchButton => 2,
            Role::FormInput => 3,
            Role::ActionButton => 4,
            Role::NavigationLink => 5,
            Role::FormButton => 6,
            Role::TextArea => 7,
            Role::Generic => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SearchInput => "search-input",
            Role::SearchButton => "search-button",
            Role::FormInput => "form-input",
            Role::ActionButton => "action-button",
            Role::NavigationLink => "navigation-link",
            Role::FormButton => "form-button",
            Role::TextArea => "text-area",
            Role::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One interactive element with its assigned index. Ephemeral: recreated on
/// every indexing pass, valid only for the generation it was produced from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub index: usize,
    pub tag: String,
    pub selector: String,
    pub text: String,
    pub placeholder: String,
    pub role: Role,
    pub bounds: Bounds,
    pub visible: bool,
    raw: u64,
}

impl InteractiveElement {
    pub fn describe(&self) -> String {
        let mut line = format!("[{}] <{}> {}", self.index, self.tag, self.role.as_str());
        if !self.text.is_empty() {
            line.push_str(&format!(" \"{}\"", self.text));
        }
        if !self.placeholder.is_empty() {
            line.push_str(&format!(" placeholder=\"{}\"", self.placeholder));
        }
        line.push_str(&format!(
            " at ({},{})",
            self.bounds.x.round() as i64,
            self.bounds.y.round() as i64
        ));
        line
    }
}

/// The current numbering of interactive elements on the page. Indices are
/// unique and sequential from 1 and are invalidated by the next rescan.
#[derive(Debug, Clone, Default)]
pub struct ElementIndex {
    pub generation: u64,
    elements: Vec<InteractiveElement>,
}

impl ElementIndex {
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            elements: Vec::new(),
        }
    }

    pub fn resolve(&self, index: usize) -> Option<&InteractiveElement> {
        self.elements.iter().find(|e| e.index == index)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[InteractiveElement] {
        &self.elements
    }

    pub fn describe(&self) -> Vec<String> {
        self.elements.iter().map(|e| e.describe()).collect()
    }

    pub fn has_search_box(&self) -> bool {
        self.elements.iter().any(|e| e.role == Role::SearchInput)
    }
}

/// Raw candidate reported by the in-page scan, before ranking.
#[derive(Debug, Clone, Deserialize)]
struct RawElement {
    raw: u64,
    tag: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    placeholder: String,
    x: f64,
    y: f64,
    w: f64,
    h: f64,
    #[serde(default)]
    hidden: bool,
}

#[derive(Debug, Deserialize)]
struct ScanReport {
    elements: Vec<RawElement>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Selector classes scanned in order. Later entries are site-agnostic
/// search-field heuristics that catch styled search widgets plain form
/// selectors miss.
const SELECTOR_CLASSES: &[&str] = &[
    "input[type=\"text\"]",
    "input[type=\"search\"]",
    "input[type=\"email\"]",
    "input[type=\"password\"]",
    "input:not([type])",
    "input[type=\"submit\"]",
    "input[type=\"button\"]",
    "textarea",
    "button",
    "a[href]",
    "select",
    "[role=\"button\"]",
    "[role=\"searchbox\"]",
    "[role=\"textbox\"]",
    "[contenteditable=\"true\"]",
    "input[placeholder*=\"search\" i]",
    "input[class*=\"search\"]",
    "[class*=\"search\"][class*=\"btn\"]",
    "[class*=\"search\"][class*=\"input\"]",
];

/// Candidates beyond this cap are dropped after ranking to bound planner context.
pub const MAX_INDEXED_ELEMENTS: usize = 20;
/// Elements positioned outside this square are treated as off-screen.
const VIEWPORT_BOUND: f64 = 2_000.0;
const ELEMENT_TEXT_MAX: usize = 50;
/// Visible-text snapshots are truncated to this many characters.
pub const PAGE_TEXT_MAX_CHARS: usize = 4_000;
/// Generic link extraction stops after this many records per call.
pub const EXTRACT_LINKS_MAX: usize = 5;

/// Scan the live page and build a fresh element index for `generation`.
///
/// The page script only reports raw candidates and tags them with a scan id;
/// visibility filtering, role assignment, dedup, ranking and the 20-element
/// cap all happen here. A second script call stamps the chosen elements with
/// their assigned index and (optionally) draws labeled overlay markers,
/// replacing any markers from the previous generation.
pub fn index_page<B: Browser + ?Sized>(
    browser: &B,
    generation: u64,
    highlight: bool,
) -> Result<ElementIndex> {
    let report = browser
        .run_script(&scan_script())
        .context("element scan failed")?;
    let report = report
        .as_str()
        .map(|s| serde_json::from_str::<ScanReport>(s))
        .transpose()
        .context("element scan returned malformed JSON")?
        .context("element scan returned no payload")?;

    for sel in &report.errors {
        warn!(selector = %sel, "selector failed during scan, skipped");
    }

    let index = build_index(report.elements, generation);
    debug!(
        generation,
        elements = index.len(),
        "indexed interactive elements"
    );

    // Marker/attribute stamping is best-effort: a failure here leaves the page
    // unannotated but the index itself is still usable via fresh rescans.
    if let Err(e) = browser.run_script(&mark_script(&index, highlight)) {
        warn!(error = %format!("{e:#}"), "failed to stamp element markers");
    }

    Ok(index)
}

/// Rank, dedup and cap raw candidates into an ElementIndex. Pure.
fn build_index(raw: Vec<RawElement>, generation: u64) -> ElementIndex {
    let mut seen = std::collections::HashSet::new();
    let mut kept: Vec<(Role, RawElement)> = Vec::new();

    for el in raw {
        if !is_visible(&el) {
            continue;
        }
        // Same rounded position + tag counts once.
        let key = (el.x.round() as i64, el.y.round() as i64, el.tag.clone());
        if !seen.insert(key) {
            continue;
        }
        let role = classify_role(&el.tag, &el.kind, &el.text, &el.placeholder);
        kept.push((role, el));
    }

    kept.sort_by_key(|(role, el)| {
        (
            role.priority(),
            el.y.round() as i64,
            el.x.round() as i64,
            el.raw,
        )
    });
    kept.truncate(MAX_INDEXED_ELEMENTS);

    let elements = kept
        .into_iter()
        .enumerate()
        .map(|(i, (role, el))| {
            let index = i + 1;
            InteractiveElement {
                index,
                selector: format!("[data-wp-idx=\"{index}\"]"),
                tag: el.tag,
                text: truncate(&el.text, ELEMENT_TEXT_MAX),
                placeholder: el.placeholder,
                role,
                bounds: Bounds {
                    x: el.x,
                    y: el.y,
                    width: el.w,
                    height: el.h,
                },
                visible: true,
                raw: el.raw,
            }
        })
        .collect();

    ElementIndex {
        generation,
        elements,
    }
}

fn is_visible(el: &RawElement) -> bool {
    el.w > 0.0
        && el.h > 0.0
        && !el.hidden
        && el.x >= 0.0
        && el.y >= 0.0
        && el.x <= VIEWPORT_BOUND
        && el.y <= VIEWPORT_BOUND
}

fn classify_role(tag: &str, kind: &str, text: &str, placeholder: &str) -> Role {
    let text = text.to_lowercase();
    let placeholder = placeholder.to_lowercase();
    let searchy = text.contains("search") || placeholder.contains("search");

    match tag {
        "input" => {
            if kind == "search" || (searchy && matches!(kind, "" | "text")) {
                Role::SearchInput
            } else if matches!(kind, "submit" | "button") {
                if searchy { Role::SearchButton } else { Role::FormButton }
            } else {
                Role::FormInput
            }
        }
        "textarea" => Role::TextArea,
        "button" => {
            if searchy {
                Role::SearchButton
            } else {
                Role::ActionButton
            }
        }
        "a" => Role::NavigationLink,
        _ => Role::Generic,
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn scan_script() -> String {
    let selectors = serde_json::to_string(SELECTOR_CLASSES).expect("static selector list");
    format!(
        r#"(() => {{ // __wpScan
  document.querySelectorAll('.wp-marker').forEach(m => m.remove());
  document.querySelectorAll('[data-wp-idx]').forEach(el => el.removeAttribute('data-wp-idx'));
  document.querySelectorAll('[data-wp-raw]').forEach(el => el.removeAttribute('data-wp-raw'));
  const out = [];
  const errors = [];
  const seen = new Set();
  let raw = 0;
  for (const sel of {selectors}) {{
    let nodes;
    try {{ nodes = document.querySelectorAll(sel); }}
    catch (e) {{ errors.push(sel); continue; }}
    for (const el of nodes) {{
      if (seen.has(el)) continue;
      seen.add(el);
      const rect = el.getBoundingClientRect();
      const style = getComputedStyle(el);
      el.setAttribute('data-wp-raw', String(raw));
      out.push({{
        raw: raw++,
        tag: el.tagName.toLowerCase(),
        kind: (el.type || '').toLowerCase(),
        text: (el.textContent || '').trim().slice(0, 80),
        placeholder: el.placeholder || '',
        x: rect.x, y: rect.y, w: rect.width, h: rect.height,
        hidden: style.display === 'none' || style.visibility === 'hidden'
          || parseFloat(style.opacity) === 0,
      }});
    }}
  }}
  return JSON.stringify({{ elements: out, errors }});
}})()"#
    )
}

fn mark_script(index: &ElementIndex, highlight: bool) -> String {
    let assignments: Vec<serde_json::Value> = index
        .elements()
        .iter()
        .map(|e| serde_json::json!({ "raw": e.raw, "index": e.index }))
        .collect();
    let assignments = serde_json::to_string(&assignments).expect("plain scan ids");
    format!(
        r#"(() => {{ // __wpMark
  let stamped = 0;
  for (const a of {assignments}) {{
    const el = document.querySelector('[data-wp-raw="' + a.raw + '"]');
    if (!el) continue;
    el.setAttribute('data-wp-idx', String(a.index));
    stamped++;
    if (!{highlight}) continue;
    const rect = el.getBoundingClientRect();
    const box = document.createElement('div');
    box.className = 'wp-marker';
    box.style.cssText = 'position:fixed;left:' + rect.x + 'px;top:' + rect.y +
      'px;width:' + rect.width + 'px;height:' + rect.height +
      'px;border:2px solid #e8553d;background:rgba(232,85,61,0.08);' +
      'pointer-events:none;z-index:2147483646;';
    const label = document.createElement('span');
    label.textContent = String(a.index);
    label.style.cssText = 'position:absolute;top:-2px;left:-2px;background:#e8553d;' +
      'color:#fff;font:bold 11px monospace;padding:0 3px;';
    box.appendChild(label);
    document.body.appendChild(box);
  }}
  return JSON.stringify(stamped);
}})()"#
    )
}

/// Visible page text: scripts/styles excluded, whitespace collapsed, capped.
pub fn visible_text<B: Browser + ?Sized>(browser: &B) -> Result<String> {
    let v = browser.run_script(TEXT_JS).context("text capture failed")?;
    let raw = v.as_str().unwrap_or_default();
    let collapsed: String = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(truncate(&collapsed, PAGE_TEXT_MAX_CHARS))
}

const TEXT_JS: &str = r#"(() => { // __wpText
  return (document.body && document.body.innerText) || '';
})()"#;

/// A single extracted record: title, resolved url, short description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    pub title: String,
    pub url: String,
    pub description: String,
}

/// Domain-agnostic itemizer: visible anchors with meaningful text.
pub fn collect_links<B: Browser + ?Sized>(browser: &B) -> Result<Vec<LinkRecord>> {
    let code = format!(
        r#"(() => {{ // __wpLinks
  const out = [];
  const seen = new Set();
  for (const a of document.querySelectorAll('a[href]')) {{
    if (out.length >= {EXTRACT_LINKS_MAX}) break;
    const rect = a.getBoundingClientRect();
    if (rect.width <= 0 || rect.height <= 0) continue;
    const title = (a.textContent || '').trim();
    const href = a.href || '';
    if (title.length < 4 || !href || href.startsWith('javascript')) continue;
    if (seen.has(href)) continue;
    seen.add(href);
    out.push({{
      title: title.slice(0, 200),
      url: href,
      description: title.slice(0, 300),
    }});
  }}
  return JSON.stringify(out);
}})()"#
    );
    let v = browser.run_script(&code).context("link scan failed")?;
    let records = v
        .as_str()
        .map(serde_json::from_str)
        .transpose()
        .context("link scan returned malformed JSON")?
        .unwrap_or_default();
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(raw: u64, tag: &str, kind: &str, x: f64, y: f64) -> RawElement {
        RawElement {
            raw,
            tag: tag.to_string(),
            kind: kind.to_string(),
            text: String::new(),
            placeholder: String::new(),
            x,
            y,
            w: 100.0,
            h: 20.0,
            hidden: false,
        }
    }

    #[test]
    fn indices_are_sequential_from_one_with_no_gaps() {
        let candidates = (0..8).map(|i| raw(i, "a", "", 10.0, 50.0 * i as f64));
        let index = build_index(candidates.collect(), 1);
        let got: Vec<usize> = index.elements().iter().map(|e| e.index).collect();
        assert_eq!(got, (1..=8).collect::<Vec<_>>());
        assert_eq!(index.generation, 1);
    }

    #[test]
    fn candidate_set_is_capped_at_twenty() {
        let candidates = (0..40).map(|i| raw(i, "a", "", 10.0, 10.0 * i as f64));
        let index = build_index(candidates.collect(), 3);
        assert_eq!(index.len(), MAX_INDEXED_ELEMENTS);
        assert!(index.resolve(20).is_some());
        assert!(index.resolve(21).is_none());
    }

    #[test]
    fn ranking_is_role_priority_then_top_to_bottom_left_to_right() {
        let mut link = raw(0, "a", "", 5.0, 5.0);
        link.text = "Docs".into();
        let mut button = raw(1, "button", "", 400.0, 300.0);
        button.text = "Go".into();
        let mut search = raw(2, "input", "search", 300.0, 600.0);
        search.placeholder = "Search".into();
        let upper_left_input = raw(3, "input", "text", 10.0, 100.0);
        let lower_input = raw(4, "input", "text", 10.0, 200.0);
        let right_of_lower = raw(5, "input", "text", 500.0, 200.0);

        let index = build_index(
            vec![link, button, search, lower_input, right_of_lower, upper_left_input],
            1,
        );
        let roles: Vec<Role> = index.elements().iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::SearchInput,
                Role::FormInput,
                Role::FormInput,
                Role::FormInput,
                Role::ActionButton,
                Role::NavigationLink,
            ]
        );
        // Among equal roles: y first, then x.
        assert_eq!(index.resolve(2).unwrap().bounds.y, 100.0);
        assert_eq!(index.resolve(3).unwrap().bounds.x, 10.0);
        assert_eq!(index.resolve(4).unwrap().bounds.x, 500.0);
    }

    #[test]
    fn reindexing_the_same_candidates_is_deterministic() {
        let make = || {
            vec![
                raw(0, "button", "", 50.0, 50.0),
                raw(1, "a", "", 20.0, 20.0),
                raw(2, "input", "text", 30.0, 10.0),
            ]
        };
        let a = build_index(make(), 1);
        let b = build_index(make(), 2);
        let lines_a = a.describe();
        let lines_b = b.describe();
        assert_eq!(lines_a, lines_b);
    }

    #[test]
    fn same_rounded_position_and_tag_counts_once() {
        let first = raw(0, "a", "", 10.2, 20.1);
        let dup = raw(1, "a", "", 10.4, 19.8);
        let other_tag = raw(2, "button", "", 10.2, 20.1);
        let index = build_index(vec![first, dup, other_tag], 1);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn invisible_and_offscreen_candidates_are_dropped() {
        let mut hidden = raw(0, "a", "", 10.0, 10.0);
        hidden.hidden = true;
        let mut zero = raw(1, "a", "", 10.0, 30.0);
        zero.w = 0.0;
        let offscreen = raw(2, "a", "", 5_000.0, 10.0);
        let negative = raw(3, "a", "", -40.0, 10.0);
        let fine = raw(4, "a", "", 10.0, 60.0);
        let index = build_index(vec![hidden, zero, offscreen, negative, fine], 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn role_classification_covers_the_table() {
        assert_eq!(classify_role("input", "search", "", ""), Role::SearchInput);
        assert_eq!(
            classify_role("input", "text", "", "Search videos"),
            Role::SearchInput
        );
        assert_eq!(classify_role("input", "text", "", ""), Role::FormInput);
        assert_eq!(classify_role("input", "submit", "Search", ""), Role::SearchButton);
        assert_eq!(classify_role("input", "submit", "Send", ""), Role::FormButton);
        assert_eq!(classify_role("button", "", "Search", ""), Role::SearchButton);
        assert_eq!(classify_role("button", "", "Submit", ""), Role::ActionButton);
        assert_eq!(classify_role("a", "", "Home", ""), Role::NavigationLink);
        assert_eq!(classify_role("textarea", "", "", ""), Role::TextArea);
        assert_eq!(classify_role("div", "", "", ""), Role::Generic);
    }

    #[test]
    fn selectors_resolve_by_assigned_index() {
        let index = build_index(vec![raw(0, "a", "", 10.0, 10.0)], 7);
        let el = index.resolve(1).unwrap();
        assert_eq!(el.selector, "[data-wp-idx=\"1\"]");
    }
}

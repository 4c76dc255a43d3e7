use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser as ChromeBrowser, Element, LaunchOptions, Tab};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::{PageInfo, Screenshot};

/// Narrow DOM-scripting and interaction seam consumed by the indexer and the
/// executor. All selection/ranking logic stays on the host side; the page is
/// only crossed for raw queries, native interactions and event dispatch.
pub trait Browser: Send + Sync {
    /// Load a URL and wait for navigation to settle.
    fn navigate(&self, url: &str) -> Result<PageInfo>;
    /// Current url/title, best effort.
    fn page_info(&self) -> PageInfo;
    /// Evaluate an expression in the page; structured results come back as
    /// JSON-stringified strings, event dispatches as booleans.
    fn run_script(&self, code: &str) -> Result<serde_json::Value>;
    /// Native click on the first element matching `selector`.
    fn click(&self, selector: &str, timeout_ms: u64) -> Result<()>;
    /// Native hover over the matching element.
    fn hover(&self, selector: &str, timeout_ms: u64) -> Result<()>;
    /// Bring the matching element into the viewport.
    fn scroll_into_view(&self, selector: &str, timeout_ms: u64) -> Result<()>;
    /// Clear the matching editable (descending into containers) and type text.
    fn type_text(&self, selector: &str, text: &str, timeout_ms: u64) -> Result<()>;
    /// Key press on the focused element, e.g. "Enter".
    fn press_key(&self, key: &str) -> Result<()>;
    /// JPEG screenshot of the visible viewport.
    fn screenshot(&self) -> Result<Screenshot>;
    /// Tear the page down. Dropping the session also kills a launched browser.
    fn close(&self) -> Result<()>;
}

/// Persistent Chrome session: one browser process (attached or launched), one
/// active tab. Created once per task; tasks never share a session.
pub struct BrowserSession {
    _browser: ChromeBrowser,
    tab: Arc<Tab>,
}

impl BrowserSession {
    /// Attach to an already-running Chrome on the standard debug port, or
    /// launch a fresh one with a persistent shadow profile.
    pub fn launch(headless: bool) -> Result<Self> {
        if let Ok(browser) = ChromeBrowser::connect("http://127.0.0.1:9222".to_string()) {
            info!("attached to existing Chrome on port 9222");
            let tab = {
                let tabs_lock = browser.get_tabs();
                let tabs = tabs_lock.lock().unwrap();
                match tabs.first() {
                    Some(t) => t.clone(),
                    None => browser.new_tab()?,
                }
            };
            return Ok(Self {
                _browser: browser,
                tab,
            });
        }

        let chrome_path = find_chrome()?;
        let profile_dir = profile_dir()?;
        std::fs::create_dir_all(&profile_dir)?;
        info!(path = %chrome_path.display(), profile = %profile_dir.display(), "launching Chrome");

        let options = LaunchOptions {
            headless,
            path: Some(chrome_path),
            user_data_dir: Some(profile_dir),
            window_size: Some((1536, 864)),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                std::ffi::OsStr::new("--disable-infobars"),
                std::ffi::OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        let browser = ChromeBrowser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// Open a fresh tab and make it current.
    pub fn new_tab(&mut self) -> Result<()> {
        self.tab = self._browser.new_tab()?;
        Ok(())
    }

    fn element(&self, selector: &str, timeout_ms: u64) -> Result<Element<'_>> {
        self.tab
            .wait_for_element_with_custom_timeout(selector, Duration::from_millis(timeout_ms))
            .with_context(|| format!("element not found: {selector}"))
    }
}

impl Browser for BrowserSession {
    fn navigate(&self, url: &str) -> Result<PageInfo> {
        self.tab.navigate_to(url)?;
        self.tab.wait_until_navigated()?;
        // Give late-loading chrome a moment to paint before the first scan.
        if let Err(e) = self.tab.wait_for_element("body") {
            warn!(error = %format!("{e:#}"), "no body after navigation");
        }
        Ok(self.page_info())
    }

    fn page_info(&self) -> PageInfo {
        PageInfo {
            url: self.tab.get_url(),
            title: self.tab.get_title().unwrap_or_default(),
        }
    }

    fn run_script(&self, code: &str) -> Result<serde_json::Value> {
        let result = self.tab.evaluate(code, false)?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }

    fn click(&self, selector: &str, timeout_ms: u64) -> Result<()> {
        self.element(selector, timeout_ms)?.click()?;
        Ok(())
    }

    fn hover(&self, selector: &str, timeout_ms: u64) -> Result<()> {
        self.element(selector, timeout_ms)?.move_mouse_over()?;
        Ok(())
    }

    fn scroll_into_view(&self, selector: &str, timeout_ms: u64) -> Result<()> {
        self.element(selector, timeout_ms)?.call_js_fn(
            "function () { this.scrollIntoView({ block: 'center' }); }",
            vec![],
            false,
        )?;
        Ok(())
    }

    fn type_text(&self, selector: &str, text: &str, timeout_ms: u64) -> Result<()> {
        let el = self.element(selector, timeout_ms)?;
        el.click()?;
        // Focus the first editable descendant when the target is a container,
        // then clear whatever is already in it.
        el.call_js_fn(
            r#"function () {
  let input = this;
  if (input.tagName !== 'INPUT' && input.tagName !== 'TEXTAREA' && input.childElementCount !== 0) {
    input = input.querySelector('input') || input.querySelector('textarea')
      || input.querySelector('[contenteditable="true"]') || input;
  }
  input.focus && input.focus();
  if (input.value !== undefined) { input.value = ''; } else { input.textContent = ''; }
}"#,
            vec![],
            false,
        )?;
        self.tab.type_str(text)?;
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<()> {
        self.tab.press_key(key)?;
        Ok(())
    }

    fn screenshot(&self) -> Result<Screenshot> {
        let bytes = self.tab.capture_screenshot(
            CaptureScreenshotFormatOption::Jpeg,
            Some(60),
            None,
            true,
        )?;
        Ok(Screenshot {
            image_base64: BASE64.encode(&bytes),
            image_type: "image/jpeg".to_string(),
        })
    }

    fn close(&self) -> Result<()> {
        // A launched browser process dies with the session; closing the tab is
        // what matters for an attached browser.
        let _ = self.tab.close(false);
        Ok(())
    }
}

fn profile_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().ok_or_else(|| anyhow!("no local data directory"))?;
    Ok(base.join("webpilot").join("profile"))
}

fn find_chrome() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROME_PATH") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Ok(p);
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ];

    for path in &candidates {
        let p = PathBuf::from(path);
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "Chrome executable not found; set CHROME_PATH or install Google Chrome/Chromium"
    ))
}

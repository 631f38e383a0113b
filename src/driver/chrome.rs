//! Chrome DevTools Protocol driver built on `headless_chrome`.
//!
//! `headless_chrome` is a blocking client, so every protocol round-trip runs
//! on the blocking pool and element/frame waits poll under tokio deadlines.
//! That keeps concurrent reads of one step interleaving on the scheduler.

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::Page::{CaptureScreenshotFormatOption, Viewport};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::scripts;
use super::{
    Cookie, DriverResult, ElementRef, ElementState, LaunchConfig, Launcher, OptionSelector, Page,
    Scope, Session,
};
use crate::error::DriverError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs a blocking protocol call off the async scheduler.
async fn blocking<T, F>(f: F) -> DriverResult<T>
where
    F: FnOnce() -> DriverResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DriverError::Protocol(format!("browser worker panicked: {e}")))?
}

async fn within<T>(
    timeout: Duration,
    what: impl Into<String>,
    fut: impl Future<Output = DriverResult<T>>,
) -> DriverResult<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| DriverError::timeout(what, timeout))?
}

/// Launches a local Chrome/Chromium.
pub struct ChromeLauncher;

#[async_trait]
impl Launcher for ChromeLauncher {
    async fn launch(&self, config: &LaunchConfig) -> DriverResult<Arc<dyn Session>> {
        let config = config.clone();
        let session = blocking(move || ChromeSession::start(config)).await?;
        Ok(Arc::new(session))
    }
}

struct SessionInner {
    browser: Mutex<Option<Browser>>,
    config: LaunchConfig,
}

impl SessionInner {
    fn with_browser<T>(&self, f: impl FnOnce(&Browser) -> DriverResult<T>) -> DriverResult<T> {
        let guard = self
            .browser
            .lock()
            .map_err(|_| DriverError::Protocol("browser lock poisoned".into()))?;
        match guard.as_ref() {
            Some(browser) => f(browser),
            None => Err(DriverError::Closed),
        }
    }

    fn tabs(&self) -> DriverResult<Vec<Arc<Tab>>> {
        self.with_browser(|browser| {
            let tabs = browser
                .get_tabs()
                .lock()
                .map_err(|_| DriverError::Protocol("tab list lock poisoned".into()))?;
            Ok(tabs.clone())
        })
    }

    /// False once the session has been closed, even if a tab handle survives.
    fn is_open(&self) -> bool {
        self.browser.lock().is_ok_and(|guard| guard.is_some())
    }

    fn wrap(self: &Arc<Self>, tab: Arc<Tab>) -> Arc<dyn Page> {
        Arc::new(ChromePage::new(tab, self.clone()))
    }
}

pub struct ChromeSession {
    inner: Arc<SessionInner>,
}

impl ChromeSession {
    fn start(config: LaunchConfig) -> DriverResult<Self> {
        let chrome_path = config.chrome_path.clone().or_else(find_chrome);
        let lang = OsString::from(format!("--lang={}", config.locale));

        let options = LaunchOptions {
            headless: config.headless,
            path: chrome_path,
            window_size: Some(config.viewport),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                lang.as_os_str(),
            ],
            // Long `sleep` steps must not look like an idle browser.
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(
            headless = config.headless,
            slow_mo_ms = config.slow_mo.as_millis() as u64,
            "starting Chrome"
        );
        let browser = Browser::new(options)
            .map_err(|e| DriverError::Protocol(format!("browser launch failed: {e:#}")))?;
        info!("Chrome ready");

        Ok(Self {
            inner: Arc::new(SessionInner {
                browser: Mutex::new(Some(browser)),
                config,
            }),
        })
    }
}

#[async_trait]
impl Session for ChromeSession {
    async fn new_page(&self) -> DriverResult<Arc<dyn Page>> {
        let inner = self.inner.clone();
        blocking(move || {
            let tab = inner.with_browser(|browser| Ok(browser.new_tab()?))?;
            tab.set_user_agent(
                &inner.config.user_agent,
                Some(&inner.config.accept_language),
                None,
            )?;
            tab.set_default_timeout(inner.config.default_timeout);
            Ok(inner.wrap(tab))
        })
        .await
    }

    async fn page_count(&self) -> usize {
        self.inner.tabs().map(|tabs| tabs.len()).unwrap_or(0)
    }

    async fn wait_for_new_page(&self, known: usize, timeout: Duration) -> Option<Arc<dyn Page>> {
        let polling = async {
            loop {
                match self.inner.tabs() {
                    Ok(tabs) if tabs.len() > known => {
                        if let Some(tab) = tabs.last() {
                            return Some(self.inner.wrap(tab.clone()));
                        }
                    }
                    Ok(_) => {}
                    Err(_) => return None,
                }
                sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, polling).await.ok().flatten()
    }

    async fn close(&self) -> DriverResult<()> {
        let browser = self
            .inner
            .browser
            .lock()
            .map_err(|_| DriverError::Protocol("browser lock poisoned".into()))?
            .take();
        if let Some(browser) = browser {
            // Dropping the handle terminates the browser process.
            blocking(move || {
                drop(browser);
                Ok(())
            })
            .await?;
            info!("Chrome closed");
        }
        Ok(())
    }
}

/// One Chrome tab.
pub struct ChromePage {
    tab: Arc<Tab>,
    session: Arc<SessionInner>,
    slow_mo: Duration,
    default_timeout: Duration,
    closed: AtomicBool,
}

impl ChromePage {
    fn new(tab: Arc<Tab>, session: Arc<SessionInner>) -> Self {
        Self {
            slow_mo: session.config.slow_mo,
            default_timeout: session.config.default_timeout,
            tab,
            session,
            closed: AtomicBool::new(false),
        }
    }

    fn is_gone(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.session.is_open()
    }

    async fn pace(&self) {
        if !self.slow_mo.is_zero() {
            sleep(self.slow_mo).await;
        }
    }

    async fn eval(&self, body: &'static str, args: Value) -> DriverResult<Value> {
        if self.is_gone() {
            return Err(DriverError::Closed);
        }
        let tab = self.tab.clone();
        let expression = scripts::call(body, &args);
        let raw = blocking(move || Ok(tab.evaluate(&expression, false)?.value)).await?;

        let text = match raw {
            Some(Value::String(text)) => text,
            other => {
                return Err(DriverError::Script(format!(
                    "unexpected evaluation result: {other:?}"
                )));
            }
        };
        let value: Value =
            serde_json::from_str(&text).map_err(|e| DriverError::Script(e.to_string()))?;
        if let Some(message) = value.get("__error").and_then(Value::as_str) {
            return Err(DriverError::Script(message.to_string()));
        }
        Ok(value)
    }

    fn element_args(element: &ElementRef) -> Value {
        json!({
            "hops": element.scope.hops(),
            "selector": element.selector,
            "index": element.index,
        })
    }

    /// Polls until the element is visible and returns its centre point.
    async fn center(&self, element: &ElementRef, timeout: Duration) -> DriverResult<Point> {
        let args = Self::element_args(element);
        let polling = async {
            loop {
                let found = self.eval(scripts::CENTER, args.clone()).await?;
                if found.get("visible").and_then(Value::as_bool) == Some(true) {
                    let x = found["x"].as_f64().unwrap_or_default();
                    let y = found["y"].as_f64().unwrap_or_default();
                    return Ok(Point { x, y });
                }
                sleep(POLL_INTERVAL).await;
            }
        };
        within(
            timeout,
            format!("'{}' to become actionable", element.selector),
            polling,
        )
        .await
    }

    async fn read(
        &self,
        element: &ElementRef,
        what: &str,
        name: Option<&str>,
        timeout: Duration,
    ) -> DriverResult<Value> {
        let mut args = Self::element_args(element);
        args["what"] = json!(what);
        args["name"] = json!(name);
        let out = within(
            timeout,
            format!("{what} of '{}'", element.selector),
            self.eval(scripts::READ, args),
        )
        .await?;
        if out.get("found").and_then(Value::as_bool) != Some(true) {
            return Err(DriverError::NotFound(format!(
                "element '{}' is no longer attached",
                element.selector
            )));
        }
        Ok(out.get("value").cloned().unwrap_or(Value::Null))
    }

    /// Polls `script` until it yields a frame key.
    async fn poll_frame(
        &self,
        script: &'static str,
        args: Value,
        scope: &Scope,
        timeout: Duration,
        what: String,
    ) -> DriverResult<Scope> {
        let polling = async {
            loop {
                let out = self.eval(script, args.clone()).await?;
                if out.get("gone").and_then(Value::as_bool) == Some(true) {
                    return Err(DriverError::NotFound(format!("scope {scope} is no longer attached")));
                }
                if let Some(key) = out.get("key").and_then(Value::as_str) {
                    return Ok(scope.child(key));
                }
                sleep(POLL_INTERVAL).await;
            }
        };
        within(timeout, what, polling).await
    }

    async fn capture(&self, clip: Option<Viewport>, path: &Path) -> DriverResult<()> {
        let tab = self.tab.clone();
        let png = blocking(move || {
            Ok(tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, clip, true)?)
        })
        .await?;
        tokio::fs::write(path, png).await?;
        debug!(path = %path.display(), "screenshot written");
        Ok(())
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn url(&self) -> DriverResult<String> {
        if self.is_gone() {
            return Err(DriverError::Closed);
        }
        Ok(self.tab.get_url())
    }

    async fn title(&self) -> DriverResult<String> {
        let tab = self.tab.clone();
        blocking(move || Ok(tab.get_title()?)).await
    }

    async fn is_closed(&self) -> bool {
        self.is_gone()
    }

    async fn goto(&self, url: &str, timeout: Duration) -> DriverResult<()> {
        self.pace().await;
        let tab = self.tab.clone();
        let target = url.to_string();
        let restore = self.default_timeout;
        let navigation = blocking(move || {
            tab.set_default_timeout(timeout);
            let outcome = tab
                .navigate_to(&target)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ());
            tab.set_default_timeout(restore);
            Ok(outcome?)
        });
        within(timeout, format!("navigation to {url}"), navigation).await?;
        self.wait_for_load(timeout).await
    }

    async fn wait_for_load(&self, timeout: Duration) -> DriverResult<()> {
        let polling = async {
            loop {
                let state = self.eval(scripts::READY_STATE, json!({})).await?;
                if state.as_str() == Some("complete") {
                    return Ok(());
                }
                sleep(POLL_INTERVAL).await;
            }
        };
        within(timeout, "load state 'complete'", polling).await
    }

    async fn scroll_to_bottom(&self) -> DriverResult<()> {
        self.pace().await;
        self.eval(scripts::SCROLL_TO_BOTTOM, json!({})).await?;
        Ok(())
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> DriverResult<()> {
        let clip = if full_page {
            let size = self.eval(scripts::PAGE_SIZE, json!({})).await?;
            Some(Viewport {
                x: 0.0,
                y: 0.0,
                width: size["width"].as_f64().unwrap_or(1920.0),
                height: size["height"].as_f64().unwrap_or(1080.0),
                scale: 1.0,
            })
        } else {
            None
        };
        self.capture(clip, path).await
    }

    async fn cookies(&self) -> DriverResult<Vec<Cookie>> {
        let tab = self.tab.clone();
        let cookies = blocking(move || Ok(tab.get_cookies()?)).await?;
        Ok(cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
            })
            .collect())
    }

    async fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tab = self.tab.clone();
        blocking(move || {
            tab.close(true)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_element(
        &self,
        scope: &Scope,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> DriverResult<ElementRef> {
        let args = json!({
            "hops": scope.hops(),
            "selector": selector,
            "index": 0,
            "visible": state == ElementState::Visible,
        });
        let polling = async {
            loop {
                let probe = self.eval(scripts::PROBE, args.clone()).await?;
                match probe.get("state").and_then(Value::as_str) {
                    Some("ok") => {
                        return Ok(ElementRef {
                            scope: scope.clone(),
                            selector: selector.to_string(),
                            index: 0,
                        });
                    }
                    Some("no-scope") => {
                        return Err(DriverError::NotFound(format!(
                            "scope {scope} is no longer attached"
                        )));
                    }
                    _ => sleep(POLL_INTERVAL).await,
                }
            }
        };
        within(
            timeout,
            format!("'{selector}' to be {} in {scope}", state.as_str()),
            polling,
        )
        .await
    }

    async fn query_all(&self, scope: &Scope, selector: &str) -> DriverResult<Vec<ElementRef>> {
        let count = self
            .eval(scripts::COUNT, json!({"hops": scope.hops(), "selector": selector}))
            .await?
            .as_i64()
            .unwrap_or(-1);
        if count < 0 {
            return Err(DriverError::NotFound(format!(
                "scope {scope} is no longer attached"
            )));
        }
        Ok((0..count as usize)
            .map(|index| ElementRef {
                scope: scope.clone(),
                selector: selector.to_string(),
                index,
            })
            .collect())
    }

    async fn count_child_frames(&self, scope: &Scope) -> DriverResult<usize> {
        let count = self
            .eval(scripts::COUNT_FRAMES, json!({"hops": scope.hops()}))
            .await?
            .as_i64()
            .unwrap_or(-1);
        usize::try_from(count)
            .map_err(|_| DriverError::NotFound(format!("scope {scope} is no longer attached")))
    }

    async fn child_frame(&self, scope: &Scope, index: usize, timeout: Duration) -> DriverResult<Scope> {
        self.poll_frame(
            scripts::CHILD_FRAME,
            json!({"hops": scope.hops(), "index": index}),
            scope,
            timeout,
            format!("frame #{index} in {scope} to attach"),
        )
        .await
    }

    async fn frame_by_selector(
        &self,
        scope: &Scope,
        selector: &str,
        timeout: Duration,
    ) -> DriverResult<Scope> {
        self.poll_frame(
            scripts::FRAME_BY_SELECTOR,
            json!({"hops": scope.hops(), "selector": selector}),
            scope,
            timeout,
            format!("frame '{selector}' in {scope} to attach"),
        )
        .await
    }

    async fn click(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()> {
        self.pace().await;
        let point = self.center(element, timeout).await?;
        let tab = self.tab.clone();
        within(
            timeout,
            format!("click on '{}'", element.selector),
            blocking(move || {
                tab.click_point(point)?;
                Ok(())
            }),
        )
        .await
    }

    async fn fill(&self, element: &ElementRef, value: &str, timeout: Duration) -> DriverResult<()> {
        self.pace().await;
        let mut args = Self::element_args(element);
        args["value"] = json!(value);
        let out = within(
            timeout,
            format!("fill of '{}'", element.selector),
            self.eval(scripts::FILL, args),
        )
        .await?;
        if out.get("found").and_then(Value::as_bool) != Some(true) {
            return Err(DriverError::NotFound(format!(
                "element '{}' is no longer attached",
                element.selector
            )));
        }
        Ok(())
    }

    async fn hover(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()> {
        self.pace().await;
        let point = self.center(element, timeout).await?;
        let tab = self.tab.clone();
        within(
            timeout,
            format!("hover over '{}'", element.selector),
            blocking(move || {
                tab.move_mouse_to_point(point)?;
                Ok(())
            }),
        )
        .await
    }

    async fn inner_text(&self, element: &ElementRef, timeout: Duration) -> DriverResult<String> {
        let value = self.read(element, "inner_text", None, timeout).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn text_content(
        &self,
        element: &ElementRef,
        timeout: Duration,
    ) -> DriverResult<Option<String>> {
        let value = self.read(element, "text_content", None, timeout).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn inner_html(&self, element: &ElementRef, timeout: Duration) -> DriverResult<String> {
        let value = self.read(element, "inner_html", None, timeout).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
        timeout: Duration,
    ) -> DriverResult<Option<String>> {
        let value = self.read(element, "attribute", Some(name), timeout).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn wait_visible(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()> {
        let mut args = Self::element_args(element);
        args["visible"] = json!(true);
        let polling = async {
            loop {
                let probe = self.eval(scripts::PROBE, args.clone()).await?;
                if probe.get("state").and_then(Value::as_str) == Some("ok") {
                    return Ok(());
                }
                sleep(POLL_INTERVAL).await;
            }
        };
        within(
            timeout,
            format!("'{}' to be visible", element.selector),
            polling,
        )
        .await
    }

    async fn select_option(
        &self,
        element: &ElementRef,
        option: &OptionSelector,
        timeout: Duration,
    ) -> DriverResult<()> {
        self.pace().await;
        let mut args = Self::element_args(element);
        let (by, value) = match option {
            OptionSelector::Value(v) => ("value", json!(v)),
            OptionSelector::Index(i) => ("index", json!(i)),
            OptionSelector::Label(l) => ("label", json!(l)),
        };
        args["by"] = json!(by);
        args["value"] = value;
        let out = within(
            timeout,
            format!("option selection on '{}'", element.selector),
            self.eval(scripts::SELECT, args),
        )
        .await?;
        if out.get("found").and_then(Value::as_bool) != Some(true) {
            return Err(DriverError::NotFound(format!(
                "element '{}' is no longer attached",
                element.selector
            )));
        }
        if out.get("selected").and_then(Value::as_bool) != Some(true) {
            return Err(DriverError::NotFound(format!("no option matching {option:?}")));
        }
        Ok(())
    }

    async fn scroll_into_view(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()> {
        self.pace().await;
        let out = within(
            timeout,
            format!("scroll to '{}'", element.selector),
            self.eval(scripts::SCROLL_INTO_VIEW, Self::element_args(element)),
        )
        .await?;
        if out.get("found").and_then(Value::as_bool) != Some(true) {
            return Err(DriverError::NotFound(format!(
                "element '{}' is no longer attached",
                element.selector
            )));
        }
        Ok(())
    }

    async fn screenshot_element(
        &self,
        element: &ElementRef,
        path: &Path,
        timeout: Duration,
    ) -> DriverResult<()> {
        let rect = within(
            timeout,
            format!("bounds of '{}'", element.selector),
            self.eval(scripts::CLIP_RECT, Self::element_args(element)),
        )
        .await?;
        if rect.is_null() {
            return Err(DriverError::NotFound(format!(
                "element '{}' is no longer attached",
                element.selector
            )));
        }
        let clip = Viewport {
            x: rect["x"].as_f64().unwrap_or_default(),
            y: rect["y"].as_f64().unwrap_or_default(),
            width: rect["width"].as_f64().unwrap_or_default().max(1.0),
            height: rect["height"].as_f64().unwrap_or_default().max(1.0),
            scale: 1.0,
        };
        within(timeout, "element screenshot", self.capture(Some(clip), path)).await
    }
}

/// Well-known install locations. `None` lets `headless_chrome` search `PATH`.
fn find_chrome() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
    ];
    if let Ok(user) = std::env::var("USERNAME") {
        candidates.push(PathBuf::from(format!(
            r"C:\Users\{user}\AppData\Local\Google\Chrome\Application\chrome.exe"
        )));
    }

    let found = candidates.into_iter().find(|p| p.exists());
    if found.is_none() {
        warn!("no Chrome found in well-known locations, falling back to auto-detection");
    }
    found
}

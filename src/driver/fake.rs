//! In-memory driver used by the unit tests.
//!
//! Documents are registered by key; a document lists the keys of the
//! documents embedded in it, so nested and cyclic embeddings are both easy
//! to describe. Frame keys double as scope hops. Every operation is recorded
//! as `"<op> <selector> @ <scope>"` for assertions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{
    Cookie, DriverResult, ElementRef, ElementState, LaunchConfig, Launcher, OptionSelector, Page,
    Scope, Session,
};
use crate::error::DriverError;

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeElement {
    text: String,
    html: String,
    attrs: HashMap<String, String>,
    hidden: bool,
    opens: Option<String>,
    options: Vec<(String, String)>,
}

impl FakeElement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn html(mut self, html: &str) -> Self {
        self.html = html.to_string();
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn link(href: &str) -> Self {
        Self::new().attr("href", href).text(href)
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Clicking this element opens a new top-level document at `url`.
    pub fn opens(mut self, url: &str) -> Self {
        self.opens = Some(url.to_string());
        self
    }

    /// `(value, label)` pairs of a `<select>`.
    pub fn options(mut self, options: &[(&str, &str)]) -> Self {
        self.options = options
            .iter()
            .map(|(v, l)| (v.to_string(), l.to_string()))
            .collect();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeDoc {
    elements: HashMap<String, Vec<FakeElement>>,
    frames: Vec<String>,
}

impl FakeDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(mut self, selector: &str, element: FakeElement) -> Self {
        self.elements
            .entry(selector.to_string())
            .or_default()
            .push(element);
        self
    }

    pub fn frame(mut self, key: &str) -> Self {
        self.frames.push(key.to_string());
        self
    }
}

#[derive(Default)]
struct FakeState {
    docs: Mutex<HashMap<String, FakeDoc>>,
    /// url -> key of the document served there
    sites: Mutex<HashMap<String, String>>,
    /// Top-level documents opened in the session, by URL.
    pages: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    cookies: Mutex<Vec<Cookie>>,
    probe_delay: Mutex<Duration>,
    session_closed: AtomicBool,
    launch_fails: AtomicBool,
}

impl FakeState {
    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn doc_key_for(&self, url: &str) -> Option<String> {
        self.sites.lock().unwrap().get(url).cloned()
    }

    fn doc(&self, key: &str) -> Option<FakeDoc> {
        self.docs.lock().unwrap().get(key).cloned()
    }
}

/// Handle used by tests to describe the pages and inspect what happened.
#[derive(Clone, Default)]
pub(crate) struct FakeBrowser {
    state: Arc<FakeState>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `doc` at `url` under the document key `url`.
    pub fn site(self, url: &str, doc: FakeDoc) -> Self {
        self.state
            .docs
            .lock()
            .unwrap()
            .insert(url.to_string(), doc);
        self.state
            .sites
            .lock()
            .unwrap()
            .insert(url.to_string(), url.to_string());
        self
    }

    /// Registers an embeddable document under `key`.
    pub fn doc(self, key: &str, doc: FakeDoc) -> Self {
        self.state
            .docs
            .lock()
            .unwrap()
            .insert(key.to_string(), doc);
        self
    }

    pub fn cookie(self, name: &str, value: &str, domain: &str) -> Self {
        self.state.cookies.lock().unwrap().push(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
        });
        self
    }

    /// Latency added to every element probe and query.
    pub fn probe_delay(self, delay: Duration) -> Self {
        *self.state.probe_delay.lock().unwrap() = delay;
        self
    }

    pub fn failing_launch(self) -> Self {
        self.state.launch_fails.store(true, Ordering::SeqCst);
        self
    }

    /// Opens a page already navigated to `url`.
    pub fn open(&self, url: &str) -> Arc<FakePage> {
        self.state.pages.lock().unwrap().push(url.to_string());
        Arc::new(FakePage::new(self.state.clone(), url))
    }

    pub fn session(&self) -> Arc<FakeSession> {
        Arc::new(FakeSession {
            state: self.state.clone(),
        })
    }

    pub fn launcher(&self) -> FakeLauncher {
        FakeLauncher {
            state: self.state.clone(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn session_closed(&self) -> bool {
        self.state.session_closed.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeLauncher {
    state: Arc<FakeState>,
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, config: &LaunchConfig) -> DriverResult<Arc<dyn Session>> {
        self.state.record(format!("launch headless={}", config.headless));
        if self.state.launch_fails.load(Ordering::SeqCst) {
            return Err(DriverError::Protocol("no browser executable".into()));
        }
        Ok(Arc::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

pub(crate) struct FakeSession {
    state: Arc<FakeState>,
}

#[async_trait]
impl Session for FakeSession {
    async fn new_page(&self) -> DriverResult<Arc<dyn Page>> {
        self.state.pages.lock().unwrap().push("about:blank".into());
        Ok(Arc::new(FakePage::new(self.state.clone(), "about:blank")))
    }

    async fn page_count(&self) -> usize {
        self.state.pages.lock().unwrap().len()
    }

    async fn wait_for_new_page(&self, known: usize, timeout: Duration) -> Option<Arc<dyn Page>> {
        let newest = {
            let pages = self.state.pages.lock().unwrap();
            (pages.len() > known).then(|| pages.last().cloned()).flatten()
        };
        match newest {
            Some(url) => Some(Arc::new(FakePage::new(self.state.clone(), &url))),
            None => {
                sleep(timeout).await;
                None
            }
        }
    }

    async fn close(&self) -> DriverResult<()> {
        self.state.record("session close".into());
        self.state.session_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakePage {
    state: Arc<FakeState>,
    url: Mutex<String>,
    closed: AtomicBool,
}

impl FakePage {
    fn new(state: Arc<FakeState>, url: &str) -> Self {
        Self {
            state,
            url: Mutex::new(url.to_string()),
            closed: AtomicBool::new(false),
        }
    }

    fn current_url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    /// Walks the hop chain; `None` when any hop is not embedded in its parent.
    fn doc_for(&self, scope: &Scope) -> Option<FakeDoc> {
        let root = self.state.doc_key_for(&self.current_url());
        let mut doc = match root {
            Some(key) => self.state.doc(&key)?,
            None => FakeDoc::new(),
        };
        for hop in scope.hops() {
            if !doc.frames.contains(hop) {
                return None;
            }
            doc = self.state.doc(hop)?;
        }
        Some(doc)
    }

    fn element(&self, element: &ElementRef) -> DriverResult<FakeElement> {
        self.doc_for(&element.scope)
            .and_then(|doc| {
                doc.elements
                    .get(&element.selector)
                    .and_then(|list| list.get(element.index).cloned())
            })
            .ok_or_else(|| {
                DriverError::NotFound(format!("element '{}' is no longer attached", element.selector))
            })
    }

    /// Pages die with their session.
    fn gone(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.state.session_closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> DriverResult<()> {
        if self.gone() {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }

    fn record(&self, op: &str, element: &ElementRef) {
        self.state
            .record(format!("{op} {} @ {}", element.selector, element.scope));
    }
}

#[async_trait]
impl Page for FakePage {
    async fn url(&self) -> DriverResult<String> {
        self.check_open()?;
        Ok(self.current_url())
    }

    async fn title(&self) -> DriverResult<String> {
        Ok(format!("Fake {}", self.current_url()))
    }

    async fn is_closed(&self) -> bool {
        self.gone()
    }

    async fn goto(&self, url: &str, _timeout: Duration) -> DriverResult<()> {
        self.check_open()?;
        self.state.record(format!("goto {url}"));
        if self.state.doc_key_for(url).is_none() {
            return Err(DriverError::Protocol(format!(
                "net::ERR_NAME_NOT_RESOLVED at {url}"
            )));
        }
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn wait_for_load(&self, _timeout: Duration) -> DriverResult<()> {
        self.check_open()
    }

    async fn scroll_to_bottom(&self) -> DriverResult<()> {
        self.check_open()?;
        self.state.record("scroll_to_bottom".into());
        Ok(())
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> DriverResult<()> {
        self.check_open()?;
        self.state
            .record(format!("screenshot {} full_page={full_page}", path.display()));
        tokio::fs::write(path, b"\x89PNG").await?;
        Ok(())
    }

    async fn cookies(&self) -> DriverResult<Vec<Cookie>> {
        Ok(self.state.cookies.lock().unwrap().clone())
    }

    async fn close(&self) -> DriverResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_element(
        &self,
        scope: &Scope,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> DriverResult<ElementRef> {
        self.check_open()?;
        self.state.record(format!("probe {selector} @ {scope}"));
        let delay = *self.state.probe_delay.lock().unwrap();
        if delay >= timeout {
            sleep(timeout).await;
            return Err(DriverError::timeout(selector, timeout));
        }
        sleep(delay).await;

        let found = self.doc_for(scope).and_then(|doc| {
            doc.elements.get(selector).and_then(|list| list.first().cloned())
        });
        match found {
            Some(el) if !(state == ElementState::Visible && el.hidden) => Ok(ElementRef {
                scope: scope.clone(),
                selector: selector.to_string(),
                index: 0,
            }),
            _ => {
                sleep(timeout - delay).await;
                Err(DriverError::timeout(
                    format!("'{selector}' to be {} in {scope}", state.as_str()),
                    timeout,
                ))
            }
        }
    }

    async fn query_all(&self, scope: &Scope, selector: &str) -> DriverResult<Vec<ElementRef>> {
        self.check_open()?;
        self.state.record(format!("query_all {selector} @ {scope}"));
        let delay = *self.state.probe_delay.lock().unwrap();
        sleep(delay).await;
        let doc = self
            .doc_for(scope)
            .ok_or_else(|| DriverError::NotFound(format!("scope {scope} is no longer attached")))?;
        let count = doc.elements.get(selector).map_or(0, Vec::len);
        Ok((0..count)
            .map(|index| ElementRef {
                scope: scope.clone(),
                selector: selector.to_string(),
                index,
            })
            .collect())
    }

    async fn count_child_frames(&self, scope: &Scope) -> DriverResult<usize> {
        self.check_open()?;
        self.doc_for(scope)
            .map(|doc| doc.frames.len())
            .ok_or_else(|| DriverError::NotFound(format!("scope {scope} is no longer attached")))
    }

    async fn child_frame(&self, scope: &Scope, index: usize, timeout: Duration) -> DriverResult<Scope> {
        self.check_open()?;
        let key = self
            .doc_for(scope)
            .and_then(|doc| doc.frames.get(index).cloned());
        match key {
            Some(key) if self.state.doc(&key).is_some() => Ok(scope.child(key)),
            _ => {
                sleep(timeout).await;
                Err(DriverError::timeout(format!("frame #{index} in {scope}"), timeout))
            }
        }
    }

    async fn frame_by_selector(
        &self,
        scope: &Scope,
        selector: &str,
        timeout: Duration,
    ) -> DriverResult<Scope> {
        self.check_open()?;
        self.state.record(format!("frame {selector} @ {scope}"));
        // Selectors address frames as `#<key>` in the fake.
        let key = selector.trim_start_matches('#');
        let embedded = self
            .doc_for(scope)
            .is_some_and(|doc| doc.frames.iter().any(|f| f == key));
        if embedded {
            Ok(scope.child(key))
        } else {
            sleep(timeout).await;
            Err(DriverError::timeout(format!("frame '{selector}' in {scope}"), timeout))
        }
    }

    async fn click(&self, element: &ElementRef, _timeout: Duration) -> DriverResult<()> {
        self.check_open()?;
        let el = self.element(element)?;
        self.record("click", element);
        if let Some(url) = el.opens {
            self.state.pages.lock().unwrap().push(url);
        }
        Ok(())
    }

    async fn fill(&self, element: &ElementRef, value: &str, _timeout: Duration) -> DriverResult<()> {
        self.check_open()?;
        self.element(element)?;
        self.state.record(format!(
            "fill {}={value} @ {}",
            element.selector, element.scope
        ));
        Ok(())
    }

    async fn hover(&self, element: &ElementRef, _timeout: Duration) -> DriverResult<()> {
        self.element(element)?;
        self.record("hover", element);
        Ok(())
    }

    async fn inner_text(&self, element: &ElementRef, _timeout: Duration) -> DriverResult<String> {
        Ok(self.element(element)?.text)
    }

    async fn text_content(
        &self,
        element: &ElementRef,
        _timeout: Duration,
    ) -> DriverResult<Option<String>> {
        Ok(Some(self.element(element)?.text))
    }

    async fn inner_html(&self, element: &ElementRef, _timeout: Duration) -> DriverResult<String> {
        Ok(self.element(element)?.html)
    }

    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
        _timeout: Duration,
    ) -> DriverResult<Option<String>> {
        Ok(self.element(element)?.attrs.get(name).cloned())
    }

    async fn wait_visible(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()> {
        let el = self.element(element)?;
        if el.hidden {
            sleep(timeout).await;
            return Err(DriverError::timeout(
                format!("'{}' to be visible", element.selector),
                timeout,
            ));
        }
        Ok(())
    }

    async fn select_option(
        &self,
        element: &ElementRef,
        option: &OptionSelector,
        _timeout: Duration,
    ) -> DriverResult<()> {
        let el = self.element(element)?;
        let matched = match option {
            OptionSelector::Value(v) => el.options.iter().any(|(value, _)| value == v),
            OptionSelector::Label(l) => el.options.iter().any(|(_, label)| label == l),
            OptionSelector::Index(i) => *i < el.options.len(),
        };
        if !matched {
            return Err(DriverError::NotFound(format!("no option matching {option:?}")));
        }
        self.record("select", element);
        Ok(())
    }

    async fn scroll_into_view(&self, element: &ElementRef, _timeout: Duration) -> DriverResult<()> {
        self.element(element)?;
        self.record("scroll_into_view", element);
        Ok(())
    }

    async fn screenshot_element(
        &self,
        element: &ElementRef,
        path: &Path,
        _timeout: Duration,
    ) -> DriverResult<()> {
        self.element(element)?;
        self.record("screenshot_element", element);
        tokio::fs::write(path, b"\x89PNG").await?;
        Ok(())
    }
}

//! Step loop: runs a script against one browser session.
//!
//! Scope state lives in [`RunState`] and is threaded through every step.
//! Steps run strictly in order. The first failing step records one error
//! result and ends the loop.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::config::{CONTENT_SCRAPE_CONCURRENCY, NEW_PAGE_EVENT_TIMEOUT_MS};
use crate::driver::{ElementRef, ElementState, OptionSelector, Page, Scope, Session};
use crate::error::{DriverError, StepError};
use crate::events::RunEvent;
use crate::pdf::{self, DocumentFetcher};
use crate::resolver::ScopeResolver;
use crate::types::{ActionKind, ActionStep, StepResult, StepStatus, Targeting, value_as_text};

const SCROLL_SETTLE: Duration = Duration::from_millis(500);
const MIN_PAGE_ACCESS: Duration = Duration::from_millis(30_000);

/// Mutable state of one run.
pub struct RunState {
    /// The top-level document. Replaced when a click opens a new one.
    pub root: Arc<dyn Page>,
    pub current: Scope,
    /// Scopes to return to with `switch_to_parent_frame`.
    pub stack: Vec<Scope>,
    pub results: Vec<StepResult>,
}

impl RunState {
    pub fn new(root: Arc<dyn Page>) -> Self {
        Self {
            root,
            current: Scope::top(),
            stack: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Makes `scope` current, remembering the old one.
    fn enter(&mut self, scope: Scope) {
        if !self.stack.contains(&self.current) {
            self.stack.push(self.current.clone());
        }
        self.current = scope;
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_depth: usize,
    pub screenshot_dir: PathBuf,
}

/// Immutable inputs of the step being executed.
struct StepCtx<'a> {
    number: usize,
    step: &'a ActionStep,
    kind: ActionKind,
    timeout: Duration,
    base_url: String,
}

impl StepCtx<'_> {
    fn selector(&self) -> Option<&str> {
        self.step.selector.as_deref()
    }

    fn success(&self) -> StepResult {
        StepResult::success(self.number, self.kind.name())
    }

    /// Per-element budget for multi-element reads.
    fn per_element_timeout(&self) -> Duration {
        if self.timeout > Duration::from_millis(1000) {
            self.timeout / 2
        } else {
            Duration::from_millis(500)
        }
    }
}

pub struct ActionExecutor {
    session: Arc<dyn Session>,
    fetcher: Arc<dyn DocumentFetcher>,
    resolver: ScopeResolver,
    screenshot_dir: PathBuf,
    events: Option<broadcast::Sender<RunEvent>>,
}

impl ActionExecutor {
    pub fn new(
        session: Arc<dyn Session>,
        fetcher: Arc<dyn DocumentFetcher>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            session,
            fetcher,
            resolver: ScopeResolver::new(config.max_depth),
            screenshot_dir: config.screenshot_dir,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<broadcast::Sender<RunEvent>>) -> Self {
        self.events = events;
        self
    }

    fn publish(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Runs `actions` in order. Returns `false` once a step fails.
    pub async fn execute(
        &self,
        state: &mut RunState,
        actions: &[ActionStep],
        default_timeout: Duration,
    ) -> bool {
        let total = actions.len();
        for (index, step) in actions.iter().enumerate() {
            let number = index + 1;
            let kind = step.kind();
            let timeout = step
                .wait_time_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout);

            info!(
                step = number,
                total,
                action = kind.name(),
                selector = step.selector.as_deref().unwrap_or(""),
                timeout_ms = timeout.as_millis() as u64,
                "running step"
            );
            self.publish(RunEvent::StepStarted {
                step: number,
                total,
                action: kind.name().to_string(),
                selector: step.selector.clone(),
            });

            let outcome = match self.step_context(state, number, step, kind, timeout).await {
                Ok(ctx) => self.run_step(state, &ctx).await,
                Err(err) => Err(err),
            };

            let (result, halted) = match outcome {
                Ok(result) => (result, false),
                Err(err) => (self.error_result(state, number, step, err).await, true),
            };
            self.publish(RunEvent::StepFinished {
                result: result.clone(),
            });
            state.results.push(result);
            if halted {
                return false;
            }
        }
        true
    }

    async fn step_context<'a>(
        &self,
        state: &RunState,
        number: usize,
        step: &'a ActionStep,
        kind: ActionKind,
        timeout: Duration,
    ) -> Result<StepCtx<'a>, StepError> {
        if state.root.is_closed().await {
            return Err(DriverError::Closed.into());
        }
        let base_url = state.root.url().await?;
        let title = state.root.title().await.unwrap_or_default();
        info!(url = %base_url, title = %title, scope = %state.current, "step context");
        Ok(StepCtx {
            number,
            step,
            kind,
            timeout,
            base_url,
        })
    }

    async fn run_step(&self, state: &mut RunState, ctx: &StepCtx<'_>) -> Result<StepResult, StepError> {
        validate(ctx.step, &ctx.kind)?;

        match ctx.kind.targeting(ctx.selector().is_some()) {
            Targeting::Scope => self.switch_scope(state, ctx).await,
            Targeting::Document => self.document_action(state, ctx).await,
            Targeting::Single(wanted) => {
                let selector = ctx.selector().unwrap_or_default();
                let element = self
                    .resolver
                    .resolve_first(state.root.as_ref(), &state.current, selector, wanted, ctx.timeout)
                    .await
                    .ok_or_else(|| StepError::NotFound {
                        selector: selector.to_string(),
                        state: wanted.as_str(),
                        max_depth: self.resolver.max_depth(),
                    })?;
                if element.scope != state.current {
                    info!(from = %state.current, to = %element.scope, "continuing in the scope where the element was found");
                    state.enter(element.scope.clone());
                }
                self.element_action(state, ctx, &element).await
            }
            Targeting::Multi => {
                let selector = ctx.selector().unwrap_or_default();
                let elements = self
                    .resolver
                    .resolve_all(state.root.as_ref(), &state.current, selector, ctx.timeout)
                    .await;
                if elements.is_empty() {
                    warn!(selector, "no elements matched, returning an empty list");
                }
                self.multi_action(state, ctx, &elements).await
            }
        }
    }

    async fn switch_scope(&self, state: &mut RunState, ctx: &StepCtx<'_>) -> Result<StepResult, StepError> {
        match ctx.kind {
            ActionKind::SwitchToIframe => {
                let frame_selector = ctx.step.iframe_selector.as_deref().unwrap_or_default();
                let frame = state
                    .root
                    .frame_by_selector(&state.current, frame_selector, ctx.timeout)
                    .await?;
                info!(scope = %frame, "switched into frame");
                state.enter(frame);
                Ok(ctx.success().with_selector(Some(frame_selector)))
            }
            _ => match state.stack.pop() {
                Some(parent) => {
                    info!(scope = %parent, "returned to parent scope");
                    state.current = parent;
                    Ok(ctx.success())
                }
                None => {
                    warn!("already at top-level or scope stack is empty");
                    Ok(StepResult::new(ctx.number, ctx.kind.name(), StepStatus::Warning)
                        .with_message("Already at top-level or stack empty."))
                }
            },
        }
    }

    async fn document_action(&self, state: &mut RunState, ctx: &StepCtx<'_>) -> Result<StepResult, StepError> {
        let root = state.root.as_ref();
        match &ctx.kind {
            ActionKind::WaitPageLoad => {
                root.wait_for_load(ctx.timeout).await?;
                Ok(ctx.success())
            }
            ActionKind::Sleep => {
                let duration = sleep_duration(ctx.step)?;
                let seconds = duration.as_secs_f64();
                info!(seconds, "sleeping");
                sleep(duration).await;
                Ok(ctx.success().with("duration_sec", seconds))
            }
            ActionKind::ScrollPageToBottom => {
                root.scroll_to_bottom().await?;
                sleep(SCROLL_SETTLE).await;
                Ok(ctx.success())
            }
            ActionKind::Screenshot => {
                let path = self.screenshot_path(ctx)?;
                root.screenshot(&path, true).await?;
                info!(path = %path.display(), "page screenshot saved");
                Ok(ctx.success().with("filename", path.display().to_string()))
            }
            ActionKind::Unknown(tag) => {
                warn!(action = %tag, "undefined action, skipping");
                Ok(StepResult::new(ctx.number, tag, StepStatus::Skipped).with_message("Undefined action"))
            }
            other => Err(StepError::InvalidStep(format!(
                "action '{}' cannot run without a target element",
                other.name()
            ))),
        }
    }

    async fn element_action(
        &self,
        state: &mut RunState,
        ctx: &StepCtx<'_>,
        element: &ElementRef,
    ) -> Result<StepResult, StepError> {
        let page = state.root.clone();
        let t = ctx.timeout;
        let result = ctx.success().with_selector(ctx.selector());

        match &ctx.kind {
            ActionKind::Click => {
                let known = self.session.page_count().await;
                page.click(element, t).await?;
                let wait = Duration::from_millis(NEW_PAGE_EVENT_TIMEOUT_MS);
                match self.session.wait_for_new_page(known, wait).await {
                    Some(new_page) => {
                        if let Err(err) = new_page.wait_for_load(t).await {
                            warn!(error = %err, "new page did not finish loading");
                        }
                        let url = new_page.url().await.unwrap_or_default();
                        info!(url = %url, "click opened a new page, continuing there");
                        state.root = new_page;
                        state.current = Scope::top();
                        state.stack.clear();
                        Ok(result.with("new_page_opened", true).with("new_page_url", url))
                    }
                    None => Ok(result.with("new_page_opened", false)),
                }
            }
            ActionKind::Input => {
                let value = ctx.step.value_text().unwrap_or_default();
                page.fill(element, &value, t).await?;
                Ok(result.with("value", value))
            }
            ActionKind::Hover => {
                page.hover(element, t).await?;
                Ok(result)
            }
            ActionKind::GetInnerText => {
                let text = page.inner_text(element, t).await?;
                Ok(result.with("text", text))
            }
            ActionKind::GetTextContent => {
                let text = page.text_content(element, t).await?;
                Ok(result.with("text", text))
            }
            ActionKind::GetInnerHtml => {
                let html = page.inner_html(element, t).await?;
                Ok(result.with("html", html))
            }
            ActionKind::GetAttribute => {
                let name = ctx.step.attribute_name.as_deref().unwrap_or_default();
                let mut value = page.attribute(element, name, t).await?;
                let mut pdf_text = None;
                if name.eq_ignore_ascii_case("href") {
                    if let Some(href) = value.take() {
                        let absolute = pdf::resolve_url(&ctx.base_url, &href);
                        if pdf::is_pdf_url(&absolute) {
                            info!(url = %absolute, "link points to a PDF, extracting text");
                            pdf_text =
                                Some(pdf::fetch_and_extract(self.fetcher.as_ref(), page.as_ref(), &absolute).await);
                        }
                        value = Some(absolute);
                    }
                }
                let mut result = result.with("attribute", name).with("value", value);
                if let Some(text) = pdf_text {
                    result.insert("pdf_text", text);
                }
                Ok(result)
            }
            ActionKind::WaitVisible => {
                page.wait_visible(element, t).await?;
                Ok(result)
            }
            ActionKind::SelectOption => {
                let option = option_selector(ctx.step)?;
                page.select_option(element, &option, t).await?;
                Ok(result
                    .with("option_type", ctx.step.option_type.clone())
                    .with("option_value", ctx.step.option_value.clone()))
            }
            ActionKind::ScrollToElement => {
                page.scroll_into_view(element, t).await?;
                Ok(result)
            }
            ActionKind::Screenshot => {
                let path = self.screenshot_path(ctx)?;
                page.screenshot_element(element, &path, t).await?;
                info!(path = %path.display(), "element screenshot saved");
                Ok(result.with("filename", path.display().to_string()))
            }
            other => Err(StepError::InvalidStep(format!(
                "action '{}' does not target a single element",
                other.name()
            ))),
        }
    }

    async fn multi_action(
        &self,
        state: &RunState,
        ctx: &StepCtx<'_>,
        elements: &[ElementRef],
    ) -> Result<StepResult, StepError> {
        let page = state.root.as_ref();
        let per_element = ctx.per_element_timeout();
        let result = ctx.success().with_selector(ctx.selector());

        if ctx.kind == ActionKind::GetAllTextContents {
            let texts = join_all(elements.iter().enumerate().map(|(i, el)| async move {
                match page.text_content(el, per_element).await {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(element = i + 1, error = %err, "text read failed");
                        None
                    }
                }
            }))
            .await;
            info!(count = texts.len(), "collected text contents");
            return Ok(result.with("text_list", texts));
        }

        let name = ctx.step.attribute_name.as_deref().unwrap_or_default();
        let mode = name.to_ascii_lowercase();
        let read_name = if matches!(mode.as_str(), "href" | "pdf" | "content") {
            "href"
        } else {
            name
        };

        let values = join_all(elements.iter().enumerate().map(|(i, el)| async move {
            match page.attribute(el, read_name, per_element).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(element = i + 1, attribute = read_name, error = %err, "attribute read failed");
                    None
                }
            }
        }))
        .await;

        match mode.as_str() {
            "href" | "pdf" => {
                let urls = absolute_urls(&ctx.base_url, values);
                let mut result = result.with("attribute", name).with("url_lists", urls.clone());
                if let Some(texts) = self.pdf_texts(page, &urls).await {
                    result.insert("pdf_texts", texts);
                }
                Ok(result)
            }
            "content" => {
                let urls = absolute_urls(&ctx.base_url, values);
                let scraped = self.scraped_texts(&urls, ctx.timeout).await;
                let mut result = result.with("attribute", name).with("url_lists", urls);
                if scraped.iter().any(Option::is_some) {
                    result.insert("scraped_texts", scraped);
                }
                Ok(result)
            }
            _ => {
                info!(attribute = name, count = values.len(), "collected attribute values");
                Ok(result.with("attribute", name).with("attribute_list", values))
            }
        }
    }

    /// Text for every PDF link, aligned with `urls`. `None` when no link is a PDF.
    async fn pdf_texts(&self, page: &dyn Page, urls: &[Option<String>]) -> Option<Vec<Option<String>>> {
        let unique = unique_urls(urls, |url| pdf::is_pdf_url(url));
        if unique.is_empty() {
            return None;
        }
        info!(count = unique.len(), "extracting linked PDFs");
        let texts = join_all(
            unique
                .iter()
                .map(|url| pdf::fetch_and_extract(self.fetcher.as_ref(), page, url)),
        )
        .await;
        let by_url: HashMap<&str, String> = unique.iter().map(String::as_str).zip(texts).collect();
        Some(align(urls, &by_url))
    }

    /// Body text of every non-PDF link, aligned with `urls`.
    async fn scraped_texts(&self, urls: &[Option<String>], timeout: Duration) -> Vec<Option<String>> {
        let unique = unique_urls(urls, |url| !pdf::is_pdf_url(url));
        info!(
            count = unique.len(),
            concurrency = CONTENT_SCRAPE_CONCURRENCY,
            "scraping linked pages"
        );
        let limiter = Semaphore::new(CONTENT_SCRAPE_CONCURRENCY);
        let texts = join_all(unique.iter().map(|url| {
            let limiter = &limiter;
            async move {
                let _permit = limiter.acquire().await.ok()?;
                match scrape_page_text(self.session.as_ref(), url, timeout).await {
                    Ok(text) => Some(text),
                    Err(err) => {
                        warn!(url = %url, error = %err, "page scrape failed");
                        Some(scrape_error_marker(url, &err))
                    }
                }
            }
        }))
        .await;
        let by_url: HashMap<&str, String> = unique
            .iter()
            .map(String::as_str)
            .zip(texts)
            .filter_map(|(url, text)| text.map(|t| (url, t)))
            .collect();
        align(urls, &by_url)
    }

    fn screenshot_path(&self, ctx: &StepCtx<'_>) -> Result<PathBuf, StepError> {
        let requested = ctx.step.value_text().map(|name| sanitize_filename(&name));
        let name = match requested.filter(|name| !name.is_empty()) {
            Some(name) if Path::new(&name).extension().is_some() => name,
            Some(name) => format!("{name}.png"),
            None => format!("screenshot_step{}.png", ctx.number),
        };
        std::fs::create_dir_all(&self.screenshot_dir).map_err(DriverError::from)?;
        Ok(self.screenshot_dir.join(name))
    }

    async fn error_result(&self, state: &RunState, number: usize, step: &ActionStep, err: StepError) -> StepResult {
        let action = step.kind().name().to_string();
        let message = err.to_string();
        let mut full_error = format!("Step {number} ({action}) error: {} - {message}", err.kind());
        error!(step = number, action = %action, error = %message, "step failed");

        let mut screenshot = None;
        if state.root.is_closed().await {
            full_error.push_str(" (Root page was closed)");
            warn!("root page appears to have been closed");
        } else {
            let stem = format!("error_step{number}");
            screenshot = error_screenshot(state.root.as_ref(), &self.screenshot_dir, &stem).await;
        }

        let mut result = StepResult::new(number, &action, StepStatus::Error)
            .with_selector(step.selector.as_deref())
            .with_message(message)
            .with("full_error", full_error);
        if let Some(path) = screenshot {
            result.insert("error_screenshot", path);
        }
        result
    }
}

/// Best-effort full-page screenshot named `<stem>_<timestamp>.png`.
pub(crate) async fn error_screenshot(page: &dyn Page, dir: &Path, stem: &str) -> Option<String> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("{stem}_{timestamp}.png"));
    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        error!(dir = %dir.display(), error = %err, "could not create screenshot directory");
        return None;
    }
    match page.screenshot(&path, true).await {
        Ok(()) => {
            info!(path = %path.display(), "error screenshot saved");
            Some(path.display().to_string())
        }
        Err(err) => {
            error!(error = %err, "error screenshot failed");
            None
        }
    }
}

/// Opens `url` in a throwaway page and returns its body text.
async fn scrape_page_text(session: &dyn Session, url: &str, timeout: Duration) -> Result<String, DriverError> {
    let access = timeout.max(MIN_PAGE_ACCESS);
    let started = Instant::now();
    let page = session.new_page().await?;

    let outcome = async {
        page.goto(url, access.mul_f64(0.9)).await?;
        let remaining = access
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(1000));
        let body = page
            .wait_for_element(&Scope::top(), "body", ElementState::Visible, remaining.mul_f64(0.5))
            .await?;
        let text = page.inner_text(&body, remaining.mul_f64(0.4)).await?;
        Ok(text.trim().to_string())
    }
    .await;

    if let Err(err) = page.close().await {
        warn!(url, error = %err, "could not close scrape page");
    }
    outcome
}

fn scrape_error_marker(url: &str, err: &DriverError) -> String {
    if err.is_timeout() {
        format!("Error: Timeout accessing or getting text from {url}")
    } else {
        format!("Error: Failed to get text from {url} - {}", err.kind())
    }
}

fn validate(step: &ActionStep, kind: &ActionKind) -> Result<(), StepError> {
    let action = kind.name();
    let has = |field: &Option<String>| field.as_deref().is_some_and(|s| !s.trim().is_empty());

    match kind {
        ActionKind::SwitchToIframe if !has(&step.iframe_selector) => {
            return Err(StepError::missing(action, "iframe_selector"));
        }
        ActionKind::Sleep => {
            sleep_duration(step)?;
        }
        _ => {}
    }

    let needs_selector = matches!(
        kind.targeting(step.selector.is_some()),
        Targeting::Single(_) | Targeting::Multi
    );
    if needs_selector && !has(&step.selector) {
        return Err(StepError::missing(action, "selector"));
    }

    match kind {
        ActionKind::Input if step.value.as_ref().is_none_or(Value::is_null) => {
            Err(StepError::missing(action, "value"))
        }
        ActionKind::GetAttribute | ActionKind::GetAllAttributes if !has(&step.attribute_name) => {
            Err(StepError::missing(action, "attribute_name"))
        }
        ActionKind::SelectOption => option_selector(step).map(|_| ()),
        _ => Ok(()),
    }
}

fn sleep_duration(step: &ActionStep) -> Result<Duration, StepError> {
    let seconds = match &step.value {
        None | Some(Value::Null) => return Ok(Duration::from_secs(1)),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    seconds
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .ok_or_else(|| StepError::InvalidStep("Action 'sleep' requires a non-negative number of seconds".into()))
}

fn option_selector(step: &ActionStep) -> Result<OptionSelector, StepError> {
    let invalid = || StepError::InvalidStep("Invalid 'option_type' or 'option_value'.".into());
    let value = step
        .option_value
        .as_ref()
        .and_then(value_as_text)
        .ok_or_else(invalid)?;
    match step.option_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("value") => Ok(OptionSelector::Value(value)),
        Some("label") => Ok(OptionSelector::Label(value)),
        Some("index") => value
            .trim()
            .parse()
            .map(OptionSelector::Index)
            .map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn absolute_urls(base: &str, hrefs: Vec<Option<String>>) -> Vec<Option<String>> {
    hrefs
        .into_iter()
        .map(|href| href.map(|h| pdf::resolve_url(base, &h)))
        .collect()
}

/// Distinct URLs accepted by `keep`, in first-seen order.
fn unique_urls(urls: &[Option<String>], keep: impl Fn(&str) -> bool) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.iter()
        .flatten()
        .filter(|url| keep(url) && seen.insert(url.as_str()))
        .cloned()
        .collect()
}

fn align(urls: &[Option<String>], by_url: &HashMap<&str, String>) -> Vec<Option<String>> {
    urls.iter()
        .map(|url| url.as_deref().and_then(|u| by_url.get(u).cloned()))
        .collect()
}

/// Keeps `[A-Za-z0-9._-]`, replacing everything else with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

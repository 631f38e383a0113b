//! Capability interface over the browser engine.
//!
//! The resolver and executor only ever talk to these traits. The production
//! implementation lives in [`chrome`]; tests use the in-memory fake.

pub mod chrome;
mod scripts;

#[cfg(test)]
pub(crate) mod fake;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

pub type DriverResult<T> = Result<T, DriverError>;

/// State an element must reach before it counts as found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementState {
    Attached,
    Visible,
}

impl ElementState {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementState::Attached => "attached",
            ElementState::Visible => "visible",
        }
    }
}

/// Identity of a scope, used to avoid expanding the same document twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub String);

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A navigable document: the top-level page, or a nested document reached
/// through a chain of frame containers. Each hop is a driver-assigned key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Scope {
    hops: Vec<String>,
}

impl Scope {
    pub fn top() -> Self {
        Self::default()
    }

    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut hops = self.hops.clone();
        hops.push(key.into());
        Self { hops }
    }

    pub fn hops(&self) -> &[String] {
        &self.hops
    }

    pub fn depth(&self) -> usize {
        self.hops.len()
    }

    pub fn is_top(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn id(&self) -> ScopeId {
        ScopeId(self.hops.last().cloned().unwrap_or_else(|| "top".to_string()))
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.hops.is_empty() {
            f.write_str("Page")
        } else {
            write!(f, "Frame({})", self.hops.join(" > "))
        }
    }
}

/// The `index`-th match of `selector` inside `scope`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef {
    pub scope: Scope,
    pub selector: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "lowercase")]
pub enum OptionSelector {
    Value(String),
    Index(usize),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

impl Cookie {
    /// Domain match in the cookie sense: exact host or a parent domain.
    pub fn applies_to(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        host == domain || host.ends_with(&format!(".{domain}"))
    }
}

/// Browser settings applied at launch and to every page opened afterwards.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub headless: bool,
    pub slow_mo: Duration,
    pub user_agent: String,
    pub locale: String,
    pub accept_language: String,
    pub viewport: (u32, u32),
    pub default_timeout: Duration,
    pub chrome_path: Option<std::path::PathBuf>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, config: &LaunchConfig) -> DriverResult<Arc<dyn Session>>;
}

/// One browser instance and its context.
#[async_trait]
pub trait Session: Send + Sync {
    async fn new_page(&self) -> DriverResult<Arc<dyn Page>>;

    async fn page_count(&self) -> usize;

    /// Waits for a top-level document beyond the first `known` to appear.
    async fn wait_for_new_page(&self, known: usize, timeout: Duration) -> Option<Arc<dyn Page>>;

    async fn close(&self) -> DriverResult<()>;
}

/// One top-level document (a tab).
#[async_trait]
pub trait Page: Send + Sync {
    async fn url(&self) -> DriverResult<String>;
    async fn title(&self) -> DriverResult<String>;
    async fn is_closed(&self) -> bool;
    async fn goto(&self, url: &str, timeout: Duration) -> DriverResult<()>;
    async fn wait_for_load(&self, timeout: Duration) -> DriverResult<()>;
    async fn scroll_to_bottom(&self) -> DriverResult<()>;
    async fn screenshot(&self, path: &Path, full_page: bool) -> DriverResult<()>;
    async fn cookies(&self) -> DriverResult<Vec<Cookie>>;
    async fn close(&self) -> DriverResult<()>;

    /// First match of `selector` in `scope` once it reaches `state`.
    async fn wait_for_element(
        &self,
        scope: &Scope,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> DriverResult<ElementRef>;

    /// Every current match of `selector` in `scope`, without waiting.
    async fn query_all(&self, scope: &Scope, selector: &str) -> DriverResult<Vec<ElementRef>>;

    /// Number of visible frame containers directly inside `scope`.
    async fn count_child_frames(&self, scope: &Scope) -> DriverResult<usize>;

    /// Materialises the `index`-th visible frame container as a scope.
    async fn child_frame(&self, scope: &Scope, index: usize, timeout: Duration) -> DriverResult<Scope>;

    async fn frame_by_selector(
        &self,
        scope: &Scope,
        selector: &str,
        timeout: Duration,
    ) -> DriverResult<Scope>;

    async fn click(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()>;
    async fn fill(&self, element: &ElementRef, value: &str, timeout: Duration) -> DriverResult<()>;
    async fn hover(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()>;
    async fn inner_text(&self, element: &ElementRef, timeout: Duration) -> DriverResult<String>;
    async fn text_content(&self, element: &ElementRef, timeout: Duration)
    -> DriverResult<Option<String>>;
    async fn inner_html(&self, element: &ElementRef, timeout: Duration) -> DriverResult<String>;
    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
        timeout: Duration,
    ) -> DriverResult<Option<String>>;
    async fn wait_visible(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()>;
    async fn select_option(
        &self,
        element: &ElementRef,
        option: &OptionSelector,
        timeout: Duration,
    ) -> DriverResult<()>;
    async fn scroll_into_view(&self, element: &ElementRef, timeout: Duration) -> DriverResult<()>;
    async fn screenshot_element(
        &self,
        element: &ElementRef,
        path: &Path,
        timeout: Duration,
    ) -> DriverResult<()>;
}

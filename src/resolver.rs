//! Breadth-first element search across nested documents.
//!
//! The search starts at the caller's current scope, then walks visible frame
//! containers level by level up to `max_depth`, all inside one time budget.
//! Scope identities are tracked so cyclic embeddings are expanded once.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::IFRAME_LOCATOR_TIMEOUT_MS;
use crate::driver::{ElementRef, ElementState, Page, Scope, ScopeId};

/// Below this much remaining budget no new scope is searched.
const EXHAUSTED: Duration = Duration::from_millis(100);
/// Floor for every sub-wait, and the margin kept back from each one.
const MIN_WAIT: Duration = Duration::from_millis(50);
const ELEMENT_PROBE_CAP: Duration = Duration::from_millis(2_000);
const FRAME_CHECK_CAP: Duration = Duration::from_millis(IFRAME_LOCATOR_TIMEOUT_MS);

fn sub_timeout(cap: Duration, remaining: Duration) -> Duration {
    cap.min(remaining.saturating_sub(MIN_WAIT)).max(MIN_WAIT)
}

#[derive(Debug, Clone, Copy)]
pub struct ScopeResolver {
    max_depth: usize,
}

impl ScopeResolver {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// First element matching `selector` that reaches `state`.
    ///
    /// The first scope in traversal order wins. When the search started
    /// below the top-level document and comes up empty, it continues from the
    /// top-level document with the same budget, skipping scopes already seen.
    pub async fn resolve_first(
        &self,
        page: &dyn Page,
        start: &Scope,
        selector: &str,
        state: ElementState,
        timeout: Duration,
    ) -> Option<ElementRef> {
        info!(
            scope = %start,
            selector,
            state = state.as_str(),
            max_depth = self.max_depth,
            timeout_ms = timeout.as_millis() as u64,
            "resolving element"
        );
        let mut search = Search::new(page, start, timeout, self.max_depth);
        let mut fell_back = start.is_top();

        loop {
            while let Some((scope, depth)) = search.next() {
                let probe_timeout = sub_timeout(ELEMENT_PROBE_CAP, search.remaining());
                let probe_started = Instant::now();
                match page
                    .wait_for_element(&scope, selector, state, probe_timeout)
                    .await
                {
                    Ok(element) => {
                        info!(
                            selector,
                            scope = %scope,
                            depth,
                            elapsed_ms = search.elapsed_ms(),
                            "element found"
                        );
                        return Some(element);
                    }
                    Err(err) if err.is_timeout() => debug!(
                        scope = %scope,
                        probe_ms = probe_started.elapsed().as_millis() as u64,
                        "not found directly in scope"
                    ),
                    Err(err) => warn!(scope = %scope, selector, error = %err, "probe failed"),
                }
                search.expand(&scope, depth).await;
            }

            if fell_back || search.remaining() < EXHAUSTED {
                break;
            }
            fell_back = true;
            debug!(selector, "falling back to the top-level document");
            search.seed(Scope::top());
        }

        warn!(
            selector,
            max_depth = self.max_depth,
            elapsed_ms = search.elapsed_ms(),
            "element not found"
        );
        None
    }

    /// Every match of `selector` in every reachable scope.
    ///
    /// Partial results are kept when the budget runs out.
    pub async fn resolve_all(
        &self,
        page: &dyn Page,
        start: &Scope,
        selector: &str,
        timeout: Duration,
    ) -> Vec<ElementRef> {
        info!(
            scope = %start,
            selector,
            max_depth = self.max_depth,
            timeout_ms = timeout.as_millis() as u64,
            "resolving all elements"
        );
        let mut search = Search::new(page, start, timeout, self.max_depth);
        let mut found = Vec::new();

        while let Some((scope, depth)) = search.next() {
            match page.query_all(&scope, selector).await {
                Ok(elements) if !elements.is_empty() => {
                    info!(scope = %scope, depth, count = elements.len(), "elements found in scope");
                    found.extend(elements);
                }
                Ok(_) => debug!(scope = %scope, "no matches in scope"),
                Err(err) => warn!(scope = %scope, selector, error = %err, "query failed"),
            }
            search.expand(&scope, depth).await;
        }

        info!(
            selector,
            total = found.len(),
            elapsed_ms = search.elapsed_ms(),
            "multi-element search finished"
        );
        found
    }
}

struct Search<'a> {
    page: &'a dyn Page,
    queue: VecDeque<(Scope, usize)>,
    visited: HashSet<ScopeId>,
    started: Instant,
    budget: Duration,
    max_depth: usize,
}

impl<'a> Search<'a> {
    fn new(page: &'a dyn Page, start: &Scope, budget: Duration, max_depth: usize) -> Self {
        let mut search = Self {
            page,
            queue: VecDeque::new(),
            visited: HashSet::new(),
            started: Instant::now(),
            budget,
            max_depth,
        };
        search.seed(start.clone());
        search
    }

    fn seed(&mut self, scope: Scope) {
        if self.visited.insert(scope.id()) {
            self.queue.push_back((scope, 0));
        }
    }

    fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Next scope to search, or `None` once the queue or the budget is spent.
    fn next(&mut self) -> Option<(Scope, usize)> {
        if self.queue.is_empty() {
            return None;
        }
        let remaining = self.remaining();
        if remaining < EXHAUSTED {
            warn!(
                remaining_ms = remaining.as_millis() as u64,
                pending = self.queue.len(),
                "search budget exhausted"
            );
            self.queue.clear();
            return None;
        }
        self.queue.pop_front()
    }

    /// Enqueues the attachable child documents of `scope`.
    async fn expand(&mut self, scope: &Scope, depth: usize) {
        if depth >= self.max_depth || self.remaining() < EXHAUSTED {
            return;
        }
        let count = match self.page.count_child_frames(scope).await {
            Ok(count) => count,
            Err(err) => {
                warn!(scope = %scope, error = %err, "frame enumeration failed");
                return;
            }
        };
        if count > 0 {
            debug!(scope = %scope, count, "visible frame candidates");
        }

        for index in 0..count {
            let remaining = self.remaining();
            if remaining < MIN_WAIT {
                break;
            }
            let check = sub_timeout(FRAME_CHECK_CAP, remaining);
            match self.page.child_frame(scope, index, check).await {
                Ok(child) => {
                    if self.visited.insert(child.id()) {
                        debug!(scope = %child, depth = depth + 1, "queued nested scope");
                        self.queue.push_back((child, depth + 1));
                    }
                }
                Err(err) if err.is_timeout() => {
                    debug!(scope = %scope, index, "frame did not attach in time")
                }
                Err(err) => warn!(scope = %scope, index, error = %err, "frame check failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{FakeBrowser, FakeDoc, FakeElement};

    const URL: &str = "https://example.com/";

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn current_scope_is_checked_before_children() {
        let browser = FakeBrowser::new()
            .site(URL, FakeDoc::new().element("#q", FakeElement::new()).frame("a"))
            .doc("a", FakeDoc::new().element("#q", FakeElement::new()));
        let page = browser.open(URL);

        let found = ScopeResolver::new(2)
            .resolve_first(page.as_ref(), &Scope::top(), "#q", ElementState::Attached, ms(5000))
            .await
            .unwrap();
        assert!(found.scope.is_top());
        assert_eq!(browser.calls_starting_with("probe").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finds_element_two_frames_down() {
        let browser = FakeBrowser::new()
            .site(URL, FakeDoc::new().frame("outer"))
            .doc("outer", FakeDoc::new().frame("inner"))
            .doc("inner", FakeDoc::new().element("#q", FakeElement::new()));
        let page = browser.open(URL);

        let found = ScopeResolver::new(2)
            .resolve_first(page.as_ref(), &Scope::top(), "#q", ElementState::Visible, ms(10_000))
            .await
            .unwrap();
        assert_eq!(found.scope, Scope::top().child("outer").child("inner"));
        assert_eq!(found.index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_searches_below_max_depth() {
        let browser = FakeBrowser::new()
            .site(URL, FakeDoc::new().frame("f1"))
            .doc("f1", FakeDoc::new().frame("f2"))
            .doc("f2", FakeDoc::new().frame("f3"))
            .doc("f3", FakeDoc::new().element("#deep", FakeElement::new()));
        let page = browser.open(URL);

        let found = ScopeResolver::new(2)
            .resolve_first(page.as_ref(), &Scope::top(), "#deep", ElementState::Attached, ms(20_000))
            .await;
        assert!(found.is_none());
        let probes = browser.calls_starting_with("probe");
        assert_eq!(probes.len(), 3);
        assert!(probes.iter().all(|p| !p.contains("f3")));
    }

    #[tokio::test(start_paused = true)]
    async fn cyclic_embedding_visits_each_scope_once() {
        let browser = FakeBrowser::new()
            .site(URL, FakeDoc::new().frame("a"))
            .doc("a", FakeDoc::new().frame("b"))
            .doc("b", FakeDoc::new().frame("a"));
        let page = browser.open(URL);

        let found = ScopeResolver::new(10)
            .resolve_first(page.as_ref(), &Scope::top(), "#nope", ElementState::Attached, ms(30_000))
            .await;
        assert!(found.is_none());
        assert_eq!(
            browser.calls_starting_with("probe"),
            vec![
                "probe #nope @ Page",
                "probe #nope @ Frame(a)",
                "probe #nope @ Frame(a > b)",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn multi_mode_unions_matches_across_scopes() {
        let browser = FakeBrowser::new()
            .site(
                URL,
                FakeDoc::new()
                    .element(".item", FakeElement::new())
                    .element(".item", FakeElement::new())
                    .frame("a"),
            )
            .doc(
                "a",
                FakeDoc::new()
                    .element(".item", FakeElement::new())
                    .element(".item", FakeElement::new())
                    .element(".item", FakeElement::new())
                    .frame("top-again"),
            )
            .doc("top-again", FakeDoc::new().frame("a"));
        let page = browser.open(URL);

        let found = ScopeResolver::new(3)
            .resolve_all(page.as_ref(), &Scope::top(), ".item", ms(5000))
            .await;
        assert_eq!(found.len(), 5);
        assert_eq!(found.iter().filter(|e| e.scope.is_top()).count(), 2);
        let unique: HashSet<_> = found.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_element_is_attached_but_not_visible() {
        let browser = FakeBrowser::new().site(URL, FakeDoc::new().element("#banner", FakeElement::new().hidden()));
        let page = browser.open(URL);
        let resolver = ScopeResolver::new(2);

        let attached = resolver
            .resolve_first(page.as_ref(), &Scope::top(), "#banner", ElementState::Attached, ms(1000))
            .await;
        assert!(attached.is_some());

        let visible = resolver
            .resolve_first(page.as_ref(), &Scope::top(), "#banner", ElementState::Visible, ms(1000))
            .await;
        assert!(visible.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn multi_mode_keeps_matches_found_before_budget_ran_out() {
        let browser = FakeBrowser::new()
            .site(
                URL,
                FakeDoc::new()
                    .element(".item", FakeElement::new())
                    .frame("a")
                    .frame("b"),
            )
            .doc("a", FakeDoc::new().element(".item", FakeElement::new()))
            .doc("b", FakeDoc::new().element(".item", FakeElement::new()))
            .probe_delay(ms(700));
        let page = browser.open(URL);

        let found = ScopeResolver::new(2)
            .resolve_all(page.as_ref(), &Scope::top(), ".item", ms(1000))
            .await;
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|e| e.scope != Scope::top().child("b")));
        assert_eq!(
            browser.calls_starting_with("query_all"),
            vec!["query_all .item @ Page", "query_all .item @ Frame(a)"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_budget_runs_out() {
        let browser = FakeBrowser::new()
            .site(URL, FakeDoc::new().frame("a"))
            .doc("a", FakeDoc::new().element("#late", FakeElement::new()));
        let page = browser.open(URL);

        let started = Instant::now();
        let found = ScopeResolver::new(2)
            .resolve_first(page.as_ref(), &Scope::top(), "#late", ElementState::Attached, ms(1000))
            .await;
        assert!(found.is_none());
        assert!(started.elapsed() <= ms(1000));
        assert_eq!(browser.calls_starting_with("probe").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nested_start_falls_back_to_top_level() {
        let browser = FakeBrowser::new()
            .site(URL, FakeDoc::new().element("#submit", FakeElement::new()).frame("a"))
            .doc("a", FakeDoc::new());
        let page = browser.open(URL);

        let found = ScopeResolver::new(2)
            .resolve_first(
                page.as_ref(),
                &Scope::top().child("a"),
                "#submit",
                ElementState::Visible,
                ms(10_000),
            )
            .await
            .unwrap();
        assert!(found.scope.is_top());
        assert_eq!(
            browser.calls_starting_with("probe"),
            vec!["probe #submit @ Frame(a)", "probe #submit @ Page"]
        );
    }

    #[test]
    fn sub_timeouts_are_clamped() {
        assert_eq!(sub_timeout(ELEMENT_PROBE_CAP, ms(10_000)), ms(2000));
        assert_eq!(sub_timeout(ELEMENT_PROBE_CAP, ms(900)), ms(850));
        assert_eq!(sub_timeout(ELEMENT_PROBE_CAP, ms(60)), ms(50));
    }
}

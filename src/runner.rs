//! One complete run: launch, navigate, execute, tear down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{NAVIGATION_TIMEOUT_MULTIPLIER, RunnerConfig};
use crate::driver::{Launcher, Page, Session};
use crate::error::RunError;
use crate::events::RunEvent;
use crate::executor::{ActionExecutor, ExecutorConfig, RunState, error_screenshot};
use crate::pdf::DocumentFetcher;
use crate::types::{RunInput, RunResult, StepResult};

/// Per-invocation knobs chosen by the adapter.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub headless: bool,
    pub slow_mo_ms: u64,
    pub default_timeout: Duration,
}

impl RunOptions {
    /// Input-document values win over the adapter defaults.
    pub fn resolve(input: &RunInput, headless: bool, slow_mo_ms: u64, config: &RunnerConfig) -> Self {
        Self {
            headless: input.headless.unwrap_or(headless),
            slow_mo_ms: input.slow_mo.unwrap_or(slow_mo_ms),
            default_timeout: input
                .default_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(config.default_timeout),
        }
    }
}

pub struct Runner {
    launcher: Arc<dyn Launcher>,
    fetcher: Arc<dyn DocumentFetcher>,
    config: RunnerConfig,
    events: Option<broadcast::Sender<RunEvent>>,
}

impl Runner {
    pub fn new(launcher: Arc<dyn Launcher>, fetcher: Arc<dyn DocumentFetcher>, config: RunnerConfig) -> Self {
        Self {
            launcher,
            fetcher,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Always returns a well-formed result. The session is closed on every path.
    pub async fn run(&self, input: &RunInput, options: &RunOptions) -> RunResult {
        info!(
            target_url = %input.target_url,
            steps = input.actions.len(),
            headless = options.headless,
            slow_mo_ms = options.slow_mo_ms,
            "automation started"
        );

        let launch = self.config.launch_config(options.headless, options.slow_mo_ms);
        let mut steps = Vec::new();

        let (outcome, screenshot) = match self.launcher.launch(&launch).await {
            Ok(session) => {
                let mut page: Option<Arc<dyn Page>> = None;
                let outcome = self
                    .drive(&session, input, options, &mut page, &mut steps)
                    .await;
                // The diagnostic capture needs a live browser.
                let screenshot = match (&outcome, page) {
                    (Err(_), Some(page)) => self.overall_screenshot(page.as_ref()).await,
                    _ => None,
                };
                if let Err(err) = session.close().await {
                    error!(error = %err, "failed to close browser session");
                } else {
                    info!("browser session closed");
                }
                (outcome, screenshot)
            }
            Err(err) => (Err(RunError::Launch(err)), None),
        };

        if let Err(err) = outcome {
            record_overall_failure(err, screenshot, &mut steps);
        }

        let result = RunResult::from_steps(steps);
        if result.success {
            info!("all steps completed successfully");
        } else {
            error!("run finished with errors");
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(RunEvent::RunFinished {
                success: result.success,
                steps: result.steps.len(),
            });
        }
        result
    }

    async fn drive(
        &self,
        session: &Arc<dyn Session>,
        input: &RunInput,
        options: &RunOptions,
        page_slot: &mut Option<Arc<dyn Page>>,
        steps: &mut Vec<StepResult>,
    ) -> Result<(), RunError> {
        let page = session.new_page().await.map_err(RunError::Setup)?;
        *page_slot = Some(page.clone());

        let navigation_timeout = options.default_timeout * NAVIGATION_TIMEOUT_MULTIPLIER;
        info!(url = %input.target_url, timeout_ms = navigation_timeout.as_millis() as u64, "navigating");
        page.goto(&input.target_url, navigation_timeout)
            .await
            .map_err(|source| RunError::Navigation {
                url: input.target_url.clone(),
                source,
            })?;
        info!("navigation succeeded");

        let executor = ActionExecutor::new(
            session.clone(),
            self.fetcher.clone(),
            ExecutorConfig {
                max_depth: self.config.max_depth,
                screenshot_dir: self.config.screenshot_dir.clone(),
            },
        )
        .with_events(self.events.clone());

        let mut state = RunState::new(page);
        executor
            .execute(&mut state, &input.actions, options.default_timeout)
            .await;
        steps.append(&mut state.results);
        Ok(())
    }

    async fn overall_screenshot(&self, page: &dyn Page) -> Option<String> {
        if page.is_closed().await {
            warn!("page already closed, no overall error screenshot");
            return None;
        }
        error_screenshot(page, &self.config.screenshot_dir, "error_overall").await
    }
}

fn record_overall_failure(err: RunError, screenshot: Option<String>, steps: &mut Vec<StepResult>) {
    let full_error = format!("Automation failed: {} - {err}", err.kind());
    error!(error = %err, "automation failed before or outside the step loop");

    if steps.last().is_some_and(StepResult::is_error) {
        warn!("last step already carries the error, not adding an overall record");
        return;
    }
    let mut overall = StepResult::overall_error(err.to_string()).with("full_error", full_error);
    if let Some(path) = screenshot {
        overall.insert("error_screenshot", path);
    }
    steps.push(overall);
}

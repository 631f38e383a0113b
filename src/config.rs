use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::driver::LaunchConfig;
use crate::types::RunInput;

pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 5_000;
pub const IFRAME_LOCATOR_TIMEOUT_MS: u64 = 2_000;
pub const NEW_PAGE_EVENT_TIMEOUT_MS: u64 = 2_000;
pub const PDF_DOWNLOAD_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_DEPTH: usize = 2;
pub const NAVIGATION_TIMEOUT_MULTIPLIER: u32 = 3;
pub const CONTENT_SCRAPE_CONCURRENCY: usize = 5;

pub const DEFAULT_SCREENSHOT_DIR: &str = "screenshots";
pub const DEFAULT_INPUT_DIR: &str = "json";
pub const DEFAULT_INPUT_FILE: &str = "input.json";

pub const DEFAULT_LOCALE: &str = "ja-JP";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "ja-JP,ja;q=0.9,en-US;q=0.8,en;q=0.7";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";
pub const DEFAULT_VIEWPORT: (u32, u32) = (1920, 1080);

/// Tunables shared by every adapter. Built from defaults plus environment.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub default_timeout: Duration,
    pub max_depth: usize,
    pub screenshot_dir: PathBuf,
    pub input_dir: PathBuf,
    pub chrome_path: Option<PathBuf>,
    pub locale: String,
    pub accept_language: String,
    pub user_agent: String,
    pub viewport: (u32, u32),
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_ACTION_TIMEOUT_MS),
            max_depth: DEFAULT_MAX_DEPTH,
            screenshot_dir: PathBuf::from(DEFAULT_SCREENSHOT_DIR),
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            chrome_path: None,
            locale: DEFAULT_LOCALE.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            viewport: DEFAULT_VIEWPORT,
        }
    }
}

impl RunnerConfig {
    /// Loads `.env` if present, then applies `WEB_RUNNER_*` overrides.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "WEB_RUNNER_DEFAULT_TIMEOUT_MS") {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(depth) = parse_var::<usize>(&lookup, "WEB_RUNNER_MAX_DEPTH") {
            config.max_depth = depth;
        }
        if let Some(dir) = lookup("WEB_RUNNER_SCREENSHOT_DIR") {
            config.screenshot_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("WEB_RUNNER_INPUT_DIR") {
            config.input_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("WEB_RUNNER_CHROME_PATH").filter(|p| !p.trim().is_empty()) {
            config.chrome_path = Some(PathBuf::from(path));
        }
        if let Some(locale) = lookup("WEB_RUNNER_LOCALE") {
            config.locale = locale;
        }
        if let Some(ua) = lookup("WEB_RUNNER_USER_AGENT") {
            config.user_agent = ua;
        }
        config
    }

    /// Browser settings for one run.
    pub fn launch_config(&self, headless: bool, slow_mo_ms: u64) -> LaunchConfig {
        LaunchConfig {
            headless,
            slow_mo: Duration::from_millis(slow_mo_ms),
            user_agent: self.user_agent.clone(),
            locale: self.locale.clone(),
            accept_language: self.accept_language.clone(),
            viewport: self.viewport,
            default_timeout: self.default_timeout,
            chrome_path: self.chrome_path.clone(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Maps a bare file name to `<input_dir>/<name>` when that file exists.
pub fn resolve_input_path(input: &Path, input_dir: &Path) -> Result<PathBuf> {
    if input.exists() {
        return Ok(input.to_path_buf());
    }
    let is_bare = input.parent().is_none_or(|p| p.as_os_str().is_empty());
    if is_bare {
        let candidate = input_dir.join(input);
        if candidate.exists() {
            return Ok(candidate);
        }
        bail!(
            "input file not found: {} (also looked in {})",
            input.display(),
            input_dir.display()
        );
    }
    bail!("input file not found: {}", input.display())
}

pub fn load_input(path: &Path) -> Result<RunInput> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    parse_input(&raw).with_context(|| format!("invalid input file {}", path.display()))
}

pub fn parse_input(raw: &str) -> Result<RunInput> {
    let input: RunInput = serde_json::from_str(raw).context("input is not a valid run document")?;
    validate_input(&input)?;
    Ok(input)
}

pub fn validate_input(input: &RunInput) -> Result<()> {
    if input.target_url.trim().is_empty() {
        bail!("'target_url' must be a non-empty string");
    }
    if input.actions.is_empty() {
        bail!("'actions' must be a non-empty list");
    }
    if let Some(pos) = input.actions.iter().position(|a| a.action.trim().is_empty()) {
        bail!("action #{} has an empty 'action' field", pos + 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WEB_RUNNER_DEFAULT_TIMEOUT_MS", "8000"),
            ("WEB_RUNNER_MAX_DEPTH", "deep"),
            ("WEB_RUNNER_LOCALE", "en-US"),
            ("WEB_RUNNER_CHROME_PATH", "  "),
        ]);
        let config = RunnerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.default_timeout, Duration::from_millis(8000));
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(config.locale, "en-US");
        assert!(config.chrome_path.is_none());
        assert_eq!(config.screenshot_dir, PathBuf::from("screenshots"));
    }

    #[test]
    fn bare_names_resolve_inside_input_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job.json"), "{}").unwrap();

        let resolved = resolve_input_path(Path::new("job.json"), dir.path()).unwrap();
        assert_eq!(resolved, dir.path().join("job.json"));

        let missing = resolve_input_path(Path::new("nope.json"), dir.path());
        assert!(missing.unwrap_err().to_string().contains("not found"));
    }

    #[test]
    fn rejects_empty_actions_and_urls() {
        assert!(parse_input(r#"{"target_url": "https://example.com", "actions": []}"#).is_err());
        assert!(parse_input(r#"{"target_url": " ", "actions": [{"action": "sleep"}]}"#).is_err());

        let input = parse_input(
            r#"{"target_url": "https://example.com", "actions": [{"action": "sleep", "value": 2}], "headless": true}"#,
        )
        .unwrap();
        assert_eq!(input.headless, Some(true));
        assert_eq!(input.actions.len(), 1);
    }

    #[test]
    fn load_input_reports_file_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_input(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }
}

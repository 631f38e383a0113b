use std::time::Duration;

use thiserror::Error;

/// Failures reported by the browser driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out after {}ms waiting for {what}", .after.as_millis())]
    Timeout { what: String, after: Duration },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("page or session is closed")]
    Closed,

    #[error("script error: {0}")]
    Script(String),

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        DriverError::Timeout {
            what: what.into(),
            after,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::Timeout { .. } => "Timeout",
            DriverError::NotFound(_) => "NotFound",
            DriverError::Closed => "Closed",
            DriverError::Script(_) => "ScriptError",
            DriverError::Protocol(_) => "ProtocolError",
            DriverError::Io(_) => "IoError",
        }
    }
}

impl From<anyhow::Error> for DriverError {
    fn from(err: anyhow::Error) -> Self {
        DriverError::Protocol(format!("{err:#}"))
    }
}

/// Why a single step failed. Every variant halts the run.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(
        "element '{selector}' (state: {state}) was not found in the current scope or any nested frame up to depth {max_depth}"
    )]
    NotFound {
        selector: String,
        state: &'static str,
        max_depth: usize,
    },

    #[error("{0}")]
    InvalidStep(String),

    #[error("{0}")]
    Driver(#[from] DriverError),
}

impl StepError {
    pub fn missing(action: &str, field: &str) -> Self {
        StepError::InvalidStep(format!("Action '{action}' requires '{field}'"))
    }

    /// Short name used in the `full_error` field of error records.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::NotFound { .. } => "NotFound",
            StepError::InvalidStep(_) => "InvalidStep",
            StepError::Driver(err) if err.is_timeout() => "Timeout",
            StepError::Driver(_) => "DriverError",
        }
    }
}

/// Failures that stop a run before (or outside) the step loop.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to launch browser session: {0}")]
    Launch(#[source] DriverError),

    #[error("initial navigation to {url} failed: {source}")]
    Navigation {
        url: String,
        #[source]
        source: DriverError,
    },

    #[error("session setup failed: {0}")]
    Setup(#[source] DriverError),
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Launch(_) => "SessionFailure",
            RunError::Navigation { .. } => "NavigationFailure",
            RunError::Setup(_) => "SessionFailure",
        }
    }
}

/// Auxiliary document (PDF) pipeline failures. Rendered inline as markers,
/// never propagated into the step result.
#[derive(Debug, Error)]
pub enum PdfError {
    #[error("PDF download failed or returned no data.")]
    Download,

    #[error("PDF data is empty or corrupted.")]
    Empty,

    #[error("PDF file data error - {0}")]
    Parse(String),

    #[error("Unexpected error during PDF text extraction - {0}")]
    Worker(String),
}

impl PdfError {
    /// Inline marker stored in the result payload.
    pub fn marker(&self) -> String {
        format!("Error: {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_kinds() {
        let timeout = StepError::from(DriverError::timeout("#q", Duration::from_millis(50)));
        assert_eq!(timeout.kind(), "Timeout");
        assert!(timeout.to_string().contains("50ms"));

        let closed = StepError::from(DriverError::Closed);
        assert_eq!(closed.kind(), "DriverError");

        let missing = StepError::missing("input", "value");
        assert_eq!(missing.kind(), "InvalidStep");
        assert_eq!(missing.to_string(), "Action 'input' requires 'value'");
    }

    #[test]
    fn pdf_markers_start_with_error_prefix() {
        assert_eq!(
            PdfError::Download.marker(),
            "Error: PDF download failed or returned no data."
        );
        assert!(PdfError::Parse("bad xref".into()).marker().starts_with("Error: "));
    }
}

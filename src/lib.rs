//! JSON-scripted browser automation: resolves elements across nested frames,
//! executes step scripts and reports per-step results.

pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod pdf;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod types;

pub use config::RunnerConfig;
pub use events::RunEvent;
pub use runner::{RunOptions, Runner};
pub use types::{ActionStep, RunInput, RunResult, StepResult, StepStatus};

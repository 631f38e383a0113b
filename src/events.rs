use serde::Serialize;

use crate::types::StepResult;

/// Progress notifications published while a run executes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StepStarted {
        step: usize,
        total: usize,
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    StepFinished {
        result: StepResult,
    },
    RunFinished {
        success: bool,
        steps: usize,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::StepStarted { .. } => "step_started",
            RunEvent::StepFinished { .. } => "step_finished",
            RunEvent::RunFinished { .. } => "run_finished",
        }
    }
}

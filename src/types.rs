use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::driver::ElementState;

/// One declarative instruction from the input script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionStep {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iframe_selector: Option<String>,
    /// Text to input, seconds to sleep, or a screenshot filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time_ms: Option<u64>,
}

impl ActionStep {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attribute_name = Some(name.into());
        self
    }

    pub fn iframe(mut self, selector: impl Into<String>) -> Self {
        self.iframe_selector = Some(selector.into());
        self
    }

    pub fn kind(&self) -> ActionKind {
        ActionKind::parse(&self.action)
    }

    /// `value` rendered as plain text (strings unquoted, numbers/bools as written).
    pub fn value_text(&self) -> Option<String> {
        self.value.as_ref().and_then(value_as_text)
    }
}

pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Closed set of operations the executor knows how to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    SwitchToIframe,
    SwitchToParentFrame,
    WaitPageLoad,
    Sleep,
    ScrollPageToBottom,
    Click,
    Input,
    Hover,
    GetInnerText,
    GetTextContent,
    GetInnerHtml,
    GetAttribute,
    WaitVisible,
    SelectOption,
    ScrollToElement,
    Screenshot,
    GetAllAttributes,
    GetAllTextContents,
    Unknown(String),
}

/// How an action finds its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Targeting {
    Scope,
    Document,
    Single(ElementState),
    Multi,
}

impl ActionKind {
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "switch_to_iframe" => ActionKind::SwitchToIframe,
            "switch_to_parent_frame" => ActionKind::SwitchToParentFrame,
            "wait_page_load" => ActionKind::WaitPageLoad,
            "sleep" => ActionKind::Sleep,
            "scroll_page_to_bottom" | "scroll_to_bottom" => ActionKind::ScrollPageToBottom,
            "click" => ActionKind::Click,
            "input" => ActionKind::Input,
            "hover" => ActionKind::Hover,
            "get_inner_text" => ActionKind::GetInnerText,
            "get_text_content" => ActionKind::GetTextContent,
            "get_inner_html" => ActionKind::GetInnerHtml,
            "get_attribute" => ActionKind::GetAttribute,
            "wait_visible" => ActionKind::WaitVisible,
            "select_option" => ActionKind::SelectOption,
            "scroll_to_element" => ActionKind::ScrollToElement,
            "screenshot" => ActionKind::Screenshot,
            "get_all_attributes" => ActionKind::GetAllAttributes,
            "get_all_text_contents" => ActionKind::GetAllTextContents,
            other => ActionKind::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ActionKind::SwitchToIframe => "switch_to_iframe",
            ActionKind::SwitchToParentFrame => "switch_to_parent_frame",
            ActionKind::WaitPageLoad => "wait_page_load",
            ActionKind::Sleep => "sleep",
            ActionKind::ScrollPageToBottom => "scroll_page_to_bottom",
            ActionKind::Click => "click",
            ActionKind::Input => "input",
            ActionKind::Hover => "hover",
            ActionKind::GetInnerText => "get_inner_text",
            ActionKind::GetTextContent => "get_text_content",
            ActionKind::GetInnerHtml => "get_inner_html",
            ActionKind::GetAttribute => "get_attribute",
            ActionKind::WaitVisible => "wait_visible",
            ActionKind::SelectOption => "select_option",
            ActionKind::ScrollToElement => "scroll_to_element",
            ActionKind::Screenshot => "screenshot",
            ActionKind::GetAllAttributes => "get_all_attributes",
            ActionKind::GetAllTextContents => "get_all_text_contents",
            ActionKind::Unknown(tag) => tag,
        }
    }

    /// `has_selector` only matters for `screenshot`, which targets an element
    /// when given one and the whole page otherwise.
    pub fn targeting(&self, has_selector: bool) -> Targeting {
        use ActionKind::*;
        match self {
            SwitchToIframe | SwitchToParentFrame => Targeting::Scope,
            WaitPageLoad | Sleep | ScrollPageToBottom | Unknown(_) => Targeting::Document,
            Screenshot if !has_selector => Targeting::Document,
            Click | Input | Hover | GetInnerText | WaitVisible | SelectOption | Screenshot => {
                Targeting::Single(ElementState::Visible)
            }
            GetTextContent | GetInnerHtml | GetAttribute | ScrollToElement => {
                Targeting::Single(ElementState::Attached)
            }
            GetAllAttributes | GetAllTextContents => Targeting::Multi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
    Warning,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
            StepStatus::Warning => "warning",
        }
    }
}

/// 1-based step number, or a label such as `Overall` for run-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepIndex {
    Number(usize),
    Label(String),
}

impl std::fmt::Display for StepIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepIndex::Number(n) => write!(f, "{n}"),
            StepIndex::Label(label) => f.write_str(label),
        }
    }
}

/// Outcome record for one executed (or skipped) step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: StepIndex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Action-specific payload (`text`, `url_lists`, `pdf_texts`, ...).
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl StepResult {
    pub fn new(step: usize, action: &str, status: StepStatus) -> Self {
        Self {
            step: StepIndex::Number(step),
            action: Some(action.to_string()),
            status,
            selector: None,
            message: None,
            details: Map::new(),
        }
    }

    pub fn success(step: usize, action: &str) -> Self {
        Self::new(step, action, StepStatus::Success)
    }

    pub fn overall_error(message: impl Into<String>) -> Self {
        Self {
            step: StepIndex::Label("Overall".to_string()),
            action: None,
            status: StepStatus::Error,
            selector: None,
            message: Some(message.into()),
            details: Map::new(),
        }
    }

    pub fn with_selector(mut self, selector: Option<&str>) -> Self {
        self.selector = selector.map(str::to_string);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.details.insert(key.to_string(), value.into());
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn is_error(&self) -> bool {
        self.status == StepStatus::Error
    }
}

/// `(overall_success, steps)` handed back to every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub steps: Vec<StepResult>,
}

impl RunResult {
    /// Success is derived: false iff any step carries `error`.
    pub fn from_steps(steps: Vec<StepResult>) -> Self {
        let success = !steps.iter().any(StepResult::is_error);
        Self { success, steps }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.steps).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Input document: target page plus the script to run against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInput {
    pub target_url: String,
    pub actions: Vec<ActionStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_mo: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
}

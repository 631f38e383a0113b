//! Human-readable rendering of a run's results.

use std::fmt::Write as _;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::info;

use crate::pdf::NO_TEXT;
use crate::types::{StepResult, StepStatus};

const HEADER: &str = "--- Web Runner Results ---";
const ITEM_INDENT: &str = "        ";

/// Writes the rendered report to `path`, creating parent directories.
pub fn write_results_to_file(results: &[StepResult], path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, render_results(results))?;
    info!(path = %path.display(), steps = results.len(), "results written");
    Ok(())
}

pub fn render_results(results: &[StepResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{HEADER}\n");
    for result in results {
        render_step(&mut out, result);
        out.push('\n');
    }
    out
}

fn render_step(out: &mut String, result: &StepResult) {
    let action = result.action.as_deref().unwrap_or("Unknown");
    let _ = writeln!(
        out,
        "--- Step {}: {} ({}) ---",
        result.step,
        action,
        result.status.as_str()
    );
    if let Some(selector) = result.selector.as_deref().filter(|s| !s.is_empty()) {
        let _ = writeln!(out, "Selector: {selector}");
    }

    match result.status {
        StepStatus::Error => render_error(out, result),
        StepStatus::Success => render_success(out, action, result.details.clone()),
        StepStatus::Skipped | StepStatus::Warning => {
            let message = result.message.as_deref().unwrap_or("No message provided.");
            let _ = writeln!(out, "Message: {message}");
        }
    }
}

fn render_error(out: &mut String, result: &StepResult) {
    let message = result.message.as_deref().unwrap_or("");
    let _ = writeln!(out, "Message: {message}");
    if let Some(full) = result.detail("full_error").and_then(Value::as_str) {
        if full != message {
            let _ = writeln!(out, "Details: {full}");
        }
    }
    if let Some(path) = result.detail("error_screenshot").and_then(Value::as_str) {
        let _ = writeln!(out, "Screenshot: {path}");
    }
}

fn render_success(out: &mut String, action: &str, mut details: Map<String, Value>) {
    match action {
        "get_all_attributes" => render_attribute_lists(out, &mut details),
        "get_all_text_contents" => {
            let texts: Vec<String> = take_list(&mut details, "text_list")
                .unwrap_or_default()
                .iter()
                .filter(|v| !v.is_null())
                .map(plain)
                .collect();
            let _ = writeln!(out, "Result Text List ({} items):", texts.len());
            if texts.is_empty() {
                let _ = writeln!(out, "(No text content found)");
            }
            for text in texts {
                let _ = writeln!(out, "- {text}");
            }
        }
        "get_text_content" | "get_inner_text" => {
            let text = details.remove("text").unwrap_or(Value::Null);
            let _ = writeln!(out, "Result Text:\n{}", plain(&text));
        }
        "get_inner_html" => {
            let html = details.remove("html").unwrap_or(Value::Null);
            let _ = writeln!(out, "Result HTML:\n{}", plain(&html));
        }
        "get_attribute" => {
            let name = details.remove("attribute").map(|v| plain(&v)).unwrap_or_default();
            let value = details.remove("value").unwrap_or(Value::Null);
            let _ = writeln!(out, "Result Attribute ('{name}'): {}", plain(&value));
            if let Some(text) = details.remove("pdf_text").and_then(string) {
                if text.starts_with("Error:") {
                    let _ = writeln!(out, "Extracted PDF Text (Error): {text}");
                } else if text == NO_TEXT {
                    let _ = writeln!(out, "Extracted PDF Text: (No text extracted)");
                } else if !text.is_empty() {
                    let _ = writeln!(out, "Extracted PDF Text:\n{text}");
                }
            }
        }
        "screenshot" => {
            if let Some(filename) = details.remove("filename") {
                let _ = writeln!(out, "Screenshot saved to: {}", plain(&filename));
            }
        }
        "click" => {
            let opened = details
                .remove("new_page_opened")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let url = details.remove("new_page_url");
            if opened {
                let url = url.map(|v| plain(&v)).unwrap_or_default();
                let _ = writeln!(out, "New page opened: {url}");
            } else {
                let _ = writeln!(out, "New page did not open within timeout.");
            }
        }
        _ => {}
    }

    if !details.is_empty() {
        let _ = writeln!(out, "Other Details:");
        for (key, value) in &details {
            let _ = writeln!(out, "  {key}: {}", plain(value));
        }
    }
}

fn render_attribute_lists(out: &mut String, details: &mut Map<String, Value>) {
    let name = details
        .remove("attribute")
        .map(|v| plain(&v))
        .unwrap_or_else(|| "N/A".to_string());
    let urls = take_list(details, "url_lists");
    let pdfs = take_list(details, "pdf_texts");
    let scraped = take_list(details, "scraped_texts");
    let attributes = take_list(details, "attribute_list");

    let _ = writeln!(out, "Requested Attribute/Content: {name}");

    let lists = [&urls, &pdfs, &scraped, &attributes];
    let count = lists.iter().filter_map(|l| l.as_ref().map(Vec::len)).max().unwrap_or(0);
    if count == 0 {
        let _ = writeln!(out, "Results: (No items found matching the selector)");
        return;
    }

    let _ = writeln!(out, "Results ({count} items found):");
    for idx in 0..count {
        let _ = writeln!(out, "  [{}]", idx + 1);
        if let Some(url) = item(&urls, idx) {
            let _ = writeln!(out, "    URL: {}", plain(url));
        }
        if let Some(pdf) = item(&pdfs, idx) {
            let text = plain(pdf);
            if text.starts_with("Error:") {
                let _ = writeln!(out, "      -> PDF Content (Error): {text}");
            } else if text == NO_TEXT {
                let _ = writeln!(out, "      -> PDF Content: (No text extracted)");
            } else {
                content_block(out, "PDF Content", &text);
            }
        }
        if let Some(page) = item(&scraped, idx) {
            let text = plain(page);
            if text.starts_with("Error") {
                let _ = writeln!(out, "      -> Page Content (Error): {text}");
            } else {
                content_block(out, "Page Content", &text);
            }
        }
        if let Some(value) = item(&attributes, idx) {
            let _ = writeln!(out, "      -> Attribute '{name}' Value: {}", plain(value));
        }
    }
}

fn content_block(out: &mut String, label: &str, text: &str) {
    let _ = writeln!(out, "      -> {label} (Length: {}):", text.chars().count());
    let indented: Vec<String> = text.lines().map(|line| format!("{ITEM_INDENT}{line}")).collect();
    let _ = writeln!(out, "{}", indented.join("\n"));
}

fn take_list(details: &mut Map<String, Value>, key: &str) -> Option<Vec<Value>> {
    match details.remove(key)? {
        Value::Array(items) => Some(items),
        Value::Null => None,
        other => Some(vec![other]),
    }
}

/// Positional entry; a `null` slot counts as absent.
fn item(list: &Option<Vec<Value>>, idx: usize) -> Option<&Value> {
    list.as_ref()?.get(idx).filter(|v| !v.is_null())
}

fn string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Strings print bare, `null` prints as `None`, everything else as JSON.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_error_with_details_and_screenshot() {
        let result = StepResult::new(2, "click", StepStatus::Error)
            .with_selector(Some("#go"))
            .with_message("element '#go' was not found")
            .with("full_error", "NotFound - element '#go' was not found")
            .with("error_screenshot", "screenshots/error_step2.png");

        let report = render_results(&[result]);
        assert!(report.starts_with("--- Web Runner Results ---\n\n"));
        assert!(report.contains("--- Step 2: click (error) ---\nSelector: #go\n"));
        assert!(report.contains("Message: element '#go' was not found\n"));
        assert!(report.contains("Details: NotFound - element '#go' was not found\n"));
        assert!(report.contains("Screenshot: screenshots/error_step2.png\n"));
    }

    #[test]
    fn details_line_is_omitted_when_identical_to_message() {
        let result = StepResult::overall_error("boom").with("full_error", "boom");
        let report = render_results(&[result]);
        assert!(report.contains("--- Step Overall: Unknown (error) ---"));
        assert!(!report.contains("Details:"));
    }

    #[test]
    fn renders_attribute_lists_per_item() {
        let result = StepResult::success(1, "get_all_attributes")
            .with_selector(Some("a.doc"))
            .with("attribute", "pdf")
            .with("url_lists", json!(["https://x/a.pdf", "https://x/b.pdf", "https://x/c.pdf"]))
            .with(
                "pdf_texts",
                json!(["line one\nline two", "Error: PDF download failed or returned no data.", NO_TEXT]),
            );

        let report = render_results(&[result]);
        assert!(report.contains("Requested Attribute/Content: pdf\n"));
        assert!(report.contains("Results (3 items found):\n"));
        assert!(report.contains("  [1]\n    URL: https://x/a.pdf\n"));
        assert!(report.contains(
            "      -> PDF Content (Length: 17):\n        line one\n        line two\n"
        ));
        assert!(report.contains("      -> PDF Content (Error): Error: PDF download failed"));
        assert!(report.contains("      -> PDF Content: (No text extracted)\n"));
        assert!(!report.contains("Other Details:"));
    }

    #[test]
    fn empty_attribute_lists_say_so() {
        let result = StepResult::success(1, "get_all_attributes")
            .with("attribute", "href")
            .with("url_lists", json!([]));
        let report = render_results(&[result]);
        assert!(report.contains("Results: (No items found matching the selector)"));
    }

    #[test]
    fn renders_generic_attributes_and_scraped_content() {
        let result = StepResult::success(1, "get_all_attributes")
            .with("attribute", "content")
            .with("url_lists", json!(["https://x/n1"]))
            .with("scraped_texts", json!(["Breaking news"]));
        let report = render_results(&[result]);
        assert!(report.contains("      -> Page Content (Length: 13):\n        Breaking news\n"));

        let result = StepResult::success(2, "get_all_attributes")
            .with("attribute", "data-id")
            .with("attribute_list", json!(["7", null]));
        let report = render_results(&[result]);
        assert!(report.contains("Results (2 items found):"));
        assert!(report.contains("      -> Attribute 'data-id' Value: 7\n"));
        assert_eq!(report.matches("-> Attribute").count(), 1);
    }

    #[test]
    fn renders_text_actions_and_leftovers() {
        let results = vec![
            StepResult::success(1, "get_all_text_contents").with("text_list", json!(["one", "two"])),
            StepResult::success(2, "get_all_text_contents").with("text_list", json!([])),
            StepResult::success(3, "get_inner_text").with("text", "Hello"),
            StepResult::success(4, "get_attribute")
                .with("attribute", "href")
                .with("value", "/r.pdf")
                .with("pdf_text", "report body"),
            StepResult::success(5, "click").with("new_page_opened", false),
            StepResult::success(6, "scroll_page_to_bottom").with("extra", 3),
        ];
        let report = render_results(&results);
        assert!(report.contains("Result Text List (2 items):\n- one\n- two\n"));
        assert!(report.contains("Result Text List (0 items):\n(No text content found)\n"));
        assert!(report.contains("Result Text:\nHello\n"));
        assert!(report.contains("Result Attribute ('href'): /r.pdf\nExtracted PDF Text:\nreport body\n"));
        assert!(report.contains("New page did not open within timeout.\n"));
        assert!(report.contains("Other Details:\n  extra: 3\n"));
    }

    #[test]
    fn skipped_steps_fall_back_to_default_message() {
        let result = StepResult::new(1, "sleep", StepStatus::Skipped);
        let report = render_results(&[result]);
        assert!(report.contains("Message: No message provided."));
    }

    #[test]
    fn writes_report_creating_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/nested/report.txt");
        write_results_to_file(&[StepResult::success(1, "sleep")], &path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("--- Step 1: sleep (success) ---"));
    }
}

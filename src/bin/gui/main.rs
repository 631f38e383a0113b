use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};

use anyhow::{Context, Result};
use eframe::egui;
use tracing::{error, info};

use web_runner::config::{load_input, parse_input};
use web_runner::driver::chrome::ChromeLauncher;
use web_runner::logging::{CLI_LOG_FILE, init_logging};
use web_runner::pdf::HttpFetcher;
use web_runner::report::{render_results, write_results_to_file};
use web_runner::{RunInput, RunOptions, RunResult, Runner, RunnerConfig};

const REPORT_FILE: &str = "output_web_runner_gui.txt";
const ACCENT: egui::Color32 = egui::Color32::from_rgb(100, 149, 237);

enum Outcome {
    Finished(RunResult),
    Failed(String),
}

struct RunnerApp {
    config: RunnerConfig,
    files: Vec<PathBuf>,
    selected: Option<usize>,
    pasted: String,
    headless: bool,
    slow_mo: u64,
    worker: Option<Receiver<Outcome>>,
    report: String,
    status: String,
    /// Result JSON of a failed run, shown in a dialog until dismissed.
    failure: Option<String>,
}

impl RunnerApp {
    fn new(cc: &eframe::CreationContext<'_>, config: RunnerConfig) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());
        let files = list_inputs(&config.input_dir);
        Self {
            selected: (!files.is_empty()).then_some(0),
            files,
            config,
            pasted: String::new(),
            headless: false,
            slow_mo: 100,
            worker: None,
            report: String::new(),
            status: "Ready".to_string(),
            failure: None,
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Pasted JSON wins over the selected file.
    fn load_selected(&self) -> Result<RunInput> {
        if !self.pasted.trim().is_empty() {
            return parse_input(&self.pasted).context("pasted JSON is not a valid run document");
        }
        let path = self
            .selected
            .and_then(|i| self.files.get(i))
            .context("no input file selected")?;
        load_input(path)
    }

    fn start(&mut self, ctx: &egui::Context) {
        let input = match self.load_selected() {
            Ok(input) => input,
            Err(err) => {
                self.status = format!("Could not load input: {err:#}");
                return;
            }
        };

        let (tx, rx) = mpsc::channel();
        let config = self.config.clone();
        let (headless, slow_mo) = (self.headless, self.slow_mo);
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            let outcome = match run_blocking(config, input, headless, slow_mo) {
                Ok(result) => Outcome::Finished(result),
                Err(err) => Outcome::Failed(format!("{err:#}")),
            };
            let _ = tx.send(outcome);
            ctx.request_repaint();
        });

        self.worker = Some(rx);
        self.report.clear();
        self.status = "Running...".to_string();
    }

    fn poll_worker(&mut self) {
        let Some(rx) = &self.worker else { return };
        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => Outcome::Failed("worker thread exited unexpectedly".into()),
        };
        self.worker = None;

        match outcome {
            Outcome::Finished(result) => {
                self.report = render_results(&result.steps);
                if let Err(err) = write_results_to_file(&result.steps, Path::new(REPORT_FILE)) {
                    error!(error = %format!("{err:#}"), "failed to write report");
                }
                if result.success {
                    self.status = "Run succeeded".to_string();
                } else {
                    self.status = "Run failed".to_string();
                    self.failure = Some(result.to_json());
                }
            }
            Outcome::Failed(message) => {
                error!(%message, "run could not start");
                self.status = format!("Run could not start: {message}");
            }
        }
    }

    fn render_controls(&mut self, ui: &mut egui::Ui) {
        egui::Frame::new()
            .fill(egui::Color32::from_rgb(30, 30, 30))
            .corner_radius(8.0)
            .inner_margin(12.0)
            .show(ui, |ui| {
                ui.horizontal(|ui| {
                    let current = self
                        .selected
                        .and_then(|i| self.files.get(i))
                        .and_then(|p| p.file_name())
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "(none)".to_string());
                    egui::ComboBox::from_label("Input file")
                        .selected_text(current)
                        .show_ui(ui, |ui| {
                            for (i, path) in self.files.iter().enumerate() {
                                let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                                ui.selectable_value(&mut self.selected, Some(i), name.unwrap_or_default());
                            }
                        });
                    if ui.button("Refresh").clicked() {
                        self.files = list_inputs(&self.config.input_dir);
                        self.selected = (!self.files.is_empty()).then_some(0);
                    }
                });

                ui.add_space(8.0);
                ui.label("Or paste a run document (takes precedence when not empty):");
                ui.add(
                    egui::TextEdit::multiline(&mut self.pasted)
                        .code_editor()
                        .desired_rows(6)
                        .desired_width(f32::INFINITY),
                );

                ui.add_space(8.0);
                ui.horizontal(|ui| {
                    ui.checkbox(&mut self.headless, "Headless");
                    ui.add(egui::Slider::new(&mut self.slow_mo, 0..=2000).text("slow-mo (ms)"));
                });
            });
    }

    fn render_failure(&mut self, ctx: &egui::Context) {
        let Some(json) = &self.failure else { return };
        let mut dismissed = false;
        egui::Window::new("Run failed")
            .collapsible(false)
            .default_size([600.0, 400.0])
            .show(ctx, |ui| {
                ui.label("One or more steps failed. Results:");
                egui::ScrollArea::vertical().max_height(320.0).show(ui, |ui| {
                    ui.add(
                        egui::TextEdit::multiline(&mut json.as_str())
                            .code_editor()
                            .desired_width(f32::INFINITY),
                    );
                });
                if ui.button("Close").clicked() {
                    dismissed = true;
                }
            });
        if dismissed {
            self.failure = None;
        }
    }
}

impl eframe::App for RunnerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_worker();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                ui.add_space(12.0);
                ui.heading(egui::RichText::new("Web Runner").size(28.0).strong().color(ACCENT));
                ui.add_space(8.0);
            });

            self.render_controls(ui);
            ui.add_space(10.0);

            ui.horizontal(|ui| {
                let run = ui.add_enabled(
                    !self.is_running(),
                    egui::Button::new(egui::RichText::new("Run").size(16.0).strong())
                        .fill(ACCENT)
                        .min_size(egui::vec2(80.0, 30.0)),
                );
                if run.clicked() {
                    self.start(ctx);
                }
                if self.is_running() {
                    ui.spinner();
                }
                ui.label(&self.status);
            });

            ui.separator();
            egui::ScrollArea::vertical()
                .auto_shrink([false; 2])
                .show(ui, |ui| {
                    ui.add(
                        egui::TextEdit::multiline(&mut self.report.as_str())
                            .code_editor()
                            .desired_width(f32::INFINITY),
                    );
                });
        });

        self.render_failure(ctx);
    }
}

/// Runs one document on a private tokio runtime.
fn run_blocking(config: RunnerConfig, input: RunInput, headless: bool, slow_mo: u64) -> Result<RunResult> {
    let fetcher = HttpFetcher::new(&config.user_agent, &config.accept_language)
        .context("failed to build HTTP client")?;
    let options = RunOptions::resolve(&input, headless, slow_mo, &config);
    let runner = Runner::new(Arc::new(ChromeLauncher), Arc::new(fetcher), config);
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    info!(target_url = %input.target_url, "gui run started");
    Ok(runtime.block_on(runner.run(&input, &options)))
}

/// `*.json` files directly under `dir`, sorted by name.
fn list_inputs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

fn main() -> eframe::Result<()> {
    let _guard = match init_logging(CLI_LOG_FILE) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("logging disabled: {err:#}");
            None
        }
    };
    let config = RunnerConfig::from_env();

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 800.0])
            .with_min_inner_size([500.0, 400.0]),
        ..Default::default()
    };

    eframe::run_native(
        "Web Runner",
        native_options,
        Box::new(|cc| Ok(Box::new(RunnerApp::new(cc, config)))),
    )
}

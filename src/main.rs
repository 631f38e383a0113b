use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use web_runner::config::{DEFAULT_INPUT_FILE, load_input, resolve_input_path};
use web_runner::driver::chrome::ChromeLauncher;
use web_runner::logging::{CLI_LOG_FILE, init_logging};
use web_runner::pdf::HttpFetcher;
use web_runner::report::write_results_to_file;
use web_runner::{RunOptions, Runner, RunnerConfig};

const REPORT_FILE: &str = "output_web_runner.txt";

#[derive(Parser)]
#[command(name = "web-runner", about = "Run a JSON-scripted browser automation")]
struct Cli {
    /// Input document, or a bare file name looked up in the input directory
    #[arg(long, default_value = DEFAULT_INPUT_FILE)]
    input: PathBuf,

    /// Run the browser without a window
    #[arg(long)]
    headless: bool,

    /// Delay inserted before each browser operation, in milliseconds
    #[arg(long = "slowmo", default_value_t = 100)]
    slow_mo: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match init_logging(CLI_LOG_FILE) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialise logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %format!("{err:#}"), "web runner aborted");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let config = RunnerConfig::from_env();
    let path = resolve_input_path(&cli.input, &config.input_dir)?;
    info!(path = %path.display(), "loading input document");
    let input = load_input(&path)?;

    let fetcher = HttpFetcher::new(&config.user_agent, &config.accept_language)
        .context("failed to build HTTP client")?;
    let options = RunOptions::resolve(&input, cli.headless, cli.slow_mo, &config);
    let runner = Runner::new(Arc::new(ChromeLauncher), Arc::new(fetcher), config);

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(runner.run(&input, &options));

    println!("{}", result.to_json());
    if let Err(err) = write_results_to_file(&result.steps, Path::new(REPORT_FILE)) {
        error!(error = %format!("{err:#}"), file = REPORT_FILE, "failed to write report");
    }

    if result.success {
        info!("run succeeded");
    } else {
        error!("run failed; see {REPORT_FILE} for details");
    }
    Ok(result.success)
}

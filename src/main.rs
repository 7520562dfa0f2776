use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::future::pending;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use gogreen::discovery::GoDiscovery;
use gogreen::state::ALL_PACKAGES;
use gogreen::watcher::FsWatcher;
use gogreen::{Config, Event, GoTestExecutor, Orchestrator, OrchestratorHandle, RunResult, State, Stream, TestParams};

const EXIT_PASSED: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "gogreen")]
#[command(about = "Run go tests once or on every change, one run at a time")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: gogreen.toml in the working directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Working directory of the Go module
    #[arg(long, global = true, env = "WD")]
    cwd: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tests once
    Run(TestArgs),

    /// Watch sources and re-run the tests on changes
    Watch(TestArgs),

    /// List packages and their test functions
    List {
        /// Package pattern (default: ./...)
        pkg: Option<String>,
    },
}

#[derive(Args)]
struct TestArgs {
    /// Package path or pattern (default from config: ./...)
    #[arg(env = "PKG")]
    pkg: Option<String>,

    /// Verbose test output
    #[arg(short, long, overrides_with = "no_verbose")]
    verbose: bool,

    /// Quiet test output, overriding a verbose default
    #[arg(long, overrides_with = "verbose")]
    no_verbose: bool,

    /// Enable the race detector
    #[arg(long)]
    race: bool,

    /// Only run tests matching this regular expression
    #[arg(long)]
    run: Option<String>,
}

impl TestArgs {
    fn params(&self, config: &Config) -> Result<TestParams> {
        let mut params = config.defaults.test_params();
        if let Some(ref pkg) = self.pkg {
            params.pkg = pkg.clone();
        }
        if self.verbose {
            params.verbose = true;
        } else if self.no_verbose {
            params.verbose = false;
        }
        params.race |= self.race;
        if self.run.is_some() {
            params.run = self.run.clone();
        }

        let params = params.normalized();
        params.validate().context("Invalid --run pattern")?;
        Ok(params)
    }
}

fn main() {
    init_tracing();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(EXIT_FAILED);
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let cwd = match cli.cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("Could not determine current directory")?,
    };
    let cwd = std::fs::canonicalize(&cwd)
        .with_context(|| format!("Working directory not found: {}", cwd.display()))?;

    let config = Config::discover(cli.config.as_deref(), &cwd)?;

    match cli.command {
        Commands::Run(args) => {
            let params = args.params(&config)?;
            cmd_run(config, cwd, params)
        }
        Commands::Watch(args) => {
            let params = args.params(&config)?;
            cmd_watch(config, cwd, params)
        }
        Commands::List { pkg } => {
            cmd_list(&config, &cwd, pkg)?;
            Ok(EXIT_PASSED)
        }
    }
}

fn start_orchestrator(config: Config, cwd: PathBuf, params: TestParams) -> OrchestratorHandle {
    let executor = Arc::new(GoTestExecutor::new(config.run.clone()));
    let discovery = Arc::new(GoDiscovery::new(config.run.go.clone()));
    let watcher = Arc::new(FsWatcher::new(config.watch.clone()));

    Orchestrator::new(config, State::new(cwd, params), executor, discovery, watcher).spawn()
}

#[tokio::main]
async fn cmd_run(config: Config, cwd: PathBuf, params: TestParams) -> Result<i32> {
    let handle = start_orchestrator(config, cwd, params);
    let mut events = handle.subscribe();
    handle.start_run().await?;

    let mut interrupted = false;
    let code = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(Event::RunFinished(result)) => {
                    print_result(&result);
                    break exit_code(&result);
                }
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => print_lagged(n),
                Err(RecvError::Closed) => break EXIT_FAILED,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("\n{} {}", "■".yellow(), "Stopping...".dimmed());
                handle.stop().await?;
            }
            _ = handle.closed() => break EXIT_FAILED,
        }
    };

    handle.shutdown().await?;
    Ok(code)
}

#[tokio::main]
async fn cmd_watch(config: Config, cwd: PathBuf, params: TestParams) -> Result<i32> {
    let handle = start_orchestrator(config, cwd.clone(), params);
    let mut events = handle.subscribe();
    handle.toggle_watch(true).await?;

    println!("{}", "━".repeat(50).dimmed());
    println!("  {} {}", "Watching".bold().cyan(), cwd.display());
    println!(
        "  {}",
        "enter/r: run   s: stop   q: quit".dimmed()
    );
    println!("{}", "━".repeat(50).dimmed());

    let mut input = Some(BufReader::new(tokio::io::stdin()).lines());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => print_lagged(n),
                Err(RecvError::Closed) => break,
            },
            line = next_line(&mut input) => match line.as_deref().map(str::trim) {
                Some("") | Some("r") => handle.start_run().await?,
                Some("s") => handle.stop().await?,
                Some("q") => break,
                Some(other) => println!(
                    "{} Unknown command '{}' (r: run, s: stop, q: quit)",
                    "?".yellow(),
                    other
                ),
                // stdin closed; keep watching until Ctrl-C
                None => input = None,
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = handle.closed() => break,
        }
    }

    handle.shutdown().await?;
    Ok(EXIT_PASSED)
}

async fn next_line(input: &mut Option<Lines<BufReader<Stdin>>>) -> Option<String> {
    match input {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => pending().await,
    }
}

fn cmd_list(config: &Config, cwd: &Path, pkg: Option<String>) -> Result<()> {
    let pattern = pkg.unwrap_or_else(|| ALL_PACKAGES.to_string());
    let packages = GoDiscovery::new(config.run.go.clone())
        .list_test_funcs(cwd, &pattern)
        .with_context(|| format!("Could not list packages in {}", cwd.display()))?;

    println!("\n{} {}\n", "📦".cyan(), cwd.display().to_string().bold());

    if packages.is_empty() {
        println!("  {}", "No packages found".dimmed());
        return Ok(());
    }

    for package in &packages {
        println!("  {} {}", "•".green(), package.pkg.cyan());
        if package.test_funcs.is_empty() {
            println!("    {}", "no tests".dimmed());
        }
        for name in &package.test_funcs {
            println!("    {}", name);
        }
    }
    println!();

    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::RunStarted { params, .. } => {
            println!("\n{} {}", "▶".cyan(), describe(params).bold());
        }
        Event::OutputLine(line) => match line.stream {
            Stream::Stdout => println!("{}", line.text),
            Stream::Stderr => eprintln!("{}", line.text.red()),
        },
        Event::RunFinished(result) => print_result(result),
        Event::WatchError { message } => {
            eprintln!("{} {}", "Watch error:".yellow().bold(), message);
        }
        Event::DiscoveryError { message } => {
            eprintln!("{} {}", "Discovery error:".yellow().bold(), message);
        }
        Event::Rejected { reason } => eprintln!("{} {}", "!".yellow(), reason),
        Event::StateChanged(_) | Event::PackagesListed(_) => {}
    }
}

fn print_result(result: &RunResult) {
    let elapsed = format!("({:.2}s)", result.duration_ms as f64 / 1000.0);

    if let Some(ref error) = result.error {
        println!("{} {}", "✗ ERROR".red().bold(), error);
    } else if result.cancelled {
        println!("{} {}", "■ CANCELLED".yellow().bold(), elapsed.dimmed());
    } else if result.passed {
        println!("{} {}", "✓ PASS".green().bold(), elapsed.dimmed());
    } else {
        let code = result
            .exit_code
            .map(|c| format!("exit {}", c))
            .unwrap_or_else(|| "killed".to_string());
        println!("{} {} {}", "✗ FAIL".red().bold(), code, elapsed.dimmed());
    }
}

fn print_lagged(skipped: u64) {
    eprintln!("{}", format!("... {} events skipped", skipped).dimmed());
}

fn describe(params: &TestParams) -> String {
    let mut line = format!("go test {}", params.pkg);
    if params.race {
        line.push_str(" -race");
    }
    if let Some(ref run) = params.run {
        line.push_str(&format!(" -run {}", run));
    }
    line
}

fn exit_code(result: &RunResult) -> i32 {
    if result.cancelled {
        EXIT_CANCELLED
    } else if result.passed {
        EXIT_PASSED
    } else {
        EXIT_FAILED
    }
}

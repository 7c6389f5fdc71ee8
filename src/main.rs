//! FlowTrack CLI Entry Point
//!
//! Watches a session or run directory and prints its reconciled progress.
//!
//! # Usage
//!
//! ```bash
//! # Watch a multi-party session as alice
//! flowtrack sessions/gwas-join --me alice@lab.org
//!
//! # Watch a single-operator run
//! flowtrack runs/run-42 --run
//!
//! # Print the current state once and exit
//! flowtrack sessions/gwas-join --once
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::Utc;
use colored::{ColoredString, Colorize};
use log::{info, warn};
use tokio::sync::watch;

use flowtrack::host::{DirHost, PollOutcome, Poller};
use flowtrack::monitoring::labels::blockers_label;
use flowtrack::reconcile::{CanonicalStatus, ReconciliationEngine, RunView, SessionView};
use flowtrack::{EngineConfig, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    dir: Option<PathBuf>,
    run_mode: bool,
    me: Option<String>,
    interval_ms: Option<u64>,
    once: bool,
    config_path: Option<PathBuf>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Run Progress Reconciliation");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowtrack [OPTIONS] <DIR>");
    println!();
    println!("Arguments:");
    println!("  <DIR>               Session or run directory to watch");
    println!();
    println!("Options:");
    println!("  --run               Treat DIR as a single-operator run");
    println!("  --me EMAIL          Local participant identity");
    println!("  --interval MS       Polling interval in milliseconds");
    println!("  --once              Poll once, print, and exit");
    println!("  --config PATH       Configuration file");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  flowtrack sessions/gwas-join --me alice@lab.org");
    println!("  flowtrack runs/run-42 --run --interval 1000");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1;

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--run" => config.run_mode = true,
            "--once" => config.once = true,
            "--verbose" | "-v" => config.verbose = true,
            "--me" => {
                i += 1;
                let email = args
                    .get(i)
                    .ok_or_else(|| "--me requires an email argument".to_string())?;
                config.me = Some(email.clone());
            }
            "--interval" => {
                i += 1;
                let raw = args
                    .get(i)
                    .ok_or_else(|| "--interval requires a number argument".to_string())?;
                config.interval_ms = Some(
                    raw.parse()
                        .map_err(|_| format!("Invalid interval value: {}", raw))?,
                );
            }
            "--config" => {
                i += 1;
                let path = args
                    .get(i)
                    .ok_or_else(|| "--config requires a path argument".to_string())?;
                config.config_path = Some(PathBuf::from(path));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.dir.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.dir = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Splits a session/run directory into the host root and the id.
fn split_dir(dir: &Path) -> Result<(PathBuf, String), Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("Not a directory: {}", dir.display()).into());
    }
    let id = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| format!("Cannot derive an id from {}", dir.display()))?;
    let root = dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((root, id))
}

fn paint_status(status: &CanonicalStatus) -> ColoredString {
    let text = format!("{:<16}", status.as_str());
    match status {
        CanonicalStatus::Failed => text.red().bold(),
        CanonicalStatus::Shared | CanonicalStatus::Completed => text.green(),
        CanonicalStatus::Running | CanonicalStatus::Sharing => text.yellow(),
        CanonicalStatus::Ready => text.cyan(),
        _ => text.dimmed(),
    }
}

fn print_session_view(view: &SessionView) {
    let title = if view.flow_name.is_empty() {
        view.session_id.clone()
    } else {
        format!("{} ({})", view.flow_name, view.session_id)
    };
    println!("{}", title.bold());

    for step in &view.steps {
        let marker = if step.actionable {
            "▶".cyan()
        } else if step.complete {
            "✓".green()
        } else {
            " ".normal()
        };
        let kind = if step.is_barrier { " [barrier]" } else { "" };
        println!(
            "  {} {} {:<24} {:>8}{}",
            marker,
            paint_status(&step.status),
            step.name,
            step.elapsed.as_deref().unwrap_or("—"),
            kind.dimmed()
        );
        if let Some(label) = blockers_label(&step.blockers).filter(|_| !step.complete) {
            println!("      {}", label.dimmed());
        }
        if let Some(excerpt) = &step.log_excerpt {
            for line in excerpt.lines() {
                println!("      | {}", line.dimmed());
            }
        }
    }

    println!();
    println!(
        "  Progress: {}/{} ({})   Elapsed: {}",
        view.progress.completed,
        view.progress.total,
        view.percent,
        view.elapsed.as_deref().unwrap_or("—")
    );
    if let Some(next) = &view.next_action {
        println!("  Run next: {}", next.cyan().bold());
    }
    if let Some(label) = &view.blockers_label {
        println!("  {}", label.yellow());
    }
    if view.all_my_work_done {
        println!("  {}", "All of your steps are done".green());
    }

    for transport in &view.transport {
        println!("  Transport for {}:", transport.step_id);
        for channel in &transport.channels {
            println!("    {}", channel);
        }
        for peer in &transport.peers {
            println!(
                "    {:<24} tx {:>10}  rx {:>10}  latency {:>6}  {}",
                peer.peer_email, peer.tx_label, peer.rx_label, peer.latency, peer.freshness
            );
        }
    }
    println!();
}

fn print_run_view(view: &RunView) {
    let status = view
        .status
        .as_ref()
        .map(paint_status)
        .unwrap_or_else(|| "unknown".dimmed());
    println!("{} {} ({})", view.run_id.bold(), status, view.freshness);

    let counts = view
        .progress
        .map(|p| format!("{}/{}", p.completed, p.total))
        .unwrap_or_else(|| "—".to_string());
    println!(
        "  Progress: {} ({})   ETA: {}   Elapsed: {}",
        counts,
        view.percent,
        view.eta,
        view.elapsed.as_deref().unwrap_or("—")
    );
    if let Some(concurrency) = view.concurrency {
        println!("  Concurrency: {}", concurrency);
    }
    if let Some(command) = &view.last_command {
        println!("  Command: {}", command.dimmed());
    }
    for line in view.relevant_lines.iter().rev().take(5).rev() {
        println!("    {}", line.dimmed());
    }
    println!();
}

/// Polls once or until interrupted.
async fn follow(poller: &Poller<DirHost>, id: &str, config: &Config) -> Result<(), String> {
    if config.once {
        let outcome = if config.run_mode {
            poller.poll_run_once(id).await
        } else {
            poller.poll_session_once(id).await
        };
        if outcome == PollOutcome::Failed {
            return Err(format!("Could not read '{}'", id));
        }

        let now = Utc::now();
        if config.run_mode {
            if let Some(view) = poller.engine().run_view(id, now) {
                print_run_view(&view);
            }
        } else if let Some(view) = poller.engine().session_view(id, now) {
            print_session_view(&view);
        }
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::task::spawn_local(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            let _ = stop_tx.send(true);
        }
    });

    if config.run_mode {
        poller.watch_run(id, stop_rx, print_run_view).await;
    } else {
        poller.watch_session(id, stop_rx, print_session_view).await;
    }
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let dir = config.dir.clone().ok_or_else(|| {
        print_usage();
        "Missing <DIR> argument".to_string()
    })?;
    let (root, id) = split_dir(&dir)?;

    let mut engine_config = EngineConfig::load(config.config_path.as_deref())?;
    if let Some(me) = &config.me {
        engine_config.local_email = Some(me.clone());
    }
    if let Some(ms) = config.interval_ms {
        engine_config.poll_interval_ms = ms;
    }
    if !config.run_mode && engine_config.local_email.is_none() {
        warn!("No local identity set (--me); showing the session as an observer");
    }

    info!(
        "Watching {} '{}' every {} ms",
        if config.run_mode { "run" } else { "session" },
        id,
        engine_config.poll_interval_ms
    );

    let poller = Poller::new(DirHost::new(root), ReconciliationEngine::new(engine_config));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, follow(&poller, &id, &config))?;

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

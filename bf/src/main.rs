//! bf - BettaFish supervisor CLI entry point

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use bettafish::cli::{Cli, Command, ConfigCommand};
use bettafish::config::{self, Settings, find_env_file};
use bettafish::events::EventKind;
use bettafish::forum::{ForumConfig, HostSpeaker, start_forum};
use bettafish::http::AppState;
use bettafish::llm::create_client;
use bettafish::report::pipeline::{
    EngineReportInput, PipelineConfig, ReportPipeline, ReportRequest, StreamHandler,
};
use reportstore::{BaselineStore, ChapterStore, Engine};

fn setup_logging(settings: &Settings, cli_level: Option<&str>) -> Result<()> {
    fs::create_dir_all(&settings.log_dir).context("Failed to create log directory")?;

    let level = match cli_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: unknown log-level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(settings.report_log_path()).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    info!("logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_path = find_env_file().unwrap_or_else(|| PathBuf::from(".env"));
    let mut settings = Settings::load();
    setup_logging(&settings, cli.log_level.as_deref())?;
    debug!(command = ?cli.command, "dispatching command");

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            let state = AppState::build(settings, env_path)?;
            bettafish::http::serve(state).await
        }

        Command::Report {
            query,
            template,
            force,
        } => cmd_report(&settings, query, template, force).await,

        Command::Forum => cmd_forum(&settings).await,

        Command::Status => cmd_status(&settings).await,

        Command::Config { command } => match command {
            ConfigCommand::Show => {
                for (key, value) in settings.snapshot() {
                    println!("{key}={value}");
                }
                Ok(())
            }
            ConfigCommand::Set { pairs } => {
                let updates = pairs.into_iter().collect();
                config::persist_updates(&env_path, &updates)
                    .context("Failed to update configuration")?;
                println!("{} {}", "updated".green(), env_path.display());
                Ok(())
            }
        },
    }
}

/// One-shot report generation without the HTTP server.
async fn cmd_report(
    settings: &Settings,
    query: Option<String>,
    template: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    let baseline = BaselineStore::open(&settings.baseline_file);
    let dirs = settings.report_dirs();

    if !force {
        let readiness = baseline.check_new_files(&dirs);
        if !readiness.ready {
            eprintln!(
                "{} engines missing new artifacts: {:?} (use --force to override)",
                "not ready:".red(),
                readiness.missing
            );
            std::process::exit(1);
        }
    }

    let latest = baseline.latest_files(&dirs);
    let reports: Vec<EngineReportInput> = [Engine::Query, Engine::Media, Engine::Insight]
        .into_iter()
        .map(|engine| {
            let text = latest
                .get(&engine)
                .and_then(|p| fs::read_to_string(p).ok())
                .unwrap_or_default();
            EngineReportInput::Text(text)
        })
        .collect();
    let forum_logs = fs::read_to_string(settings.forum_log_path()).unwrap_or_default();
    let custom_template = match template {
        Some(path) => fs::read_to_string(&path)
            .context(format!("Failed to read template {}", path.display()))?,
        None => String::new(),
    };

    let llm = create_client("report", &settings.report, settings.llm_timeout)
        .map_err(|e| eyre::eyre!(e.to_string()))?;
    let storage = Arc::new(ChapterStore::new(settings.chapters_dir())?);
    let mut pipeline =
        ReportPipeline::new(llm.clone(), storage, PipelineConfig::from_settings(settings));
    if settings.enable_llm_repair {
        pipeline = pipeline.with_llm_repair(llm);
    }

    let printer: StreamHandler = Arc::new(|kind, payload| match kind {
        EventKind::Progress => {
            let progress = payload["progress"].as_u64().unwrap_or(0);
            let message = payload["message"].as_str().unwrap_or("");
            eprintln!("{progress:>3}% {message}");
        }
        EventKind::ChapterStatus => {
            let title = payload["title"].as_str().unwrap_or("");
            let status = payload["status"].as_str().unwrap_or("");
            eprintln!("     {status}: {title}");
        }
        _ => {}
    });

    let mut request = ReportRequest::new(query.unwrap_or_else(|| "最新舆情综合分析".to_string()));
    request.reports = reports;
    request.forum_logs = forum_logs;
    request.custom_template = custom_template;

    let result = pipeline
        .generate_report(request, Some(printer))
        .await
        .map_err(|e| eyre::eyre!(e.to_string()))?;

    baseline.initialize(&dirs)?;
    println!("{} {}", "report:".green(), result.report_id);
    if let Some(path) = result.html_path {
        println!("  html: {}", path.display());
    }
    if let Some(path) = result.ir_path {
        println!("  ir:   {}", path.display());
    }
    Ok(())
}

/// Foreground forum aggregator, for running next to externally managed
/// engines.
async fn cmd_forum(settings: &Settings) -> Result<()> {
    let host = if settings.forum_host.is_configured() {
        match create_client("forum host", &settings.forum_host, settings.llm_timeout) {
            Ok(client) => Some(HostSpeaker::new(client)),
            Err(e) => {
                eprintln!("{} {e}", "forum host unavailable:".yellow());
                None
            }
        }
    } else {
        eprintln!("{}", "no forum host credentials, pure monitoring mode".yellow());
        None
    };

    let handle = start_forum(ForumConfig::from_settings(settings), host);
    println!("forum aggregator running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    handle.stop().await;
    Ok(())
}

async fn cmd_status(settings: &Settings) -> Result<()> {
    let url = format!("http://{}:{}/api/status", settings.host, settings.port);
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .context(format!("Supervisor unreachable at {url}"))?;
    let body: serde_json::Value = response.json().await.context("Malformed status response")?;

    let system = &body["system"];
    let started = system["started"].as_bool().unwrap_or(false);
    let state = if started { "running".green() } else { "stopped".red() };
    println!("system: {state}");
    if let Some(engines) = system["engines"].as_object() {
        for (engine, running) in engines {
            let mark = if running.as_bool().unwrap_or(false) {
                "up".green()
            } else {
                "down".red()
            };
            println!("  {engine:<8} {mark}");
        }
    }
    if let Some(task) = body["task"].as_object() {
        println!(
            "task: {} ({}%, {})",
            task.get("task_id").and_then(|v| v.as_str()).unwrap_or("-"),
            task.get("progress").and_then(|v| v.as_u64()).unwrap_or(0),
            task.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
        );
    }
    Ok(())
}

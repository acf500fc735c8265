use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use modelrelay::app::{AppConfig, AppState, LoggingConfig};
use modelrelay::cli::{Cli, Commands};
use modelrelay::error::{Error, Result};
use modelrelay::models::GenerationRequest;
use modelrelay::platform::AppPaths;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (paths, config_path) = match &cli.config {
        Some(path) => {
            let path = PathBuf::from(path);
            let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
            (AppPaths::with_root(root), path)
        }
        None => {
            let paths = AppPaths::new()?;
            let file = paths.config_file();
            (paths, file)
        }
    };

    if let Commands::Init { force } = cli.command {
        return init_config(&config_path, force).await;
    }

    let config = AppConfig::load(&config_path)?;
    let _guard = init_logging(&config.logging, &paths, cli.debug)?;
    info!("Starting modelrelay {}", env!("CARGO_PKG_VERSION"));

    let state = AppState::new(config, config_path)?;

    match cli.command {
        Commands::Generate {
            prompt,
            system,
            provider,
            temperature,
            max_tokens,
            top_p,
            label,
            stream,
            json,
        } => {
            let mut request = GenerationRequest::new(prompt);
            if let Some(system) = system {
                request = request.with_system_prompt(system);
            }
            if let Some(label) = label {
                request = request.with_label(label);
            }
            if let Some(temperature) = temperature {
                request = request.with_temperature(temperature);
            }
            if let Some(max_tokens) = max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            if let Some(top_p) = top_p {
                request = request.with_top_p(top_p);
            }

            let result = if stream {
                stream_generation(&state, request, provider.as_deref(), json).await?
            } else {
                state.queue().send_request(request, provider.as_deref()).await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if !stream {
                println!("{}", result.text);
            }
            debug!(
                "Served by {} ({}), {} tokens",
                result.provider, result.model, result.usage.total_tokens
            );
        }
        Commands::Refine {
            original,
            response,
            spec,
            provider,
        } => {
            let refined = modelrelay::dispatch::refine_prompt(
                state.queue(),
                &original,
                &response,
                &spec,
                provider.as_deref(),
            )
            .await?;
            println!("{}", refined);
        }
        Commands::Providers { json } => {
            let statuses = state.provider_statuses();
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else if statuses.is_empty() {
                println!("No providers configured in {}", state.config_path().display());
            } else {
                let priority = state.queue().registry().priority().join(" > ");
                println!("Priority: {}", priority);
                for summary in statuses {
                    let marker = if summary.is_default { "*" } else { " " };
                    let mode = if summary.streaming { "stream" } else { "single" };
                    println!(
                        "{} {:<16} {:<10} {:<32} {:<7} {}",
                        marker, summary.name, summary.kind, summary.model, mode, summary.status
                    );
                }
            }
        }
        Commands::Init { .. } => {}
    }

    for (name, stats) in state.provider_stats() {
        debug!(
            "{}: {} ok, {} failed, {} rate limited",
            name, stats.successes, stats.failures, stats.rate_limit_hits
        );
    }

    Ok(())
}

/// Prints deltas as they arrive. When the executor moves to a new
/// (provider, attempt) the partial output so far is abandoned. Anything the
/// stream dropped is filled in from the terminal result.
async fn stream_generation(
    state: &AppState,
    request: GenerationRequest,
    provider: Option<&str>,
    quiet: bool,
) -> Result<modelrelay::models::GenerationResult> {
    let mut response = state.queue().send_streaming_request(request, provider).await?;
    let mut current: Option<(String, u32)> = None;
    let mut shown = String::new();
    let mut stdout = std::io::stdout();

    while let Some(chunk) = response.chunks.recv().await {
        let key = (chunk.provider.clone(), chunk.attempt);
        if current.as_ref() != Some(&key) {
            if current.is_some() && !quiet {
                println!();
                eprintln!("[restarting on {} attempt {}]", chunk.provider, chunk.attempt);
            }
            current = Some(key);
            shown.clear();
        }
        if !quiet {
            print!("{}", chunk.delta);
            stdout.flush()?;
        }
        shown.push_str(&chunk.delta);
    }

    let result = response.finish().await?;
    if !quiet {
        match result.text.strip_prefix(shown.as_str()) {
            Some(rest) => println!("{}", rest),
            None => {
                println!();
                eprintln!("[stream incomplete, full output follows]");
                println!("{}", result.text);
            }
        }
    }
    Ok(result)
}

async fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::validation(format!(
            "{} already exists, use --force to overwrite",
            path.display()
        )));
    }

    AppConfig::default().save(path).await?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn init_logging(
    logging: &LoggingConfig,
    paths: &AppPaths,
    debug: bool,
) -> Result<Option<WorkerGuard>> {
    let level = if debug { "debug" } else { logging.level.as_str() };
    let directive = format!("modelrelay={}", level)
        .parse()
        .map_err(|e| Error::validation(format!("Invalid log level '{}': {}", level, e)))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let (file_layer, guard) = if logging.log_to_file {
        paths.ensure_dirs_exist()?;
        let appender = tracing_appender::rolling::daily(paths.logs_dir(), "modelrelay.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::platform(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}

mod cli;

use mediaflow::app::{self, App};
use mediaflow::summary::{self, RunDigest};
use mf_av::{FfprobeExtractor, MetadataExtractor, ToolRegistry};
use mf_core::config::Config;
use mf_core::events::EventPayload;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mediaflow=trace,mf_pipeline=trace,mf_av=trace,mf_db=debug,mf_core=debug".to_string()
        } else {
            "mediaflow=info,mf_pipeline=info,mf_av=info,mf_db=warn,mf_core=info".to_string()
        }
    });

    // Logs go to stderr so `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            summary::EXIT_STARTUP
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            files,
            workers,
            json,
        } => run_files(files, cli.config.as_deref(), workers, json),
        Commands::Steps => print_steps(cli.config.as_deref()).map(|()| summary::EXIT_SUCCESS),
        Commands::Probe { file, json } => {
            probe_file(&file, cli.config.as_deref(), json).map(|()| summary::EXIT_SUCCESS)
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()).map(|()| summary::EXIT_SUCCESS),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref()).map(|()| summary::EXIT_SUCCESS)
        }
    }
}

fn run_files(
    files: Vec<PathBuf>,
    config_path: Option<&Path>,
    workers: Option<usize>,
    json: bool,
) -> Result<i32> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(workers) = workers {
        config.pipeline.workers = workers;
    }
    for warning in config.validate() {
        tracing::warn!("{warning}");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        // Registry errors surface here, before any file is touched.
        let app = App::from_config(&config)?;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; cancelling remaining steps");
                trigger.cancel();
            }
        });

        let mut events = app.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match event.payload {
                        EventPayload::RunStarted { file_id, path } => {
                            tracing::info!(file_id = %file_id, path = %path, "File started");
                        }
                        EventPayload::RunFinished { file_id, status } => {
                            tracing::info!(file_id = %file_id, status = %status, "File finished");
                        }
                        _ => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tracing::info!(files = files.len(), "Starting ingest");
        let runs = app.coordinator.run_all(files, &cancel).await;

        if json {
            let digests: Vec<RunDigest<'_>> = runs.iter().map(RunDigest::new).collect();
            println!("{}", serde_json::to_string_pretty(&digests)?);
        } else {
            print!("{}", summary::render(&runs));
        }

        Ok::<_, anyhow::Error>(summary::exit_code(&runs))
    })
}

fn print_steps(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let tools = Arc::new(ToolRegistry::discover(&config.tools));
    let services = app::build_services(&config, &tools, mf_db::init_memory_pool()?)?;
    let order = app::build_order(&config, services)?;

    println!("Execution order:\n");
    for (i, planned) in order.steps().iter().enumerate() {
        let def = &planned.def;
        print!("{:>2}. {:<10}", i + 1, def.name());
        if !def.enabled() {
            print!(" [disabled]");
        }
        if let Some(tag) = def.concurrency_tag() {
            let capacity = config
                .pipeline
                .concurrency
                .get(tag)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unlimited".into());
            print!(" tag={tag}({capacity})");
        }
        if def.critical() {
            print!(" critical");
        }
        if def.retryable() {
            print!(" retryable");
        }
        if let Some(timeout) = def.timeout() {
            print!(" timeout={}s", timeout.as_secs());
        }
        if !def.depends_on().is_empty() {
            print!(" after: {}", def.depends_on().join(", "));
        }
        println!();
    }

    Ok(())
}

fn probe_file(file: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let config = Config::load_or_default(config_path)?;
    let tools = Arc::new(ToolRegistry::discover(&config.tools));
    let extractor = FfprobeExtractor::from_registry(&tools)?;

    let rt = tokio::runtime::Runtime::new()?;
    let meta = rt.block_on(extractor.extract(file))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    println!("Container: {}", meta.container);
    if let Some(size) = meta.size_bytes {
        println!("Size: {} bytes", size);
    }
    if let Some(duration) = meta.duration_secs {
        let secs = duration as u64;
        let mins = secs / 60;
        let hours = mins / 60;
        println!("Duration: {:02}:{:02}:{:02}", hours, mins % 60, secs % 60);
    }
    if let Some(ref codec) = meta.video_codec {
        print!("Video: {codec}");
        if let (Some(w), Some(h)) = (meta.width, meta.height) {
            print!(" {w}x{h}");
        }
        if let Some(fps) = meta.frame_rate {
            print!(" {fps:.3} fps");
        }
        println!();
    }
    if let Some(ref codec) = meta.audio_codec {
        println!("Audio: {codec}");
    }
    if meta.camera_make.is_some() || meta.camera_model.is_some() {
        println!(
            "Camera: {} {}",
            meta.camera_make.as_deref().unwrap_or(""),
            meta.camera_model.as_deref().unwrap_or("")
        );
    }
    if let Some(ref created) = meta.creation_time {
        println!("Created: {created}");
    }

    println!("\nTracks: {}", meta.tracks.len());
    for track in &meta.tracks {
        print!("  [{}] {}", track.index, track.kind);
        if let Some(ref codec) = track.codec {
            print!(" {codec}");
        }
        if let Some(ref lang) = track.language {
            print!(" ({lang})");
        }
        println!();
    }

    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in &tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        let rt = tokio::runtime::Runtime::new()?;
        let encoder = rt.block_on(tools.video_encoder(config.transcode.hw_accel.as_deref()));
        println!("Video encoder: {}", encoder.codec_name());
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable all features.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            if !p.exists() {
                anyhow::bail!("Config file does not exist: {:?}", p);
            }
            let config = Config::load_or_default(Some(p))?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Workers: {}", config.pipeline.workers);
    println!("  Concurrency:");
    for (tag, capacity) in &config.pipeline.concurrency {
        println!("    {tag}: {capacity}");
    }
    println!(
        "  Retry: {} retries, {}ms base, {}ms max",
        config.pipeline.retry.max_retries,
        config.pipeline.retry.base_delay_ms,
        config.pipeline.retry.max_delay_ms
    );
    println!("  Step overrides: {}", config.pipeline.steps.len());
    println!(
        "  Transcode: {}x{} @ {} fps",
        config.transcode.width, config.transcode.height, config.transcode.fps
    );
    println!(
        "  Analysis endpoint: {}",
        config.analysis.endpoint.as_deref().unwrap_or("(none)")
    );
    println!("  Database: {}", config.storage.db_path.display());

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &warnings {
            println!("  - {warning}");
        }
    }

    Ok(())
}

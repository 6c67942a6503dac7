use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, debug, info, warn};

use sizepress::cli::{Cli, Commands, CompressArgs};
use sizepress::config::Config;
use sizepress::engine::probe::probe_media;
use sizepress::engine::{
    Capabilities, JobStatus, Orchestrator, ProgressEvent, ValidationCache, estimate, tool_version,
    usable_encoders,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => {
            // init-config reports on the file itself
            if !matches!(cli.command, Commands::InitConfig) {
                if let Err(e) = Config::ensure_default() {
                    eprintln!("Warning: could not write default config: {:#}", e);
                }
            }
            Config::load()?
        }
    };

    init_logging(cli.verbose, &config.log_level);

    match cli.command {
        Commands::CheckFfmpeg => check_ffmpeg(&config),
        Commands::HwInfo { skip_validation } => hw_info(&config, skip_validation),
        Commands::Probe { file } => probe(&config, &file),
        Commands::Estimate {
            target_mb,
            duration,
            input,
            audio_kbps,
        } => {
            let duration = match (duration, input) {
                (Some(d), _) => d,
                (None, Some(path)) => probe_media(&config.tools.ffprobe, &path)?.duration_s,
                (None, None) => anyhow::bail!("either --duration or --input is required"),
            };
            let budget = estimate(target_mb, duration, audio_kbps)?;
            print_json(&budget)
        }
        Commands::Compress(args) => compress(&config, &args),
        Commands::InitConfig => init_config(),
    }
}

/// Logs go to stderr so stdout stays machine-readable
fn init_logging(verbose: u8, configured: &str) {
    let level = match verbose {
        0 => Level::from_str(configured).unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

fn check_ffmpeg(config: &Config) -> Result<()> {
    println!("Checking for ffmpeg...");
    let ffmpeg = tool_version(&config.tools.ffmpeg)?;
    println!("✓ ffmpeg found: {}", ffmpeg);

    println!("Checking for ffprobe...");
    let ffprobe = tool_version(&config.tools.ffprobe)?;
    println!("✓ ffprobe found: {}", ffprobe);
    Ok(())
}

/// Detect the host and, unless skipped, validate its encoders. Fresh
/// in-process results are persisted for later runs when caching is on.
fn capabilities(config: &Config, skip_validation: bool) -> Capabilities {
    let detect = config.detect_options();
    if skip_validation {
        return Capabilities::probe_host(&detect, None);
    }

    let caps = Capabilities::probe_host(&detect, Some(&config.validate_options()));
    if config.cache.validation_cache {
        if let Some(cache) = &caps.validation {
            let saved = ValidationCache::cache_path().and_then(|path| cache.save(&path));
            if let Err(e) = saved {
                warn!(error = %format!("{:#}", e), "could not persist validation results");
            }
        }
    }
    caps
}

fn hw_info(config: &Config, skip_validation: bool) -> Result<()> {
    let caps = capabilities(config, skip_validation);

    let (validation, source) = match &caps.validation {
        Some(cache) => (Some(cache.clone()), "fresh"),
        None if config.cache.validation_cache => {
            let cached = ValidationCache::cache_path()
                .ok()
                .and_then(|p| ValidationCache::load_fresh(&p, config.cache.validation_ttl_hours));
            let source = if cached.is_some() { "cached" } else { "skipped" };
            (cached, source)
        }
        None => (None, "skipped"),
    };

    let usable: BTreeMap<String, Vec<String>> = usable_encoders(&caps.profile, caps.validation.as_ref())
        .into_iter()
        .map(|(codec, encoders)| {
            (
                codec.as_str().to_string(),
                encoders.iter().map(|e| e.to_string()).collect(),
            )
        })
        .collect();

    info!("{}", caps.profile.summary());
    print_json(&json!({
        "profile": caps.profile,
        "usable_encoders": usable,
        "validation_source": source,
        "validation": validation,
    }))
}

fn probe(config: &Config, file: &Path) -> Result<()> {
    let info = probe_media(&config.tools.ffprobe, file)
        .with_context(|| format!("Failed to probe {}", file.display()))?;
    print_json(&info)
}

fn compress(config: &Config, args: &CompressArgs) -> Result<()> {
    let request = args.apply(config.request_for(&args.input));
    let caps = Arc::new(capabilities(config, args.skip_validation));
    let orchestrator = Orchestrator::new(caps, config.orchestrator_settings());

    if args.dry_run {
        let prepared = orchestrator.prepare(&request)?;
        for notice in &prepared.notices {
            eprintln!("{}", notice);
        }
        println!("{}", prepared.command.display());
        return Ok(());
    }

    let id = orchestrator.submit(request);
    let events = orchestrator.subscribe(id)?;

    // One JSON object per line; the stream ends after the terminal event
    let mut out = io::stdout().lock();
    for event in events {
        write_event(&mut out, &event)?;
    }

    let job = orchestrator.wait(id)?;
    debug!(job_id = %id, status = %job.status, "job finished");
    match job.status {
        JobStatus::Completed => Ok(()),
        JobStatus::Cancelled => anyhow::bail!("job {} was cancelled", id),
        status => anyhow::bail!(
            "job {} ended {}: {}",
            id,
            status,
            job.last_error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

fn write_event(out: &mut impl Write, event: &ProgressEvent) -> Result<()> {
    serde_json::to_writer(&mut *out, event).context("Failed to write event")?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn init_config() -> Result<()> {
    let config_path = Config::config_path()?;

    if Config::exists() {
        println!("Config file: {}", config_path.display());
        println!("Status: exists");
    } else {
        Config::default().save()?;
        println!("Created default config: {}", config_path.display());
    }
    Ok(())
}

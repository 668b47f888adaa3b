//! Application entry point for panauricon.
//!
//! # Startup sequence
//!
//! 1. Parse the command line.
//! 2. Load [`AppConfig`] from `--config` or the platform path (returns the
//!    defaults on first run).
//! 3. Initialise logging from the CLI flags and the `logging` section.
//! 4. Create the [`tokio`] runtime (multi-thread, 2 workers).
//! 5. Dispatch the subcommand.  `record` and `play` run their pipeline on
//!    the blocking pool while a Ctrl+C watcher flips the cancel token.

mod cli;

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{Local, Utc};
use clap::Parser;

use panauricon::audio::{AudioHost, CpalHost, Direction};
use panauricon::config::{AppConfig, AppPaths};
use panauricon::pipeline::{CancelToken, Capture, CaptureSettings, Playback, PlaybackSettings};
use panauricon::storage::{purge, IndexStore, Segment};

use cli::{Args, Command};

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 1-2. Configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| AppPaths::new().settings_file);
    let config = AppConfig::load_from(&config_path)
        .with_context(|| format!("failed to load settings from {}", config_path.display()))?;

    // 3. Logging
    cli::init_logging(
        args.log_level(config.logging.level_filter()),
        config.logging.file.as_deref(),
    )?;
    log::debug!("panauricon {} starting up", env!("CARGO_PKG_VERSION"));

    // 4. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    // 5. Dispatch
    rt.block_on(run(args.command, config, &config_path))
}

async fn run(command: Command, config: AppConfig, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Command::Devices => list_devices(),
        Command::Config {
            input,
            output,
            sample_rate,
            show,
        } => configure(config, config_path, input, output, sample_rate, show),
        Command::Record => record(config).await,
        Command::Play { from, ago } => {
            let from = match (from, ago) {
                (Some(from), _) => from,
                (None, Some(ago)) => cli::start_before(Utc::now(), ago)?,
                (None, None) => bail!("play needs --from or --ago"),
            };
            play(config, from).await
        }
        Command::Segments { from, compact } => list_segments(&config, from, compact),
        Command::Purge { yes } => purge_all(&config, yes),
    }
}

/// Cancel token that fires on Ctrl+C.
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, stopping");
            token.cancel();
        }
    });
    cancel
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn list_devices() -> anyhow::Result<()> {
    let devices = CpalHost::new()
        .devices()
        .context("failed to enumerate audio devices")?;
    if devices.is_empty() {
        println!("no audio devices found");
    }
    for device in devices {
        println!("{device}");
    }
    Ok(())
}

fn configure(
    mut config: AppConfig,
    config_path: &Path,
    input: Option<String>,
    output: Option<String>,
    sample_rate: Option<u32>,
    show: bool,
) -> anyhow::Result<()> {
    let interactive = input.is_none() && output.is_none() && sample_rate.is_none() && !show;
    let changed = interactive || input.is_some() || output.is_some() || sample_rate.is_some();

    if interactive {
        config.audio.input_device = prompt_input_device()?;
    }
    if let Some(name) = input {
        config.audio.input_device = Some(name);
    }
    if let Some(name) = output {
        config.audio.output_device = Some(name);
    }
    if let Some(rate) = sample_rate {
        config.audio.sample_rate = Some(rate);
    }

    if show {
        print!("{}", toml::to_string_pretty(&config)?);
    }
    if changed {
        config.validate()?;
        config
            .save_to(config_path)
            .with_context(|| format!("failed to save settings to {}", config_path.display()))?;
        log::info!("config: saved {}", config_path.display());
    }
    Ok(())
}

/// List input devices and ask for one; an empty answer selects the host
/// default.
fn prompt_input_device() -> anyhow::Result<Option<String>> {
    let inputs: Vec<_> = CpalHost::new()
        .devices()?
        .into_iter()
        .filter(|d| d.direction == Direction::Input)
        .collect();
    for (n, device) in inputs.iter().enumerate() {
        println!(
            "[{n}] {} ({}, {} Hz, {} ch)",
            device.name, device.host, device.default_sample_rate, device.channels
        );
    }
    print!("input device number (empty for the default): ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim();
    if answer.is_empty() {
        return Ok(None);
    }
    let n: usize = answer
        .parse()
        .with_context(|| format!("`{answer}` is not a device number"))?;
    match inputs.into_iter().nth(n) {
        Some(device) => Ok(Some(device.name)),
        None => bail!("no input device number {n}"),
    }
}

async fn record(config: AppConfig) -> anyhow::Result<()> {
    let index = IndexStore::open(config.index_file()).context("failed to open the index")?;
    let settings = CaptureSettings::from_config(&config);
    let cancel = cancel_on_interrupt();

    let report = tokio::task::spawn_blocking(move || {
        let host = CpalHost::new();
        Capture::new(&host, index, settings).run(&cancel)
    })
    .await
    .context("capture worker panicked")??;

    println!(
        "recorded {} segment(s), {} block(s) dropped",
        report.segments, report.dropped_blocks
    );
    Ok(())
}

async fn play(config: AppConfig, from: chrono::DateTime<Utc>) -> anyhow::Result<()> {
    let index = IndexStore::open(config.index_file()).context("failed to open the index")?;
    let settings = PlaybackSettings::from_config(&config);
    let cancel = cancel_on_interrupt();

    let report = tokio::task::spawn_blocking(move || {
        let host = CpalHost::new();
        Playback::new(&host, index, settings).run(from, &cancel)
    })
    .await
    .context("playback worker panicked")??;

    println!("played {} segment(s), skipped {}", report.played, report.skipped);
    Ok(())
}

fn list_segments(
    config: &AppConfig,
    from: Option<chrono::DateTime<Utc>>,
    compact: bool,
) -> anyhow::Result<()> {
    let index = IndexStore::open(config.index_file()).context("failed to open the index")?;
    if compact {
        index.compact()?;
    }
    let segments = match from {
        Some(from) => index.query_from(from)?,
        None => index.all()?,
    };
    for segment in &segments {
        println!("{}", describe(segment));
    }
    println!("{} segment(s)", segments.len());
    Ok(())
}

fn describe(segment: &Segment) -> String {
    let length = match segment.end {
        Some(end) => format!("{:>8.1}s", (end - segment.start).num_milliseconds() as f64 / 1000.0),
        None => format!("{:>9}", "open"),
    };
    let status = format!("{:?}", segment.status).to_lowercase();
    format!(
        "{}  {length}  {status:<8}  {}",
        segment.start.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f"),
        segment.file_path().display()
    )
}

fn purge_all(config: &AppConfig, yes: bool) -> anyhow::Result<()> {
    if !yes {
        bail!("purge deletes every recording; pass --yes to confirm");
    }
    let report = purge(&config.index_file(), &config.recordings_dir())?;
    println!(
        "removed {} file(s) ({} already missing)",
        report.files_removed, report.files_missing
    );
    Ok(())
}

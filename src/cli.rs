//! Command-line interface for panauricon.
//!
//! Handles argument parsing, time arguments and logging configuration.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use log::LevelFilter;

/// Panauricon - continuous audio recorder with time-indexed playback
#[derive(Parser, Debug)]
#[command(name = "panauricon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file to use instead of the platform default
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List input and output devices of every audio host
    Devices,

    /// Update and persist settings
    Config {
        /// Input device name
        #[arg(long)]
        input: Option<String>,
        /// Output device name
        #[arg(long)]
        output: Option<String>,
        /// Capture sample rate in Hz
        #[arg(long, value_name = "HZ")]
        sample_rate: Option<u32>,
        /// Print the resulting settings
        #[arg(long)]
        show: bool,
    },

    /// Record until interrupted (Ctrl+C)
    Record,

    /// Play recordings starting at a point in time
    #[command(group(ArgGroup::new("start").required(true).args(["from", "ago"])))]
    Play {
        /// RFC 3339 timestamp or local `YYYY-MM-DD HH:MM:SS`
        #[arg(long, value_name = "TIME", value_parser = parse_time)]
        from: Option<DateTime<Utc>>,
        /// How far back to start, e.g. `90s`, `15m`, `2h`, `1d`
        #[arg(long, value_name = "DURATION", value_parser = parse_ago)]
        ago: Option<Duration>,
    },

    /// List indexed segments
    Segments {
        /// Only segments starting at or after TIME
        #[arg(long, value_name = "TIME", value_parser = parse_time)]
        from: Option<DateTime<Utc>>,
        /// Rewrite the index to one record per live segment first
        #[arg(long)]
        compact: bool,
    },

    /// Delete every recording and the index
    Purge {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

impl Args {
    /// Log level for this crate: `configured` shifted by `-v`, or `Error`
    /// with `-q`.
    pub fn log_level(&self, configured: LevelFilter) -> LevelFilter {
        const LEVELS: [LevelFilter; 6] = [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ];
        if self.quiet {
            return LevelFilter::Error;
        }
        let base = LEVELS.iter().position(|l| *l == configured).unwrap_or(3);
        LEVELS[(base + self.verbose as usize).min(LEVELS.len() - 1)]
    }
}

/// Initialize the logging system.
///
/// Dependencies stay at `warn`; `RUST_LOG` still overrides both.  With a
/// `file`, records are appended there instead of stderr.
pub fn init_logging(level: LevelFilter, file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("panauricon", level);
    builder.parse_default_env();

    if let Some(path) = file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .format_timestamp_millis()
        .try_init()
        .context("logger already initialised")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Time arguments
// ---------------------------------------------------------------------------

/// Parse an RFC 3339 timestamp, or `YYYY-MM-DD HH:MM:SS` in local time.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map_err(|_| {
        format!("`{s}` is neither RFC 3339 nor `YYYY-MM-DD HH:MM:SS`")
    })?;
    // An ambiguous local time (DST fold) resolves to its first occurrence.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| format!("`{s}` does not exist in the local time zone"))
}

/// Parse `<n>[s|m|h|d]`; a bare number means seconds.
pub fn parse_ago(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: i64 = digits
        .parse()
        .map_err(|_| format!("`{s}` must start with a whole number"))?;
    let seconds = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        other => return Err(format!("unknown unit `{other}`; use s, m, h or d")),
    };
    n.checked_mul(seconds)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| format!("`{s}` is too large"))
}

/// `now - ago`, failing instead of overflowing the calendar range.
pub fn start_before(now: DateTime<Utc>, ago: Duration) -> anyhow::Result<DateTime<Utc>> {
    now.checked_sub_signed(ago).with_context(|| {
        format!("--ago {}s reaches past the supported date range", ago.num_seconds())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["panauricon"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn verbosity_shifts_configured_level() {
        assert_eq!(args(&["record"]).log_level(LevelFilter::Info), LevelFilter::Info);
        assert_eq!(args(&["-v", "record"]).log_level(LevelFilter::Info), LevelFilter::Debug);
        assert_eq!(args(&["-vvvv", "record"]).log_level(LevelFilter::Warn), LevelFilter::Trace);
        assert_eq!(args(&["-q", "record"]).log_level(LevelFilter::Debug), LevelFilter::Error);
    }

    #[test]
    fn play_requires_exactly_one_start() {
        assert!(Args::try_parse_from(["panauricon", "play"]).is_err());
        assert!(Args::try_parse_from([
            "panauricon",
            "play",
            "--ago",
            "5m",
            "--from",
            "2024-05-17T13:00:00Z"
        ])
        .is_err());
        match args(&["play", "--ago", "5m"]).command {
            Command::Play { from, ago } => {
                assert_eq!(from, None);
                assert_eq!(ago, Some(Duration::minutes(5)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let a = args(&["segments", "--config", "/tmp/x.toml"]);
        assert_eq!(a.config, Some(PathBuf::from("/tmp/x.toml")));
    }

    #[test]
    fn parses_rfc3339_with_offset() {
        let ts = parse_time("2024-05-17T15:00:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 17, 13, 0, 0).unwrap());
    }

    #[test]
    fn parses_local_wall_clock_time() {
        let ts = parse_time("2024-01-15 08:30:00").unwrap();
        let local = ts.with_timezone(&Local).naive_local();
        assert_eq!(local.to_string(), "2024-01-15 08:30:00");
    }

    #[test]
    fn rejects_garbage_time() {
        assert!(parse_time("yesterday").is_err());
        assert!(parse_time("2024-13-01 00:00:00").is_err());
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_ago("90").unwrap(), Duration::seconds(90));
        assert_eq!(parse_ago("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_ago("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_ago("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_ago("1d").unwrap(), Duration::days(1));
    }

    #[test]
    fn huge_ago_is_an_error_not_a_panic() {
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 13, 0, 0).unwrap();
        let ago = parse_ago("100000000d").unwrap();
        assert!(start_before(now, ago).is_err());
        assert_eq!(
            start_before(now, Duration::minutes(5)).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 17, 12, 55, 0).unwrap()
        );
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_ago("m").is_err());
        assert!(parse_ago("5w").is_err());
        assert!(parse_ago("-5m").is_err());
        assert!(parse_ago("99999999999999999999d").is_err());
    }
}

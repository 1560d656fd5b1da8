//! equeue - border queue statistics engine
//!
//! The entry point for the CLI, handling:
//! - Ingestion of scraper observations (single or JSONL replay)
//! - Series, waiting-time and activity queries
//! - Compaction, retention and storage accounting
//! - Integrity verification

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, IsTerminal};
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use eq_common::error::format_error_human;
use eq_common::{Aggregation, OutputFormat, RawObservation, Resolution, SCHEMA_VERSION};
use eq_config::{load_config, ResolvedConfig};
use eq_core::exit_codes::ExitCode;
use eq_core::logging::{generate_run_id, init_logging, LogConfig, LogLevel};
use eq_core::timerange::{parse_instant, resolve_range};
use eq_core::CliError;
use eq_store::{
    FixedThroughput, HourlyThroughput, QueryOptions, QueueStore, SeriesPoint, StoreError,
    ThroughputModel,
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// equeue - storage and statistics for border-crossing queue observations
#[derive(Parser)]
#[command(name = "equeue")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Data directory (open log, segments, metadata)
    #[arg(long, global = true, env = "EQUEUE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path to engine.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Query deadline in milliseconds; 0 disables it
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Append one observation, or a failed fetch with --failed
    Ingest(IngestArgs),

    /// Replay a JSONL file of raw observations ('-' for stdin)
    IngestJsonl(IngestJsonlArgs),

    /// Bucketed queue-length series
    Series(SeriesArgs),

    /// Waiting-time distribution under a throughput model
    Wait(WaitArgs),

    /// Regimes, changes, longest run and gaps over a range
    Activity(ActivityArgs),

    /// Storage footprint per tier
    Footprint(FootprintArgs),

    /// Compact every sealed raw segment
    Compact,

    /// Apply the retention policy
    Retain(RetainArgs),

    /// Re-scan the data directory and compare it with the ledger
    Verify,

    /// Configuration management
    Config(ConfigArgs),
}

// ============================================================================
// Command argument structs
// ============================================================================

#[derive(Args, Debug)]
struct IngestArgs {
    /// Observation time (RFC 3339); defaults to now
    #[arg(long)]
    ts: Option<String>,

    /// Vehicles in the queue
    #[arg(long, allow_negative_numbers = true, required_unless_present = "failed")]
    length: Option<i64>,

    /// Open lanes, when known
    #[arg(long, allow_negative_numbers = true)]
    lanes: Option<i64>,

    /// Status code of the fetch
    #[arg(long)]
    status: Option<u16>,

    /// Record a failed fetch instead of a sample
    #[arg(long, conflicts_with = "length")]
    failed: bool,
}

#[derive(Args, Debug)]
struct IngestJsonlArgs {
    /// Input file, or '-' for stdin
    input: String,
}

#[derive(Args, Debug)]
struct RangeArgs {
    /// Range start (RFC 3339 or 'now')
    #[arg(long)]
    from: Option<String>,

    /// Range end (RFC 3339 or 'now'); defaults to now
    #[arg(long)]
    to: Option<String>,

    /// Lookback ending at --to, e.g. 24h or 7d; 'auto' picks one from the resolution
    #[arg(long, conflicts_with = "from")]
    range: Option<String>,
}

#[derive(Args, Debug)]
struct SeriesArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Bucket width: 5min, h, d, or <n>s/m/h/d
    #[arg(long, default_value = "h")]
    resolution: String,

    /// Aggregation inside a bucket; defaults to the configured one
    #[arg(long, value_enum)]
    agg: Option<Aggregation>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct ModelArgs {
    /// Constant processing rate
    #[arg(long)]
    vehicles_per_hour: Option<f64>,

    /// JSON file with 24 hourly processing rates (UTC hours)
    #[arg(long)]
    hourly_profile: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct WaitArgs {
    #[command(flatten)]
    range: RangeArgs,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct ActivityArgs {
    #[command(flatten)]
    range: RangeArgs,
}

#[derive(Args, Debug)]
struct FootprintArgs {
    /// Include the per-segment listing
    #[arg(long)]
    detailed: bool,
}

#[derive(Args, Debug)]
struct RetainArgs {
    /// Report what would change without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Evaluate the policy as of this instant (RFC 3339); defaults to now
    #[arg(long)]
    now: Option<String>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the resolved configuration and where it came from
    Show,
}

// ============================================================================
// Main entry point
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => None,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    init_logging(&LogConfig::from_env(cli_level, None));

    let run_id = generate_run_id();
    let exit_code = {
        let span = tracing::info_span!("equeue", run_id = %run_id);
        let _entered = span.enter();
        match run(&cli, &run_id) {
            Ok(code) => code,
            Err(err) => output_error(&cli.global, &run_id, &err),
        }
    };

    std::process::exit(exit_code.as_i32());
}

/// Shared state for one invocation.
struct Ctx<'a> {
    global: &'a GlobalOpts,
    run_id: &'a str,
    resolved: ResolvedConfig,
}

impl Ctx<'_> {
    fn data_dir(&self) -> PathBuf {
        self.global
            .data_dir
            .clone()
            .unwrap_or_else(eq_config::resolve::default_data_dir)
    }

    /// Open the store. Only ingestion runs the background compactor; the
    /// other commands leave sealed segments for `compact` or the next ingest.
    fn open_store(&self, background: bool) -> Result<QueueStore, CliError> {
        let mut config = self.resolved.config.clone();
        config.compaction.auto_compact &= background;
        let dir = self.data_dir();
        let (store, report) = QueueStore::open(&dir, &config)?;
        if !report.is_clean() {
            warn!(
                quarantined = report.quarantined.len(),
                superseded_removed = report.superseded_removed.len(),
                skipped_sealed_entries = report.skipped_sealed_entries,
                log_defect = ?report.log_defect,
                log_discarded_bytes = report.log_discarded_bytes,
                "data directory needed recovery"
            );
        }
        Ok(store)
    }

    fn query_options(&self) -> QueryOptions {
        let millis = self
            .global
            .timeout
            .unwrap_or(self.resolved.config.query.timeout_ms);
        if millis == 0 {
            QueryOptions::default()
        } else {
            QueryOptions::default().with_timeout(StdDuration::from_millis(millis))
        }
    }

    fn range(&self, args: &RangeArgs, default_lookback: Duration) -> Result<(chrono::DateTime<Utc>, chrono::DateTime<Utc>), CliError> {
        Ok(resolve_range(
            args.from.as_deref(),
            args.to.as_deref(),
            args.range.as_deref(),
            default_lookback,
            Utc::now(),
        )?)
    }
}

fn run(cli: &Cli, run_id: &str) -> Result<ExitCode, CliError> {
    let resolved = load_config(cli.global.config.as_deref())?;
    debug!(source = %resolved.source, path = ?resolved.path, "configuration loaded");
    let ctx = Ctx {
        global: &cli.global,
        run_id,
        resolved,
    };

    match &cli.command {
        Commands::Ingest(args) => run_ingest(&ctx, args),
        Commands::IngestJsonl(args) => run_ingest_jsonl(&ctx, args),
        Commands::Series(args) => run_series(&ctx, args),
        Commands::Wait(args) => run_wait(&ctx, args),
        Commands::Activity(args) => run_activity(&ctx, args),
        Commands::Footprint(args) => run_footprint(&ctx, args),
        Commands::Compact => run_compact(&ctx),
        Commands::Retain(args) => run_retain(&ctx, args),
        Commands::Verify => run_verify(&ctx),
        Commands::Config(args) => match args.command {
            ConfigCommands::Show => run_config_show(&ctx),
        },
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_version: &'static str,
    run_id: &'a str,
    generated_at: String,
    command: &'a str,
    result: &'a T,
}

/// Print a command payload to stdout in the selected format.
fn emit<T: Serialize>(
    ctx: &Ctx,
    command: &str,
    result: &T,
    summary: impl FnOnce() -> String,
    markdown: impl FnOnce() -> String,
) -> Result<(), CliError> {
    let envelope = Envelope {
        schema_version: SCHEMA_VERSION,
        run_id: ctx.run_id,
        generated_at: Utc::now().to_rfc3339(),
        command,
        result,
    };
    match ctx.global.format {
        OutputFormat::Json => {
            let text = serde_json::to_string_pretty(&envelope).map_err(StoreError::from)?;
            println!("{}", text);
        }
        OutputFormat::Jsonl => {
            let text = serde_json::to_string(&envelope).map_err(StoreError::from)?;
            println!("{}", text);
        }
        OutputFormat::Summary => println!("[{}] {}: {}", ctx.run_id, command, summary()),
        OutputFormat::Md => {
            println!("# equeue {}", command);
            println!();
            println!("{}", markdown());
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    schema_version: &'static str,
    run_id: &'a str,
    status: &'static str,
    exit_code: &'static str,
    error: eq_common::StructuredError,
}

fn output_error(global: &GlobalOpts, run_id: &str, err: &CliError) -> ExitCode {
    let exit_code = err.exit_code();
    match global.format {
        OutputFormat::Json | OutputFormat::Jsonl => {
            let envelope = ErrorEnvelope {
                schema_version: SCHEMA_VERSION,
                run_id,
                status: "error",
                exit_code: exit_code.code_name(),
                error: err.to_structured(),
            };
            let text = serde_json::to_string_pretty(&envelope)
                .unwrap_or_else(|_| envelope.error.to_json());
            eprintln!("{}", text);
        }
        OutputFormat::Summary => eprintln!("[{}] error: {}", run_id, err),
        OutputFormat::Md => {
            let use_color = std::io::stderr().is_terminal();
            eprintln!(
                "{}",
                format_error_human(err.headline(), &err.to_string(), err.remediation(), use_color)
            );
        }
    }
    exit_code
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.1}", v))
}

// ============================================================================
// Ingestion
// ============================================================================

fn run_ingest(ctx: &Ctx, args: &IngestArgs) -> Result<ExitCode, CliError> {
    let now = Utc::now();
    let timestamp = match &args.ts {
        Some(ts) => parse_instant(ts, now)?,
        None => now,
    };
    let mut raw = if args.failed {
        RawObservation::failed(timestamp)
    } else {
        RawObservation::sample(timestamp, args.length.unwrap_or_default())
    };
    raw.lane_count = args.lanes;
    raw.status_code = args.status;

    let store = ctx.open_store(true)?;
    let outcome = store.append(&raw)?;
    info!(outcome = outcome.name(), ts = %timestamp.to_rfc3339(), "observation ingested");

    emit(
        ctx,
        "ingest",
        &outcome,
        || format!("{} at {}", outcome.name(), timestamp.to_rfc3339()),
        || format!("Outcome: **{}**\n\nTimestamp: {}", outcome.name(), timestamp.to_rfc3339()),
    )?;
    Ok(ExitCode::Clean)
}

#[derive(Debug, Serialize)]
struct RejectedLine {
    line: usize,
    code: Option<u32>,
    message: String,
}

#[derive(Debug, Default, Serialize)]
struct JsonlReport {
    lines: usize,
    outcomes: BTreeMap<&'static str, u64>,
    rejected: Vec<RejectedLine>,
}

fn run_ingest_jsonl(ctx: &Ctx, args: &IngestJsonlArgs) -> Result<ExitCode, CliError> {
    let input_error = |source| CliError::Input {
        path: args.input.clone(),
        source,
    };
    let reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        Box::new(BufReader::new(
            std::fs::File::open(&args.input).map_err(input_error)?,
        ))
    };

    let store = ctx.open_store(true)?;
    let mut report = JsonlReport::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(input_error)?;
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        report.lines += 1;

        let raw: RawObservation = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(line = line_no, error = %e, "unparsable line skipped");
                report.rejected.push(RejectedLine {
                    line: line_no,
                    code: None,
                    message: e.to_string(),
                });
                continue;
            }
        };

        match store.append(&raw) {
            Ok(outcome) => *report.outcomes.entry(outcome.name()).or_default() += 1,
            Err(StoreError::Engine(e)) if ExitCode::from_engine_error(&e).is_user_error() => {
                warn!(line = line_no, error = %e, "observation rejected");
                report.rejected.push(RejectedLine {
                    line: line_no,
                    code: Some(e.code()),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        lines = report.lines,
        rejected = report.rejected.len(),
        "replay finished"
    );
    emit(
        ctx,
        "ingest-jsonl",
        &report,
        || {
            let stored: u64 = report.outcomes.values().sum();
            format!("{} lines, {} stored, {} rejected", report.lines, stored, report.rejected.len())
        },
        || {
            let mut out = String::from("| Outcome | Count |\n|---|---|\n");
            for (name, count) in &report.outcomes {
                out.push_str(&format!("| {} | {} |\n", name, count));
            }
            out.push_str(&format!("| rejected | {} |\n", report.rejected.len()));
            for rejected in &report.rejected {
                out.push_str(&format!("\n- line {}: {}", rejected.line, rejected.message));
            }
            out
        },
    )?;

    Ok(if report.rejected.is_empty() {
        ExitCode::Clean
    } else {
        ExitCode::Partial
    })
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Serialize)]
struct SeriesResult {
    from: chrono::DateTime<Utc>,
    to: chrono::DateTime<Utc>,
    resolution: String,
    aggregation: Aggregation,
    points: Vec<SeriesPoint>,
}

fn run_series(ctx: &Ctx, args: &SeriesArgs) -> Result<ExitCode, CliError> {
    let resolution = Resolution::parse(&args.resolution)?;
    let aggregation = args
        .agg
        .unwrap_or(ctx.resolved.config.query.default_aggregation);
    let (from, to) = ctx.range(&args.range, resolution.default_lookback())?;

    let store = ctx.open_store(false)?;
    let series = store.series(from, to, resolution, aggregation, ctx.query_options())?;

    // JSONL streams one point per line instead of one envelope.
    if ctx.global.format == OutputFormat::Jsonl {
        for point in series {
            let text = serde_json::to_string(&point?).map_err(StoreError::from)?;
            println!("{}", text);
        }
        return Ok(ExitCode::Clean);
    }

    let points = series.collect::<Result<Vec<_>, _>>()?;
    let result = SeriesResult {
        from,
        to,
        resolution: resolution.to_string(),
        aggregation,
        points,
    };
    emit(
        ctx,
        "series",
        &result,
        || {
            let values: Vec<f64> = result.points.iter().filter_map(|p| p.value).collect();
            let max = values.iter().copied().reduce(f64::max);
            format!(
                "{} buckets at {}, {} with data, max {}",
                result.points.len(),
                result.resolution,
                values.len(),
                fmt_opt(max)
            )
        },
        || {
            let mut out = format!(
                "{} to {} at {} ({})\n\n| Start | Value | Samples | Gaps |\n|---|---|---|---|\n",
                from.to_rfc3339(),
                to.to_rfc3339(),
                result.resolution,
                aggregation
            );
            for point in &result.points {
                out.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    point.start.to_rfc3339(),
                    fmt_opt(point.value),
                    point.samples,
                    point.gaps
                ));
            }
            out
        },
    )?;
    Ok(ExitCode::Clean)
}

fn run_wait(ctx: &Ctx, args: &WaitArgs) -> Result<ExitCode, CliError> {
    let model: Box<dyn ThroughputModel> = match (&args.model.vehicles_per_hour, &args.model.hourly_profile) {
        (Some(rate), _) => Box::new(FixedThroughput {
            vehicles_per_hour: *rate,
        }),
        (None, Some(path)) => {
            let json = std::fs::read_to_string(path).map_err(|source| CliError::Input {
                path: path.display().to_string(),
                source,
            })?;
            Box::new(HourlyThroughput::from_json(&json)?)
        }
        (None, None) => {
            return Err(eq_common::Error::Config(
                "pass --vehicles-per-hour or --hourly-profile".into(),
            )
            .into())
        }
    };
    let (from, to) = ctx.range(&args.range, Duration::days(1))?;

    let store = ctx.open_store(false)?;
    let summary = store.estimate_wait(from, to, model.as_ref(), ctx.query_options())?;
    emit(
        ctx,
        "wait",
        &summary,
        || {
            format!(
                "{} samples, avg {}s, p90 {}s",
                summary.samples,
                fmt_opt(summary.avg),
                fmt_opt(summary.p90)
            )
        },
        || {
            format!(
                "| Statistic | Seconds |\n|---|---|\n| min | {} |\n| avg | {} |\n| p50 | {} |\n| p90 | {} |\n| max | {} |\n\nSamples: {}",
                fmt_opt(summary.min),
                fmt_opt(summary.avg),
                fmt_opt(summary.p50),
                fmt_opt(summary.p90),
                fmt_opt(summary.max),
                summary.samples
            )
        },
    )?;
    Ok(ExitCode::Clean)
}

fn run_activity(ctx: &Ctx, args: &ActivityArgs) -> Result<ExitCode, CliError> {
    let (from, to) = ctx.range(&args.range, Duration::days(1))?;
    let store = ctx.open_store(false)?;
    let summary = store.activity_summary(from, to, ctx.query_options())?;
    emit(
        ctx,
        "activity",
        &summary,
        || {
            format!(
                "{} observations, {} changes, {} gaps in {} periods",
                summary.observations, summary.changes, summary.gap_count, summary.gap_periods
            )
        },
        || {
            let mut out = String::from("| Queue length | Observations |\n|---|---|\n");
            for (value, count) in &summary.regimes {
                out.push_str(&format!("| {} | {} |\n", value, count));
            }
            out.push_str(&format!("\nChanges: {}\n", summary.changes));
            if let Some(run) = &summary.longest_run {
                out.push_str(&format!(
                    "Longest run: {} for {} observations ({} to {})\n",
                    run.value,
                    run.observations,
                    run.start.to_rfc3339(),
                    run.end.to_rfc3339()
                ));
            }
            out.push_str(&format!(
                "Gaps: {} in {} periods, {}s without data\n",
                summary.gap_count, summary.gap_periods, summary.gap_total_secs
            ));
            out
        },
    )?;
    Ok(ExitCode::Clean)
}

// ============================================================================
// Maintenance
// ============================================================================

fn run_footprint(ctx: &Ctx, args: &FootprintArgs) -> Result<ExitCode, CliError> {
    let store = ctx.open_store(false)?;
    let footprint = if args.detailed {
        store.footprint_detailed()
    } else {
        store.footprint()
    };
    emit(
        ctx,
        "footprint",
        &footprint,
        || {
            format!(
                "{} bytes (raw {}, compacted {}, open {}, index {}), ratio {:.2}",
                footprint.total_bytes,
                footprint.raw_bytes,
                footprint.compacted_bytes,
                footprint.open_bytes,
                footprint.index_bytes,
                footprint.compaction_ratio
            )
        },
        || {
            let mut out = format!(
                "| Tier | Bytes | Records | Segments |\n|---|---|---|---|\n| raw | {} | {} | {} |\n| compacted | {} | {} | {} |\n| open | {} | {} | - |\n| index | {} | - | - |\n\nTotal: {} bytes, {} observations, compaction ratio {:.2}\n",
                footprint.raw_bytes,
                footprint.raw_records,
                footprint.raw_segments,
                footprint.compacted_bytes,
                footprint.compacted_records,
                footprint.compacted_segments,
                footprint.open_bytes,
                footprint.open_records,
                footprint.index_bytes,
                footprint.total_bytes,
                footprint.observations,
                footprint.compaction_ratio
            );
            if let Some(segments) = &footprint.segments {
                out.push_str("\n| Segment | Tier | Start | End | Records | Bytes |\n|---|---|---|---|---|---|\n");
                for s in segments {
                    out.push_str(&format!(
                        "| {} | {} | {} | {} | {} | {} |\n",
                        s.id,
                        s.tier,
                        s.start.to_rfc3339(),
                        s.end.to_rfc3339(),
                        s.records,
                        s.bytes
                    ));
                }
            }
            out
        },
    )?;
    Ok(ExitCode::Clean)
}

fn run_compact(ctx: &Ctx) -> Result<ExitCode, CliError> {
    let store = ctx.open_store(false)?;
    let summary = store.compact_pending()?;
    emit(
        ctx,
        "compact",
        &summary,
        || {
            format!(
                "{} segments, {} -> {} records, {} -> {} bytes",
                summary.segments,
                summary.records_before,
                summary.records_after,
                summary.bytes_before,
                summary.bytes_after
            )
        },
        || {
            format!(
                "Compacted {} segments.\n\n| | Before | After |\n|---|---|---|\n| records | {} | {} |\n| bytes | {} | {} |",
                summary.segments,
                summary.records_before,
                summary.records_after,
                summary.bytes_before,
                summary.bytes_after
            )
        },
    )?;
    Ok(ExitCode::Clean)
}

fn run_retain(ctx: &Ctx, args: &RetainArgs) -> Result<ExitCode, CliError> {
    let now = match &args.now {
        Some(at) => parse_instant(at, Utc::now())?,
        None => Utc::now(),
    };
    let policy = eq_store::RetentionPolicy::from_settings(&ctx.resolved.config.retention);
    let store = ctx.open_store(false)?;
    let report = if args.dry_run {
        store.preview_retention(&policy, now)?
    } else {
        store.enforce_retention(&policy, now)?
    };
    emit(
        ctx,
        "retain",
        &report,
        || {
            format!(
                "{}{} actions, {} bytes freed",
                if report.dry_run { "[DRY-RUN] " } else { "" },
                report.events.len(),
                report.bytes_freed()
            )
        },
        || {
            let mut out = String::new();
            if report.dry_run {
                out.push_str("**Dry run**: nothing was changed.\n\n");
            }
            out.push_str("| Action | Segment | Range | Records | Bytes |\n|---|---|---|---|---|\n");
            for e in &report.events {
                out.push_str(&format!(
                    "| {} | {} | {} to {} | {} -> {} | {} -> {} |\n",
                    e.action,
                    e.segment,
                    e.range_start.to_rfc3339(),
                    e.range_end.to_rfc3339(),
                    e.records_before,
                    e.records_after,
                    e.bytes_before,
                    e.bytes_after
                ));
            }
            out
        },
    )?;
    Ok(ExitCode::Clean)
}

fn run_verify(ctx: &Ctx) -> Result<ExitCode, CliError> {
    let store = ctx.open_store(false)?;
    let report = store.verify()?;
    emit(
        ctx,
        "verify",
        &report,
        || {
            if report.ok {
                format!("ok, {} segments checked", report.segments_checked)
            } else {
                format!(
                    "{} problems, {} ledger mismatches",
                    report.problems.len(),
                    report.mismatches.len()
                )
            }
        },
        || {
            let mut out = format!(
                "Status: **{}**\n\nSegments checked: {}\n",
                if report.ok { "ok" } else { "mismatch" },
                report.segments_checked
            );
            for p in &report.problems {
                out.push_str(&format!("\n- {}: {}", p.file, p.problem));
            }
            for m in &report.mismatches {
                out.push_str(&format!(
                    "\n- {}: ledger {} vs scan {}",
                    m.field, m.tracked, m.scanned
                ));
            }
            out
        },
    )?;
    Ok(if report.ok {
        ExitCode::Clean
    } else {
        ExitCode::VerifyMismatch
    })
}

#[derive(Serialize)]
struct ConfigShow<'a> {
    source: eq_config::ConfigSource,
    path: Option<String>,
    data_dir: String,
    config: &'a eq_config::EngineConfig,
}

fn run_config_show(ctx: &Ctx) -> Result<ExitCode, CliError> {
    let shown = ConfigShow {
        source: ctx.resolved.source,
        path: ctx.resolved.path.as_ref().map(|p| p.display().to_string()),
        data_dir: ctx.data_dir().display().to_string(),
        config: &ctx.resolved.config,
    };
    let origin = shown.path.clone().unwrap_or_else(|| "built-in defaults".to_string());
    emit(
        ctx,
        "config show",
        &shown,
        || format!("config from {} ({}), data in {}", origin, shown.source, shown.data_dir),
        || {
            let body = serde_json::to_string_pretty(shown.config).unwrap_or_default();
            format!(
                "Source: {} ({})\n\nData directory: {}\n\n```json\n{}\n```",
                origin, shown.source, shown.data_dir, body
            )
        },
    )?;
    Ok(ExitCode::Clean)
}

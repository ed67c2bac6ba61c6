use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use applink_lib::analysis::CaptureReport;
use applink_lib::{Analyzer, AnalyzerConfig, Capture, Validation};

/// Analyze a captured appliance link log: sessions, phases, and authentication findings.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Capture log, one `<device> <timestamp> - <hex bytes>` line per transmission.
    capture: PathBuf,
    /// JSON analyzer configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Print the full report as JSON instead of a summary.
    #[arg(long)]
    json: bool,
    /// Keep frames that fail checksum or CRC, flagged as unverified.
    #[arg(long)]
    lenient: bool,
    /// Idle gap in seconds that splits sessions; 0 disables splitting.
    #[arg(long)]
    idle_gap: Option<u64>,
    /// Response latency in seconds above which a response is reported as slow.
    #[arg(long)]
    slow_response: Option<u64>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => AnalyzerConfig::default(),
    };
    if cli.lenient {
        config.validation = Validation::Lenient;
    }
    if let Some(gap) = cli.idle_gap {
        config.session.idle_gap_secs = (gap > 0).then_some(gap);
    }
    if let Some(secs) = cli.slow_response {
        config.auth.slow_response_secs = secs;
    }
    config.validate()?;

    let file = File::open(&cli.capture).with_context(|| format!("Failed to open capture {:?}", cli.capture))?;
    let capture = Capture::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to read capture {:?}", cli.capture))?;
    info!("Read {} records from {:?}", capture.len(), cli.capture);

    let report = Analyzer::analyze(config, capture).report();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &CaptureReport) {
    let stats = &report.stats;
    println!(
        "{} records: {} frames, {} markers, {} unverified, {} skipped",
        stats.records,
        stats.frames,
        stats.markers,
        stats.unverified,
        stats.skipped_total()
    );
    for (reason, count) in &stats.skipped {
        println!("  skipped {}: {}", reason, count);
    }

    println!("\n{} sessions", report.sessions.len());
    for s in &report.sessions {
        println!(
            "  #{} {:?}..{:?} {}s, {} frames, {} distinct states{}",
            s.id,
            s.opened_by,
            s.closed_by,
            s.duration_secs,
            s.frame_count,
            s.distinct_states,
            if s.has_authentication { ", authenticated" } else { "" }
        );
    }

    println!(
        "\n{} challenge/response pairs, {} distinct challenges",
        report.pairs.len(),
        report.distinct_challenges
    );
    for pair in &report.pairs {
        println!(
            "  session {} challenge {} answered in {}s",
            pair.session,
            pair.challenge,
            pair.latency()
        );
    }

    if report.anomalies.is_empty() {
        println!("\nNo anomalies");
    } else {
        println!("\n{} anomalies", report.anomalies.len());
        for anomaly in &report.anomalies {
            println!("  {}", anomaly);
        }
    }

    if !report.transitions.is_empty() {
        println!("\nMost frequent transitions");
        for t in report.transitions.iter().take(10) {
            println!("  {} -> {}: {}", t.from, t.to, t.count);
        }
    }
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    // stdout carries the report
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }
    Ok(guard)
}
